//! Buffered RESP Request Writer
//!
//! Serializes commands into the RESP request form:
//!
//! ```text
//! *<argc>\r\n
//! $<len>\r\n<arg bytes>\r\n      (once per argument)
//! ```
//!
//! Bytes go into a bounded write buffer. When the buffer fills in the middle
//! of a token, the writer flushes what it has and carries on with the rest of
//! that same token, so a command larger than the buffer goes out as several
//! sends with nothing skipped or repeated at the seams.
//!
//! Several commands can be written back to back before a single `flush()`;
//! that is what makes pipelining cheap.

use crate::error::TransportError;
use crate::protocol::types::{prefix, CRLF};
use crate::transport::SendTransport;
use bytes::Bytes;
use tokio::io::AsyncWrite;
use tracing::trace;

/// Default write buffer size (16 KB)
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 16 * 1024;

/// Writes RESP request frames through a bounded buffer.
#[derive(Debug)]
pub struct FrameWriter<W> {
    transport: SendTransport<W>,
    buf: Vec<u8>,
    capacity: usize,
    flushed: u64,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Creates a writer with a `capacity`-byte buffer over `inner`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(inner: W, capacity: usize) -> Self {
        Self::from_transport(SendTransport::new(inner), capacity)
    }

    pub fn from_transport(transport: SendTransport<W>, capacity: usize) -> Self {
        assert!(capacity > 0, "send buffer capacity must be positive");
        Self {
            transport,
            buf: Vec::with_capacity(capacity),
            capacity,
            flushed: 0,
        }
    }

    /// Appends one complete request frame for `args`.
    ///
    /// May flush one or more times if the frame does not fit in the
    /// remaining buffer space.
    pub async fn write(&mut self, args: &[Bytes]) -> Result<(), TransportError> {
        self.put_header(prefix::MULTI_BULK, args.len()).await?;
        for arg in args {
            self.put_header(prefix::BULK, arg.len()).await?;
            self.put(arg).await?;
            self.put(CRLF).await?;
        }
        Ok(())
    }

    /// Pushes buffered bytes to the transport and empties the buffer.
    pub async fn flush(&mut self) -> Result<(), TransportError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.transport.send(&self.buf).await?;
        trace!(bytes = self.buf.len(), "Flushed write buffer");
        self.flushed += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }

    /// True if there are bytes written but not yet flushed.
    pub fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Number of bytes written but not yet flushed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes handed to the transport so far.
    pub fn bytes_flushed(&self) -> u64 {
        self.flushed
    }

    /// Shuts down the write direction of the socket.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.transport.shutdown().await
    }

    pub fn into_inner(self) -> W {
        self.transport.into_inner()
    }

    async fn put_header(&mut self, tag: u8, len: usize) -> Result<(), TransportError> {
        let mut digits = [0u8; 20];
        let text = encode_decimal(len, &mut digits);
        self.put(&[tag]).await?;
        self.put(text).await?;
        self.put(CRLF).await
    }

    /// Copies `data` into the buffer, flushing whenever it fills up.
    async fn put(&mut self, mut data: &[u8]) -> Result<(), TransportError> {
        while !data.is_empty() {
            let space = self.capacity - self.buf.len();
            if space == 0 {
                self.flush().await?;
                continue;
            }
            let take = space.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
        }
        Ok(())
    }
}

/// Formats `value` as ASCII decimal (no sign, no leading zeros) into the
/// tail of `out` and returns the used slice.
fn encode_decimal(mut value: usize, out: &mut [u8; 20]) -> &[u8] {
    let mut start = out.len();
    loop {
        start -= 1;
        out[start] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    &out[start..]
}
