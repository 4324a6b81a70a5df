//! Incremental RESP Reply Reader
//!
//! Reads one reply per `receive()` call from a socket, through a buffer
//! leased from the shared [`BufferPool`].
//!
//! ## How the Reader Works
//!
//! 1. Read the type byte (`+ - : $ *`), then the rest of the line up to CRLF.
//! 2. `+`, `-`, `:` are complete after the line.
//! 3. `$` reads exactly the declared number of bytes, then the CRLF.
//! 4. `*` pushes an open array onto the parse stack; the next `N` replies are
//!    folded into it by position.
//!
//! Whenever the buffer runs dry mid-reply (between the type byte and the
//! line, inside a bulk body, between array elements) the reader awaits more
//! bytes from the socket and resumes exactly where it stopped. The parse
//! stack is a local of the `receive()` call, so nothing about a half-parsed
//! reply survives into the next call.
//!
//! ## Buffer Lease
//!
//! The lease is taken on the first socket read and returned as soon as the
//! buffered bytes are fully consumed, so an idle connection holds no buffer.
//! On any fault the lease is returned immediately. The reader holds at most
//! one lease, and `receive()` takes `&mut self`, so two reads can never
//! share a buffer.

use crate::buffer::{BufferLease, BufferPool};
use crate::error::TransportError;
use crate::protocol::types::{prefix, Response};
use crate::transport::RecvTransport;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::trace;

/// Errors for bytes that are not a valid RESP2 reply.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// Unknown type prefix byte
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// Invalid integer format
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 in a status or error line
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Multi-bulk count is negative but not -1
    #[error("invalid multi-bulk count: {0}")]
    InvalidArrayLength(i64),

    /// A line or bulk body was not terminated by CRLF
    #[error("missing CRLF terminator")]
    MissingCrlf,

    /// A header or status line exceeded the line limit
    #[error("line too long (max: {max} bytes)")]
    LineTooLong { max: usize },

    /// The bulk length exceeds the maximum allowed size
    #[error("bulk too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Multi-bulk replies nested deeper than allowed
    #[error("maximum nesting depth exceeded: {max}")]
    NestingTooDeep { max: usize },
}

/// Maximum size for a single bulk reply (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum multi-bulk nesting depth
pub const MAX_NESTING_DEPTH: usize = 32;

/// Maximum length of a status, error or header line (64 KB)
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Element capacity reserved up front for a multi-bulk, whatever it declares.
const MAX_PREALLOCATED_ITEMS: usize = 1024;

/// Upper bound on bytes reserved for a bulk body before any of it arrives
const MAX_PREALLOCATED_BYTES: usize = 1024 * 1024;

/// A multi-bulk whose elements are still arriving.
struct OpenArray {
    items: Vec<Response>,
    expected: usize,
}

/// Parses RESP replies from a socket.
pub struct FrameReader<R> {
    transport: RecvTransport<R>,
    buffers: BufferPool,
    lease: Option<BufferLease>,
    /// Read cursor into the leased buffer
    pos: usize,
    /// Number of valid bytes in the leased buffer
    filled: usize,
    /// Payload of the current line, without the type byte and CRLF
    line: Vec<u8>,
    /// Total bytes pulled off the transport
    received: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, buffers: BufferPool) -> Self {
        Self::from_transport(RecvTransport::new(inner), buffers)
    }

    pub fn from_transport(transport: RecvTransport<R>, buffers: BufferPool) -> Self {
        Self {
            transport,
            buffers,
            lease: None,
            pos: 0,
            filled: 0,
            line: Vec::with_capacity(64),
            received: 0,
        }
    }

    /// Reads one complete reply.
    ///
    /// Any error leaves the stream at an unknown position; the caller must
    /// treat the connection as dead.
    pub async fn receive(&mut self) -> Result<Response, TransportError> {
        let result = self.parse_reply().await;
        if result.is_err() || self.pos == self.filled {
            self.release();
        }
        result
    }

    /// True while the reader holds a buffer lease.
    pub fn holds_lease(&self) -> bool {
        self.lease.is_some()
    }

    /// Total bytes read from the transport so far.
    pub fn bytes_received(&self) -> u64 {
        self.received
    }

    /// Number of bytes received but not yet parsed.
    pub fn buffered(&self) -> usize {
        self.filled - self.pos
    }

    fn release(&mut self) {
        self.lease = None;
        self.pos = 0;
        self.filled = 0;
    }

    async fn parse_reply(&mut self) -> Result<Response, TransportError> {
        let mut stack: Vec<OpenArray> = Vec::new();

        loop {
            let tag = self.read_byte().await?;
            self.read_line().await?;

            let mut value = match tag {
                prefix::STATUS => Response::Status(self.line_str()?),
                prefix::ERROR => Response::Error(self.line_str()?),
                prefix::INTEGER => Response::Integer(self.line_int()?),
                prefix::BULK => {
                    let length = self.line_int()?;
                    if length < 0 {
                        Response::Bulk(None)
                    } else {
                        let length = length as usize;
                        if length > MAX_BULK_SIZE {
                            return Err(ProtocolError::MessageTooLarge {
                                size: length,
                                max: MAX_BULK_SIZE,
                            }
                            .into());
                        }
                        Response::Bulk(Some(self.read_block(length).await?))
                    }
                }
                prefix::MULTI_BULK => match self.line_int()? {
                    -1 => Response::MultiBulk(None),
                    0 => Response::MultiBulk(Some(Vec::new())),
                    count if count < 0 => {
                        return Err(ProtocolError::InvalidArrayLength(count).into());
                    }
                    count => {
                        if stack.len() >= MAX_NESTING_DEPTH {
                            return Err(ProtocolError::NestingTooDeep {
                                max: MAX_NESTING_DEPTH,
                            }
                            .into());
                        }
                        let expected = count as usize;
                        stack.push(OpenArray {
                            items: Vec::with_capacity(expected.min(MAX_PREALLOCATED_ITEMS)),
                            expected,
                        });
                        continue;
                    }
                },
                other => return Err(ProtocolError::UnknownPrefix(other).into()),
            };

            // Fold the finished value into its enclosing arrays. An array
            // that receives its last element becomes the value for the next
            // level up.
            loop {
                match stack.last_mut() {
                    None => {
                        trace!(reply = ?value, "Parsed reply");
                        return Ok(value);
                    }
                    Some(open) if open.items.len() + 1 < open.expected => {
                        open.items.push(value);
                        break;
                    }
                    Some(_) => {
                        if let Some(mut done) = stack.pop() {
                            done.items.push(value);
                            value = Response::MultiBulk(Some(done.items));
                        }
                    }
                }
            }
        }
    }

    /// Refills the buffer from the socket. Only called once every buffered
    /// byte has been consumed.
    async fn fill(&mut self) -> Result<(), TransportError> {
        debug_assert_eq!(self.pos, self.filled);
        if self.lease.is_none() {
            self.lease = Some(self.buffers.acquire().await);
        }
        let lease = match self.lease.as_mut() {
            Some(lease) => lease,
            None => return Err(TransportError::Closed),
        };
        let n = self.transport.receive(&mut lease[..]).await?;
        self.pos = 0;
        self.filled = n;
        self.received += n as u64;
        Ok(())
    }

    async fn read_byte(&mut self) -> Result<u8, TransportError> {
        if self.pos == self.filled {
            self.fill().await?;
        }
        let byte = match &self.lease {
            Some(lease) => lease[self.pos],
            None => return Err(TransportError::Closed),
        };
        self.pos += 1;
        Ok(byte)
    }

    /// Reads up to and including the next CRLF into `self.line`.
    async fn read_line(&mut self) -> Result<(), TransportError> {
        self.line.clear();
        loop {
            if self.pos == self.filled {
                self.fill().await?;
            }
            let chunk = match &self.lease {
                Some(lease) => &lease[self.pos..self.filled],
                None => return Err(TransportError::Closed),
            };
            match chunk.iter().position(|&b| b == b'\r' || b == b'\n') {
                Some(end) if chunk[end] == b'\r' => {
                    self.line.extend_from_slice(&chunk[..end]);
                    self.pos += end + 1;
                    self.check_line_length()?;
                    return match self.read_byte().await? {
                        b'\n' => Ok(()),
                        _ => Err(ProtocolError::MissingCrlf.into()),
                    };
                }
                // A bare LF is not a line terminator.
                Some(_) => return Err(ProtocolError::MissingCrlf.into()),
                None => {
                    let taken = chunk.len();
                    self.line.extend_from_slice(chunk);
                    self.pos += taken;
                    self.check_line_length()?;
                }
            }
        }
    }

    /// Reads exactly `length` body bytes followed by CRLF.
    async fn read_block(&mut self, length: usize) -> Result<Bytes, TransportError> {
        let mut data = BytesMut::with_capacity(length.min(MAX_PREALLOCATED_BYTES));
        while data.len() < length {
            if self.pos == self.filled {
                self.fill().await?;
            }
            let chunk = match &self.lease {
                Some(lease) => &lease[self.pos..self.filled],
                None => return Err(TransportError::Closed),
            };
            let take = chunk.len().min(length - data.len());
            data.extend_from_slice(&chunk[..take]);
            self.pos += take;
        }
        if self.read_byte().await? != b'\r' || self.read_byte().await? != b'\n' {
            return Err(ProtocolError::MissingCrlf.into());
        }
        Ok(data.freeze())
    }

    fn check_line_length(&self) -> Result<(), ProtocolError> {
        if self.line.len() > MAX_LINE_LENGTH {
            return Err(ProtocolError::LineTooLong {
                max: MAX_LINE_LENGTH,
            });
        }
        Ok(())
    }

    fn line_str(&self) -> Result<String, ProtocolError> {
        std::str::from_utf8(&self.line)
            .map(str::to_string)
            .map_err(|e| ProtocolError::InvalidUtf8(e.to_string()))
    }

    fn line_int(&self) -> Result<i64, ProtocolError> {
        let s = std::str::from_utf8(&self.line)
            .map_err(|e| ProtocolError::InvalidInteger(e.to_string()))?;
        s.parse()
            .map_err(|e: std::num::ParseIntError| ProtocolError::InvalidInteger(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn reader_over(data: &'static [u8]) -> FrameReader<&'static [u8]> {
        FrameReader::new(data, BufferPool::new(64, 4))
    }

    /// A mock socket that delivers `data` one byte per read.
    fn trickle(data: &[u8]) -> tokio_test::io::Mock {
        let mut builder = Builder::new();
        for byte in data {
            builder.read(std::slice::from_ref(byte));
        }
        builder.build()
    }

    async fn parse(data: &'static [u8]) -> Result<Response, TransportError> {
        reader_over(data).receive().await
    }

    #[tokio::test]
    async fn test_huge_declared_bulk_with_short_body() {
        // Only the declared length is large; the peer hangs up early.
        let err = parse(b"$500000000\r\nshort").await.unwrap_err();
        assert!(matches!(err, TransportError::Shutdown));
    }

    #[tokio::test]
    async fn test_parse_status() {
        assert_eq!(parse(b"+OK\r\n").await.unwrap(), Response::status("OK"));
    }

    #[tokio::test]
    async fn test_parse_error() {
        assert_eq!(
            parse(b"-ERR unknown command\r\n").await.unwrap(),
            Response::error("ERR unknown command")
        );
    }

    #[tokio::test]
    async fn test_parse_integers() {
        assert_eq!(parse(b":1000\r\n").await.unwrap(), Response::Integer(1000));
        assert_eq!(parse(b":-42\r\n").await.unwrap(), Response::Integer(-42));
    }

    #[tokio::test]
    async fn test_parse_bulk() {
        assert_eq!(parse(b"$5\r\nhello\r\n").await.unwrap(), Response::bulk("hello"));
    }

    #[tokio::test]
    async fn test_nil_bulk_differs_from_empty_bulk() {
        let nil = parse(b"$-1\r\n").await.unwrap();
        let empty = parse(b"$0\r\n\r\n").await.unwrap();
        assert_eq!(nil, Response::Bulk(None));
        assert_eq!(empty, Response::Bulk(Some(Bytes::new())));
        assert_ne!(nil, empty);
    }

    #[tokio::test]
    async fn test_nil_multi_bulk_differs_from_empty_multi_bulk() {
        assert_eq!(parse(b"*-1\r\n").await.unwrap(), Response::MultiBulk(None));
        assert_eq!(parse(b"*0\r\n").await.unwrap(), Response::MultiBulk(Some(vec![])));
    }

    #[tokio::test]
    async fn test_binary_safe_bulk() {
        assert_eq!(
            parse(b"$5\r\nhel\x00o\r\n").await.unwrap(),
            Response::bulk(&b"hel\x00o"[..])
        );
    }

    #[tokio::test]
    async fn test_parse_nested_multi_bulk() {
        let reply = parse(b"*3\r\n:1\r\n*2\r\n$1\r\na\r\n*1\r\n+x\r\n$-1\r\n")
            .await
            .unwrap();
        assert_eq!(
            reply,
            Response::multi_bulk(vec![
                Response::Integer(1),
                Response::multi_bulk(vec![
                    Response::bulk("a"),
                    Response::multi_bulk(vec![Response::status("x")]),
                ]),
                Response::nil(),
            ])
        );
    }

    #[tokio::test]
    async fn test_multi_bulk_with_error_element() {
        let reply = parse(b"*2\r\n+OK\r\n-ERR wrong type\r\n").await.unwrap();
        assert_eq!(
            reply,
            Response::multi_bulk(vec![Response::status("OK"), Response::error("ERR wrong type")])
        );
    }

    #[tokio::test]
    async fn test_one_byte_at_a_time() {
        let wire: &[u8] = b"*4\r\n+OK\r\n$12\r\nhello\r\nworld\r\n*2\r\n:7\r\n*0\r\n$0\r\n\r\n";
        let mut reader = FrameReader::new(trickle(wire), BufferPool::new(64, 1));
        let reply = reader.receive().await.unwrap();
        assert_eq!(
            reply,
            Response::multi_bulk(vec![
                Response::status("OK"),
                Response::bulk("hello\r\nworld"),
                Response::multi_bulk(vec![Response::Integer(7), Response::multi_bulk(vec![])]),
                Response::bulk(Bytes::new()),
            ])
        );
    }

    #[tokio::test]
    async fn test_bulk_larger_than_buffer() {
        let body = vec![b'z'; 300];
        let mut wire = b"$300\r\n".to_vec();
        wire.extend_from_slice(&body);
        wire.extend_from_slice(b"\r\n");

        let mock = Builder::new().read(&wire).build();
        let mut reader = FrameReader::new(mock, BufferPool::new(16, 1));
        assert_eq!(reader.receive().await.unwrap(), Response::bulk(body));
    }

    #[tokio::test]
    async fn test_line_spanning_reads_with_split_crlf() {
        let mock = Builder::new().read(b"+PO").read(b"NG\r").read(b"\n").build();
        let mut reader = FrameReader::new(mock, BufferPool::new(64, 1));
        assert_eq!(reader.receive().await.unwrap(), Response::status("PONG"));
    }

    #[tokio::test]
    async fn test_pipelined_replies_from_one_read() {
        let pool = BufferPool::new(64, 1);
        let mut reader = FrameReader::new(&b"+OK\r\n:2\r\n$1\r\nv\r\n"[..], pool.clone());

        assert_eq!(reader.receive().await.unwrap(), Response::status("OK"));
        assert!(reader.holds_lease(), "unread bytes keep the lease");
        assert_eq!(reader.receive().await.unwrap(), Response::Integer(2));
        assert_eq!(reader.receive().await.unwrap(), Response::bulk("v"));
        assert!(!reader.holds_lease(), "drained buffer is returned");
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_lease_released_on_fault() {
        let pool = BufferPool::new(64, 1);
        let mut reader = FrameReader::new(&b"+OK"[..], pool.clone());
        let result = reader.receive().await;
        assert!(matches!(result, Err(TransportError::Shutdown)));
        assert!(!reader.holds_lease());
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_unknown_prefix() {
        let result = parse(b"@what\r\n").await;
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::UnknownPrefix(b'@')))
        ));
    }

    #[tokio::test]
    async fn test_invalid_integer() {
        let result = parse(b":not_a_number\r\n").await;
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::InvalidInteger(_)))
        ));
    }

    #[tokio::test]
    async fn test_invalid_multi_bulk_count() {
        let result = parse(b"*-2\r\n").await;
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::InvalidArrayLength(-2)))
        ));
    }

    #[tokio::test]
    async fn test_lf_only_line_is_rejected() {
        let result = parse(b"+OK\n").await;
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::MissingCrlf))
        ));
    }

    #[tokio::test]
    async fn test_cr_not_followed_by_lf_is_rejected() {
        let result = parse(b"+OK\rX\n").await;
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::MissingCrlf))
        ));
    }

    #[tokio::test]
    async fn test_bulk_without_trailing_crlf() {
        let result = parse(b"$3\r\nabcXY").await;
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::MissingCrlf))
        ));
    }

    #[tokio::test]
    async fn test_oversized_bulk_is_rejected_before_reading_body() {
        let result = parse(b"$999999999999\r\n").await;
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::MessageTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn test_nesting_limit() {
        let mut wire = Vec::new();
        for _ in 0..=MAX_NESTING_DEPTH {
            wire.extend_from_slice(b"*1\r\n");
        }
        wire.extend_from_slice(b":1\r\n");
        let mock = Builder::new().read(&wire).build();
        let mut reader = FrameReader::new(mock, BufferPool::new(4096, 1));
        let result = reader.receive().await;
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::NestingTooDeep { .. }))
        ));
    }
}
