//! Socket capability wrappers.

use crate::error::TransportError;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Anything a connection can run over: a TCP stream in production, an
/// in-memory mock in tests.
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Socket for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased socket owned by one connection.
pub type BoxSocket = Box<dyn Socket>;

/// Splits a socket into its receive and send capabilities so the two
/// directions can be driven independently.
pub fn split(
    socket: BoxSocket,
) -> (RecvTransport<ReadHalf<BoxSocket>>, SendTransport<WriteHalf<BoxSocket>>) {
    let (read, write) = tokio::io::split(socket);
    (RecvTransport::new(read), SendTransport::new(write))
}

/// Opens a TCP connection to `endpoint` (`host:port`).
///
/// Nagle is disabled: the frame writer already batches pipelined commands,
/// so every flush should hit the wire immediately.
pub async fn connect(
    endpoint: &str,
    timeout: Option<Duration>,
) -> Result<TcpStream, TransportError> {
    let stream = match timeout {
        Some(limit) => tokio::time::timeout(limit, TcpStream::connect(endpoint))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                endpoint: endpoint.to_string(),
            })??,
        None => TcpStream::connect(endpoint).await?,
    };
    stream.set_nodelay(true)?;
    debug!(endpoint = %endpoint, "TCP connection established");
    Ok(stream)
}

/// Send side of a socket.
#[derive(Debug)]
pub struct SendTransport<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> SendTransport<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes all of `data` and flushes it to the peer.
    ///
    /// A write that accepts zero bytes is reported as
    /// [`TransportError::Shutdown`].
    pub async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        trace!(bytes = data.len(), "Sent");
        Ok(())
    }

    /// Shuts down the write direction. The peer sees end-of-stream.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Receive side of a socket.
#[derive(Debug)]
pub struct RecvTransport<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> RecvTransport<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads whatever the socket has into `buf`, returning the byte count.
    ///
    /// A zero-byte read means the peer closed the stream and is reported
    /// as [`TransportError::Shutdown`], never as `Ok(0)`.
    pub async fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = self.inner.read(buf).await?;
        if n == 0 {
            return Err(TransportError::Shutdown);
        }
        trace!(bytes = n, "Received");
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_receive_reports_eof_as_shutdown() {
        let mut transport = RecvTransport::new(&b""[..]);
        let mut buf = [0u8; 8];
        let result = transport.receive(&mut buf).await;
        assert!(matches!(result, Err(TransportError::Shutdown)));
    }

    #[tokio::test]
    async fn test_receive_returns_available_bytes() {
        let mut transport = RecvTransport::new(&b"+OK\r\n"[..]);
        let mut buf = [0u8; 8];
        let n = transport.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+OK\r\n");
    }

    #[tokio::test]
    async fn test_send_writes_and_flushes() {
        let mock = tokio_test::io::Builder::new().write(b"PING").build();
        let mut transport = SendTransport::new(mock);
        transport.send(b"PING").await.unwrap();
    }

    #[tokio::test]
    async fn test_send_into_closed_peer_is_a_fault() {
        let mut storage = [0u8; 0];
        let mut transport = SendTransport::new(std::io::Cursor::new(&mut storage[..]));
        let result = transport.send(b"data").await;
        assert!(matches!(result, Err(TransportError::Shutdown)));
    }

    #[tokio::test]
    async fn test_connect_and_split() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let stream = connect(&addr, Some(Duration::from_secs(1))).await.unwrap();
        let (mut rx, mut tx) = split(Box::new(stream));
        tx.send(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        let mut read = 0;
        while read < 4 {
            read += rx.receive(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }
}
