//! Connection Facade
//!
//! A `Connection` is one socket to one server plus the pipeline that drives
//! it. It owns the lifecycle:
//!
//! ```text
//! Created ──connect()──► Connected ──prepare()──► Ready ──enter_one_way_mode()──► Subscribed
//!                                                  │
//!                                                  ├──quit()────────► Quit
//!                                                  └──disconnect()──► Disconnected
//!
//! any open state ──transport fault──► Faulted
//! ```
//!
//! Only `Ready` connections go back into a pool.

use crate::buffer::BufferPool;
use crate::connection::ConnectionKey;
use crate::error::{Error, Result};
use crate::pipeline::{Pipeline, PipelineConfig, PipelineStats};
use crate::protocol::Response;
use crate::transport::{self, BoxSocket};
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Default TCP connect timeout (5 seconds)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Not connected yet
    Created = 0,
    /// Socket open, handshake not run
    Connected = 1,
    /// Handshake done, accepting commands
    Ready = 2,
    /// Permanently in one-way mode
    Subscribed = 3,
    /// Closed after a `QUIT`
    Quit = 4,
    /// Closed locally
    Disconnected = 5,
    /// The pipeline latched a transport fault
    Faulted = 6,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Created,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Ready,
            3 => ConnectionState::Subscribed,
            4 => ConnectionState::Quit,
            5 => ConnectionState::Disconnected,
            _ => ConnectionState::Faulted,
        }
    }

    /// True for states where the socket is still open.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Ready | ConnectionState::Subscribed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Created => "created",
            ConnectionState::Connected => "connected",
            ConnectionState::Ready => "ready",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Quit => "quit",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub pipeline: PipelineConfig,

    /// TCP connect timeout; `None` waits as long as the OS does
    pub connect_timeout: Option<Duration>,

    /// Sent with `AUTH` during `prepare` when set
    pub password: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            password: None,
        }
    }
}

/// One client connection to a RESP server.
///
/// Command methods take `&self`, so a connection can be shared between
/// tasks (e.g. behind an `Arc`) and their commands pipeline together.
pub struct Connection {
    id: u64,
    key: ConnectionKey,
    config: ConnectionConfig,
    buffers: BufferPool,
    pipeline: Option<Pipeline>,
    state: AtomicU8,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Creates an unconnected connection. Call [`connect`](Self::connect)
    /// and [`prepare`](Self::prepare) before issuing commands.
    pub fn new(key: ConnectionKey, config: ConnectionConfig, buffers: BufferPool) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            key,
            config,
            buffers,
            pipeline: None,
            state: AtomicU8::new(ConnectionState::Created as u8),
        }
    }

    /// Binds an already connected socket. The result is in `Connected`
    /// state.
    pub fn with_socket(
        key: ConnectionKey,
        config: ConnectionConfig,
        buffers: BufferPool,
        socket: BoxSocket,
    ) -> Self {
        let mut conn = Self::new(key, config, buffers);
        conn.attach(socket);
        conn
    }

    /// Opens the TCP connection to the key's endpoint.
    pub async fn connect(&mut self) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Created {
            return Err(Error::NotReady(state));
        }
        let stream = transport::connect(self.key.endpoint(), self.config.connect_timeout).await?;
        self.attach(Box::new(stream));
        info!(endpoint = %self.key, conn = self.id, "Connected");
        Ok(())
    }

    /// Runs the handshake: `AUTH` if a password is configured, then
    /// `SELECT` if the key names a non-zero database.
    pub async fn prepare(&self) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(Error::NotReady(state));
        }

        if let Some(password) = &self.config.password {
            let reply = self.execute_command(["AUTH", password.as_str()]).await?;
            expect_ok(reply)?;
        }

        if self.key.db() != 0 {
            let db = self.key.db().to_string();
            let reply = self.execute_command(["SELECT", db.as_str()]).await?;
            expect_ok(reply)?;
        }

        self.set_state(ConnectionState::Ready);
        debug!(endpoint = %self.key, conn = self.id, "Connection ready");
        Ok(())
    }

    /// Sends one command and waits for its reply.
    ///
    /// An error reply comes back as [`Error::Server`] and leaves the
    /// connection usable.
    pub async fn execute_command<I, A>(&self, args: I) -> Result<Response>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        let pipeline = self.open_pipeline()?;
        match pipeline.execute(to_args(args)).await? {
            Response::Error(message) => Err(Error::Server(message)),
            reply => Ok(reply),
        }
    }

    /// Sends `PING` and checks for `PONG`.
    pub async fn ping(&self) -> Result<()> {
        match self.execute_command(["PING"]).await? {
            Response::Status(s) if s == "PONG" => Ok(()),
            other => Err(Error::UnexpectedResponse(other)),
        }
    }

    /// Switches the connection to one-way mode for subscriptions.
    ///
    /// Waits for every reply already owed to earlier commands. The switch
    /// is permanent and the connection can no longer be pooled.
    pub async fn enter_one_way_mode(&self) -> Result<()> {
        let pipeline = self.open_pipeline()?;
        pipeline.enter_one_way().await;
        self.set_state(ConnectionState::Subscribed);
        Ok(())
    }

    /// Sends a command without waiting for a reply. One-way mode only.
    pub async fn send_one_way<I, A>(&self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        let pipeline = self.open_pipeline()?;
        pipeline.send_one_way(to_args(args)).await
    }

    /// Reads the next message pushed by the server. One-way mode only.
    pub async fn read_next_response(&self) -> Result<Response> {
        self.open_pipeline()?.read_next().await
    }

    /// Sends `QUIT`, waits for the acknowledgement and closes the socket.
    ///
    /// The connection ends in `Quit` state even if the server did not
    /// answer.
    pub async fn quit(&self) -> Result<()> {
        let pipeline = self.open_pipeline()?;
        let result = if pipeline.is_one_way() {
            pipeline.send_one_way(vec![Bytes::from_static(b"QUIT")]).await
        } else {
            pipeline
                .execute(vec![Bytes::from_static(b"QUIT")])
                .await
                .map(|_| ())
        };
        self.set_state(ConnectionState::Quit);
        pipeline.close().await;
        debug!(endpoint = %self.key, conn = self.id, "Connection quit");
        result
    }

    /// Closes the socket without telling the server. Queued commands fail.
    pub async fn disconnect(&self) {
        if let Some(pipeline) = &self.pipeline {
            let state = self.state();
            if state.is_open() || state == ConnectionState::Faulted {
                self.set_state(ConnectionState::Disconnected);
            }
            pipeline.close().await;
            debug!(endpoint = %self.key, conn = self.id, "Connection closed");
        }
    }

    /// Current lifecycle state. A latched transport fault reports as
    /// `Faulted` regardless of the state the connection was in.
    pub fn state(&self) -> ConnectionState {
        let state = ConnectionState::from_u8(self.state.load(Ordering::Acquire));
        match &self.pipeline {
            Some(pipeline) if state.is_open() && pipeline.is_poisoned() => {
                ConnectionState::Faulted
            }
            _ => state,
        }
    }

    /// True if the connection can be handed to another user as is.
    pub fn is_reusable(&self) -> bool {
        match &self.pipeline {
            Some(pipeline) => {
                self.state() == ConnectionState::Ready
                    && pipeline.queued() == 0
                    && pipeline.in_flight() == 0
            }
            None => false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn stats(&self) -> Option<&PipelineStats> {
        self.pipeline.as_ref().map(Pipeline::stats)
    }

    fn attach(&mut self, socket: BoxSocket) {
        self.pipeline = Some(Pipeline::new(
            socket,
            &self.config.pipeline,
            self.buffers.clone(),
            format!("{}#{}", self.key, self.id),
        ));
        self.set_state(ConnectionState::Connected);
    }

    fn open_pipeline(&self) -> Result<&Pipeline> {
        let state = self.state();
        match &self.pipeline {
            // A faulted pipeline answers with its latched fault.
            Some(pipeline) if state.is_open() || state == ConnectionState::Faulted => Ok(pipeline),
            _ => Err(Error::NotReady(state)),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

fn to_args<I, A>(args: I) -> Vec<Bytes>
where
    I: IntoIterator<Item = A>,
    A: AsRef<[u8]>,
{
    args.into_iter()
        .map(|arg| Bytes::copy_from_slice(arg.as_ref()))
        .collect()
}

fn expect_ok(reply: Response) -> Result<()> {
    match reply {
        Response::Status(ref s) if s == "OK" => Ok(()),
        other => Err(Error::UnexpectedResponse(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use tokio_test::io::Builder;

    fn key(text: &str) -> ConnectionKey {
        text.parse().unwrap()
    }

    fn over_mock(
        key: ConnectionKey,
        config: ConnectionConfig,
        mock: tokio_test::io::Mock,
    ) -> Connection {
        Connection::with_socket(key, config, BufferPool::new(128, 2), Box::new(mock))
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Ready.to_string(), "ready");
        assert_eq!(ConnectionState::Faulted.to_string(), "faulted");
        assert_eq!(
            Error::NotReady(ConnectionState::Quit).to_string(),
            "connection is not ready (state: quit)"
        );
    }

    #[tokio::test]
    async fn test_new_connection_rejects_commands() {
        let conn = Connection::new(
            key("127.0.0.1:1"),
            ConnectionConfig::default(),
            BufferPool::default(),
        );
        assert_eq!(conn.state(), ConnectionState::Created);
        assert!(!conn.is_reusable());
        let err = conn.execute_command(["PING"]).await.unwrap_err();
        assert!(matches!(err, Error::NotReady(ConnectionState::Created)));
    }

    #[tokio::test]
    async fn test_prepare_without_handshake_commands() {
        let conn = over_mock(key("h:1"), ConnectionConfig::default(), Builder::new().build());
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn.prepare().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert!(conn.is_reusable());
    }

    #[tokio::test]
    async fn test_prepare_authenticates_and_selects_db() {
        let mock = Builder::new()
            .write(b"*2\r\n$4\r\nAUTH\r\n$6\r\nsecret\r\n")
            .read(b"+OK\r\n")
            .write(b"*2\r\n$6\r\nSELECT\r\n$1\r\n3\r\n")
            .read(b"+OK\r\n")
            .build();
        let config = ConnectionConfig {
            password: Some("secret".into()),
            ..ConnectionConfig::default()
        };
        let conn = over_mock(key("h:1/3"), config, mock);

        conn.prepare().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_prepare_fails_on_rejected_select() {
        let mock = Builder::new()
            .write(b"*2\r\n$6\r\nSELECT\r\n$2\r\n99\r\n")
            .read(b"-ERR DB index is out of range\r\n")
            .build();
        let conn = over_mock(key("h:1/99"), ConnectionConfig::default(), mock);

        let err = conn.prepare().await.unwrap_err();
        assert!(matches!(err, Error::Server(ref msg) if msg.contains("out of range")));
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(!conn.is_reusable());
    }

    #[tokio::test]
    async fn test_server_error_keeps_connection_ready() {
        let mock = Builder::new()
            .write(b"*2\r\n$4\r\nINCR\r\n$1\r\ns\r\n")
            .read(b"-ERR value is not an integer\r\n")
            .write(b"*1\r\n$4\r\nPING\r\n")
            .read(b"+PONG\r\n")
            .build();
        let conn = over_mock(key("h:1"), ConnectionConfig::default(), mock);
        conn.prepare().await.unwrap();

        let err = conn.execute_command(["INCR", "s"]).await.unwrap_err();
        assert!(err.is_server());
        conn.ping().await.unwrap();
        assert!(conn.is_reusable());
    }

    #[tokio::test]
    async fn test_transport_fault_reports_faulted() {
        let mock = Builder::new().write(b"*1\r\n$4\r\nPING\r\n").build();
        let conn = over_mock(key("h:1"), ConnectionConfig::default(), mock);
        conn.prepare().await.unwrap();

        let err = conn.ping().await.unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Shutdown)));
        assert_eq!(conn.state(), ConnectionState::Faulted);
        assert!(!conn.is_reusable());

        // The same fault keeps coming back.
        let err = conn.execute_command(["GET", "k"]).await.unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Shutdown)));
    }

    #[tokio::test]
    async fn test_one_way_mode() {
        let mock = Builder::new()
            .write(b"*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nnews\r\n")
            .read(b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n")
            .read(b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nhello\r\n")
            .build();
        let conn = over_mock(key("h:1"), ConnectionConfig::default(), mock);
        conn.prepare().await.unwrap();

        assert!(matches!(
            conn.send_one_way(["SUBSCRIBE", "news"]).await,
            Err(Error::NotOneWay)
        ));

        conn.enter_one_way_mode().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Subscribed);
        assert!(!conn.is_reusable());
        assert!(matches!(conn.ping().await, Err(Error::OneWayMode)));

        conn.send_one_way(["SUBSCRIBE", "news"]).await.unwrap();
        let confirm = conn.read_next_response().await.unwrap();
        assert_eq!(confirm.as_array().map(<[Response]>::len), Some(3));

        let message = conn.read_next_response().await.unwrap().into_array().unwrap();
        assert_eq!(message[2].as_bytes(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn test_quit() {
        let mock = Builder::new()
            .write(b"*1\r\n$4\r\nQUIT\r\n")
            .read(b"+OK\r\n")
            .build();
        let conn = over_mock(key("h:1"), ConnectionConfig::default(), mock);
        conn.prepare().await.unwrap();

        conn.quit().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Quit);
        assert!(!conn.is_reusable());
        assert!(matches!(
            conn.execute_command(["PING"]).await,
            Err(Error::NotReady(ConnectionState::Quit))
        ));
    }

    #[tokio::test]
    async fn test_disconnect() {
        let conn = over_mock(key("h:1"), ConnectionConfig::default(), Builder::new().build());
        conn.prepare().await.unwrap();

        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(matches!(
            conn.ping().await,
            Err(Error::NotReady(ConnectionState::Disconnected))
        ));
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let mut conn = over_mock(key("h:1"), ConnectionConfig::default(), Builder::new().build());
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, Error::NotReady(ConnectionState::Connected)));
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut conn = Connection::new(
            ConnectionKey::new(addr.to_string(), 0),
            ConnectionConfig::default(),
            BufferPool::default(),
        );
        let err = conn.connect().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(conn.state(), ConnectionState::Created);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Connection::new(key("h:1"), ConnectionConfig::default(), BufferPool::default());
        let b = Connection::new(key("h:1"), ConnectionConfig::default(), BufferPool::default());
        assert_ne!(a.id(), b.id());
    }
}
