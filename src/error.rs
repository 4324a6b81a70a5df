//! Error types.
//!
//! Two layers:
//!
//! - [`TransportError`] is the connector fault. Anything that makes a
//!   connection unusable (socket error, peer shutdown, malformed frame) is a
//!   `TransportError`. It is `Clone` because a poisoned pipeline hands the
//!   same fault to every waiter it fails.
//! - [`Error`] is what callers see. It separates "my command was bad"
//!   (`Server`), "the connection is dead" (`Transport`), misuse of the API
//!   and pool lifecycle failures.

use crate::connection::ConnectionState;
use crate::protocol::{ProtocolError, Response};
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Fatal connection-level fault. Poisons the pipeline that observed it.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Socket I/O failure
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// The peer closed the stream (zero-byte transfer)
    #[error("connection shut down by peer")]
    Shutdown,

    /// The peer sent bytes that are not a valid RESP reply
    #[error("malformed reply: {0}")]
    Protocol(#[from] ProtocolError),

    /// TCP connect did not complete in time
    #[error("connect to {endpoint} timed out")]
    ConnectTimeout { endpoint: String },

    /// The connection was closed locally
    #[error("connection closed")]
    Closed,
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WriteZero | io::ErrorKind::UnexpectedEof => TransportError::Shutdown,
            _ => TransportError::Io(Arc::new(err)),
        }
    }
}

/// Errors returned to callers of the client core.
#[derive(Debug, Error)]
pub enum Error {
    /// The server answered with an error reply. The connection stays usable.
    #[error("server error: {0}")]
    Server(String),

    /// The connection is dead; every outstanding and future command on it
    /// fails with this fault.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An ordinary command was issued while the pipeline is in one-way mode
    #[error("pipeline is in one-way mode")]
    OneWayMode,

    /// A one-way operation was issued outside one-way mode
    #[error("pipeline is not in one-way mode")]
    NotOneWay,

    /// The connection is not in a state that accepts commands
    #[error("connection is not ready (state: {0})")]
    NotReady(ConnectionState),

    /// `acquire` was called on a disposed pool
    #[error("connection pool has been disposed")]
    PoolDisposed,

    /// A connection key string could not be parsed
    #[error("invalid connection key: {0}")]
    InvalidKey(String),

    /// The reply type did not match what the command returns
    #[error("unexpected response: {0}")]
    UnexpectedResponse(Response),
}

impl Error {
    /// True if the connection that produced this error is dead.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    /// True if the server rejected the command.
    pub fn is_server(&self) -> bool {
        matches!(self, Error::Server(_))
    }

    /// True if the call was rejected before touching the network.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Error::OneWayMode | Error::NotOneWay | Error::NotReady(_)
        )
    }
}

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
