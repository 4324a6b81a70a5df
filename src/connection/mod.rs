//! Client Connection Module
//!
//! This module wraps one server socket in a pipelined, stateful connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Connection                             │
//! │   key: host:port/db      state: Created ► Ready ► ...       │
//! │                                                             │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Pipeline                         │    │
//! │  │  ┌─────────────┐               ┌─────────────┐      │    │
//! │  │  │ FrameWriter │── requests ──>│   socket    │      │    │
//! │  │  └─────────────┘               └──────┬──────┘      │    │
//! │  │  ┌─────────────┐                      │             │    │
//! │  │  │ FrameReader │<──── replies ────────┘             │    │
//! │  │  └─────────────┘                                    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use flashpipe::buffer::BufferPool;
//! use flashpipe::connection::{Connection, ConnectionConfig, ConnectionKey};
//!
//! let key: ConnectionKey = "127.0.0.1:6379/2".parse()?;
//! let mut conn = Connection::new(key, ConnectionConfig::default(), BufferPool::default());
//! conn.connect().await?;
//! conn.prepare().await?;   // SELECT 2
//!
//! conn.execute_command(["SET", "name", "Ariz"]).await?;
//! let name = conn.execute_command(["GET", "name"]).await?;
//! ```

pub mod channel;
pub mod key;

// Re-export commonly used types
pub use channel::{Connection, ConnectionConfig, ConnectionState, DEFAULT_CONNECT_TIMEOUT};
pub use key::ConnectionKey;
