//! # FlashPipe - A Pipelined RESP Client Core
//!
//! FlashPipe is the transport core of a Redis-compatible client, written in
//! Rust. It speaks RESP over TCP, lets many tasks pipeline commands over one
//! connection, and pools connections per endpoint.
//!
//! ## Features
//!
//! - **Pipelining**: Concurrent callers share a connection; replies come back
//!   in request order
//! - **Incremental Parsing**: Replies are parsed as bytes arrive, from pooled
//!   fixed-size read buffers
//! - **Fault Poisoning**: The first transport fault fails every outstanding
//!   and future command on that connection
//! - **Connection Pooling**: Idle connections per endpoint with background
//!   eviction
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              FlashPipe                                  │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ Connection  │───>│ Connection  │───>│  Pipeline   │                  │
//! │  │    Pool     │    │  (facade)   │    │  (drivers)  │                  │
//! │  └──────┬──────┘    └─────────────┘    └──────┬──────┘                  │
//! │         │                                     │                         │
//! │         ▼                                     ▼                         │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐   │
//! │  │    Idle     │    │                 Protocol                     │   │
//! │  │   Sweeper   │    │  ┌─────────────┐          ┌─────────────┐    │   │
//! │  │ (Tokio task)│    │  │ FrameWriter │          │ FrameReader │    │   │
//! │  └─────────────┘    │  └──────┬──────┘          └──────┬──────┘    │   │
//! │                     └─────────┼────────────────────────┼───────────┘   │
//! │                               ▼                        ▼               │
//! │                     ┌──────────────────┐    ┌──────────────────┐       │
//! │                     │  SendTransport   │    │  RecvTransport   │       │
//! │                     └──────────────────┘    └────────┬─────────┘       │
//! │                                                      │                 │
//! │                                             ┌────────┴─────────┐       │
//! │                                             │    BufferPool    │       │
//! │                                             └──────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use flashpipe::{ConnectionPool, PoolConfig};
//!
//! #[tokio::main]
//! async fn main() -> flashpipe::Result<()> {
//!     let pool = ConnectionPool::new(PoolConfig::default());
//!     let key = "127.0.0.1:6379".parse()?;
//!
//!     let conn = pool.acquire(&key).await?;
//!     conn.execute_command(["SET", "name", "Ariz"]).await?;
//!     let name = conn.execute_command(["GET", "name"]).await?;
//!     println!("{}", name);
//!     pool.release(conn);
//!
//!     pool.dispose().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`buffer`]: Fixed-size read buffers with FIFO waiters
//! - [`transport`]: Socket capability wrappers and TCP connect
//! - [`protocol`]: RESP reply type, request writer and reply parser
//! - [`pipeline`]: The per-connection ordering engine
//! - [`connection`]: Connection lifecycle, handshake and keys
//! - [`pool`]: Per-endpoint idle pooling and eviction
//! - [`error`]: Caller-facing errors and the transport fault type
//!
//! ## Design Highlights
//!
//! ### Single Active Driver
//!
//! Each direction of a connection is driven by at most one Tokio task at a
//! time. An atomic flag decides who starts it, so producers never block on
//! each other to get their requests written.
//!
//! ### Errors Are Layered
//!
//! A server error reply fails one command. A transport fault kills the
//! connection. Callers tell them apart with [`Error::is_server`] and
//! [`Error::is_transport`].

pub mod buffer;
pub mod connection;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod transport;

// Re-export commonly used types for convenience
pub use buffer::{BufferLease, BufferPool};
pub use connection::{Connection, ConnectionConfig, ConnectionKey, ConnectionState};
pub use error::{Error, Result, TransportError};
pub use pipeline::{Pipeline, PipelineConfig, PipelineStats};
pub use pool::{ConnectionPool, PoolConfig, PoolPolicy, PoolStats};
pub use protocol::{FrameReader, FrameWriter, ProtocolError, Response};

/// The default port RESP servers listen on
pub const DEFAULT_PORT: u16 = 6379;

/// Version of FlashPipe
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
