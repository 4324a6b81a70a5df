//! Connection Pool Module
//!
//! Keeps prepared connections per endpoint so callers do not pay for a TCP
//! handshake (and `AUTH`/`SELECT`) on every use.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ConnectionPool                           │
//! │  ┌──────────────────┐ ┌──────────────────┐                  │
//! │  │ host-a:6379      │ │ host-b:6379/2    │   ...per key     │
//! │  │ [idle, idle, ..] │ │ [idle, ..]       │                  │
//! │  └──────────────────┘ └──────────────────┘                  │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!                            │
//!              ┌─────────────┴─────────────┐
//!              │       IdleSweeper         │
//!              │  (Background Tokio Task)  │
//!              └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use flashpipe::pool::{ConnectionPool, PoolConfig};
//!
//! let pool = ConnectionPool::new(PoolConfig::default());
//! let key = "127.0.0.1:6379".parse()?;
//!
//! let conn = pool.acquire(&key).await?;
//! conn.execute_command(["INCR", "visits"]).await?;
//! pool.release(conn);
//!
//! pool.dispose().await;
//! ```

pub mod manager;
pub mod sweeper;

// Re-export commonly used types
pub use manager::{
    ConnectionPool, PoolConfig, PoolPolicy, PoolStats, DEFAULT_DESTROY_TIMEOUT,
    DEFAULT_INACTIVITY_TIMEOUT, DEFAULT_MAX_IDLE_PER_KEY, DEFAULT_SWEEP_INTERVAL,
};
pub use sweeper::IdleSweeper;
