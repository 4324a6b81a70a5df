//! Request Pipelining
//!
//! Many tasks can share one connection. Each `execute` call enqueues a
//! request and waits; a send driver writes queued requests back to back and
//! flushes once the queue runs dry, and a receive driver parses replies and
//! hands each one to the oldest waiting caller.
//!
//! ## Modes
//!
//! - Request/response (default): every request expects exactly one reply.
//! - One-way: entered permanently for subscriptions. Sends are acknowledged
//!   once flushed and replies are read explicitly with `read_next`.
//!
//! ## Example
//!
//! ```ignore
//! use flashpipe::pipeline::{Pipeline, PipelineConfig};
//!
//! let pipeline = Pipeline::new(Box::new(stream), &PipelineConfig::default(), buffers, "127.0.0.1:6379");
//! let reply = pipeline.execute(vec!["PING".into()]).await?;
//! ```

pub mod engine;

pub use engine::{Pipeline, PipelineConfig, PipelineStats, DEFAULT_MAX_QUEUE_DEPTH};
