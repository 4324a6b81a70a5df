//! Receive Buffer Pool
//!
//! Every frame reader reads socket data into a fixed-size buffer leased from
//! a shared [`BufferPool`]. Leasing (instead of giving each connection its
//! own allocation) keeps memory bounded when many pooled connections sit
//! idle: a reader only holds a lease while it has unread bytes.
//!
//! ## Guarantees
//!
//! - The pool never allocates more than `max_buffers` buffers.
//! - When exhausted, callers wait in FIFO order for the next release.
//! - A buffer is referenced by at most one [`BufferLease`] at a time.

pub mod pool;

pub use pool::{BufferLease, BufferPool, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_BUFFERS};
