//! RESP Protocol Implementation
//!
//! The client side of the Redis Serialization Protocol (RESP2).
//!
//! ## Overview
//!
//! Requests are always an array of bulk strings. Replies are one of status,
//! error, integer, bulk or multi-bulk, and multi-bulks nest.
//!
//! ## Modules
//!
//! - `types`: The `Response` enum and wire prefixes
//! - `writer`: Buffered request serializer (`FrameWriter`)
//! - `reader`: Incremental reply parser (`FrameReader`)
//!
//! ## Example
//!
//! ```ignore
//! use flashpipe::buffer::BufferPool;
//! use flashpipe::protocol::{FrameReader, FrameWriter, Response};
//! use bytes::Bytes;
//!
//! let mut writer = FrameWriter::new(write_half, 16 * 1024);
//! writer.write(&[Bytes::from("GET"), Bytes::from("name")]).await?;
//! writer.flush().await?;
//!
//! let mut reader = FrameReader::new(read_half, BufferPool::default());
//! let reply: Response = reader.receive().await?;
//! ```

pub mod reader;
pub mod types;
pub mod writer;

// Re-export commonly used types for convenience
pub use reader::{FrameReader, ProtocolError, MAX_BULK_SIZE, MAX_NESTING_DEPTH};
pub use types::Response;
pub use writer::{FrameWriter, DEFAULT_SEND_BUFFER_SIZE};
