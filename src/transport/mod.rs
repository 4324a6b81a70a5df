//! Socket Transport
//!
//! A thin capability layer over a non-blocking socket. The rest of the crate
//! never touches a `TcpStream` directly; it sees two halves:
//!
//! - [`SendTransport`]: `send` (write everything, then flush) and `shutdown`
//! - [`RecvTransport`]: `receive` (read whatever is available)
//!
//! Both normalize a zero-byte transfer into [`TransportError::Shutdown`]
//! so callers cannot mistake a closed peer for an empty read.
//!
//! Each operation either completes immediately or suspends the calling task
//! until the socket is ready; no OS thread blocks on the network.
//!
//! [`TransportError::Shutdown`]: crate::TransportError::Shutdown

pub mod socket;

pub use socket::{connect, split, BoxSocket, RecvTransport, SendTransport, Socket};
