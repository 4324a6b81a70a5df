//! RESP (Redis Serialization Protocol) Reply Types
//!
//! This module defines the reply value a server sends back for a command.
//! Only the RESP2 reply set is modelled.
//!
//! ## Protocol Format
//!
//! Each reply starts with a type prefix byte:
//! - `+` Status
//! - `-` Error
//! - `:` Integer
//! - `$` Bulk
//! - `*` Multi-bulk
//!
//! All lines are terminated with CRLF (`\r\n`).
//!
//! ## Examples
//!
//! Status: `+OK\r\n`
//! Error: `-ERR unknown command\r\n`
//! Integer: `:1000\r\n`
//! Bulk: `$5\r\nhello\r\n`
//! Nil bulk: `$-1\r\n`
//! Multi-bulk: `*2\r\n$3\r\nfoo\r\n:7\r\n`
//! Nil multi-bulk: `*-1\r\n`

use bytes::Bytes;
use std::fmt;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const STATUS: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK: u8 = b'$';
    pub const MULTI_BULK: u8 = b'*';
}

/// A reply parsed off the wire.
///
/// Exactly one variant is populated. A nil bulk (`$-1`) is `Bulk(None)` and
/// a zero-length bulk (`$0`) is `Bulk(Some(empty))`; the same distinction
/// holds for multi-bulk replies. Replies are immutable once returned by the
/// frame reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Single-line status reply, e.g. `OK` or `PONG`.
    Status(String),

    /// Single-line error reply. The connection facade turns this into
    /// [`Error::Server`](crate::Error::Server); it never poisons a connection.
    Error(String),

    /// 64-bit signed integer.
    Integer(i64),

    /// Binary-safe bulk string, `None` for the nil bulk.
    Bulk(Option<Bytes>),

    /// Ordered array of replies, `None` for the nil multi-bulk.
    /// Elements are independently typed and may nest.
    MultiBulk(Option<Vec<Response>>),
}

impl Response {
    /// Creates a status reply.
    pub fn status(s: impl Into<String>) -> Self {
        Response::Status(s.into())
    }

    /// Creates an error reply.
    pub fn error(s: impl Into<String>) -> Self {
        Response::Error(s.into())
    }

    /// Creates a non-nil bulk reply.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Response::Bulk(Some(data.into()))
    }

    /// Creates a non-nil multi-bulk reply.
    pub fn multi_bulk(items: Vec<Response>) -> Self {
        Response::MultiBulk(Some(items))
    }

    /// The nil bulk reply (`$-1`).
    pub fn nil() -> Self {
        Response::Bulk(None)
    }

    /// Serializes the reply into its wire format.
    ///
    /// Clients never send replies; this exists for peers and tests that
    /// need to produce server-side bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the reply into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            Response::Status(s) => {
                buf.push(prefix::STATUS);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Response::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Response::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Response::Bulk(Some(data)) => {
                buf.push(prefix::BULK);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            Response::Bulk(None) => {
                buf.push(prefix::BULK);
                buf.extend_from_slice(b"-1");
                buf.extend_from_slice(CRLF);
            }
            Response::MultiBulk(Some(items)) => {
                buf.push(prefix::MULTI_BULK);
                buf.extend_from_slice(items.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for item in items {
                    item.serialize_into(buf);
                }
            }
            Response::MultiBulk(None) => {
                buf.push(prefix::MULTI_BULK);
                buf.extend_from_slice(b"-1");
                buf.extend_from_slice(CRLF);
            }
        }
    }

    /// Returns true for the nil bulk and the nil multi-bulk.
    pub fn is_nil(&self) -> bool {
        matches!(self, Response::Bulk(None) | Response::MultiBulk(None))
    }

    /// Returns true if this is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_))
    }

    /// Returns the status text of a status reply.
    pub fn as_status(&self) -> Option<&str> {
        match self {
            Response::Status(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the payload of a non-nil bulk reply.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Response::Bulk(Some(b)) => Some(b),
            _ => None,
        }
    }

    /// Returns the value of an integer reply.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Response::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the elements of a non-nil multi-bulk reply.
    pub fn as_array(&self) -> Option<&[Response]> {
        match self {
            Response::MultiBulk(Some(items)) => Some(items),
            _ => None,
        }
    }

    /// Consumes self and returns the elements of a non-nil multi-bulk reply.
    pub fn into_array(self) -> Option<Vec<Response>> {
        match self {
            Response::MultiBulk(Some(items)) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Status(s) => write!(f, "{}", s),
            Response::Error(s) => write!(f, "(error) {}", s),
            Response::Integer(n) => write!(f, "(integer) {}", n),
            Response::Bulk(Some(data)) => {
                if let Ok(s) = std::str::from_utf8(data) {
                    write!(f, "\"{}\"", s)
                } else {
                    write!(f, "(binary data, {} bytes)", data.len())
                }
            }
            Response::Bulk(None) | Response::MultiBulk(None) => write!(f, "(nil)"),
            Response::MultiBulk(Some(items)) => {
                if items.is_empty() {
                    write!(f, "(empty array)")
                } else {
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            writeln!(f)?;
                        }
                        write!(f, "{}) {}", i + 1, item)?;
                    }
                    Ok(())
                }
            }
        }
    }
}
