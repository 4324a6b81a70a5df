//! Connection keys.
//!
//! A key names a server endpoint plus a logical database. Connections are
//! pooled per key: two connections with different databases are never
//! interchangeable even when they talk to the same server.

use crate::error::Error;
use std::fmt;
use std::str::FromStr;

/// Identifies where a connection goes: `host:port`, optionally `/db`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    endpoint: String,
    db: u16,
}

impl ConnectionKey {
    pub fn new(endpoint: impl Into<String>, db: u16) -> Self {
        Self {
            endpoint: endpoint.into(),
            db,
        }
    }

    /// The `host:port` part.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn db(&self) -> u16 {
        self.db
    }
}

impl FromStr for ConnectionKey {
    type Err = Error;

    /// Parses `host:port` or `host:port/db`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidKey(s.to_string());

        let (endpoint, db) = match s.rsplit_once('/') {
            Some((endpoint, db)) => (endpoint, db.parse::<u16>().map_err(|_| invalid())?),
            None => (s, 0),
        };

        let (host, port) = endpoint.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(invalid());
        }

        Ok(Self::new(endpoint, db))
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.db == 0 {
            write!(f, "{}", self.endpoint)
        } else {
            write!(f, "{}/{}", self.endpoint, self.db)
        }
    }
}
