//! # Error Taxonomy
//!
//! Purpose: Give every failure a memcache client can observe a single typed
//! home, so callers can match on outcomes instead of parsing strings.
//!
//! ## Design Principles
//! 1. **Outcome vs. Failure**: Misses and failed preconditions are ordinary
//!    replies; transport and framing faults are not.
//! 2. **Connection Hygiene**: `is_resumable` tells the pool whether the stream
//!    is still positioned at a protocol boundary.
//! 3. **Server Text Preserved**: Error lines keep the server's message verbatim.

use std::io;

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type McResult<T> = Result<T, McError>;

/// Errors surfaced by the memcache client.
#[derive(Debug, Error)]
pub enum McError {
    /// Key is longer than 250 bytes or contains whitespace/control bytes.
    #[error("malformed key: too long or contains invalid characters")]
    MalformedKey,
    /// Key was not present on the server.
    #[error("cache miss")]
    CacheMiss,
    /// Add/replace/append/prepend precondition was not met.
    #[error("item not stored")]
    NotStored,
    /// CAS token no longer matches the stored item.
    #[error("compare-and-swap conflict")]
    CasConflict,
    /// Counter operation targeted a non-numeric value.
    #[error("cannot increment or decrement non-numeric value")]
    BadIncrDec,
    /// Selector has no live server addresses.
    #[error("no servers configured or available")]
    NoServers,
    /// Unexpected reply or an `ERROR`/`CLIENT_ERROR`/`SERVER_ERROR` line.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Dial, read, write or deadline failure.
    #[error("network error: {0}")]
    Network(#[from] io::Error),
    /// Dial did not complete within the configured timeout.
    #[error("connect timeout to {addr}")]
    ConnectTimeout { addr: String },
    /// Server address could not be parsed or resolved.
    #[error("invalid server address: {0}")]
    InvalidAddress(String),
}

impl McError {
    /// Builds a protocol error from any message.
    pub fn protocol(message: impl Into<String>) -> Self {
        McError::Protocol(message.into())
    }

    /// Returns true when the reply that produced this error was fully read.
    ///
    /// A connection that failed with a resumable error can go back to the
    /// pool; anything else may have left unread bytes on the wire.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            McError::CacheMiss
                | McError::NotStored
                | McError::CasConflict
                | McError::BadIncrDec
                | McError::MalformedKey
        )
    }

    /// Returns true for dial/read/write timeouts.
    pub fn is_timeout(&self) -> bool {
        match self {
            McError::ConnectTimeout { .. } => true,
            McError::Network(err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_level_errors_are_resumable() {
        assert!(McError::CacheMiss.is_resumable());
        assert!(McError::NotStored.is_resumable());
        assert!(McError::CasConflict.is_resumable());
        assert!(McError::BadIncrDec.is_resumable());
        assert!(McError::MalformedKey.is_resumable());
    }

    #[test]
    fn transport_and_framing_errors_taint() {
        assert!(!McError::protocol("bad line").is_resumable());
        assert!(!McError::NoServers.is_resumable());
        let io = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(!McError::from(io).is_resumable());
    }

    #[test]
    fn timeouts_are_detected() {
        let io = io::Error::new(io::ErrorKind::WouldBlock, "deadline");
        assert!(McError::from(io).is_timeout());
        assert!(McError::ConnectTimeout { addr: "a:1".into() }.is_timeout());
        assert!(!McError::CacheMiss.is_timeout());
    }

    #[test]
    fn display_keeps_server_text() {
        let err = McError::protocol("SERVER_ERROR out of memory");
        assert_eq!(err.to_string(), "protocol error: SERVER_ERROR out of memory");
    }
}
