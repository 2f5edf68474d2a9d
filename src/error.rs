//! Error types for minitm
//!
//! Defines a unified error type for every component of the transaction manager.
//! Errors returned from a handler are fatal to the dispatch loop: XA outcomes that a
//! caller should see are *replies*, never errors.

use std::fmt;
use std::io;

/// Unified error type for transaction manager operations
#[derive(Debug)]
pub enum TmError {
    /// I/O error (log file, sockets)
    Io(io::Error),
    /// The persistent transaction log failed or its worker went away
    Log(String),
    /// A message or log record could not be encoded/decoded
    Codec(String),
    /// A peer broke the message protocol (ingress handshake, unexpected message)
    Protocol(String),
    /// Invalid configuration
    Configuration(String),
    /// The transport could not be used at all
    Transport(String),
    /// Generic internal error
    Internal(String),
}

impl TmError {
    /// Error for a log worker channel that has been closed
    pub fn log_worker_gone(what: &str) -> Self {
        TmError::Log(format!("log worker unavailable: {}", what))
    }

    /// Error for a handler that was given a message it is not registered for
    pub fn unexpected_message(handler: &str, message: impl fmt::Debug) -> Self {
        TmError::Internal(format!("{} handler got unexpected message: {:?}", handler, message))
    }
}

impl fmt::Display for TmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TmError::Io(e) => write!(f, "io error: {}", e),
            TmError::Log(msg) => write!(f, "transaction log error: {}", msg),
            TmError::Codec(msg) => write!(f, "codec error: {}", msg),
            TmError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            TmError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            TmError::Transport(msg) => write!(f, "transport error: {}", msg),
            TmError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for TmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TmError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TmError {
    fn from(e: io::Error) -> Self {
        TmError::Io(e)
    }
}

impl From<serde_json::Error> for TmError {
    fn from(e: serde_json::Error) -> Self {
        TmError::Codec(e.to_string())
    }
}

impl From<bincode::Error> for TmError {
    fn from(e: bincode::Error) -> Self {
        TmError::Codec(e.to_string())
    }
}

/// Result type alias for minitm operations
pub type Result<T> = std::result::Result<T, TmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_prefixes_kind() {
        let e = TmError::Log("disk full".into());
        assert_eq!(e.to_string(), "transaction log error: disk full");

        let e = TmError::log_worker_gone("persist");
        assert!(e.to_string().contains("persist"));
    }

    #[test]
    fn test_from_io_keeps_source() {
        let e: TmError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(matches!(e, TmError::Io(_)));
        assert!(std::error::Error::source(&e).is_some());
    }

    #[test]
    fn test_from_json_is_codec() {
        let err = serde_json::from_str::<u32>("nope").unwrap_err();
        let e: TmError = err.into();
        assert!(matches!(e, TmError::Codec(_)));
    }
}
