//! Error types for the `sync` crate.
//!
//! Follows the same pattern as the other workspace crates: a root `Error`
//! struct holding an `ErrorKind` plus an optional source for chaining.

use std::error::Error as StdError;
use std::fmt;
use tokio_tungstenite::tungstenite;

/// Top-level error type for the sync client.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Major categories of errors surfaced to callers.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    /// A frame was sent while the session is not open. Recoverable: the caller
    /// may retry once the connection is back.
    NotConnected,
    /// The consumer is already registered with the registry.
    DuplicateRegistration,
    /// The sync client was unbound.
    NotBound,
    /// A one-shot fetch got no value in time.
    Timeout,
    /// The hub has been shut down.
    Shutdown,
    Transport(TransportErrorKind),
    /// A frame could not be encoded or decoded.
    Protocol,
}

/// Failures of the persistent connection. These drive the reconnect state
/// machine and are never returned to UI code.
#[derive(Debug, PartialEq)]
pub enum TransportErrorKind {
    Connect,
    ConnectTimeout,
    Send,
    Closed,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.error_kind
    }

    pub fn is_not_connected(&self) -> bool {
        self.error_kind == ErrorKind::NotConnected
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::NotConnected => write!(f, "Not connected")?,
            ErrorKind::DuplicateRegistration => write!(f, "Duplicate registration")?,
            ErrorKind::NotBound => write!(f, "Sync client is not bound")?,
            ErrorKind::Timeout => write!(f, "Timed out")?,
            ErrorKind::Shutdown => write!(f, "Sync hub is shut down")?,
            ErrorKind::Transport(kind) => write!(f, "Transport error: {kind:?}")?,
            ErrorKind::Protocol => write!(f, "Protocol error")?,
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<tungstenite::Error> for Error {
    fn from(err: tungstenite::Error) -> Self {
        let error_kind = match &err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                ErrorKind::Transport(TransportErrorKind::Closed)
            }
            tungstenite::Error::Io(_) | tungstenite::Error::Url(_) => {
                ErrorKind::Transport(TransportErrorKind::Connect)
            }
            _ => ErrorKind::Transport(TransportErrorKind::Send),
        };
        Error {
            source: Some(Box::new(err)),
            error_kind,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Protocol,
        }
    }
}

/// Helper function to create an error with a message as its source.
pub fn error(error_kind: ErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind,
    }
}

pub fn not_connected(message: &str) -> Error {
    error(ErrorKind::NotConnected, message)
}

pub fn shutdown() -> Error {
    Error {
        source: None,
        error_kind: ErrorKind::Shutdown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_source_message() {
        let err = not_connected("session is closed");
        assert_eq!(err.to_string(), "Not connected: session is closed");
        assert!(err.is_not_connected());
    }

    #[test]
    fn test_display_without_source() {
        assert_eq!(shutdown().to_string(), "Sync hub is shut down");
    }

    #[test]
    fn test_tungstenite_closed_maps_to_transport_closed() {
        let err: Error = tungstenite::Error::ConnectionClosed.into();
        assert_eq!(
            err.error_kind,
            ErrorKind::Transport(TransportErrorKind::Closed)
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn test_json_errors_are_protocol_errors() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.error_kind, ErrorKind::Protocol);
    }
}
