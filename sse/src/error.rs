//! Error types for the `sse` crate.
//!
//! Follows the same pattern as the other crates in the workspace: a root
//! `Error` struct holding an error kind and an optional source for chaining.
//! None of these errors escape a connection driver; they are reported to the
//! `ConnectionObserver` and the log, and then fed to the retry policy.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Major categories of errors in the streaming client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid base URL or endpoint configuration.
    Config,
    Transport(TransportErrorKind),
    /// No traffic arrived within the liveness window.
    HeartbeatTimeout,
    /// A frame's data could not be parsed as JSON.
    Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The transport could not be constructed.
    Builder,
    /// The connection was refused or dropped mid-stream.
    Connection,
    /// The server ended the stream.
    Closed,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.error_kind
    }

    pub fn heartbeat_timeout(timeout: Duration) -> Self {
        Error {
            source: Some(format!("no traffic received for {timeout:?}").into()),
            error_kind: ErrorKind::HeartbeatTimeout,
        }
    }

    pub fn stream_closed() -> Self {
        transport_error(TransportErrorKind::Closed, "stream ended by server")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::Config => write!(f, "Configuration error")?,
            ErrorKind::Transport(kind) => write!(f, "Transport error: {kind:?}")?,
            ErrorKind::HeartbeatTimeout => write!(f, "Heartbeat timeout")?,
            ErrorKind::Payload => write!(f, "Malformed payload")?,
        }
        if let Some(source) = &self.source {
            write!(f, " ({source})")?;
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

impl From<eventsource_client::Error> for Error {
    fn from(err: eventsource_client::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Transport(TransportErrorKind::Connection),
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Config,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Payload,
        }
    }
}

/// Helper function to create transport errors.
pub fn transport_error(kind: TransportErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Transport(kind),
    }
}

/// Helper function to create configuration errors.
pub fn config_error(message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Config,
    }
}
