//! Error types for the communication layer.
//!
//! Configuration problems are reported synchronously while a client is being
//! built. Everything that happens after `connect()` reaches the caller as a
//! [`ClientEvent`](crate::events::ClientEvent) carrying a [`SourcedError`].

use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::framing::FramingError;

/// Errors raised while parsing a connection descriptor or loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} property is missing (example: server=localhost:8888)")]
    MissingField(String),

    #[error("endpoint '{0}' is invalid (expected host:port)")]
    MalformedEndpoint(String),

    #[error("server port must be between 0 and 65535, got {0}")]
    PortOutOfRange(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("{0} is not a valid transport protocol")]
    UnknownProtocol(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by a connection session.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("connection to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("framing desynchronized: header does not start with marker {expected:02X?}")]
    FramingDesync { expected: Vec<u8> },

    #[error("frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("read loop did not stop within {0:?}")]
    CancellationTimeout(Duration),

    #[error("client is not connected")]
    NotConnected,

    #[error("range {offset}..{offset}+{length} is outside a buffer of {available} bytes")]
    InvalidRange {
        offset: usize,
        length: usize,
        available: usize,
    },

    #[error("connection closed")]
    Closed,
}

/// A [`LinkError`] shared between an event and the caller.
pub type SharedError = Arc<LinkError>;

/// Which part of the session produced an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorSource {
    ConnectLoop,
    ReadLoop,
    SendPath,
}

/// An error tagged with the session component it came from.
#[derive(Clone, Debug)]
pub struct SourcedError {
    pub source: ErrorSource,
    pub error: SharedError,
}

impl SourcedError {
    pub fn new(source: ErrorSource, error: LinkError) -> Self {
        Self {
            source,
            error: Arc::new(error),
        }
    }
}

impl std::fmt::Display for SourcedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.source, self.error)
    }
}
