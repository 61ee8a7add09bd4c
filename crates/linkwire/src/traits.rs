//! Transport capability interface shared by every client kind.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::endpoint::{self, EndpointList, Settings};
use crate::errors::ConfigError;

/// Transport type identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    File,
    Mock,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Tcp => "tcp",
            TransportKind::File => "file",
            TransportKind::Mock => "mock",
        };
        f.write_str(name)
    }
}

/// What to do after a read returned zero bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    /// The stream is finished; the session disconnects.
    Closed,
    /// The transport repositioned the reader; keep reading.
    Rewound,
    /// Nothing to read yet; wait and read again.
    Idle(Duration),
}

/// Byte-stream primitive supplied to a [`ConnectionSession`](crate::session::ConnectionSession).
///
/// `connect` opens the resource and hands back independent read and write
/// halves. Closing is shutting down the writer and dropping both halves.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Reader: AsyncRead + Send + Unpin + 'static;
    type Writer: AsyncWrite + Send + Unpin + 'static;

    /// Get transport type identifier
    fn kind(&self) -> TransportKind;

    /// Candidate endpoints for this transport's descriptor.
    fn endpoints(&self, settings: &Settings) -> Result<EndpointList, ConfigError> {
        endpoint::parse_endpoints(settings)
    }

    /// Open the resource behind `endpoint`.
    ///
    /// `interface` is the optional local bind address from the descriptor.
    async fn connect(
        &self,
        endpoint: &endpoint::Endpoint,
        interface: Option<&str>,
    ) -> io::Result<(Self::Reader, Self::Writer)>;

    /// Decide how to continue after end of stream.
    async fn end_of_stream(&self, _reader: &mut Self::Reader) -> io::Result<StreamEnd> {
        Ok(StreamEnd::Closed)
    }
}
