//! File-backed transport.
//!
//! Reading a file behaves like receiving from a peer. End of file is a
//! policy decision: rewind and repeat, disconnect, or keep polling for
//! appended data.

use async_trait::async_trait;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWrite};

use crate::endpoint::{AddressFamily, Endpoint, EndpointList, Settings};
use crate::errors::ConfigError;
use crate::traits::{StreamEnd, Transport, TransportKind};

/// Pause before re-reading a file that has no new data.
pub const DEFAULT_RECEIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Reads (and appends to) a local file.
#[derive(Clone, Debug)]
pub struct FileTransport {
    auto_repeat: bool,
    disconnect_at_end: bool,
    receive_interval: Duration,
    starting_offset: u64,
}

impl FileTransport {
    pub fn new() -> Self {
        Self {
            auto_repeat: false,
            disconnect_at_end: false,
            receive_interval: DEFAULT_RECEIVE_INTERVAL,
            starting_offset: 0,
        }
    }

    /// Rewind to the starting offset at end of file. Opens the file read-only.
    pub fn with_auto_repeat(mut self, enabled: bool) -> Self {
        self.auto_repeat = enabled;
        self
    }

    pub fn with_disconnect_at_end(mut self, enabled: bool) -> Self {
        self.disconnect_at_end = enabled;
        self
    }

    pub fn with_receive_interval(mut self, interval: Duration) -> Self {
        self.receive_interval = interval;
        self
    }

    pub fn with_starting_offset(mut self, offset: u64) -> Self {
        self.starting_offset = offset;
        self
    }

    /// Transport options from a descriptor.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let mut transport = Self::new();
        if let Some(flag) = settings.flag("autoRepeat")? {
            transport.auto_repeat = flag;
        }
        let at_end = match settings.flag("disconnectAtEnd")? {
            Some(flag) => Some(flag),
            None => settings.flag("disconnectAtEOF")?,
        };
        if let Some(flag) = at_end {
            transport.disconnect_at_end = flag;
        }
        if let Some(ms) = settings.number::<i64>("receiveInterval")? {
            // Non-positive intervals fall back to the default poll.
            if ms > 0 {
                transport.receive_interval = Duration::from_millis(ms as u64);
            }
        }
        if let Some(offset) = settings.number("startingOffset")? {
            transport.starting_offset = offset;
        }
        Ok(transport)
    }
}

impl Default for FileTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Write half of a file connection.
///
/// Files opened for repeated reading reject writes.
#[derive(Debug)]
pub struct FileWriter(Option<File>);

impl FileWriter {
    fn file(&mut self) -> io::Result<&mut File> {
        self.0
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::PermissionDenied, "file is open for reading only"))
    }
}

impl AsyncWrite for FileWriter {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.file() {
            Ok(file) => Pin::new(file).poll_write(cx, buf),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.0.as_mut() {
            Some(file) => Pin::new(file).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.0.as_mut() {
            Some(file) => Pin::new(file).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[async_trait]
impl Transport for FileTransport {
    type Reader = File;
    type Writer = FileWriter;

    fn kind(&self) -> TransportKind {
        TransportKind::File
    }

    fn endpoints(&self, settings: &Settings) -> Result<EndpointList, ConfigError> {
        let path = settings
            .non_empty("file")
            .ok_or_else(|| ConfigError::MissingField("file".to_string()))?;
        Ok(EndpointList::single(Endpoint::new(path.trim(), 0, AddressFamily::Unspecified)))
    }

    async fn connect(&self, endpoint: &Endpoint, _interface: Option<&str>) -> io::Result<(File, FileWriter)> {
        let path = endpoint.host.as_str();

        let mut reader = if self.auto_repeat {
            File::open(path).await?
        } else {
            OpenOptions::new().read(true).write(true).create(true).open(path).await?
        };
        reader.seek(SeekFrom::Start(self.starting_offset)).await?;

        let writer = if self.auto_repeat {
            None
        } else {
            Some(OpenOptions::new().append(true).open(path).await?)
        };

        Ok((reader, FileWriter(writer)))
    }

    async fn end_of_stream(&self, reader: &mut File) -> io::Result<StreamEnd> {
        if self.auto_repeat {
            reader.seek(SeekFrom::Start(self.starting_offset)).await?;
            Ok(StreamEnd::Rewound)
        } else if self.disconnect_at_end {
            Ok(StreamEnd::Closed)
        } else {
            Ok(StreamEnd::Idle(self.receive_interval))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::parse_settings;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("linkwire-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_settings() {
        let settings = parse_settings("file=data.bin; autoRepeat=true; receiveInterval=-1; startingOffset=4; disconnectAtEOF=true");
        let transport = FileTransport::from_settings(&settings).unwrap();
        assert!(transport.auto_repeat);
        assert!(transport.disconnect_at_end);
        assert_eq!(transport.receive_interval, DEFAULT_RECEIVE_INTERVAL);
        assert_eq!(transport.starting_offset, 4);

        let endpoints = transport.endpoints(&settings).unwrap();
        assert_eq!(endpoints.current().host, "data.bin");
    }

    #[test]
    fn test_missing_file_key() {
        let err = FileTransport::new().endpoints(&parse_settings("server=a:1")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(ref key) if key == "file"));
    }

    #[tokio::test]
    async fn test_rewind_to_starting_offset() {
        let path = temp_path("rewind");
        tokio::fs::write(&path, b"headbody").await.unwrap();

        let transport = FileTransport::new().with_auto_repeat(true).with_starting_offset(4);
        let endpoint = Endpoint::new(path.to_string_lossy(), 0, AddressFamily::Unspecified);
        let (mut reader, mut writer) = transport.connect(&endpoint, None).await.unwrap();

        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"body");

        assert_eq!(transport.end_of_stream(&mut reader).await.unwrap(), StreamEnd::Rewound);
        let mut again = [0u8; 4];
        reader.read_exact(&mut again).await.unwrap();
        assert_eq!(&again, b"body");

        let err = writer.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_idle_policy_by_default() {
        let path = temp_path("idle");
        let transport = FileTransport::new().with_receive_interval(Duration::from_millis(50));
        let endpoint = Endpoint::new(path.to_string_lossy(), 0, AddressFamily::Unspecified);
        let (mut reader, mut writer) = transport.connect(&endpoint, None).await.unwrap();

        assert_eq!(
            transport.end_of_stream(&mut reader).await.unwrap(),
            StreamEnd::Idle(Duration::from_millis(50))
        );
        writer.write_all(b"appended").await.unwrap();
        writer.flush().await.unwrap();

        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"appended");

        let _ = tokio::fs::remove_file(&path).await;
    }
}
