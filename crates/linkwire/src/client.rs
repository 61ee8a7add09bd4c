//! Client facade over a connection session.

use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

use crate::config::ClientConfig;
use crate::connection::{ConnectionState, ConnectionStats};
use crate::endpoint::{parse_settings, Settings};
use crate::errors::{ConfigError, SharedError};
use crate::events::{ClientEvent, ReceiveHandler};
use crate::session::{ConnectHandle, ConnectionSession, SessionOptions};
use crate::traits::{Transport, TransportKind};
use crate::transports::{FileTransport, TcpTransport};

/// A client for one transport, configured from a connection descriptor.
pub struct Client<T: Transport> {
    session: ConnectionSession<T>,
    config: ClientConfig,
    settings: Settings,
}

pub type TcpClient = Client<TcpTransport>;
pub type FileClient = Client<FileTransport>;

impl<T: Transport> Client<T> {
    /// Build a client with default configuration plus descriptor overrides.
    pub fn new(transport: T, descriptor: &str) -> Result<Self, ConfigError> {
        Self::with_config(transport, descriptor, ClientConfig::default())
    }

    /// Build a client from `config`, overridden by keys in `descriptor`.
    pub fn with_config(transport: T, descriptor: &str, config: ClientConfig) -> Result<Self, ConfigError> {
        Self::from_settings(transport, parse_settings(descriptor), config)
    }

    fn from_settings(transport: T, settings: Settings, mut config: ClientConfig) -> Result<Self, ConfigError> {
        config.apply_settings(&settings)?;
        let endpoints = transport.endpoints(&settings)?;
        let interface = settings.non_empty("interface").map(|i| i.trim().to_string());
        let options = SessionOptions::from_config(&config)?;

        info!(
            kind = %transport.kind(),
            endpoints = endpoints.len(),
            payload_aware = config.payload_aware,
            "client configured"
        );

        Ok(Self {
            session: ConnectionSession::new(transport, endpoints, interface, options),
            config,
            settings,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The parsed descriptor.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn session(&self) -> &ConnectionSession<T> {
        &self.session
    }

    pub fn connect(&self) -> ConnectHandle {
        self.session.connect()
    }

    pub async fn disconnect(&self) {
        self.session.disconnect().await
    }

    pub async fn send(&self, payload: &[u8]) -> Result<usize, SharedError> {
        self.session.send(payload).await
    }

    pub async fn send_slice(&self, data: &[u8], offset: usize, length: usize) -> Result<usize, SharedError> {
        self.session.send_slice(data, offset, length).await
    }

    pub fn request_next_endpoint(&self) -> bool {
        self.session.request_next_endpoint()
    }

    pub fn events(&self) -> Option<UnboundedReceiver<ClientEvent>> {
        self.session.events()
    }

    pub fn set_receive_handler(&self, handler: Option<Arc<dyn ReceiveHandler>>) {
        self.session.set_receive_handler(handler)
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn statistics(&self) -> ConnectionStats {
        self.session.statistics()
    }

    /// Current endpoint as a URI, e.g. `tcp://localhost:8888`.
    pub fn server_uri(&self) -> String {
        self.session.endpoints().server_uri(self.session.transport().kind())
    }

    /// Time connected so far, or the length of the last connection.
    pub fn connection_time(&self) -> Option<Duration> {
        self.session.statistics().duration
    }

    /// Human-readable summary of the client.
    pub fn status(&self) -> String {
        let stats = self.statistics();
        let connection_time = stats
            .duration
            .map(|d| format!("{:.3}s", d.as_secs_f64()))
            .unwrap_or_else(|| "n/a".to_string());

        let mut status = String::new();
        let _ = writeln!(status, "              Client state: {}", stats.state);
        let _ = writeln!(status, "           Connection time: {}", connection_time);
        let _ = writeln!(status, "                    Server: {}", self.server_uri());
        let _ = writeln!(status, "            Receive buffer: {}", self.config.receive_buffer_size);
        let _ = writeln!(status, "        Transport protocol: {}", self.session.transport().kind());
        let _ = writeln!(status, "             Payload aware: {}", self.config.payload_aware);
        let _ = writeln!(status, "                Bytes sent: {}", stats.bytes_sent);
        let _ = writeln!(status, "            Bytes received: {}", stats.bytes_received);
        status
    }
}

impl TcpClient {
    /// TCP client from a descriptor such as `server=localhost:8888; noDelay=true`.
    pub fn tcp(descriptor: &str) -> Result<Self, ConfigError> {
        let settings = parse_settings(descriptor);
        let transport = TcpTransport::from_settings(&settings)?;
        Self::from_settings(transport, settings, ClientConfig::default())
    }
}

impl FileClient {
    /// File client from a descriptor such as `file=data.bin; autoRepeat=true`.
    pub fn file(descriptor: &str) -> Result<Self, ConfigError> {
        let settings = parse_settings(descriptor);
        let transport = FileTransport::from_settings(&settings)?;
        Self::from_settings(transport, settings, ClientConfig::default())
    }
}

/// Object-safe view of a [`Client`], for callers that pick the transport at runtime.
#[async_trait]
pub trait CommunicationClient: Send + Sync {
    fn kind(&self) -> TransportKind;
    fn connect(&self) -> ConnectHandle;
    async fn disconnect(&self);
    async fn send(&self, payload: &[u8]) -> Result<usize, SharedError>;
    fn request_next_endpoint(&self) -> bool;
    fn events(&self) -> Option<UnboundedReceiver<ClientEvent>>;
    fn set_receive_handler(&self, handler: Option<Arc<dyn ReceiveHandler>>);
    fn state(&self) -> ConnectionState;
    fn statistics(&self) -> ConnectionStats;
    fn server_uri(&self) -> String;
    fn status(&self) -> String;
}

#[async_trait]
impl<T: Transport> CommunicationClient for Client<T> {
    fn kind(&self) -> TransportKind {
        self.session.transport().kind()
    }

    fn connect(&self) -> ConnectHandle {
        self.session.connect()
    }

    async fn disconnect(&self) {
        self.session.disconnect().await
    }

    async fn send(&self, payload: &[u8]) -> Result<usize, SharedError> {
        self.session.send(payload).await
    }

    fn request_next_endpoint(&self) -> bool {
        self.session.request_next_endpoint()
    }

    fn events(&self) -> Option<UnboundedReceiver<ClientEvent>> {
        self.session.events()
    }

    fn set_receive_handler(&self, handler: Option<Arc<dyn ReceiveHandler>>) {
        self.session.set_receive_handler(handler)
    }

    fn state(&self) -> ConnectionState {
        self.session.state()
    }

    fn statistics(&self) -> ConnectionStats {
        self.session.statistics()
    }

    fn server_uri(&self) -> String {
        Client::server_uri(self)
    }

    fn status(&self) -> String {
        Client::status(self)
    }
}

/// Build a client for the transport named by the descriptor's `protocol` key.
pub fn create(descriptor: &str) -> Result<Box<dyn CommunicationClient>, ConfigError> {
    create_with_config(descriptor, ClientConfig::default())
}

/// Like [`create`], starting from `config` instead of the defaults.
pub fn create_with_config(descriptor: &str, config: ClientConfig) -> Result<Box<dyn CommunicationClient>, ConfigError> {
    let mut settings = parse_settings(descriptor);
    let protocol = settings
        .remove("protocol")
        .ok_or_else(|| ConfigError::MissingField("protocol".to_string()))?;

    match protocol.trim().to_ascii_lowercase().as_str() {
        "tcp" => {
            let transport = TcpTransport::from_settings(&settings)?;
            Ok(Box::new(Client::from_settings(transport, settings, config)?))
        }
        "file" => {
            let transport = FileTransport::from_settings(&settings)?;
            Ok(Box::new(Client::from_settings(transport, settings, config)?))
        }
        _ => Err(ConfigError::UnknownProtocol(protocol)),
    }
}
