//! Client configuration
//!
//! Values are layered: defaults, then an optional TOML file, then
//! `LINKWIRE_*` environment variables, then overrides carried in the
//! connection descriptor itself.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::buffer::DEFAULT_RECEIVE_BUFFER_SIZE;
use crate::endpoint::Settings;
use crate::errors::ConfigError;
use crate::framing::{ByteOrder, FrameCodec, DEFAULT_MARKER, DEFAULT_MAX_PAYLOAD_SIZE};

/// Default pause between connection attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Default time `disconnect()` waits for the read loop.
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const MIN_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Session settings shared by every transport kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Preserve message boundaries with marker + length framing
    pub payload_aware: bool,
    /// Marker as hex, e.g. "AABBCCDD"; empty disables marker checks
    pub payload_marker: String,
    pub payload_byte_order: ByteOrder,
    /// `None` retries forever
    pub max_connection_attempts: Option<u32>,
    pub retry_interval_ms: u64,
    pub receive_buffer_size: usize,
    pub max_payload_size: usize,
    pub disconnect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            payload_aware: false,
            payload_marker: hex::encode_upper(DEFAULT_MARKER),
            payload_byte_order: ByteOrder::LittleEndian,
            max_connection_attempts: None,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL.as_millis() as u64,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            disconnect_timeout_ms: DEFAULT_DISCONNECT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with `LINKWIRE_CONFIG` (TOML path) and `LINKWIRE_*` variables
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("LINKWIRE_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        let mut settings = Settings::default();
        for (var, key) in [
            ("LINKWIRE_PAYLOAD_AWARE", "payloadAware"),
            ("LINKWIRE_PAYLOAD_MARKER", "payloadMarker"),
            ("LINKWIRE_PAYLOAD_ENDIAN_ORDER", "payloadEndianOrder"),
            ("LINKWIRE_MAX_CONNECTION_ATTEMPTS", "maxConnectionAttempts"),
            ("LINKWIRE_RETRY_INTERVAL", "retryInterval"),
            ("LINKWIRE_RECEIVE_BUFFER_SIZE", "receiveBufferSize"),
            ("LINKWIRE_MAX_PAYLOAD_SIZE", "maxPayloadSize"),
            ("LINKWIRE_DISCONNECT_TIMEOUT", "disconnectTimeout"),
        ] {
            if let Ok(value) = std::env::var(var) {
                settings.insert(key, value);
            }
        }
        self.apply_settings(&settings)
    }

    /// Apply recognised keys from a parsed connection descriptor.
    pub fn apply_settings(&mut self, settings: &Settings) -> Result<(), ConfigError> {
        if let Some(flag) = settings.flag("payloadAware")? {
            self.payload_aware = flag;
        }
        if let Some(marker) = settings.get("payloadMarker") {
            decode_marker(marker)?;
            self.payload_marker = marker.trim().to_string();
        }
        if let Some(order) = settings.non_empty("payloadEndianOrder") {
            self.payload_byte_order = match order.trim().to_ascii_lowercase().as_str() {
                "littleendian" | "little" | "le" => ByteOrder::LittleEndian,
                "bigendian" | "big" | "be" => ByteOrder::BigEndian,
                other => {
                    return Err(ConfigError::invalid(
                        "payloadEndianOrder",
                        format!("'{}' is not a byte order", other),
                    ))
                }
            };
        }
        if let Some(attempts) = settings.number::<i64>("maxConnectionAttempts")? {
            // Anything below one means "retry forever".
            self.max_connection_attempts = u32::try_from(attempts).ok().filter(|a| *a >= 1);
        }
        if let Some(ms) = settings.number("retryInterval")? {
            self.retry_interval_ms = ms;
        }
        if let Some(size) = settings.number("receiveBufferSize")? {
            self.receive_buffer_size = size;
        }
        if let Some(size) = settings.number("maxPayloadSize")? {
            self.max_payload_size = size;
        }
        if let Some(ms) = settings.number("disconnectTimeout")? {
            self.disconnect_timeout_ms = ms;
        }
        self.validate()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.receive_buffer_size == 0 {
            return Err(ConfigError::invalid("receiveBufferSize", "must be > 0"));
        }
        if self.max_payload_size == 0 {
            return Err(ConfigError::invalid("maxPayloadSize", "must be > 0"));
        }
        decode_marker(&self.payload_marker)?;
        Ok(())
    }

    /// Codec built from the framing settings.
    pub fn codec(&self) -> Result<FrameCodec, ConfigError> {
        let marker = decode_marker(&self.payload_marker)?;
        Ok(FrameCodec::new(marker, self.payload_byte_order).with_max_payload_size(self.max_payload_size))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Disconnect wait, clamped to 5..=15 seconds.
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms).clamp(MIN_DISCONNECT_TIMEOUT, MAX_DISCONNECT_TIMEOUT)
    }

    pub fn with_payload_aware(mut self, enabled: bool) -> Self {
        self.payload_aware = enabled;
        self
    }

    pub fn with_max_connection_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_connection_attempts = attempts.filter(|a| *a >= 1);
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }
}

fn decode_marker(raw: &str) -> Result<Vec<u8>, ConfigError> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    hex::decode(&cleaned).map_err(|e| ConfigError::invalid("payloadMarker", e.to_string()))
}
