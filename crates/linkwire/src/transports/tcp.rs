//! TCP stream transport.

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket};
use tracing::debug;

use crate::endpoint::{Endpoint, Settings};
use crate::errors::ConfigError;
use crate::traits::{Transport, TransportKind};

/// Connects to `host:port` endpoints over TCP.
#[derive(Clone, Debug)]
pub struct TcpTransport {
    no_delay: bool,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self { no_delay: false }
    }

    /// Disable Nagle's algorithm on connected sockets
    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    /// Transport options from a descriptor (`noDelay`).
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self::new().with_no_delay(settings.flag("noDelay")?.unwrap_or(false)))
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_interface(interface: &str) -> io::Result<IpAddr> {
    let literal = interface.trim().trim_start_matches('[').trim_end_matches(']');
    literal.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interface '{}' is not an IP address", interface),
        )
    })
}

#[async_trait]
impl Transport for TcpTransport {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn connect(&self, endpoint: &Endpoint, interface: Option<&str>) -> io::Result<(OwnedReadHalf, OwnedWriteHalf)> {
        let bind = interface
            .filter(|i| !i.trim().is_empty())
            .map(parse_interface)
            .transpose()?;

        let candidates = lookup_host((endpoint.host.as_str(), endpoint.port))
            .await?
            .filter(|addr| endpoint.family.matches(&addr.ip()));

        let mut last_error = None;
        for addr in candidates {
            let socket = match addr {
                SocketAddr::V4(_) => TcpSocket::new_v4()?,
                SocketAddr::V6(_) => TcpSocket::new_v6()?,
            };
            if let Some(local) = bind.filter(|ip| ip.is_ipv4() == addr.is_ipv4()) {
                socket.bind(SocketAddr::new(local, 0))?;
            }

            debug!(%addr, "tcp connect");
            match socket.connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(self.no_delay)?;
                    return Ok(stream.into_split());
                }
                Err(err) => last_error = Some(err),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {:?} address found for {}", endpoint.family, endpoint),
            )
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{parse_settings, AddressFamily};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_no_delay_from_settings() {
        let transport = TcpTransport::from_settings(&parse_settings("server=a:1; noDelay=true")).unwrap();
        assert!(transport.no_delay);
        assert!(TcpTransport::from_settings(&parse_settings("noDelay=maybe")).is_err());
    }

    #[test]
    fn test_parse_interface() {
        assert!(parse_interface("0.0.0.0").unwrap().is_ipv4());
        assert!(parse_interface("[::1]").unwrap().is_ipv6());
        assert!(parse_interface("eth0").is_err());
    }

    #[tokio::test]
    async fn test_connect_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let endpoint = Endpoint::new("127.0.0.1", port, AddressFamily::IPv4);
        let (_reader, mut writer) = TcpTransport::new()
            .with_no_delay(true)
            .connect(&endpoint, Some("127.0.0.1"))
            .await
            .unwrap();
        writer.write_all(b"ping").await.unwrap();

        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_family_filter_leaves_no_candidates() {
        let endpoint = Endpoint::new("127.0.0.1", 9, AddressFamily::IPv6);
        let err = TcpTransport::new().connect(&endpoint, None).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
    }
}
