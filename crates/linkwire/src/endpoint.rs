//! Connection descriptor parsing and endpoint selection.
//!
//! A descriptor is a `;`-separated list of `key=value` pairs with
//! case-insensitive keys, e.g. `server=primary:8888,backup:8888; interface=0.0.0.0`.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, UdpSocket};

use crate::errors::ConfigError;
use crate::traits::TransportKind;

/// Network address family preference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    IPv4,
    IPv6,
    #[default]
    Unspecified,
}

impl AddressFamily {
    /// Ask the platform which family to prefer: IPv4 when an IPv4 loopback
    /// socket can be bound, else IPv6, else no preference.
    pub fn platform_default() -> Self {
        if UdpSocket::bind(("127.0.0.1", 0)).is_ok() {
            AddressFamily::IPv4
        } else if UdpSocket::bind((Ipv6Addr::LOCALHOST, 0)).is_ok() {
            AddressFamily::IPv6
        } else {
            AddressFamily::Unspecified
        }
    }

    /// Whether `addr` belongs to this family. `Unspecified` accepts anything.
    pub fn matches(&self, addr: &IpAddr) -> bool {
        match self {
            AddressFamily::IPv4 => addr.is_ipv4(),
            AddressFamily::IPv6 => addr.is_ipv6(),
            AddressFamily::Unspecified => true,
        }
    }
}

/// One candidate remote target.
///
/// File-backed transports store the path in `host` and use port 0.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub family: AddressFamily,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, family: AddressFamily) -> Self {
        Self {
            host: host.into(),
            port,
            family,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Ordered, non-empty endpoint candidates with a round-robin cursor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointList {
    endpoints: Vec<Endpoint>,
    server_index: usize,
}

impl EndpointList {
    /// Build a list; `None` when `endpoints` is empty.
    pub fn new(endpoints: Vec<Endpoint>) -> Option<Self> {
        if endpoints.is_empty() {
            return None;
        }
        Some(Self {
            endpoints,
            server_index: 0,
        })
    }

    pub fn single(endpoint: Endpoint) -> Self {
        Self {
            endpoints: vec![endpoint],
            server_index: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn server_index(&self) -> usize {
        self.server_index
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Endpoint at the cursor.
    pub fn current(&self) -> &Endpoint {
        &self.endpoints[self.server_index]
    }

    /// `protocol://host:port` of the current endpoint, lowercase.
    /// File endpoints render as `file://path` with the path untouched.
    pub fn server_uri(&self, kind: TransportKind) -> String {
        match kind {
            TransportKind::File => format!("{}://{}", kind, self.current().host),
            _ => format!("{}://{}", kind, self.current()).to_lowercase(),
        }
    }
}

/// Parsed descriptor key/value pairs; keys are stored lowercase.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// Value for `key` if present and not blank.
    pub fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_ascii_lowercase(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(&key.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parse an optional boolean setting (`true/false`, `yes/no`, `1/0`).
    pub fn flag(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        let Some(raw) = self.non_empty(key) else {
            return Ok(None);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Ok(Some(true)),
            "false" | "no" | "0" | "off" => Ok(Some(false)),
            other => Err(ConfigError::invalid(key, format!("'{}' is not a boolean", other))),
        }
    }

    /// Parse an optional numeric setting.
    pub fn number<N: std::str::FromStr>(&self, key: &str) -> Result<Option<N>, ConfigError> {
        match self.non_empty(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<N>()
                .map(Some)
                .map_err(|_| ConfigError::invalid(key, format!("'{}' is not a number", raw.trim()))),
        }
    }
}

/// Split a descriptor into key/value pairs.
///
/// Values may be wrapped in braces to contain `;`, e.g. `file={a;b.bin}`.
pub fn parse_settings(descriptor: &str) -> Settings {
    let mut settings = Settings::default();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut pairs = Vec::new();

    for (i, c) in descriptor.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ';' if depth == 0 => {
                pairs.push(&descriptor[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    pairs.push(&descriptor[start..]);

    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim();
        if value.starts_with('{') && value.ends_with('}') && value.len() >= 2 {
            value = &value[1..value.len() - 1];
        }
        settings.insert(key, value);
    }

    settings
}

/// Parse a descriptor into its endpoint candidates.
pub fn parse(descriptor: &str) -> Result<EndpointList, ConfigError> {
    parse_endpoints(&parse_settings(descriptor))
}

/// Build the endpoint list from already-parsed settings.
pub fn parse_endpoints(settings: &Settings) -> Result<EndpointList, ConfigError> {
    let server = settings
        .non_empty("server")
        .ok_or_else(|| ConfigError::MissingField("server".to_string()))?;

    // Legacy form: server=host; port=N
    let server = match settings.non_empty("port") {
        Some(port) if !server.contains(',') => format!("{}:{}", server.trim(), port.trim()),
        _ => server.to_string(),
    };

    let family = resolve_family(AddressFamily::Unspecified, settings.get("interface"));

    let endpoints = server
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| parse_entry(entry, family))
        .collect::<Result<Vec<_>, _>>()?;

    EndpointList::new(endpoints).ok_or_else(|| ConfigError::MissingField("server".to_string()))
}

fn parse_entry(entry: &str, family: AddressFamily) -> Result<Endpoint, ConfigError> {
    let malformed = || ConfigError::MalformedEndpoint(entry.to_string());

    let (host, port) = entry.rsplit_once(':').ok_or_else(malformed)?;
    let host = host.trim();
    let port = port.trim();

    if host.is_empty() || port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }

    let port: u16 = match port.parse::<u64>() {
        Ok(value) if value <= u64::from(u16::MAX) => value as u16,
        _ => return Err(ConfigError::PortOutOfRange(port.to_string())),
    };

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    Ok(Endpoint::new(host, port, family))
}

/// Pick the address family for outbound sockets.
///
/// Literal inference is syntactic only: a well-formed but unreachable
/// address never causes a failure here.
pub fn resolve_family(preferred: AddressFamily, interface: Option<&str>) -> AddressFamily {
    if let Some(interface) = interface.map(str::trim).filter(|i| !i.is_empty()) {
        let literal = interface.trim_start_matches('[').trim_end_matches(']');
        return if literal.parse::<Ipv6Addr>().is_ok() {
            AddressFamily::IPv6
        } else {
            AddressFamily::IPv4
        };
    }

    match preferred {
        AddressFamily::Unspecified => AddressFamily::platform_default(),
        explicit => explicit,
    }
}

/// Move the cursor to the next endpoint.
///
/// Returns `false` without touching the list when there is only one
/// candidate.
pub fn advance(list: &mut EndpointList) -> bool {
    if list.endpoints.len() < 2 {
        return false;
    }
    list.server_index = (list.server_index + 1) % list.endpoints.len();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_multiple_servers_in_order() {
        let list = parse("server=a:1,b:2,c:3").unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.server_index(), 0);
        let hosts: Vec<_> = list.endpoints().iter().map(|e| (e.host.as_str(), e.port)).collect();
        assert_eq!(hosts, vec![("a", 1), ("b", 2), ("c", 3)]);
    }

    #[test]
    fn test_advance_wraps_around() {
        let mut list = parse("server=a:1,b:2,c:3").unwrap();
        assert!(advance(&mut list));
        assert!(advance(&mut list));
        assert_eq!(list.current().host, "c");
        assert!(advance(&mut list));
        assert_eq!(list.server_index(), 0);
    }

    #[test]
    fn test_advance_single_endpoint_is_noop() {
        let mut list = parse("server=a:1").unwrap();
        assert!(!advance(&mut list));
        assert_eq!(list.server_index(), 0);
    }

    #[test]
    fn test_missing_port_is_malformed() {
        assert!(matches!(parse("server=localhost"), Err(ConfigError::MalformedEndpoint(_))));
        assert!(matches!(parse("server=localhost:abc"), Err(ConfigError::MalformedEndpoint(_))));
    }

    #[test]
    fn test_missing_server() {
        assert!(matches!(parse(""), Err(ConfigError::MissingField(_))));
        assert!(matches!(parse("server=  ; interface=0.0.0.0"), Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_port_out_of_range() {
        assert!(matches!(parse("server=localhost:70000"), Err(ConfigError::PortOutOfRange(_))));
        assert!(matches!(
            parse("server=localhost:99999999999999999999999"),
            Err(ConfigError::PortOutOfRange(_))
        ));
    }

    #[test]
    fn test_legacy_port_key() {
        let list = parse("Server = example.org ; PORT=8888").unwrap();
        assert_eq!(list.current().host, "example.org");
        assert_eq!(list.current().port, 8888);
    }

    #[test]
    fn test_legacy_port_ignored_for_lists() {
        let list = parse("server=a:1,b:2; port=9").unwrap();
        assert_eq!(list.endpoints()[1].port, 2);
    }

    #[test]
    fn test_ipv6_hosts() {
        let list = parse("server=[::1]:8888, fe80::1:9000").unwrap();
        assert_eq!(list.endpoints()[0].host, "::1");
        assert_eq!(list.endpoints()[1].host, "fe80::1");
        assert_eq!(list.endpoints()[1].port, 9000);
        assert_eq!(list.endpoints()[0].to_string(), "[::1]:8888");
    }

    #[test]
    fn test_interface_drives_family() {
        let list = parse("server=a:1; interface=::").unwrap();
        assert_eq!(list.current().family, AddressFamily::IPv6);
        let list = parse("server=a:1; interface=10.0.0.1").unwrap();
        assert_eq!(list.current().family, AddressFamily::IPv4);
    }

    #[test]
    fn test_resolve_family_is_syntactic() {
        assert_eq!(resolve_family(AddressFamily::IPv4, Some("2001:db8::1")), AddressFamily::IPv6);
        assert_eq!(resolve_family(AddressFamily::IPv6, Some("192.0.2.1")), AddressFamily::IPv4);
        assert_eq!(resolve_family(AddressFamily::IPv6, None), AddressFamily::IPv6);
        assert_eq!(resolve_family(AddressFamily::IPv4, Some("  ")), AddressFamily::IPv4);
    }

    #[test]
    fn test_settings_braced_values() {
        let settings = parse_settings("file={a;b.bin}; autoRepeat=true");
        assert_eq!(settings.get("FILE"), Some("a;b.bin"));
        assert_eq!(settings.flag("autorepeat").unwrap(), Some(true));
    }

    #[test]
    fn test_settings_bad_flag() {
        let settings = parse_settings("noDelay=maybe");
        assert!(matches!(settings.flag("nodelay"), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_server_uri() {
        let list = parse("server=Example.org:80").unwrap();
        assert_eq!(list.server_uri(TransportKind::Tcp), "tcp://example.org:80");
    }

    proptest! {
        #[test]
        fn prop_advance_cycles(len in 1usize..20, steps in 0usize..100) {
            let descriptor = format!(
                "server={}",
                (0..len).map(|i| format!("h{}:{}", i, i)).collect::<Vec<_>>().join(",")
            );
            let mut list = parse(&descriptor)?;
            for _ in 0..steps {
                let changed = advance(&mut list);
                prop_assert_eq!(changed, len >= 2);
                prop_assert!(list.server_index() < len);
            }
            let expected = if len >= 2 { steps % len } else { 0 };
            prop_assert_eq!(list.server_index(), expected);
        }
    }
}
