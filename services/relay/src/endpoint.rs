//! Endpoint addresses and transport kinds.
//!
//! Backend addresses come from configuration as strings:
//! - `tcp://host:port`
//! - `udp://host:port`
//! - a bare filesystem path (Unix-domain stream socket)

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::RelayError;

/// How bytes move over a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Connection-oriented byte stream (TCP, Unix-domain).
    Stream,
    /// Connectionless datagrams (UDP).
    Datagram,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => f.write_str("stream"),
            TransportKind::Datagram => f.write_str("datagram"),
        }
    }
}

/// A parsed endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Udp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl Endpoint {
    /// Transport kind of this endpoint.
    pub fn transport_kind(&self) -> TransportKind {
        match self {
            Endpoint::Tcp { .. } | Endpoint::Unix { .. } => TransportKind::Stream,
            Endpoint::Udp { .. } => TransportKind::Datagram,
        }
    }
}

impl FromStr for Endpoint {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(RelayError::invalid_address(s, "empty address"));
        }

        if let Some(rest) = raw.strip_prefix("tcp://") {
            let (host, port) = split_host_port(s, rest)?;
            return Ok(Endpoint::Tcp { host, port });
        }

        if let Some(rest) = raw.strip_prefix("udp://") {
            let (host, port) = split_host_port(s, rest)?;
            return Ok(Endpoint::Udp { host, port });
        }

        if let Some((scheme, _)) = raw.split_once("://") {
            return Err(RelayError::invalid_address(
                s,
                format!("unsupported scheme {:?}", scheme),
            ));
        }

        Ok(Endpoint::Unix {
            path: PathBuf::from(raw),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Endpoint::Udp { host, port } => write!(f, "udp://{}:{}", host, port),
            Endpoint::Unix { path } => write!(f, "{}", path.display()),
        }
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts (`[::1]:9000`).
fn split_host_port(address: &str, rest: &str) -> Result<(String, u16), RelayError> {
    let Some((host, port)) = rest.rsplit_once(':') else {
        return Err(RelayError::invalid_address(address, "missing port"));
    };

    if host.is_empty() || host == "[]" {
        return Err(RelayError::invalid_address(address, "missing host"));
    }

    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(RelayError::invalid_address(
            address,
            "IPv6 hosts must be bracketed",
        ));
    }

    let port: u16 = port
        .parse()
        .map_err(|_| RelayError::invalid_address(address, format!("invalid port {:?}", port)))?;

    if port == 0 {
        return Err(RelayError::invalid_address(address, "port must be non-zero"));
    }

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_tcp() {
        let endpoint: Endpoint = "tcp://127.0.0.1:9000".parse().unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: 9000
            }
        );
        assert_eq!(endpoint.transport_kind(), TransportKind::Stream);
    }

    #[test]
    fn test_parse_udp_ipv6() {
        let endpoint: Endpoint = "udp://[::1]:8125".parse().unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Udp {
                host: "[::1]".to_string(),
                port: 8125
            }
        );
        assert_eq!(endpoint.transport_kind(), TransportKind::Datagram);
    }

    #[test]
    fn test_parse_unix_path() {
        let endpoint: Endpoint = "/var/run/sink.sock".parse().unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Unix {
                path: PathBuf::from("/var/run/sink.sock")
            }
        );
        assert_eq!(endpoint.transport_kind(), TransportKind::Stream);
    }

    #[rstest]
    #[case("tcp://localhost:9000")]
    #[case("udp://10.0.0.1:53")]
    #[case("/tmp/relay.sock")]
    fn test_display_matches_config_string(#[case] raw: &str) {
        let endpoint: Endpoint = raw.parse().unwrap();
        assert_eq!(endpoint.to_string(), raw);
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("tcp://localhost")]
    #[case("tcp://:9000")]
    #[case("tcp://localhost:notaport")]
    #[case("udp://localhost:70000")]
    #[case("udp://localhost:0")]
    #[case("tcp://::1:9000")]
    #[case("http://example.com:80")]
    fn test_parse_rejects_malformed(#[case] raw: &str) {
        let err = raw.parse::<Endpoint>().unwrap_err();
        assert!(matches!(err, RelayError::InvalidAddress { .. }));
    }

    #[test]
    fn test_serialize_as_string() {
        let endpoint: Endpoint = "udp://127.0.0.1:8125".parse().unwrap();
        let json = serde_json::to_string(&endpoint).unwrap();
        assert_eq!(json, "\"udp://127.0.0.1:8125\"");
    }
}
