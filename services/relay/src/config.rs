//! Relay configuration.
//!
//! Env-driven, loaded once at startup. Malformed values fail fast.

use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Serialize, Serializer};

use crate::endpoint::Endpoint;
use crate::error::RelayError;
use crate::proxy::{ListenerSpec, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_CONNECTIONS};

/// Default supervisor interval.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Default admin listener address.
pub const DEFAULT_ADMIN_ADDR: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 8126);

/// Character encoding of forwarded payloads.
///
/// Text encodings are line-oriented: datagram sends drop one trailing line
/// terminator. `Binary` relays bytes untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Ascii,
    Latin1,
    Binary,
}

impl Encoding {
    pub fn is_text(self) -> bool {
        !matches!(self, Encoding::Binary)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Ascii => "ascii",
            Encoding::Latin1 => "latin1",
            Encoding::Binary => "binary",
        }
    }
}

impl FromStr for Encoding {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "ascii" => Ok(Encoding::Ascii),
            "latin1" | "latin-1" => Ok(Encoding::Latin1),
            "binary" | "raw" => Ok(Encoding::Binary),
            other => Err(RelayError::Config(format!("unknown encoding {:?}", other))),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Encoding {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Relay configuration (env-driven).
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Ordered backend destinations; earlier entries are preferred.
    pub backends: Vec<Endpoint>,

    /// TCP data listener.
    pub tcp_listen: Option<SocketAddr>,

    /// Unix-domain data listener.
    pub unix_listen: Option<PathBuf>,

    /// UDP data listener.
    pub udp_listen: Option<SocketAddr>,

    /// Admin channel listener.
    pub admin_listen: SocketAddr,

    /// Interval between reconnect sweeps.
    #[serde(rename = "reconnect_interval_ms", serialize_with = "as_millis")]
    pub reconnect_interval: Duration,

    /// Backend connect timeout.
    #[serde(rename = "connect_timeout_ms", serialize_with = "as_millis")]
    pub connect_timeout: Duration,

    /// Payload encoding for datagram trimming.
    pub encoding: Encoding,

    /// Max concurrent connections per stream listener.
    pub max_connections: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

fn as_millis<S: Serializer>(d: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(d.as_millis() as u64)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_backends = get("RELAY_BACKENDS")
            .context("Missing backends. Set RELAY_BACKENDS to a comma-separated address list.")?;
        let backends = parse_backends(&raw_backends)?;

        let tcp_listen = get("RELAY_TCP_LISTEN")
            .map(|v| parse_bind(&v))
            .transpose()
            .context("RELAY_TCP_LISTEN must be host:port or a port number.")?;

        let unix_listen = get("RELAY_UNIX_LISTEN")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let udp_listen = get("RELAY_UDP_LISTEN")
            .map(|v| parse_bind(&v))
            .transpose()
            .context("RELAY_UDP_LISTEN must be host:port or a port number.")?;

        if tcp_listen.is_none() && unix_listen.is_none() && udp_listen.is_none() {
            bail!(
                "No listeners configured. Set RELAY_TCP_LISTEN, RELAY_UNIX_LISTEN or RELAY_UDP_LISTEN."
            );
        }

        let admin_listen = get("RELAY_ADMIN_LISTEN")
            .map(|v| parse_bind(&v))
            .transpose()
            .context("RELAY_ADMIN_LISTEN must be host:port or a port number.")?
            .unwrap_or(DEFAULT_ADMIN_ADDR);

        let reconnect_interval = parse_millis(&get, "RELAY_RECONNECT_INTERVAL_MS")?
            .unwrap_or(DEFAULT_RECONNECT_INTERVAL);

        let connect_timeout =
            parse_millis(&get, "RELAY_CONNECT_TIMEOUT_MS")?.unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        let encoding = get("RELAY_ENCODING")
            .map(|v| v.parse::<Encoding>())
            .transpose()?
            .unwrap_or_default();

        let max_connections: usize = get("RELAY_MAX_CONNECTIONS")
            .map(|v| v.trim().parse())
            .transpose()
            .context("RELAY_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let log_level = get("RELAY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            backends,
            tcp_listen,
            unix_listen,
            udp_listen,
            admin_listen,
            reconnect_interval,
            connect_timeout,
            encoding,
            max_connections,
            log_level,
        })
    }

    /// Data listeners to bind, in a fixed order (TCP, Unix, UDP).
    pub fn listeners(&self) -> Vec<ListenerSpec> {
        let mut specs = Vec::new();
        if let Some(addr) = self.tcp_listen {
            specs.push(ListenerSpec::Tcp(addr));
        }
        if let Some(path) = &self.unix_listen {
            specs.push(ListenerSpec::Unix(path.clone()));
        }
        if let Some(addr) = self.udp_listen {
            specs.push(ListenerSpec::Udp(addr));
        }
        specs
    }
}

/// Parse the ordered backend list, rejecting malformed and duplicate entries.
pub fn parse_backends(raw: &str) -> Result<Vec<Endpoint>, RelayError> {
    let mut seen = HashSet::new();
    let mut backends = Vec::new();

    for entry in raw.split(',') {
        let endpoint: Endpoint = entry.parse()?;
        if !seen.insert(endpoint.to_string()) {
            return Err(RelayError::Config(format!(
                "duplicate backend {}",
                endpoint
            )));
        }
        backends.push(endpoint);
    }

    if backends.is_empty() {
        return Err(RelayError::Config("no backends configured".to_string()));
    }

    Ok(backends)
}

/// `host:port`, or a bare port bound on all IPv4 interfaces.
fn parse_bind(raw: &str) -> Result<SocketAddr, RelayError> {
    let raw = raw.trim();
    if let Ok(port) = raw.parse::<u16>() {
        return Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    }
    raw.parse()
        .map_err(|_| RelayError::invalid_address(raw, "expected host:port or a port number"))
}

fn parse_millis<F>(get: &F, key: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    let millis: Option<u64> = get(key)
        .map(|v| v.trim().parse())
        .transpose()
        .with_context(|| format!("{} must be an integer (milliseconds).", key))?;

    Ok(millis.map(|ms| Duration::from_millis(ms.max(50))))
}
