//! Connection establishment for backend endpoints.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpStream, UdpSocket, UnixStream};
use tracing::debug;

use super::link::{BoxLink, DatagramLink, StreamLink};
use crate::endpoint::Endpoint;

/// Dials an endpoint and yields a live link.
///
/// Backends call this from their connect task; timeouts are applied by the
/// caller.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<BoxLink>;
}

/// Connector backed by real sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketConnector;

#[async_trait]
impl Connector for SocketConnector {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<BoxLink> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((unbracket(host), *port)).await?;
                stream.set_nodelay(true)?;
                debug!(endpoint = %endpoint, "TCP link established");
                Ok(Box::new(StreamLink::new(stream)))
            }
            Endpoint::Unix { path } => {
                let stream = UnixStream::connect(path).await?;
                debug!(endpoint = %endpoint, "Unix link established");
                Ok(Box::new(StreamLink::new(stream)))
            }
            Endpoint::Udp { host, port } => {
                let target = resolve_first((unbracket(host), *port)).await?;
                let local: SocketAddr = match target {
                    SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                    SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
                };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(target).await?;
                debug!(endpoint = %endpoint, target = %target, "UDP link established");
                Ok(Box::new(DatagramLink::new(socket)))
            }
        }
    }
}

/// `[::1]` -> `::1`; resolvers expect bare IPv6 literals in (host, port) pairs.
fn unbracket(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

async fn resolve_first(addr: (&str, u16)) -> io::Result<SocketAddr> {
    lookup_host(addr).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no addresses for {}:{}", addr.0, addr.1),
        )
    })
}
