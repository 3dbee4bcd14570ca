//! Inbound listeners.
//!
//! One listener per configured local endpoint:
//! - TCP and Unix listeners accept connections and spawn one task per
//!   connection, which selects a backend once and bridges until EOF
//! - UDP listeners run a single receive loop and route each datagram
//!   independently
//!
//! A bind failure is returned to the caller and is fatal at startup.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, UdpSocket, UnixListener};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use super::bridge;
use crate::config::Encoding;
use crate::endpoint::TransportKind;
use crate::error::RelayError;
use crate::state::RelayState;

/// Default maximum concurrent connections per stream listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Largest datagram the UDP listener receives in one piece.
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Listener type, used for stats attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerKind {
    Tcp,
    Unix,
    Udp,
}

impl ListenerKind {
    pub fn transport_kind(self) -> TransportKind {
        match self {
            ListenerKind::Tcp | ListenerKind::Unix => TransportKind::Stream,
            ListenerKind::Udp => TransportKind::Datagram,
        }
    }
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKind::Tcp => f.write_str("tcp"),
            ListenerKind::Unix => f.write_str("unix"),
            ListenerKind::Udp => f.write_str("udp"),
        }
    }
}

/// A local endpoint to bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerSpec {
    Tcp(SocketAddr),
    Unix(PathBuf),
    Udp(SocketAddr),
}

impl ListenerSpec {
    pub fn kind(&self) -> ListenerKind {
        match self {
            ListenerSpec::Tcp(_) => ListenerKind::Tcp,
            ListenerSpec::Unix(_) => ListenerKind::Unix,
            ListenerSpec::Udp(_) => ListenerKind::Udp,
        }
    }
}

impl fmt::Display for ListenerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerSpec::Tcp(addr) => write!(f, "tcp://{}", addr),
            ListenerSpec::Unix(path) => write!(f, "{}", path.display()),
            ListenerSpec::Udp(addr) => write!(f, "udp://{}", addr),
        }
    }
}

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Endpoint to bind.
    pub spec: ListenerSpec,
    /// Maximum concurrent stream connections.
    pub max_connections: usize,
    /// Payload encoding for datagram trimming.
    pub encoding: Encoding,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(spec: ListenerSpec) -> Self {
        Self {
            spec,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            encoding: Encoding::default(),
        }
    }
}

enum Socket {
    Tcp(TcpListener),
    Unix(UnixListener),
    Udp(UdpSocket),
}

type InboundStream = Box<dyn AsyncRead + Send + Unpin>;

/// A bound inbound listener.
pub struct Listener {
    config: ListenerConfig,
    socket: Socket,
    state: Arc<RelayState>,
    conn_semaphore: Arc<Semaphore>,
}

impl Listener {
    /// Bind the configured endpoint.
    pub async fn bind(
        config: ListenerConfig,
        state: Arc<RelayState>,
    ) -> Result<Self, RelayError> {
        let bind_error = |source: io::Error| RelayError::Bind {
            endpoint: config.spec.to_string(),
            source,
        };

        let socket = match &config.spec {
            ListenerSpec::Tcp(addr) => {
                Socket::Tcp(TcpListener::bind(addr).await.map_err(bind_error)?)
            }
            ListenerSpec::Unix(path) => {
                remove_stale_socket(path).map_err(bind_error)?;
                Socket::Unix(UnixListener::bind(path).map_err(bind_error)?)
            }
            ListenerSpec::Udp(addr) => {
                Socket::Udp(UdpSocket::bind(addr).await.map_err(bind_error)?)
            }
        };

        info!(
            listener = %config.spec,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config,
            socket,
            state,
        })
    }

    pub fn kind(&self) -> ListenerKind {
        self.config.spec.kind()
    }

    /// Bound network address (TCP and UDP listeners only).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.socket {
            Socket::Tcp(listener) => listener.local_addr().ok(),
            Socket::Udp(socket) => socket.local_addr().ok(),
            Socket::Unix(_) => None,
        }
    }

    /// Run the listener until the process exits.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        info!(listener = %self.config.spec, "Listener started");
        match &self.socket {
            Socket::Udp(socket) => self.run_datagram(socket).await,
            Socket::Tcp(_) | Socket::Unix(_) => Arc::clone(&self).run_stream().await,
        }
    }

    async fn accept(&self) -> io::Result<(InboundStream, String)> {
        match &self.socket {
            Socket::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Box::new(stream), peer.to_string()))
            }
            Socket::Unix(listener) => {
                let (stream, peer) = listener.accept().await?;
                let peer = peer
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "unix:unnamed".to_string());
                Ok((Box::new(stream), peer))
            }
            Socket::Udp(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "datagram listener does not accept connections",
            )),
        }
    }

    async fn run_stream(self: Arc<Self>) -> io::Result<()> {
        loop {
            match self.accept().await {
                Ok((stream, peer)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.state.stats().record_rejected();
                            warn!(peer = %peer, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.state.stats().record_accepted(self.kind());

                    let listener = Arc::clone(&self);
                    let span =
                        tracing::info_span!("connection", peer = %peer, listener = %self.kind());
                    tokio::spawn(
                        async move {
                            listener.handle_stream(stream).await;
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_stream(&self, mut stream: InboundStream) {
        let Some(backend) = self.state.select() else {
            self.state.stats().record_dropped();
            warn!("No usable backend, dropping connection");
            return;
        };

        debug!(
            backend = %backend.name(),
            strategy = ?bridge::Strategy::for_pair(
                self.kind().transport_kind(),
                backend.transport_kind()
            ),
            "Bridging connection"
        );

        let stats = self.state.stats();
        match bridge::bridge_stream(&mut stream, &backend, self.config.encoding, stats).await {
            Ok(bytes) => {
                debug!(backend = %backend.name(), bytes, "Connection closed");
            }
            Err(e) => {
                debug!(backend = %backend.name(), error = %e, "Bridge terminated");
            }
        }
    }

    async fn run_datagram(&self, socket: &UdpSocket) -> io::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "Datagram receive error");
                    continue;
                }
            };

            self.state.stats().record_accepted(ListenerKind::Udp);

            let Some(backend) = self.state.select() else {
                self.state.stats().record_dropped();
                debug!(peer = %peer, bytes = n, "No usable backend, dropping datagram");
                continue;
            };

            let stats = self.state.stats();
            if let Err(e) =
                bridge::bridge_datagram(&buf[..n], &backend, self.config.encoding, stats).await
            {
                debug!(
                    peer = %peer,
                    backend = %backend.name(),
                    error = %e,
                    "Datagram forward failed"
                );
            }
        }
    }
}

/// Remove a leftover socket file from a previous run. Regular files are left
/// in place so the bind fails instead of clobbering them.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!(path = %path.display(), "Removing stale socket file");
            std::fs::remove_file(path)
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
