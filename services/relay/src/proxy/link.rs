//! Live transport handles owned by backends.
//!
//! A [`Link`] is the capability a backend needs from its transport: write one
//! unit, report whether it is still open, and signal when it closes. Stream
//! links wrap a TCP or Unix-domain connection; datagram links wrap a connected
//! UDP socket.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::endpoint::TransportKind;

/// Boxed link as stored by a backend.
pub type BoxLink = Box<dyn Link>;

/// Transport capability implemented per transport kind.
#[async_trait]
pub trait Link: Send + Sync {
    /// Transport kind of this link.
    fn kind(&self) -> TransportKind;

    /// Whether the link can still carry writes.
    fn is_open(&self) -> bool;

    /// Write one unit (a chunk for streams, a datagram for UDP).
    async fn write(&self, buf: &[u8]) -> io::Result<()>;

    /// Resolves once the link has closed. Never resolves for datagram links.
    async fn closed(&self);
}

/// Open/closed flag shared between a link and its background tasks.
#[derive(Debug, Clone)]
pub(crate) struct OpenFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl OpenFlag {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn close(&self) {
        self.tx.send_replace(false);
    }

    pub(crate) async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only errors on drop.
        let _ = rx.wait_for(|open| !*open).await;
    }
}

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Stream link over any duplex byte stream.
///
/// The write half is shared: concurrent inbound connections interleave at
/// chunk granularity. The read half is drained in a background task that
/// closes the link on EOF or error; backend replies are discarded.
pub struct StreamLink {
    writer: Mutex<BoxWriter>,
    open: OpenFlag,
}

impl StreamLink {
    /// Wrap a connected stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let open = OpenFlag::new();

        tokio::spawn(drain(read_half, open.clone()));

        Self {
            writer: Mutex::new(Box::new(write_half) as BoxWriter),
            open,
        }
    }
}

impl Drop for StreamLink {
    fn drop(&mut self) {
        // Stops the drain task so the connection is released.
        self.open.close();
    }
}

async fn drain<R: AsyncRead + Unpin>(mut read_half: R, open: OpenFlag) {
    let mut buf = vec![0u8; 8192];
    loop {
        tokio::select! {
            read = read_half.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("Backend closed connection");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!(error = %e, "Backend read error");
                    break;
                }
            },
            _ = open.closed() => return,
        }
    }
    open.close();
}

#[async_trait]
impl Link for StreamLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn is_open(&self) -> bool {
        self.open.is_open()
    }

    async fn write(&self, buf: &[u8]) -> io::Result<()> {
        if !self.open.is_open() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "link closed"));
        }

        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(buf).await?;
            writer.flush().await
        }
        .await;

        if result.is_err() {
            self.open.close();
        }
        result
    }

    async fn closed(&self) {
        self.open.closed().await
    }
}

/// Datagram link over a connected UDP socket.
pub struct DatagramLink {
    socket: UdpSocket,
}

impl DatagramLink {
    /// Wrap a UDP socket already connected to its peer.
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }

    /// Local address of the underlying socket.
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl Link for DatagramLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn is_open(&self) -> bool {
        true
    }

    async fn write(&self, buf: &[u8]) -> io::Result<()> {
        let sent = self.socket.send(buf).await?;
        if sent != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short datagram send: {} of {} bytes", sent, buf.len()),
            ));
        }
        Ok(())
    }

    async fn closed(&self) {
        std::future::pending::<()>().await
    }
}
