//! Admin channel.
//!
//! Newline-terminated text protocol over its own TCP listener. One command
//! per line, one reply line per command:
//!
//! - `ping` -> `pong`
//! - `stats` -> JSON stats dump
//! - `config` -> JSON effective configuration
//!
//! Failures become `error: ...` replies. The connection stays open.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, Instrument};

use crate::config::Config;
use crate::state::RelayState;

/// Admin command errors.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid utf-8")]
    InvalidUtf8,

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Longest accepted command line, excluding the terminator.
pub const MAX_LINE_LEN: usize = 4096;

/// Decode one raw command line.
pub fn decode_line(raw: &[u8]) -> Result<&str, AdminError> {
    std::str::from_utf8(raw).map_err(|_| AdminError::InvalidUtf8)
}

/// Admin command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping,
    Stats,
    Config,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, AdminError> {
        match line.trim() {
            "ping" => Ok(Command::Ping),
            "stats" => Ok(Command::Stats),
            "config" => Ok(Command::Config),
            other => Err(AdminError::UnknownCommand(other.to_string())),
        }
    }
}

/// Produce the reply body for one command line.
pub fn dispatch(line: &str, state: &RelayState, config: &Config) -> Result<String, AdminError> {
    match Command::parse(line)? {
        Command::Ping => Ok("pong".to_string()),
        Command::Stats => Ok(serde_json::to_string(&state.snapshot())?),
        Command::Config => Ok(serde_json::to_string(config)?),
    }
}

/// Render the reply line for one command, turning errors into error lines.
pub fn reply(line: &str, state: &RelayState, config: &Config) -> String {
    match dispatch(line, state, config) {
        Ok(body) => body,
        Err(e) => {
            debug!(error = %e, "Admin command failed");
            format!("error: {}", e)
        }
    }
}

/// Admin TCP server.
pub struct AdminServer {
    listener: TcpListener,
    state: Arc<RelayState>,
    config: Arc<Config>,
}

impl AdminServer {
    pub async fn bind(
        addr: SocketAddr,
        state: Arc<RelayState>,
        config: Arc<Config>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(bind_addr = %listener.local_addr()?, "Admin listener bound");
        Ok(Self {
            listener,
            state,
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept admin connections until the process exits.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(
                        async move {
                            if let Err(e) = server.handle_connection(stream).await {
                                debug!(error = %e, "Admin connection error");
                            }
                        }
                        .instrument(tracing::info_span!("admin", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Admin accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> io::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut buf = Vec::with_capacity(256);

        loop {
            buf.clear();
            let n = (&mut reader)
                .take(MAX_LINE_LEN as u64 + 1)
                .read_until(b'\n', &mut buf)
                .await?;
            if n == 0 {
                break;
            }

            let mut response = if buf.last() != Some(&b'\n') && buf.len() > MAX_LINE_LEN {
                discard_line(&mut reader).await?;
                format!("error: {}", AdminError::LineTooLong(MAX_LINE_LEN))
            } else {
                match decode_line(&buf) {
                    Ok(line) if line.trim().is_empty() => continue,
                    Ok(line) => reply(line, &self.state, &self.config),
                    Err(e) => format!("error: {}", e),
                }
            };

            response.push('\n');
            write_half.write_all(response.as_bytes()).await?;
        }

        debug!("Admin connection closed");
        Ok(())
    }
}

/// Skip the rest of an oversized line, up to and including its terminator.
async fn discard_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<()> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        if let Some(pos) = available.iter().position(|b| *b == b'\n') {
            reader.consume(pos + 1);
            return Ok(());
        }
        let len = available.len();
        reader.consume(len);
    }
}
