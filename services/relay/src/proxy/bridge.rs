//! Moving bytes from an inbound unit of work to its selected backend.
//!
//! The strategy depends only on the transport pair:
//!
//! ```text
//! inbound   backend    strategy
//! stream    stream     splice (chunked copy into the shared link)
//! stream    datagram   manual forward (one send per read chunk)
//! datagram  any        manual forward (one send per datagram)
//! ```

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use super::backend::Backend;
use crate::config::Encoding;
use crate::endpoint::TransportKind;
use crate::error::RelayError;
use crate::state::RelayStats;

/// Read buffer size for stream inbound connections.
pub const CHUNK_SIZE: usize = 8192;

/// How bytes are moved for a transport pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Copy the stream straight into the backend link.
    Splice,
    /// Read, shape, then `send` each unit through the backend.
    ManualForward,
}

impl Strategy {
    pub fn for_pair(inbound: TransportKind, backend: TransportKind) -> Self {
        match (inbound, backend) {
            (TransportKind::Stream, TransportKind::Stream) => Strategy::Splice,
            _ => Strategy::ManualForward,
        }
    }
}

/// Bridge one inbound stream connection to `backend` until the inbound side
/// closes or a backend write fails.
///
/// Bookkeeping happens per forwarded chunk, so a long-lived connection is
/// visible in `stats` while it is still open. Returns the number of bytes
/// forwarded. The backend link is left open.
pub async fn bridge_stream<R>(
    inbound: &mut R,
    backend: &Backend,
    encoding: Encoding,
    stats: &RelayStats,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
{
    match Strategy::for_pair(TransportKind::Stream, backend.transport_kind()) {
        Strategy::Splice => splice(inbound, backend, stats).await,
        Strategy::ManualForward => forward_stream(inbound, backend, encoding, stats).await,
    }
}

/// Forward one inbound datagram to `backend` as a single send.
pub async fn bridge_datagram(
    packet: &[u8],
    backend: &Backend,
    encoding: Encoding,
    stats: &RelayStats,
) -> Result<u64, RelayError> {
    let unit = shape(packet, encoding, backend.transport_kind());
    if unit.is_empty() {
        return Ok(0);
    }
    backend.send(unit).await?;
    stats.record_forwarded(unit.len() as u64);
    Ok(unit.len() as u64)
}

async fn splice<R>(
    inbound: &mut R,
    backend: &Backend,
    stats: &RelayStats,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
{
    let link = backend
        .link()
        .ok_or_else(|| RelayError::NotConnected(backend.name().to_string()))?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = match inbound.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Inbound read error");
                break;
            }
        };

        link.write(&buf[..n])
            .await
            .map_err(|source| RelayError::Transport {
                backend: backend.name().to_string(),
                source,
            })?;

        // One message per spliced connection; later chunks only refresh the timestamp.
        if total == 0 {
            backend.record_sent();
        } else {
            backend.record_activity();
        }
        total += n as u64;
        stats.record_forwarded(n as u64);
    }

    Ok(total)
}

async fn forward_stream<R>(
    inbound: &mut R,
    backend: &Backend,
    encoding: Encoding,
    stats: &RelayStats,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = match inbound.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Inbound read error");
                break;
            }
        };

        let unit = shape(&buf[..n], encoding, backend.transport_kind());
        if unit.is_empty() {
            continue;
        }
        backend.send(unit).await?;
        total += unit.len() as u64;
        stats.record_forwarded(unit.len() as u64);
    }

    Ok(total)
}

/// Apply text-mode trimming for datagram backends.
fn shape(buf: &[u8], encoding: Encoding, backend: TransportKind) -> &[u8] {
    if encoding.is_text() && backend == TransportKind::Datagram {
        trim_line_terminator(buf)
    } else {
        buf
    }
}

/// Strip exactly one trailing `\n` or `\r\n`.
pub fn trim_line_terminator(buf: &[u8]) -> &[u8] {
    buf.strip_suffix(b"\r\n")
        .or_else(|| buf.strip_suffix(b"\n"))
        .unwrap_or(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use rstest::rstest;
    use tokio::io::AsyncWriteExt;

    use crate::proxy::backend::BackendOptions;
    use crate::proxy::connector::fake::FakeConnector;
    use crate::proxy::connector::Connector;

    async fn backend(connector: &Arc<FakeConnector>, name: &str) -> Arc<Backend> {
        let options = BackendOptions::new()
            .with_timeout(Duration::from_millis(200))
            .with_connector(Arc::clone(connector) as Arc<dyn Connector>);
        let backend = Backend::connect(name.parse().unwrap(), options).await;
        for _ in 0..100 {
            if backend.is_usable() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        backend
    }

    #[test]
    fn test_strategy_table() {
        use TransportKind::*;
        assert_eq!(Strategy::for_pair(Stream, Stream), Strategy::Splice);
        assert_eq!(Strategy::for_pair(Stream, Datagram), Strategy::ManualForward);
        assert_eq!(Strategy::for_pair(Datagram, Stream), Strategy::ManualForward);
        assert_eq!(Strategy::for_pair(Datagram, Datagram), Strategy::ManualForward);
    }

    #[rstest]
    #[case(b"value:1|c\n", b"value:1|c")]
    #[case(b"value:1|c\r\n", b"value:1|c")]
    #[case(b"value:1|c\n\n", b"value:1|c\n")]
    #[case(b"value:1|c", b"value:1|c")]
    #[case(b"\n", b"")]
    #[case(b"", b"")]
    fn test_trim_line_terminator(#[case] input: &[u8], #[case] expected: &[u8]) {
        assert_eq!(trim_line_terminator(input), expected);
    }

    #[rstest]
    #[case(1)]
    #[case(CHUNK_SIZE)]
    #[case(CHUNK_SIZE * 3 + 17)]
    #[tokio::test]
    async fn test_splice_preserves_bytes(#[case] size: usize) {
        let connector = FakeConnector::new();
        let stats = RelayStats::new();
        let backend = backend(&connector, "tcp://a:1").await;

        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let mut inbound = payload.as_slice();

        let forwarded = bridge_stream(&mut inbound, &backend, Encoding::Utf8, &stats)
            .await
            .unwrap();

        assert_eq!(forwarded, size as u64);
        assert_eq!(connector.writes("tcp://a:1").concat(), payload);
        assert_eq!(backend.health().message_count, 1);
        assert_eq!(stats.bytes_forwarded(), size as u64);
        assert!(backend.is_usable());
    }

    #[tokio::test]
    async fn test_splice_never_trims() {
        let connector = FakeConnector::new();
        let stats = RelayStats::new();
        let backend = backend(&connector, "tcp://a:1").await;

        let mut inbound: &[u8] = b"line one\nline two\n";
        bridge_stream(&mut inbound, &backend, Encoding::Utf8, &stats)
            .await
            .unwrap();

        assert_eq!(
            connector.writes("tcp://a:1").concat(),
            b"line one\nline two\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_splice_empty_inbound_counts_nothing() {
        let connector = FakeConnector::new();
        let stats = RelayStats::new();
        let backend = backend(&connector, "tcp://a:1").await;

        let mut inbound: &[u8] = b"";
        let forwarded = bridge_stream(&mut inbound, &backend, Encoding::Utf8, &stats)
            .await
            .unwrap();

        assert_eq!(forwarded, 0);
        assert_eq!(backend.health().message_count, 0);
        assert!(backend.health().last_sent_at.is_none());
    }

    #[tokio::test]
    async fn test_splice_write_failure_terminates() {
        let connector = FakeConnector::new();
        connector.fail_writes("tcp://a:1");
        let stats = RelayStats::new();
        let backend = backend(&connector, "tcp://a:1").await;

        let mut inbound: &[u8] = b"payload";
        let err = bridge_stream(&mut inbound, &backend, Encoding::Binary, &stats)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Transport { .. }));
        // A single failed write does not flip the flag.
        assert!(backend.is_available());
        assert_eq!(stats.bytes_forwarded(), 0);
    }

    #[tokio::test]
    async fn test_splice_counts_chunks_delivered_before_failure() {
        let connector = FakeConnector::new();
        connector.fail_writes_after("tcp://a:1", 2);
        let stats = RelayStats::new();
        let backend = backend(&connector, "tcp://a:1").await;

        let payload = vec![7u8; CHUNK_SIZE * 3];
        let mut inbound = payload.as_slice();
        let err = bridge_stream(&mut inbound, &backend, Encoding::Binary, &stats)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Transport { .. }));
        assert_eq!(stats.bytes_forwarded(), (CHUNK_SIZE * 2) as u64);
        assert!(stats.last_activity().is_some());
        let health = backend.health();
        assert_eq!(health.message_count, 1);
        assert!(health.last_sent_at.is_some());
    }

    #[tokio::test]
    async fn test_splice_records_while_connection_is_open() {
        let connector = FakeConnector::new();
        let stats = Arc::new(RelayStats::new());
        let backend = backend(&connector, "tcp://a:1").await;

        let (mut client, mut inbound) = tokio::io::duplex(64);
        let task = {
            let backend = Arc::clone(&backend);
            let stats = Arc::clone(&stats);
            tokio::spawn(async move {
                bridge_stream(&mut inbound, &backend, Encoding::Utf8, &stats).await
            })
        };

        client.write_all(b"live:1|c\n").await.unwrap();
        for _ in 0..100 {
            if stats.bytes_forwarded() == 9 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(stats.bytes_forwarded(), 9);
        let health = backend.health();
        assert_eq!(health.message_count, 1);
        assert!(health.last_sent_at.is_some());

        client.write_all(b"live:2|c\n").await.unwrap();
        drop(client);
        assert_eq!(task.await.unwrap().unwrap(), 18);
        assert_eq!(backend.health().message_count, 1);
        assert_eq!(stats.bytes_forwarded(), 18);
    }

    #[tokio::test]
    async fn test_stream_to_datagram_sends_per_chunk() {
        let connector = FakeConnector::new();
        let stats = RelayStats::new();
        let backend = backend(&connector, "udp://a:1").await;

        let mut inbound: &[u8] = b"gauge:5|g\n";
        let forwarded = bridge_stream(&mut inbound, &backend, Encoding::Utf8, &stats)
            .await
            .unwrap();

        assert_eq!(forwarded, 9);
        assert_eq!(connector.writes("udp://a:1"), vec![b"gauge:5|g".to_vec()]);
        assert_eq!(backend.health().message_count, 1);
    }

    #[tokio::test]
    async fn test_datagram_text_trimmed_once() {
        let connector = FakeConnector::new();
        let stats = RelayStats::new();
        let backend = backend(&connector, "udp://a:1").await;

        bridge_datagram(b"count:1|c\n", &backend, Encoding::Utf8, &stats)
            .await
            .unwrap();
        bridge_datagram(b"count:2|c\n\n", &backend, Encoding::Ascii, &stats)
            .await
            .unwrap();

        assert_eq!(
            connector.writes("udp://a:1"),
            vec![b"count:1|c".to_vec(), b"count:2|c\n".to_vec()]
        );
        assert_eq!(backend.health().message_count, 2);
    }

    #[tokio::test]
    async fn test_datagram_binary_untouched() {
        let connector = FakeConnector::new();
        let stats = RelayStats::new();
        let backend = backend(&connector, "udp://a:1").await;

        bridge_datagram(b"\x00\x01\n", &backend, Encoding::Binary, &stats)
            .await
            .unwrap();

        assert_eq!(connector.writes("udp://a:1"), vec![b"\x00\x01\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_datagram_to_stream_not_trimmed() {
        let connector = FakeConnector::new();
        let stats = RelayStats::new();
        let backend = backend(&connector, "tcp://a:1").await;

        bridge_datagram(b"event\n", &backend, Encoding::Utf8, &stats)
            .await
            .unwrap();

        assert_eq!(connector.writes("tcp://a:1"), vec![b"event\n".to_vec()]);
        assert_eq!(backend.health().message_count, 1);
    }

    #[tokio::test]
    async fn test_empty_unit_after_trim_not_sent() {
        let connector = FakeConnector::new();
        let stats = RelayStats::new();
        let backend = backend(&connector, "udp://a:1").await;

        let forwarded = bridge_datagram(b"\n", &backend, Encoding::Utf8, &stats)
            .await
            .unwrap();

        assert_eq!(forwarded, 0);
        assert!(connector.writes("udp://a:1").is_empty());
    }
}
