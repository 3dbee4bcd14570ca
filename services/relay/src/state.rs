//! Process-wide relay state.
//!
//! `RelayState` is the single ownership root for the backend set and the
//! aggregate statistics. It is built once at startup and handed to every
//! component as an `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::endpoint::{Endpoint, TransportKind};
use crate::proxy::{router, Backend, BackendOptions, ListenerKind};

/// Aggregate counters updated by listeners and bridges.
#[derive(Debug)]
pub struct RelayStats {
    started_at: DateTime<Utc>,
    tcp_connections: AtomicU64,
    unix_connections: AtomicU64,
    udp_datagrams: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    bytes_forwarded: AtomicU64,
    last_activity: Mutex<Option<DateTime<Utc>>>,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            tcp_connections: AtomicU64::new(0),
            unix_connections: AtomicU64::new(0),
            udp_datagrams: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            bytes_forwarded: AtomicU64::new(0),
            last_activity: Mutex::new(None),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Count one accepted connection or received datagram.
    pub fn record_accepted(&self, kind: ListenerKind) {
        let counter = match kind {
            ListenerKind::Tcp => &self.tcp_connections,
            ListenerKind::Unix => &self.unix_connections,
            ListenerKind::Udp => &self.udp_datagrams,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accepted(&self, kind: ListenerKind) -> u64 {
        match kind {
            ListenerKind::Tcp => self.tcp_connections.load(Ordering::Relaxed),
            ListenerKind::Unix => self.unix_connections.load(Ordering::Relaxed),
            ListenerKind::Udp => self.udp_datagrams.load(Ordering::Relaxed),
        }
    }

    /// Count a connection refused by the listener's concurrency cap.
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an inbound unit dropped because no backend was usable.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Record forwarded bytes and bump the last-activity timestamp.
    pub fn record_forwarded(&self, bytes: u64) {
        self.bytes_forwarded.fetch_add(bytes, Ordering::Relaxed);
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    pub fn bytes_forwarded(&self) -> u64 {
        self.bytes_forwarded.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared relay state: the ordered backend set plus aggregate stats.
#[derive(Debug)]
pub struct RelayState {
    backends: Vec<Arc<Backend>>,
    stats: RelayStats,
}

impl RelayState {
    /// Wrap an already-built backend set.
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self {
            backends,
            stats: RelayStats::new(),
        }
    }

    /// Create and start connecting one backend per endpoint, preserving order.
    pub async fn connect(endpoints: &[Endpoint], options: BackendOptions) -> Self {
        let mut backends = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            backends.push(Backend::connect(endpoint.clone(), options.clone()).await);
        }
        Self::new(backends)
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Select the first usable backend in configured order.
    pub fn select(&self) -> Option<Arc<Backend>> {
        router::select(&self.backends)
    }

    /// Point-in-time view for the admin `stats` command.
    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Utc::now();
        let started_at = self.stats.started_at();
        let uptime_ms = millis_between(started_at, now);

        let backends = self
            .backends
            .iter()
            .map(|backend| {
                let health = backend.health();
                let idle_from = health.last_sent_at.unwrap_or(started_at);
                BackendSnapshot {
                    name: backend.name().to_string(),
                    transport: backend.transport_kind(),
                    available: health.available,
                    connecting: backend.is_connecting(),
                    last_sent: health.last_sent_at,
                    message_count: health.message_count,
                    state_change_count: health.state_change_count,
                    state_changed_at: health.state_changed_at,
                    idle_ms: millis_between(idle_from, now),
                }
            })
            .collect();

        StatsSnapshot {
            started_at,
            uptime_ms,
            last_activity: self.stats.last_activity(),
            connections: ConnectionCounts {
                tcp: self.stats.accepted(ListenerKind::Tcp),
                unix: self.stats.accepted(ListenerKind::Unix),
                udp: self.stats.accepted(ListenerKind::Udp),
            },
            rejected: self.stats.rejected(),
            dropped: self.stats.dropped(),
            bytes_forwarded: self.stats.bytes_forwarded(),
            backends,
        }
    }
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

/// Serializable stats dump.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_ms: u64,
    pub last_activity: Option<DateTime<Utc>>,
    pub connections: ConnectionCounts,
    pub rejected: u64,
    pub dropped: u64,
    pub bytes_forwarded: u64,
    pub backends: Vec<BackendSnapshot>,
}

/// Accepted inbound units by listener type.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionCounts {
    pub tcp: u64,
    pub unix: u64,
    pub udp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub name: String,
    pub transport: TransportKind,
    pub available: bool,
    pub connecting: bool,
    pub last_sent: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub state_change_count: u64,
    pub state_changed_at: DateTime<Utc>,
    pub idle_ms: u64,
}
