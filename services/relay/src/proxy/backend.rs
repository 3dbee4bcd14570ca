//! Backend health tracking and connection lifecycle.
//!
//! A backend is one configured destination. It owns its live link and the
//! health/usage fields the router and the admin channel read.
//!
//! - Stream backends start unavailable and become available once the connect
//!   task completes the handshake.
//! - Datagram backends start available; there is no handshake.
//! - The availability flag only moves through `mark_available` /
//!   `mark_unavailable`, which update the timestamp and counter under the
//!   same lock.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::connector::{Connector, SocketConnector};
use super::link::BoxLink;
use crate::endpoint::{Endpoint, TransportKind};
use crate::error::RelayError;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Options shared by every backend in a relay.
#[derive(Clone)]
pub struct BackendOptions {
    /// Connect timeout for stream handshakes and datagram socket setup.
    pub connect_timeout: Duration,
    /// Connector used to dial endpoints.
    pub connector: Arc<dyn Connector>,
}

impl BackendOptions {
    /// Options using real sockets and the default timeout.
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connector: Arc::new(SocketConnector),
        }
    }

    /// Override the connect timeout.
    pub fn with_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Override the connector.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Health and usage fields of a backend.
///
/// Returned by [`Backend::health`] as a consistent copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub available: bool,
    pub state_changed_at: DateTime<Utc>,
    pub state_change_count: u64,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub message_count: u64,
}

/// A configured backend destination.
pub struct Backend {
    name: String,
    endpoint: Endpoint,
    health: Mutex<Health>,
    link: ArcSwapOption<BoxLink>,
    /// Set while a connect attempt is in flight.
    connecting: AtomicBool,
    connect_attempts: AtomicU64,
    options: BackendOptions,
}

impl Backend {
    fn new(endpoint: Endpoint, options: BackendOptions) -> Self {
        let available = endpoint.transport_kind() == TransportKind::Datagram;
        Self {
            name: endpoint.to_string(),
            endpoint,
            health: Mutex::new(Health {
                available,
                state_changed_at: Utc::now(),
                state_change_count: 0,
                last_sent_at: None,
                message_count: 0,
            }),
            link: ArcSwapOption::empty(),
            connecting: AtomicBool::new(false),
            connect_attempts: AtomicU64::new(0),
            options,
        }
    }

    /// Create a backend and start connecting it.
    ///
    /// Never fails: connect errors leave the backend unavailable for the
    /// supervisor to retry. Stream backends return before the handshake
    /// completes; datagram backends return once their socket is ready.
    pub async fn connect(endpoint: Endpoint, options: BackendOptions) -> Arc<Self> {
        let backend = Arc::new(Self::new(endpoint, options));

        match backend.transport_kind() {
            TransportKind::Stream => {
                backend.reconnect();
            }
            TransportKind::Datagram => {
                if backend.try_claim_connect() {
                    if let Err(e) = backend.establish().await {
                        warn!(
                            backend = %backend.name,
                            error = %e,
                            "Datagram backend setup failed"
                        );
                        backend.mark_unavailable();
                    }
                    backend.connecting.store(false, Ordering::Release);
                }
            }
        }

        backend
    }

    /// Stable identifier (the configured address string).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.endpoint.transport_kind()
    }

    /// Consistent copy of the health fields.
    pub fn health(&self) -> Health {
        self.lock_health().clone()
    }

    pub fn is_available(&self) -> bool {
        self.lock_health().available
    }

    /// Available and holding an open link. Checked live on every call.
    pub fn is_usable(&self) -> bool {
        self.is_available() && self.link_is_open()
    }

    /// Whether the current link exists and is open, regardless of the flag.
    pub(crate) fn link_is_open(&self) -> bool {
        self.link.load_full().is_some_and(|link| link.is_open())
    }

    /// Whether a connect attempt is currently in flight.
    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    /// Number of connect attempts made so far.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    /// Mark the backend available.
    pub fn mark_available(&self) {
        let count = self.transition(true);
        info!(
            backend = %self.name,
            transport = %self.transport_kind(),
            state_change_count = count,
            "Backend available"
        );
    }

    /// Mark the backend unavailable.
    pub fn mark_unavailable(&self) {
        let count = self.transition(false);
        warn!(
            backend = %self.name,
            transport = %self.transport_kind(),
            state_change_count = count,
            "Backend unavailable"
        );
    }

    /// Every call is a transition event, even if the flag already had this value.
    fn transition(&self, available: bool) -> u64 {
        let mut health = self.lock_health();
        health.available = available;
        health.state_changed_at = Utc::now();
        health.state_change_count += 1;
        health.state_change_count
    }

    /// Send one unit to the backend.
    pub async fn send(&self, buf: &[u8]) -> Result<(), RelayError> {
        let link = self
            .link
            .load_full()
            .ok_or_else(|| RelayError::NotConnected(self.name.clone()))?;

        link.write(buf)
            .await
            .map_err(|source| RelayError::Transport {
                backend: self.name.clone(),
                source,
            })?;

        self.record_sent();
        Ok(())
    }

    /// Current link, if one is installed.
    pub(crate) fn link(&self) -> Option<Arc<BoxLink>> {
        self.link.load_full()
    }

    /// Count one forwarded unit.
    pub(crate) fn record_sent(&self) {
        let mut health = self.lock_health();
        health.message_count += 1;
        health.last_sent_at = Some(Utc::now());
    }

    /// Refresh `last_sent_at` without counting a new unit.
    pub(crate) fn record_activity(&self) {
        self.lock_health().last_sent_at = Some(Utc::now());
    }

    /// Demote the backend only if it is currently available. Check and
    /// transition happen under one lock.
    pub(crate) fn demote_if_available(&self) -> bool {
        let count = {
            let mut health = self.lock_health();
            if !health.available {
                return false;
            }
            health.available = false;
            health.state_changed_at = Utc::now();
            health.state_change_count += 1;
            health.state_change_count
        };
        warn!(
            backend = %self.name,
            transport = %self.transport_kind(),
            state_change_count = count,
            "Backend unavailable"
        );
        true
    }

    /// Start a reconnect attempt unless one is already in flight.
    ///
    /// Returns `true` if a new attempt was spawned.
    pub fn reconnect(self: &Arc<Self>) -> bool {
        if !self.try_claim_connect() {
            debug!(backend = %self.name, "Connect already in flight, skipping");
            return false;
        }

        let backend = Arc::clone(self);
        tokio::spawn(async move {
            backend.attempt_connect().await;
        });
        true
    }

    fn try_claim_connect(&self) -> bool {
        self.connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn attempt_connect(self: Arc<Self>) {
        match self.establish().await {
            Ok(()) => {
                self.mark_available();
                // The close watcher ignores closes seen before the flag flips.
                if !self.link_is_open() && self.demote_if_available() {
                    debug!(backend = %self.name, "Link closed during connect");
                }
            }
            Err(e) => {
                let attempts = self.connect_attempts();
                if attempts <= 1 {
                    warn!(
                        backend = %self.name,
                        error = %e,
                        "Backend connection failed"
                    );
                } else {
                    debug!(
                        backend = %self.name,
                        error = %e,
                        attempts,
                        "Backend reconnect failed"
                    );
                }
            }
        }
        self.connecting.store(false, Ordering::Release);
    }

    /// Dial the endpoint and install the resulting link.
    async fn establish(self: &Arc<Self>) -> io::Result<()> {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        debug!(backend = %self.name, "Connecting to backend");

        let connect = self.options.connector.connect(&self.endpoint);
        let link = match timeout(self.options.connect_timeout, connect).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timeout",
                ))
            }
        };

        self.install(link);
        Ok(())
    }

    /// Replace the current link and watch the new one for closure.
    fn install(self: &Arc<Self>, link: BoxLink) {
        let link = Arc::new(link);
        self.link.store(Some(Arc::clone(&link)));

        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            link.closed().await;
            if let Some(backend) = weak.upgrade() {
                backend.on_link_closed(&link);
            }
        });
    }

    fn on_link_closed(&self, closed: &Arc<BoxLink>) {
        let is_current = self
            .link
            .load_full()
            .is_some_and(|current| Arc::ptr_eq(&current, closed));

        if is_current && self.demote_if_available() {
            debug!(backend = %self.name, "Backend link closed");
        }
    }

    fn lock_health(&self) -> MutexGuard<'_, Health> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("health", &self.health())
            .field("connecting", &self.is_connecting())
            .finish()
    }
}
