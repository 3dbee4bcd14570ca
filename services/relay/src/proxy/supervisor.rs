//! Reconnect supervisor.
//!
//! Wakes on a fixed interval and starts a reconnect attempt for every
//! backend currently marked unavailable. Attempts run in their own tasks so
//! a slow handshake never delays the scan or other backends. Retries are
//! level-triggered with no backoff and no limit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::state::RelayState;

/// Periodic reconnect task for the backend set.
pub struct Supervisor {
    state: Arc<RelayState>,
    interval: Duration,
}

impl Supervisor {
    pub fn new(state: Arc<RelayState>, interval: Duration) -> Self {
        Self { state, interval }
    }

    /// Run until shutdown is signalled or the shutdown sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            backend_count = self.state.backends().len(),
            "Starting reconnect supervisor"
        );

        let mut interval_timer = tokio::time::interval(self.interval);
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    self.tick();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconnect supervisor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One scan over the backend set. Returns the number of attempts started.
    pub fn tick(&self) -> usize {
        let mut started = 0;
        for backend in self.state.backends() {
            if backend.is_available() {
                continue;
            }
            if backend.reconnect() {
                started += 1;
            }
        }

        if started > 0 {
            debug!(started, "Reconnect attempts started");
        }
        started
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::endpoint::Endpoint;
    use crate::proxy::backend::BackendOptions;
    use crate::proxy::connector::fake::FakeConnector;
    use crate::proxy::connector::Connector;

    async fn state(connector: &Arc<FakeConnector>, names: &[&str]) -> Arc<RelayState> {
        let endpoints: Vec<Endpoint> = names.iter().map(|n| n.parse().unwrap()).collect();
        let options = BackendOptions::new()
            .with_timeout(Duration::from_secs(2))
            .with_connector(Arc::clone(connector) as Arc<dyn Connector>);
        let state = Arc::new(RelayState::connect(&endpoints, options).await);

        for _ in 0..100 {
            if state.backends().iter().all(|b| !b.is_connecting()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        state
    }

    #[tokio::test]
    async fn test_tick_skips_available_backends() {
        let connector = FakeConnector::new();
        let state = state(&connector, &["tcp://a:1", "udp://b:1"]).await;
        let attempts = connector.attempts();

        let supervisor = Supervisor::new(Arc::clone(&state), Duration::from_secs(1));
        assert_eq!(supervisor.tick(), 0);
        assert_eq!(connector.attempts(), attempts);
    }

    #[tokio::test]
    async fn test_concurrent_reconnects_are_independent() {
        let connector = FakeConnector::new();
        connector.set_down("tcp://slow:1", true);
        connector.set_down("tcp://fast:1", true);
        let state = state(&connector, &["tcp://slow:1", "tcp://fast:1"]).await;

        connector.set_down("tcp://slow:1", false);
        connector.set_down("tcp://fast:1", false);
        connector.set_delay("tcp://slow:1", Duration::from_millis(600));

        let supervisor = Supervisor::new(Arc::clone(&state), Duration::from_secs(1));
        assert_eq!(supervisor.tick(), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let (slow, fast) = (&state.backends()[0], &state.backends()[1]);
        assert!(fast.is_available(), "fast backend must not wait for slow one");
        assert!(!slow.is_available());
        assert!(slow.is_connecting());

        // A tick while the slow attempt is pending does not start another.
        assert_eq!(supervisor.tick(), 0);

        for _ in 0..100 {
            if slow.is_available() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(slow.is_available());
        assert_eq!(connector.attempts(), 4);
    }

    #[tokio::test]
    async fn test_keeps_retrying_until_backend_recovers() {
        let connector = FakeConnector::new();
        connector.set_down("tcp://a:1", true);
        let state = state(&connector, &["tcp://a:1"]).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = Supervisor::new(Arc::clone(&state), Duration::from_millis(50));
        let handle = tokio::spawn(async move { supervisor.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(connector.attempts() >= 3);
        assert!(!state.backends()[0].is_available());

        connector.set_down("tcp://a:1", false);
        for _ in 0..100 {
            if state.backends()[0].is_available() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(state.backends()[0].is_available());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("supervisor should stop on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stops_when_shutdown_sender_dropped() {
        let connector = FakeConnector::new();
        let state = state(&connector, &["tcp://a:1"]).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = Supervisor::new(Arc::clone(&state), Duration::from_secs(60));
        let handle = tokio::spawn(async move { supervisor.run(shutdown_rx).await });

        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("supervisor should stop when the sender is dropped")
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_after_link_dies() {
        let connector = FakeConnector::new();
        let state = state(&connector, &["tcp://a:1"]).await;
        let backend = Arc::clone(&state.backends()[0]);
        assert!(backend.is_available());

        connector.kill("tcp://a:1");
        for _ in 0..100 {
            if !backend.is_available() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let supervisor = Supervisor::new(Arc::clone(&state), Duration::from_secs(1));
        assert_eq!(supervisor.tick(), 1);
        for _ in 0..100 {
            if backend.is_usable() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(backend.is_usable());
        // Up, down, up again: identity and counters are preserved.
        assert_eq!(backend.health().state_change_count, 3);
    }
}
