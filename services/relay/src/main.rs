//! relay
//!
//! Transport-agnostic message relay with ordered backend failover.
//!
//! This service:
//! - Accepts traffic on TCP, Unix-domain and UDP listeners
//! - Forwards every inbound unit to the first available backend
//! - Reconnects failed backends in the background
//! - Answers `ping`, `stats` and `config` on the admin channel

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay::{
    AdminServer, BackendOptions, Config, Listener, ListenerConfig, RelayState, Supervisor,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RELAY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting relay");
    info!(
        backend_count = config.backends.len(),
        listener_count = config.listeners().len(),
        admin_listen = %config.admin_listen,
        encoding = %config.encoding,
        reconnect_interval_ms = config.reconnect_interval.as_millis() as u64,
        "Configuration loaded"
    );

    let config = Arc::new(config);
    let options = BackendOptions::new().with_timeout(config.connect_timeout);
    let state = Arc::new(RelayState::connect(&config.backends, options).await);

    // Bind every listener before serving; any bind failure is fatal.
    let mut listeners = Vec::new();
    for spec in config.listeners() {
        let mut listener_config = ListenerConfig::new(spec.clone());
        listener_config.max_connections = config.max_connections;
        listener_config.encoding = config.encoding;

        match Listener::bind(listener_config, Arc::clone(&state)).await {
            Ok(listener) => listeners.push(Arc::new(listener)),
            Err(e) => {
                error!(listener = %spec, error = %e, "Failed to bind listener");
                return Err(e.into());
            }
        }
    }

    let admin = match AdminServer::bind(config.admin_listen, Arc::clone(&state), Arc::clone(&config))
        .await
    {
        Ok(admin) => Arc::new(admin),
        Err(e) => {
            error!(bind_addr = %config.admin_listen, error = %e, "Failed to bind admin listener");
            return Err(e.into());
        }
    };

    let mut tasks = JoinSet::new();
    for listener in listeners {
        tasks.spawn(async move {
            let kind = listener.kind();
            if let Err(e) = listener.run().await {
                error!(listener = %kind, error = %e, "Listener error");
            }
        });
    }
    tasks.spawn(async move {
        if let Err(e) = admin.run().await {
            error!(error = %e, "Admin listener error");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = Supervisor::new(Arc::clone(&state), config.reconnect_interval);
    let supervisor_handle = tokio::spawn(async move { supervisor.run(shutdown_rx).await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        }
        _ = tasks.join_next() => {
            error!("A listener exited unexpectedly");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = supervisor_handle.await;
    tasks.abort_all();

    if let Some(path) = &config.unix_listen {
        let _ = std::fs::remove_file(path);
    }

    info!("Relay stopped");
    Ok(())
}
