//! Relay engine.
//!
//! This module provides:
//! - Backend health tracking and connection lifecycle
//! - Ordered backend selection with failover
//! - Transport-pair bridging (splice vs. manual forward)
//! - TCP, Unix-domain and UDP listeners
//! - The reconnect supervisor
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Router -> Backend -> Bridge -> Link
//!                                    ^
//!                         Supervisor (reconnect tick)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use relay::{BackendOptions, Listener, ListenerConfig, ListenerSpec, RelayState, Supervisor};
//!
//! let endpoints = vec!["tcp://127.0.0.1:9000".parse()?];
//! let state = Arc::new(RelayState::connect(&endpoints, BackendOptions::new()).await);
//!
//! let config = ListenerConfig::new(ListenerSpec::Tcp("0.0.0.0:8125".parse()?));
//! let listener = Arc::new(Listener::bind(config, Arc::clone(&state)).await?);
//! tokio::spawn(listener.run());
//!
//! Supervisor::new(state, Duration::from_secs(1)).run(shutdown_rx).await;
//! ```

pub(crate) mod backend;
mod bridge;
pub(crate) mod connector;
pub(crate) mod link;
mod listener;
pub(crate) mod router;
mod supervisor;

pub use backend::{Backend, BackendOptions, Health, DEFAULT_CONNECT_TIMEOUT};
pub use bridge::{bridge_datagram, bridge_stream, trim_line_terminator, Strategy, CHUNK_SIZE};
pub use connector::{Connector, SocketConnector};
pub use link::{BoxLink, DatagramLink, Link, StreamLink};
pub use listener::{
    Listener, ListenerConfig, ListenerKind, ListenerSpec, DEFAULT_MAX_CONNECTIONS,
    MAX_DATAGRAM_SIZE,
};
pub use router::select;
pub use supervisor::Supervisor;
