pub mod admin;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod proxy;
pub mod state;

pub use admin::{AdminError, AdminServer, Command};
pub use config::{Config, Encoding};
pub use endpoint::{Endpoint, TransportKind};
pub use error::RelayError;
pub use proxy::{
    Backend, BackendOptions, Connector, Health, Link, Listener, ListenerConfig, ListenerKind,
    ListenerSpec, SocketConnector, Strategy, Supervisor,
};
pub use state::{RelayState, RelayStats, StatsSnapshot};
