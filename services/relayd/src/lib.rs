//! # plexus-relayd
//!
//! TCP relay daemon. Accepts client connections, runs one relay session per
//! client on its own task and relays bytes to upstreams picked round-robin
//! from a shared pool.

pub mod config;
pub mod listener;
pub mod passthrough;
pub mod proxy_protocol;
pub mod reactor;
pub mod upstream;

pub use config::{Config, ProxyHeaderMode};
pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use passthrough::{Passthrough, PassthroughSub};
pub use proxy_protocol::{HeaderError, ProxyHeader};
pub use reactor::{Reactor, SessionReport, TrafficStats};
pub use upstream::{HealthStatus, PendingConnect, UpstreamConnector, UpstreamPool, UpstreamPoolStats};
