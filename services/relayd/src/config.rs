//! Relay daemon configuration.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use plexus_relay::{
    ConnectOptions, SessionConfig, DEFAULT_BUFFER_SIZE, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_MAX_BACKENDS,
};

use crate::listener::DEFAULT_MAX_CONNECTIONS;

/// Default listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "[::]:7000";

/// Whether backends get a PROXY protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyHeaderMode {
    Off,
    V2,
}

/// Relay daemon configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listener binds to.
    pub listen_addr: SocketAddr,

    /// Upstream addresses, used round-robin.
    pub upstreams: Vec<SocketAddr>,

    /// Max concurrent client sessions.
    pub max_connections: usize,

    /// Max live backends per session.
    pub max_backends: usize,

    /// Capacity of each connection buffer.
    pub buffer_size: usize,

    /// Backend connect timeout.
    pub connect_timeout: Duration,

    /// Close a session after this long without socket activity.
    pub idle_timeout: Option<Duration>,

    /// PROXY protocol header sent to backends.
    pub proxy_header: ProxyHeaderMode,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = var("RELAY_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse()
            .context("RELAY_LISTEN_ADDR must be a socket address (example: 0.0.0.0:7000).")?;

        let upstreams = var("RELAY_UPSTREAMS")
            .context("Missing upstreams. Set RELAY_UPSTREAMS to a comma-separated list of addresses.")?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<SocketAddr>()
                    .with_context(|| format!("invalid upstream address '{s}'"))
            })
            .collect::<Result<Vec<_>>>()?;
        if upstreams.is_empty() {
            bail!("RELAY_UPSTREAMS must name at least one address.");
        }

        let max_connections: usize = var("RELAY_MAX_CONNECTIONS")
            .map(|v| v.parse())
            .transpose()
            .context("RELAY_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let max_backends: usize = var("RELAY_MAX_BACKENDS")
            .map(|v| v.parse())
            .transpose()
            .context("RELAY_MAX_BACKENDS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_BACKENDS)
            .max(1);

        let buffer_size: usize = var("RELAY_BUFFER_SIZE")
            .map(|v| v.parse())
            .transpose()
            .context("RELAY_BUFFER_SIZE must be an integer (bytes).")?
            .unwrap_or(DEFAULT_BUFFER_SIZE)
            .max(1);

        let connect_timeout = var("RELAY_CONNECT_TIMEOUT_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("RELAY_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        let idle_timeout = var("RELAY_IDLE_TIMEOUT_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("RELAY_IDLE_TIMEOUT_MS must be an integer (milliseconds).")?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        let proxy_header = match var("RELAY_PROXY_PROTOCOL").as_deref() {
            None | Some("off") | Some("") => ProxyHeaderMode::Off,
            Some("v2") => ProxyHeaderMode::V2,
            Some(other) => bail!("RELAY_PROXY_PROTOCOL must be 'off' or 'v2', got '{other}'."),
        };

        let log_level = var("RELAY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            upstreams,
            max_connections,
            max_backends,
            buffer_size,
            connect_timeout,
            idle_timeout,
            proxy_header,
            log_level,
        })
    }

    /// Session settings derived from this configuration.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_backends: self.max_backends,
            connect: ConnectOptions {
                timeout: self.connect_timeout,
                in_buffer: self.buffer_size,
                out_buffer: self.buffer_size,
            },
        }
    }
}
