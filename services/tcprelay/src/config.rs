//! Relay configuration.
//!
//! Configuration is read once at startup and handed to the [`Acceptor`] by
//! value. Nothing below the binary looks configuration up by key at runtime.
//!
//! [`Acceptor`]: crate::Acceptor

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::lookup_host;

use crate::error::ServerError;
use crate::inspector::Inspector;

/// Default listen address when `TCPRELAY_LISTEN_ADDR` is unset.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Relay configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on (`host:port`).
    pub listen_addr: String,

    /// Address every client connection is relayed to (`host:port`).
    pub remote_addr: String,

    /// Inspector token (`hex`, `pg`, `mysql`).
    pub dumper: String,

    /// Take the listening socket from a server-starter process manager.
    pub use_server_starter: bool,

    /// Upper bound on draining in-flight connections at exit.
    pub shutdown_timeout: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("TCPRELAY_LISTEN_ADDR")
            .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());

        let remote_addr = std::env::var("TCPRELAY_REMOTE_ADDR")
            .context("Missing remote address. Set TCPRELAY_REMOTE_ADDR (host:port).")?;

        let dumper = std::env::var("TCPRELAY_DUMPER").unwrap_or_else(|_| "hex".to_string());

        let use_server_starter = std::env::var("TCPRELAY_USE_SERVER_STARTER")
            .map(|v| parse_bool(&v))
            .unwrap_or(false);

        let shutdown_timeout = std::env::var("TCPRELAY_SHUTDOWN_TIMEOUT_SECS")
            .ok()
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("TCPRELAY_SHUTDOWN_TIMEOUT_SECS must be an integer (seconds).")?
            .map(Duration::from_secs);

        let log_level = std::env::var("TCPRELAY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            remote_addr,
            dumper,
            use_server_starter,
            shutdown_timeout,
            log_level,
        })
    }

    /// Resolve addresses and select the inspector.
    pub async fn server_config(&self) -> Result<ServerConfig, ServerError> {
        let addresses = AddressConfig::resolve(&self.listen_addr, &self.remote_addr).await?;
        let listen_source = if self.use_server_starter {
            ListenSource::Inherited
        } else {
            ListenSource::Bind(addresses.listen)
        };

        Ok(ServerConfig {
            addresses,
            listen_source,
            inspector: Inspector::from_config(&self.dumper),
        })
    }
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Resolved listen and remote addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressConfig {
    /// Local address to listen on.
    pub listen: SocketAddr,
    /// Remote address to dial for every accepted connection.
    pub remote: SocketAddr,
}

impl AddressConfig {
    /// Build from already resolved addresses.
    pub fn new(listen: SocketAddr, remote: SocketAddr) -> Self {
        Self { listen, remote }
    }

    /// Resolve both addresses, taking the first result of each lookup.
    pub async fn resolve(listen: &str, remote: &str) -> Result<Self, ServerError> {
        Ok(Self {
            listen: resolve_one(listen).await?,
            remote: resolve_one(remote).await?,
        })
    }
}

async fn resolve_one(addr: &str) -> Result<SocketAddr, ServerError> {
    let mut addrs = lookup_host(addr).await.map_err(|e| ServerError::Resolve {
        addr: addr.to_string(),
        detail: e.to_string(),
    })?;
    addrs.next().ok_or_else(|| ServerError::Resolve {
        addr: addr.to_string(),
        detail: "no addresses returned".to_string(),
    })
}

/// Where the listening socket comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenSource {
    /// Bind a new socket on this address.
    Bind(SocketAddr),
    /// Use the first socket handed over by the process manager.
    Inherited,
}

/// Everything the [`Acceptor`](crate::Acceptor) needs, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    pub addresses: AddressConfig,
    pub listen_source: ListenSource,
    pub inspector: Inspector,
}

impl ServerConfig {
    /// Bind directly on the listen address.
    pub fn bind(addresses: AddressConfig, inspector: Inspector) -> Self {
        Self {
            addresses,
            listen_source: ListenSource::Bind(addresses.listen),
            inspector,
        }
    }
}
