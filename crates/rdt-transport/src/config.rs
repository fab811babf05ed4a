//! Layered configuration: a serde-deserializable `TransportConfigInput`
//! (TOML, every field optional) converted into a strict runtime
//! [`TransportConfig`] carrying the documented defaults.

use std::net::SocketAddr;
use std::time::Duration;

use rdt_wire::ModuleRegistry;
use serde::Deserialize;
use thiserror::Error;

/// `RETRY_INTERVAL` default.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// `MAX_RETRIES` default.
pub const DEFAULT_MAX_RETRIES: u8 = 3;
/// `RECV_READ_TIMEOUT` default.
pub const DEFAULT_RECV_READ_TIMEOUT: Duration = Duration::from_millis(100);
/// `SEND_POLL_TIMEOUT` default.
pub const DEFAULT_SEND_POLL_TIMEOUT: Duration = Duration::from_millis(500);
/// `RECV_TTL` default.
pub const DEFAULT_RECV_TTL: Duration = Duration::from_secs(30);

/// A single module-name/wire-id override, as carried in TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleEntry {
    pub name: String,
    pub id: u32,
}

/// Raw deserialized configuration. Every field is optional; absent fields
/// fall back to the defaults documented in the crate's external-interface
/// spec.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfigInput {
    /// Local bind address, `host:port`. Port `0` lets the OS assign one.
    pub bind_addr: Option<String>,
    pub retry_interval_ms: Option<u64>,
    pub max_retries: Option<u8>,
    pub recv_read_timeout_ms: Option<u64>,
    pub send_poll_timeout_ms: Option<u64>,
    pub recv_ttl_secs: Option<u64>,
    /// Extra module name/id pairs layered on top of the defaults
    /// (`node=0`, `database=1`, `plugin=2`).
    pub modules: Vec<ModuleEntry>,
}

/// Errors surfaced while converting a [`TransportConfigInput`] into a
/// [`TransportConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid bind address {0:?}: {1}")]
    InvalidBindAddr(String, std::net::AddrParseError),
}

/// Strict runtime configuration for a [`crate::Engine`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub bind_addr: SocketAddr,
    pub retry_interval: Duration,
    pub max_retries: u8,
    pub recv_read_timeout: Duration,
    pub send_poll_timeout: Duration,
    pub recv_ttl: Duration,
    pub registry: ModuleRegistry,
}

impl TransportConfigInput {
    /// Convert into a strict [`TransportConfig`], filling in defaults for
    /// every field left unset.
    pub fn into_config(self) -> Result<TransportConfig, ConfigError> {
        let bind_addr_str = self.bind_addr.unwrap_or_else(|| "0.0.0.0:0".to_string());
        let bind_addr = bind_addr_str
            .parse()
            .map_err(|e| ConfigError::InvalidBindAddr(bind_addr_str, e))?;

        let mut registry = ModuleRegistry::with_defaults();
        for entry in self.modules {
            registry.register(entry.name, entry.id);
        }

        Ok(TransportConfig {
            bind_addr,
            retry_interval: self
                .retry_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RETRY_INTERVAL),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            recv_read_timeout: self
                .recv_read_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RECV_READ_TIMEOUT),
            send_poll_timeout: self
                .send_poll_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SEND_POLL_TIMEOUT),
            recv_ttl: self
                .recv_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RECV_TTL),
            registry,
        })
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfigInput::default()
            .into_config()
            .expect("default bind address always parses")
    }
}
