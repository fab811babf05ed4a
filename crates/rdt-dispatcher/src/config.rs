//! Layered configuration for the dispatcher, following the same
//! `*ConfigInput` -> strict `Config` split as `rdt-transport`.

use std::net::SocketAddr;
use std::time::Duration;

use rdt_transport::{ConfigError as TransportConfigError, TransportConfig, TransportConfigInput};
use serde::Deserialize;
use thiserror::Error;

/// `QUEUE_CAPACITY` default: bounded send-queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
/// `PROBE_INTERVAL` default: client-side periodic liveness probe.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(60);
/// `IDLE_SCAN_INTERVAL` default, forwarded to the session registry.
pub const DEFAULT_IDLE_SCAN_INTERVAL: Duration = Duration::from_secs(30);
/// `OFFLINE_THRESHOLD` default, forwarded to the session registry.
pub const DEFAULT_OFFLINE_THRESHOLD: Duration = Duration::from_secs(60);

/// Which side of the connection this dispatcher plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Talks to a single fixed peer; no session registry.
    Client { peer_addr: SocketAddr },
    /// Talks to many peers addressed by node id via the session registry.
    Server,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DispatcherConfigInput {
    /// `"client"` or `"server"`. Defaults to `"server"`.
    pub role: Option<String>,
    /// Required when `role = "client"`: the fixed peer address to send to.
    pub peer_addr: Option<String>,
    /// This endpoint's own node id, carried in every outbound packet.
    pub node_id: Option<u32>,
    pub queue_capacity: Option<usize>,
    /// Client role only: period between automatic liveness probes against
    /// `peer_addr`.
    pub probe_interval_ms: Option<u64>,
    /// Server role only: forwarded to the session registry's idle sweeper.
    pub idle_scan_interval_ms: Option<u64>,
    /// Server role only: forwarded to the session registry's idle sweeper.
    pub offline_threshold_ms: Option<u64>,
    #[serde(default)]
    pub transport: TransportConfigInput,
}

#[derive(Debug, Error)]
pub enum DispatcherConfigError {
    #[error("client role requires peer_addr")]
    MissingPeerAddr,
    #[error("invalid peer address {0:?}: {1}")]
    InvalidPeerAddr(String, std::net::AddrParseError),
    #[error("invalid role {0:?}, expected \"client\" or \"server\"")]
    InvalidRole(String),
    #[error(transparent)]
    Transport(#[from] TransportConfigError),
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub role: Role,
    pub node_id: u32,
    pub queue_capacity: usize,
    pub probe_interval: Duration,
    pub idle_scan_interval: Duration,
    pub offline_threshold: Duration,
    pub transport: TransportConfig,
}

impl DispatcherConfigInput {
    pub fn into_config(self) -> Result<DispatcherConfig, DispatcherConfigError> {
        let role_str = self.role.unwrap_or_else(|| "server".to_string());
        let role = match role_str.as_str() {
            "server" => Role::Server,
            "client" => {
                let peer_str = self.peer_addr.ok_or(DispatcherConfigError::MissingPeerAddr)?;
                let peer_addr = peer_str
                    .parse()
                    .map_err(|e| DispatcherConfigError::InvalidPeerAddr(peer_str, e))?;
                Role::Client { peer_addr }
            }
            other => return Err(DispatcherConfigError::InvalidRole(other.to_string())),
        };

        Ok(DispatcherConfig {
            role,
            node_id: self.node_id.unwrap_or(0),
            queue_capacity: self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            probe_interval: self
                .probe_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_PROBE_INTERVAL),
            idle_scan_interval: self
                .idle_scan_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_IDLE_SCAN_INTERVAL),
            offline_threshold: self
                .offline_threshold_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_OFFLINE_THRESHOLD),
            transport: self.transport.into_config()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_server_role() {
        let config = DispatcherConfigInput::default().into_config().unwrap();
        assert_eq!(config.role, Role::Server);
        assert_eq!(config.node_id, 0);
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.probe_interval, DEFAULT_PROBE_INTERVAL);
        assert_eq!(config.idle_scan_interval, DEFAULT_IDLE_SCAN_INTERVAL);
        assert_eq!(config.offline_threshold, DEFAULT_OFFLINE_THRESHOLD);
    }

    #[test]
    fn client_role_requires_peer_addr() {
        let mut input = DispatcherConfigInput::default();
        input.role = Some("client".to_string());
        assert!(matches!(
            input.into_config(),
            Err(DispatcherConfigError::MissingPeerAddr)
        ));
    }

    #[test]
    fn client_role_parses_peer_addr() {
        let mut input = DispatcherConfigInput::default();
        input.role = Some("client".to_string());
        input.peer_addr = Some("127.0.0.1:9200".to_string());
        let config = input.into_config().unwrap();
        assert_eq!(
            config.role,
            Role::Client {
                peer_addr: "127.0.0.1:9200".parse().unwrap()
            }
        );
    }

    #[test]
    fn unknown_role_is_rejected() {
        let mut input = DispatcherConfigInput::default();
        input.role = Some("oracle".to_string());
        assert!(matches!(
            input.into_config(),
            Err(DispatcherConfigError::InvalidRole(_))
        ));
    }

    #[test]
    fn toml_round_trips_full_config() {
        let toml_src = r#"
            role = "client"
            peer_addr = "10.0.0.5:4000"
            node_id = 7
            queue_capacity = 64

            [transport]
            bind_addr = "0.0.0.0:4000"
            max_retries = 5
        "#;
        let input: DispatcherConfigInput = toml::from_str(toml_src).unwrap();
        let config = input.into_config().unwrap();
        assert_eq!(config.node_id, 7);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.transport.max_retries, 5);
        assert!(matches!(config.role, Role::Client { .. }));
    }
}
