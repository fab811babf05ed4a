use rdt_transport::TransportError;
use rdt_wire::WireError;
use thiserror::Error;

/// Failures returned synchronously from [`crate::Dispatcher::send`].
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown module: {0}")]
    UnknownModule(String),
    #[error("destination {0} is known offline")]
    Offline(std::net::SocketAddr),
    #[error("no known address for node {0}")]
    UnknownPeer(u32),
    #[error("payload encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("send queue is full")]
    QueueFull,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
