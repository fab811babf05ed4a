//! Transport engine for the reliable datagram transport.
//!
//! Owns the datagram socket, sequence counter, pending-send and
//! pending-receive tables, the ACK loop, the retransmission timer, and
//! liveness tracking. See [`Engine`] for the public contract and
//! [`events`] for the observer callbacks it emits.

pub mod config;
pub mod error;
pub mod events;
mod liveness;
mod pending;

mod engine;

pub use config::{ConfigError, TransportConfig, TransportConfigInput};
pub use engine::Engine;
pub use error::TransportError;
pub use events::{
    AckObserved, DeliveryComplete, DeliveryFailed, EndpointStatusChanged, EngineObserver,
    NullObserver, PacketObserved,
};
pub use liveness::{EndpointState, LivenessTable};
pub use pending::{PendingReceive, PendingReceiveTable, PendingSend, PendingSendTable, RecvKey, SendKey};
