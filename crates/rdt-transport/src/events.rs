//! Observer events emitted by the transport engine.
//!
//! Callbacks are invoked synchronously from whichever worker thread
//! produced the event (receiver, sender, or liveness-probe). Observers
//! must not block — offload heavy work to your own thread.

use std::net::SocketAddr;

use bytes::Bytes;
use rdt_wire::Module;

#[derive(Debug, Clone)]
pub struct DeliveryComplete {
    pub module: Module,
    pub node_id: u32,
    pub payload: Bytes,
    pub source: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct DeliveryFailed {
    pub module: Module,
    pub node_id: u32,
    pub reason: &'static str,
    pub destination: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct AckObserved {
    pub module: Module,
    pub node_id: u32,
    pub sequence: u32,
    pub source: SocketAddr,
}

#[derive(Debug, Clone, Copy)]
pub struct EndpointStatusChanged {
    pub address: SocketAddr,
    pub online: bool,
}

/// Fired for every packet that passes checksum verification, regardless of
/// kind. This is the only event that observes ACKs and PROBEs as well as
/// deliveries, which is what the session registry needs to keep
/// `PeerBinding` pinned to the most recently seen address for a node id.
#[derive(Debug, Clone, Copy)]
pub struct PacketObserved {
    pub node_id: u32,
    pub source: SocketAddr,
}

/// Registered once at construction; every method defaults to a no-op so
/// implementors only need to override the events they care about.
pub trait EngineObserver: Send + Sync {
    fn on_delivery_complete(&self, _event: DeliveryComplete) {}
    fn on_delivery_failed(&self, _event: DeliveryFailed) {}
    fn on_ack_observed(&self, _event: AckObserved) {}
    fn on_endpoint_status_changed(&self, _event: EndpointStatusChanged) {}
    fn on_packet_observed(&self, _event: PacketObserved) {}
}

/// An observer that discards every event. Useful when the caller only
/// wants the liveness/dispatch behavior and not the callbacks.
pub struct NullObserver;

impl EngineObserver for NullObserver {}
