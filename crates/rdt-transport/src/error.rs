use rdt_wire::WireError;
use thiserror::Error;

/// Synchronous failures from `Engine::send`/`Engine::probe`. Everything
/// else (timeouts, checksum failures, I/O hiccups) is handled by the
/// retransmission loop and surfaced later as a `DeliveryFailed` event.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("payload must not be empty")]
    EmptyPayload,
    #[error(transparent)]
    Wire(#[from] WireError),
}
