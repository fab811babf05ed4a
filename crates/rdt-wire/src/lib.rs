//! Wire codec for the reliable datagram transport.
//!
//! Five packet kinds (`HEADER`, `DATA`, `FULL`, `ACK`, `PROBE`) share a
//! fixed 12-byte big-endian common header and a per-kind tail. See
//! [`codec`] for encode/decode and [`registry`] for the module-name
//! bidirectional id map.

pub mod codec;
pub mod registry;

pub use codec::{AckStatus, Body, Codec, Module, Packet, PacketKind, WireError, MAX_FRAGMENT_BYTES};
pub use registry::ModuleRegistry;
