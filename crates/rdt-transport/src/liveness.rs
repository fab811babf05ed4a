//! Liveness tracking for remote endpoints.
//!
//! An [`EndpointState`] flips online on a `PROBE_REPLY` ACK or any inbound
//! traffic, and flips offline when a PROBE's retries are exhausted (client
//! path), or when a peer binding goes idle past the configured threshold
//! (server path, driven externally by the session registry's sweeper).
//! Since the server never sees a `PROBE_REPLY` from an ordinary peer, its
//! only path back to online after an idle sweep is the next inbound packet
//! touching activity — so `touch_activity` must itself revive an offline
//! entry, not just refresh its timestamp.

use std::collections::HashMap;
use std::net::SocketAddr;

use quanta::Instant;

#[derive(Debug, Clone, Copy)]
pub struct EndpointState {
    pub online: bool,
    pub last_activity: Instant,
}

/// `addr -> EndpointState`, guarded by the engine's `liveness_mutex`.
#[derive(Debug, Default)]
pub struct LivenessTable {
    states: HashMap<SocketAddr, EndpointState>,
}

impl LivenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_online(&self, addr: SocketAddr) -> bool {
        self.states.get(&addr).map(|s| s.online).unwrap_or(false)
    }

    /// Record inbound traffic from `addr`. Creates the entry as online if
    /// this is the first observation; revives an existing offline entry
    /// back to online, since any valid inbound packet is itself evidence
    /// of liveness. Returns `true` if this transitioned `addr` from
    /// offline (or unknown) to online.
    pub fn touch_activity(&mut self, addr: SocketAddr) -> bool {
        let now = Instant::now();
        match self.states.get_mut(&addr) {
            Some(state) => {
                let changed = !state.online;
                state.online = true;
                state.last_activity = now;
                changed
            }
            None => {
                self.states.insert(
                    addr,
                    EndpointState {
                        online: true,
                        last_activity: now,
                    },
                );
                true
            }
        }
    }

    /// Returns `true` if this transitioned `addr` from offline (or
    /// unknown) to online.
    pub fn mark_online(&mut self, addr: SocketAddr) -> bool {
        let now = Instant::now();
        match self.states.get_mut(&addr) {
            Some(state) => {
                let changed = !state.online;
                state.online = true;
                state.last_activity = now;
                changed
            }
            None => {
                self.states.insert(
                    addr,
                    EndpointState {
                        online: true,
                        last_activity: now,
                    },
                );
                true
            }
        }
    }

    /// Returns `true` if this transitioned `addr` from online to
    /// offline. A previously-unknown address has no transition to
    /// report (there's no prior "online" to leave).
    pub fn mark_offline(&mut self, addr: SocketAddr) -> bool {
        match self.states.get_mut(&addr) {
            Some(state) => {
                let changed = state.online;
                state.online = false;
                changed
            }
            None => false,
        }
    }
}
