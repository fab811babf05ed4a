//! Pending-send and pending-receive bookkeeping tables.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use bytes::Bytes;
use quanta::Instant;
use rdt_wire::Module;

/// Identifies one not-yet-acknowledged outbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendKey {
    pub module_id: u32,
    pub node_id: u32,
    pub sequence: u32,
    pub fragment_index: u32,
}

/// A built, unacknowledged packet awaiting transmission or retry.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub bytes: Bytes,
    pub destination: SocketAddr,
    pub retry_count: u8,
    pub sent: bool,
    pub last_sent: Option<Instant>,
    pub is_probe: bool,
    /// Carried only so a retry-exhaustion failure can name the module and
    /// node id in its `DeliveryFailed` event without a second lookup.
    pub module: Module,
    pub node_id: u32,
}

impl PendingSend {
    pub fn new(
        bytes: Bytes,
        destination: SocketAddr,
        is_probe: bool,
        module: Module,
        node_id: u32,
    ) -> Self {
        PendingSend {
            bytes,
            destination,
            retry_count: 0,
            sent: false,
            last_sent: None,
            is_probe,
            module,
            node_id,
        }
    }
}

/// Table of outbound packets awaiting a CONFIRM (or PROBE_REPLY) ACK.
#[derive(Debug, Default)]
pub struct PendingSendTable {
    entries: HashMap<SendKey, PendingSend>,
}

impl PendingSendTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: SendKey, entry: PendingSend) {
        self.entries.insert(key, entry);
    }

    pub fn remove(&mut self, key: &SendKey) -> Option<PendingSend> {
        self.entries.remove(key)
    }

    pub fn get_mut(&mut self, key: &SendKey) -> Option<&mut PendingSend> {
        self.entries.get_mut(key)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&SendKey, &mut PendingSend)> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Identifies one assembly-in-progress message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecvKey {
    pub source: SocketAddr,
    pub module_id: u32,
    pub node_id: u32,
    pub sequence: u32,
}

/// Assembly buffer for a multi-fragment message, or the bookkeeping
/// shell created by a leading DATA fragment before the HEADER arrives.
#[derive(Debug)]
pub struct PendingReceive {
    pub total_length: Option<u32>,
    pub expected_fragment_count: Option<u32>,
    pub header_received: bool,
    pub fragments: BTreeMap<u32, Bytes>,
    pub last_received: Instant,
}

impl PendingReceive {
    pub fn new_from_header(total_length: u32, fragment_count: u32) -> Self {
        PendingReceive {
            total_length: Some(total_length),
            expected_fragment_count: Some(fragment_count),
            header_received: true,
            fragments: BTreeMap::new(),
            last_received: Instant::now(),
        }
    }

    pub fn new_from_data(fragment_index: u32, payload: Bytes) -> Self {
        let mut fragments = BTreeMap::new();
        fragments.insert(fragment_index, payload);
        PendingReceive {
            total_length: None,
            expected_fragment_count: None,
            header_received: false,
            fragments,
            last_received: Instant::now(),
        }
    }

    pub fn apply_header(&mut self, total_length: u32, fragment_count: u32) {
        self.total_length = Some(total_length);
        self.expected_fragment_count = Some(fragment_count);
        self.header_received = true;
        self.last_received = Instant::now();
    }

    pub fn insert_fragment(&mut self, fragment_index: u32, payload: Bytes) {
        self.fragments.insert(fragment_index, payload);
        self.last_received = Instant::now();
    }

    pub fn is_complete(&self) -> bool {
        match self.expected_fragment_count {
            Some(count) => self.header_received && self.fragments.len() as u32 == count,
            None => false,
        }
    }

    /// Concatenate fragments in ascending index order. `None` if the
    /// assembled length doesn't match the declared `total_length`.
    pub fn assemble(&self) -> Option<Bytes> {
        let total_length = self.total_length? as usize;
        let mut out = Vec::with_capacity(total_length);
        for payload in self.fragments.values() {
            out.extend_from_slice(payload);
        }
        if out.len() != total_length {
            return None;
        }
        Some(Bytes::from(out))
    }
}

/// Table of in-progress message assemblies.
#[derive(Debug, Default)]
pub struct PendingReceiveTable {
    entries: HashMap<RecvKey, PendingReceive>,
}

impl PendingReceiveTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a HEADER fragment: create the assembly entry if this is the
    /// first sighting of `key`, or fold the totals into an entry already
    /// created by a leading DATA fragment.
    pub fn on_header(
        &mut self,
        key: RecvKey,
        total_length: u32,
        fragment_count: u32,
    ) -> &mut PendingReceive {
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| PendingReceive::new_from_header(total_length, fragment_count));
        if !entry.header_received {
            entry.apply_header(total_length, fragment_count);
        }
        entry
    }

    /// Apply a DATA fragment: create the assembly entry if this is the
    /// first sighting of `key`, or append to an entry already created by
    /// the HEADER or another DATA fragment.
    pub fn on_data(&mut self, key: RecvKey, fragment_index: u32, payload: Bytes) -> &mut PendingReceive {
        let entry = self.entries.entry(key).or_insert_with(|| {
            PendingReceive::new_from_data(fragment_index, payload.clone())
        });
        entry.insert_fragment(fragment_index, payload);
        entry
    }

    pub fn remove(&mut self, key: &RecvKey) -> Option<PendingReceive> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop assemblies that haven't seen a fragment within `ttl`.
    pub fn sweep_stale(&mut self, ttl: std::time::Duration) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, recv| now.duration_since(recv.last_received) <= ttl);
        before - self.entries.len()
    }
}
