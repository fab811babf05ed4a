//! Session registry: maps a logical peer identifier ("node id") to the
//! latest network address it was observed sending from, and idle-scans
//! to mark stale peers offline.
//!
//! This crate is deliberately independent of `rdt-transport` — it only
//! needs to be told when a node id is seen at an address, and given
//! somewhere to report an address gone idle. The caller (typically
//! `rdt-dispatcher`) wires an [`OfflineSink`] back to the transport
//! engine's liveness table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use quanta::Instant;

/// `IDLE_SCAN_INTERVAL` default: how often the sweeper wakes.
pub const DEFAULT_IDLE_SCAN_INTERVAL: Duration = Duration::from_secs(30);
/// `OFFLINE_THRESHOLD` default: inactivity span after which an address
/// is considered offline.
pub const DEFAULT_OFFLINE_THRESHOLD: Duration = Duration::from_secs(60);

/// Notified when the idle sweeper decides an address has gone quiet.
/// Implemented by the transport engine's liveness table (or a test
/// double) so this crate never depends on `rdt-transport` directly.
pub trait OfflineSink: Send + Sync {
    fn mark_offline(&self, addr: SocketAddr);
}

/// An `OfflineSink` that does nothing — useful when the registry is
/// used standalone, e.g. in tests.
pub struct NullSink;

impl OfflineSink for NullSink {
    fn mark_offline(&self, _addr: SocketAddr) {}
}

#[derive(Default)]
struct Bindings {
    node_to_addr: HashMap<u32, SocketAddr>,
    last_active: HashMap<SocketAddr, Instant>,
}

/// Server-side `node_id -> SocketAddr` table with an idle-activity
/// sweeper thread.
pub struct SessionRegistry {
    bindings: Mutex<Bindings>,
    idle_scan_interval: Duration,
    offline_threshold: Duration,
    run: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new(sink: Arc<dyn OfflineSink>) -> Arc<Self> {
        Self::with_intervals(sink, DEFAULT_IDLE_SCAN_INTERVAL, DEFAULT_OFFLINE_THRESHOLD)
    }

    pub fn with_intervals(
        sink: Arc<dyn OfflineSink>,
        idle_scan_interval: Duration,
        offline_threshold: Duration,
    ) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry {
            bindings: Mutex::new(Bindings::default()),
            idle_scan_interval,
            offline_threshold,
            run: Arc::new(AtomicBool::new(true)),
            handle: Mutex::new(None),
        });

        let sweep_registry = registry.clone();
        let handle = thread::Builder::new()
            .name("rdt-idle-sweeper".into())
            .spawn(move || sweep_registry.sweep_loop(sink))
            .expect("failed to spawn rdt-idle-sweeper thread");
        *registry.handle.lock().unwrap() = Some(handle);

        registry
    }

    /// Record that `node_id`'s most recently observed source address is
    /// `addr`, and that `addr` is active right now. Call on every
    /// inbound valid packet.
    pub fn upsert(&self, node_id: u32, addr: SocketAddr) {
        let mut bindings = self.bindings.lock().unwrap();
        bindings.node_to_addr.insert(node_id, addr);
        bindings.last_active.insert(addr, Instant::now());
    }

    /// Record activity from `addr` without associating a node id (e.g.
    /// an ACK or PROBE that doesn't carry routing information worth
    /// keeping).
    pub fn touch_active(&self, addr: SocketAddr) {
        self.bindings
            .lock()
            .unwrap()
            .last_active
            .insert(addr, Instant::now());
    }

    pub fn lookup(&self, node_id: u32) -> Option<SocketAddr> {
        self.bindings.lock().unwrap().node_to_addr.get(&node_id).copied()
    }

    pub fn last_active(&self, addr: SocketAddr) -> Option<Instant> {
        self.bindings.lock().unwrap().last_active.get(&addr).copied()
    }

    fn sweep_loop(&self, sink: Arc<dyn OfflineSink>) {
        let tick = self.idle_scan_interval.min(Duration::from_millis(200));
        let mut last_sweep = Instant::now();
        while self.run.load(Ordering::Relaxed) {
            thread::sleep(tick);
            if !self.run.load(Ordering::Relaxed) {
                break;
            }
            if last_sweep.elapsed() >= self.idle_scan_interval {
                self.sweep_once(&sink, Instant::now());
                last_sweep = Instant::now();
            }
        }
    }

    /// One idle-scan pass: any address whose last activity predates
    /// `now - offline_threshold` is reported to `sink`. Split out from
    /// `sweep_loop` so tests can drive it deterministically.
    fn sweep_once(&self, sink: &Arc<dyn OfflineSink>, now: Instant) {
        let stale: Vec<SocketAddr> = {
            let bindings = self.bindings.lock().unwrap();
            bindings
                .last_active
                .iter()
                .filter(|(_, last)| now.duration_since(**last) > self.offline_threshold)
                .map(|(addr, _)| *addr)
                .collect()
        };
        for addr in stale {
            tracing::info!(%addr, "idle sweep marking address offline");
            sink.mark_offline(addr);
        }
    }

    pub fn shutdown(&self) {
        if !self.run.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        marked_offline: StdMutex<Vec<SocketAddr>>,
    }

    impl OfflineSink for RecordingSink {
        fn mark_offline(&self, addr: SocketAddr) {
            self.marked_offline.lock().unwrap().push(addr);
        }
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn upsert_then_lookup_round_trips() {
        let registry = SessionRegistry::new(Arc::new(NullSink));
        registry.upsert(7, addr(9001));
        assert_eq!(registry.lookup(7), Some(addr(9001)));
        registry.shutdown();
    }

    #[test]
    fn upsert_reflects_most_recent_address() {
        let registry = SessionRegistry::new(Arc::new(NullSink));
        registry.upsert(7, addr(9001));
        registry.upsert(7, addr(9002));
        assert_eq!(registry.lookup(7), Some(addr(9002)));
        registry.shutdown();
    }

    #[test]
    fn unknown_node_id_is_none() {
        let registry = SessionRegistry::new(Arc::new(NullSink));
        assert_eq!(registry.lookup(42), None);
        registry.shutdown();
    }

    #[test]
    fn idle_sweep_marks_stale_address_offline() {
        let sink = Arc::new(RecordingSink::default());
        let registry =
            SessionRegistry::with_intervals(sink.clone(), Duration::from_secs(30), Duration::from_secs(60));
        registry.upsert(1, addr(9003));

        let far_future = registry.last_active(addr(9003)).unwrap() + Duration::from_secs(120);
        registry.sweep_once(&(sink.clone() as Arc<dyn OfflineSink>), far_future);

        assert_eq!(sink.marked_offline.lock().unwrap().as_slice(), &[addr(9003)]);
        registry.shutdown();
    }

    #[test]
    fn fresh_address_is_not_swept() {
        let sink = Arc::new(RecordingSink::default());
        let registry =
            SessionRegistry::with_intervals(sink.clone(), Duration::from_secs(30), Duration::from_secs(60));
        registry.upsert(1, addr(9004));
        registry.sweep_once(&(sink.clone() as Arc<dyn OfflineSink>), Instant::now());
        assert!(sink.marked_offline.lock().unwrap().is_empty());
        registry.shutdown();
    }
}
