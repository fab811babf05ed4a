//! The application-facing dispatcher: wires a transport engine, the
//! client/server addressing rules, payload encoding, module routing and
//! the outer send queue into one handle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rdt_registry::{OfflineSink, SessionRegistry};
use rdt_transport::{
    DeliveryComplete, DeliveryFailed, Engine, EngineObserver, EndpointStatusChanged,
    PacketObserved,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{DispatcherConfig, Role};
use crate::error::DispatchError;
use crate::handlers::HandlerRegistry;
use crate::payload;
use crate::queue::{SendJob, SendQueue};

/// Forwards the session registry's idle-sweep verdicts into the
/// transport engine's own liveness table, so `Engine::is_online` reflects
/// server-side idle scanning the same way it reflects client-side probe
/// exhaustion.
///
/// The registry is built before the engine exists (the engine's observer
/// holds a handle to the registry), so the engine handle is filled in
/// once construction finishes rather than threaded through at creation.
#[derive(Default)]
struct EngineOfflineSink {
    engine: OnceLock<Arc<Engine>>,
}

impl OfflineSink for EngineOfflineSink {
    fn mark_offline(&self, addr: SocketAddr) {
        match self.engine.get() {
            Some(engine) => engine.mark_offline(addr),
            None => warn!(%addr, "idle sweep fired before engine was attached, dropping"),
        }
    }
}

/// Routes completed deliveries to registered handlers and keeps the
/// session registry's peer bindings current.
struct DeliveryRouter {
    registry: Option<Arc<SessionRegistry>>,
    handlers: Arc<HandlerRegistry>,
}

impl EngineObserver for DeliveryRouter {
    fn on_packet_observed(&self, event: PacketObserved) {
        if let Some(registry) = &self.registry {
            registry.upsert(event.node_id, event.source);
        }
    }

    fn on_delivery_complete(&self, event: DeliveryComplete) {
        let module_name = event.module.as_display_name();
        let Some(handler) = self.handlers.get(&module_name) else {
            warn!(module = %module_name, "no handler registered, dropping delivery");
            return;
        };
        match payload::decode(&event.payload) {
            Ok(value) => handler(event.node_id, value, event.source),
            Err(err) => warn!(module = %module_name, %err, "failed to decode delivered payload"),
        }
    }

    fn on_delivery_failed(&self, event: DeliveryFailed) {
        warn!(
            module = %event.module.as_display_name(),
            node_id = event.node_id,
            destination = %event.destination,
            reason = event.reason,
            "delivery failed"
        );
    }

    fn on_endpoint_status_changed(&self, event: EndpointStatusChanged) {
        info!(address = %event.address, online = event.online, "endpoint status changed");
    }
}

/// Periodic liveness prober for the client role: fires `Engine::probe`
/// against the fixed peer address every `probe_interval`, since the
/// client never sees inbound traffic to infer liveness from.
struct ProbeLoop {
    run: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProbeLoop {
    fn spawn(engine: Arc<Engine>, peer_addr: SocketAddr, interval: Duration) -> Self {
        let run = Arc::new(AtomicBool::new(true));
        let worker_run = run.clone();
        let handle = thread::Builder::new()
            .name("rdt-liveness-probe".into())
            .spawn(move || {
                let tick = interval.min(Duration::from_millis(200));
                let mut last_probe = std::time::Instant::now();
                while worker_run.load(Ordering::Relaxed) {
                    thread::sleep(tick);
                    if !worker_run.load(Ordering::Relaxed) {
                        break;
                    }
                    if last_probe.elapsed() >= interval {
                        if let Err(err) = engine.probe(peer_addr) {
                            warn!(%err, "periodic liveness probe failed to enqueue");
                        }
                        last_probe = std::time::Instant::now();
                    }
                }
            })
            .expect("failed to spawn rdt-liveness-probe thread");

        ProbeLoop {
            run,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn shutdown(&self) {
        if !self.run.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Application-facing handle over a transport engine. Construct one per
/// process; `client` dispatchers have a single fixed peer, `server`
/// dispatchers address peers by node id via the session registry.
pub struct Dispatcher {
    engine: Arc<Engine>,
    registry: Option<Arc<SessionRegistry>>,
    handlers: Arc<HandlerRegistry>,
    queue: SendQueue,
    probe_loop: Option<ProbeLoop>,
    role: Role,
    node_id: u32,
}

impl Dispatcher {
    /// Bring up the transport engine (and, for server role, the session
    /// registry and its idle sweeper; for client role, the periodic
    /// liveness prober) and start the send-queue worker. `handlers` is
    /// built by the caller beforehand via [`HandlerRegistry::register`]
    /// and shared with the returned dispatcher.
    pub fn new(config: DispatcherConfig, handlers: Arc<HandlerRegistry>) -> std::io::Result<Arc<Self>> {
        let offline_sink = Arc::new(EngineOfflineSink::default());
        let registry = match &config.role {
            Role::Server => Some(SessionRegistry::with_intervals(
                offline_sink.clone(),
                config.idle_scan_interval,
                config.offline_threshold,
            )),
            Role::Client { .. } => None,
        };

        let observer = Arc::new(DeliveryRouter {
            registry: registry.clone(),
            handlers: handlers.clone(),
        });
        let engine = Engine::new(config.transport, observer)?;
        let _ = offline_sink.engine.set(engine.clone());
        let queue = SendQueue::new(engine.clone(), config.queue_capacity);

        let probe_loop = match &config.role {
            Role::Client { peer_addr } => {
                Some(ProbeLoop::spawn(engine.clone(), *peer_addr, config.probe_interval))
            }
            Role::Server => None,
        };

        Ok(Arc::new(Dispatcher {
            engine,
            registry,
            handlers,
            queue,
            probe_loop,
            role: config.role,
            node_id: config.node_id,
        }))
    }

    pub fn local_address(&self) -> SocketAddr {
        self.engine.local_address()
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Snapshot of whether `addr` is currently believed online, per the
    /// underlying transport engine's liveness table.
    pub fn is_online(&self, addr: SocketAddr) -> bool {
        self.engine.is_online(addr)
    }

    /// Encode `value` and enqueue it for delivery to `node_id` (server
    /// role) or the configured peer (client role). For the client role
    /// the wire-level node id is always this dispatcher's own configured
    /// `node_id` — the `node_id` argument only selects the destination
    /// and is meaningless there, since a client has exactly one peer.
    /// Returns once the job is queued; actual transmission and its own
    /// three-attempt outer retry happen on the send-queue worker thread.
    pub fn send(&self, module: &str, node_id: u32, value: &Value) -> Result<(), DispatchError> {
        let destination = self.resolve_destination(node_id)?;
        let payload = payload::encode(value)?;
        let wire_node_id = match &self.role {
            Role::Client { .. } => self.node_id,
            Role::Server => node_id,
        };
        let job = SendJob {
            module: module.to_string(),
            node_id: wire_node_id,
            payload,
            destination,
        };
        self.queue.try_enqueue(job).map_err(|_| DispatchError::QueueFull)
    }

    fn resolve_destination(&self, node_id: u32) -> Result<SocketAddr, DispatchError> {
        match &self.role {
            Role::Client { peer_addr } => {
                if !self.engine.is_online(*peer_addr) {
                    return Err(DispatchError::Offline(*peer_addr));
                }
                Ok(*peer_addr)
            }
            Role::Server => {
                let registry = self
                    .registry
                    .as_ref()
                    .expect("server role always constructs a session registry");
                let addr = registry
                    .lookup(node_id)
                    .ok_or(DispatchError::UnknownPeer(node_id))?;
                if !self.engine.is_online(addr) {
                    return Err(DispatchError::Offline(addr));
                }
                Ok(addr)
            }
        }
    }

    pub fn probe(&self, destination: SocketAddr) -> Result<(), DispatchError> {
        self.engine.probe(destination)?;
        Ok(())
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Stop the send queue, the liveness prober (client) or idle sweeper
    /// (server), and close the transport engine. Idempotent only in the
    /// sense that each component's own shutdown is idempotent; safe to
    /// call once before drop.
    pub fn shutdown(&self) {
        self.queue.shutdown();
        if let Some(probe_loop) = &self.probe_loop {
            probe_loop.shutdown();
        }
        self.engine.close();
        if let Some(registry) = &self.registry {
            registry.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfigInput;
    use rdt_transport::TransportConfigInput;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        predicate()
    }

    fn server_config() -> DispatcherConfig {
        let mut input = DispatcherConfigInput::default();
        input.role = Some("server".to_string());
        let mut transport = TransportConfigInput::default();
        transport.bind_addr = Some("127.0.0.1:0".to_string());
        input.transport = transport;
        input.into_config().unwrap()
    }

    fn client_config(peer: SocketAddr) -> DispatcherConfig {
        let mut input = DispatcherConfigInput::default();
        input.role = Some("client".to_string());
        input.peer_addr = Some(peer.to_string());
        input.node_id = Some(1);
        let mut transport = TransportConfigInput::default();
        transport.bind_addr = Some("127.0.0.1:0".to_string());
        input.transport = transport;
        input.into_config().unwrap()
    }

    #[test]
    fn client_send_before_handshake_is_offline() {
        let server_handlers = Arc::new(HandlerRegistry::new());
        let server = Dispatcher::new(server_config(), server_handlers).unwrap();
        let client_handlers = Arc::new(HandlerRegistry::new());
        let client = Dispatcher::new(client_config(server.local_address()), client_handlers).unwrap();

        let err = client.send("node", 0, &json!({"hello": "world"})).unwrap_err();
        assert!(matches!(err, DispatchError::Offline(_)));

        client.shutdown();
        server.shutdown();
    }

    #[test]
    fn server_send_to_unknown_node_is_rejected() {
        let server_handlers = Arc::new(HandlerRegistry::new());
        let server = Dispatcher::new(server_config(), server_handlers).unwrap();

        let err = server.send("node", 42, &json!({"a": 1})).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownPeer(42)));

        server.shutdown();
    }

    #[test]
    fn probe_then_send_round_trips_through_handler() {
        let received = Arc::new(AtomicBool::new(false));
        let received_in_handler = received.clone();

        let server_handlers = Arc::new(HandlerRegistry::new());
        server_handlers.register("telemetry", move |_node_id, value, _source| {
            if value.get("reading").is_some() {
                received_in_handler.store(true, Ordering::SeqCst);
            }
        });
        let server = Dispatcher::new(server_config(), server_handlers).unwrap();

        let client_handlers = Arc::new(HandlerRegistry::new());
        let client = Dispatcher::new(client_config(server.local_address()), client_handlers).unwrap();

        client.probe(server.local_address()).unwrap();
        assert!(wait_until(
            || client.engine.is_online(server.local_address()),
            Duration::from_secs(2)
        ));

        client
            .send("telemetry", 0, &json!({"reading": 99}))
            .unwrap();
        assert!(wait_until(
            || received.load(Ordering::SeqCst),
            Duration::from_secs(2)
        ));

        client.shutdown();
        server.shutdown();
    }

    #[test]
    fn periodic_probe_marks_peer_online_without_manual_probe() {
        let server_handlers = Arc::new(HandlerRegistry::new());
        let server = Dispatcher::new(server_config(), server_handlers).unwrap();

        let mut input = DispatcherConfigInput::default();
        input.role = Some("client".to_string());
        input.peer_addr = Some(server.local_address().to_string());
        input.probe_interval_ms = Some(30);
        let mut transport = TransportConfigInput::default();
        transport.bind_addr = Some("127.0.0.1:0".to_string());
        input.transport = transport;
        let client_handlers = Arc::new(HandlerRegistry::new());
        let client = Dispatcher::new(input.into_config().unwrap(), client_handlers).unwrap();

        assert!(wait_until(
            || client.engine.is_online(server.local_address()),
            Duration::from_secs(2)
        ));

        client.shutdown();
        server.shutdown();
    }

    #[test]
    fn each_module_is_routed_only_to_its_own_handler() {
        let node_hits = Arc::new(Mutex::new(Vec::new()));
        let database_hits = Arc::new(Mutex::new(Vec::new()));
        let node_hits_cb = node_hits.clone();
        let database_hits_cb = database_hits.clone();

        let server_handlers = Arc::new(HandlerRegistry::new());
        server_handlers.register("node", move |_node_id, value, _source| {
            node_hits_cb.lock().unwrap().push(value);
        });
        server_handlers.register("database", move |_node_id, value, _source| {
            database_hits_cb.lock().unwrap().push(value);
        });
        let server = Dispatcher::new(server_config(), server_handlers).unwrap();

        let client_handlers = Arc::new(HandlerRegistry::new());
        let client = Dispatcher::new(client_config(server.local_address()), client_handlers).unwrap();
        client.probe(server.local_address()).unwrap();
        assert!(wait_until(
            || client.engine.is_online(server.local_address()),
            Duration::from_secs(2)
        ));

        client.send("node", 0, &json!({"kind": "node"})).unwrap();
        client.send("database", 0, &json!({"kind": "database"})).unwrap();

        assert!(wait_until(
            || node_hits.lock().unwrap().len() == 1 && database_hits.lock().unwrap().len() == 1,
            Duration::from_secs(2)
        ));
        assert_eq!(node_hits.lock().unwrap()[0]["kind"], "node");
        assert_eq!(database_hits.lock().unwrap()[0]["kind"], "database");

        client.shutdown();
        server.shutdown();
    }

    #[test]
    fn server_idle_sweep_refuses_send_to_stale_peer() {
        let server_handlers = Arc::new(HandlerRegistry::new());
        let mut input = DispatcherConfigInput::default();
        input.role = Some("server".to_string());
        input.idle_scan_interval_ms = Some(20);
        input.offline_threshold_ms = Some(20);
        let mut transport = TransportConfigInput::default();
        transport.bind_addr = Some("127.0.0.1:0".to_string());
        input.transport = transport;
        let server = Dispatcher::new(input.into_config().unwrap(), server_handlers).unwrap();

        let client_handlers = Arc::new(HandlerRegistry::new());
        let client = Dispatcher::new(client_config(server.local_address()), client_handlers).unwrap();
        client.probe(server.local_address()).unwrap();
        assert!(wait_until(
            || client.engine.is_online(server.local_address()),
            Duration::from_secs(2)
        ));
        client.send("node", client.node_id(), &json!({"a": 1})).unwrap();
        assert!(wait_until(
            || server.registry.as_ref().unwrap().lookup(client.node_id()).is_some(),
            Duration::from_secs(2)
        ));

        assert!(wait_until(
            || !server.engine.is_online(client.local_address()),
            Duration::from_secs(2)
        ));

        let err = server.send("node", client.node_id(), &json!({"a": 1})).unwrap_err();
        assert!(matches!(err, DispatchError::Offline(_)));

        client.shutdown();
        server.shutdown();
    }
}
