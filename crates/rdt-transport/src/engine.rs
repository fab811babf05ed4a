//! The transport engine: owns the datagram socket, the sequence counter,
//! the pending-send/pending-receive tables, and the receiver/sender
//! worker threads.
//!
//! Mutex discipline: `state` (the pending tables) is always acquired
//! before `liveness`; neither is ever held while an observer callback
//! runs.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use quanta::Instant;
use rand::Rng;
use rdt_wire::{AckStatus, Body, Codec, Module, Packet, WireError, MAX_FRAGMENT_BYTES};
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::events::{
    AckObserved, DeliveryComplete, DeliveryFailed, EndpointStatusChanged, EngineObserver,
    PacketObserved,
};
use crate::liveness::LivenessTable;
use crate::pending::{PendingReceiveTable, PendingSend, PendingSendTable, RecvKey, SendKey};

/// Default module/node id used by [`Engine::probe`], matching the
/// documented contract `probe(destination, module="node", node_id=0)`.
const PROBE_MODULE: &str = "node";
const PROBE_NODE_ID: u32 = 0;

#[derive(Default)]
struct EngineState {
    pending_send: PendingSendTable,
    pending_recv: PendingReceiveTable,
}

/// Owns the UDP endpoint and the ARQ/reassembly state machines described
/// in the transport engine component design. Constructed via
/// [`Engine::new`], which spawns the receiver and sender worker threads;
/// [`Engine::close`] (or dropping the last `Arc`) stops them.
pub struct Engine {
    socket: UdpSocket,
    codec: Codec,
    config: TransportConfig,
    local_addr: SocketAddr,
    state: Mutex<EngineState>,
    liveness: Mutex<LivenessTable>,
    observer: Arc<dyn EngineObserver>,
    sequence: AtomicU32,
    run: AtomicBool,
    kick_tx: Sender<()>,
    receiver_handle: Mutex<Option<JoinHandle<()>>>,
    sender_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Bind a UDP socket per `config.bind_addr` and start the receiver
    /// and sender worker threads.
    pub fn new(config: TransportConfig, observer: Arc<dyn EngineObserver>) -> io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(config.bind_addr)?;
        socket.set_read_timeout(Some(config.recv_read_timeout))?;
        let local_addr = socket.local_addr()?;
        let (kick_tx, kick_rx) = crossbeam_channel::unbounded();
        let seed = rand::rng().random::<u32>();

        let engine = Arc::new(Engine {
            codec: Codec::new(config.registry.clone()),
            socket,
            config,
            local_addr,
            state: Mutex::new(EngineState::default()),
            liveness: Mutex::new(LivenessTable::new()),
            observer,
            sequence: AtomicU32::new(seed),
            run: AtomicBool::new(true),
            kick_tx,
            receiver_handle: Mutex::new(None),
            sender_handle: Mutex::new(None),
        });

        let recv_engine = engine.clone();
        let receiver_handle = thread::Builder::new()
            .name("rdt-receiver".into())
            .spawn(move || recv_engine.receiver_loop())
            .expect("failed to spawn rdt-receiver thread");

        let send_engine = engine.clone();
        let sender_handle = thread::Builder::new()
            .name("rdt-sender".into())
            .spawn(move || send_engine.sender_loop(kick_rx))
            .expect("failed to spawn rdt-sender thread");

        *engine.receiver_handle.lock().unwrap() = Some(receiver_handle);
        *engine.sender_handle.lock().unwrap() = Some(sender_handle);

        info_bound(&engine);
        Ok(engine)
    }

    /// The address the underlying socket is actually bound to (useful
    /// when `bind_addr` requested port `0`).
    pub fn local_address(&self) -> SocketAddr {
        self.local_addr
    }

    /// Snapshot of whether `addr` is currently believed online.
    pub fn is_online(&self, addr: SocketAddr) -> bool {
        self.liveness.lock().unwrap().is_online(addr)
    }

    /// Force `addr` offline and emit `EndpointStatusChanged` if that's a
    /// transition. Exposed so an external idle scanner (the session
    /// registry's sweeper, on the server side) can drive the same
    /// liveness table the probe-exhaustion path below updates.
    pub fn mark_offline(&self, addr: SocketAddr) {
        let changed = self.liveness.lock().unwrap().mark_offline(addr);
        if changed {
            self.observer
                .on_endpoint_status_changed(EndpointStatusChanged { address: addr, online: false });
        }
    }

    /// Enqueue `payload` for delivery to `destination`, fragmenting it if
    /// it exceeds [`MAX_FRAGMENT_BYTES`]. Returns as soon as the pending
    /// entries are registered; transmission happens on the next
    /// retransmission-loop tick.
    pub fn send(
        &self,
        module: &str,
        node_id: u32,
        payload: Bytes,
        destination: SocketAddr,
    ) -> Result<(), TransportError> {
        if payload.is_empty() {
            return Err(TransportError::EmptyPayload);
        }
        let module_id = self
            .codec
            .registry()
            .id_of(module)
            .ok_or_else(|| WireError::UnknownModule(module.to_string()))?;
        let module_tag = Module::Named(module.to_string());
        let sequence = self.next_sequence();

        let mut state = self.state.lock().unwrap();
        if payload.len() <= MAX_FRAGMENT_BYTES {
            let packet = Packet {
                module: module_tag.clone(),
                node_id,
                body: Body::Full {
                    total_length: payload.len() as u32,
                    fragment_count: 1,
                    sequence,
                    payload: payload.clone(),
                },
            };
            let bytes = self.codec.build(&packet)?;
            let key = SendKey {
                module_id,
                node_id,
                sequence,
                fragment_index: 0,
            };
            state.pending_send.insert(
                key,
                PendingSend::new(bytes, destination, false, module_tag, node_id),
            );
        } else {
            let fragment_count =
                ((payload.len() + MAX_FRAGMENT_BYTES - 1) / MAX_FRAGMENT_BYTES) as u32;
            let header_packet = Packet {
                module: module_tag.clone(),
                node_id,
                body: Body::Header {
                    total_length: payload.len() as u32,
                    fragment_count,
                    sequence,
                },
            };
            let header_bytes = self.codec.build(&header_packet)?;
            let header_key = SendKey {
                module_id,
                node_id,
                sequence,
                fragment_index: 0,
            };
            state.pending_send.insert(
                header_key,
                PendingSend::new(header_bytes, destination, false, module_tag.clone(), node_id),
            );

            for index in 1..=fragment_count {
                let start = (index - 1) as usize * MAX_FRAGMENT_BYTES;
                let end = (start + MAX_FRAGMENT_BYTES).min(payload.len());
                let chunk = payload.slice(start..end);
                let data_packet = Packet {
                    module: module_tag.clone(),
                    node_id,
                    body: Body::Data {
                        sequence,
                        fragment_index: index,
                        payload: chunk,
                    },
                };
                let data_bytes = self.codec.build(&data_packet)?;
                let data_key = SendKey {
                    module_id,
                    node_id,
                    sequence,
                    fragment_index: index,
                };
                state.pending_send.insert(
                    data_key,
                    PendingSend::new(data_bytes, destination, false, module_tag.clone(), node_id),
                );
            }
        }
        drop(state);
        let _ = self.kick_tx.send(());
        Ok(())
    }

    /// Enqueue a single liveness probe against `destination`, on the
    /// `node`/`0` module/node-id pair per the documented default.
    pub fn probe(&self, destination: SocketAddr) -> Result<(), TransportError> {
        let module_id = self
            .codec
            .registry()
            .id_of(PROBE_MODULE)
            .expect("default module registry always contains \"node\"");
        let sequence = self.next_sequence();
        let packet = Packet {
            module: Module::Named(PROBE_MODULE.to_string()),
            node_id: PROBE_NODE_ID,
            body: Body::Probe {
                fragment_index: 0,
                sequence,
            },
        };
        let bytes = self.codec.build(&packet)?;
        let key = SendKey {
            module_id,
            node_id: PROBE_NODE_ID,
            sequence,
            fragment_index: 0,
        };
        let mut state = self.state.lock().unwrap();
        state.pending_send.insert(
            key,
            PendingSend::new(
                bytes,
                destination,
                true,
                Module::Named(PROBE_MODULE.to_string()),
                PROBE_NODE_ID,
            ),
        );
        drop(state);
        let _ = self.kick_tx.send(());
        Ok(())
    }

    /// Stop the receiver and sender loops and release the socket.
    /// Idempotent.
    pub fn close(&self) {
        if !self.run.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.kick_tx.send(());
        if let Some(handle) = self.sender_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.receiver_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        debug!("transport engine closed");
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn receiver_loop(&self) {
        let mut buf = vec![0u8; 65535];
        while self.run.load(Ordering::Relaxed) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, source)) => self.handle_inbound(&buf[..len], source),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => warn!(error = %e, "datagram read failed"),
            }
        }
        debug!("receiver loop exiting");
    }

    fn sender_loop(&self, kick_rx: Receiver<()>) {
        while self.run.load(Ordering::Relaxed) {
            match kick_rx.recv_timeout(self.config.send_poll_timeout) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if !self.run.load(Ordering::Relaxed) {
                break;
            }
            self.retransmission_pass();
            self.sweep_stale_receives();
        }
        debug!("sender loop exiting");
    }

    /// One pass over the pending-send table: first transmission for
    /// fresh entries, retransmission for timed-out ones, failure for
    /// entries that have exhausted `max_retries`.
    fn retransmission_pass(&self) {
        let mut failed_keys = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for (key, entry) in state.pending_send.iter_mut() {
                if !entry.sent {
                    let _ = self.socket.send_to(&entry.bytes, entry.destination);
                    entry.sent = true;
                    entry.last_sent = Some(Instant::now());
                    continue;
                }
                let Some(last_sent) = entry.last_sent else {
                    continue;
                };
                if last_sent.elapsed() <= self.config.retry_interval {
                    continue;
                }
                if entry.retry_count < self.config.max_retries {
                    let _ = self.socket.send_to(&entry.bytes, entry.destination);
                    entry.retry_count += 1;
                    entry.last_sent = Some(Instant::now());
                } else {
                    failed_keys.push(*key);
                }
            }
        }

        // Remove and react to exhausted entries outside the lock scope
        // above so that observer callbacks never run with `state` held.
        let mut state = self.state.lock().unwrap();
        let failed: Vec<PendingSend> = failed_keys
            .iter()
            .filter_map(|key| state.pending_send.remove(key))
            .collect();
        drop(state);

        for entry in failed {
            warn!(destination = %entry.destination, "max retries exceeded");
            self.observer.on_delivery_failed(DeliveryFailed {
                module: entry.module,
                node_id: entry.node_id,
                reason: "max retries exceeded",
                destination: entry.destination,
            });
            if entry.is_probe {
                self.mark_offline(entry.destination);
            }
        }
    }

    fn sweep_stale_receives(&self) {
        let removed = self
            .state
            .lock()
            .unwrap()
            .pending_recv
            .sweep_stale(self.config.recv_ttl);
        if removed > 0 {
            debug!(removed, "reclaimed stale pending-receive entries");
        }
    }

    fn handle_inbound(&self, data: &[u8], source: SocketAddr) {
        let Some(packet) = self.codec.parse(data) else {
            return;
        };
        let module_id = wire_id(&self.codec, &packet.module);
        let node_id = packet.node_id;

        let revived = self.liveness.lock().unwrap().touch_activity(source);
        if revived {
            self.observer
                .on_endpoint_status_changed(EndpointStatusChanged { address: source, online: true });
        }
        self.observer
            .on_packet_observed(PacketObserved { node_id, source });

        match packet.body {
            Body::Header {
                total_length,
                fragment_count,
                sequence,
            } => {
                self.send_ack(source, packet.module.clone(), node_id, AckStatus::Confirm, 0, sequence);
                let key = RecvKey {
                    source,
                    module_id,
                    node_id,
                    sequence,
                };
                self.apply_header_and_maybe_deliver(key, packet.module, total_length, fragment_count);
            }
            Body::Data {
                sequence,
                fragment_index,
                payload,
            } => {
                self.send_ack(
                    source,
                    packet.module.clone(),
                    node_id,
                    AckStatus::Confirm,
                    fragment_index,
                    sequence,
                );
                let key = RecvKey {
                    source,
                    module_id,
                    node_id,
                    sequence,
                };
                self.apply_data_and_maybe_deliver(key, packet.module, fragment_index, payload);
            }
            Body::Full {
                sequence, payload, ..
            } => {
                self.send_ack(source, packet.module.clone(), node_id, AckStatus::Confirm, 0, sequence);
                self.observer.on_delivery_complete(DeliveryComplete {
                    module: packet.module,
                    node_id,
                    payload,
                    source,
                });
            }
            Body::Ack {
                status,
                fragment_index,
                sequence,
            } => self.handle_ack(packet.module, module_id, node_id, status, fragment_index, sequence, source),
            Body::Probe {
                fragment_index,
                sequence,
            } => self.send_ack(
                source,
                packet.module,
                node_id,
                AckStatus::ProbeReply,
                fragment_index,
                sequence,
            ),
        }
    }

    fn apply_header_and_maybe_deliver(
        &self,
        key: RecvKey,
        module: Module,
        total_length: u32,
        fragment_count: u32,
    ) {
        let assembled: Option<Option<Bytes>> = {
            let mut state = self.state.lock().unwrap();
            let entry = state.pending_recv.on_header(key.clone(), total_length, fragment_count);
            if !entry.is_complete() {
                None
            } else {
                let bytes = entry.assemble();
                state.pending_recv.remove(&key);
                Some(bytes)
            }
        };
        self.deliver_if_assembled(assembled, module, key.node_id, key.source);
    }

    fn apply_data_and_maybe_deliver(
        &self,
        key: RecvKey,
        module: Module,
        fragment_index: u32,
        payload: Bytes,
    ) {
        let assembled: Option<Option<Bytes>> = {
            let mut state = self.state.lock().unwrap();
            let entry = state.pending_recv.on_data(key.clone(), fragment_index, payload);
            if !entry.is_complete() {
                None
            } else {
                let bytes = entry.assemble();
                state.pending_recv.remove(&key);
                Some(bytes)
            }
        };
        self.deliver_if_assembled(assembled, module, key.node_id, key.source);
    }

    fn deliver_if_assembled(
        &self,
        assembled: Option<Option<Bytes>>,
        module: Module,
        node_id: u32,
        source: SocketAddr,
    ) {
        match assembled {
            None => {}
            Some(None) => {
                warn!(node_id, %source, "reassembled length mismatch, discarding message");
            }
            Some(Some(payload)) => {
                self.observer.on_delivery_complete(DeliveryComplete {
                    module,
                    node_id,
                    payload,
                    source,
                });
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_ack(
        &self,
        module: Module,
        module_id: u32,
        node_id: u32,
        status: AckStatus,
        fragment_index: u32,
        sequence: u32,
        source: SocketAddr,
    ) {
        let key = SendKey {
            module_id,
            node_id,
            sequence,
            fragment_index,
        };
        match status {
            AckStatus::Confirm => {
                let removed = self.state.lock().unwrap().pending_send.remove(&key).is_some();
                if removed {
                    self.observer.on_ack_observed(AckObserved {
                        module,
                        node_id,
                        sequence,
                        source,
                    });
                }
            }
            AckStatus::Retransmit => {
                let mut state = self.state.lock().unwrap();
                if let Some(entry) = state.pending_send.get_mut(&key) {
                    entry.last_sent = None;
                    entry.sent = false;
                    entry.retry_count = entry.retry_count.saturating_add(1);
                }
            }
            AckStatus::ProbeReply => {
                self.state.lock().unwrap().pending_send.remove(&key);
                let changed = self.liveness.lock().unwrap().mark_online(source);
                if changed {
                    self.observer
                        .on_endpoint_status_changed(EndpointStatusChanged {
                            address: source,
                            online: true,
                        });
                }
            }
            AckStatus::Normal => {
                warn!(node_id, %source, "unexpected ack_status Normal on inbound ACK, ignoring");
            }
        }
    }

    fn send_ack(
        &self,
        destination: SocketAddr,
        module: Module,
        node_id: u32,
        status: AckStatus,
        fragment_index: u32,
        sequence: u32,
    ) {
        let packet = Packet {
            module,
            node_id,
            body: Body::Ack {
                status,
                fragment_index,
                sequence,
            },
        };
        match self.codec.build(&packet) {
            Ok(bytes) => {
                let _ = self.socket.send_to(&bytes, destination);
            }
            Err(e) => warn!(error = %e, "failed to build ack packet"),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

fn wire_id(codec: &Codec, module: &Module) -> u32 {
    match module {
        Module::Named(name) => codec.registry().id_of(name).unwrap_or(u32::MAX),
        Module::Unknown(id) => *id,
    }
}

fn info_bound(engine: &Arc<Engine>) {
    tracing::info!(local_addr = %engine.local_address(), "transport engine bound and listening");
}
