//! Bounded FIFO send queue with a dedicated worker thread.
//!
//! This is the dispatcher's *outer* retry: up to three attempts, a
//! second apart, covering synchronous failures from
//! `rdt_transport::Engine::send` (an unresolvable module, a socket
//! error). It is orthogonal to the transport's own ACK-driven
//! retransmission loop, which covers packets that went out fine but were
//! never acknowledged.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use rdt_transport::Engine;
use tracing::warn;

const MAX_SEND_ATTEMPTS: u8 = 3;
const ATTEMPT_PAUSE: Duration = Duration::from_secs(1);

pub struct SendJob {
    pub module: String,
    pub node_id: u32,
    pub payload: Bytes,
    pub destination: SocketAddr,
}

/// Owns the bounded channel and the worker thread that drains it.
/// Dropping cancels outstanding jobs and joins the worker.
pub struct SendQueue {
    tx: Sender<SendJob>,
    run: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SendQueue {
    pub fn new(engine: Arc<Engine>, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        let run = Arc::new(AtomicBool::new(true));
        let worker_run = run.clone();

        let handle = thread::Builder::new()
            .name("rdt-send-queue".into())
            .spawn(move || worker_loop(engine, rx, worker_run))
            .expect("failed to spawn rdt-send-queue thread");

        SendQueue {
            tx,
            run,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue a job. Returns `Err` (queue full) without blocking; the
    /// caller surfaces this as `DispatchError::QueueFull`.
    pub fn try_enqueue(&self, job: SendJob) -> Result<(), SendJob> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => Err(job),
            Err(TrySendError::Disconnected(job)) => Err(job),
        }
    }

    /// Stop the worker and drop any jobs still queued. Idempotent.
    pub fn shutdown(&self) {
        if !self.run.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SendQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(engine: Arc<Engine>, rx: Receiver<SendJob>, run: Arc<AtomicBool>) {
    loop {
        if !run.load(Ordering::Relaxed) {
            return;
        }
        let job = match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        if !run.load(Ordering::Relaxed) {
            return;
        }
        send_with_retry(&engine, job);
    }
}

fn send_with_retry(engine: &Arc<Engine>, job: SendJob) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match engine.send(&job.module, job.node_id, job.payload.clone(), job.destination) {
            Ok(()) => return,
            Err(err) if attempt < MAX_SEND_ATTEMPTS => {
                warn!(module = %job.module, node_id = job.node_id, attempt, %err, "send attempt failed, retrying");
                thread::sleep(ATTEMPT_PAUSE);
            }
            Err(err) => {
                warn!(module = %job.module, node_id = job.node_id, attempt, %err, "send failed after max attempts");
                return;
            }
        }
    }
}
