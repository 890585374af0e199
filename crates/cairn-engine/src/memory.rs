//! In-process scheduler driving operations over a transport.
//!
//! [`MemoryScheduler`] is the reference selection layer. A single worker
//! drains three priority queues highest-first, dispatches one attempt at a
//! time over the configured transport, and sweeps a timed list of cooling
//! keys. Because dispatches never overlap, outcome processing is strictly
//! ordered. Node integrations bring their own scheduler; operations only
//! ever see the [`Scheduler`] trait.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use cairn_core::config::EngineConfig;
use cairn_core::key::RoutingKey;

use crate::request::{now_millis, OperationId};
use crate::scheduler::{BlockTransport, DedupToken, DynOperation, Scheduler};

const SWEEP_INTERVAL_MS: u64 = 50;

pub struct MemoryScheduler {
    inner: Arc<Inner>,
    shutdown_tx: broadcast::Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryScheduler {
    /// Spawn the worker on the current tokio runtime.
    pub fn new(transport: Arc<dyn BlockTransport>, config: &EngineConfig) -> Arc<Self> {
        let inner = Arc::new(Inner {
            operations: DashMap::new(),
            in_flight: DashMap::new(),
            queues: Mutex::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
            cooldown: Mutex::new(Vec::new()),
            transport,
            cooldown_ms: config.transfer.cooldown_secs.saturating_mul(1_000),
            work: Notify::new(),
        });
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = tokio::spawn(run(inner.clone(), shutdown_rx));
        Arc::new(Self {
            inner,
            shutdown_tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stop the worker. Anything still queued stays queued but is no
    /// longer dispatched.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Operations currently known to the scheduler.
    pub fn pending_len(&self) -> usize {
        self.inner.operations.len()
    }
}

impl Scheduler for MemoryScheduler {
    fn register(&self, op: DynOperation, is_persistent: bool, is_retry: bool) {
        self.inner.register(op, is_persistent, is_retry);
    }

    fn register_cooldown(&self, key: &RoutingKey, op: DynOperation) -> u64 {
        self.inner.register_cooldown(key, op)
    }

    fn remove_pending(&self, id: OperationId) {
        self.inner.remove_pending(id);
    }

    fn in_flight_contains(&self, token: &DedupToken) -> bool {
        self.inner.in_flight_contains(token)
    }
}

impl Drop for MemoryScheduler {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.abort();
        }
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

struct CooldownEntry {
    wake: u64,
    id: OperationId,
}

struct Inner {
    operations: DashMap<OperationId, DynOperation>,
    in_flight: DashMap<DedupToken, OperationId>,
    /// One FIFO per priority class, scanned highest-first.
    queues: Mutex<[VecDeque<OperationId>; 3]>,
    cooldown: Mutex<Vec<CooldownEntry>>,
    transport: Arc<dyn BlockTransport>,
    cooldown_ms: u64,
    work: Notify,
}

async fn run(inner: Arc<Inner>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut sweep = tokio::time::interval(Duration::from_millis(SWEEP_INTERVAL_MS));
    tracing::debug!("scheduler worker started");
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = inner.work.notified() => {}
            _ = sweep.tick() => inner.requeue_due(),
        }
        drain(&inner).await;
    }
    tracing::debug!("scheduler worker stopped");
}

/// Dispatch queued operations until every queue is empty. Operations that
/// refuse selection but are still live go back to the end of their queue
/// for the next pass.
async fn drain(inner: &Arc<Inner>) {
    let mut deferred = Vec::new();
    while let Some(op) = inner.pop_candidate() {
        if !op.has_dispatchable_key(inner.as_ref()) {
            if !op.is_finished() {
                deferred.push(op);
            }
            continue;
        }
        let Some(token) = op.choose(inner.as_ref()) else {
            if !op.is_finished() {
                deferred.push(op);
            }
            continue;
        };
        let dedup = token.dedup_token().clone();
        inner.in_flight.insert(dedup.clone(), op.id());
        let worker_op = op.clone();
        let worker_inner = inner.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let transport = worker_inner.transport.clone();
            worker_op.dispatch(token, transport.as_ref(), worker_inner.as_ref());
        })
        .await;
        inner.in_flight.remove(&dedup);
        if let Err(err) = outcome {
            tracing::warn!(op = %op.id(), %err, "dispatch task failed");
        }
    }
    for op in deferred {
        inner.requeue_deferred(op);
    }
}

impl Inner {
    fn pop_candidate(&self) -> Option<DynOperation> {
        let mut queues = self.queues.lock().unwrap();
        for queue in queues.iter_mut() {
            while let Some(id) = queue.pop_front() {
                let op = match self.operations.get(&id) {
                    Some(entry) => entry.clone(),
                    None => continue,
                };
                if op.is_finished() {
                    self.operations.remove(&id);
                    continue;
                }
                return Some(op);
            }
        }
        None
    }

    fn requeue_deferred(&self, op: DynOperation) {
        let id = op.id();
        let priority = op.priority_class();
        self.operations.insert(id, op);
        self.queues.lock().unwrap()[priority.index()].push_back(id);
    }

    /// Move every cooldown entry whose deadline passed back through its
    /// operation. Stale entries for finished operations fall out inside
    /// `requeue_after_cooldown`.
    fn requeue_due(&self) {
        let now = now_millis();
        let due: Vec<CooldownEntry> = {
            let mut cooldown = self.cooldown.lock().unwrap();
            let (due, keep): (Vec<_>, Vec<_>) =
                cooldown.drain(..).partition(|entry| entry.wake <= now);
            *cooldown = keep;
            due
        };
        for entry in due {
            let op = match self.operations.get(&entry.id) {
                Some(found) => found.clone(),
                None => continue,
            };
            op.requeue_after_cooldown(entry.wake, self);
        }
    }
}

impl Scheduler for Inner {
    fn register(&self, op: DynOperation, _is_persistent: bool, is_retry: bool) {
        let id = op.id();
        let priority = op.priority_class();
        self.operations.insert(id, op);
        {
            let mut queues = self.queues.lock().unwrap();
            let queue = &mut queues[priority.index()];
            // retries cut the line within their class
            if is_retry {
                queue.push_front(id);
            } else {
                queue.push_back(id);
            }
        }
        tracing::trace!(op = %id, %priority, is_retry, "operation queued");
        self.work.notify_one();
    }

    fn register_cooldown(&self, key: &RoutingKey, op: DynOperation) -> u64 {
        let id = op.id();
        let wake = now_millis() + self.cooldown_ms;
        self.operations.insert(id, op);
        self.cooldown
            .lock()
            .unwrap()
            .push(CooldownEntry { wake, id });
        tracing::debug!(op = %id, %key, wake, "key parked on the cooldown queue");
        wake
    }

    fn remove_pending(&self, id: OperationId) {
        self.operations.remove(&id);
        let mut queues = self.queues.lock().unwrap();
        for queue in queues.iter_mut() {
            queue.retain(|queued| *queued != id);
        }
    }

    fn in_flight_contains(&self, token: &DedupToken) -> bool {
        self.in_flight.contains_key(token)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
