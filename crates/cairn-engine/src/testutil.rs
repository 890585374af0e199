//! Test doubles shared by the engine unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use cairn_core::block::Block;
use cairn_core::buffer::MemoryBuffer;
use cairn_core::codec::{self, InsertTarget};
use cairn_core::failure::{TransferError, TransportFailure};
use cairn_core::key::{KeyDescriptor, RoutingKey};

use crate::events::CompletionHandler;
use crate::request::{now_millis, OperationId};
use crate::scheduler::{BlockTransport, DedupToken, DynOperation, Priority, Scheduler};

/// Encode `data` into a content-hash block for feeding transports.
pub(crate) fn chk_block(data: &[u8]) -> Block {
    let buffer = MemoryBuffer::new(Bytes::copy_from_slice(data));
    codec::encode(
        &buffer,
        false,
        None,
        data.len() as u32,
        &InsertTarget::ContentHash,
    )
    .unwrap()
}

// ── RecordingHandler ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) enum HandlerEvent {
    Fetched(Block),
    Inserted(String),
    Encoded(KeyDescriptor),
    Failed(TransferError),
}

impl HandlerEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HandlerEvent::Encoded(_))
    }
}

/// Records every callback in arrival order.
pub(crate) struct RecordingHandler {
    pub events: Mutex<Vec<HandlerEvent>>,
    priority: Priority,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Self::with_priority(Priority::Bulk)
    }

    pub fn with_priority(priority: Priority) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            priority,
        })
    }

    pub fn terminal_count(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.is_terminal())
            .count()
    }
}

impl CompletionHandler for RecordingHandler {
    fn on_block_fetched(&self, block: Block) {
        self.events.lock().unwrap().push(HandlerEvent::Fetched(block));
    }

    fn on_block_inserted(&self, uri: String) {
        self.events.lock().unwrap().push(HandlerEvent::Inserted(uri));
    }

    fn on_encoded(&self, key: KeyDescriptor) {
        self.events.lock().unwrap().push(HandlerEvent::Encoded(key));
    }

    fn on_failed(&self, error: TransferError) {
        self.events.lock().unwrap().push(HandlerEvent::Failed(error));
    }

    fn priority_class(&self) -> Priority {
        self.priority
    }
}

// ── ScriptedTransport ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) enum ScriptStep {
    FetchOk(Bytes),
    InsertOk,
    Fail(TransportFailure),
}

/// Transport whose outcomes are scripted in advance. Running off the end
/// of the script panics the test.
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<ScriptStep>>,
    pub fetch_calls: AtomicU32,
    pub insert_calls: AtomicU32,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<ScriptStep>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            fetch_calls: AtomicU32::new(0),
            insert_calls: AtomicU32::new(0),
        })
    }
}

impl BlockTransport for ScriptedTransport {
    fn fetch_block(&self, _key: &KeyDescriptor) -> Result<Bytes, TransportFailure> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(ScriptStep::FetchOk(bytes)) => Ok(bytes),
            Some(ScriptStep::Fail(code)) => Err(code),
            other => panic!("unexpected fetch_block call, script step {other:?}"),
        }
    }

    fn insert_block(&self, _block: &Block) -> Result<(), TransportFailure> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(ScriptStep::InsertOk) => Ok(()),
            Some(ScriptStep::Fail(code)) => Err(code),
            other => panic!("unexpected insert_block call, script step {other:?}"),
        }
    }
}

// ── StubScheduler ─────────────────────────────────────────────────────────────

/// Scheduler double that records registrations and answers dedup probes
/// from an injectable in-flight set.
pub(crate) struct StubScheduler {
    pub registered: Mutex<Vec<(OperationId, bool, bool)>>,
    pub cooldowns: Mutex<Vec<(RoutingKey, OperationId, u64)>>,
    pub removed: Mutex<Vec<OperationId>>,
    pub in_flight: Mutex<HashSet<DedupToken>>,
    cooldown_ms: u64,
}

impl StubScheduler {
    pub fn new() -> Self {
        Self {
            registered: Mutex::new(Vec::new()),
            cooldowns: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
            cooldown_ms: 60_000,
        }
    }

    pub fn retry_registrations(&self) -> usize {
        self.registered
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, is_retry)| *is_retry)
            .count()
    }
}

impl Scheduler for StubScheduler {
    fn register(&self, op: DynOperation, is_persistent: bool, is_retry: bool) {
        self.registered
            .lock()
            .unwrap()
            .push((op.id(), is_persistent, is_retry));
    }

    fn register_cooldown(&self, key: &RoutingKey, op: DynOperation) -> u64 {
        let wake = now_millis() + self.cooldown_ms;
        self.cooldowns.lock().unwrap().push((*key, op.id(), wake));
        wake
    }

    fn remove_pending(&self, id: OperationId) {
        self.removed.lock().unwrap().push(id);
    }

    fn in_flight_contains(&self, token: &DedupToken) -> bool {
        self.in_flight.lock().unwrap().contains(token)
    }
}
