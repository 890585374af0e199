//! Scheduler-facing contracts: operations, dedup tokens, and the transport
//! seam.
//!
//! The engine does not own a scheduler or a network. Operations implement
//! [`Operation`] and are handed to some [`Scheduler`]; each dispatch attempt
//! runs against a [`BlockTransport`]. `memory` ships an in-process
//! scheduler; node integrations supply their own.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bytes::Bytes;

use cairn_core::block::Block;
use cairn_core::buffer::BufferShadow;
use cairn_core::failure::TransportFailure;
use cairn_core::key::{KeyDescriptor, RoutingKey};

use crate::request::{OperationId, OperationKind};

// ── Priority ──────────────────────────────────────────────────────────────────

/// Scheduling class, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Blocks a user is actively waiting on.
    Interactive,
    /// Ordinary fetch and insert traffic.
    Bulk,
    /// Prefetch, healing, and other deferrable work.
    Background,
}

impl Priority {
    pub const ALL: [Priority; 3] = [
        Priority::Interactive,
        Priority::Bulk,
        Priority::Background,
    ];

    pub fn index(self) -> usize {
        match self {
            Priority::Interactive => 0,
            Priority::Bulk => 1,
            Priority::Background => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Interactive => f.write_str("interactive"),
            Priority::Bulk => f.write_str("bulk"),
            Priority::Background => f.write_str("background"),
        }
    }
}

// ── Dedup tokens ──────────────────────────────────────────────────────────────

/// Identity of one logical request, stable across retry attempts.
///
/// Two fetches of the same routing key are the same logical request. Two
/// inserts never are, even for identical data, so insert tokens carry the
/// operation id. An insert token also rides a shadow of the source buffer
/// so a dispatch can read the data without touching the owned buffer;
/// the shadow is deliberately excluded from equality and hashing.
#[derive(Debug, Clone)]
pub struct DedupToken {
    scope: TokenScope,
    shadow: Option<BufferShadow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TokenScope {
    Fetch(RoutingKey),
    Insert(OperationId),
}

impl DedupToken {
    pub fn fetch(key: RoutingKey) -> Self {
        Self {
            scope: TokenScope::Fetch(key),
            shadow: None,
        }
    }

    pub fn insert(id: OperationId, shadow: BufferShadow) -> Self {
        Self {
            scope: TokenScope::Insert(id),
            shadow: Some(shadow),
        }
    }

    /// Shadow-less insert token, for equality probes against the in-flight
    /// set.
    pub fn insert_probe(id: OperationId) -> Self {
        Self {
            scope: TokenScope::Insert(id),
            shadow: None,
        }
    }

    pub fn shadow(&self) -> Option<&BufferShadow> {
        self.shadow.as_ref()
    }
}

impl PartialEq for DedupToken {
    fn eq(&self, other: &Self) -> bool {
        self.scope == other.scope
    }
}

impl Eq for DedupToken {}

impl Hash for DedupToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.scope.hash(state);
    }
}

/// Proof of a successful `choose`, carried through one dispatch attempt.
#[derive(Debug, Clone)]
pub struct DispatchToken {
    op: OperationId,
    attempt: u32,
    dedup: DedupToken,
}

impl DispatchToken {
    pub(crate) fn new(op: OperationId, attempt: u32, dedup: DedupToken) -> Self {
        Self { op, attempt, dedup }
    }

    pub fn op(&self) -> OperationId {
        self.op
    }

    /// Retry count at the moment this attempt was chosen.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn dedup_token(&self) -> &DedupToken {
        &self.dedup
    }
}

// ── Operation ─────────────────────────────────────────────────────────────────

/// One transfer operation as a scheduler sees it.
pub trait Operation: Send + Sync {
    fn id(&self) -> OperationId;

    fn kind(&self) -> OperationKind;

    /// Key this operation works on. An insert that has not encoded yet has
    /// none.
    fn descriptor(&self) -> Option<KeyDescriptor>;

    /// Scheduling class, delegated to the owning completion handler.
    fn priority_class(&self) -> Priority;

    /// Identity for the in-flight set. Insert tokens carry a fresh buffer
    /// shadow each call.
    fn dedup_token(&self) -> DedupToken;

    /// Non-mutating pre-filter: could `choose` plausibly succeed right now?
    fn has_dispatchable_key(&self, scheduler: &dyn Scheduler) -> bool;

    /// Atomically claim the request for one dispatch attempt. None if the
    /// request is already chosen or terminal, or if the scheduler reports
    /// an equal token in flight.
    fn choose(&self, scheduler: &dyn Scheduler) -> Option<DispatchToken>;

    /// Run one attempt over the transport and feed the outcome back into
    /// the state machine. Blocking.
    fn dispatch(
        &self,
        token: DispatchToken,
        transport: &dyn BlockTransport,
        scheduler: &dyn Scheduler,
    );

    /// Timer callback once a cooldown deadline passes. `wake_time` is the
    /// deadline the timer was armed with; a stale wake is ignored.
    fn requeue_after_cooldown(&self, wake_time: u64, scheduler: &dyn Scheduler);

    /// Abort the request. Idempotent; delivers the terminal failure
    /// callback if no terminal state was reached yet.
    fn cancel(&self, scheduler: &dyn Scheduler);

    /// True once a terminal state has been reached.
    fn is_finished(&self) -> bool;
}

/// Shared handle to an operation.
pub type DynOperation = Arc<dyn Operation>;

// ── Scheduler ─────────────────────────────────────────────────────────────────

/// The selection layer operations register with.
pub trait Scheduler: Send + Sync {
    /// Enqueue for future selection. `is_retry` marks immediate
    /// re-registration after a failed attempt.
    fn register(&self, op: DynOperation, is_persistent: bool, is_retry: bool);

    /// Park an operation on the timed cooldown queue. Returns the wake
    /// time (epoch millis) the entry was recorded with.
    fn register_cooldown(&self, key: &RoutingKey, op: DynOperation) -> u64;

    /// Drop an operation from all pending structures.
    fn remove_pending(&self, id: OperationId);

    /// Dedup query against the set of requests currently being dispatched.
    fn in_flight_contains(&self, token: &DedupToken) -> bool;
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// The routing layer that moves blocks between nodes. Calls block until
/// the attempt resolves.
pub trait BlockTransport: Send + Sync {
    /// Ask the network for the block under `key`. Returns the raw wire
    /// encoding; verification is the caller's job.
    fn fetch_block(&self, key: &KeyDescriptor) -> Result<Bytes, TransportFailure>;

    /// Offer an encoded block to the network.
    fn insert_block(&self, block: &Block) -> Result<(), TransportFailure>;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
