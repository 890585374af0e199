//! Shared request state for fetch and insert operations.
//!
//! Both operation kinds keep their mutable state in a `RequestState` behind
//! one mutex per operation. Everything the scheduler or a callback decides
//! is decided under that lock as a consistent snapshot; external calls
//! (scheduler registration, completion handlers, snapshot commits) happen
//! after the lock is dropped.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cairn_core::failure::FailureTracker;
use cairn_core::key::KeyError;
use cairn_core::retry::CooldownSlot;

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// Process-unique identity of one transfer operation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OperationId(pub u64);

impl OperationId {
    pub fn fresh() -> Self {
        Self(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Keep freshly minted ids above a restored one, so resumed operations
    /// never collide with new ones.
    pub fn reserve_through(id: OperationId) {
        NEXT_OPERATION_ID.fetch_max(id.0 + 1, Ordering::Relaxed);
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Fetch,
    Insert,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Fetch => f.write_str("fetch"),
            OperationKind::Insert => f.write_str("insert"),
        }
    }
}

// ── RequestState ──────────────────────────────────────────────────────────────

/// Mutable core shared by both operation kinds.
///
/// `chosen` is true between selection and the recording of that dispatch's
/// outcome, and gates re-selection. `finished`/`cancelled` are terminal:
/// whichever is taken first wins, and after that the only permitted change
/// is the no-op bookkeeping of a late cancel.
#[derive(Debug)]
pub struct RequestState {
    pub retry_count: u32,
    pub chosen: bool,
    pub finished: bool,
    pub cancelled: bool,
    pub cooldown: CooldownSlot,
    pub tracker: FailureTracker,
    terminal_delivered: bool,
}

impl RequestState {
    pub fn new() -> Self {
        Self {
            retry_count: 0,
            chosen: false,
            finished: false,
            cancelled: false,
            cooldown: CooldownSlot::new(),
            tracker: FailureTracker::new(),
            terminal_delivered: false,
        }
    }

    /// Rebuild from a snapshot. `chosen` always comes back false: whatever
    /// dispatch was in flight when the process died did not survive it.
    pub fn restore(snapshot: &PersistedRequest) -> Self {
        Self {
            retry_count: snapshot.retry_count,
            chosen: false,
            finished: false,
            cancelled: false,
            cooldown: CooldownSlot::restore(snapshot.cooldown_until),
            tracker: FailureTracker::new(),
            terminal_delivered: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.finished || self.cancelled
    }

    /// Test-and-set selection. False if already chosen or terminal.
    pub fn try_choose(&mut self) -> bool {
        if self.chosen || self.is_terminal() {
            return false;
        }
        self.chosen = true;
        true
    }

    /// Take the finished transition. False if some terminal state was
    /// already reached.
    pub fn finish(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.finished = true;
        self.chosen = false;
        self.cooldown.reset();
        true
    }

    /// Take the cancelled transition. False if already terminal.
    pub fn cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.cancelled = true;
        self.chosen = false;
        self.cooldown.reset();
        true
    }

    /// Claim the right to deliver the terminal callback. True exactly once
    /// per request, duplicate deliveries fall out as false.
    pub fn take_terminal_delivery(&mut self) -> bool {
        if self.terminal_delivered {
            return false;
        }
        self.terminal_delivered = true;
        true
    }
}

impl Default for RequestState {
    fn default() -> Self {
        Self::new()
    }
}

// ── Persistence ───────────────────────────────────────────────────────────────

/// Snapshot of a request as written through the durable store.
///
/// Committed before the external action it protects: at registration, on
/// retry-count changes, and on cooldown entry. Removed once the request is
/// terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRequest {
    pub id: OperationId,
    pub kind: OperationKind,
    /// Key URI. Absent only for an insert that has not encoded yet.
    pub uri: Option<String>,
    pub retry_count: u32,
    pub cooldown_until: Option<u64>,
    pub chosen: bool,
    /// True while the operation still owns a source buffer.
    pub buffer_owned: bool,
}

/// Why a snapshot could not be turned back into a live operation.
#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("snapshot has no key URI")]
    MissingUri,

    #[error("snapshot is for a {0} operation")]
    WrongKind(OperationKind),

    #[error(transparent)]
    Key(#[from] KeyError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
