//! Failure taxonomy and per-kind accounting.
//!
//! Transport failures split into transient kinds, which feed the retry
//! policy through a `FailureTracker`, and the collision code, which is fatal
//! for inserts. `TransferError` is the terminal error type a completion
//! handler sees; everything transient is recovered internally until the
//! retry budget runs out.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{EncodeError, VerifyError};

// ── Failure kinds ─────────────────────────────────────────────────────────────

/// A transient, retryable failure kind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum FailureKind {
    /// Something went wrong inside the local node or a relaying peer.
    InternalError,

    /// A node on the path was too busy to accept the request.
    Overload,

    /// Routing ran out of candidate peers before reaching the target.
    RouteNotFound,

    /// Routing concluded the target is unreachable from here.
    RouteReallyNotFound,
}

impl FailureKind {
    /// Both route-not-found flavors count toward the consecutive-RNF run on
    /// inserts.
    pub fn is_route_not_found(&self) -> bool {
        matches!(
            self,
            FailureKind::RouteNotFound | FailureKind::RouteReallyNotFound
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::InternalError => "internal-error",
            FailureKind::Overload => "overload",
            FailureKind::RouteNotFound => "route-not-found",
            FailureKind::RouteReallyNotFound => "route-really-not-found",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Failure code reported by the transport for one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportFailure {
    InternalError,
    Overload,
    RouteNotFound,
    RouteReallyNotFound,

    /// A different block already occupies this key's slot. Fatal, and only
    /// meaningful for inserts.
    Collision,
}

impl TransportFailure {
    /// The transient kind this code maps to, or `None` for collision.
    pub fn as_transient(&self) -> Option<FailureKind> {
        match self {
            TransportFailure::InternalError => Some(FailureKind::InternalError),
            TransportFailure::Overload => Some(FailureKind::Overload),
            TransportFailure::RouteNotFound => Some(FailureKind::RouteNotFound),
            TransportFailure::RouteReallyNotFound => Some(FailureKind::RouteReallyNotFound),
            TransportFailure::Collision => None,
        }
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_transient() {
            Some(kind) => f.write_str(kind.label()),
            None => f.write_str("collision"),
        }
    }
}

// ── FailureTracker ────────────────────────────────────────────────────────────

/// Per-kind failure counts for one request, append-only until it finishes.
///
/// When the retry budget runs out the tracker becomes the body of the
/// aggregate error, so the parent can see which kinds dominated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureTracker {
    counts: BTreeMap<FailureKind, u32>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: FailureKind) {
        *self.counts.entry(kind).or_insert(0) += 1;
    }

    pub fn count(&self, kind: FailureKind) -> u32 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl fmt::Display for FailureTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.counts.is_empty() {
            return f.write_str("no failures");
        }
        let mut first = true;
        for (kind, count) in &self.counts {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{kind} x{count}")?;
            first = false;
        }
        Ok(())
    }
}

// ── Terminal errors ───────────────────────────────────────────────────────────

/// The error a completion handler receives when an operation fails for good.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("collision: a different block already occupies this key")]
    Collision,

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("retries exhausted after {} failed attempts ({0})", .0.total())]
    RetriesExhausted(FailureTracker),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
