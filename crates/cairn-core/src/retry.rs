//! Retry budget and cooldown policy.
//!
//! The policy itself is a pure function over the retry counter and the
//! configured budget; the per-request cooldown deadline lives in a
//! `CooldownSlot` that only ever moves forward in time.

// ── Policy ────────────────────────────────────────────────────────────────────

/// Every `DEFAULT_COOLDOWN_PERIOD`-th retry parks the key on the cooldown
/// queue instead of redispatching immediately.
pub const DEFAULT_COOLDOWN_PERIOD: u32 = 5;

/// `max_retries` value meaning "never give up".
pub const UNLIMITED_RETRIES: i32 = -1;

/// What to do after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-register for selection right away.
    RetryNow,

    /// Park on the cooldown queue; re-register when the deadline passes.
    EnterCooldown,

    /// Budget exhausted. The request fails permanently.
    GiveUp,
}

/// Decide what happens after a transient failure.
///
/// `new_retry_count` is the retry counter after the increment for the
/// failure just observed, so it is always at least 1 here. A request with
/// `max_retries = N >= 0` gets N+1 total attempts; `UNLIMITED_RETRIES`
/// removes the budget. A `cooldown_period` of 0 disables cooldown entirely.
pub fn decide(new_retry_count: u32, max_retries: i32, cooldown_period: u32) -> RetryDecision {
    if max_retries != UNLIMITED_RETRIES && i64::from(new_retry_count) > i64::from(max_retries) {
        return RetryDecision::GiveUp;
    }
    if cooldown_period > 0 && new_retry_count % cooldown_period == 0 {
        return RetryDecision::EnterCooldown;
    }
    RetryDecision::RetryNow
}

// ── CooldownSlot ──────────────────────────────────────────────────────────────

/// Holder of one request's cooldown deadline (epoch millis).
///
/// Entering cooldown while an earlier deadline is still pending means the
/// key was queued twice; the second entry is rejected with an error log, not
/// silently overwritten. Accepted deadlines therefore never decrease.
#[derive(Debug, Clone, Default)]
pub struct CooldownSlot {
    until: Option<u64>,
}

impl CooldownSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted deadline.
    pub fn restore(until: Option<u64>) -> Self {
        Self { until }
    }

    /// The recorded deadline, if any.
    pub fn until(&self) -> Option<u64> {
        self.until
    }

    /// True if a deadline is recorded and still in the future of `now`.
    pub fn pending(&self, now: u64) -> bool {
        matches!(self.until, Some(deadline) if deadline > now)
    }

    /// Record a new deadline. Returns false if one is already pending,
    /// which indicates a duplicate cooldown entry upstream.
    pub fn enter(&mut self, deadline: u64, now: u64) -> bool {
        if self.pending(now) {
            tracing::error!(
                current = self.until.unwrap_or(0),
                rejected = deadline,
                "already on the cooldown queue; duplicate entry rejected"
            );
            return false;
        }
        self.until = Some(deadline);
        true
    }

    /// Clear the slot after a cooldown wake. Returns false without clearing
    /// when the recorded deadline is still past `wake_time` (a stale timer
    /// fired early); an empty slot counts as due.
    pub fn clear_if_due(&mut self, wake_time: u64) -> bool {
        match self.until {
            Some(deadline) if deadline > wake_time => false,
            Some(_) => {
                self.until = None;
                true
            }
            None => true,
        }
    }

    /// Drop any recorded deadline, due or not. Used on terminal transitions
    /// and when rearming a restored slot around a new wake.
    pub fn reset(&mut self) {
        self.until = None;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
