//! Fetching a single block by key.
//!
//! A [`FetchOperation`] is the retrying state machine behind one block
//! download. It is registered with a scheduler, gets chosen for dispatch
//! attempts, verifies whatever the transport hands back, and feeds
//! transient failures through the shared retry and cooldown policy until
//! the block arrives, the budget runs out, or the caller cancels.

use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;

use cairn_core::block::Block;
use cairn_core::codec;
use cairn_core::config::FetchContext;
use cairn_core::failure::{FailureKind, TransferError, TransportFailure};
use cairn_core::key::{KeyDescriptor, RoutingKey};
use cairn_core::retry::{self, RetryDecision};

use crate::events::DynCompletionHandler;
use crate::request::{
    now_millis, OperationId, OperationKind, PersistedRequest, RequestState, ResumeError,
};
use crate::scheduler::{
    BlockTransport, DedupToken, DispatchToken, DynOperation, Operation, Priority, Scheduler,
};
use crate::store::{self, DynDurableStore};

/// One block download, identified by the key it fetches.
pub struct FetchOperation {
    id: OperationId,
    descriptor: KeyDescriptor,
    ctx: FetchContext,
    state: Mutex<RequestState>,
    handler: DynCompletionHandler,
    persistence: Option<DynDurableStore>,
    weak: Weak<Self>,
}

impl FetchOperation {
    pub fn new(
        descriptor: KeyDescriptor,
        ctx: FetchContext,
        handler: DynCompletionHandler,
    ) -> Arc<Self> {
        Self::build(
            OperationId::fresh(),
            descriptor,
            RequestState::new(),
            ctx,
            handler,
            None,
        )
    }

    /// A fetch whose snapshots are committed through `store` so it can be
    /// resumed after a restart.
    pub fn persistent(
        descriptor: KeyDescriptor,
        ctx: FetchContext,
        handler: DynCompletionHandler,
        store: DynDurableStore,
    ) -> Arc<Self> {
        Self::build(
            OperationId::fresh(),
            descriptor,
            RequestState::new(),
            ctx,
            handler,
            Some(store),
        )
    }

    /// Rebuild a fetch from a persisted snapshot.
    pub fn resume(
        snapshot: &PersistedRequest,
        ctx: FetchContext,
        handler: DynCompletionHandler,
        store: DynDurableStore,
    ) -> Result<Arc<Self>, ResumeError> {
        if snapshot.kind != OperationKind::Fetch {
            return Err(ResumeError::WrongKind(snapshot.kind));
        }
        let uri = snapshot.uri.as_deref().ok_or(ResumeError::MissingUri)?;
        let descriptor = KeyDescriptor::from_uri(uri)?;
        OperationId::reserve_through(snapshot.id);
        Ok(Self::build(
            snapshot.id,
            descriptor,
            RequestState::restore(snapshot),
            ctx,
            handler,
            Some(store),
        ))
    }

    fn build(
        id: OperationId,
        descriptor: KeyDescriptor,
        state: RequestState,
        ctx: FetchContext,
        handler: DynCompletionHandler,
        persistence: Option<DynDurableStore>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id,
            descriptor,
            ctx,
            state: Mutex::new(state),
            handler,
            persistence,
            weak: weak.clone(),
        })
    }

    /// Hand the operation to a scheduler. A persistent fetch commits its
    /// snapshot first; one resumed mid-cooldown parks on the cooldown
    /// queue instead of the ready queues.
    pub fn start(&self, scheduler: &dyn Scheduler) {
        let cooling = self.state.lock().unwrap().cooldown.pending(now_millis());
        let Some(op) = self.self_op() else { return };
        if cooling {
            let wake = scheduler.register_cooldown(self.descriptor.routing_key(), op);
            {
                // the old deadline belonged to the previous process; rearm
                // the slot around the wake this scheduler recorded
                let mut st = self.state.lock().unwrap();
                st.cooldown.reset();
                st.cooldown.enter(wake, now_millis());
            }
            self.commit_current();
            tracing::debug!(op = %self.id, wake, "fetch resumed into cooldown");
        } else {
            self.commit_current();
            scheduler.register(op, self.persistence.is_some(), false);
        }
    }

    pub fn key(&self) -> &KeyDescriptor {
        &self.descriptor
    }

    pub fn retry_count(&self) -> u32 {
        self.state.lock().unwrap().retry_count
    }

    pub fn cooldown_until(&self) -> Option<u64> {
        self.state.lock().unwrap().cooldown.until()
    }

    /// A block arrived for `candidate`. Data for a different key is not
    /// ours and is discarded without touching request state; the network
    /// hands found blocks to every request listening nearby. A duplicate
    /// delivery after the request finished is a logged no-op. Matching
    /// data is verified and settles the request exactly once; a
    /// verification failure is fatal, not retried.
    pub fn on_received(&self, candidate: RoutingKey, raw: Bytes, scheduler: &dyn Scheduler) {
        if candidate != *self.descriptor.routing_key() {
            tracing::debug!(op = %self.id, %candidate, "ignoring block for a different key");
            return;
        }
        {
            let st = self.state.lock().unwrap();
            if st.finished {
                drop(st);
                tracing::debug!(op = %self.id, "duplicate block delivery ignored");
                return;
            }
            if st.cancelled {
                return;
            }
        }
        match codec::verify(raw, &self.descriptor) {
            Ok(block) => self.succeed(block, scheduler),
            Err(err) => {
                tracing::warn!(
                    op = %self.id,
                    key = %self.descriptor,
                    %err,
                    "fetched block failed verification"
                );
                self.fail(TransferError::Verify(err), scheduler);
            }
        }
    }

    /// A dispatch attempt ended in a transport-level failure.
    pub fn on_transport_failure(&self, code: TransportFailure, scheduler: &dyn Scheduler) {
        let kind = match code.as_transient() {
            Some(kind) => kind,
            None => {
                // Collisions have no meaning for a fetch.
                tracing::warn!(op = %self.id, "collision reported for a fetch, counting as internal error");
                FailureKind::InternalError
            }
        };
        self.retry(kind, scheduler);
    }

    fn retry(&self, kind: FailureKind, scheduler: &dyn Scheduler) {
        let (decision, snapshot, exhausted) = {
            let mut st = self.state.lock().unwrap();
            if st.is_terminal() {
                return;
            }
            st.tracker.record(kind);
            st.retry_count += 1;
            st.chosen = false;
            let decision =
                retry::decide(st.retry_count, self.ctx.max_retries, self.ctx.cooldown_period);
            let exhausted =
                matches!(decision, RetryDecision::GiveUp).then(|| st.tracker.clone());
            (decision, self.snapshot_locked(&st), exhausted)
        };
        match decision {
            RetryDecision::RetryNow => {
                self.commit_if_persistent(&snapshot);
                tracing::debug!(
                    op = %self.id,
                    retries = snapshot.retry_count,
                    failure = %kind,
                    "retrying fetch"
                );
                if let Some(op) = self.self_op() {
                    scheduler.register(op, self.persistence.is_some(), true);
                }
            }
            RetryDecision::EnterCooldown => {
                let Some(op) = self.self_op() else { return };
                let wake = scheduler.register_cooldown(self.descriptor.routing_key(), op);
                let snapshot = {
                    let mut st = self.state.lock().unwrap();
                    st.cooldown.enter(wake, now_millis());
                    self.snapshot_locked(&st)
                };
                self.commit_if_persistent(&snapshot);
                tracing::debug!(
                    op = %self.id,
                    retries = snapshot.retry_count,
                    wake,
                    "fetch entering cooldown"
                );
            }
            RetryDecision::GiveUp => {
                let Some(tracker) = exhausted else { return };
                tracing::warn!(op = %self.id, failures = %tracker, "fetch retries exhausted");
                self.fail(TransferError::RetriesExhausted(tracker), scheduler);
            }
        }
    }

    fn succeed(&self, block: Block, scheduler: &dyn Scheduler) {
        let deliver = {
            let mut st = self.state.lock().unwrap();
            st.finish() && st.take_terminal_delivery()
        };
        if !deliver {
            tracing::debug!(op = %self.id, "late success ignored");
            return;
        }
        scheduler.remove_pending(self.id);
        self.remove_snapshot();
        tracing::info!(op = %self.id, key = %self.descriptor, "fetch complete");
        self.handler.on_block_fetched(block);
    }

    fn fail(&self, error: TransferError, scheduler: &dyn Scheduler) {
        let deliver = {
            let mut st = self.state.lock().unwrap();
            st.finish() && st.take_terminal_delivery()
        };
        if !deliver {
            return;
        }
        scheduler.remove_pending(self.id);
        self.remove_snapshot();
        tracing::warn!(op = %self.id, key = %self.descriptor, %error, "fetch failed");
        self.handler.on_failed(error);
    }

    fn snapshot_locked(&self, st: &RequestState) -> PersistedRequest {
        PersistedRequest {
            id: self.id,
            kind: OperationKind::Fetch,
            uri: Some(self.descriptor.uri()),
            retry_count: st.retry_count,
            cooldown_until: st.cooldown.until(),
            chosen: st.chosen,
            buffer_owned: false,
        }
    }

    fn commit_current(&self) {
        if self.persistence.is_none() {
            return;
        }
        let snapshot = {
            let st = self.state.lock().unwrap();
            self.snapshot_locked(&st)
        };
        self.commit_if_persistent(&snapshot);
    }

    fn commit_if_persistent(&self, snapshot: &PersistedRequest) {
        if let Some(store) = &self.persistence {
            store::commit_best_effort(store.as_ref(), snapshot);
        }
    }

    fn remove_snapshot(&self) {
        if let Some(store) = &self.persistence {
            store::remove_best_effort(store.as_ref(), self.id);
        }
    }

    fn self_op(&self) -> Option<DynOperation> {
        self.weak.upgrade().map(|op| op as DynOperation)
    }
}

impl Operation for FetchOperation {
    fn id(&self) -> OperationId {
        self.id
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Fetch
    }

    fn descriptor(&self) -> Option<KeyDescriptor> {
        Some(self.descriptor.clone())
    }

    fn priority_class(&self) -> Priority {
        self.handler.priority_class()
    }

    fn dedup_token(&self) -> DedupToken {
        DedupToken::fetch(*self.descriptor.routing_key())
    }

    fn has_dispatchable_key(&self, scheduler: &dyn Scheduler) -> bool {
        {
            let st = self.state.lock().unwrap();
            if st.chosen || st.is_terminal() {
                return false;
            }
        }
        !scheduler.in_flight_contains(&self.dedup_token())
    }

    fn choose(&self, scheduler: &dyn Scheduler) -> Option<DispatchToken> {
        let token = self.dedup_token();
        if scheduler.in_flight_contains(&token) {
            return None;
        }
        let mut st = self.state.lock().unwrap();
        if !st.try_choose() {
            return None;
        }
        Some(DispatchToken::new(self.id, st.retry_count, token))
    }

    fn dispatch(
        &self,
        token: DispatchToken,
        transport: &dyn BlockTransport,
        scheduler: &dyn Scheduler,
    ) {
        if token.op() != self.id {
            tracing::error!(op = %self.id, token = %token.op(), "dispatch token belongs to another operation");
            return;
        }
        tracing::debug!(
            op = %self.id,
            key = %self.descriptor,
            attempt = token.attempt(),
            "fetching block"
        );
        match transport.fetch_block(&self.descriptor) {
            Ok(raw) => self.on_received(*self.descriptor.routing_key(), raw, scheduler),
            Err(code) => self.on_transport_failure(code, scheduler),
        }
    }

    fn requeue_after_cooldown(&self, wake_time: u64, scheduler: &dyn Scheduler) {
        let mut st = self.state.lock().unwrap();
        if st.is_terminal() {
            return;
        }
        if !st.cooldown.clear_if_due(wake_time) {
            drop(st);
            tracing::debug!(op = %self.id, wake_time, "stale cooldown wake ignored");
            return;
        }
        let snapshot = self.snapshot_locked(&st);
        drop(st);
        self.commit_if_persistent(&snapshot);
        tracing::debug!(op = %self.id, "fetch leaving cooldown");
        if let Some(op) = self.self_op() {
            scheduler.register(op, self.persistence.is_some(), true);
        }
    }

    fn cancel(&self, scheduler: &dyn Scheduler) {
        let deliver = {
            let mut st = self.state.lock().unwrap();
            st.cancel() && st.take_terminal_delivery()
        };
        if !deliver {
            return;
        }
        scheduler.remove_pending(self.id);
        self.remove_snapshot();
        tracing::debug!(op = %self.id, key = %self.descriptor, "fetch cancelled");
        self.handler.on_failed(TransferError::Cancelled);
    }

    fn is_finished(&self) -> bool {
        self.state.lock().unwrap().is_terminal()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
