//! Inserting a single block into the network.
//!
//! An [`InsertOperation`] owns the source buffer for one block upload. The
//! block is encoded once and memoized, so a signed subspace block keeps the
//! same signature across every transport attempt. Failures feed the shared
//! retry policy, with one insert-specific wrinkle: a long enough streak of
//! route-not-found answers means the data most likely landed on the nodes
//! that matter, and the insert counts as placed.

use std::sync::{Arc, Mutex, Weak};

use cairn_core::block::{Block, CodecId};
use cairn_core::buffer::SourceBuffer;
use cairn_core::codec::{self, InsertTarget};
use cairn_core::config::InsertContext;
use cairn_core::failure::{FailureTracker, TransferError, TransportFailure};
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

/// One block upload, identified by the operation itself rather than by its
/// key: two inserts of the same bytes are still distinct requests.
pub struct InsertOperation {
    id: OperationId,
    target: InsertTarget,
    is_metadata: bool,
    codec: Option<CodecId>,
    source_length: u32,
    ctx: InsertContext,
    state: Mutex<InsertState>,
    handler: DynCompletionHandler,
    persistence: Option<DynDurableStore>,
    /// Descriptor parsed back out of a resumed snapshot, used until the
    /// first re-encode supplies the real one.
    restored: Option<KeyDescriptor>,
    weak: Weak<Self>,
}

struct InsertState {
    request: RequestState,
    buffer: Option<Arc<dyn SourceBuffer>>,
    encoded: Option<Block>,
    encoded_notified: bool,
    consecutive_rnf: u32,
}

impl InsertOperation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        buffer: Arc<dyn SourceBuffer>,
        target: InsertTarget,
        is_metadata: bool,
        codec: Option<CodecId>,
        source_length: u32,
        ctx: InsertContext,
        handler: DynCompletionHandler,
    ) -> Arc<Self> {
        Self::build(
            OperationId::fresh(),
            buffer,
            target,
            is_metadata,
            codec,
            source_length,
            RequestState::new(),
            None,
            ctx,
            handler,
            None,
        )
    }

    /// An insert whose snapshots are committed through `store` so it can
    /// be resumed after a restart.
    #[allow(clippy::too_many_arguments)]
    pub fn persistent(
        buffer: Arc<dyn SourceBuffer>,
        target: InsertTarget,
        is_metadata: bool,
        codec: Option<CodecId>,
        source_length: u32,
        ctx: InsertContext,
        handler: DynCompletionHandler,
        store: DynDurableStore,
    ) -> Arc<Self> {
        Self::build(
            OperationId::fresh(),
            buffer,
            target,
            is_metadata,
            codec,
            source_length,
            RequestState::new(),
            None,
            ctx,
            handler,
            Some(store),
        )
    }

    /// Rebuild an insert from a persisted snapshot. The caller re-supplies
    /// the source buffer and target; only retry progress and the cooldown
    /// deadline live in the snapshot. The block is re-encoded on the next
    /// dispatch and lands under the same URI; a target of the wrong key
    /// class fails that encode instead of landing somewhere else.
    #[allow(clippy::too_many_arguments)]
    pub fn resume(
        snapshot: &PersistedRequest,
        buffer: Arc<dyn SourceBuffer>,
        target: InsertTarget,
        is_metadata: bool,
        codec: Option<CodecId>,
        source_length: u32,
        ctx: InsertContext,
        handler: DynCompletionHandler,
        store: DynDurableStore,
    ) -> Result<Arc<Self>, ResumeError> {
        if snapshot.kind != OperationKind::Insert {
            return Err(ResumeError::WrongKind(snapshot.kind));
        }
        let restored = match snapshot.uri.as_deref() {
            Some(uri) => Some(KeyDescriptor::from_uri(uri)?),
            None => None,
        };
        OperationId::reserve_through(snapshot.id);
        Ok(Self::build(
            snapshot.id,
            buffer,
            target,
            is_metadata,
            codec,
            source_length,
            RequestState::restore(snapshot),
            restored,
            ctx,
            handler,
            Some(store),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        id: OperationId,
        buffer: Arc<dyn SourceBuffer>,
        target: InsertTarget,
        is_metadata: bool,
        codec: Option<CodecId>,
        source_length: u32,
        request: RequestState,
        restored: Option<KeyDescriptor>,
        ctx: InsertContext,
        handler: DynCompletionHandler,
        persistence: Option<DynDurableStore>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id,
            target,
            is_metadata,
            codec,
            source_length,
            ctx,
            state: Mutex::new(InsertState {
                request,
                buffer: Some(buffer),
                encoded: None,
                encoded_notified: false,
                consecutive_rnf: 0,
            }),
            handler,
            persistence,
            restored,
            weak: weak.clone(),
        })
    }

    /// Hand the operation to a scheduler. A persistent insert commits its
    /// snapshot first; one resumed mid-cooldown parks on the cooldown
    /// queue instead of the ready queues.
    pub fn start(&self, scheduler: &dyn Scheduler) {
        let cooling = {
            let st = self.state.lock().unwrap();
            st.request.cooldown.pending(now_millis())
        };
        let Some(op) = self.self_op() else { return };
        match self.routing_key().filter(|_| cooling) {
            Some(key) => {
                let wake = scheduler.register_cooldown(&key, op);
                {
                    // the old deadline belonged to the previous process; rearm
                    // the slot around the wake this scheduler recorded
                    let mut st = self.state.lock().unwrap();
                    st.request.cooldown.reset();
                    st.request.cooldown.enter(wake, now_millis());
                }
                self.commit_current();
                tracing::debug!(op = %self.id, wake, "insert resumed into cooldown");
            }
            None => {
                self.commit_current();
                scheduler.register(op, self.persistence.is_some(), false);
            }
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.state.lock().unwrap().request.retry_count
    }

    pub fn cooldown_until(&self) -> Option<u64> {
        self.state.lock().unwrap().request.cooldown.until()
    }

    /// URI of the encoded block, once known.
    pub fn uri(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .encoded
            .as_ref()
            .map(|block| block.uri())
    }

    /// Encode the source into its block, memoizing the result. The first
    /// successful encode fires `on_encoded` so the parent learns the URI
    /// early; later calls reuse the cached block, so a subspace signature
    /// is drawn once rather than per attempt. Encode failures are fatal
    /// for the operation; the caller routes them into `fail`.
    pub fn encode_if_needed(&self) -> Result<Block, TransferError> {
        let (block, notify) = {
            let mut st = self.state.lock().unwrap();
            if let Some(block) = &st.encoded {
                (block.clone(), false)
            } else {
                if st.request.is_terminal() {
                    return Err(TransferError::Cancelled);
                }
                let Some(buffer) = st.buffer.clone() else {
                    return Err(TransferError::Cancelled);
                };
                // a resumed insert must land under the key class its
                // snapshot recorded
                if let Some(expected) = &self.restored {
                    if expected.class() != self.target.class() {
                        return Err(codec::EncodeError::InvalidKeyType {
                            expected: expected.class(),
                            got: self.target.class(),
                        }
                        .into());
                    }
                }
                let block = codec::encode(
                    buffer.as_ref(),
                    self.is_metadata,
                    self.codec,
                    self.source_length,
                    &self.target,
                )?;
                st.encoded = Some(block.clone());
                let notify = !st.encoded_notified;
                st.encoded_notified = true;
                (block, notify)
            }
        };
        if notify {
            tracing::debug!(op = %self.id, key = %block.descriptor(), "insert block encoded");
            self.handler.on_encoded(block.descriptor().clone());
        }
        Ok(block)
    }

    /// The network accepted the block. Settles the request exactly once,
    /// releasing the source buffer.
    pub fn on_transport_success(&self, scheduler: &dyn Scheduler) {
        let (uri, buffer) = {
            let mut st = self.state.lock().unwrap();
            let Some(uri) = st.encoded.as_ref().map(|block| block.uri()) else {
                drop(st);
                tracing::error!(op = %self.id, "transport success before encode ignored");
                return;
            };
            if !(st.request.finish() && st.request.take_terminal_delivery()) {
                drop(st);
                tracing::debug!(op = %self.id, "duplicate insert completion ignored");
                return;
            }
            (uri, st.buffer.take())
        };
        if let Some(buffer) = buffer {
            buffer.release();
        }
        scheduler.remove_pending(self.id);
        self.remove_snapshot();
        tracing::info!(op = %self.id, uri = %uri, "insert complete");
        self.handler.on_block_inserted(uri);
    }

    /// A dispatch attempt failed at the transport. A collision is fatal:
    /// different data already sits under this key. Route-not-found feeds
    /// the consecutive-streak heuristic before the retry budget, and a
    /// sub-threshold streak member re-registers without spending a retry.
    /// Any other failure resets the streak and goes through the policy.
    pub fn on_transport_failure(&self, code: TransportFailure, scheduler: &dyn Scheduler) {
        let Some(kind) = code.as_transient() else {
            tracing::warn!(op = %self.id, "insert collided with existing data under its key");
            self.fail(TransferError::Collision, scheduler);
            return;
        };

        enum Next {
            HeuristicSuccess(u32),
            FreeRetry(u32),
            Again,
            Cooldown,
            Exhausted(FailureTracker),
        }

        let next = {
            let mut st = self.state.lock().unwrap();
            if st.request.is_terminal() {
                return;
            }
            st.request.tracker.record(kind);
            st.request.chosen = false;
            if kind.is_route_not_found() && self.ctx.consecutive_rnf_as_success > 0 {
                st.consecutive_rnf += 1;
                if st.consecutive_rnf >= self.ctx.consecutive_rnf_as_success {
                    Next::HeuristicSuccess(st.consecutive_rnf)
                } else {
                    Next::FreeRetry(st.consecutive_rnf)
                }
            } else {
                if !kind.is_route_not_found() {
                    st.consecutive_rnf = 0;
                }
                st.request.retry_count += 1;
                match retry::decide(
                    st.request.retry_count,
                    self.ctx.max_retries,
                    self.ctx.cooldown_period,
                ) {
                    RetryDecision::RetryNow => Next::Again,
                    RetryDecision::EnterCooldown => Next::Cooldown,
                    RetryDecision::GiveUp => Next::Exhausted(st.request.tracker.clone()),
                }
            }
        };

        match next {
            Next::HeuristicSuccess(run) => {
                tracing::info!(
                    op = %self.id,
                    run,
                    "route-not-found streak reached the threshold, counting the insert as placed"
                );
                self.on_transport_success(scheduler);
            }
            Next::FreeRetry(run) => {
                tracing::debug!(
                    op = %self.id,
                    run,
                    "route-not-found keeps the retry budget untouched"
                );
                self.commit_current();
                if let Some(op) = self.self_op() {
                    scheduler.register(op, self.persistence.is_some(), true);
                }
            }
            Next::Again => {
                self.commit_current();
                tracing::debug!(op = %self.id, failure = %kind, "retrying insert");
                if let Some(op) = self.self_op() {
                    scheduler.register(op, self.persistence.is_some(), true);
                }
            }
            Next::Cooldown => {
                let Some(op) = self.self_op() else { return };
                let Some(key) = self.routing_key() else {
                    tracing::error!(op = %self.id, "cooldown decision without an encoded block");
                    return;
                };
                let wake = scheduler.register_cooldown(&key, op);
                let snapshot = {
                    let mut st = self.state.lock().unwrap();
                    st.request.cooldown.enter(wake, now_millis());
                    self.snapshot_locked(&st)
                };
                self.commit_if_persistent(&snapshot);
                tracing::debug!(op = %self.id, wake, "insert entering cooldown");
            }
            Next::Exhausted(tracker) => {
                tracing::warn!(op = %self.id, failures = %tracker, "insert retries exhausted");
                self.fail(TransferError::RetriesExhausted(tracker), scheduler);
            }
        }
    }

    fn fail(&self, error: TransferError, scheduler: &dyn Scheduler) {
        let buffer = {
            let mut st = self.state.lock().unwrap();
            if !(st.request.finish() && st.request.take_terminal_delivery()) {
                return;
            }
            st.buffer.take()
        };
        if let Some(buffer) = buffer {
            buffer.release();
        }
        scheduler.remove_pending(self.id);
        self.remove_snapshot();
        tracing::warn!(op = %self.id, %error, "insert failed");
        self.handler.on_failed(error);
    }

    fn routing_key(&self) -> Option<RoutingKey> {
        let encoded = {
            let st = self.state.lock().unwrap();
            st.encoded
                .as_ref()
                .map(|block| *block.descriptor().routing_key())
        };
        encoded.or_else(|| self.restored.as_ref().map(|desc| *desc.routing_key()))
    }

    fn snapshot_locked(&self, st: &InsertState) -> PersistedRequest {
        // before the first re-encode a resumed insert still snapshots the
        // URI it was restored with, so a second restart keeps it
        let uri = st
            .encoded
            .as_ref()
            .map(|block| block.uri())
            .or_else(|| self.restored.as_ref().map(|desc| desc.uri()));
        PersistedRequest {
            id: self.id,
            kind: OperationKind::Insert,
            uri,
            retry_count: st.request.retry_count,
            cooldown_until: st.request.cooldown.until(),
            chosen: st.request.chosen,
            buffer_owned: st.buffer.is_some(),
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

impl Operation for InsertOperation {
    fn id(&self) -> OperationId {
        self.id
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Insert
    }

    fn descriptor(&self) -> Option<KeyDescriptor> {
        self.state
            .lock()
            .unwrap()
            .encoded
            .as_ref()
            .map(|block| block.descriptor().clone())
    }

    fn priority_class(&self) -> Priority {
        self.handler.priority_class()
    }

    fn dedup_token(&self) -> DedupToken {
        match self.state.lock().unwrap().buffer.as_ref() {
            Some(buffer) => DedupToken::insert(self.id, buffer.shadow()),
            None => DedupToken::insert_probe(self.id),
        }
    }

    fn has_dispatchable_key(&self, scheduler: &dyn Scheduler) -> bool {
        {
            let st = self.state.lock().unwrap();
            if st.request.chosen || st.request.is_terminal() {
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
        if !st.request.try_choose() {
            return None;
        }
        Some(DispatchToken::new(self.id, st.request.retry_count, token))
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
        let block = match self.encode_if_needed() {
            Ok(block) => block,
            Err(err) => {
                tracing::warn!(op = %self.id, %err, "insert could not encode its block");
                self.fail(err, scheduler);
                return;
            }
        };
        tracing::debug!(
            op = %self.id,
            key = %block.descriptor(),
            attempt = token.attempt(),
            "inserting block"
        );
        match transport.insert_block(&block) {
            Ok(()) => self.on_transport_success(scheduler),
            Err(code) => self.on_transport_failure(code, scheduler),
        }
    }

    fn requeue_after_cooldown(&self, wake_time: u64, scheduler: &dyn Scheduler) {
        let mut st = self.state.lock().unwrap();
        if st.request.is_terminal() {
            return;
        }
        if !st.request.cooldown.clear_if_due(wake_time) {
            drop(st);
            tracing::debug!(op = %self.id, wake_time, "stale cooldown wake ignored");
            return;
        }
        let snapshot = self.snapshot_locked(&st);
        drop(st);
        self.commit_if_persistent(&snapshot);
        tracing::debug!(op = %self.id, "insert leaving cooldown");
        if let Some(op) = self.self_op() {
            scheduler.register(op, self.persistence.is_some(), true);
        }
    }

    fn cancel(&self, scheduler: &dyn Scheduler) {
        let buffer = {
            let mut st = self.state.lock().unwrap();
            if !(st.request.cancel() && st.request.take_terminal_delivery()) {
                return;
            }
            st.buffer.take()
        };
        if let Some(buffer) = buffer {
            buffer.release();
        }
        scheduler.remove_pending(self.id);
        self.remove_snapshot();
        tracing::debug!(op = %self.id, "insert cancelled");
        self.handler.on_failed(TransferError::Cancelled);
    }

    fn is_finished(&self) -> bool {
        self.state.lock().unwrap().request.is_terminal()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
