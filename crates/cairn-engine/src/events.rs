//! Completion callbacks delivered to the owning orchestrator.

use std::sync::Arc;

use cairn_core::block::Block;
use cairn_core::failure::TransferError;
use cairn_core::key::KeyDescriptor;

use crate::scheduler::Priority;

/// What a parent orchestrator implements to observe its operations.
///
/// Exactly one of `on_block_fetched`, `on_block_inserted`, or `on_failed`
/// arrives per operation, after which the operation is inert. `on_encoded`
/// is an early extra for inserts and fires at most once, before the
/// terminal callback.
///
/// Callbacks run on scheduler threads with no engine locks held; handlers
/// may call back into the engine.
pub trait CompletionHandler: Send + Sync {
    /// A fetched block passed verification.
    fn on_block_fetched(&self, block: Block);

    /// The network accepted an inserted block under `uri`.
    fn on_block_inserted(&self, uri: String);

    /// An insert knows its key. Lets the parent learn the URI before the
    /// transfer settles.
    fn on_encoded(&self, key: KeyDescriptor) {
        let _ = key;
    }

    /// The operation ended without a block changing hands.
    fn on_failed(&self, error: TransferError);

    /// Scheduling class for operations owned by this handler.
    fn priority_class(&self) -> Priority {
        Priority::Bulk
    }
}

/// Shared handle to a completion handler.
pub type DynCompletionHandler = Arc<dyn CompletionHandler>;
