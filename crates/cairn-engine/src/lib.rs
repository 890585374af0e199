//! cairn-engine — retrying state machines for single-block transfers.
//!
//! One [`FetchOperation`] or [`InsertOperation`] per block. Operations are
//! registered with a [`Scheduler`], run attempts over a [`BlockTransport`],
//! and report back through a [`CompletionHandler`] exactly once. Retry
//! budgets, cooldowns, and the failure taxonomy come from `cairn-core`;
//! durable snapshots let persistent requests survive a restart.

pub mod events;
pub mod fetch;
pub mod insert;
pub mod memory;
pub mod request;
pub mod scheduler;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use events::{CompletionHandler, DynCompletionHandler};
pub use fetch::FetchOperation;
pub use insert::InsertOperation;
pub use memory::MemoryScheduler;
pub use request::{OperationId, OperationKind, PersistedRequest, ResumeError};
pub use scheduler::{
    BlockTransport, DedupToken, DispatchToken, DynOperation, Operation, Priority, Scheduler,
};
pub use store::{DurableStore, DynDurableStore, FileStore, MemStore, StoreError};
