//! cairn-core — keys, block codec, failure taxonomy, and retry policy.
//! The engine crate builds its state machines on top of this one.

pub mod block;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod failure;
pub mod key;
pub mod retry;

pub use block::{Block, CodecId, MAX_BLOCK_PAYLOAD};
pub use buffer::{BufferShadow, MemoryBuffer, SourceBuffer};
pub use failure::{FailureKind, FailureTracker, TransferError, TransportFailure};
pub use key::{KeyClass, KeyDescriptor, RoutingKey, SskKeypair};
