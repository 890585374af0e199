//! Source buffers owned by insert operations.
//!
//! An insert exclusively owns its source buffer until the request reaches a
//! terminal state, then releases it exactly once. The scheduler side never
//! touches the buffer itself; it works from a `BufferShadow`, a cheap
//! reference-counted handle that stays readable even after the original
//! buffer is released.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

// ── SourceBuffer ──────────────────────────────────────────────────────────────

/// Storage backing the data an insert operation is putting into the network.
pub trait SourceBuffer: Send + Sync {
    /// Stable identity of this buffer, used to tie shadows back to their
    /// origin in logs.
    fn id(&self) -> u64;

    /// Payload length in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the full contents. Fails once the buffer has been released.
    fn read(&self) -> io::Result<Bytes>;

    /// A cheap handle the scheduler can use to recreate the byte stream
    /// without owning this buffer.
    fn shadow(&self) -> BufferShadow;

    /// Release the underlying storage. Safe to call more than once; reads
    /// fail afterwards. Each call is counted so tests can pin down the
    /// single-release discipline of the owner.
    fn release(&self);

    fn released(&self) -> bool;
}

// ── MemoryBuffer ──────────────────────────────────────────────────────────────

/// Heap-backed source buffer.
pub struct MemoryBuffer {
    id: u64,
    data: Bytes,
    released: AtomicBool,
    release_calls: Arc<AtomicU64>,
}

impl MemoryBuffer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            data: data.into(),
            released: AtomicBool::new(false),
            release_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of `release` calls made against this buffer. The owner is
    /// expected to drive it to exactly one over the buffer's life.
    pub fn release_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.release_calls)
    }
}

impl SourceBuffer for MemoryBuffer {
    fn id(&self) -> u64 {
        self.id
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn read(&self) -> io::Result<Bytes> {
        if self.released.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "source buffer already released",
            ));
        }
        Ok(self.data.clone())
    }

    fn shadow(&self) -> BufferShadow {
        BufferShadow {
            origin: self.id,
            data: self.data.clone(),
        }
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.release_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

// ── BufferShadow ──────────────────────────────────────────────────────────────

/// Detached handle onto an insert's source bytes.
///
/// Each dispatch attempt carries a fresh shadow so the transport can re-read
/// the data without the operation's buffer, and a shadow keeps working after
/// the origin buffer is released (the bytes are reference-counted, not
/// copied). Dedup equality deliberately ignores shadows.
#[derive(Clone)]
pub struct BufferShadow {
    origin: u64,
    data: Bytes,
}

impl BufferShadow {
    /// Id of the buffer this shadow was taken from.
    pub fn origin(&self) -> u64 {
        self.origin
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The shadowed bytes. Always succeeds; the shadow holds its own handle.
    pub fn read(&self) -> Bytes {
        self.data.clone()
    }
}

impl std::fmt::Debug for BufferShadow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferShadow(origin={}, {} bytes)", self.origin, self.data.len())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
