//! Block framing: the packed header in front of every encoded block.
//!
//! An encoded block is `BlockHeader || payload` for content-hash keys and
//! `BlockHeader || payload || signature` for signed-subspace keys. Every
//! field and reserved byte here is covered by the routing hash (CHK) or the
//! signature (SSK), so changing the layout is a breaking change.
//!
//! All wire types are #[repr(C, packed)] with zerocopy derives for
//! allocation-free serialization. There is no unsafe code in this module.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::key::KeyDescriptor;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Magic prefix of every encoded block.
pub const BLOCK_MAGIC: [u8; 4] = *b"CBK1";

/// Current block framing version.
pub const BLOCK_VERSION: u8 = 0x01;

/// Maximum payload size in bytes. Larger data must be split above the
/// single-block layer.
pub const MAX_BLOCK_PAYLOAD: usize = 32 * 1024;

/// Codec field value marking an uncompressed payload.
pub const CODEC_NONE: u16 = 0xFFFF;

/// Length of the Ed25519 signature trailing a signed-subspace block.
pub const SSK_SIGNATURE_LEN: usize = 64;

/// Header flag bit: the payload is metadata, not content.
pub const FLAG_METADATA: u8 = 0b0000_0001;

/// Wire size of the block header.
pub const BLOCK_HEADER_LEN: usize = std::mem::size_of::<BlockHeader>();

// ── Compression codec id ──────────────────────────────────────────────────────

/// Identifier of the compression codec a payload was written with.
///
/// The transfer engine never compresses or decompresses; it only carries the
/// id through encode and hands it back on verify. `CODEC_NONE` is reserved
/// as the absent marker and is not a valid `CodecId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodecId(pub u16);

impl CodecId {
    /// Wire value for `Option<CodecId>`: the reserved `CODEC_NONE` means
    /// uncompressed.
    pub fn to_wire(codec: Option<CodecId>) -> u16 {
        match codec {
            Some(id) => id.0,
            None => CODEC_NONE,
        }
    }

    pub fn from_wire(raw: u16) -> Option<CodecId> {
        if raw == CODEC_NONE {
            None
        } else {
            Some(CodecId(raw))
        }
    }
}

// ── Block header ──────────────────────────────────────────────────────────────

/// Fixed-size framing in front of every encoded block payload.
///
/// Wire size: 36 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct BlockHeader {
    /// Always `BLOCK_MAGIC`.
    pub magic: [u8; 4],

    /// Framing version. Currently 0x01. A verifier seeing an unknown
    /// version rejects the block as malformed.
    pub version: u8,

    /// Key class discriminant: 0x01 content-hash, 0x02 signed-subspace.
    pub key_class: u8,

    /// Bit 0: metadata flag. Remaining bits reserved, must be zero.
    pub flags: u8,

    /// Reserved, must be zero.
    pub reserved: u8,

    /// Compression codec id. `CODEC_NONE` (0xFFFF) = uncompressed.
    pub codec: u16,

    /// Reserved, must be zero.
    pub reserved2: [u8; 2],

    /// Length of the original data before compression, in bytes.
    pub source_length: u32,

    /// Length of the payload following this header, in bytes.
    pub payload_len: u32,

    /// Random per-encode nonce for signed-subspace blocks; all zero for
    /// content-hash blocks. This is what makes SSK encoding
    /// non-deterministic across calls.
    pub ssk_nonce: [u8; 16],
}

// Compile-time size guard. If this fails, the framing has silently changed.
assert_eq_size!(BlockHeader, [u8; 36]);

// ── Block ─────────────────────────────────────────────────────────────────────

/// A verified or freshly encoded block, always paired with the key it was
/// encoded for or verified against.
#[derive(Debug, Clone)]
pub struct Block {
    descriptor: KeyDescriptor,
    is_metadata: bool,
    codec: Option<CodecId>,
    source_length: u32,
    payload: Bytes,
    /// The full wire form (header, payload, and any trailing signature).
    /// What `verify` consumed or `encode` produced.
    wire: Bytes,
}

impl Block {
    pub(crate) fn new(
        descriptor: KeyDescriptor,
        is_metadata: bool,
        codec: Option<CodecId>,
        source_length: u32,
        payload: Bytes,
        wire: Bytes,
    ) -> Self {
        Self {
            descriptor,
            is_metadata,
            codec,
            source_length,
            payload,
            wire,
        }
    }

    pub fn descriptor(&self) -> &KeyDescriptor {
        &self.descriptor
    }

    pub fn is_metadata(&self) -> bool {
        self.is_metadata
    }

    pub fn codec(&self) -> Option<CodecId> {
        self.codec
    }

    pub fn source_length(&self) -> u32 {
        self.source_length
    }

    /// The payload carried between header and signature.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The full encoded form as it travels on the wire. Cloning is cheap
    /// (`Bytes` is reference-counted).
    pub fn wire_bytes(&self) -> Bytes {
        self.wire.clone()
    }

    pub fn uri(&self) -> String {
        self.descriptor.uri()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
