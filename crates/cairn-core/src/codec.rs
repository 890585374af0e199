//! Encoding and verification of single blocks.
//!
//! `encode` turns a source buffer into a verifiable block for a key class:
//! content-hash blocks derive their routing key from the encoded bytes, so
//! encoding is deterministic; signed-subspace blocks draw a random nonce and
//! a signature, so two encodes of the same data never produce the same
//! bytes.
//!
//! `verify` is the receiving side: recompute-and-compare for content-hash,
//! signature check for signed-subspace. Every failure out of `verify` is
//! fatal for the block in hand; none of them is a transport condition worth
//! a retry.

use bytes::Bytes;
use ed25519_dalek::{Signature, VerifyingKey};
use rand::RngCore;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes};

use crate::block::{
    Block, BlockHeader, CodecId, BLOCK_HEADER_LEN, BLOCK_MAGIC, BLOCK_VERSION, CODEC_NONE,
    FLAG_METADATA, MAX_BLOCK_PAYLOAD, SSK_SIGNATURE_LEN,
};
use crate::buffer::SourceBuffer;
use crate::key::{KeyClass, KeyDescriptor, RoutingKey, SskKeypair};

// ── Insert target ─────────────────────────────────────────────────────────────

/// Key material supplied when encoding a block for insert.
pub enum InsertTarget {
    /// Derive a content-hash key from the encoded bytes.
    ContentHash,

    /// Sign into the subspace owned by this keypair.
    SignedSubspace(SskKeypair),
}

impl InsertTarget {
    pub fn class(&self) -> KeyClass {
        match self {
            InsertTarget::ContentHash => KeyClass::ContentHash,
            InsertTarget::SignedSubspace(_) => KeyClass::SignedSubspace,
        }
    }
}

// ── Encode ────────────────────────────────────────────────────────────────────

/// Encode a source buffer into a verifiable block.
///
/// Deterministic for content-hash targets. For signed-subspace targets a
/// fresh nonce and signature are drawn on every call, so callers that need
/// a stable URI must encode once and memoize the result.
pub fn encode(
    source: &dyn SourceBuffer,
    is_metadata: bool,
    codec: Option<CodecId>,
    source_length: u32,
    target: &InsertTarget,
) -> Result<Block, EncodeError> {
    if let Some(id) = codec {
        if id.0 == CODEC_NONE {
            return Err(EncodeError::Codec("codec id 0xffff is reserved"));
        }
    }

    let data = source.read()?;
    if data.len() > MAX_BLOCK_PAYLOAD {
        return Err(EncodeError::TooLarge(data.len()));
    }
    if codec.is_none() && source_length as usize != data.len() {
        return Err(EncodeError::Codec(
            "source length must equal payload length for uncompressed data",
        ));
    }

    let mut ssk_nonce = [0u8; 16];
    if matches!(target, InsertTarget::SignedSubspace(_)) {
        rand::thread_rng().fill_bytes(&mut ssk_nonce);
    }

    let header = BlockHeader {
        magic: BLOCK_MAGIC,
        version: BLOCK_VERSION,
        key_class: target.class().into(),
        flags: if is_metadata { FLAG_METADATA } else { 0 },
        reserved: 0,
        codec: CodecId::to_wire(codec),
        reserved2: [0; 2],
        source_length,
        payload_len: data.len() as u32,
        ssk_nonce,
    };

    let mut wire = Vec::with_capacity(BLOCK_HEADER_LEN + data.len() + SSK_SIGNATURE_LEN);
    wire.extend_from_slice(header.as_bytes());
    wire.extend_from_slice(&data);

    let descriptor = match target {
        InsertTarget::ContentHash => {
            KeyDescriptor::content_hash(RoutingKey(*blake3::hash(&wire).as_bytes()))
        }
        InsertTarget::SignedSubspace(keypair) => {
            let signature = keypair.sign(&wire);
            wire.extend_from_slice(&signature);
            keypair.descriptor()
        }
    };

    let wire = Bytes::from(wire);
    let payload = wire.slice(BLOCK_HEADER_LEN..BLOCK_HEADER_LEN + data.len());
    Ok(Block::new(
        descriptor,
        is_metadata,
        codec,
        source_length,
        payload,
        wire,
    ))
}

// ── Verify ────────────────────────────────────────────────────────────────────

/// Verify received bytes against the key they were fetched under.
///
/// Framing problems report `Malformed`; an intact block that does not belong
/// to `expected` reports `Mismatch` (or `BadSignature` for a signed-subspace
/// block failing its signature check). All three are fatal.
pub fn verify(received: Bytes, expected: &KeyDescriptor) -> Result<Block, VerifyError> {
    if received.len() < BLOCK_HEADER_LEN {
        return Err(VerifyError::Malformed("truncated header"));
    }
    let header = BlockHeader::read_from_prefix(received.as_ref())
        .ok_or(VerifyError::Malformed("unreadable header"))?;

    // Copy packed fields to locals before using them.
    let magic = header.magic;
    let version = header.version;
    let key_class = header.key_class;
    let flags = header.flags;
    let reserved = header.reserved;
    let codec_raw = header.codec;
    let reserved2 = header.reserved2;
    let source_length = header.source_length;
    let payload_len = header.payload_len as usize;

    if magic != BLOCK_MAGIC {
        return Err(VerifyError::Malformed("bad magic"));
    }
    if version != BLOCK_VERSION {
        return Err(VerifyError::Malformed("unknown framing version"));
    }
    if flags & !FLAG_METADATA != 0 {
        return Err(VerifyError::Malformed("reserved flags set"));
    }
    if reserved != 0 || reserved2 != [0; 2] {
        return Err(VerifyError::Malformed("reserved bytes set"));
    }
    if payload_len > MAX_BLOCK_PAYLOAD {
        return Err(VerifyError::Malformed("oversized payload"));
    }

    let class =
        KeyClass::try_from(key_class).map_err(|_| VerifyError::Malformed("unknown key class"))?;
    if class != expected.class() {
        return Err(VerifyError::Mismatch);
    }

    let codec = CodecId::from_wire(codec_raw);
    if codec.is_none() && source_length as usize != payload_len {
        return Err(VerifyError::Malformed("source length mismatch"));
    }

    let body_len = BLOCK_HEADER_LEN + payload_len;
    let expected_len = match class {
        KeyClass::ContentHash => body_len,
        KeyClass::SignedSubspace => body_len + SSK_SIGNATURE_LEN,
    };
    if received.len() != expected_len {
        return Err(VerifyError::Malformed("length mismatch"));
    }

    match class {
        KeyClass::ContentHash => {
            let routing = RoutingKey(*blake3::hash(received.as_ref()).as_bytes());
            if routing != *expected.routing_key() {
                return Err(VerifyError::Mismatch);
            }
        }
        KeyClass::SignedSubspace => {
            // The descriptor may have come off disk; recheck the routing
            // derivation before trusting its public key.
            let derived = RoutingKey(*blake3::hash(expected.verification()).as_bytes());
            if derived != *expected.routing_key() {
                return Err(VerifyError::Mismatch);
            }
            let key = VerifyingKey::from_bytes(expected.verification())
                .map_err(|_| VerifyError::BadSignature)?;
            let sig_bytes: [u8; 64] = received[body_len..]
                .try_into()
                .map_err(|_| VerifyError::Malformed("truncated signature"))?;
            let signature = Signature::from_bytes(&sig_bytes);
            key.verify_strict(&received[..body_len], &signature)
                .map_err(|_| VerifyError::BadSignature)?;
        }
    }

    let payload = received.slice(BLOCK_HEADER_LEN..body_len);
    Ok(Block::new(
        expected.clone(),
        flags & FLAG_METADATA != 0,
        codec,
        source_length,
        payload,
        received,
    ))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("bad compression metadata: {0}")]
    Codec(&'static str),

    #[error("failed to read source buffer: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload of {0} bytes exceeds the {MAX_BLOCK_PAYLOAD}-byte block limit")]
    TooLarge(usize),

    /// The key material on hand cannot encode for the key class this block
    /// is bound to.
    #[error("cannot encode for a {} key using {} material", .expected.uri_tag(), .got.uri_tag())]
    InvalidKeyType { expected: KeyClass, got: KeyClass },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("block does not verify against the expected key")]
    Mismatch,

    #[error("bad signature on signed-subspace block")]
    BadSignature,

    #[error("malformed block framing: {0}")]
    Malformed(&'static str),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
