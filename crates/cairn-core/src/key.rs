//! Key identities for cairn blocks.
//!
//! Two key classes exist:
//!   1. Content-hash keys (CHK): the routing key is the BLAKE3 hash of the
//!      encoded block, so verification recomputes the hash and compares.
//!   2. Signed-subspace keys (SSK): the routing key is derived from an
//!      Ed25519 public key, and every block is signed at encode time.
//!
//! A `KeyDescriptor` is immutable after construction and cheap to clone, so
//! it can cross thread boundaries freely. Private key material only leaves
//! `SskKeypair` wrapped in `Zeroizing`.

use std::fmt;

use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

// ── Routing key ───────────────────────────────────────────────────────────────

/// A 32-byte routing identifier.
///
/// For CHK this is the BLAKE3 hash of the encoded block; for SSK it is
/// BLAKE3 of the subspace public key. Used as the map key of every
/// scheduler-side registry, so it is `Copy`, ordered, and hashable.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoutingKey(pub [u8; 32]);

impl RoutingKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::BadHex)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| KeyError::BadLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs; Display renders the full 64 hex chars.
        write!(f, "RoutingKey({}..)", &hex::encode(self.0)[..16])
    }
}

// ── Key class ─────────────────────────────────────────────────────────────────

/// Which verification regime a key uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum KeyClass {
    /// Routing key is the BLAKE3 hash of the encoded block.
    ContentHash = 0x01,

    /// Routing key is derived from an Ed25519 public key; blocks carry a
    /// signature over their full framing.
    SignedSubspace = 0x02,
}

impl KeyClass {
    /// The URI path segment for this class (`chk` or `ssk`).
    pub fn uri_tag(&self) -> &'static str {
        match self {
            KeyClass::ContentHash => "chk",
            KeyClass::SignedSubspace => "ssk",
        }
    }
}

impl TryFrom<u8> for KeyClass {
    type Error = KeyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(KeyClass::ContentHash),
            0x02 => Ok(KeyClass::SignedSubspace),
            other => Err(KeyError::UnknownClassByte(other)),
        }
    }
}

impl From<KeyClass> for u8 {
    fn from(c: KeyClass) -> u8 {
        c as u8
    }
}

// ── Key descriptor ────────────────────────────────────────────────────────────

/// URI scheme prefix for every cairn key.
pub const URI_SCHEME: &str = "cairn:";

/// Immutable identity of a single addressable block.
///
/// Pairs the routing key with the material needed to verify a block fetched
/// under it. Constructed once, then cloned wherever the key travels; there
/// are no mutators.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyDescriptor {
    class: KeyClass,
    routing: RoutingKey,
    /// CHK: equals the routing key bytes. SSK: the Ed25519 public key.
    verification: [u8; 32],
}

impl KeyDescriptor {
    /// Descriptor for a content-hash key. Verification material is the
    /// routing key itself.
    pub fn content_hash(routing: RoutingKey) -> Self {
        Self {
            class: KeyClass::ContentHash,
            verification: routing.0,
            routing,
        }
    }

    /// Descriptor for a signed-subspace key. The routing key is
    /// BLAKE3(public key), so two subspaces never share a routing slot
    /// unless their public keys collide.
    pub fn signed_subspace(public_key: [u8; 32]) -> Self {
        Self {
            class: KeyClass::SignedSubspace,
            routing: RoutingKey(*blake3::hash(&public_key).as_bytes()),
            verification: public_key,
        }
    }

    pub fn class(&self) -> KeyClass {
        self.class
    }

    pub fn routing_key(&self) -> &RoutingKey {
        &self.routing
    }

    /// CHK: the expected content hash. SSK: the subspace public key.
    pub fn verification(&self) -> &[u8; 32] {
        &self.verification
    }

    /// Render as a cairn URI: `cairn:chk/<hex>` or `cairn:ssk/<hex>`.
    ///
    /// The hex body is the routing key for CHK and the public key for SSK,
    /// so parsing the URI back always reconstructs an identical descriptor.
    pub fn uri(&self) -> String {
        let body = match self.class {
            KeyClass::ContentHash => hex::encode(self.routing.0),
            KeyClass::SignedSubspace => hex::encode(self.verification),
        };
        format!("{}{}/{}", URI_SCHEME, self.class.uri_tag(), body)
    }

    /// Parse a cairn URI back into a descriptor.
    pub fn from_uri(uri: &str) -> Result<Self, KeyError> {
        let rest = uri.strip_prefix(URI_SCHEME).ok_or(KeyError::BadScheme)?;
        let (tag, body) = rest.split_once('/').ok_or(KeyError::BadScheme)?;
        let bytes = hex::decode(body).map_err(|_| KeyError::BadHex)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| KeyError::BadLength)?;
        match tag {
            "chk" => Ok(Self::content_hash(RoutingKey(arr))),
            "ssk" => Ok(Self::signed_subspace(arr)),
            other => Err(KeyError::UnknownUriClass(other.to_string())),
        }
    }
}

impl fmt::Display for KeyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

impl fmt::Debug for KeyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyDescriptor({}/{:?})", self.class.uri_tag(), self.routing)
    }
}

// ── Subspace keypair ──────────────────────────────────────────────────────────

/// An Ed25519 subspace keypair.
///
/// Generated once per subspace and stored by the owner. Inserting into a
/// subspace requires the signing half; fetching and verifying needs only the
/// public `KeyDescriptor`. The signing key is zeroized on drop and its bytes
/// only escape through `private_bytes`.
pub struct SskKeypair {
    signing: SigningKey,
}

impl SskKeypair {
    /// Generate a new random subspace keypair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut rand::thread_rng()),
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    /// The public key is derived deterministically from the private key.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&private_bytes),
        }
    }

    /// Serialize the private key for persistent storage.
    /// Store these bytes securely (mode 0600, ideally encrypted at rest).
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// The public descriptor for this subspace.
    pub fn descriptor(&self) -> KeyDescriptor {
        KeyDescriptor::signed_subspace(self.public_bytes())
    }

    pub(crate) fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key URI must look like `cairn:chk/<hex>` or `cairn:ssk/<hex>`")]
    BadScheme,

    #[error("unknown key class `{0}` (expected `chk` or `ssk`)")]
    UnknownUriClass(String),

    #[error("key material is not valid hex")]
    BadHex,

    #[error("key material must be exactly 32 bytes")]
    BadLength,

    #[error("unknown key class byte: 0x{0:02x}")]
    UnknownClassByte(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
