//! Cryptographic primitives for Peerweave.
//!
//! Provides:
//!   1. BLAKE3 hashing: transcript hashes and location id derivation
//!   2. Keyed hashing (HMAC-SHA1 / HMAC-SHA256), incrementally updatable
//!   3. AEAD records in two interoperable constructions
//!   4. The legacy AES-CBC path for historical peers
//!   5. Key agreement: finite-field DH over a safe prime, or X25519
//!   6. Ed25519 identities and the signed handshake
//!   7. Per-connection session ciphers and their lifecycle state
//!   8. The deterministic chat-room rendezvous challenge
//!
//! Secret key material is wrapped in `Zeroizing` or derives `ZeroizeOnDrop`.
//! There is no unsafe code in this module.

pub mod aead;
pub mod challenge;
pub mod dh;
pub mod handshake;
pub mod keys;
pub mod legacy;
pub mod mac;
pub mod session;

use thiserror::Error;

pub use aead::AeadFormat;
pub use handshake::{Handshake, HandshakeParams, Hello, PeerIdentity, Profile, Role};
pub use keys::IdentityKeypair;
pub use session::{CryptoState, SessionCipher};

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Hash of a handshake transcript: both hellos, initiator first.
///
/// Neither party controls it unilaterally.
pub fn transcript_hash(initiator_hello: &[u8], responder_hello: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(initiator_hello);
    hasher.update(responder_hello);
    *hasher.finalize().as_bytes()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid iv length: expected {expected}, got {got}")]
    InvalidIvLength { expected: usize, got: usize },
    #[error("invalid nonce length: expected {expected}, got {got}")]
    InvalidNonceLength { expected: usize, got: usize },
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("unknown AEAD format tag {0:#04x}")]
    UnknownFormat(u8),
    #[error("sealed record truncated")]
    Truncated,
    #[error("nonce counter did not increase")]
    Replay,
    #[error("nonce counter exhausted")]
    NonceExhausted,
    #[error("peer public value out of range")]
    InvalidPublicValue,
    #[error("modulus is not a safe prime")]
    NotSafePrime,
    #[error("unsupported generator {0}")]
    BadGenerator(u32),
    #[error("signature verification failed")]
    BadSignature,
    #[error("peer identity does not match the expected key")]
    IdentityMismatch,
    #[error("profile mismatch: local {local:?}, peer {peer:?}")]
    ProfileMismatch { local: Profile, peer: Profile },
    #[error("malformed hello: {0}")]
    MalformedHello(&'static str),
    #[error("operation not allowed in state {0:?}")]
    BadState(CryptoState),
    #[error("key derivation failed")]
    KeyDerivation,
}

impl CryptoError {
    /// Length errors are call-site configuration mistakes, never corrected.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            CryptoError::InvalidKeyLength { .. }
                | CryptoError::InvalidIvLength { .. }
                | CryptoError::InvalidNonceLength { .. }
                | CryptoError::BadGenerator(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_hash_is_order_sensitive() {
        assert_ne!(transcript_hash(b"a", b"b"), transcript_hash(b"b", b"a"));
        assert_eq!(transcript_hash(b"a", b"b"), hash(b"ab"));
    }

    #[test]
    fn length_errors_are_config_errors() {
        assert!(CryptoError::InvalidIvLength { expected: 8, got: 16 }.is_config_error());
        assert!(!CryptoError::AuthenticationFailed.is_config_error());
    }
}
