//! Long-term identity keys and ephemeral X25519 keys.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::CryptoError;

// ── Identity ──────────────────────────────────────────────────────────────────

/// A node's long-term Ed25519 identity.
///
/// Generated once and stored by the identity store as its 32-byte seed.
/// The public key is what peers pin; the location id derives from it.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct IdentityKeypair {
    /// Seed: zeroized on drop, never exposed directly.
    seed: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

impl IdentityKeypair {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let keypair = Self::from_seed(seed);
        seed.zeroize();
        keypair
    }

    /// Rebuild from stored seed bytes. The public key is derived.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let public = SigningKey::from_bytes(&seed).verifying_key().to_bytes();
        Self { seed: Zeroizing::new(seed), public }
    }

    /// Seed bytes for persistent storage.
    pub fn seed_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.seed)
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        SigningKey::from_bytes(&self.seed).sign(message).to_bytes()
    }
}

/// Check an Ed25519 signature made by `public`.
pub fn verify_signature(public: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(public).map_err(|_| CryptoError::BadSignature)?;
    key.verify(message, &Signature::from_bytes(signature))
        .map_err(|_| CryptoError::BadSignature)
}

// ── Ephemeral X25519 ──────────────────────────────────────────────────────────

/// One-handshake X25519 keypair for the modern profile.
pub struct EphemeralX25519 {
    secret: StaticSecret,
    pub public: [u8; 32],
}

impl EphemeralX25519 {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = *PublicKey::from(&secret).as_bytes();
        Self { secret, public }
    }

    /// Shared secret with the peer's public key. An all-zero result means the
    /// peer sent a low-order point and is refused.
    pub fn agree(&self, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let bytes: [u8; 32] = peer_public.try_into().map_err(|_| CryptoError::InvalidPublicValue)?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(bytes));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicValue);
        }
        Ok(Zeroizing::new(shared.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_roundtrips_through_seed() {
        let original = IdentityKeypair::generate();
        let restored = IdentityKeypair::from_seed(*original.seed_bytes());
        assert_eq!(original.public, restored.public);
    }

    #[test]
    fn signature_verifies_and_tampering_fails() {
        let identity = IdentityKeypair::generate();
        let sig = identity.sign(b"hello");
        assert!(verify_signature(&identity.public, b"hello", &sig).is_ok());
        assert!(verify_signature(&identity.public, b"hellp", &sig).is_err());

        let other = IdentityKeypair::generate();
        assert!(verify_signature(&other.public, b"hello", &sig).is_err());
    }

    #[test]
    fn x25519_both_sides_agree() {
        let a = EphemeralX25519::generate();
        let b = EphemeralX25519::generate();
        assert_eq!(*a.agree(&b.public).unwrap(), *b.agree(&a.public).unwrap());
    }

    #[test]
    fn x25519_rejects_low_order_point() {
        let a = EphemeralX25519::generate();
        assert!(matches!(a.agree(&[0u8; 32]), Err(CryptoError::InvalidPublicValue)));
        assert!(matches!(a.agree(&[1u8; 31]), Err(CryptoError::InvalidPublicValue)));
    }
}
