//! Keyed hashing: HMAC-SHA1 and HMAC-SHA256.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

use super::CryptoError;

pub type HmacSha1 = Hmac<Sha1>;
pub type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    Sha1,
    Sha256,
}

impl MacAlgorithm {
    pub fn output_len(self) -> usize {
        match self {
            MacAlgorithm::Sha1 => 20,
            MacAlgorithm::Sha256 => 32,
        }
    }
}

/// An HMAC in progress. Feed it with any number of `update` calls.
///
/// # Example
/// ```
/// use peerweave_core::crypto::mac::{hmac_sha256, KeyedHasher, MacAlgorithm};
/// let mut h = KeyedHasher::new(MacAlgorithm::Sha256, b"key").unwrap();
/// h.update(b"hello ");
/// h.update(b"world");
/// assert_eq!(h.finalize(), hmac_sha256(b"key", b"hello world").unwrap().to_vec());
/// ```
#[derive(Clone)]
pub enum KeyedHasher {
    Sha1(HmacSha1),
    Sha256(HmacSha256),
}

impl KeyedHasher {
    pub fn new(algorithm: MacAlgorithm, key: &[u8]) -> Result<Self, CryptoError> {
        let invalid = |_| CryptoError::InvalidKeyLength { expected: 0, got: key.len() };
        Ok(match algorithm {
            MacAlgorithm::Sha1 => KeyedHasher::Sha1(HmacSha1::new_from_slice(key).map_err(invalid)?),
            MacAlgorithm::Sha256 => {
                KeyedHasher::Sha256(HmacSha256::new_from_slice(key).map_err(invalid)?)
            }
        })
    }

    pub fn algorithm(&self) -> MacAlgorithm {
        match self {
            KeyedHasher::Sha1(_) => MacAlgorithm::Sha1,
            KeyedHasher::Sha256(_) => MacAlgorithm::Sha256,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            KeyedHasher::Sha1(m) => m.update(data),
            KeyedHasher::Sha256(m) => m.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            KeyedHasher::Sha1(m) => m.finalize().into_bytes().to_vec(),
            KeyedHasher::Sha256(m) => m.finalize().into_bytes().to_vec(),
        }
    }

    /// Constant-time comparison against a full-length tag.
    pub fn verify(self, tag: &[u8]) -> Result<(), CryptoError> {
        match self {
            KeyedHasher::Sha1(m) => m.verify_slice(tag),
            KeyedHasher::Sha256(m) => m.verify_slice(tag),
        }
        .map_err(|_| CryptoError::AuthenticationFailed)
    }

    /// Constant-time comparison against a tag truncated to its leftmost bytes.
    pub fn verify_truncated(self, tag: &[u8]) -> Result<(), CryptoError> {
        match self {
            KeyedHasher::Sha1(m) => m.verify_truncated_left(tag),
            KeyedHasher::Sha256(m) => m.verify_truncated_left(tag),
        }
        .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

pub fn hmac_sha1(key: &[u8], data: &[u8]) -> Result<[u8; 20], CryptoError> {
    let mut out = [0u8; 20];
    let mut h = KeyedHasher::new(MacAlgorithm::Sha1, key)?;
    h.update(data);
    out.copy_from_slice(&h.finalize());
    Ok(out)
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut out = [0u8; 32];
    let mut h = KeyedHasher::new(MacAlgorithm::Sha256, key)?;
    h.update(data);
    out.copy_from_slice(&h.finalize());
    Ok(out)
}
