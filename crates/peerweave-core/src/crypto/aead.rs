//! Authenticated encryption with associated data.
//!
//! Two constructions share one key and nonce layout:
//!
//!   ChaCha20-Poly1305        the native AEAD (RFC 8439)
//!   ChaCha20 + HMAC-SHA256   ChaCha20 keystream from block counter 1,
//!                            tag = first 16 bytes of HMAC-SHA256(key, aad ‖ ciphertext)
//!
//! Both emit `ciphertext ‖ 16-byte tag`. A sealed record prefixes the format
//! tag and nonce, so the receiver picks the construction the sender used.
//! Decryption fails closed: no plaintext is released unless the tag verifies.

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use serde::{Deserialize, Serialize};

use super::mac::{KeyedHasher, MacAlgorithm};
use super::CryptoError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Bytes a sealed record adds around the ciphertext.
pub const SEAL_OVERHEAD: usize = 1 + NONCE_LEN + TAG_LEN;

/// Construction selector, carried as the first byte of a sealed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AeadFormat {
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    #[serde(rename = "chacha20-hmac-sha256")]
    ChaCha20HmacSha256,
}

impl AeadFormat {
    pub fn tag(self) -> u8 {
        match self {
            AeadFormat::ChaCha20Poly1305 => 0x01,
            AeadFormat::ChaCha20HmacSha256 => 0x02,
        }
    }
}

impl TryFrom<u8> for AeadFormat {
    type Error = CryptoError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x01 => Ok(AeadFormat::ChaCha20Poly1305),
            0x02 => Ok(AeadFormat::ChaCha20HmacSha256),
            _ => Err(CryptoError::UnknownFormat(v)),
        }
    }
}

fn check_lengths(key: &[u8], nonce: &[u8]) -> Result<(), CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength { expected: KEY_LEN, got: key.len() });
    }
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::InvalidNonceLength { expected: NONCE_LEN, got: nonce.len() });
    }
    Ok(())
}

// ── Raw constructions ─────────────────────────────────────────────────────────

/// Encrypt `plaintext`, returning `ciphertext ‖ tag`.
pub fn encrypt(
    format: AeadFormat,
    key: &[u8],
    nonce: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    check_lengths(key, nonce)?;
    match format {
        AeadFormat::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| CryptoError::InvalidKeyLength { expected: KEY_LEN, got: key.len() })?;
            cipher
                .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
                .map_err(|_| CryptoError::AuthenticationFailed)
        }
        AeadFormat::ChaCha20HmacSha256 => {
            let mut out = plaintext.to_vec();
            keystream(key, nonce, &mut out)?;
            let tag = stream_tag(key, aad, &out)?;
            out.extend_from_slice(&tag[..TAG_LEN]);
            Ok(out)
        }
    }
}

/// Verify and decrypt `ciphertext ‖ tag`.
pub fn decrypt(
    format: AeadFormat,
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    check_lengths(key, nonce)?;
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Truncated);
    }
    match format {
        AeadFormat::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| CryptoError::InvalidKeyLength { expected: KEY_LEN, got: key.len() })?;
            cipher
                .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
                .map_err(|_| CryptoError::AuthenticationFailed)
        }
        AeadFormat::ChaCha20HmacSha256 => {
            let (body, tag) = ciphertext.split_at(ciphertext.len() - TAG_LEN);
            let mut mac = KeyedHasher::new(MacAlgorithm::Sha256, key)?;
            mac.update(aad);
            mac.update(body);
            mac.verify_truncated(tag)?;
            let mut out = body.to_vec();
            keystream(key, nonce, &mut out)?;
            Ok(out)
        }
    }
}

fn keystream(key: &[u8], nonce: &[u8], buf: &mut [u8]) -> Result<(), CryptoError> {
    let mut cipher = ChaCha20::new_from_slices(key, nonce)
        .map_err(|_| CryptoError::InvalidKeyLength { expected: KEY_LEN, got: key.len() })?;
    // Block 0 is skipped, as in the native construction.
    cipher.seek(64u64);
    cipher.apply_keystream(buf);
    Ok(())
}

fn stream_tag(key: &[u8], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut mac = KeyedHasher::new(MacAlgorithm::Sha256, key)?;
    mac.update(aad);
    mac.update(ciphertext);
    Ok(mac.finalize())
}

// ── Sealed records ────────────────────────────────────────────────────────────

/// `format ‖ nonce ‖ ciphertext ‖ tag`.
pub fn seal(
    format: AeadFormat,
    key: &[u8],
    nonce: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let body = encrypt(format, key, nonce, plaintext, aad)?;
    let mut out = Vec::with_capacity(1 + NONCE_LEN + body.len());
    out.push(format.tag());
    out.extend_from_slice(nonce);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Open a record produced by [`seal`] with either construction.
///
/// Returns the format the sender chose, the nonce, and the plaintext.
pub fn open(key: &[u8], sealed: &[u8], aad: &[u8]) -> Result<Opened, CryptoError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(CryptoError::Truncated);
    }
    let format = AeadFormat::try_from(sealed[0])?;
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&sealed[1..1 + NONCE_LEN]);
    let plaintext = decrypt(format, key, &nonce, &sealed[1 + NONCE_LEN..], aad)?;
    Ok(Opened { format, nonce, plaintext })
}

#[derive(Debug)]
pub struct Opened {
    pub format: AeadFormat,
    pub nonce: [u8; NONCE_LEN],
    pub plaintext: Vec<u8>,
}
