//! Legacy AES-CBC payloads for historical peers.
//!
//! Old peers hand over a 16-byte key and an 8-byte IV (half a block). The
//! real AES-256 key and 16-byte IV are stretched from them with
//! EVP_BytesToKey over SHA-1, five rounds:
//!
//! ```text
//!   D_0 = ""
//!   D_i = SHA1^5(D_{i-1} ‖ key ‖ iv8)
//!   key32 ‖ iv16 = first 48 bytes of D_1 ‖ D_2 ‖ D_3
//! ```
//!
//! Lengths are never padded or truncated: anything other than 16 and 8
//! bytes is rejected before any work is done.

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha1::{Digest, Sha1};
use zeroize::Zeroizing;

use super::mac::{KeyedHasher, MacAlgorithm};
use super::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const LEGACY_KEY_LEN: usize = 16;
pub const LEGACY_IV_LEN: usize = 8;

const DERIVE_ROUNDS: usize = 5;
const BLOCK: usize = 16;

fn check_lengths(key: &[u8], iv: &[u8]) -> Result<(), CryptoError> {
    if key.len() != LEGACY_KEY_LEN {
        return Err(CryptoError::InvalidKeyLength { expected: LEGACY_KEY_LEN, got: key.len() });
    }
    if iv.len() != LEGACY_IV_LEN {
        return Err(CryptoError::InvalidIvLength { expected: LEGACY_IV_LEN, got: iv.len() });
    }
    Ok(())
}

/// Stretch a legacy key and half-block IV into AES-256 parameters.
pub fn derive_key_iv(key: &[u8], iv: &[u8]) -> Result<(Zeroizing<[u8; 32]>, [u8; 16]), CryptoError> {
    check_lengths(key, iv)?;

    let mut material = Zeroizing::new(Vec::with_capacity(60));
    let mut prev: Vec<u8> = Vec::new();
    while material.len() < 48 {
        let mut hasher = Sha1::new();
        hasher.update(&prev);
        hasher.update(key);
        hasher.update(iv);
        let mut digest = hasher.finalize();
        for _ in 1..DERIVE_ROUNDS {
            digest = Sha1::digest(digest);
        }
        material.extend_from_slice(&digest);
        prev = digest.to_vec();
    }

    let mut aes_key = Zeroizing::new([0u8; 32]);
    aes_key.copy_from_slice(&material[..32]);
    let mut aes_iv = [0u8; 16];
    aes_iv.copy_from_slice(&material[32..48]);
    Ok((aes_key, aes_iv))
}

pub fn encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (aes_key, aes_iv) = derive_key_iv(key, iv)?;
    let cipher = Aes256CbcEnc::new_from_slices(&aes_key[..], &aes_iv)
        .map_err(|_| CryptoError::InvalidKeyLength { expected: 32, got: aes_key.len() })?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypt and strip PKCS#7 padding. Bad padding reads as an
/// authentication failure; callers should prefer [`open_with_hmac`].
pub fn decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (aes_key, aes_iv) = derive_key_iv(key, iv)?;
    if ciphertext.is_empty() || ciphertext.len() % BLOCK != 0 {
        return Err(CryptoError::Truncated);
    }
    let cipher = Aes256CbcDec::new_from_slices(&aes_key[..], &aes_iv)
        .map_err(|_| CryptoError::InvalidKeyLength { expected: 32, got: aes_key.len() })?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Encrypt, then append HMAC(key, ciphertext).
pub fn seal_with_hmac(
    algorithm: MacAlgorithm,
    key: &[u8],
    iv: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut out = encrypt(key, iv, plaintext)?;
    let mut mac = KeyedHasher::new(algorithm, key)?;
    mac.update(&out);
    out.extend_from_slice(&mac.finalize());
    Ok(out)
}

/// Verify the trailing HMAC before touching the ciphertext.
pub fn open_with_hmac(
    algorithm: MacAlgorithm,
    key: &[u8],
    iv: &[u8],
    sealed: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    check_lengths(key, iv)?;
    let tag_len = algorithm.output_len();
    if sealed.len() < tag_len {
        return Err(CryptoError::Truncated);
    }
    let (ciphertext, tag) = sealed.split_at(sealed.len() - tag_len);
    let mut mac = KeyedHasher::new(algorithm, key)?;
    mac.update(ciphertext);
    mac.verify(tag)?;
    decrypt(key, iv, ciphertext)
}
