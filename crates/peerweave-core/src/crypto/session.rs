//! Per-connection session cipher.
//!
//! Transport record layout:
//!
//! ```text
//!   length: u32 | format: u8 | nonce: 12 | ciphertext | tag: 16
//! ```
//!
//! The length prefix is the AAD. Nonces are `0u32 ‖ counter: u64`, one
//! counter per direction; a record whose counter does not increase is
//! rejected. Any failure to open a record closes the session for good.

use zeroize::Zeroizing;

use super::aead::{self, AeadFormat, NONCE_LEN, SEAL_OVERHEAD};
use super::CryptoError;

/// Crypto lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoState {
    /// Hellos not yet exchanged.
    Unauthenticated,
    /// Peer authenticated and keys derived; nothing decrypted yet.
    KeyAgreed,
    /// At least one record from the peer has opened. Items may be dispatched.
    EncryptedActive,
    Closed,
}

/// Symmetric state for one established connection.
pub struct SessionCipher {
    state: CryptoState,
    format: AeadFormat,
    send_key: Zeroizing<[u8; 32]>,
    recv_key: Zeroizing<[u8; 32]>,
    send_counter: u64,
    recv_floor: u64,
    session_id: [u8; 32],
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("state", &self.state)
            .field("format", &self.format)
            .field("send_counter", &self.send_counter)
            .field("recv_floor", &self.recv_floor)
            .finish_non_exhaustive()
    }
}

impl SessionCipher {
    pub(crate) fn new(
        format: AeadFormat,
        send_key: Zeroizing<[u8; 32]>,
        recv_key: Zeroizing<[u8; 32]>,
        session_id: [u8; 32],
    ) -> Self {
        Self {
            state: CryptoState::KeyAgreed,
            format,
            send_key,
            recv_key,
            send_counter: 0,
            recv_floor: 0,
            session_id,
        }
    }

    pub fn state(&self) -> CryptoState {
        self.state
    }

    /// Identical on both sides of the connection.
    pub fn session_id(&self) -> &[u8; 32] {
        &self.session_id
    }

    /// Construction used for outbound records.
    pub fn format(&self) -> AeadFormat {
        self.format
    }

    /// Seal one packet and append the full transport record to `out`.
    pub fn seal(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        match self.state {
            CryptoState::KeyAgreed | CryptoState::EncryptedActive => {}
            other => return Err(CryptoError::BadState(other)),
        }
        if self.send_counter == u64::MAX {
            return Err(CryptoError::NonceExhausted);
        }
        let nonce = nonce_for(self.send_counter);
        let len = u32::try_from(SEAL_OVERHEAD + plaintext.len()).map_err(|_| CryptoError::Truncated)?;
        let aad = len.to_be_bytes();
        let sealed = aead::seal(self.format, &self.send_key[..], &nonce, plaintext, &aad)?;
        self.send_counter += 1;
        out.extend_from_slice(&aad);
        out.extend_from_slice(&sealed);
        Ok(())
    }

    /// Open a record body (the bytes after its length prefix) into `out`.
    ///
    /// Either AEAD construction is accepted. On any failure the session
    /// moves to `Closed` and every later call fails.
    pub fn open(&mut self, record: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        match self.state {
            CryptoState::KeyAgreed | CryptoState::EncryptedActive => {}
            other => return Err(CryptoError::BadState(other)),
        }
        match self.try_open(record) {
            Ok(plaintext) => {
                self.state = CryptoState::EncryptedActive;
                out.extend_from_slice(&plaintext);
                Ok(())
            }
            Err(e) => {
                self.state = CryptoState::Closed;
                Err(e)
            }
        }
    }

    fn try_open(&mut self, record: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if record.len() < SEAL_OVERHEAD {
            return Err(CryptoError::Truncated);
        }
        let counter = counter_of(&record[1..1 + NONCE_LEN]).ok_or(CryptoError::Replay)?;
        if counter < self.recv_floor {
            return Err(CryptoError::Replay);
        }
        let aad = u32::try_from(record.len()).map_err(|_| CryptoError::Truncated)?.to_be_bytes();
        let opened = aead::open(&self.recv_key[..], record, &aad)?;
        self.recv_floor = counter.saturating_add(1);
        Ok(opened.plaintext)
    }

    pub fn close(&mut self) {
        self.state = CryptoState::Closed;
    }
}

fn nonce_for(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn counter_of(nonce: &[u8]) -> Option<u64> {
    if nonce[..4] != [0u8; 4] {
        return None;
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&nonce[4..NONCE_LEN]);
    Some(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A matched pair of session ciphers, as a handshake would produce.
    fn pair(a_format: AeadFormat, b_format: AeadFormat) -> (SessionCipher, SessionCipher) {
        let k1 = Zeroizing::new([1u8; 32]);
        let k2 = Zeroizing::new([2u8; 32]);
        let id = [9u8; 32];
        (
            SessionCipher::new(a_format, k1.clone(), k2.clone(), id),
            SessionCipher::new(b_format, k2, k1, id),
        )
    }

    fn body(record: &[u8]) -> &[u8] {
        &record[4..]
    }

    #[test]
    fn session_encrypt_decrypt_roundtrip() {
        let (mut a, mut b) = pair(AeadFormat::ChaCha20Poly1305, AeadFormat::ChaCha20Poly1305);
        assert_eq!(b.state(), CryptoState::KeyAgreed);

        let mut record = Vec::new();
        a.seal(b"first packet", &mut record).unwrap();
        let len = u32::from_be_bytes([record[0], record[1], record[2], record[3]]) as usize;
        assert_eq!(len, record.len() - 4);

        let mut out = Vec::new();
        b.open(body(&record), &mut out).unwrap();
        assert_eq!(out, b"first packet");
        assert_eq!(b.state(), CryptoState::EncryptedActive);
    }

    #[test]
    fn mixed_formats_interoperate() {
        let (mut a, mut b) = pair(AeadFormat::ChaCha20HmacSha256, AeadFormat::ChaCha20Poly1305);
        let mut record = Vec::new();
        a.seal(b"from a", &mut record).unwrap();
        let mut out = Vec::new();
        b.open(body(&record), &mut out).unwrap();
        assert_eq!(out, b"from a");

        record.clear();
        out.clear();
        b.seal(b"from b", &mut record).unwrap();
        a.open(body(&record), &mut out).unwrap();
        assert_eq!(out, b"from b");
    }

    #[test]
    fn tampered_ciphertext_closes_the_session() {
        let (mut a, mut b) = pair(AeadFormat::ChaCha20Poly1305, AeadFormat::ChaCha20Poly1305);
        let mut record = Vec::new();
        a.seal(b"payload", &mut record).unwrap();
        let last = record.len() - 1;
        record[last] ^= 0xff;

        let mut out = Vec::new();
        assert!(b.open(body(&record), &mut out).is_err(), "tampered record must be rejected");
        assert!(out.is_empty(), "no plaintext may be released");
        assert_eq!(b.state(), CryptoState::Closed);

        let mut fresh = Vec::new();
        a.seal(b"again", &mut fresh).unwrap();
        assert!(matches!(b.open(body(&fresh), &mut out), Err(CryptoError::BadState(CryptoState::Closed))));
    }

    #[test]
    fn replayed_record_is_rejected() {
        let (mut a, mut b) = pair(AeadFormat::ChaCha20Poly1305, AeadFormat::ChaCha20Poly1305);
        let mut first = Vec::new();
        a.seal(b"one", &mut first).unwrap();
        let mut out = Vec::new();
        b.open(body(&first), &mut out).unwrap();
        assert!(matches!(b.open(body(&first), &mut out), Err(CryptoError::Replay)));
    }

    #[test]
    fn truncated_length_prefix_changes_aad() {
        let (mut a, mut b) = pair(AeadFormat::ChaCha20HmacSha256, AeadFormat::ChaCha20HmacSha256);
        let mut record = Vec::new();
        a.seal(b"payload!", &mut record).unwrap();
        let mut out = Vec::new();
        // Dropping the final byte changes the length used as AAD.
        assert!(b.open(&record[4..record.len() - 1], &mut out).is_err());
    }

    #[test]
    fn closed_session_refuses_to_seal() {
        let (mut a, _) = pair(AeadFormat::ChaCha20Poly1305, AeadFormat::ChaCha20Poly1305);
        a.close();
        let mut out = Vec::new();
        assert!(matches!(a.seal(b"x", &mut out), Err(CryptoError::BadState(CryptoState::Closed))));
    }
}
