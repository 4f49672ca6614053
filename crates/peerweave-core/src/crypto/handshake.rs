//! Signed hello exchange and session key derivation.
//!
//! Each side sends one hello and reads one hello; there is no third
//! message. Layout (big-endian):
//!
//! ```text
//!   magic "PWV1"        4
//!   profile             1   (1 = classic DH, 2 = modern X25519)
//!   aead preference     1
//!   location id        16
//!   identity key       32   (Ed25519)
//!   ephemeral length    2
//!   ephemeral           n   (256 for classic, 32 for modern)
//!   signature          64   over "peerweave-hello" ‖ profile ‖ location ‖ ephemeral
//! ```
//!
//! After both hellos are in, each side runs HKDF-SHA256 over the shared
//! secret, salted with the BLAKE3 transcript hash, and splits the output
//! into two directional keys and the session id.

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::aead::AeadFormat;
use super::dh::{DhGroup, DhKeypair, DH_LEN};
use super::keys::{verify_signature, EphemeralX25519, IdentityKeypair};
use super::session::{CryptoState, SessionCipher};
use super::{transcript_hash, CryptoError};
use crate::identity::{LocationId, LOCATION_ID_LEN};

pub const HELLO_MAGIC: [u8; 4] = *b"PWV1";

const SIGNATURE_CONTEXT: &[u8] = b"peerweave-hello";
const KEY_INFO: &[u8] = b"peerweave session keys";
const FIXED_LEN: usize = 4 + 1 + 1 + LOCATION_ID_LEN + 32 + 2;
const SIGNATURE_LEN: usize = 64;

/// Key agreement family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Finite-field DH over the embedded safe prime.
    Classic,
    /// X25519.
    Modern,
}

impl Profile {
    pub fn tag(self) -> u8 {
        match self {
            Profile::Classic => 1,
            Profile::Modern => 2,
        }
    }

    fn ephemeral_len(self) -> usize {
        match self {
            Profile::Classic => DH_LEN,
            Profile::Modern => 32,
        }
    }
}

impl TryFrom<u8> for Profile {
    type Error = CryptoError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Profile::Classic),
            2 => Ok(Profile::Modern),
            _ => Err(CryptoError::MalformedHello("unknown profile")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone)]
pub struct HandshakeParams {
    pub profile: Profile,
    /// Construction this side seals with. Either is accepted inbound.
    pub aead: AeadFormat,
    pub dh_generator: u32,
    /// Pinned identity key of the peer, when known in advance.
    pub expected_peer: Option<[u8; 32]>,
}

// ── Hello ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub profile: Profile,
    pub aead: AeadFormat,
    pub location_id: LocationId,
    pub identity_key: [u8; 32],
    pub ephemeral: Vec<u8>,
    pub signature: [u8; 64],
}

impl Hello {
    fn signed_payload(profile: Profile, location_id: &LocationId, ephemeral: &[u8]) -> Vec<u8> {
        let mut msg = Vec::with_capacity(SIGNATURE_CONTEXT.len() + 1 + LOCATION_ID_LEN + ephemeral.len());
        msg.extend_from_slice(SIGNATURE_CONTEXT);
        msg.push(profile.tag());
        msg.extend_from_slice(location_id.as_bytes());
        msg.extend_from_slice(ephemeral);
        msg
    }

    fn signed(identity: &IdentityKeypair, profile: Profile, aead: AeadFormat, ephemeral: Vec<u8>) -> Self {
        let location_id = LocationId::from_public_key(&identity.public);
        let signature = identity.sign(&Self::signed_payload(profile, &location_id, &ephemeral));
        Self {
            profile,
            aead,
            location_id,
            identity_key: identity.public,
            ephemeral,
            signature,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_LEN + self.ephemeral.len() + SIGNATURE_LEN);
        out.extend_from_slice(&HELLO_MAGIC);
        out.push(self.profile.tag());
        out.push(self.aead.tag());
        out.extend_from_slice(self.location_id.as_bytes());
        out.extend_from_slice(&self.identity_key);
        out.extend_from_slice(&(self.ephemeral.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.ephemeral);
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < FIXED_LEN + SIGNATURE_LEN {
            return Err(CryptoError::MalformedHello("too short"));
        }
        if bytes[..4] != HELLO_MAGIC {
            return Err(CryptoError::MalformedHello("bad magic"));
        }
        let profile = Profile::try_from(bytes[4])?;
        let aead = AeadFormat::try_from(bytes[5])?;
        let mut location = [0u8; LOCATION_ID_LEN];
        location.copy_from_slice(&bytes[6..6 + LOCATION_ID_LEN]);
        let mut identity_key = [0u8; 32];
        identity_key.copy_from_slice(&bytes[22..54]);
        let eph_len = u16::from_be_bytes([bytes[54], bytes[55]]) as usize;
        if eph_len != profile.ephemeral_len() {
            return Err(CryptoError::MalformedHello("ephemeral length does not match profile"));
        }
        if bytes.len() != FIXED_LEN + eph_len + SIGNATURE_LEN {
            return Err(CryptoError::MalformedHello("length mismatch"));
        }
        let ephemeral = bytes[FIXED_LEN..FIXED_LEN + eph_len].to_vec();
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&bytes[FIXED_LEN + eph_len..]);
        Ok(Self {
            profile,
            aead,
            location_id: LocationId(location),
            identity_key,
            ephemeral,
            signature,
        })
    }

    /// Check the signature and that the location id belongs to the key.
    pub fn verify(&self) -> Result<(), CryptoError> {
        if LocationId::from_public_key(&self.identity_key) != self.location_id {
            return Err(CryptoError::IdentityMismatch);
        }
        let msg = Self::signed_payload(self.profile, &self.location_id, &self.ephemeral);
        verify_signature(&self.identity_key, &msg, &self.signature)
    }
}

/// Who is on the other end, once authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    pub location_id: LocationId,
    pub identity_key: [u8; 32],
}

// ── Handshake ─────────────────────────────────────────────────────────────────

enum Ephemeral {
    Classic { group: DhGroup, keypair: DhKeypair },
    Modern(EphemeralX25519),
}

/// One side of the hello exchange.
///
/// `start` produces the hello to send; `finish` consumes the peer's hello
/// and yields the session cipher. The handshake is `Unauthenticated` until
/// `finish` succeeds.
pub struct Handshake {
    role: Role,
    params: HandshakeParams,
    local_hello: Vec<u8>,
    ephemeral: Ephemeral,
}

impl Handshake {
    pub fn start(
        role: Role,
        identity: &IdentityKeypair,
        params: HandshakeParams,
    ) -> Result<(Self, Vec<u8>), CryptoError> {
        let ephemeral = match params.profile {
            Profile::Classic => {
                let group = DhGroup::modp2048(params.dh_generator)?;
                let keypair = group.generate_keypair();
                Ephemeral::Classic { group, keypair }
            }
            Profile::Modern => Ephemeral::Modern(EphemeralX25519::generate()),
        };
        let public = match &ephemeral {
            Ephemeral::Classic { keypair, .. } => keypair.public().to_vec(),
            Ephemeral::Modern(x) => x.public.to_vec(),
        };
        let hello = Hello::signed(identity, params.profile, params.aead, public).to_bytes();
        Ok((
            Self { role, params, local_hello: hello.clone(), ephemeral },
            hello,
        ))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> CryptoState {
        CryptoState::Unauthenticated
    }

    /// Authenticate the peer's hello and derive the session.
    pub fn finish(self, peer_hello: &[u8]) -> Result<(SessionCipher, PeerIdentity), CryptoError> {
        let hello = Hello::parse(peer_hello)?;
        hello.verify()?;
        if let Some(expected) = self.params.expected_peer {
            if expected != hello.identity_key {
                return Err(CryptoError::IdentityMismatch);
            }
        }
        if hello.profile != self.params.profile {
            return Err(CryptoError::ProfileMismatch { local: self.params.profile, peer: hello.profile });
        }

        let shared = match &self.ephemeral {
            Ephemeral::Classic { group, keypair } => keypair.agree(group, &hello.ephemeral)?,
            Ephemeral::Modern(x) => x.agree(&hello.ephemeral)?,
        };

        let salt = match self.role {
            Role::Initiator => transcript_hash(&self.local_hello, peer_hello),
            Role::Responder => transcript_hash(peer_hello, &self.local_hello),
        };
        let (i2r, r2i, session_id) = derive_keys(&salt, &shared)?;
        let (send, recv) = match self.role {
            Role::Initiator => (i2r, r2i),
            Role::Responder => (r2i, i2r),
        };

        let peer = PeerIdentity { location_id: hello.location_id, identity_key: hello.identity_key };
        Ok((SessionCipher::new(self.params.aead, send, recv, session_id), peer))
    }
}

type DirectionalKeys = (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>, [u8; 32]);

fn derive_keys(salt: &[u8; 32], shared: &[u8]) -> Result<DirectionalKeys, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared);
    let mut okm = Zeroizing::new([0u8; 96]);
    hk.expand(KEY_INFO, &mut okm[..]).map_err(|_| CryptoError::KeyDerivation)?;

    let mut i2r = Zeroizing::new([0u8; 32]);
    let mut r2i = Zeroizing::new([0u8; 32]);
    let mut session_id = [0u8; 32];
    i2r.copy_from_slice(&okm[..32]);
    r2i.copy_from_slice(&okm[32..64]);
    session_id.copy_from_slice(&okm[64..]);
    Ok((i2r, r2i, session_id))
}
