//! Finite-field Diffie-Hellman over a fixed safe prime.
//!
//! The modulus is the 2048-bit MODP group from RFC 3526 (group 14). It is
//! a safe prime: `P = 2Q + 1` with `Q` prime, which [`DhGroup::verify`]
//! re-checks with Miller-Rabin. Public values and shared secrets are always
//! left-padded to [`DH_LEN`] bytes.

use num_bigint::BigUint;
use rand::{Rng, RngCore};
use zeroize::Zeroizing;

use super::CryptoError;

/// Byte length of the modulus, public values and shared secrets.
pub const DH_LEN: usize = 256;

/// Bits of randomness in a private exponent.
const PRIVATE_BYTES: usize = 32;

const MODP_2048: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

const SMALL_PRIMES: [u32; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];

// ── Group ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DhGroup {
    p: BigUint,
    g: BigUint,
}

impl DhGroup {
    /// The embedded 2048-bit group with generator 2 or 5.
    pub fn modp2048(generator: u32) -> Result<Self, CryptoError> {
        if generator != 2 && generator != 5 {
            return Err(CryptoError::BadGenerator(generator));
        }
        let p = BigUint::parse_bytes(MODP_2048.as_bytes(), 16).ok_or(CryptoError::NotSafePrime)?;
        Ok(Self { p, g: BigUint::from(generator) })
    }

    pub fn prime(&self) -> &BigUint {
        &self.p
    }

    pub fn generator(&self) -> &BigUint {
        &self.g
    }

    /// Check that the modulus is a safe prime.
    ///
    /// Costs two Miller-Rabin runs over 2048-bit numbers; call once at
    /// startup, not per connection.
    pub fn verify(&self) -> Result<(), CryptoError> {
        let q = (&self.p - 1u32) >> 1u32;
        if is_probable_prime(&self.p, 4) && is_probable_prime(&q, 4) {
            Ok(())
        } else {
            Err(CryptoError::NotSafePrime)
        }
    }

    pub fn generate_keypair(&self) -> DhKeypair {
        let mut private = Zeroizing::new(vec![0u8; PRIVATE_BYTES]);
        rand::thread_rng().fill_bytes(&mut private);
        let x = BigUint::from_bytes_be(&private);
        let public = left_pad(&self.g.modpow(&x, &self.p).to_bytes_be());
        DhKeypair { private, public }
    }
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// An ephemeral DH keypair. Lives for one handshake.
pub struct DhKeypair {
    private: Zeroizing<Vec<u8>>,
    public: Vec<u8>,
}

impl DhKeypair {
    pub fn public(&self) -> &[u8] {
        &self.public
    }

    /// Compute the shared secret from the peer's public value.
    ///
    /// Values outside `[2, P-2]` are refused; they would pin the secret to a
    /// tiny subgroup.
    pub fn agree(&self, group: &DhGroup, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if peer_public.len() != DH_LEN {
            return Err(CryptoError::InvalidPublicValue);
        }
        let y = BigUint::from_bytes_be(peer_public);
        let upper = &group.p - 2u32;
        if y < BigUint::from(2u32) || y > upper {
            return Err(CryptoError::InvalidPublicValue);
        }
        let x = BigUint::from_bytes_be(&self.private);
        Ok(Zeroizing::new(left_pad(&y.modpow(&x, &group.p).to_bytes_be())))
    }
}

fn left_pad(bytes: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; DH_LEN.saturating_sub(bytes.len())];
    out.extend_from_slice(bytes);
    out
}

// ── Primality ─────────────────────────────────────────────────────────────────

/// Miller-Rabin with the first twelve primes as fixed bases plus `random_rounds`
/// random bases.
pub fn is_probable_prime(n: &BigUint, random_rounds: usize) -> bool {
    let two = BigUint::from(2u32);
    if *n < two {
        return false;
    }
    for p in SMALL_PRIMES {
        let p = BigUint::from(p);
        if *n == p {
            return true;
        }
        if (n % &p) == BigUint::from(0u32) {
            return false;
        }
    }

    let one = BigUint::from(1u32);
    let n_minus_1 = n - &one;
    let s = n_minus_1.trailing_zeros().unwrap_or(0);
    let d = &n_minus_1 >> s;

    let witness = |a: &BigUint| -> bool {
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_1 {
            return true;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_1 {
                return true;
            }
        }
        false
    };

    for p in SMALL_PRIMES {
        if !witness(&BigUint::from(p)) {
            return false;
        }
    }

    let bytes = ((n.bits() + 7) / 8) as usize;
    let range = n - 3u32;
    let mut rng = rand::thread_rng();
    for _ in 0..random_rounds {
        let mut buf = vec![0u8; bytes];
        rng.fill(&mut buf[..]);
        let a = BigUint::from_bytes_be(&buf) % &range + &two;
        if !witness(&a) {
            return false;
        }
    }
    true
}
