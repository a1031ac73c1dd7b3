//! 2048-bit Diffie-Hellman for the SSU handshake
//!
//! Uses the RFC 3526 2048-bit MODP group with generator 2. Public values and
//! shared secrets travel as 256-byte big-endian integers, left-padded with
//! zeros.

use std::fmt;
use std::sync::OnceLock;

use num_bigint::BigUint;
use rand::{rngs::OsRng, RngCore};

use crate::error::CryptoError;

/// Length of a public value or shared secret
pub const DH_KEY_LEN: usize = 256;

/// Length of a private exponent
const PRIVATE_KEY_LEN: usize = 32;

const PRIME_HEX: &str = concat!(
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

fn prime() -> &'static BigUint {
    static PRIME: OnceLock<BigUint> = OnceLock::new();
    PRIME.get_or_init(|| {
        BigUint::parse_bytes(PRIME_HEX.as_bytes(), 16).expect("group prime is valid hex")
    })
}

fn to_fixed(value: &BigUint) -> [u8; DH_KEY_LEN] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; DH_KEY_LEN];
    out[DH_KEY_LEN - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Ephemeral DH key pair, owned by a session while its handshake runs
pub struct DhKeyPair {
    private: BigUint,
    public: [u8; DH_KEY_LEN],
}

impl DhKeyPair {
    /// Generate a fresh key pair from the OS RNG
    pub fn generate() -> Self {
        let mut private = [0u8; PRIVATE_KEY_LEN];
        OsRng.fill_bytes(&mut private);
        Self::from_private_bytes(&private)
    }

    /// Build a key pair from a big-endian private exponent
    pub fn from_private_bytes(bytes: &[u8]) -> Self {
        let private = BigUint::from_bytes_be(bytes);
        let public = BigUint::from(2u32).modpow(&private, prime());
        Self {
            private,
            public: to_fixed(&public),
        }
    }

    /// Our public value
    pub fn public_key(&self) -> &[u8; DH_KEY_LEN] {
        &self.public
    }

    /// Compute the shared secret with the peer's public value
    pub fn agree(&self, peer_public: &[u8]) -> Result<[u8; DH_KEY_LEN], CryptoError> {
        if peer_public.len() != DH_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: DH_KEY_LEN,
                got: peer_public.len(),
            });
        }

        let p = prime();
        let peer = BigUint::from_bytes_be(peer_public);
        let one = BigUint::from(1u32);
        if peer <= one || peer >= p - &one {
            return Err(CryptoError::DiffieHellman);
        }

        Ok(to_fixed(&peer.modpow(&self.private, p)))
    }
}

impl fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("public", &hex::encode(&self.public[..8]))
            .finish_non_exhaustive()
    }
}

/// Source of ephemeral key pairs for new handshakes
pub trait DhKeySource: Send {
    fn next_key_pair(&mut self) -> DhKeyPair;
}

/// Generates a new key pair on every request
#[derive(Debug, Default)]
pub struct OsDhKeySource;

impl DhKeySource for OsDhKeySource {
    fn next_key_pair(&mut self) -> DhKeyPair {
        DhKeyPair::generate()
    }
}
