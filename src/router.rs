//! Router identity and published address records
//!
//! The transport does not own identities. It signs and verifies handshake
//! transcripts, reads the local published address and updates the local
//! introducer list through [`RouterContext`]. [`LocalRouter`] is the
//! Ed25519-backed implementation the daemon uses.

use std::net::{IpAddr, SocketAddr};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::protocol::messages::KEY_SIZE;

/// Ed25519 public key length, which is also our identity record length
const IDENTITY_LEN: usize = 32;

/// Ed25519 signature length
const SIGNATURE_LEN: usize = 64;

/// A peer that relays introductions on behalf of a router behind NAT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Introducer {
    pub host: IpAddr,
    pub port: u16,
    pub tag: u32,
    pub key: [u8; KEY_SIZE],
}

impl Introducer {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Published SSU address of a router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterAddress {
    pub host: IpAddr,
    pub port: u16,
    pub intro_key: [u8; KEY_SIZE],
    pub introducers: Vec<Introducer>,
}

impl RouterAddress {
    pub fn new(endpoint: SocketAddr, intro_key: [u8; KEY_SIZE]) -> Self {
        Self {
            host: endpoint.ip(),
            port: endpoint.port(),
            intro_key,
            introducers: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// What this node knows about a remote router
#[derive(Debug, Clone)]
pub struct RouterInfo {
    /// Identity record, used to verify the router's handshake signatures
    pub identity: Vec<u8>,
    pub address: Option<RouterAddress>,
    /// Router takes part in peer tests
    pub peer_testing: bool,
    /// Router is only reachable through one of its introducers
    pub uses_introducer: bool,
}

impl RouterInfo {
    pub fn new(identity: Vec<u8>, address: Option<RouterAddress>) -> Self {
        let uses_introducer = address
            .as_ref()
            .map(|a| !a.introducers.is_empty())
            .unwrap_or(false);
        Self {
            identity,
            address,
            peer_testing: false,
            uses_introducer,
        }
    }

    pub fn with_peer_testing(mut self, peer_testing: bool) -> Self {
        self.peer_testing = peer_testing;
        self
    }

    /// Short printable identity hash for logs
    pub fn short_hash(&self) -> String {
        let digest = Sha256::digest(&self.identity);
        hex::encode(&digest[..4])
    }
}

/// Local router services the transport depends on
pub trait RouterContext: Send {
    /// Our full identity record, sent in SessionConfirmed
    fn identity(&self) -> &[u8];

    /// Length of signatures produced by [`RouterContext::sign`]
    fn signature_len(&self) -> usize;

    fn sign(&self, data: &[u8]) -> Vec<u8>;

    /// Signature length for a remote identity record, `None` if the record is malformed
    fn remote_signature_len(&self, identity: &[u8]) -> Option<usize>;

    fn verify(&self, identity: &[u8], data: &[u8], signature: &[u8]) -> bool;

    /// Our published SSU address
    fn address(&self) -> Option<&RouterAddress>;

    /// We hand out relay tags to peers that connect to us
    fn is_introducer(&self) -> bool;

    /// We are behind NAT and need introducers
    fn is_unreachable(&self) -> bool;

    /// A peer reported our externally visible address
    fn update_address(&mut self, ip: IpAddr);

    /// Publish an introducer; returns false if it was not accepted
    fn add_introducer(&mut self, introducer: Introducer) -> bool;

    fn remove_introducer(&mut self, endpoint: SocketAddr);
}

/// Ed25519 router identity with a published SSU address
pub struct LocalRouter {
    signing_key: SigningKey,
    identity: Vec<u8>,
    address: Option<RouterAddress>,
    introducer: bool,
    unreachable: bool,
    external_ip: Option<IpAddr>,
}

impl LocalRouter {
    pub fn new(signing_key: SigningKey, address: Option<RouterAddress>) -> Self {
        let identity = signing_key.verifying_key().to_bytes().to_vec();
        Self {
            signing_key,
            identity,
            address,
            introducer: false,
            unreachable: false,
            external_ip: None,
        }
    }

    /// Random identity, mostly for tests and first runs
    pub fn generate(address: Option<RouterAddress>) -> Self {
        Self::new(SigningKey::generate(&mut OsRng), address)
    }

    /// Identity from a 32-byte Ed25519 seed
    pub fn from_seed(seed: &[u8; 32], address: Option<RouterAddress>) -> Self {
        Self::new(SigningKey::from_bytes(seed), address)
    }

    pub fn with_introducer(mut self, introducer: bool) -> Self {
        self.introducer = introducer;
        self
    }

    pub fn with_unreachable(mut self, unreachable: bool) -> Self {
        self.unreachable = unreachable;
        self
    }

    /// The record other routers need to reach us
    pub fn router_info(&self) -> RouterInfo {
        let mut info = RouterInfo::new(self.identity.clone(), self.address.clone());
        info.uses_introducer = self.unreachable;
        info
    }

    /// Last externally visible address a peer reported
    pub fn external_ip(&self) -> Option<IpAddr> {
        self.external_ip
    }

    /// Introducers currently published in our address
    pub fn introducers(&self) -> &[Introducer] {
        self.address
            .as_ref()
            .map(|a| a.introducers.as_slice())
            .unwrap_or(&[])
    }
}

impl RouterContext for LocalRouter {
    fn identity(&self) -> &[u8] {
        &self.identity
    }

    fn signature_len(&self) -> usize {
        SIGNATURE_LEN
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }

    fn remote_signature_len(&self, identity: &[u8]) -> Option<usize> {
        (identity.len() == IDENTITY_LEN).then_some(SIGNATURE_LEN)
    }

    fn verify(&self, identity: &[u8], data: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = <[u8; IDENTITY_LEN]>::try_from(identity) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        verifying_key.verify(data, &signature).is_ok()
    }

    fn address(&self) -> Option<&RouterAddress> {
        self.address.as_ref()
    }

    fn is_introducer(&self) -> bool {
        self.introducer
    }

    fn is_unreachable(&self) -> bool {
        self.unreachable
    }

    fn update_address(&mut self, ip: IpAddr) {
        if self.external_ip != Some(ip) {
            tracing::info!("External address is {}", ip);
        }
        self.external_ip = Some(ip);
        if let Some(address) = self.address.as_mut() {
            address.host = ip;
        }
    }

    fn add_introducer(&mut self, introducer: Introducer) -> bool {
        let Some(address) = self.address.as_mut() else {
            return false;
        };
        if address
            .introducers
            .iter()
            .any(|i| i.endpoint() == introducer.endpoint())
        {
            return false;
        }
        tracing::info!("Publishing introducer {}", introducer.endpoint());
        address.introducers.push(introducer);
        true
    }

    fn remove_introducer(&mut self, endpoint: SocketAddr) {
        if let Some(address) = self.address.as_mut() {
            address.introducers.retain(|i| i.endpoint() != endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> RouterAddress {
        RouterAddress::new("127.0.0.1:4000".parse().unwrap(), [5u8; KEY_SIZE])
    }

    #[test]
    fn test_sign_verify() {
        let router = LocalRouter::generate(Some(address()));
        let signature = router.sign(b"transcript");
        assert_eq!(signature.len(), router.signature_len());

        let other = LocalRouter::generate(None);
        assert!(other.verify(router.identity(), b"transcript", &signature));
        assert!(!other.verify(router.identity(), b"transcript!", &signature));
        assert!(!other.verify(other.identity(), b"transcript", &signature));
        assert!(!other.verify(&[1, 2, 3], b"transcript", &signature));
    }

    #[test]
    fn test_seed_is_deterministic() {
        let a = LocalRouter::from_seed(&[7u8; 32], None);
        let b = LocalRouter::from_seed(&[7u8; 32], None);
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.remote_signature_len(b.identity()), Some(SIGNATURE_LEN));
        assert_eq!(a.remote_signature_len(&[0u8; 12]), None);
    }

    #[test]
    fn test_introducer_bookkeeping() {
        let mut router = LocalRouter::generate(Some(address())).with_unreachable(true);
        let introducer = Introducer {
            host: "10.0.0.9".parse().unwrap(),
            port: 9000,
            tag: 42,
            key: [1u8; KEY_SIZE],
        };

        assert!(router.add_introducer(introducer.clone()));
        assert!(!router.add_introducer(introducer.clone()));
        assert_eq!(router.introducers().len(), 1);
        assert!(router.router_info().uses_introducer);

        router.remove_introducer(introducer.endpoint());
        assert!(router.introducers().is_empty());
    }

    #[test]
    fn test_update_address() {
        let mut router = LocalRouter::generate(Some(address()));
        let ip: IpAddr = "198.51.100.4".parse().unwrap();
        router.update_address(ip);
        assert_eq!(router.external_ip(), Some(ip));
        assert_eq!(router.address().unwrap().host, ip);
    }

    #[test]
    fn test_router_info_uses_introducer() {
        let mut published = address();
        assert!(!RouterInfo::new(vec![1; 32], Some(published.clone())).uses_introducer);

        published.introducers.push(Introducer {
            host: "10.0.0.1".parse().unwrap(),
            port: 1,
            tag: 1,
            key: [0u8; KEY_SIZE],
        });
        assert!(RouterInfo::new(vec![1; 32], Some(published)).uses_introducer);
        assert_eq!(RouterInfo::new(vec![1; 32], None).short_hash().len(), 8);
    }
}
