//! Cryptographic primitives for SSU
//!
//! - AES-256-CBC datagram encryption (cbc)
//! - HMAC-MD5 datagram authentication (mac)
//! - 2048-bit MODP Diffie-Hellman for the handshake (dh)

pub mod cbc;
pub mod dh;
pub mod mac;

pub use dh::{DhKeyPair, DhKeySource, OsDhKeySource};
