//! Handshake transcript accumulator
//!
//! SessionCreated and SessionConfirmed both sign a concatenation of both DH
//! public values, two address/port pairs, the relay tag and a timestamp.
//! The field order matters and differs per message, so each side builds the
//! transcript explicitly with these helpers.

use std::net::SocketAddr;

use bytes::{BufMut, BytesMut};

use crate::protocol::messages::ip_bytes;
use crate::router::RouterContext;

#[derive(Debug, Default)]
pub struct SignedData {
    buf: BytesMut,
}

impl SignedData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self
    }

    /// Raw address bytes followed by the big-endian port
    pub fn insert_endpoint(&mut self, endpoint: &SocketAddr) -> &mut Self {
        self.buf.put_slice(&ip_bytes(&endpoint.ip()));
        self.buf.put_u16(endpoint.port());
        self
    }

    pub fn insert_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn sign(&self, router: &dyn RouterContext) -> Vec<u8> {
        router.sign(&self.buf)
    }

    pub fn verify(&self, router: &dyn RouterContext, identity: &[u8], signature: &[u8]) -> bool {
        router.verify(identity, &self.buf, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::LocalRouter;

    #[test]
    fn test_layout() {
        let mut data = SignedData::new();
        data.insert(&[0xaa, 0xbb])
            .insert_endpoint(&"10.0.0.1:258".parse().unwrap())
            .insert_u32(0x0102_0304);

        assert_eq!(
            data.as_bytes(),
            &[0xaa, 0xbb, 10, 0, 0, 1, 0x01, 0x02, 1, 2, 3, 4]
        );
    }

    #[test]
    fn test_ipv6_endpoint_is_sixteen_bytes() {
        let mut data = SignedData::new();
        data.insert_endpoint(&"[2001:db8::5]:1".parse().unwrap());
        assert_eq!(data.as_bytes().len(), 18);
    }

    #[test]
    fn test_sign_verify() {
        let signer = LocalRouter::generate(None);
        let verifier = LocalRouter::generate(None);

        let mut data = SignedData::new();
        data.insert(b"x").insert(b"y").insert_u32(7);
        let signature = data.sign(&signer);
        assert!(data.verify(&verifier, signer.identity(), &signature));

        data.insert_u32(8);
        assert!(!data.verify(&verifier, signer.identity(), &signature));
    }
}
