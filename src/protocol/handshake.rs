//! SSU session establishment
//!
//! Implements the three-message handshake:
//! 1. Initiator -> Responder: SessionRequest (X), sealed with the responder's intro key
//! 2. Responder -> Initiator: SessionCreated (Y, signature), sealed with the responder's intro key
//! 3. Initiator -> Responder: SessionConfirmed (identity, signature), sealed with the session key
//!
//! Both sides derive the session and MAC keys from the 2048-bit DH shared
//! secret with [`derive_session_keys`].

use std::fmt;
use std::net::SocketAddr;

use sha2::{Digest, Sha256};

use crate::crypto::cbc;
use crate::crypto::dh::{DhKeyPair, DH_KEY_LEN};
use crate::error::{CryptoError, ProtocolError, SsuError};
use crate::protocol::codec::{self, PacketKeys};
use crate::protocol::messages::{
    PayloadType, SessionConfirmed, SessionCreated, SessionRequest, IV_SIZE, KEY_SIZE,
};
use crate::protocol::signed_data::SignedData;
use crate::router::RouterContext;

/// Symmetric keys of an established session
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub session_key: [u8; KEY_SIZE],
    pub mac_key: [u8; KEY_SIZE],
}

impl SessionKeys {
    pub fn packet_keys(&self) -> PacketKeys<'_> {
        PacketKeys {
            aes: &self.session_key,
            mac: &self.mac_key,
        }
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("session_key", &hex::encode(&self.session_key[..4]))
            .field("mac_key", &hex::encode(&self.mac_key[..4]))
            .finish()
    }
}

/// Derive the session and MAC keys from a DH shared secret.
///
/// The secret is a 256-byte big-endian integer:
/// - high bit set: session key is a zero byte followed by bytes 0..31, MAC key bytes 31..63
/// - first byte non-zero: session key bytes 0..32, MAC key bytes 32..64
/// - first byte zero: skip to the first non-zero byte `k` (at most 32);
///   session key bytes k..k+32, MAC key SHA-256 of bytes k..64
pub fn derive_session_keys(shared: &[u8; DH_KEY_LEN]) -> Result<SessionKeys, CryptoError> {
    let mut session_key = [0u8; KEY_SIZE];
    let mut mac_key = [0u8; KEY_SIZE];

    if shared[0] & 0x80 != 0 {
        session_key[1..].copy_from_slice(&shared[..31]);
        mac_key.copy_from_slice(&shared[31..63]);
    } else if shared[0] != 0 {
        session_key.copy_from_slice(&shared[..32]);
        mac_key.copy_from_slice(&shared[32..64]);
    } else {
        let k = shared[1..=32]
            .iter()
            .position(|&b| b != 0)
            .map(|i| i + 1)
            .ok_or(CryptoError::KeyDerivation)?;
        tracing::warn!("DH shared secret has {} leading zero bytes", k);
        session_key.copy_from_slice(&shared[k..k + 32]);
        mac_key.copy_from_slice(&Sha256::digest(&shared[k..64]));
    }

    Ok(SessionKeys {
        session_key,
        mac_key,
    })
}

/// Initiator: build the SessionRequest datagram
pub fn create_session_request(
    dh: &DhKeyPair,
    remote: SocketAddr,
    intro_key: &[u8; KEY_SIZE],
) -> Result<Vec<u8>, SsuError> {
    let request = SessionRequest {
        x: *dh.public_key(),
        address: Some(remote.ip()),
    };

    tracing::debug!(
        "SessionRequest to {}: X={}...",
        remote,
        hex::encode(&request.x[..8])
    );

    Ok(codec::seal_random(
        PayloadType::SessionRequest,
        &request.encode(),
        PacketKeys::intro(intro_key),
    )?)
}

/// Responder: build the SessionCreated datagram.
///
/// `initiator` is the endpoint the request arrived from. The signature is
/// encrypted under the new session key with the same IV that seals the
/// datagram.
pub fn create_session_created(
    router: &dyn RouterContext,
    x: &[u8; DH_KEY_LEN],
    dh: &DhKeyPair,
    keys: &SessionKeys,
    initiator: SocketAddr,
    relay_tag: u32,
) -> Result<Vec<u8>, SsuError> {
    let address = router.address().ok_or(ProtocolError::NoAddress)?;
    let intro_key = address.intro_key;
    let signed_on = codec::timestamp_now();

    let mut signed = SignedData::new();
    signed
        .insert(x)
        .insert(dh.public_key())
        .insert_endpoint(&initiator)
        .insert_endpoint(&address.endpoint())
        .insert_u32(relay_tag)
        .insert_u32(signed_on);

    let signature = signed.sign(router);
    let mut encrypted_signature = vec![0u8; cbc::padded_len(signature.len())];
    encrypted_signature[..signature.len()].copy_from_slice(&signature);

    let iv = codec::random_iv();
    cbc::encrypt(&keys.session_key, &iv, &mut encrypted_signature)?;

    let created = SessionCreated {
        y: *dh.public_key(),
        observed: initiator,
        relay_tag,
        signed_on,
        encrypted_signature,
    };

    tracing::debug!(
        "SessionCreated to {}: Y={}... relay tag {}",
        initiator,
        hex::encode(&created.y[..8]),
        relay_tag
    );

    Ok(codec::seal(
        PayloadType::SessionCreated,
        &created.encode(),
        PacketKeys::intro(&intro_key),
        &iv,
    )?)
}

/// What the initiator learns from a SessionCreated
#[derive(Debug)]
pub struct CreatedOutcome {
    pub keys: SessionKeys,
    /// Our endpoint as the responder sees it
    pub observed: SocketAddr,
    pub relay_tag: u32,
    /// False if the signature could not be checked or did not verify
    pub signature_valid: bool,
}

/// Initiator: derive keys from a SessionCreated and check its signature.
///
/// `iv` is the IV from the datagram header; `remote_identity` is the
/// responder's identity record, if known.
pub fn process_session_created(
    router: &dyn RouterContext,
    dh: &DhKeyPair,
    remote: SocketAddr,
    remote_identity: Option<&[u8]>,
    iv: &[u8; IV_SIZE],
    created: &SessionCreated,
) -> Result<CreatedOutcome, SsuError> {
    let shared = dh.agree(&created.y)?;
    let keys = derive_session_keys(&shared)?;

    let mut signed = SignedData::new();
    signed
        .insert(dh.public_key())
        .insert(&created.y)
        .insert_endpoint(&created.observed)
        .insert_endpoint(&remote)
        .insert_u32(created.relay_tag)
        .insert_u32(created.signed_on);

    let signature_valid = match remote_identity {
        Some(identity) => match router.remote_signature_len(identity) {
            Some(len) if cbc::padded_len(len) <= created.encrypted_signature.len() => {
                let mut signature = created.encrypted_signature[..cbc::padded_len(len)].to_vec();
                cbc::decrypt(&keys.session_key, iv, &mut signature)?;
                signed.verify(router, identity, &signature[..len])
            }
            _ => false,
        },
        None => false,
    };

    Ok(CreatedOutcome {
        keys,
        observed: created.observed,
        relay_tag: created.relay_tag,
        signature_valid,
    })
}

/// Initiator: build the SessionConfirmed datagram
pub fn create_session_confirmed(
    router: &dyn RouterContext,
    x: &[u8; DH_KEY_LEN],
    y: &[u8; DH_KEY_LEN],
    observed: SocketAddr,
    remote: SocketAddr,
    relay_tag: u32,
    keys: &SessionKeys,
) -> Result<Vec<u8>, SsuError> {
    let signed_on = codec::timestamp_now();

    let mut signed = SignedData::new();
    signed
        .insert(x)
        .insert(y)
        .insert_endpoint(&observed)
        .insert_endpoint(&remote)
        .insert_u32(relay_tag)
        .insert_u32(signed_on);

    let confirmed = SessionConfirmed::new(router.identity().to_vec(), signed_on, &signed.sign(router));

    tracing::debug!("SessionConfirmed to {}", remote);

    Ok(codec::seal_random(
        PayloadType::SessionConfirmed,
        &confirmed.encode(),
        keys.packet_keys(),
    )?)
}

/// Responder: check the initiator's SessionConfirmed signature.
///
/// `initiator` is the initiator's endpoint as we see it; `local` is our
/// endpoint as the initiator addressed it.
pub fn verify_session_confirmed(
    router: &dyn RouterContext,
    x: &[u8; DH_KEY_LEN],
    y: &[u8; DH_KEY_LEN],
    initiator: SocketAddr,
    local: SocketAddr,
    relay_tag: u32,
    confirmed: &SessionConfirmed,
) -> Result<(), ProtocolError> {
    let signature_len = router
        .remote_signature_len(&confirmed.identity)
        .ok_or_else(|| ProtocolError::HandshakeFailed {
            reason: format!("malformed identity of {} bytes", confirmed.identity.len()),
        })?;
    let signature = confirmed
        .signature(signature_len)
        .ok_or(ProtocolError::InvalidMessageLength {
            expected: signature_len,
            got: confirmed.trailer.len(),
        })?;

    let mut signed = SignedData::new();
    signed
        .insert(x)
        .insert(y)
        .insert_endpoint(&initiator)
        .insert_endpoint(&local)
        .insert_u32(relay_tag)
        .insert_u32(confirmed.signed_on);

    if !signed.verify(router, &confirmed.identity, signature) {
        return Err(ProtocolError::SignatureVerificationFailed);
    }
    Ok(())
}

/// Empty SessionDestroyed datagram under the session keys
pub fn create_session_destroyed(keys: &SessionKeys) -> Result<Vec<u8>, SsuError> {
    Ok(codec::seal_random(
        PayloadType::SessionDestroyed,
        &[],
        keys.packet_keys(),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{Header, Message, HEADER_SIZE};
    use crate::router::{LocalRouter, RouterAddress};

    fn secret_with(prefix: &[u8]) -> [u8; DH_KEY_LEN] {
        let mut secret = [0u8; DH_KEY_LEN];
        for (i, b) in secret.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(7).wrapping_add(3);
        }
        secret[..prefix.len()].copy_from_slice(prefix);
        secret
    }

    #[test]
    fn test_derive_high_bit() {
        let secret = secret_with(&[0x80]);
        let keys = derive_session_keys(&secret).unwrap();

        assert_eq!(keys.session_key[0], 0);
        assert_eq!(keys.session_key[1..], secret[..31]);
        assert_eq!(keys.mac_key[..], secret[31..63]);
    }

    #[test]
    fn test_derive_plain() {
        let secret = secret_with(&[0x7f]);
        let keys = derive_session_keys(&secret).unwrap();

        assert_eq!(keys.session_key[..], secret[..32]);
        assert_eq!(keys.mac_key[..], secret[32..64]);
    }

    #[test]
    fn test_derive_leading_zeros() {
        let secret = secret_with(&[0, 0, 0, 0x05]);
        let keys = derive_session_keys(&secret).unwrap();

        assert_eq!(keys.session_key[..], secret[3..35]);
        let digest: [u8; 32] = Sha256::digest(&secret[3..64]).into();
        assert_eq!(keys.mac_key, digest);
    }

    #[test]
    fn test_derive_last_allowed_offset() {
        let mut prefix = [0u8; 33];
        prefix[32] = 1;
        let secret = secret_with(&prefix);
        let keys = derive_session_keys(&secret).unwrap();
        assert_eq!(keys.session_key[..], secret[32..64]);
    }

    #[test]
    fn test_derive_all_zero_prefix_fails() {
        let secret = secret_with(&[0u8; 33]);
        assert!(matches!(
            derive_session_keys(&secret),
            Err(CryptoError::KeyDerivation)
        ));
    }

    fn open_intro(datagram: &mut Vec<u8>, key: &[u8; KEY_SIZE]) -> (Header, Message) {
        codec::open(datagram, PacketKeys::intro(key)).unwrap();
        let header = Header::from_bytes(datagram).unwrap();
        let message =
            Message::decode(header.payload_type().unwrap(), &datagram[HEADER_SIZE..]).unwrap();
        (header, message)
    }

    #[test]
    fn test_handshake_messages() {
        let responder_endpoint: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let initiator_endpoint: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let intro_key = [0x66u8; KEY_SIZE];
        let responder = LocalRouter::generate(Some(RouterAddress::new(responder_endpoint, intro_key)));
        let initiator = LocalRouter::generate(None);

        // SessionRequest
        let dh_x = DhKeyPair::generate();
        let mut datagram = create_session_request(&dh_x, responder_endpoint, &intro_key).unwrap();
        assert_eq!(datagram.len(), 304);
        let request = match open_intro(&mut datagram, &intro_key).1 {
            Message::SessionRequest(r) => r,
            other => panic!("unexpected {:?}", other.payload_type()),
        };
        assert_eq!(request.address, Some(responder_endpoint.ip()));

        // SessionCreated
        let dh_y = DhKeyPair::generate();
        let responder_keys = derive_session_keys(&dh_y.agree(&request.x).unwrap()).unwrap();
        let mut datagram = create_session_created(
            &responder,
            &request.x,
            &dh_y,
            &responder_keys,
            initiator_endpoint,
            99,
        )
        .unwrap();
        let (header, message) = open_intro(&mut datagram, &intro_key);
        let created = match message {
            Message::SessionCreated(c) => c,
            other => panic!("unexpected {:?}", other.payload_type()),
        };

        let outcome = process_session_created(
            &initiator,
            &dh_x,
            responder_endpoint,
            Some(responder.identity()),
            &header.iv,
            &created,
        )
        .unwrap();
        assert_eq!(outcome.keys, responder_keys);
        assert_eq!(outcome.observed, initiator_endpoint);
        assert_eq!(outcome.relay_tag, 99);
        assert!(outcome.signature_valid);

        // SessionConfirmed
        let mut datagram = create_session_confirmed(
            &initiator,
            dh_x.public_key(),
            &created.y,
            outcome.observed,
            responder_endpoint,
            outcome.relay_tag,
            &outcome.keys,
        )
        .unwrap();
        assert_eq!(datagram.len() % 16, 0);
        codec::open(&mut datagram, responder_keys.packet_keys()).unwrap();
        let confirmed = match Message::decode(PayloadType::SessionConfirmed, &datagram[HEADER_SIZE..]).unwrap() {
            Message::SessionConfirmed(c) => c,
            other => panic!("unexpected {:?}", other.payload_type()),
        };
        assert_eq!(confirmed.identity, initiator.identity());

        verify_session_confirmed(
            &responder,
            &request.x,
            dh_y.public_key(),
            initiator_endpoint,
            responder_endpoint,
            99,
            &confirmed,
        )
        .unwrap();

        // A different relay tag changes the transcript
        assert!(matches!(
            verify_session_confirmed(
                &responder,
                &request.x,
                dh_y.public_key(),
                initiator_endpoint,
                responder_endpoint,
                100,
                &confirmed,
            ),
            Err(ProtocolError::SignatureVerificationFailed)
        ));
    }

    #[test]
    fn test_created_signature_from_wrong_identity() {
        let responder_endpoint: SocketAddr = "127.0.0.1:7100".parse().unwrap();
        let intro_key = [0x12u8; KEY_SIZE];
        let responder = LocalRouter::generate(Some(RouterAddress::new(responder_endpoint, intro_key)));
        let impostor = LocalRouter::generate(None);

        let dh_x = DhKeyPair::generate();
        let dh_y = DhKeyPair::generate();
        let keys = derive_session_keys(&dh_y.agree(dh_x.public_key()).unwrap()).unwrap();
        let mut datagram = create_session_created(
            &responder,
            dh_x.public_key(),
            &dh_y,
            &keys,
            "127.0.0.1:7101".parse().unwrap(),
            0,
        )
        .unwrap();
        let (header, message) = open_intro(&mut datagram, &intro_key);
        let Message::SessionCreated(created) = message else {
            panic!("expected SessionCreated");
        };

        let outcome = process_session_created(
            &impostor,
            &dh_x,
            responder_endpoint,
            Some(impostor.identity()),
            &header.iv,
            &created,
        )
        .unwrap();
        assert!(!outcome.signature_valid);

        let outcome =
            process_session_created(&impostor, &dh_x, responder_endpoint, None, &header.iv, &created)
                .unwrap();
        assert!(!outcome.signature_valid);
        assert_eq!(outcome.keys, keys);
    }

    #[test]
    fn test_session_destroyed_size() {
        let keys = SessionKeys {
            session_key: [1; KEY_SIZE],
            mac_key: [2; KEY_SIZE],
        };
        let datagram = create_session_destroyed(&keys).unwrap();
        assert_eq!(datagram.len(), 48);
        assert!(codec::validate(&datagram, &keys.mac_key));
    }
}
