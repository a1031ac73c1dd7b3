//! Datagram sealing and opening
//!
//! The MAC covers the encrypted region followed by the IV and the 2-byte
//! big-endian length of the encrypted region:
//!
//! ```text
//! HMAC-MD5(mac_key, encrypted | iv | len(encrypted))
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use rand::{rngs::OsRng, RngCore};

use crate::crypto::{cbc, mac};
use crate::error::{CryptoError, ProtocolError};
use crate::protocol::messages::{
    PayloadType, ENCRYPTED_OFFSET, HEADER_SIZE, IV_SIZE, KEY_SIZE,
};

/// Cipher and MAC key pair used to seal or open one datagram
#[derive(Debug, Clone, Copy)]
pub struct PacketKeys<'a> {
    pub aes: &'a [u8; KEY_SIZE],
    pub mac: &'a [u8; KEY_SIZE],
}

impl<'a> PacketKeys<'a> {
    /// Handshake-phase datagrams use an intro key for both roles
    pub fn intro(key: &'a [u8; KEY_SIZE]) -> Self {
        Self { aes: key, mac: key }
    }
}

/// Current time in seconds, as carried in headers and handshake signatures
pub fn timestamp_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Fresh random IV
pub fn random_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

fn iv_of(datagram: &[u8]) -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&datagram[..IV_SIZE]);
    iv
}

fn region_len(datagram: &[u8]) -> [u8; 2] {
    ((datagram.len() - ENCRYPTED_OFFSET) as u16).to_be_bytes()
}

/// Build a complete datagram: header, body, zero padding to the block size.
///
/// The region from the flags byte onward is encrypted under `keys.aes` with
/// `iv`, then the tag is computed with `keys.mac`.
pub fn seal(
    payload_type: PayloadType,
    body: &[u8],
    keys: PacketKeys<'_>,
    iv: &[u8; IV_SIZE],
) -> Result<Vec<u8>, CryptoError> {
    let encrypted_len = cbc::padded_len(HEADER_SIZE - ENCRYPTED_OFFSET + body.len());
    let mut datagram = vec![0u8; ENCRYPTED_OFFSET + encrypted_len];

    datagram[..IV_SIZE].copy_from_slice(iv);
    datagram[ENCRYPTED_OFFSET] = (payload_type as u8) << 4;
    datagram[ENCRYPTED_OFFSET + 1..HEADER_SIZE].copy_from_slice(&timestamp_now().to_be_bytes());
    datagram[HEADER_SIZE..HEADER_SIZE + body.len()].copy_from_slice(body);

    cbc::encrypt(keys.aes, iv, &mut datagram[ENCRYPTED_OFFSET..])?;

    let len = region_len(&datagram);
    let tag = mac::compute(keys.mac, &[&datagram[ENCRYPTED_OFFSET..], iv, &len]);
    datagram[IV_SIZE..ENCRYPTED_OFFSET].copy_from_slice(&tag);

    Ok(datagram)
}

/// Seal with a fresh random IV
pub fn seal_random(
    payload_type: PayloadType,
    body: &[u8],
    keys: PacketKeys<'_>,
) -> Result<Vec<u8>, CryptoError> {
    seal(payload_type, body, keys, &random_iv())
}

/// Check the datagram's tag against `mac_key`
pub fn validate(datagram: &[u8], mac_key: &[u8; KEY_SIZE]) -> bool {
    if datagram.len() < HEADER_SIZE {
        return false;
    }

    let iv = &datagram[..IV_SIZE];
    let tag = &datagram[IV_SIZE..ENCRYPTED_OFFSET];
    let len = region_len(datagram);
    mac::verify(mac_key, &[&datagram[ENCRYPTED_OFFSET..], iv, &len], tag)
}

/// Decrypt the region from the flags byte onward, in place
pub fn decrypt(datagram: &mut [u8], aes_key: &[u8; KEY_SIZE]) -> Result<(), ProtocolError> {
    if datagram.len() < HEADER_SIZE {
        return Err(ProtocolError::InvalidMessageLength {
            expected: HEADER_SIZE,
            got: datagram.len(),
        });
    }

    let len = datagram.len();
    let iv = iv_of(datagram);
    cbc::decrypt(aes_key, &iv, &mut datagram[ENCRYPTED_OFFSET..]).map_err(|_| {
        ProtocolError::InvalidMessageLength {
            expected: cbc::padded_len(len - ENCRYPTED_OFFSET) + ENCRYPTED_OFFSET,
            got: len,
        }
    })
}

/// Validate with `keys.mac` and decrypt with `keys.aes`.
///
/// Returns `MacVerificationFailed` without touching the buffer if the tag
/// does not match.
pub fn open(datagram: &mut [u8], keys: PacketKeys<'_>) -> Result<(), ProtocolError> {
    if !validate(datagram, keys.mac) {
        return Err(ProtocolError::MacVerificationFailed);
    }
    decrypt(datagram, keys.aes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::Header;

    const AES_KEY: [u8; KEY_SIZE] = [0x21; KEY_SIZE];
    const MAC_KEY: [u8; KEY_SIZE] = [0x43; KEY_SIZE];

    fn keys() -> PacketKeys<'static> {
        PacketKeys {
            aes: &AES_KEY,
            mac: &MAC_KEY,
        }
    }

    #[test]
    fn test_seal_open() {
        let body = b"opaque delivery payload";
        let mut datagram = seal_random(PayloadType::Data, body, keys()).unwrap();
        assert_eq!((datagram.len() - ENCRYPTED_OFFSET) % 16, 0);

        open(&mut datagram, keys()).unwrap();
        let header = Header::from_bytes(&datagram).unwrap();
        assert_eq!(header.payload_type().unwrap(), PayloadType::Data);
        assert!(header.timestamp.abs_diff(timestamp_now()) <= 1);
        assert_eq!(&datagram[HEADER_SIZE..HEADER_SIZE + body.len()], body);
    }

    #[test]
    fn test_validate_is_repeatable() {
        let datagram = seal_random(PayloadType::PeerTest, &[1, 2, 3], keys()).unwrap();
        assert!(validate(&datagram, &MAC_KEY));
        assert!(validate(&datagram, &MAC_KEY));
        assert!(!validate(&datagram, &AES_KEY));
    }

    #[test]
    fn test_fresh_iv_per_datagram() {
        let a = seal_random(PayloadType::Data, &[0u8; 10], keys()).unwrap();
        let b = seal_random(PayloadType::Data, &[0u8; 10], keys()).unwrap();
        assert_ne!(a[..IV_SIZE], b[..IV_SIZE]);
        assert_ne!(a[ENCRYPTED_OFFSET..], b[ENCRYPTED_OFFSET..]);
    }

    #[test]
    fn test_empty_body_is_one_block() {
        let datagram = seal_random(PayloadType::SessionDestroyed, &[], keys()).unwrap();
        assert_eq!(datagram.len(), 48);
    }

    #[test]
    fn test_tampering_detected() {
        let datagram = seal_random(PayloadType::Data, b"payload", keys()).unwrap();

        let mut flipped_ciphertext = datagram.clone();
        flipped_ciphertext[HEADER_SIZE] ^= 0x01;
        assert!(!validate(&flipped_ciphertext, &MAC_KEY));

        let mut flipped_mac = datagram.clone();
        flipped_mac[IV_SIZE] ^= 0x80;
        assert!(!validate(&flipped_mac, &MAC_KEY));

        let mut flipped_iv = datagram;
        flipped_iv[0] ^= 0x02;
        assert!(matches!(
            open(&mut flipped_iv, keys()),
            Err(ProtocolError::MacVerificationFailed)
        ));
    }

    #[test]
    fn test_short_datagram_never_validates() {
        assert!(!validate(&[0u8; HEADER_SIZE - 1], &MAC_KEY));
        assert!(decrypt(&mut [0u8; 10], &AES_KEY).is_err());
    }
}
