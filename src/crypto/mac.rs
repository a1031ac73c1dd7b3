//! HMAC-MD5 datagram authentication
//!
//! SSU authenticates every datagram with a 16-byte HMAC-MD5 tag keyed by a
//! 32-byte MAC key (the session MAC key, or an intro key during handshakes).

use hmac::{Hmac, Mac};
use md5::Md5;

type HmacMd5 = Hmac<Md5>;

/// HMAC-MD5 tag length
pub const TAG_LEN: usize = 16;

/// MAC key length
pub const KEY_LEN: usize = 32;

fn keyed(key: &[u8; KEY_LEN], parts: &[&[u8]]) -> HmacMd5 {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac
}

/// Compute the tag over the concatenation of `parts`
pub fn compute(key: &[u8; KEY_LEN], parts: &[&[u8]]) -> [u8; TAG_LEN] {
    keyed(key, parts).finalize().into_bytes().into()
}

/// Check `tag` against the concatenation of `parts` in constant time
pub fn verify(key: &[u8; KEY_LEN], parts: &[&[u8]], tag: &[u8]) -> bool {
    keyed(key, parts).verify_slice(tag).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc2202_vector_with_padded_key() {
        // RFC 2202 test case 2 uses the 4-byte key "Jefe"; HMAC zero-pads
        // short keys, so the same key padded to 32 bytes gives the same tag.
        let mut key = [0u8; KEY_LEN];
        key[..4].copy_from_slice(b"Jefe");

        let tag = compute(&key, &[b"what do ya want ", b"for nothing?"]);
        assert_eq!(hex::encode(tag), "750c783e6ab0b503eaa86e310a5db738");
    }

    #[test]
    fn test_verify() {
        let key = [3u8; KEY_LEN];
        let tag = compute(&key, &[b"abc", b"def"]);

        assert!(verify(&key, &[b"abcdef"], &tag));
        assert!(!verify(&key, &[b"abcdeg"], &tag));
        assert!(!verify(&[4u8; KEY_LEN], &[b"abcdef"], &tag));
    }
}
