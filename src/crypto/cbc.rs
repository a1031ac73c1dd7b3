//! AES-256-CBC for SSU datagrams
//!
//! SSU never pads at the cipher level: every caller hands in a buffer whose
//! length is already a multiple of the block size, and the buffer is
//! transformed in place.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::error::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block length
pub const BLOCK_LEN: usize = 16;

/// AES-256 key length
pub const KEY_LEN: usize = 32;

/// CBC initialization vector length
pub const IV_LEN: usize = 16;

/// Round `len` up to the next multiple of the block length
pub fn padded_len(len: usize) -> usize {
    (len + BLOCK_LEN - 1) / BLOCK_LEN * BLOCK_LEN
}

/// Encrypt `buf` in place
pub fn encrypt(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN], buf: &mut [u8]) -> Result<(), CryptoError> {
    let len = buf.len();
    Aes256CbcEnc::new(&(*key).into(), &(*iv).into())
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| CryptoError::Encryption)?;
    Ok(())
}

/// Decrypt `buf` in place
pub fn decrypt(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN], buf: &mut [u8]) -> Result<(), CryptoError> {
    Aes256CbcDec::new(&(*key).into(), &(*iv).into())
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| CryptoError::Decryption)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_in_place() {
        let key = [7u8; KEY_LEN];
        let iv = [9u8; IV_LEN];
        let plaintext = *b"thirty-two bytes of ssu payload!";

        let mut buf = plaintext;
        encrypt(&key, &iv, &mut buf).unwrap();
        assert_ne!(buf, plaintext);

        decrypt(&key, &iv, &mut buf).unwrap();
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn test_iv_changes_ciphertext() {
        let key = [1u8; KEY_LEN];
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];

        encrypt(&key, &[0u8; IV_LEN], &mut a).unwrap();
        encrypt(&key, &[1u8; IV_LEN], &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_unaligned_buffer_rejected() {
        let key = [1u8; KEY_LEN];
        let iv = [0u8; IV_LEN];
        let mut buf = [0u8; 20];

        assert!(encrypt(&key, &iv, &mut buf).is_err());
        assert!(decrypt(&key, &iv, &mut buf).is_err());
    }

    #[test]
    fn test_padded_len() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 16);
        assert_eq!(padded_len(16), 16);
        assert_eq!(padded_len(266), 272);
    }
}
