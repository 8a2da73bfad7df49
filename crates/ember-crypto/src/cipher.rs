//! ChaCha20-Poly1305 message encryption under a session key.
//!
//! Every call draws a fresh 96-bit random nonce. Decryption either returns the
//! full plaintext or [`CryptoError::AuthenticationTag`]; no partial output.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::error::CryptoError;
use crate::rng;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Ciphertext (with its 16-byte tag appended) and the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

pub fn encrypt(plaintext: &[u8], key: &[u8; KEY_LEN]) -> Result<EncryptedMessage, CryptoError> {
    encrypt_with_context(plaintext, key, &[])
}

pub fn decrypt(
    ciphertext: &[u8],
    nonce: &[u8; NONCE_LEN],
    key: &[u8; KEY_LEN],
) -> Result<Vec<u8>, CryptoError> {
    decrypt_with_context(ciphertext, nonce, key, &[])
}

/// Encrypt and bind `associated_data` (see [`associated_data`]) into the tag.
pub fn encrypt_with_context(
    plaintext: &[u8],
    key: &[u8; KEY_LEN],
    associated_data: &[u8],
) -> Result<EncryptedMessage, CryptoError> {
    let nonce: [u8; NONCE_LEN] = rng::random_array()?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(EncryptedMessage { ciphertext, nonce })
}

pub fn decrypt_with_context(
    ciphertext: &[u8],
    nonce: &[u8; NONCE_LEN],
    key: &[u8; KEY_LEN],
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::AuthenticationTag);
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::AuthenticationTag)
}

/// Associated data binding a message to its sender and recipient.
///
/// Each id is length-prefixed so `("ab", "c")` and `("a", "bc")` differ.
pub fn associated_data(sender_id: &str, recipient_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(16 + sender_id.len() + recipient_id.len());
    for id in [sender_id, recipient_id] {
        aad.extend_from_slice(&(id.len() as u64).to_be_bytes());
        aad.extend_from_slice(id.as_bytes());
    }
    aad
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    const ZERO_KEY: [u8; KEY_LEN] = [0u8; KEY_LEN];

    #[test]
    fn hello_with_zero_key() {
        let sealed = encrypt(b"hello", &ZERO_KEY).unwrap();
        assert_eq!(sealed.ciphertext.len(), b"hello".len() + TAG_LEN);

        let opened = decrypt(&sealed.ciphertext, &sealed.nonce, &ZERO_KEY).unwrap();
        assert_eq!(opened, b"hello");
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let sealed = encrypt(b"", &ZERO_KEY).unwrap();
        assert_eq!(sealed.ciphertext.len(), TAG_LEN);
        assert!(decrypt(&sealed.ciphertext, &sealed.nonce, &ZERO_KEY).unwrap().is_empty());
    }

    #[test]
    fn nonces_do_not_repeat_under_one_key() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let sealed = encrypt(b"x", &ZERO_KEY).unwrap();
            assert!(seen.insert(sealed.nonce), "nonce reused");
        }
    }

    #[test]
    fn wrong_key_fails_with_tag_error() {
        let sealed = encrypt(b"secret", &[1u8; KEY_LEN]).unwrap();
        let result = decrypt(&sealed.ciphertext, &sealed.nonce, &[2u8; KEY_LEN]);
        assert!(matches!(result, Err(CryptoError::AuthenticationTag)));
    }

    #[test]
    fn wrong_nonce_fails_with_tag_error() {
        let sealed = encrypt(b"secret", &ZERO_KEY).unwrap();
        let mut nonce = sealed.nonce;
        nonce[0] ^= 0x01;
        let result = decrypt(&sealed.ciphertext, &nonce, &ZERO_KEY);
        assert!(matches!(result, Err(CryptoError::AuthenticationTag)));
    }

    #[test]
    fn truncated_ciphertext_fails_with_tag_error() {
        let result = decrypt(&[0u8; TAG_LEN - 1], &[0u8; NONCE_LEN], &ZERO_KEY);
        assert!(matches!(result, Err(CryptoError::AuthenticationTag)));
    }

    #[test]
    fn context_binds_sender_and_recipient() {
        let key = [7u8; KEY_LEN];
        let aad = associated_data("alice", "bob");
        let sealed = encrypt_with_context(b"for bob", &key, &aad).unwrap();

        let opened = decrypt_with_context(&sealed.ciphertext, &sealed.nonce, &key, &aad).unwrap();
        assert_eq!(opened, b"for bob");

        let replayed = associated_data("alice", "carol");
        let result = decrypt_with_context(&sealed.ciphertext, &sealed.nonce, &key, &replayed);
        assert!(matches!(result, Err(CryptoError::AuthenticationTag)));

        // Context-bound ciphertext does not open without its context either.
        assert!(decrypt(&sealed.ciphertext, &sealed.nonce, &key).is_err());
    }

    #[test]
    fn associated_data_is_unambiguous() {
        assert_ne!(associated_data("ab", "c"), associated_data("a", "bc"));
    }
}
