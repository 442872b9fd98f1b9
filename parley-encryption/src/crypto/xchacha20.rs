// SPDX-License-Identifier: MIT OR Apache-2.0

//! XChaCha20-Poly1305 authenticated encryption with 192-bit nonces.
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use thiserror::Error;

pub const XAEAD_KEY_SIZE: usize = 32;

pub const XAEAD_NONCE_SIZE: usize = 24;

/// Authentication tag appended by Poly1305.
pub const XAEAD_TAG_SIZE: usize = 16;

pub type XAeadKey = [u8; XAEAD_KEY_SIZE];

pub type XAeadNonce = [u8; XAEAD_NONCE_SIZE];

/// Encrypts and authenticates `plaintext` and optional associated data.
pub fn x_aead_encrypt(
    key: &XAeadKey,
    plaintext: &[u8],
    nonce: XAeadNonce,
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, XAeadError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let payload = Payload {
        msg: plaintext,
        aad: aad.unwrap_or_default(),
    };
    cipher
        .encrypt(XNonce::from_slice(&nonce), payload)
        .map_err(|_| XAeadError::Encrypt)
}

/// Verifies and decrypts `ciphertext`; fails when key, nonce, associated data or ciphertext do
/// not match.
pub fn x_aead_decrypt(
    key: &XAeadKey,
    ciphertext: &[u8],
    nonce: XAeadNonce,
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, XAeadError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let payload = Payload {
        msg: ciphertext,
        aad: aad.unwrap_or_default(),
    };
    cipher
        .decrypt(XNonce::from_slice(&nonce), payload)
        .map_err(|_| XAeadError::Decrypt)
}

#[derive(Debug, Error)]
pub enum XAeadError {
    #[error("plaintext could not be encrypted")]
    Encrypt,

    #[error("ciphertext could not be authenticated or decrypted")]
    Decrypt,
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::{XAEAD_TAG_SIZE, XAeadError, XAeadNonce, x_aead_decrypt, x_aead_encrypt};

    #[test]
    fn encrypt_decrypt() {
        let rng = Rng::from_seed([1; 32]);
        let key = rng.random_array().unwrap();
        let nonce: XAeadNonce = rng.random_array().unwrap();

        let ciphertext = x_aead_encrypt(&key, b"Hello, Parley!", nonce, None).unwrap();
        assert_eq!(ciphertext.len(), b"Hello, Parley!".len() + XAEAD_TAG_SIZE);

        let plaintext = x_aead_decrypt(&key, &ciphertext, nonce, None).unwrap();
        assert_eq!(plaintext, b"Hello, Parley!");
    }

    #[test]
    fn associated_data_is_authenticated() {
        let rng = Rng::from_seed([1; 32]);
        let key = rng.random_array().unwrap();
        let nonce: XAeadNonce = rng.random_array().unwrap();

        let ciphertext = x_aead_encrypt(&key, b"secret", nonce, Some(b"salt-1")).unwrap();
        assert!(matches!(
            x_aead_decrypt(&key, &ciphertext, nonce, Some(b"salt-2")),
            Err(XAeadError::Decrypt)
        ));
        assert!(matches!(
            x_aead_decrypt(&key, &ciphertext, nonce, None),
            Err(XAeadError::Decrypt)
        ));
    }
}
