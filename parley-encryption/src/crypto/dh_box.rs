// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authenticated public-key encryption ("box") and its precomputed, symmetric form.
//!
//! A box between a secret key `a` and a public key `B` is encrypted with a symmetric key derived
//! from the X25519 agreement `DH(a, B)` through HKDF-SHA256. As `DH(a, B) == DH(b, A)` the
//! receiver opens it with their own secret key and the sender's public key. Successfully opening a
//! box therefore authenticates that it was sealed by the holder of the sender's secret key (or by
//! the receiver themselves).
//!
//! Callers which encrypt many payloads between the same two keys can [precompute](SharedKey::precompute)
//! the symmetric key once and use [`seal_after`] and [`open_after`].
//!
//! ## Wire format
//!
//! Every call draws a fresh random 24-byte nonce which is prepended to the AEAD output:
//!
//! ```text
//! nonce (24 bytes) || ciphertext || tag (16 bytes)
//! ```
//!
//! Collaborators carry this as one base64 string, see [`Ciphertext::to_base64`].
use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

use crate::crypto::x25519::{PublicKey, SecretKey, X25519Error};
use crate::crypto::xchacha20::{
    XAEAD_KEY_SIZE, XAEAD_NONCE_SIZE, XAEAD_TAG_SIZE, XAeadError, XAeadNonce, x_aead_decrypt,
    x_aead_encrypt,
};
use crate::crypto::{Rng, RngError, Secret};
use crate::encoding::{self, EncodingError};

/// Domain separation for keys derived from X25519 agreements.
const BOX_KDF_INFO: &[u8] = b"parley-encryption box v1";

/// Symmetric key established between two X25519 key pairs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedKey(Secret<XAEAD_KEY_SIZE>);

impl SharedKey {
    /// Derives the shared key between our secret key and their public key.
    pub fn precompute(secret: &SecretKey, their_public_key: &PublicKey) -> Result<Self, BoxError> {
        let agreement = secret.calculate_agreement(their_public_key)?;
        let hkdf = Hkdf::<Sha256>::new(None, agreement.as_bytes());
        let mut okm = [0u8; XAEAD_KEY_SIZE];
        hkdf.expand(BOX_KDF_INFO, &mut okm)
            .map_err(|_| BoxError::KeyDerivation)?;
        Ok(Self(Secret::from_bytes(okm)))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; XAEAD_KEY_SIZE] {
        self.0.as_bytes()
    }
}

/// Sealed payload: random nonce followed by the authenticated ciphertext.
#[derive(Clone, PartialEq, Eq)]
pub struct Ciphertext(Vec<u8>);

impl Ciphertext {
    /// Smallest valid ciphertext (empty plaintext).
    pub const MIN_SIZE: usize = XAEAD_NONCE_SIZE + XAEAD_TAG_SIZE;

    /// Parses raw bytes, rejecting values which can not even hold a nonce and tag.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, BoxError> {
        if bytes.len() < Self::MIN_SIZE {
            return Err(BoxError::DecryptionFailed);
        }
        Ok(Self(bytes))
    }

    pub fn from_base64(value: &str) -> Result<Self, BoxError> {
        Self::from_bytes(encoding::from_base64(value)?)
    }

    pub(crate) fn from_parts(nonce: XAeadNonce, sealed: Vec<u8>) -> Self {
        let mut bytes = Vec::with_capacity(XAEAD_NONCE_SIZE + sealed.len());
        bytes.extend_from_slice(&nonce);
        bytes.extend(sealed);
        Self(bytes)
    }

    pub fn nonce(&self) -> XAeadNonce {
        let mut nonce = [0u8; XAEAD_NONCE_SIZE];
        nonce.copy_from_slice(&self.0[..XAEAD_NONCE_SIZE]);
        nonce
    }

    pub(crate) fn sealed(&self) -> &[u8] {
        &self.0[XAEAD_NONCE_SIZE..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        encoding::to_base64(&self.0)
    }
}

impl fmt::Debug for Ciphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ciphertext")
            .field("len", &self.0.len())
            .finish()
    }
}

/// Seals `plaintext` towards `recipient_public_key`, authenticated by our `secret`.
pub fn seal(
    secret: &SecretKey,
    plaintext: &[u8],
    recipient_public_key: &PublicKey,
    rng: &Rng,
) -> Result<Ciphertext, BoxError> {
    let shared = SharedKey::precompute(secret, recipient_public_key)?;
    seal_after(&shared, plaintext, rng)
}

/// Opens a box sealed by the holder of `sender_public_key` towards our `secret`.
pub fn open(
    secret: &SecretKey,
    ciphertext: &Ciphertext,
    sender_public_key: &PublicKey,
) -> Result<Vec<u8>, BoxError> {
    let shared =
        SharedKey::precompute(secret, sender_public_key).map_err(|_| BoxError::DecryptionFailed)?;
    open_after(&shared, ciphertext)
}

/// Seals `plaintext` with an already established shared key.
pub fn seal_after(
    shared: &SharedKey,
    plaintext: &[u8],
    rng: &Rng,
) -> Result<Ciphertext, BoxError> {
    let nonce: XAeadNonce = rng.random_array()?;
    let sealed = x_aead_encrypt(shared.as_bytes(), plaintext, nonce, None)?;
    Ok(Ciphertext::from_parts(nonce, sealed))
}

/// Opens a box with an already established shared key.
pub fn open_after(shared: &SharedKey, ciphertext: &Ciphertext) -> Result<Vec<u8>, BoxError> {
    x_aead_decrypt(
        shared.as_bytes(),
        ciphertext.sealed(),
        ciphertext.nonce(),
        None,
    )
    .map_err(|_| BoxError::DecryptionFailed)
}

#[derive(Debug, Error)]
pub enum BoxError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error(transparent)]
    XAead(#[from] XAeadError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("could not derive symmetric key from key agreement")]
    KeyDerivation,

    /// Wrong key, corrupted ciphertext or a payload from a superseded epoch.
    #[error("ciphertext could not be authenticated or decrypted")]
    DecryptionFailed,
}
