// SPDX-License-Identifier: MIT OR Apache-2.0

//! Elliptic-curve Diffie-Hellman key pairs over Curve25519.
use std::fmt;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;
use x25519_dalek::StaticSecret;

use crate::crypto::{Rng, RngError, Secret};
use crate::encoding::{self, EncodingError};

pub const SECRET_KEY_SIZE: usize = 32;

pub const PUBLIC_KEY_SIZE: usize = 32;

pub const SHARED_SECRET_SIZE: usize = 32;

/// X25519 secret key.
///
/// Used for identity keys of users and as the conversation secret itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey(Secret<SECRET_KEY_SIZE>);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(Secret::from_bytes(bytes))
    }

    /// Generates a new secret key from the random-number generator.
    pub fn from_rng(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self::from_bytes(rng.random_array()?))
    }

    /// Parses a secret key from its base64 representation.
    pub fn from_base64(value: &str) -> Result<Self, EncodingError> {
        Ok(Self::from_bytes(encoding::from_base64_array(value)?))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        self.0.as_bytes()
    }

    /// Encodes the raw key bytes in base64.
    ///
    /// Handle with care, this is only meant for handing keys to local, on-device storage.
    pub fn to_base64(&self) -> String {
        encoding::to_base64(self.as_bytes())
    }

    /// Derives the public counterpart of this secret key.
    pub fn public_key(&self) -> PublicKey {
        let static_secret = StaticSecret::from(*self.as_bytes());
        let public_key = x25519_dalek::PublicKey::from(&static_secret);
        PublicKey(public_key.to_bytes())
    }

    /// Computes the Diffie-Hellman shared secret with the other party's public key.
    ///
    /// Returns an error if the result is all-zero, which indicates a low-order public key.
    pub fn calculate_agreement(
        &self,
        their_public_key: &PublicKey,
    ) -> Result<Secret<SHARED_SECRET_SIZE>, X25519Error> {
        let static_secret = StaticSecret::from(*self.as_bytes());
        let shared = static_secret.diffie_hellman(&x25519_dalek::PublicKey::from(
            their_public_key.to_bytes(),
        ));
        if bool::from(shared.as_bytes().ct_eq(&[0u8; SHARED_SECRET_SIZE])) {
            return Err(X25519Error::InvalidPublicKey);
        }
        Ok(Secret::from_bytes(shared.to_bytes()))
    }
}

/// X25519 public key.
///
/// Serializes as a base64 string so it can travel through JSON transports unmodified.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_base64(value: &str) -> Result<Self, EncodingError> {
        Ok(Self(encoding::from_base64_array(value)?))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0
    }

    pub fn to_base64(&self) -> String {
        encoding::to_base64(&self.0)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_hex()).finish()
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        PublicKey::from_base64(&value).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error)]
pub enum X25519Error {
    #[error("public key is of low order and can not be used for key agreement")]
    InvalidPublicKey,
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::{PublicKey, SecretKey, X25519Error};

    #[test]
    fn diffie_hellman() {
        let rng = Rng::from_seed([1; 32]);

        let alice_secret = SecretKey::from_rng(&rng).unwrap();
        let bob_secret = SecretKey::from_rng(&rng).unwrap();

        let alice_shared = alice_secret
            .calculate_agreement(&bob_secret.public_key())
            .unwrap();
        let bob_shared = bob_secret
            .calculate_agreement(&alice_secret.public_key())
            .unwrap();

        assert_eq!(alice_shared, bob_shared);
    }

    #[test]
    fn reject_low_order_keys() {
        let rng = Rng::from_seed([1; 32]);
        let secret = SecretKey::from_rng(&rng).unwrap();

        assert!(matches!(
            secret.calculate_agreement(&PublicKey::from_bytes([0; 32])),
            Err(X25519Error::InvalidPublicKey)
        ));
    }

    #[test]
    fn base64_representation() {
        let rng = Rng::from_seed([1; 32]);
        let secret = SecretKey::from_rng(&rng).unwrap();
        let public_key = secret.public_key();

        assert_eq!(
            PublicKey::from_base64(&public_key.to_base64()).unwrap(),
            public_key
        );
        assert_eq!(SecretKey::from_base64(&secret.to_base64()).unwrap(), secret);

        let json = serde_json::to_string(&public_key).unwrap();
        assert_eq!(json, format!("\"{}\"", public_key.to_base64()));
        assert_eq!(
            serde_json::from_str::<PublicKey>(&json).unwrap(),
            public_key
        );
    }
}
