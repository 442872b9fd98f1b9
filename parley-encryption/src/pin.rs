// SPDX-License-Identifier: MIT OR Apache-2.0

//! PIN-derived wrapping of all key material of a user.
//!
//! The key set of a user (identity secret and the conversation secrets they hold) leaves the
//! device only in its wrapped form, a [`WrappedKeyBundle`]. The bundle is stored on-device and
//! mirrored to the server, which can not open it.
//!
//! ## Key derivation
//!
//! A 32-byte wrapping key is derived from the PIN and a random per-user [`Salt`] with Argon2id.
//! The salt is generated once at first setup and only replaced when the user explicitly resets
//! their PIN, see [`PinWrapper::reset`].
//!
//! ## Wrapping
//!
//! The CBOR-encoded [`KeySet`] is encrypted with XChaCha20-Poly1305 under the wrapping key, with a
//! fresh random nonce for every wrap and the salt as associated data:
//!
//! ```text
//! encryptedKeySet = base64(nonce (24 bytes) || ciphertext || tag)
//! ```
//!
//! A wrong PIN derives another wrapping key and authentication fails. This is reported as
//! [`PinError::InvalidPin`], without revealing whether the PIN or the salt did not match.
use std::collections::BTreeMap;
use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::cbor::{EncodeError, decode_cbor, encode_cbor};
use crate::config::Config;
use crate::conversation_secret::ConversationId;
use crate::crypto::dh_box::Ciphertext;
use crate::crypto::x25519::SecretKey;
use crate::crypto::xchacha20::{XAEAD_KEY_SIZE, XAeadError, x_aead_decrypt, x_aead_encrypt};
use crate::crypto::{Rng, RngError, Secret};
use crate::encoding::{self, EncodingError};

pub const SALT_SIZE: usize = 16;

/// Numeric PIN entered by the user.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Pin(String);

impl Pin {
    /// Validates that the PIN consists of exactly the configured number of ASCII digits.
    pub fn new(value: &str, config: &Config) -> Result<Self, PinError> {
        if value.len() != config.pin_length() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PinError::InvalidFormat(config.pin_length()));
        }
        Ok(Self(value.to_string()))
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pin").field(&"***").finish()
    }
}

/// Random per-user salt for the PIN key derivation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Salt([u8; SALT_SIZE]);

impl Salt {
    pub fn generate(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self(rng.random_array()?))
    }

    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_base64(value: &str) -> Result<Self, EncodingError> {
        Ok(Self(encoding::from_base64_array(value)?))
    }

    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        encoding::to_base64(&self.0)
    }
}

impl Serialize for Salt {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Salt {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Salt::from_base64(&value).map_err(serde::de::Error::custom)
    }
}

/// Symmetric key derived from PIN and salt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrappingKey(Secret<XAEAD_KEY_SIZE>);

impl WrappingKey {
    /// Runs Argon2id with the cost parameters of the given configuration.
    pub fn derive(pin: &Pin, salt: &Salt, config: &Config) -> Result<Self, PinError> {
        let params = Params::new(
            config.kdf_memory_kib,
            config.kdf_iterations,
            config.kdf_parallelism,
            Some(XAEAD_KEY_SIZE),
        )
        .map_err(PinError::Kdf)?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut okm = Zeroizing::new([0u8; XAEAD_KEY_SIZE]);
        argon2
            .hash_password_into(pin.as_bytes(), salt.as_bytes(), &mut *okm)
            .map_err(PinError::Kdf)?;
        Ok(Self(Secret::from_bytes(*okm)))
    }

    fn as_bytes(&self) -> &[u8; XAEAD_KEY_SIZE] {
        self.0.as_bytes()
    }
}

/// All key material of a user which can be backed up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySet {
    pub identity_secret: SecretKey,
    #[serde(default)]
    pub conversations: BTreeMap<ConversationId, SecretKey>,
}

impl KeySet {
    pub fn new(identity_secret: SecretKey) -> Self {
        Self {
            identity_secret,
            conversations: BTreeMap::new(),
        }
    }
}

/// Key set encrypted under a PIN-derived wrapping key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKeyBundle {
    pub encrypted_key_set: String,
    pub salt: Salt,
}

/// Encrypts a key set with a fresh random nonce, binding it to the salt.
pub fn wrap_key_set(
    wrapping_key: &WrappingKey,
    salt: &Salt,
    key_set: &KeySet,
    rng: &Rng,
) -> Result<WrappedKeyBundle, PinError> {
    let payload = Zeroizing::new(encode_cbor(key_set)?);
    let nonce = rng.random_array()?;
    let sealed = x_aead_encrypt(
        wrapping_key.as_bytes(),
        &payload,
        nonce,
        Some(salt.as_bytes()),
    )?;
    Ok(WrappedKeyBundle {
        encrypted_key_set: Ciphertext::from_parts(nonce, sealed).to_base64(),
        salt: *salt,
    })
}

/// Decrypts a wrapped key set.
///
/// Fails with [`PinError::InvalidPin`] if the wrapping key was derived from another PIN or if the
/// bundle was wrapped under another salt than the given one.
pub fn unwrap_key_set(
    wrapping_key: &WrappingKey,
    salt: &Salt,
    bundle: &WrappedKeyBundle,
) -> Result<KeySet, PinError> {
    let ciphertext = Ciphertext::from_base64(&bundle.encrypted_key_set)
        .map_err(|_| PinError::MalformedBundle)?;
    let payload = Zeroizing::new(
        x_aead_decrypt(
            wrapping_key.as_bytes(),
            ciphertext.sealed(),
            ciphertext.nonce(),
            Some(salt.as_bytes()),
        )
        .map_err(|_| PinError::InvalidPin)?,
    );
    decode_cbor(&payload[..]).map_err(|_| PinError::MalformedBundle)
}

/// Outcome of an explicit PIN reset.
#[derive(Clone, Debug)]
pub struct PinReset {
    /// New bundle, wrapped under a new salt. Supersedes every previous backup.
    pub bundle: WrappedKeyBundle,

    /// Conversations whose secrets need to be rotated and re-shared.
    pub rotate: Vec<ConversationId>,
}

/// Lifecycle of the PIN-wrapped key bundle.
#[derive(Debug)]
pub struct PinWrapper;

impl PinWrapper {
    /// First-time setup: generates the salt of this user and wraps their key set.
    pub fn setup(
        pin: &Pin,
        key_set: &KeySet,
        config: &Config,
        rng: &Rng,
    ) -> Result<WrappedKeyBundle, PinError> {
        let salt = Salt::generate(rng)?;
        let wrapping_key = WrappingKey::derive(pin, &salt, config)?;
        let bundle = wrap_key_set(&wrapping_key, &salt, key_set, rng)?;
        debug!(
            conversations = key_set.conversations.len(),
            "set up pin-wrapped key bundle"
        );
        Ok(bundle)
    }

    /// Restores the key set from a bundle, for example on a new device.
    pub fn recover(
        pin: &Pin,
        bundle: &WrappedKeyBundle,
        config: &Config,
    ) -> Result<KeySet, PinError> {
        let wrapping_key = WrappingKey::derive(pin, &bundle.salt, config)?;
        unwrap_key_set(&wrapping_key, &bundle.salt, bundle)
    }

    /// Wraps an updated key set under the existing salt.
    ///
    /// The PIN is checked against the current bundle first, a wrong PIN never replaces a backup.
    pub fn rewrap(
        pin: &Pin,
        bundle: &WrappedKeyBundle,
        key_set: &KeySet,
        config: &Config,
        rng: &Rng,
    ) -> Result<WrappedKeyBundle, PinError> {
        let wrapping_key = WrappingKey::derive(pin, &bundle.salt, config)?;
        unwrap_key_set(&wrapping_key, &bundle.salt, bundle)?;
        wrap_key_set(&wrapping_key, &bundle.salt, key_set, rng)
    }

    /// Resets the PIN with a new salt.
    ///
    /// All previously wrapped bundles become useless. As they might have leaked together with the
    /// old PIN, every conversation secret of the key set has to be rotated by the caller.
    pub fn reset(
        new_pin: &Pin,
        key_set: &KeySet,
        config: &Config,
        rng: &Rng,
    ) -> Result<PinReset, PinError> {
        let bundle = Self::setup(new_pin, key_set, config, rng)?;
        let rotate: Vec<ConversationId> = key_set.conversations.keys().cloned().collect();
        debug!(conversations = rotate.len(), "reset pin");
        Ok(PinReset { bundle, rotate })
    }
}

#[derive(Debug, Error)]
pub enum PinError {
    #[error("pin must consist of exactly {0} digits")]
    InvalidFormat(usize),

    #[error("invalid pin")]
    InvalidPin,

    #[error("wrapped key bundle is malformed")]
    MalformedBundle,

    #[error("key derivation failed: {0}")]
    Kdf(argon2::Error),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    XAead(#[from] XAeadError),
}
