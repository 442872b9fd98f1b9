// SPDX-License-Identifier: MIT OR Apache-2.0

//! `parley-encryption` is the end-to-end encryption core of multi-party conversations. It manages
//! identity keys, distributes per-conversation secrets, encrypts message payloads, backs up key
//! material under a user PIN and rotates conversation secrets including their history.
//!
//! The crate is a library without any network or storage surface of its own. Messages and
//! distribution maps are relayed by an application-provided [`Transport`](traits::Transport),
//! keys are persisted through a [`KeyStoreBackend`](traits::KeyStoreBackend).
//!
//! ## Conversation secrets
//!
//! Every conversation epoch has one secret, an X25519 key pair. The secret half encrypts all
//! message payloads of the epoch (XChaCha20-Poly1305 with a key derived through HKDF-SHA256), the
//! public half, the "conversation public key", authenticates them. When a conversation is created
//! the [`Distributor`] seals the secret individually towards each participant's identity key.
//! Participants who have not set up encryption yet are skipped, encryption is offered but never
//! forced on a conversation.
//!
//! ## Messages
//!
//! Only the mutable part of a [`Message`] (content, media and object reference) is encrypted,
//! metadata like sender, timestamp or likes stays readable for the relay. Conversations can mix
//! plaintext and encrypted messages. Messages which can not be decrypted, for example because
//! they belong to a superseded epoch, are rendered with the neutral [`UNABLE_TO_DECRYPT`]
//! placeholder instead of failing the conversation.
//!
//! ## Backups
//!
//! Key material never leaves the device in cleartext. For recovery on a new device the whole
//! [`KeySet`] of a user is wrapped with a key derived from their PIN (Argon2id) and a per-user
//! salt. A wrong PIN fails with [`PinError::InvalidPin`], never with corrupted key material.
//!
//! ## Rotation
//!
//! Removing a participant rotates the conversation secret: the [`RotationEngine`] fetches the
//! encrypted history, re-encrypts it under a fresh secret, distributes the new secret to the
//! remaining participants and publishes everything as one update. If anything fails before the
//! update was accepted, the previous secret is re-announced and the caller receives
//! [`RotationError::Aborted`].
//!
//! ## Security
//!
//! Encryption helps to prevent your data being readable by third parties but it can never
//! guarantee full security. Conversation secrets are shared by all participants of an epoch, this
//! scheme does not offer forward secrecy for messages within an epoch. Message metadata is not
//! encrypted.
pub mod account;
mod cbor;
pub mod config;
pub mod conversation_secret;
pub mod crypto;
mod encoding;
pub mod identity;
pub mod key_store;
pub mod message;
pub mod pin;
pub mod rotation;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
#[cfg(test)]
mod tests;
pub mod traits;

pub use account::{Account, AccountError};
pub use cbor::{DecodeError, EncodeError};
pub use config::Config;
pub use conversation_secret::{
    ConversationId, ConversationKeys, ConversationSecret, Distribution, Distributor,
    DistributorError, Recipient,
};
pub use crypto::dh_box::{BoxError, Ciphertext};
pub use crypto::x25519::{PublicKey, SecretKey};
pub use crypto::{Rng, RngError};
pub use encoding::EncodingError;
pub use identity::IdentityKeyPair;
pub use key_store::{KeyScope, KeyStoreError, MemoryBackend, SecureKeyStore};
pub use message::{
    CodecError, DecryptOutcome, Message, MessageBody, MessageCodec, MessageContent,
    UNABLE_TO_DECRYPT, decrypt_notification,
};
pub use pin::{KeySet, Pin, PinError, PinReset, PinWrapper, Salt, WrappedKeyBundle};
pub use rotation::{
    ReencryptionBatch, ReencryptionEntry, Rotation, RotationEngine, RotationError,
    RotationRequest, RotationStage, RotationUpdate,
};
