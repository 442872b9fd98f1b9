// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-conversation secrets and their distribution to participants.
//!
//! A [`ConversationSecret`] is an X25519 key pair: the secret half is the symmetric key which
//! encrypts every message payload of the current epoch, the public half ("conversation public
//! key") is only used to authenticate distributions and messages of that epoch.
//!
//! To make participants aware of a secret the [`Distributor`] seals it individually towards each
//! participant's identity public key, using the conversation secret itself as the sender key. The
//! resulting [`Distribution`] map is handed to the transport. Participants without a public key
//! (not yet key-enabled) are skipped; encryption is offered to a conversation, never forced.
//!
//! Every message of an epoch is authenticated against the conversation public key, not against
//! the identity key of the message author, as the secret is shared among all participants.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use crate::crypto::dh_box::{self, BoxError, Ciphertext, SharedKey};
use crate::crypto::sha2::sha2_256;
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{Rng, RngError};
use crate::encoding::EncodingError;
use crate::traits::IdentityHandle;

/// Identifier of a conversation as assigned by the backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Secret of one conversation epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationSecret {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl ConversationSecret {
    /// Generates a fresh secret from the random-number generator.
    pub fn generate(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self::from_secret_key(SecretKey::from_rng(rng)?))
    }

    /// Restores a secret from its raw key, for example after loading it from the key store.
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = secret_key.public_key();
        Self {
            secret_key,
            public_key,
        }
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    /// Public key which authenticates distribution and messages of this epoch.
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Short public identifier of this secret, safe to log.
    pub fn fingerprint(&self) -> String {
        hex::encode(&sha2_256(&[self.public_key.as_bytes()])[..8])
    }

    /// Symmetric key used for message payloads of this epoch.
    pub(crate) fn shared_key(&self) -> Result<SharedKey, BoxError> {
        SharedKey::precompute(&self.secret_key, &self.public_key)
    }
}

/// Participant a secret should be distributed to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient<ID> {
    pub id: ID,

    /// Identity public key, `None` if the participant has not set up encryption yet.
    pub public_key: Option<PublicKey>,
}

impl<ID> Recipient<ID> {
    pub fn new(id: ID, public_key: PublicKey) -> Self {
        Self {
            id,
            public_key: Some(public_key),
        }
    }

    /// Participant who is not key-enabled yet.
    pub fn without_key(id: ID) -> Self {
        Self {
            id,
            public_key: None,
        }
    }
}

/// Per-recipient ciphertexts carrying a conversation secret.
///
/// Produced once per distribution event (conversation creation, member addition, rotation) and
/// handed to the transport. Never persisted by this crate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distribution<ID>
where
    ID: Ord,
{
    conversation_public_key: PublicKey,
    entries: BTreeMap<ID, String>,
    #[serde(default = "Vec::new", skip_serializing_if = "Vec::is_empty")]
    skipped: Vec<ID>,
}

impl<ID> Distribution<ID>
where
    ID: IdentityHandle,
{
    pub fn conversation_public_key(&self) -> PublicKey {
        self.conversation_public_key
    }

    /// Base64 encoded ciphertext addressed to this recipient.
    pub fn get(&self, recipient: &ID) -> Option<&str> {
        self.entries.get(recipient).map(String::as_str)
    }

    pub fn contains(&self, recipient: &ID) -> bool {
        self.entries.contains_key(recipient)
    }

    pub fn entries(&self) -> &BTreeMap<ID, String> {
        &self.entries
    }

    pub fn recipients(&self) -> impl Iterator<Item = &ID> {
        self.entries.keys()
    }

    /// Recipients which were left out as they have no public key.
    pub fn skipped(&self) -> &[ID] {
        &self.skipped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }

    /// Fails if any recipient was left out of this distribution.
    pub fn ensure_complete(&self) -> Result<(), DistributorError> {
        if self.skipped.is_empty() {
            return Ok(());
        }
        Err(DistributorError::DistributionIncomplete(
            self.skipped.iter().map(ToString::to_string).collect(),
        ))
    }
}

/// Fresh conversation secret together with its distribution map.
#[derive(Clone, Debug)]
pub struct ConversationKeys<ID>
where
    ID: Ord,
{
    pub secret: ConversationSecret,
    pub distribution: Distribution<ID>,
}

/// Encrypted payload of every distribution entry.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretPayload {
    secret_key: String,
}

/// Creates, distributes and receives conversation secrets.
#[derive(Debug)]
pub struct Distributor;

impl Distributor {
    /// Generates a new conversation secret and seals it towards every recipient with a public key.
    pub fn create_conversation_secret<ID>(
        recipients: &[Recipient<ID>],
        rng: &Rng,
    ) -> Result<ConversationKeys<ID>, DistributorError>
    where
        ID: IdentityHandle,
    {
        let secret = ConversationSecret::generate(rng)?;
        let distribution = Self::distribute(&secret, recipients, rng)?;
        Ok(ConversationKeys {
            secret,
            distribution,
        })
    }

    /// Seals an existing conversation secret towards the given recipients.
    ///
    /// Used when members get added to a conversation or when a rotation is rolled back and the
    /// previous secret needs to be re-announced.
    pub fn distribute<ID>(
        secret: &ConversationSecret,
        recipients: &[Recipient<ID>],
        rng: &Rng,
    ) -> Result<Distribution<ID>, DistributorError>
    where
        ID: IdentityHandle,
    {
        let payload = encode_cbor(&SecretPayload {
            secret_key: secret.secret_key().to_base64(),
        })?;

        let mut seen: BTreeMap<&ID, Option<PublicKey>> = BTreeMap::new();
        let mut entries = BTreeMap::new();
        let mut skipped = Vec::new();

        for recipient in recipients {
            match seen.get(&recipient.id) {
                Some(public_key) if *public_key == recipient.public_key => continue,
                Some(_) => {
                    return Err(DistributorError::ConflictingRecipient(
                        recipient.id.to_string(),
                    ));
                }
                None => {
                    seen.insert(&recipient.id, recipient.public_key);
                }
            }

            let Some(public_key) = recipient.public_key else {
                debug!(
                    recipient = %recipient.id,
                    secret = %secret.fingerprint(),
                    "skip recipient without public key"
                );
                skipped.push(recipient.id.clone());
                continue;
            };

            let ciphertext = dh_box::seal(secret.secret_key(), &payload, &public_key, rng)?;
            entries.insert(recipient.id.clone(), ciphertext.to_base64());
        }

        debug!(
            secret = %secret.fingerprint(),
            recipients = entries.len(),
            skipped = skipped.len(),
            "distributed conversation secret"
        );

        Ok(Distribution {
            conversation_public_key: secret.public_key(),
            entries,
            skipped,
        })
    }

    /// Opens a distribution entry addressed to us.
    ///
    /// Fails with [`DistributorError::DecryptionFailed`] if the entry was not sealed towards our
    /// key, was tampered with or does not belong to the given conversation public key. Callers
    /// should treat the conversation as temporarily unreadable in this case.
    pub fn receive_distribution(
        own_secret: &SecretKey,
        ciphertext: &str,
        conversation_public_key: &PublicKey,
    ) -> Result<ConversationSecret, DistributorError> {
        let ciphertext = Ciphertext::from_base64(ciphertext)?;
        let bytes = dh_box::open(own_secret, &ciphertext, conversation_public_key)?;
        let payload: SecretPayload = decode_cbor(&bytes[..])?;
        let secret = ConversationSecret::from_secret_key(SecretKey::from_base64(
            &payload.secret_key,
        )?);

        if &secret.public_key() != conversation_public_key {
            warn!(
                secret = %secret.fingerprint(),
                "distributed secret does not match conversation public key"
            );
            return Err(DistributorError::DecryptionFailed);
        }

        Ok(secret)
    }

    /// Looks up our entry in a distribution map and opens it.
    pub fn receive<ID>(
        my_id: &ID,
        own_secret: &SecretKey,
        distribution: &Distribution<ID>,
    ) -> Result<ConversationSecret, DistributorError>
    where
        ID: IdentityHandle,
    {
        let Some(ciphertext) = distribution.get(my_id) else {
            return Err(DistributorError::NotARecipient(my_id.to_string()));
        };
        Self::receive_distribution(
            own_secret,
            ciphertext,
            &distribution.conversation_public_key(),
        )
    }
}

#[derive(Debug, Error)]
pub enum DistributorError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("conversation secret could not be sealed: {0}")]
    Seal(BoxError),

    #[error("distributed conversation secret could not be decrypted")]
    DecryptionFailed,

    #[error("recipients without public key: {}", .0.join(", "))]
    DistributionIncomplete(Vec<String>),

    #[error("distribution does not contain an entry for {0}")]
    NotARecipient(String),

    #[error("recipient {0} is listed more than once with different public keys")]
    ConflictingRecipient(String),
}

impl From<BoxError> for DistributorError {
    fn from(value: BoxError) -> Self {
        match value {
            BoxError::DecryptionFailed | BoxError::Encoding(_) => Self::DecryptionFailed,
            err => Self::Seal(err),
        }
    }
}

impl From<DecodeError> for DistributorError {
    fn from(_: DecodeError) -> Self {
        Self::DecryptionFailed
    }
}

impl From<EncodingError> for DistributorError {
    fn from(_: EncodingError) -> Self {
        Self::DecryptionFailed
    }
}
