// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rotation of a conversation secret with re-encryption of the conversation history.
//!
//! Rotation is the only multi-step transaction of this crate. It touches an unbounded amount of
//! historical ciphertext and an unbounded participant list and needs to be safe to retry or to
//! abandon at any point:
//!
//! ```text
//!                 fetch            reencrypt               commit
//!     Idle ──────────────► Fetched ─────────► Reencrypted ─────────► Committed
//!       │                    │  ▲                  │
//!       │                    │  └──────────────────┘ commit failed, retry
//!       │ cancel             │ cancel              │ cancel
//!       └────────────────────┴─────────────────────┴──────────────► Cancelled
//! ```
//!
//! 1. `fetch`: pull all encrypted history at or after a date floor from the transport.
//! 2. `reencrypt`: generate a new secret, distribute it to all current participants and move
//!    every history entry from the old secret to the new one.
//! 3. `commit`: publish distribution and migrated history as one logical update. Only after the
//!    transport accepted it, the local key store adopts the new secret.
//!
//! Cancelling re-distributes the old secret to all participants, as they might already have been
//! told that a rotation is in progress. [`RotationEngine::rotate`] runs the whole transaction and
//! cancels automatically on any failure before commit.
use std::error::Error;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::conversation_secret::{
    ConversationId, ConversationKeys, ConversationSecret, Distribution, Distributor,
    DistributorError, Recipient,
};
use crate::crypto::Rng;
use crate::crypto::dh_box::{self, BoxError, Ciphertext};
use crate::crypto::x25519::PublicKey;
use crate::key_store::{KeyScope, KeyStoreError, SecureKeyStore};
use crate::message::{MessageId, Timestamp};
use crate::traits::{IdentityHandle, KeyStoreBackend, Transport};

/// Encrypted history entry which needs to be moved to a new secret.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReencryptionEntry {
    pub id: MessageId,
    pub encrypted_fields: String,

    /// Conversation public key of the epoch the entry was encrypted in.
    pub public_key: PublicKey,
}

/// Working set of a rotation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReencryptionBatch {
    /// Oldest timestamp which needs migration.
    pub min_date: Timestamp,
    pub entries: Vec<ReencryptionEntry>,
}

/// Logical update a rotation publishes to the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationUpdate<ID>
where
    ID: Ord,
{
    pub conversation_id: ConversationId,

    /// Conversation public key of the superseded epoch.
    pub previous_public_key: PublicKey,
    pub distribution: Distribution<ID>,
    pub batch: ReencryptionBatch,
}

/// Input to a rotation.
#[derive(Clone, Debug)]
pub struct RotationRequest<ID> {
    /// Participant running the rotation. Adopts the new secret after commit.
    pub my_id: ID,
    pub conversation_id: ConversationId,
    pub old_secret: ConversationSecret,

    /// All participants after the change which triggered the rotation, including ourselves.
    pub participants: Vec<Recipient<ID>>,
    pub min_date: Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationStage {
    Idle,
    Fetched,
    Reencrypted,
    Committed,
    Cancelled,
}

/// State of one rotation transaction.
#[derive(Debug)]
pub struct Rotation<ID>
where
    ID: Ord,
{
    request: RotationRequest<ID>,
    stage: RotationStage,
    batch: Option<ReencryptionBatch>,
    pending: Option<PendingRotation<ID>>,
}

#[derive(Debug)]
struct PendingRotation<ID>
where
    ID: Ord,
{
    keys: ConversationKeys<ID>,
    batch: ReencryptionBatch,
}

impl<ID> Rotation<ID>
where
    ID: IdentityHandle,
{
    pub fn new(request: RotationRequest<ID>) -> Self {
        Self {
            request,
            stage: RotationStage::Idle,
            batch: None,
            pending: None,
        }
    }

    pub fn stage(&self) -> RotationStage {
        self.stage
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.request.conversation_id
    }

    /// Secret which is not yet committed, available after re-encryption.
    pub fn pending_secret(&self) -> Option<&ConversationSecret> {
        self.pending.as_ref().map(|pending| &pending.keys.secret)
    }

    fn transition(&mut self, to: RotationStage) {
        debug!(
            conversation = %self.request.conversation_id,
            from = ?self.stage,
            to = ?to,
            "rotation"
        );
        self.stage = to;
    }

    fn ensure_stage(&self, expected: RotationStage) -> Result<(), RotationError> {
        if self.stage != expected {
            return Err(RotationError::InvalidState {
                expected,
                actual: self.stage,
            });
        }
        Ok(())
    }

    /// Pulls the encrypted history bounded by the date floor of the request.
    pub async fn fetch<T>(&mut self, transport: &T) -> Result<(), RotationError>
    where
        T: Transport<ID>,
    {
        self.ensure_stage(RotationStage::Idle)?;
        let batch = transport
            .fetch_history(&self.request.conversation_id, self.request.min_date)
            .await
            .map_err(RotationError::transport)?;
        debug!(
            conversation = %self.request.conversation_id,
            entries = batch.entries.len(),
            "fetched history for rotation"
        );
        self.batch = Some(batch);
        self.transition(RotationStage::Fetched);
        Ok(())
    }

    /// Generates and distributes the new secret and migrates every fetched entry to it.
    ///
    /// Fails if any entry can not be opened under the old secret or claims another epoch than the
    /// rotated one, the migrated history would otherwise silently lose or gain messages.
    pub fn reencrypt(&mut self, rng: &Rng) -> Result<(), RotationError> {
        self.ensure_stage(RotationStage::Fetched)?;
        let Some(batch) = &self.batch else {
            return Err(RotationError::InvalidState {
                expected: RotationStage::Fetched,
                actual: self.stage,
            });
        };

        let keys = Distributor::create_conversation_secret(&self.request.participants, rng)?;
        if !keys.distribution.contains(&self.request.my_id) {
            return Err(RotationError::NotARecipient(self.request.my_id.to_string()));
        }

        let old_secret = &self.request.old_secret;
        let old_public_key = old_secret.public_key();
        let new_shared = keys.secret.shared_key()?;
        let mut entries = Vec::with_capacity(batch.entries.len());
        for entry in &batch.entries {
            // Entries are only authentic under the public key of the rotated epoch.
            if entry.public_key != old_public_key {
                return Err(RotationError::UndecryptableEntry(entry.id.clone()));
            }
            let plaintext = Ciphertext::from_base64(&entry.encrypted_fields)
                .and_then(|ciphertext| {
                    dh_box::open(old_secret.secret_key(), &ciphertext, &old_public_key)
                })
                .map_err(|_| RotationError::UndecryptableEntry(entry.id.clone()))?;
            let ciphertext = dh_box::seal_after(&new_shared, &plaintext, rng)?;
            entries.push(ReencryptionEntry {
                id: entry.id.clone(),
                encrypted_fields: ciphertext.to_base64(),
                public_key: keys.secret.public_key(),
            });
        }

        debug!(
            conversation = %self.request.conversation_id,
            old = %old_secret.fingerprint(),
            new = %keys.secret.fingerprint(),
            entries = entries.len(),
            "re-encrypted history"
        );

        self.pending = Some(PendingRotation {
            keys,
            batch: ReencryptionBatch {
                min_date: batch.min_date,
                entries,
            },
        });
        self.transition(RotationStage::Reencrypted);
        Ok(())
    }

    /// Publishes the new distribution with the migrated history and adopts the new secret.
    ///
    /// If publishing fails the pending secret is dropped and the rotation returns to `Fetched`,
    /// from where it can be re-encrypted and committed again or cancelled.
    pub async fn commit<T, B>(
        &mut self,
        transport: &T,
        store: &SecureKeyStore<ID, B>,
    ) -> Result<ConversationSecret, RotationError>
    where
        T: Transport<ID>,
        B: KeyStoreBackend<ID>,
    {
        self.ensure_stage(RotationStage::Reencrypted)?;
        let Some(pending) = self.pending.take() else {
            return Err(RotationError::InvalidState {
                expected: RotationStage::Reencrypted,
                actual: self.stage,
            });
        };

        let update = RotationUpdate {
            conversation_id: self.request.conversation_id.clone(),
            previous_public_key: self.request.old_secret.public_key(),
            distribution: pending.keys.distribution,
            batch: pending.batch,
        };
        if let Err(err) = transport.publish_rotation(&update).await {
            self.transition(RotationStage::Fetched);
            return Err(RotationError::transport(err));
        }
        self.transition(RotationStage::Committed);

        // The transport accepted the new epoch. If storing fails from here on, our own
        // distribution entry still carries the new secret.
        let scope = KeyScope::Conversation(self.request.conversation_id.clone());
        let guard = store.write_scope(&self.request.my_id, &scope).await;
        guard.put(pending.keys.secret.secret_key()).await?;

        debug!(
            conversation = %self.request.conversation_id,
            secret = %pending.keys.secret.fingerprint(),
            "adopted rotated conversation secret"
        );
        Ok(pending.keys.secret)
    }

    /// Abandons the rotation and re-distributes the old secret to all participants.
    pub async fn cancel<T>(&mut self, transport: &T, rng: &Rng) -> Result<(), RotationError>
    where
        T: Transport<ID>,
    {
        if matches!(
            self.stage,
            RotationStage::Committed | RotationStage::Cancelled
        ) {
            return Err(RotationError::InvalidState {
                expected: RotationStage::Reencrypted,
                actual: self.stage,
            });
        }

        self.pending = None;
        let distribution =
            Distributor::distribute(&self.request.old_secret, &self.request.participants, rng)?;
        transport
            .publish_distribution(&self.request.conversation_id, &distribution)
            .await
            .map_err(RotationError::transport)?;

        warn!(
            conversation = %self.request.conversation_id,
            secret = %self.request.old_secret.fingerprint(),
            "rotation cancelled, restored previous secret"
        );
        self.transition(RotationStage::Cancelled);
        Ok(())
    }
}

/// Drives a rotation transaction from start to end.
#[derive(Debug)]
pub struct RotationEngine;

impl RotationEngine {
    /// Rotates the secret of a conversation and returns the new one.
    ///
    /// Any failure before the commit went through cancels the rotation and is reported as
    /// [`RotationError::Aborted`], or as [`RotationError::RollbackFailed`] if even restoring the
    /// old secret failed.
    pub async fn rotate<ID, T, B>(
        request: RotationRequest<ID>,
        transport: &T,
        store: &SecureKeyStore<ID, B>,
        rng: &Rng,
    ) -> Result<ConversationSecret, RotationError>
    where
        ID: IdentityHandle,
        T: Transport<ID>,
        B: KeyStoreBackend<ID>,
    {
        let mut rotation = Rotation::new(request);
        let err = match Self::run(&mut rotation, transport, store, rng).await {
            Ok(secret) => return Ok(secret),
            Err(err) => err,
        };

        // The new epoch is already published, rolling back would split the conversation.
        if rotation.stage() == RotationStage::Committed {
            return Err(err);
        }

        warn!(
            conversation = %rotation.conversation_id(),
            stage = ?rotation.stage(),
            "rotation failed: {err}"
        );
        match rotation.cancel(transport, rng).await {
            Ok(()) => Err(RotationError::Aborted(Box::new(err))),
            Err(rollback) => Err(RotationError::RollbackFailed {
                cause: Box::new(err),
                rollback: Box::new(rollback),
            }),
        }
    }

    async fn run<ID, T, B>(
        rotation: &mut Rotation<ID>,
        transport: &T,
        store: &SecureKeyStore<ID, B>,
        rng: &Rng,
    ) -> Result<ConversationSecret, RotationError>
    where
        ID: IdentityHandle,
        T: Transport<ID>,
        B: KeyStoreBackend<ID>,
    {
        rotation.fetch(transport).await?;
        rotation.reencrypt(rng)?;
        rotation.commit(transport, store).await
    }
}

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("rotation aborted: {0}")]
    Aborted(#[source] Box<RotationError>),

    #[error("rotation aborted ({cause}) and previous secret could not be restored: {rollback}")]
    RollbackFailed {
        cause: Box<RotationError>,
        rollback: Box<RotationError>,
    },

    #[error("rotation is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: RotationStage,
        actual: RotationStage,
    },

    #[error("history entry {0} could not be decrypted with the previous secret")]
    UndecryptableEntry(MessageId),

    #[error("{0} is not a key-enabled participant of the rotated conversation")]
    NotARecipient(String),

    #[error("transport failed: {0}")]
    Transport(Box<dyn Error + Send + Sync + 'static>),

    #[error(transparent)]
    Distributor(#[from] DistributorError),

    #[error(transparent)]
    Crypto(#[from] BoxError),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
}

impl RotationError {
    fn transport<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::Transport(Box::new(err))
    }

    /// Returns true if the rotation was abandoned and the conversation still uses the old secret.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_) | Self::RollbackFailed { .. })
    }
}
