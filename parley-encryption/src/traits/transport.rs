// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;

use crate::conversation_secret::{ConversationId, Distribution};
use crate::message::Timestamp;
use crate::rotation::{ReencryptionBatch, RotationUpdate};

/// Transport and API collaborator.
///
/// The core never talks to a network itself. Implementations relay ciphertext and distribution
/// maps to the backend and own retries and request timeouts.
pub trait Transport<ID>
where
    ID: Ord,
{
    type Error: Error + Send + Sync + 'static;

    /// Returns all encrypted messages of a conversation sent at or after `min_date`.
    fn fetch_history(
        &self,
        conversation_id: &ConversationId,
        min_date: Timestamp,
    ) -> impl Future<Output = Result<ReencryptionBatch, Self::Error>>;

    /// Publishes a new distribution map together with the re-encrypted history.
    ///
    /// The backend must apply both as one logical update: either all participants see the new
    /// secret and the migrated ciphertext or nothing changed.
    fn publish_rotation(
        &self,
        update: &RotationUpdate<ID>,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Publishes a distribution map on its own, for example after adding a member.
    fn publish_distribution(
        &self,
        conversation_id: &ConversationId,
        distribution: &Distribution<ID>,
    ) -> impl Future<Output = Result<(), Self::Error>>;
}
