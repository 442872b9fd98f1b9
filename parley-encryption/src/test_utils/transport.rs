// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::conversation_secret::{ConversationId, ConversationSecret, Distribution, Distributor};
use crate::crypto::Rng;
use crate::crypto::x25519::PublicKey;
use crate::encoding;
use crate::message::{Message, MessageBody, MessageCodec, MessageContent, Timestamp};
use crate::rotation::{ReencryptionBatch, ReencryptionEntry, RotationUpdate};
use crate::test_utils::{MemberId, TestMember};
use crate::traits::Transport;

#[derive(Debug)]
struct StoredMessage {
    message: Message<MemberId>,

    /// Conversation public key of the epoch an encrypted message belongs to.
    public_key: Option<PublicKey>,
}

#[derive(Debug, Default)]
struct ConversationLog {
    messages: Vec<StoredMessage>,
    distributions: Vec<Distribution<MemberId>>,
}

#[derive(Debug, Default)]
struct MemoryTransportInner {
    conversations: HashMap<ConversationId, ConversationLog>,
    fail_fetch_history: bool,
    fail_publish_rotation: bool,
    fail_publish_distribution: bool,
}

/// In-memory backend relaying messages and distribution maps, with failure injection.
#[derive(Clone, Debug, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryTransportInner>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport with one conversation whose secret was distributed to all members.
    pub fn with_conversation(
        conversation_id: &ConversationId,
        members: &[&TestMember],
        rng: &Rng,
    ) -> (Self, ConversationSecret) {
        let transport = Self::new();
        let secret = transport.create_conversation(conversation_id, members, rng);
        (transport, secret)
    }

    pub fn create_conversation(
        &self,
        conversation_id: &ConversationId,
        members: &[&TestMember],
        rng: &Rng,
    ) -> ConversationSecret {
        let recipients: Vec<_> = members.iter().map(|member| member.recipient()).collect();
        let keys = Distributor::create_conversation_secret(&recipients, rng).unwrap();
        self.inner()
            .conversations
            .entry(conversation_id.clone())
            .or_default()
            .distributions
            .push(keys.distribution);
        keys.secret
    }

    fn inner(&self) -> MutexGuard<'_, MemoryTransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, conversation_id: &ConversationId, stored: StoredMessage) {
        self.inner()
            .conversations
            .entry(conversation_id.clone())
            .or_default()
            .messages
            .push(stored);
    }

    /// Posts a plaintext message.
    pub fn post_plain(
        &self,
        conversation_id: &ConversationId,
        sender: &TestMember,
        text: &str,
        timestamp: Timestamp,
    ) {
        let message = Message::new(
            format!("m{timestamp}"),
            timestamp,
            sender.id,
            MessageContent::text(text),
        );
        self.push(
            conversation_id,
            StoredMessage {
                message,
                public_key: None,
            },
        );
    }

    /// Posts a message encrypted with the given conversation secret.
    pub fn post_text(
        &self,
        conversation_id: &ConversationId,
        sender: &TestMember,
        text: &str,
        timestamp: Timestamp,
        secret: &ConversationSecret,
        rng: &Rng,
    ) {
        let message = Message::new(
            format!("m{timestamp}"),
            timestamp,
            sender.id,
            MessageContent::text(text),
        );
        let message = MessageCodec::encrypt(message, secret, rng).unwrap();
        self.push(
            conversation_id,
            StoredMessage {
                message,
                public_key: Some(secret.public_key()),
            },
        );
    }

    /// Posts an encrypted message whose ciphertext can not be opened by anyone.
    pub fn post_garbage(
        &self,
        conversation_id: &ConversationId,
        sender: &TestMember,
        id: &str,
        timestamp: Timestamp,
        secret: &ConversationSecret,
    ) {
        self.post_sealed(
            conversation_id,
            sender,
            id,
            timestamp,
            encoding::to_base64(&[7; 64]),
            secret.public_key(),
        );
    }

    /// Stores raw encrypted fields under the given epoch public key, as a relay could.
    pub fn post_sealed(
        &self,
        conversation_id: &ConversationId,
        sender: &TestMember,
        id: &str,
        timestamp: Timestamp,
        encrypted_fields: String,
        public_key: PublicKey,
    ) {
        let mut message = Message::new(id, timestamp, sender.id, MessageContent::default());
        message.body = MessageBody::Encrypted { encrypted_fields };
        self.push(
            conversation_id,
            StoredMessage {
                message,
                public_key: Some(public_key),
            },
        );
    }

    /// All messages of a conversation as the backend currently stores them.
    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message<MemberId>> {
        self.inner()
            .conversations
            .get(conversation_id)
            .map(|log| {
                log.messages
                    .iter()
                    .map(|stored| stored.message.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn latest_distribution(
        &self,
        conversation_id: &ConversationId,
    ) -> Option<Distribution<MemberId>> {
        self.inner()
            .conversations
            .get(conversation_id)
            .and_then(|log| log.distributions.last().cloned())
    }

    pub fn fail_fetch_history(&self, fail: bool) {
        self.inner().fail_fetch_history = fail;
    }

    pub fn fail_publish_rotation(&self, fail: bool) {
        self.inner().fail_publish_rotation = fail;
    }

    pub fn fail_publish_distribution(&self, fail: bool) {
        self.inner().fail_publish_distribution = fail;
    }
}

impl Transport<MemberId> for MemoryTransport {
    type Error = MemoryTransportError;

    async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
        min_date: Timestamp,
    ) -> Result<ReencryptionBatch, Self::Error> {
        let inner = self.inner();
        if inner.fail_fetch_history {
            return Err(MemoryTransportError::Unavailable("fetch_history"));
        }
        let Some(log) = inner.conversations.get(conversation_id) else {
            return Err(MemoryTransportError::UnknownConversation(
                conversation_id.clone(),
            ));
        };

        let entries = log
            .messages
            .iter()
            .filter(|stored| stored.message.timestamp >= min_date)
            .filter_map(|stored| {
                let encrypted_fields = stored.message.encrypted_fields()?;
                Some(ReencryptionEntry {
                    id: stored.message.id.clone(),
                    encrypted_fields: encrypted_fields.to_string(),
                    public_key: stored.public_key?,
                })
            })
            .collect();
        Ok(ReencryptionBatch { min_date, entries })
    }

    async fn publish_rotation(
        &self,
        update: &RotationUpdate<MemberId>,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner();
        if inner.fail_publish_rotation {
            return Err(MemoryTransportError::Unavailable("publish_rotation"));
        }
        let Some(log) = inner.conversations.get_mut(&update.conversation_id) else {
            return Err(MemoryTransportError::UnknownConversation(
                update.conversation_id.clone(),
            ));
        };

        // Validate first so the update is applied as a whole or not at all.
        for entry in &update.batch.entries {
            if !log.messages.iter().any(|stored| stored.message.id == entry.id) {
                return Err(MemoryTransportError::UnknownMessage(entry.id.clone()));
            }
        }

        for entry in &update.batch.entries {
            for stored in log
                .messages
                .iter_mut()
                .filter(|stored| stored.message.id == entry.id)
            {
                stored.message.body = MessageBody::Encrypted {
                    encrypted_fields: entry.encrypted_fields.clone(),
                };
                stored.public_key = Some(entry.public_key);
            }
        }
        log.distributions.push(update.distribution.clone());
        Ok(())
    }

    async fn publish_distribution(
        &self,
        conversation_id: &ConversationId,
        distribution: &Distribution<MemberId>,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner();
        if inner.fail_publish_distribution {
            return Err(MemoryTransportError::Unavailable("publish_distribution"));
        }
        inner
            .conversations
            .entry(conversation_id.clone())
            .or_default()
            .distributions
            .push(distribution.clone());
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MemoryTransportError {
    #[error("{0} is unavailable")]
    Unavailable(&'static str),

    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),

    #[error("unknown message {0}")]
    UnknownMessage(String),
}
