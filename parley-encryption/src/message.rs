// SPDX-License-Identifier: MIT OR Apache-2.0

//! Chat messages and their payload encryption.
//!
//! Only the mutable payload of a message (`content`, `media` and `objectRef`) is encrypted. All
//! other fields like the sender, timestamp, likes or reply metadata stay readable for the relay
//! which needs them for ordering and indexing.
//!
//! A message body is either plain or encrypted, never both. The serialized `encryptionLevel`
//! field is derived from the body variant:
//!
//! ```json
//! {
//!   "id": "m1",
//!   "timestamp": 1700000000,
//!   "senderId": "alice",
//!   "encryptionLevel": "encrypted",
//!   "encryptedFields": "<base64>"
//! }
//! ```
//!
//! Conversations can mix plain and encrypted messages, each message is handled on its own.
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use crate::conversation_secret::ConversationSecret;
use crate::crypto::Rng;
use crate::crypto::dh_box::{self, BoxError, Ciphertext};
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::encoding::EncodingError;

/// Neutral text shown in place of messages which can not be decrypted.
pub const UNABLE_TO_DECRYPT: &str = "Unable to decrypt message";

/// Milliseconds since UNIX epoch.
pub type Timestamp = u64;

pub type MessageId = String;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message<ID> {
    pub id: MessageId,
    pub timestamp: Timestamp,
    pub sender_id: ID,
    #[serde(default = "Vec::new")]
    pub likes: Vec<ID>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_profile: Option<SenderProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_ref: Option<ReplyRef>,
    #[serde(default = "Vec::new")]
    pub mentions: Vec<ID>,
    #[serde(default)]
    pub delivered: bool,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl<ID> Message<ID> {
    /// New plaintext message without any reactions or reply metadata.
    pub fn new(
        id: impl Into<MessageId>,
        timestamp: Timestamp,
        sender_id: ID,
        content: MessageContent,
    ) -> Self {
        Self {
            id: id.into(),
            timestamp,
            sender_id,
            likes: Vec::new(),
            sender_profile: None,
            reply_ref: None,
            mentions: Vec::new(),
            delivered: false,
            body: MessageBody::Plain(content),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.body, MessageBody::Encrypted { .. })
    }

    pub fn encryption_level(&self) -> EncryptionLevel {
        self.body.encryption_level()
    }

    /// Plaintext payload, `None` while the message is still encrypted.
    pub fn content(&self) -> Option<&MessageContent> {
        match &self.body {
            MessageBody::Plain(content) => Some(content),
            MessageBody::Encrypted { .. } => None,
        }
    }

    /// Base64 encoded ciphertext, `None` for plaintext messages.
    pub fn encrypted_fields(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Plain(_) => None,
            MessageBody::Encrypted { encrypted_fields } => Some(encrypted_fields),
        }
    }

    /// Text to render for this message, the placeholder if it is still encrypted.
    pub fn display_content(&self) -> &str {
        match &self.body {
            MessageBody::Plain(content) => &content.content,
            MessageBody::Encrypted { .. } => UNABLE_TO_DECRYPT,
        }
    }

    fn with_body(self, body: MessageBody) -> Self {
        Self { body, ..self }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionLevel {
    None,
    Encrypted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encryptionLevel")]
pub enum MessageBody {
    #[serde(rename = "none")]
    Plain(MessageContent),

    #[serde(rename = "encrypted")]
    Encrypted {
        #[serde(rename = "encryptedFields")]
        encrypted_fields: String,
    },
}

impl MessageBody {
    pub fn encryption_level(&self) -> EncryptionLevel {
        match self {
            MessageBody::Plain(_) => EncryptionLevel::None,
            MessageBody::Encrypted { .. } => EncryptionLevel::Encrypted,
        }
    }
}

/// Mutable payload of a message, the part which gets encrypted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub media: Vec<Media>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_ref: Option<String>,
}

impl MessageContent {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Attachment referenced by a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    pub url: String,
    pub mime_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderProfile {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRef {
    pub message_id: MessageId,
    pub timestamp: Timestamp,
}

/// Result of decrypting one message of a conversation page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecryptOutcome<ID> {
    /// Plaintext message, either decrypted or never encrypted.
    Readable(Message<ID>),

    /// Message which stays encrypted, rendered with a placeholder.
    Unreadable(Message<ID>),
}

impl<ID> DecryptOutcome<ID> {
    pub fn message(&self) -> &Message<ID> {
        match self {
            DecryptOutcome::Readable(message) | DecryptOutcome::Unreadable(message) => message,
        }
    }

    pub fn is_readable(&self) -> bool {
        matches!(self, DecryptOutcome::Readable(_))
    }

    pub fn display_content(&self) -> &str {
        self.message().display_content()
    }
}

/// Encrypts and decrypts message payloads with a conversation secret.
#[derive(Debug)]
pub struct MessageCodec;

impl MessageCodec {
    /// Encrypts the payload of a plaintext message. Already encrypted messages are returned
    /// unchanged.
    pub fn encrypt<ID>(
        message: Message<ID>,
        secret: &ConversationSecret,
        rng: &Rng,
    ) -> Result<Message<ID>, CodecError> {
        let MessageBody::Plain(content) = &message.body else {
            return Ok(message);
        };
        let encrypted_fields = Self::seal_content(content, secret, rng)?;
        Ok(message.with_body(MessageBody::Encrypted { encrypted_fields }))
    }

    /// Decrypts the payload of an encrypted message. Plaintext messages are returned unchanged.
    ///
    /// The payload is authenticated against the conversation public key of the epoch, not against
    /// the identity of the message author.
    pub fn decrypt<ID>(
        message: Message<ID>,
        secret: &SecretKey,
        conversation_public_key: &PublicKey,
    ) -> Result<Message<ID>, CodecError> {
        let MessageBody::Encrypted { encrypted_fields } = &message.body else {
            return Ok(message);
        };
        let content = Self::open_content(encrypted_fields, secret, conversation_public_key)?;
        Ok(message.with_body(MessageBody::Plain(content)))
    }

    /// Decrypts a page of messages, each on its own.
    ///
    /// Plaintext messages never need a secret. Encrypted messages without an available secret or
    /// which fail to decrypt are marked as unreadable instead of failing the whole page.
    pub fn decrypt_all<ID>(
        messages: Vec<Message<ID>>,
        secret: Option<&ConversationSecret>,
    ) -> Vec<DecryptOutcome<ID>> {
        messages
            .into_iter()
            .map(|message| {
                let MessageBody::Encrypted { encrypted_fields } = &message.body else {
                    return DecryptOutcome::Readable(message);
                };
                let Some(secret) = secret else {
                    return DecryptOutcome::Unreadable(message);
                };
                let opened =
                    Self::open_content(encrypted_fields, secret.secret_key(), &secret.public_key());
                match opened {
                    Ok(content) => {
                        DecryptOutcome::Readable(message.with_body(MessageBody::Plain(content)))
                    }
                    Err(err) => {
                        warn!(
                            message_id = %message.id,
                            secret = %secret.fingerprint(),
                            "{err}"
                        );
                        DecryptOutcome::Unreadable(message)
                    }
                }
            })
            .collect()
    }

    pub(crate) fn seal_content(
        content: &MessageContent,
        secret: &ConversationSecret,
        rng: &Rng,
    ) -> Result<String, CodecError> {
        let payload = encode_cbor(content)?;
        let ciphertext = dh_box::seal_after(&secret.shared_key()?, &payload, rng)?;
        Ok(ciphertext.to_base64())
    }

    pub(crate) fn open_content(
        encrypted_fields: &str,
        secret: &SecretKey,
        conversation_public_key: &PublicKey,
    ) -> Result<MessageContent, CodecError> {
        let ciphertext = Ciphertext::from_base64(encrypted_fields)?;
        let payload = dh_box::open(secret, &ciphertext, conversation_public_key)?;
        Ok(decode_cbor(&payload[..])?)
    }
}

/// Decrypts the payload of a push notification, falling back to the placeholder.
pub fn decrypt_notification(
    encrypted_fields: &str,
    secret: &SecretKey,
    conversation_public_key: &PublicKey,
) -> String {
    match MessageCodec::open_content(encrypted_fields, secret, conversation_public_key) {
        Ok(content) => content.content,
        Err(err) => {
            warn!("notification {err}");
            UNABLE_TO_DECRYPT.to_string()
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("message payload could not be encrypted: {0}")]
    Seal(BoxError),

    #[error("message could not be decrypted")]
    DecryptionFailed,
}

impl From<BoxError> for CodecError {
    fn from(value: BoxError) -> Self {
        match value {
            BoxError::DecryptionFailed | BoxError::Encoding(_) => Self::DecryptionFailed,
            err => Self::Seal(err),
        }
    }
}

impl From<DecodeError> for CodecError {
    fn from(_: DecodeError) -> Self {
        Self::DecryptionFailed
    }
}

impl From<EncodingError> for CodecError {
    fn from(_: EncodingError) -> Self {
        Self::DecryptionFailed
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::conversation_secret::ConversationSecret;
    use crate::crypto::Rng;

    use super::{
        CodecError, DecryptOutcome, EncryptionLevel, Media, Message, MessageBody, MessageCodec,
        MessageContent, ReplyRef, UNABLE_TO_DECRYPT, decrypt_notification,
    };

    fn message(id: &str, text: &str) -> Message<String> {
        let content = MessageContent {
            content: text.to_string(),
            media: vec![Media {
                url: "https://example.org/cat.png".to_string(),
                mime_type: "image/png".to_string(),
            }],
            object_ref: Some("poll-1".to_string()),
        };
        let mut message = Message::new(id, 1_700_000_000_000, "alice".to_string(), content);
        message.likes = vec!["bob".to_string()];
        message.reply_ref = Some(ReplyRef {
            message_id: "m0".to_string(),
            timestamp: 1_699_999_999_000,
        });
        message
    }

    #[test]
    fn encrypt_decrypt() {
        let rng = Rng::from_seed([1; 32]);
        let secret = ConversationSecret::generate(&rng).unwrap();
        let plain = message("m1", "Hello, Panda!");

        let encrypted = MessageCodec::encrypt(plain.clone(), &secret, &rng).unwrap();
        assert!(encrypted.is_encrypted());
        assert_eq!(encrypted.encryption_level(), EncryptionLevel::Encrypted);
        assert!(encrypted.content().is_none());

        // Metadata stays readable.
        assert_eq!(encrypted.id, plain.id);
        assert_eq!(encrypted.sender_id, plain.sender_id);
        assert_eq!(encrypted.likes, plain.likes);
        assert_eq!(encrypted.reply_ref, plain.reply_ref);

        let decrypted =
            MessageCodec::decrypt(encrypted, secret.secret_key(), &secret.public_key()).unwrap();
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn unrelated_secret_is_rejected() {
        let rng = Rng::from_seed([2; 32]);
        let s1 = ConversationSecret::generate(&rng).unwrap();
        let s2 = ConversationSecret::generate(&rng).unwrap();

        let encrypted = MessageCodec::encrypt(message("m1", "secret"), &s1, &rng).unwrap();
        assert_matches!(
            MessageCodec::decrypt(encrypted.clone(), s2.secret_key(), &s2.public_key()),
            Err(CodecError::DecryptionFailed)
        );

        // Right secret, but wrong authentication anchor.
        assert_matches!(
            MessageCodec::decrypt(encrypted, s1.secret_key(), &s2.public_key()),
            Err(CodecError::DecryptionFailed)
        );
    }

    #[test]
    fn plaintext_and_encrypted_pass_through() {
        let rng = Rng::from_seed([3; 32]);
        let secret = ConversationSecret::generate(&rng).unwrap();
        let plain = message("m1", "hi");

        // Decrypting plaintext is a no-op.
        let unchanged =
            MessageCodec::decrypt(plain.clone(), secret.secret_key(), &secret.public_key())
                .unwrap();
        assert_eq!(unchanged, plain);

        // Encrypting twice is a no-op as well.
        let encrypted = MessageCodec::encrypt(plain, &secret, &rng).unwrap();
        let again = MessageCodec::encrypt(encrypted.clone(), &secret, &rng).unwrap();
        assert_eq!(again, encrypted);
    }

    #[test]
    fn unreadable_messages_render_placeholder() {
        let rng = Rng::from_seed([4; 32]);
        let secret = ConversationSecret::generate(&rng).unwrap();
        let other = ConversationSecret::generate(&rng).unwrap();

        let messages = vec![
            message("m1", "plain"),
            MessageCodec::encrypt(message("m2", "sealed"), &secret, &rng).unwrap(),
            MessageCodec::encrypt(message("m3", "stale"), &other, &rng).unwrap(),
        ];

        let outcomes = MessageCodec::decrypt_all(messages.clone(), Some(&secret));
        let rendered: Vec<&str> = outcomes.iter().map(DecryptOutcome::display_content).collect();
        assert_eq!(rendered, vec!["plain", "sealed", UNABLE_TO_DECRYPT]);
        assert!(!outcomes[2].is_readable());

        // Unreadable messages keep their ciphertext untouched.
        assert_eq!(outcomes[2].message(), &messages[2]);
        assert_eq!(
            outcomes[1].message().content(),
            message("m2", "sealed").content()
        );

        // Without any secret only the plaintext message is readable.
        let outcomes = MessageCodec::decrypt_all(messages, None);
        let readable: Vec<bool> = outcomes.iter().map(DecryptOutcome::is_readable).collect();
        assert_eq!(readable, vec![true, false, false]);
    }

    #[test]
    fn notification() {
        let rng = Rng::from_seed([5; 32]);
        let secret = ConversationSecret::generate(&rng).unwrap();
        let encrypted = MessageCodec::encrypt(message("m1", "ping"), &secret, &rng).unwrap();
        let fields = encrypted.encrypted_fields().unwrap();

        assert_eq!(
            decrypt_notification(fields, secret.secret_key(), &secret.public_key()),
            "ping"
        );
        assert_eq!(
            decrypt_notification("not base64!", secret.secret_key(), &secret.public_key()),
            UNABLE_TO_DECRYPT
        );
    }

    #[test]
    fn json_encryption_level() {
        let rng = Rng::from_seed([6; 32]);
        let secret = ConversationSecret::generate(&rng).unwrap();
        let plain = message("m1", "hi");

        let json = serde_json::to_value(&plain).unwrap();
        assert_eq!(json["encryptionLevel"], "none");
        assert_eq!(json["content"], "hi");
        assert_eq!(json["senderId"], "alice");
        assert!(json.get("encryptedFields").is_none());

        let encrypted = MessageCodec::encrypt(plain, &secret, &rng).unwrap();
        let json = serde_json::to_value(&encrypted).unwrap();
        assert_eq!(json["encryptionLevel"], "encrypted");
        assert!(json["encryptedFields"].is_string());
        assert!(json.get("content").is_none());
        assert!(json.get("media").is_none());

        let parsed: Message<String> = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, encrypted);
        assert_matches!(parsed.body, MessageBody::Encrypted { .. });
    }
}
