// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lifecycle of the key material of one user on one device.
//!
//! ```text
//! initialize ──► backup (after joining or rotating conversations) ──► sign_out
//!      ▲
//! recover (new device, PIN re-entry)
//! ```
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::conversation_secret::{ConversationId, ConversationSecret};
use crate::crypto::{Rng, RngError};
use crate::identity::IdentityKeyPair;
use crate::key_store::{KeyScope, KeyStoreError, SecureKeyStore};
use crate::pin::{Pin, PinError, PinReset, PinWrapper, WrappedKeyBundle};
use crate::traits::{IdentityHandle, KeyStoreBackend};

/// Account-level key management on top of the key store and PIN wrapping.
#[derive(Debug)]
pub struct Account;

impl Account {
    /// Generates the identity key pair of a user and wraps it with their PIN.
    ///
    /// The returned bundle is meant to be stored on-device and mirrored to the server.
    pub async fn initialize<ID, B>(
        uid: &ID,
        pin: &Pin,
        store: &SecureKeyStore<ID, B>,
        config: &Config,
        rng: &Rng,
    ) -> Result<(IdentityKeyPair, WrappedKeyBundle), AccountError>
    where
        ID: IdentityHandle,
        B: KeyStoreBackend<ID>,
    {
        let scope = store.write_scope(uid, &KeyScope::Identity).await;
        if scope.get().await?.is_some() {
            return Err(AccountError::AlreadyInitialized(uid.to_string()));
        }
        let identity = IdentityKeyPair::generate(rng)?;
        scope.put(identity.secret_key()).await?;
        drop(scope);

        let key_set = store.export_key_set(uid).await?;
        let bundle = PinWrapper::setup(pin, &key_set, config, rng)?;
        debug!(uid = %uid, public_key = %identity.public_key(), "initialized account");
        Ok((identity, bundle))
    }

    /// Restores all keys of a user from their wrapped bundle.
    pub async fn recover<ID, B>(
        uid: &ID,
        pin: &Pin,
        bundle: &WrappedKeyBundle,
        store: &SecureKeyStore<ID, B>,
        config: &Config,
    ) -> Result<IdentityKeyPair, AccountError>
    where
        ID: IdentityHandle,
        B: KeyStoreBackend<ID>,
    {
        let key_set = PinWrapper::recover(pin, bundle, config)?;
        store.import_key_set(uid, &key_set).await?;
        Ok(IdentityKeyPair::from_secret_key(key_set.identity_secret))
    }

    /// Loads the identity key pair of a user from the key store.
    pub async fn identity<ID, B>(
        uid: &ID,
        store: &SecureKeyStore<ID, B>,
    ) -> Result<IdentityKeyPair, AccountError>
    where
        ID: IdentityHandle,
        B: KeyStoreBackend<ID>,
    {
        let Some(secret_key) = store.get(uid, &KeyScope::Identity).await? else {
            return Err(KeyStoreError::MissingIdentity.into());
        };
        Ok(IdentityKeyPair::from_secret_key(secret_key))
    }

    /// Loads the current secret of a conversation, if we hold one.
    pub async fn conversation_secret<ID, B>(
        uid: &ID,
        conversation_id: &ConversationId,
        store: &SecureKeyStore<ID, B>,
    ) -> Result<Option<ConversationSecret>, AccountError>
    where
        ID: IdentityHandle,
        B: KeyStoreBackend<ID>,
    {
        let scope = KeyScope::Conversation(conversation_id.clone());
        Ok(store
            .get(uid, &scope)
            .await?
            .map(ConversationSecret::from_secret_key))
    }

    /// Re-wraps the current key set, for example after a conversation secret was added or
    /// rotated.
    pub async fn backup<ID, B>(
        uid: &ID,
        pin: &Pin,
        bundle: &WrappedKeyBundle,
        store: &SecureKeyStore<ID, B>,
        config: &Config,
        rng: &Rng,
    ) -> Result<WrappedKeyBundle, AccountError>
    where
        ID: IdentityHandle,
        B: KeyStoreBackend<ID>,
    {
        let key_set = store.export_key_set(uid).await?;
        Ok(PinWrapper::rewrap(pin, bundle, &key_set, config, rng)?)
    }

    /// Replaces the PIN of a user.
    ///
    /// Returns the new bundle and the conversations which need to be rotated.
    pub async fn reset_pin<ID, B>(
        uid: &ID,
        new_pin: &Pin,
        store: &SecureKeyStore<ID, B>,
        config: &Config,
        rng: &Rng,
    ) -> Result<PinReset, AccountError>
    where
        ID: IdentityHandle,
        B: KeyStoreBackend<ID>,
    {
        let key_set = store.export_key_set(uid).await?;
        Ok(PinWrapper::reset(new_pin, &key_set, config, rng)?)
    }

    /// Removes every key of the user from this device.
    pub async fn sign_out<ID, B>(
        uid: &ID,
        store: &SecureKeyStore<ID, B>,
    ) -> Result<(), AccountError>
    where
        ID: IdentityHandle,
        B: KeyStoreBackend<ID>,
    {
        store.dump_all(uid).await?;
        debug!(uid = %uid, "signed out");
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("account {0} already holds an identity key")]
    AlreadyInitialized(String),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Pin(#[from] PinError),

    #[error(transparent)]
    Rng(#[from] RngError),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::conversation_secret::{ConversationId, ConversationSecret};
    use crate::crypto::Rng;
    use crate::key_store::{KeyScope, KeyStoreError, MemoryBackend, SecureKeyStore};
    use crate::pin::{Pin, PinError};
    use crate::test_utils::test_config;

    use super::{Account, AccountError};

    #[tokio::test]
    async fn initialize_and_recover_on_new_device() {
        let rng = Rng::from_seed([1; 32]);
        let config = test_config();
        let alice = "alice".to_string();
        let pin = Pin::new("246810", &config).unwrap();

        let phone = SecureKeyStore::new(MemoryBackend::new());
        let (identity, bundle) = Account::initialize(&alice, &pin, &phone, &config, &rng)
            .await
            .unwrap();

        assert_matches!(
            Account::initialize(&alice, &pin, &phone, &config, &rng).await,
            Err(AccountError::AlreadyInitialized(_))
        );

        // Alice joins a conversation and backs up her keys again.
        let conversation_id = ConversationId::new("c1");
        let secret = ConversationSecret::generate(&rng).unwrap();
        phone
            .put(
                &alice,
                &KeyScope::Conversation(conversation_id.clone()),
                secret.secret_key(),
            )
            .await
            .unwrap();
        let bundle = Account::backup(&alice, &pin, &bundle, &phone, &config, &rng)
            .await
            .unwrap();

        // Wrong PIN on the new device.
        let laptop = SecureKeyStore::new(MemoryBackend::new());
        let wrong_pin = Pin::new("246811", &config).unwrap();
        assert_matches!(
            Account::recover(&alice, &wrong_pin, &bundle, &laptop, &config).await,
            Err(AccountError::Pin(PinError::InvalidPin))
        );
        assert_matches!(
            Account::identity(&alice, &laptop).await,
            Err(AccountError::KeyStore(KeyStoreError::MissingIdentity))
        );

        let recovered = Account::recover(&alice, &pin, &bundle, &laptop, &config)
            .await
            .unwrap();
        assert_eq!(recovered, identity);
        assert_eq!(
            Account::conversation_secret(&alice, &conversation_id, &laptop)
                .await
                .unwrap(),
            Some(secret)
        );
    }

    #[tokio::test]
    async fn sign_out_removes_keys() {
        let rng = Rng::from_seed([2; 32]);
        let config = test_config();
        let alice = "alice".to_string();
        let pin = Pin::new("135790", &config).unwrap();
        let store = SecureKeyStore::new(MemoryBackend::new());

        Account::initialize(&alice, &pin, &store, &config, &rng)
            .await
            .unwrap();
        assert!(Account::identity(&alice, &store).await.is_ok());

        Account::sign_out(&alice, &store).await.unwrap();
        assert!(Account::identity(&alice, &store).await.is_err());
    }

    #[tokio::test]
    async fn reset_pin_lists_conversations() {
        let rng = Rng::from_seed([3; 32]);
        let config = test_config();
        let alice = "alice".to_string();
        let pin = Pin::new("111111", &config).unwrap();
        let store = SecureKeyStore::new(MemoryBackend::new());
        Account::initialize(&alice, &pin, &store, &config, &rng)
            .await
            .unwrap();

        for id in ["c1", "c2"] {
            let secret = ConversationSecret::generate(&rng).unwrap();
            store
                .put(&alice, &ConversationId::new(id).into(), secret.secret_key())
                .await
                .unwrap();
        }

        let new_pin = Pin::new("222222", &config).unwrap();
        let reset = Account::reset_pin(&alice, &new_pin, &store, &config, &rng)
            .await
            .unwrap();
        assert_eq!(
            reset.rotate,
            vec![ConversationId::new("c1"), ConversationId::new("c2")]
        );
    }
}
