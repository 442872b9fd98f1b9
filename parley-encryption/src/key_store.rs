// SPDX-License-Identifier: MIT OR Apache-2.0

//! On-device store for identity and conversation secrets.
//!
//! Keys are namespaced per user id and addressed by a [`KeyScope`]. Access to every
//! `(uid, scope)` pair is serialised with a read-write lock: lookups take a read lock, writes and
//! removals take the write lock. Multi-step callers can hold a scope lock across several
//! operations with [`SecureKeyStore::read_scope`] and [`SecureKeyStore::write_scope`], this
//! prevents a rotation from replacing a conversation secret while a message is still being
//! decrypted under the previous one.
//!
//! The store never moves keys off the device in cleartext. The only exported form is a
//! [`KeySet`] which is meant to be wrapped with a PIN right away, see [`crate::pin`].
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

use crate::conversation_secret::ConversationId;
use crate::crypto::x25519::SecretKey;
use crate::pin::KeySet;
use crate::traits::{IdentityHandle, KeyStoreBackend};

/// Slot a key is stored under.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyScope {
    /// Identity secret key of the user.
    Identity,

    /// Current secret of a conversation.
    Conversation(ConversationId),
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyScope::Identity => write!(f, "identity"),
            KeyScope::Conversation(id) => write!(f, "conversation/{id}"),
        }
    }
}

impl From<ConversationId> for KeyScope {
    fn from(value: ConversationId) -> Self {
        KeyScope::Conversation(value)
    }
}

type ScopeLocks<ID> = Mutex<HashMap<(ID, KeyScope), Arc<RwLock<()>>>>;

/// Key store with per-scope locking on top of a [`KeyStoreBackend`].
#[derive(Debug)]
pub struct SecureKeyStore<ID, B> {
    backend: B,
    locks: ScopeLocks<ID>,
}

impl<ID, B> SecureKeyStore<ID, B>
where
    ID: IdentityHandle,
    B: KeyStoreBackend<ID>,
{
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn lock(&self, uid: &ID, scope: &KeyScope) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry((uid.clone(), scope.clone()))
            .or_default()
            .clone()
    }

    /// Acquires the read lock of a scope.
    pub async fn read_scope(&self, uid: &ID, scope: &KeyScope) -> ScopeReadGuard<'_, ID, B> {
        let guard = self.lock(uid, scope).await.read_owned().await;
        ScopeReadGuard {
            store: self,
            uid: uid.clone(),
            scope: scope.clone(),
            _guard: guard,
        }
    }

    /// Acquires the write lock of a scope.
    pub async fn write_scope(&self, uid: &ID, scope: &KeyScope) -> ScopeWriteGuard<'_, ID, B> {
        let guard = self.lock(uid, scope).await.write_owned().await;
        ScopeWriteGuard {
            store: self,
            uid: uid.clone(),
            scope: scope.clone(),
            _guard: guard,
        }
    }

    pub async fn get(
        &self,
        uid: &ID,
        scope: &KeyScope,
    ) -> Result<Option<SecretKey>, KeyStoreError> {
        self.read_scope(uid, scope).await.get().await
    }

    pub async fn put(
        &self,
        uid: &ID,
        scope: &KeyScope,
        key: &SecretKey,
    ) -> Result<(), KeyStoreError> {
        self.write_scope(uid, scope).await.put(key).await
    }

    pub async fn forget(&self, uid: &ID, scope: &KeyScope) -> Result<(), KeyStoreError> {
        self.write_scope(uid, scope).await.forget().await
    }

    /// Removes all key material of a user, for example on sign-out.
    ///
    /// Waits for all in-flight operations on the user's scopes to finish.
    pub async fn dump_all(&self, uid: &ID) -> Result<(), KeyStoreError> {
        let mut scopes = self
            .backend
            .scopes(uid)
            .await
            .map_err(KeyStoreError::backend)?;
        {
            let locks = self.locks.lock().await;
            scopes.extend(
                locks
                    .keys()
                    .filter(|(lock_uid, _)| lock_uid == uid)
                    .map(|(_, scope)| scope.clone()),
            );
        }
        scopes.sort();
        scopes.dedup();

        // Acquire in a stable order so concurrent dumps can not deadlock.
        let mut guards = Vec::with_capacity(scopes.len());
        for scope in &scopes {
            guards.push(self.lock(uid, scope).await.write_owned().await);
        }

        self.backend
            .clear(uid)
            .await
            .map_err(KeyStoreError::backend)?;
        drop(guards);

        // Locks still referenced by queued callers must survive, otherwise a later caller would
        // create a second lock for the same scope.
        self.locks
            .lock()
            .await
            .retain(|(lock_uid, _), lock| lock_uid != uid || Arc::strong_count(lock) > 1);

        debug!(uid = %uid, scopes = scopes.len(), "dumped all keys");
        Ok(())
    }

    /// Runs `f` and dumps all keys of the user afterwards, even if `f` failed.
    ///
    /// An error of `f` takes precedence over an error while dumping.
    pub async fn session<'a, F, Fut, T, E>(&'a self, uid: &ID, f: F) -> Result<T, E>
    where
        F: FnOnce(&'a Self) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<KeyStoreError>,
    {
        let result = f(self).await;
        let dumped = self.dump_all(uid).await;
        match (result, dumped) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err.into()),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    /// Collects all keys of a user for backup.
    pub async fn export_key_set(&self, uid: &ID) -> Result<KeySet, KeyStoreError> {
        let Some(identity_secret) = self.get(uid, &KeyScope::Identity).await? else {
            return Err(KeyStoreError::MissingIdentity);
        };

        let mut conversations = BTreeMap::new();
        let scopes = self
            .backend
            .scopes(uid)
            .await
            .map_err(KeyStoreError::backend)?;
        for scope in scopes {
            let KeyScope::Conversation(conversation_id) = &scope else {
                continue;
            };
            // Keys might have been forgotten in between.
            if let Some(key) = self.get(uid, &scope).await? {
                conversations.insert(conversation_id.clone(), key);
            }
        }

        Ok(KeySet {
            identity_secret,
            conversations,
        })
    }

    /// Stores all keys of a recovered key set.
    pub async fn import_key_set(&self, uid: &ID, key_set: &KeySet) -> Result<(), KeyStoreError> {
        self.put(uid, &KeyScope::Identity, &key_set.identity_secret)
            .await?;
        for (conversation_id, key) in &key_set.conversations {
            self.put(uid, &KeyScope::Conversation(conversation_id.clone()), key)
                .await?;
        }
        debug!(
            uid = %uid,
            conversations = key_set.conversations.len(),
            "imported key set"
        );
        Ok(())
    }
}

/// Shared access to one scope of the key store.
pub struct ScopeReadGuard<'a, ID, B> {
    store: &'a SecureKeyStore<ID, B>,
    uid: ID,
    scope: KeyScope,
    _guard: OwnedRwLockReadGuard<()>,
}

impl<ID, B> ScopeReadGuard<'_, ID, B>
where
    ID: IdentityHandle,
    B: KeyStoreBackend<ID>,
{
    pub fn scope(&self) -> &KeyScope {
        &self.scope
    }

    pub async fn get(&self) -> Result<Option<SecretKey>, KeyStoreError> {
        self.store
            .backend
            .load(&self.uid, &self.scope)
            .await
            .map_err(KeyStoreError::backend)
    }
}

/// Exclusive access to one scope of the key store.
pub struct ScopeWriteGuard<'a, ID, B> {
    store: &'a SecureKeyStore<ID, B>,
    uid: ID,
    scope: KeyScope,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl<ID, B> ScopeWriteGuard<'_, ID, B>
where
    ID: IdentityHandle,
    B: KeyStoreBackend<ID>,
{
    pub fn scope(&self) -> &KeyScope {
        &self.scope
    }

    pub async fn get(&self) -> Result<Option<SecretKey>, KeyStoreError> {
        self.store
            .backend
            .load(&self.uid, &self.scope)
            .await
            .map_err(KeyStoreError::backend)
    }

    pub async fn put(&self, key: &SecretKey) -> Result<(), KeyStoreError> {
        self.store
            .backend
            .store(&self.uid, &self.scope, key)
            .await
            .map_err(KeyStoreError::backend)
    }

    pub async fn forget(&self) -> Result<(), KeyStoreError> {
        self.store
            .backend
            .remove(&self.uid, &self.scope)
            .await
            .map_err(KeyStoreError::backend)
    }
}

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key store backend failed: {0}")]
    Backend(Box<dyn Error + Send + Sync + 'static>),

    #[error("no identity key found")]
    MissingIdentity,
}

impl KeyStoreError {
    fn backend<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(err))
    }
}

/// In-memory key store backend.
#[derive(Debug, Clone)]
pub struct MemoryBackend<ID> {
    inner: Arc<RwLock<HashMap<ID, BTreeMap<KeyScope, SecretKey>>>>,
}

impl<ID> Default for MemoryBackend<ID> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<ID> MemoryBackend<ID> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<ID> KeyStoreBackend<ID> for MemoryBackend<ID>
where
    ID: IdentityHandle,
{
    type Error = Infallible;

    async fn load(&self, uid: &ID, scope: &KeyScope) -> Result<Option<SecretKey>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner.get(uid).and_then(|keys| keys.get(scope)).cloned())
    }

    async fn store(&self, uid: &ID, scope: &KeyScope, key: &SecretKey) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        inner
            .entry(uid.clone())
            .or_default()
            .insert(scope.clone(), key.clone());
        Ok(())
    }

    async fn remove(&self, uid: &ID, scope: &KeyScope) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        if let Some(keys) = inner.get_mut(uid) {
            keys.remove(scope);
        }
        Ok(())
    }

    async fn scopes(&self, uid: &ID) -> Result<Vec<KeyScope>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .get(uid)
            .map(|keys| keys.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, uid: &ID) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        inner.remove(uid);
        Ok(())
    }
}
