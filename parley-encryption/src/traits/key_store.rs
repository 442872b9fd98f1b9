// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;

use crate::crypto::x25519::SecretKey;
use crate::key_store::KeyScope;

/// On-device storage backing the secure key store.
///
/// Implementations persist raw key material locally (keychain, encrypted preferences, etc.) and
/// must never sync it off the device in cleartext. Locking is handled by
/// [`SecureKeyStore`](crate::key_store::SecureKeyStore), backends only need to be consistent for
/// single calls.
pub trait KeyStoreBackend<ID> {
    type Error: Error + Send + Sync + 'static;

    fn load(
        &self,
        uid: &ID,
        scope: &KeyScope,
    ) -> impl Future<Output = Result<Option<SecretKey>, Self::Error>>;

    fn store(
        &self,
        uid: &ID,
        scope: &KeyScope,
        key: &SecretKey,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    fn remove(&self, uid: &ID, scope: &KeyScope) -> impl Future<Output = Result<(), Self::Error>>;

    /// Lists all scopes with key material for this user.
    fn scopes(&self, uid: &ID) -> impl Future<Output = Result<Vec<KeyScope>, Self::Error>>;

    /// Removes all key material of this user.
    fn clear(&self, uid: &ID) -> impl Future<Output = Result<(), Self::Error>>;
}
