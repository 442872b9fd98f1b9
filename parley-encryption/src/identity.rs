// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::crypto::{Rng, RngError};

/// Long-term X25519 key pair of a user.
///
/// Conversation secrets are distributed towards the public half. The secret half never leaves the
/// device, except wrapped with the PIN of the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityKeyPair {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl IdentityKeyPair {
    pub fn generate(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self::from_secret_key(SecretKey::from_rng(rng)?))
    }

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

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::IdentityKeyPair;

    #[test]
    fn restore_from_secret() {
        let rng = Rng::from_seed([1; 32]);
        let identity = IdentityKeyPair::generate(&rng).unwrap();
        let restored = IdentityKeyPair::from_secret_key(identity.secret_key().clone());
        assert_eq!(identity, restored);
        assert_eq!(identity.public_key(), identity.secret_key().public_key());
    }
}
