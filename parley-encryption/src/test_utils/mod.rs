// SPDX-License-Identifier: MIT OR Apache-2.0

mod transport;

use crate::config::Config;
use crate::conversation_secret::Recipient;
use crate::crypto::Rng;
use crate::crypto::x25519::{PublicKey, SecretKey};
use crate::identity::IdentityKeyPair;

pub use transport::{MemoryTransport, MemoryTransportError};

pub type MemberId = usize;

/// Configuration with a cheap key derivation, PIN wrapping in tests would be slow otherwise.
pub fn test_config() -> Config {
    Config::default().with_kdf_cost(256, 1, 1)
}

/// Prints tracing output of tests when `RUST_LOG` is set.
pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Conversation participant with an identity key pair.
#[derive(Clone, Debug)]
pub struct TestMember {
    pub id: MemberId,
    pub identity: IdentityKeyPair,
}

impl TestMember {
    pub fn new(id: MemberId, rng: &Rng) -> Self {
        Self {
            id,
            identity: IdentityKeyPair::generate(rng).unwrap(),
        }
    }

    pub fn secret_key(&self) -> &SecretKey {
        self.identity.secret_key()
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn recipient(&self) -> Recipient<MemberId> {
        Recipient::new(self.id, self.public_key())
    }
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::TestMember;

    #[test]
    fn deterministic_members() {
        let member_1 = TestMember::new(0, &Rng::from_seed([0; 32]));
        let member_2 = TestMember::new(0, &Rng::from_seed([0; 32]));
        assert_eq!(member_1.public_key(), member_2.public_key());
    }
}
