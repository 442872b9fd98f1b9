// SPDX-License-Identifier: MIT OR Apache-2.0

//! SHA2 hashing functions.
use sha2::{Digest, Sha256};

pub const SHA256_DIGEST_SIZE: usize = 32;

/// SHA2-256 hashing function over a list of byte strings.
pub fn sha2_256(messages: &[&[u8]]) -> [u8; SHA256_DIGEST_SIZE] {
    let mut hasher = Sha256::new();
    for message in messages {
        hasher.update(message);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::sha2_256;

    #[test]
    fn concatenated_input() {
        assert_eq!(sha2_256(&[b"parley"]), sha2_256(&[b"par", b"ley"]));
        assert_ne!(sha2_256(&[b"parley"]), sha2_256(&[b"parlez"]));
    }
}
