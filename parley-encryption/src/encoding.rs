// SPDX-License-Identifier: MIT OR Apache-2.0

//! Textual encoding of binary key and ciphertext material.
//!
//! Everything crossing the boundary to transports or storage backends is standard base64 (with
//! padding), so JSON-based collaborators can carry values unmodified.
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

/// Encodes bytes as standard base64.
pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decodes a standard base64 string.
pub fn from_base64(value: &str) -> Result<Vec<u8>, EncodingError> {
    Ok(STANDARD.decode(value)?)
}

/// Decodes a standard base64 string which is expected to hold exactly `N` bytes.
pub fn from_base64_array<const N: usize>(value: &str) -> Result<[u8; N], EncodingError> {
    let bytes = from_base64(value)?;
    let actual = bytes.len();
    bytes
        .try_into()
        .map_err(|_| EncodingError::InvalidLength {
            expected: N,
            actual,
        })
}

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),

    #[error("expected {expected} bytes but got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::{EncodingError, from_base64, from_base64_array, to_base64};

    #[test]
    fn standard_alphabet() {
        assert_eq!(to_base64(b"parley"), "cGFybGV5");
        assert_eq!(from_base64("cGFybGV5").unwrap(), b"parley");
    }

    #[test]
    fn fixed_length() {
        let encoded = to_base64(&[3u8; 32]);
        assert_eq!(from_base64_array::<32>(&encoded).unwrap(), [3u8; 32]);
        assert!(matches!(
            from_base64_array::<24>(&encoded),
            Err(EncodingError::InvalidLength {
                expected: 24,
                actual: 32
            })
        ));
        assert!(matches!(
            from_base64_array::<32>("not base64!"),
            Err(EncodingError::Base64(_))
        ));
    }
}
