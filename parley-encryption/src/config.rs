// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

/// Number of digits a PIN has by default.
pub const DEFAULT_PIN_LENGTH: usize = 6;

/// Configuration for the encryption core.
///
/// The key-derivation cost parameters are fixed per deployment: changing them makes previously
/// wrapped key bundles unrecoverable, as the same PIN and salt would derive another wrapping key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Exact number of ASCII digits a PIN must have.
    pub(crate) pin_length: usize,

    /// Argon2id memory cost in KiB.
    pub(crate) kdf_memory_kib: u32,

    /// Argon2id number of passes over memory.
    pub(crate) kdf_iterations: u32,

    /// Argon2id degree of parallelism.
    pub(crate) kdf_parallelism: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pin_length: DEFAULT_PIN_LENGTH,
            kdf_memory_kib: 19 * 1024, // 19 MiB
            kdf_iterations: 2,
            kdf_parallelism: 1,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the Argon2id cost parameters.
    pub fn with_kdf_cost(mut self, memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        self.kdf_memory_kib = memory_kib;
        self.kdf_iterations = iterations;
        self.kdf_parallelism = parallelism;
        self
    }

    pub fn with_pin_length(mut self, pin_length: usize) -> Self {
        self.pin_length = pin_length;
        self
    }

    pub fn pin_length(&self) -> usize {
        self.pin_length
    }
}
