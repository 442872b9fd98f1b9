// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic building blocks.
pub mod dh_box;
mod rng;
mod secret;
pub mod sha2;
pub mod x25519;
pub mod xchacha20;

pub use rng::{Rng, RngError};
pub use secret::Secret;
