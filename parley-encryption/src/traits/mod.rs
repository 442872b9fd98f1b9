// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to external collaborators and generic identity handles.
mod identity;
mod key_store;
mod transport;

pub use identity::IdentityHandle;
pub use key_store::KeyStoreBackend;
pub use transport::Transport;
