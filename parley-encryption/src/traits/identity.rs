// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::{Debug, Display};
use std::hash::Hash as StdHash;

/// Handle identifying a user (participant, recipient, message sender).
///
/// Applications usually use the user id assigned by their backend.
pub trait IdentityHandle: Clone + Debug + Display + Eq + Ord + StdHash {}

impl<T> IdentityHandle for T where T: Clone + Debug + Display + Eq + Ord + StdHash {}
