//! Primitive types shared by every chainnet crate.

pub mod identity;
pub mod keys;

pub use identity::{KeyPair, verify_signature};
pub use keys::{DiscoveryKey, KEY_LENGTH, KeyError, PublicKey};
