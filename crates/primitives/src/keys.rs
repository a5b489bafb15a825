//! Fixed-size 32-byte identifiers: peer public keys and topic discovery keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Length in bytes of every key in this module.
pub const KEY_LENGTH: usize = 32;

/// Errors produced when parsing keys from untrusted input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("expected {KEY_LENGTH} bytes, got {0}")]
    InvalidLength(usize),
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("invalid ed25519 key material")]
    InvalidKeyMaterial,
}

macro_rules! fixed_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name([u8; KEY_LENGTH]);

        impl $name {
            pub const fn new(bytes: [u8; KEY_LENGTH]) -> Self {
                Self(bytes)
            }

            /// Parse from a slice, rejecting anything that is not exactly 32 bytes.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
                let array: [u8; KEY_LENGTH] = bytes
                    .try_into()
                    .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
                Ok(Self(array))
            }

            pub fn random() -> Self {
                Self(rand::random())
            }

            pub const fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
                &self.0
            }

            pub const fn to_bytes(self) -> [u8; KEY_LENGTH] {
                self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// First four bytes as hex, for log lines.
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl From<[u8; KEY_LENGTH]> for $name {
            fn from(bytes: [u8; KEY_LENGTH]) -> Self {
                Self(bytes)
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = KeyError;

            fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
                Self::from_slice(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = KeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s.trim_start_matches("0x"))
                    .map_err(|e| KeyError::InvalidHex(e.to_string()))?;
                Self::from_slice(&bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }
    };
}

fixed_key!(
    /// Ed25519 public key identifying a node on the network.
    ///
    /// Ordering is plain lexicographic byte order, which both ends of a connection
    /// compute identically.
    PublicKey
);

fixed_key!(
    /// Topic identifier under which nodes announce and look each other up.
    DiscoveryKey
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        assert_eq!(
            DiscoveryKey::from_slice(&[0u8; 31]),
            Err(KeyError::InvalidLength(31))
        );
        assert_eq!(
            DiscoveryKey::from_slice(&[0u8; 33]),
            Err(KeyError::InvalidLength(33))
        );
        assert!(DiscoveryKey::from_slice(&[7u8; 32]).is_ok());
    }

    #[test]
    fn test_hex_parse() {
        let key = PublicKey::new([0xab; 32]);
        let parsed: PublicKey = key.to_hex().parse().unwrap();
        assert_eq!(parsed, key);

        let prefixed: PublicKey = format!("0x{}", key.to_hex()).parse().unwrap();
        assert_eq!(prefixed, key);

        assert!(matches!(
            "zz".parse::<PublicKey>(),
            Err(KeyError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_ordering_is_bytewise() {
        let mut low = [0u8; 32];
        let mut high = [0u8; 32];
        low[0] = 1;
        high[0] = 2;
        assert!(PublicKey::new(low) < PublicKey::new(high));
    }

    #[test]
    fn test_debug_is_short() {
        let key = DiscoveryKey::new([0x01; 32]);
        assert_eq!(format!("{key:?}"), "DiscoveryKey(01010101)");
    }

    #[test]
    fn test_serde_json() {
        let key = PublicKey::random();
        let json = serde_json::to_string(&key).unwrap();
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
