//! Local node identity: an ed25519 key pair used to authenticate connections.

use std::fmt;
use std::sync::Arc;

use libp2p::identity::ed25519;

use crate::keys::{KEY_LENGTH, KeyError, PublicKey};

/// Ed25519 key pair of the local node.
///
/// Cheap to clone; the secret material is shared, never copied out except through
/// [`KeyPair::secret_key`].
#[derive(Clone)]
pub struct KeyPair {
    inner: Arc<ed25519::Keypair>,
    public_key: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        Self::from_keypair(ed25519::Keypair::generate())
    }

    /// Rebuild a key pair from its 32-byte secret key.
    pub fn from_secret_key(secret: [u8; KEY_LENGTH]) -> Result<Self, KeyError> {
        let secret =
            ed25519::SecretKey::try_from_bytes(secret).map_err(|_| KeyError::InvalidKeyMaterial)?;
        Ok(Self::from_keypair(ed25519::Keypair::from(secret)))
    }

    /// Parse a hex encoded secret key (as stored in config files).
    pub fn from_secret_hex(hex_secret: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_secret.trim_start_matches("0x"))
            .map_err(|e| KeyError::InvalidHex(e.to_string()))?;
        let secret: [u8; KEY_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
        Self::from_secret_key(secret)
    }

    fn from_keypair(inner: ed25519::Keypair) -> Self {
        let public_key = PublicKey::new(inner.public().to_bytes());
        Self {
            inner: Arc::new(inner),
            public_key,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn secret_key(&self) -> [u8; KEY_LENGTH] {
        let secret = self.inner.secret();
        let mut out = [0u8; KEY_LENGTH];
        out.copy_from_slice(secret.as_ref());
        out
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.inner.sign(message)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
    }
}

impl Eq for KeyPair {}

/// Verify an ed25519 signature made by `public_key` over `message`.
pub fn verify_signature(public_key: &PublicKey, message: &[u8], signature: &[u8]) -> bool {
    match ed25519::PublicKey::try_from_bytes(public_key.as_bytes()) {
        Ok(key) => key.verify(message, signature),
        Err(_) => false,
    }
}
