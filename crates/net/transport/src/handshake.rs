//! Authenticated handshake turning a raw [`FramedConnection`] into a [`SecureConnection`].

use std::time::Duration;

use async_trait::async_trait;
use chainnet_primitives::{KeyPair, PublicKey, verify_signature};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::codec::{DEFAULT_MAX_FRAME_SIZE, decode_frame, encode_frame};
use crate::connection::FramedConnection;
use crate::error::TransportError;

/// Default time allowed for a handshake to complete.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const TRANSCRIPT_DOMAIN: &[u8] = b"chainnet-handshake";

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Dialed the remote.
    Initiator,
    /// Accepted the connection.
    Responder,
}

impl Role {
    pub fn is_initiator(&self) -> bool {
        matches!(self, Role::Initiator)
    }
}

/// Connection whose remote identity has been proven.
#[derive(Debug)]
pub struct SecureConnection {
    pub remote_public_key: PublicKey,
    pub role: Role,
    pub connection: FramedConnection,
}

/// Authenticates a raw connection against the local key pair.
#[async_trait]
pub trait Handshake: Send + Sync + 'static {
    async fn upgrade(
        &self,
        connection: FramedConnection,
        local: &KeyPair,
        role: Role,
    ) -> Result<SecureConnection, TransportError>;
}

#[derive(Debug, Serialize, Deserialize)]
enum HandshakeMessage {
    Hello {
        public_key: PublicKey,
        nonce: [u8; 32],
    },
    Proof {
        signature: Vec<u8>,
    },
}

/// Mutual challenge-response over ed25519.
///
/// Each side sends its public key and a fresh nonce, then signs the remote nonce
/// together with its own public key. Both roles run the same exchange.
#[derive(Debug, Clone)]
pub struct SignedHandshake {
    timeout: Duration,
    max_frame_size: usize,
}

impl Default for SignedHandshake {
    fn default() -> Self {
        Self::new(DEFAULT_HANDSHAKE_TIMEOUT)
    }
}

impl SignedHandshake {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    async fn exchange(
        &self,
        mut connection: FramedConnection,
        local: &KeyPair,
        role: Role,
    ) -> Result<SecureConnection, TransportError> {
        let local_key = local.public_key();
        let nonce: [u8; 32] = rand::random();

        self.send(
            &mut connection,
            &HandshakeMessage::Hello {
                public_key: local_key,
                nonce,
            },
        )
        .await?;

        let (remote_key, remote_nonce) = match self.recv(&mut connection).await? {
            HandshakeMessage::Hello { public_key, nonce } => (public_key, nonce),
            HandshakeMessage::Proof { .. } => {
                return Err(TransportError::Handshake("expected hello".into()));
            }
        };
        if remote_key == local_key {
            return Err(TransportError::Handshake("connected to self".into()));
        }
        trace!(?role, remote = %remote_key.short(), "received hello");

        let signature = local.sign(&transcript(&remote_nonce, &local_key));
        self.send(&mut connection, &HandshakeMessage::Proof { signature })
            .await?;

        let remote_signature = match self.recv(&mut connection).await? {
            HandshakeMessage::Proof { signature } => signature,
            HandshakeMessage::Hello { .. } => {
                return Err(TransportError::Handshake("expected proof".into()));
            }
        };
        if !verify_signature(&remote_key, &transcript(&nonce, &remote_key), &remote_signature) {
            return Err(TransportError::Handshake("invalid signature".into()));
        }

        trace!(?role, remote = %remote_key.short(), "handshake complete");
        Ok(SecureConnection {
            remote_public_key: remote_key,
            role,
            connection,
        })
    }

    async fn send(
        &self,
        connection: &mut FramedConnection,
        message: &HandshakeMessage,
    ) -> Result<(), TransportError> {
        let frame = encode_frame(message, self.max_frame_size)?;
        connection.send(frame).await?;
        Ok(())
    }

    async fn recv(
        &self,
        connection: &mut FramedConnection,
    ) -> Result<HandshakeMessage, TransportError> {
        let frame = connection.recv().await.ok_or(TransportError::Closed)??;
        Ok(decode_frame(&frame, self.max_frame_size)?)
    }
}

#[async_trait]
impl Handshake for SignedHandshake {
    async fn upgrade(
        &self,
        connection: FramedConnection,
        local: &KeyPair,
        role: Role,
    ) -> Result<SecureConnection, TransportError> {
        tokio::time::timeout(self.timeout, self.exchange(connection, local, role))
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}

fn transcript(nonce: &[u8; 32], signer: &PublicKey) -> Vec<u8> {
    let mut msg = Vec::with_capacity(TRANSCRIPT_DOMAIN.len() + 64);
    msg.extend_from_slice(TRANSCRIPT_DOMAIN);
    msg.extend_from_slice(nonce);
    msg.extend_from_slice(signer.as_bytes());
    msg
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[tokio::test]
    async fn test_handshake_success() {
        let (a, b) = FramedConnection::pair();
        let ka = KeyPair::generate();
        let kb = KeyPair::generate();
        let hs = SignedHandshake::default();

        let (ra, rb) = tokio::join!(
            hs.upgrade(a, &ka, Role::Initiator),
            hs.upgrade(b, &kb, Role::Responder)
        );
        let ra = ra.unwrap();
        let rb = rb.unwrap();

        assert_eq!(ra.remote_public_key, kb.public_key());
        assert_eq!(rb.remote_public_key, ka.public_key());
        assert_eq!(ra.role, Role::Initiator);
        assert_eq!(rb.role, Role::Responder);
    }

    #[tokio::test]
    async fn test_handshake_usable_after_upgrade() {
        let (a, b) = FramedConnection::pair();
        let ka = KeyPair::generate();
        let kb = KeyPair::generate();
        let hs = SignedHandshake::default();

        let (ra, rb) = tokio::join!(
            hs.upgrade(a, &ka, Role::Initiator),
            hs.upgrade(b, &kb, Role::Responder)
        );
        let mut ra = ra.unwrap();
        let mut rb = rb.unwrap();

        ra.connection.send(Bytes::from_static(b"after")).await.unwrap();
        assert_eq!(
            rb.connection.recv().await.unwrap().unwrap(),
            Bytes::from_static(b"after")
        );
    }

    #[tokio::test]
    async fn test_handshake_remote_closed() {
        let (a, b) = FramedConnection::pair();
        drop(b);
        let err = SignedHandshake::default()
            .upgrade(a, &KeyPair::generate(), Role::Initiator)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed | TransportError::Io(_)));
    }

    #[tokio::test]
    async fn test_handshake_rejects_self() {
        let (a, b) = FramedConnection::pair();
        let k = KeyPair::generate();
        let hs = SignedHandshake::default();

        let (ra, rb) = tokio::join!(
            hs.upgrade(a, &k, Role::Initiator),
            hs.upgrade(b, &k, Role::Responder)
        );
        assert!(matches!(ra, Err(TransportError::Handshake(_))));
        assert!(matches!(rb, Err(TransportError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_handshake_rejects_forged_proof() {
        let (a, mut b) = FramedConnection::pair();
        let ka = KeyPair::generate();
        let impersonated = KeyPair::generate().public_key();

        let attacker = async move {
            let hello = HandshakeMessage::Hello {
                public_key: impersonated,
                nonce: [0u8; 32],
            };
            b.send(encode_frame(&hello, DEFAULT_MAX_FRAME_SIZE).unwrap())
                .await
                .unwrap();
            let _ = b.recv().await;
            let proof = HandshakeMessage::Proof {
                signature: vec![0u8; 64],
            };
            b.send(encode_frame(&proof, DEFAULT_MAX_FRAME_SIZE).unwrap())
                .await
                .unwrap();
            // keep the connection open until the victim has read the proof
            let _ = b.recv().await;
            b
        };

        let handshake = SignedHandshake::default();
        let (result, _b) = tokio::join!(
            handshake.upgrade(a, &ka, Role::Initiator),
            attacker
        );
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (a, _b) = FramedConnection::pair();
        let err = SignedHandshake::new(Duration::from_millis(20))
            .upgrade(a, &KeyPair::generate(), Role::Initiator)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }
}
