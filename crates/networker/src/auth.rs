//! Admission hook for remote identities.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chainnet_primitives::PublicKey;
use tracing::debug;

use crate::error::NetworkerError;

/// Reason given by an [`Authenticator`] for declining a remote identity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct Rejection(pub String);

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Decides whether an authenticated remote identity may become a peer.
///
/// Called once per candidate connection, after deduplication, so never twice at once
/// for the same identity.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, remote_public_key: &PublicKey) -> Result<(), Rejection>;
}

#[async_trait]
impl<F, Fut> Authenticator for F
where
    F: Fn(PublicKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Rejection>> + Send + 'static,
{
    async fn authenticate(&self, remote_public_key: &PublicKey) -> Result<(), Rejection> {
        (self)(*remote_public_key).await
    }
}

/// Runs the configured hook, admitting everyone when none is set.
#[derive(Clone, Default)]
pub(crate) struct AuthGate {
    hook: Option<Arc<dyn Authenticator>>,
}

impl AuthGate {
    pub(crate) fn new(hook: Option<Arc<dyn Authenticator>>) -> Self {
        Self { hook }
    }

    pub(crate) async fn check(&self, remote: &PublicKey) -> Result<(), NetworkerError> {
        let Some(hook) = &self.hook else {
            return Ok(());
        };
        hook.authenticate(remote).await.map_err(|rejection| {
            debug!(peer = %remote.short(), reason = %rejection, "authentication rejected");
            NetworkerError::AuthenticationRejected(rejection.0)
        })
    }
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_no_hook_admits() {
        let gate = AuthGate::default();
        assert!(gate.check(&PublicKey::random()).await.is_ok());
    }

    #[tokio::test]
    async fn test_closure_hook() {
        let allowed = PublicKey::random();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let hook: Arc<dyn Authenticator> = Arc::new(move |key: PublicKey| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if key == allowed {
                    Ok(())
                } else {
                    Err(Rejection::new("not on the list"))
                }
            }
        });
        let gate = AuthGate::new(Some(hook));

        assert!(gate.check(&allowed).await.is_ok());
        let err = gate.check(&PublicKey::random()).await.unwrap_err();
        assert!(
            matches!(err, NetworkerError::AuthenticationRejected(reason) if reason == "not on the list")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
