//! Shared storage credentials with guarded in-place refresh
//!
//! One credential holder is shared by every concurrent chunk worker of a
//! transfer. Refresh is generation-checked: workers that detect an expired
//! token at the same time refresh exactly once, and nobody ever signs with a
//! half-updated credential set.

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::transfer::{Result, TransferError};

/// One set of signing credentials for an object-store deployment.
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Temporary security token; rotated by the credential service.
    pub security_token: Option<String>,
}

impl CredentialSet {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        security_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            security_token,
        }
    }
}

/// External collaborator asked for a fresh credential set when the current
/// one has expired. The business logic of acquiring credentials lives with
/// the caller, not here.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self, current: &CredentialSet) -> anyhow::Result<CredentialSet>;
}

struct Inner {
    creds: CredentialSet,
    generation: u64,
}

/// Guarded holder read by signers and refreshed in place on token expiry.
pub struct StorageCredentials {
    inner: RwLock<Inner>,
    refresher: Option<Box<dyn CredentialRefresher>>,
}

impl StorageCredentials {
    pub fn new(creds: CredentialSet) -> Self {
        Self {
            inner: RwLock::new(Inner {
                creds,
                generation: 0,
            }),
            refresher: None,
        }
    }

    pub fn with_refresher(creds: CredentialSet, refresher: Box<dyn CredentialRefresher>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                creds,
                generation: 0,
            }),
            refresher: Some(refresher),
        }
    }

    /// Current credential set plus the generation it belongs to. The
    /// generation is handed back to [`refresh`](Self::refresh) so a worker
    /// can tell whether the set it signed with is still the live one.
    pub async fn snapshot(&self) -> (CredentialSet, u64) {
        let inner = self.inner.read().await;
        (inner.creds.clone(), inner.generation)
    }

    /// Replace the credential set directly, e.g. from caller-side renewal.
    pub async fn update(&self, creds: CredentialSet) {
        let mut inner = self.inner.write().await;
        inner.creds = creds;
        inner.generation += 1;
    }

    /// Refresh the credential set unless another worker already did.
    ///
    /// `seen_generation` is the generation the caller observed when it signed
    /// the failed request; if the holder has moved past it the expired set is
    /// already gone and this call is a no-op.
    pub async fn refresh(&self, seen_generation: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.generation != seen_generation {
            debug!(
                generation = inner.generation,
                "credentials already refreshed by another worker"
            );
            return Ok(());
        }
        let refresher = self
            .refresher
            .as_ref()
            .ok_or(TransferError::CredentialsExpired)?;
        match refresher.refresh(&inner.creds).await {
            Ok(fresh) => {
                inner.creds = fresh;
                inner.generation += 1;
                debug!(generation = inner.generation, "credentials refreshed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "credential refresh failed");
                Err(TransferError::CredentialsExpired)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingRefresher(AtomicU32);

    #[async_trait]
    impl CredentialRefresher for CountingRefresher {
        async fn refresh(&self, _current: &CredentialSet) -> anyhow::Result<CredentialSet> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(CredentialSet::new("key", "secret", Some(format!("token-{}", n))))
        }
    }

    #[tokio::test]
    async fn refresh_bumps_generation() {
        let creds = StorageCredentials::with_refresher(
            CredentialSet::new("key", "secret", Some("stale".to_string())),
            Box::new(CountingRefresher(AtomicU32::new(0))),
        );

        let (_, generation) = creds.snapshot().await;
        assert_eq!(generation, 0);

        creds.refresh(generation).await.unwrap();
        let (set, generation) = creds.snapshot().await;
        assert_eq!(generation, 1);
        assert_eq!(set.security_token.as_deref(), Some("token-1"));
    }

    #[tokio::test]
    async fn concurrent_detectors_refresh_once() {
        let creds = StorageCredentials::with_refresher(
            CredentialSet::new("key", "secret", Some("stale".to_string())),
            Box::new(CountingRefresher(AtomicU32::new(0))),
        );

        // Two workers observe generation 0 and both report expiry.
        let (_, seen) = creds.snapshot().await;
        creds.refresh(seen).await.unwrap();
        creds.refresh(seen).await.unwrap();

        let (set, generation) = creds.snapshot().await;
        assert_eq!(generation, 1);
        assert_eq!(set.security_token.as_deref(), Some("token-1"));
    }

    #[tokio::test]
    async fn refresh_without_refresher_is_expired() {
        let creds = StorageCredentials::new(CredentialSet::new("key", "secret", None));
        let err = creds.refresh(0).await.unwrap_err();
        assert!(matches!(err, TransferError::CredentialsExpired));
    }
}
