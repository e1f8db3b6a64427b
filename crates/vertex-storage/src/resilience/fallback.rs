//! Degraded writes while a primary backend's circuit is open.

use super::ResilientProvider;
use crate::path_policy::StorageKey;
use crate::traits::{StorageError, StorageProvider, StorageResult};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use vertex_core::StorageConfig;

/// Result of an upload through the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadOutcome {
    pub url: String,
    /// Written to the fallback target instead of the connection's backend
    pub degraded: bool,
}

/// Redirects uploads to a local fallback when the primary circuit is open.
///
/// Only uploads are redirected. Reads and deletes keep failing fast with
/// `CircuitOpen` so data is never served from the wrong backend.
pub struct FallbackCoordinator {
    root: Option<PathBuf>,
    base_url: String,
    providers: Mutex<HashMap<Uuid, Arc<dyn StorageProvider>>>,
}

impl FallbackCoordinator {
    /// Fallback directories are created under `root`, one per connection.
    pub fn new(root: Option<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root,
            base_url: base_url.into(),
            providers: Mutex::new(HashMap::new()),
        }
    }

    /// No fallback for any connection unless one is registered.
    pub fn disabled() -> Self {
        Self::new(None, String::new())
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.fallback_path.clone(), config.fallback_base_url.clone())
    }

    /// Use `provider` as the fallback for `connection_id`
    pub async fn register(&self, connection_id: Uuid, provider: Arc<dyn StorageProvider>) {
        self.providers.lock().await.insert(connection_id, provider);
    }

    async fn fallback_for(
        &self,
        connection_id: Uuid,
    ) -> StorageResult<Option<Arc<dyn StorageProvider>>> {
        let mut providers = self.providers.lock().await;
        if let Some(provider) = providers.get(&connection_id) {
            return Ok(Some(provider.clone()));
        }
        let Some(ref root) = self.root else {
            return Ok(None);
        };
        let provider = self.local_fallback(root, connection_id).await?;
        providers.insert(connection_id, provider.clone());
        Ok(Some(provider))
    }

    #[cfg(feature = "storage-local")]
    async fn local_fallback(
        &self,
        root: &Path,
        connection_id: Uuid,
    ) -> StorageResult<Arc<dyn StorageProvider>> {
        let provider = crate::local::LocalDiskProvider::new(
            root.join(connection_id.to_string()),
            format!("{}/{}", self.base_url.trim_end_matches('/'), connection_id),
        )
        .await?;
        Ok(Arc::new(provider))
    }

    #[cfg(not(feature = "storage-local"))]
    async fn local_fallback(
        &self,
        _root: &Path,
        _connection_id: Uuid,
    ) -> StorageResult<Arc<dyn StorageProvider>> {
        Err(StorageError::Config(
            "Local fallback not available (storage-local feature not enabled)".to_string(),
        ))
    }

    /// Upload through `primary`, or to the fallback when its circuit is open.
    pub async fn upload(
        &self,
        primary: &ResilientProvider,
        local_path: &Path,
        key: &StorageKey,
    ) -> StorageResult<UploadOutcome> {
        let connection_id = match primary.upload(local_path, key).await {
            Ok(url) => {
                return Ok(UploadOutcome {
                    url,
                    degraded: false,
                })
            }
            Err(StorageError::CircuitOpen { connection_id }) => connection_id,
            Err(e) => return Err(e),
        };

        let Some(fallback) = self.fallback_for(connection_id).await? else {
            return Err(StorageError::CircuitOpen { connection_id });
        };

        let open_for_ms = primary
            .breaker()
            .open_for()
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        tracing::warn!(
            connection_id = %connection_id,
            open_for_ms,
            key = %key,
            "Primary storage circuit open, writing upload to fallback"
        );

        let url = tokio::select! {
            biased;
            _ = primary.cancel_token().cancelled() => return Err(StorageError::Cancelled),
            result = fallback.upload(local_path, key) => result?,
        };

        Ok(UploadOutcome {
            url,
            degraded: true,
        })
    }
}
