//! Storage service facade.
//!
//! Entry point for HTTP handlers and background workers. Resolves a connection
//! id to a provider wrapped in the resilience stack, normalizes raw keys and
//! keeps the usage statistics cache coherent with writes.

use crate::cache::{CacheConfig, UsageStatsCache};
use crate::factory::ProviderFactory;
use crate::path_policy::{PathPolicy, StorageKey};
use crate::repository::ConnectionRepository;
use crate::resilience::{
    BreakerConfig, BreakerSnapshot, CircuitRegistry, FallbackCoordinator, ResilientProvider,
    RetryConfig, RetryPolicy, UploadOutcome,
};
use crate::traits::{
    ConnectionReport, KeyStream, PresignMethod, StorageProvider, StorageResult, UsageStats,
};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vertex_core::{ErrorMetadata, StorageConfig, StorageConnection, TestStatus};

pub struct StorageService {
    repository: Arc<dyn ConnectionRepository>,
    factory: ProviderFactory,
    breakers: CircuitRegistry,
    retry: RetryPolicy,
    attempt_timeout: Option<Duration>,
    fallback: FallbackCoordinator,
    cache: UsageStatsCache,
    policy: PathPolicy,
}

impl StorageService {
    pub fn new<R>(repository: Arc<R>, config: &StorageConfig) -> Self
    where
        R: ConnectionRepository + 'static,
    {
        let factory = ProviderFactory::new(config);
        #[cfg(feature = "storage-cloud-disk")]
        let factory = factory.with_refresh_handler(repository.clone());

        let attempt_timeout =
            (config.attempt_timeout_secs > 0).then(|| Duration::from_secs(config.attempt_timeout_secs));

        Self {
            policy: factory.policy(),
            repository,
            factory,
            breakers: CircuitRegistry::new(BreakerConfig::from(config)),
            retry: RetryPolicy::new(RetryConfig::from(config)),
            attempt_timeout,
            fallback: FallbackCoordinator::from_config(config),
            cache: UsageStatsCache::new(CacheConfig::from(config)),
        }
    }

    pub fn with_breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breakers = CircuitRegistry::new(config);
        self
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry = RetryPolicy::new(config);
        self
    }

    pub fn with_cache_config(mut self, config: CacheConfig) -> Self {
        self.cache = UsageStatsCache::new(config);
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackCoordinator) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn policy(&self) -> PathPolicy {
        self.policy
    }

    /// Resilient provider for an active connection
    pub async fn provider(
        &self,
        connection_id: Uuid,
        cancel: CancellationToken,
    ) -> StorageResult<ResilientProvider> {
        let connection = self.repository.get(connection_id).await?;
        self.resilient(&connection, cancel).await
    }

    async fn resilient(
        &self,
        connection: &StorageConnection,
        cancel: CancellationToken,
    ) -> StorageResult<ResilientProvider> {
        let inner = self.factory.create(connection).await?;
        let mut provider = ResilientProvider::new(
            connection.id,
            inner,
            self.breakers.breaker(connection.id),
            self.retry,
        )
        .with_cancel(cancel);
        if let Some(timeout) = self.attempt_timeout {
            provider = provider.with_attempt_timeout(timeout);
        }
        Ok(provider)
    }

    // Connection records

    /// Validate the record's credentials and store it. Returns the redacted record.
    pub async fn create_connection(
        &self,
        connection: StorageConnection,
    ) -> StorageResult<StorageConnection> {
        self.factory.create(&connection).await?;
        let stored = self.repository.insert(connection).await?;
        tracing::info!(
            connection_id = %stored.id,
            name = %stored.name,
            provider_kind = %stored.provider_kind,
            "Storage connection created"
        );
        Ok(stored.redacted())
    }

    pub async fn list_connections(&self) -> StorageResult<Vec<StorageConnection>> {
        Ok(self
            .repository
            .list()
            .await?
            .iter()
            .map(StorageConnection::redacted)
            .collect())
    }

    pub async fn delete_connection(&self, connection_id: Uuid) -> StorageResult<()> {
        self.repository.deactivate(connection_id).await?;
        self.breakers.remove(connection_id);
        self.factory.forget(connection_id);
        tracing::info!(connection_id = %connection_id, "Storage connection deactivated");
        Ok(())
    }

    /// Check connectivity and persist the outcome on the record.
    pub async fn test_connection(&self, connection_id: Uuid) -> StorageResult<ConnectionReport> {
        let connection = self.repository.get(connection_id).await?;
        let start = Instant::now();

        let report = match self.factory.create(&connection).await {
            Ok(provider) => provider.test_connection().await,
            Err(e) => ConnectionReport::failure(e.client_message()),
        };

        let (status, error) = if report.ok {
            (TestStatus::Success, None)
        } else {
            (TestStatus::Failed, Some(report.detail.clone()))
        };
        self.repository
            .record_test_result(connection_id, status, error, Utc::now())
            .await?;

        if report.ok {
            tracing::info!(
                connection_id = %connection_id,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "Storage connection test succeeded"
            );
        } else {
            tracing::warn!(
                connection_id = %connection_id,
                detail = %report.detail,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "Storage connection test failed"
            );
        }
        Ok(report)
    }

    // Files

    pub async fn upload_file(
        &self,
        connection_id: Uuid,
        local_path: &Path,
        raw_key: &str,
        cancel: CancellationToken,
    ) -> StorageResult<UploadOutcome> {
        let key = self.policy.normalize(raw_key)?;
        let provider = self.provider(connection_id, cancel).await?;
        let outcome = self.fallback.upload(&provider, local_path, &key).await?;
        self.cache.invalidate(connection_id, &key).await;
        Ok(outcome)
    }

    pub async fn download_file(
        &self,
        connection_id: Uuid,
        raw_key: &str,
        local_path: &Path,
        cancel: CancellationToken,
    ) -> StorageResult<()> {
        let key = self.policy.normalize(raw_key)?;
        let provider = self.provider(connection_id, cancel).await?;
        provider.download(&key, local_path).await
    }

    pub async fn delete_file(&self, connection_id: Uuid, raw_key: &str) -> StorageResult<()> {
        let key = self.policy.normalize(raw_key)?;
        let provider = self.provider(connection_id, CancellationToken::new()).await?;
        provider.delete(&key).await?;
        self.cache.invalidate(connection_id, &key).await;
        Ok(())
    }

    pub async fn exists(&self, connection_id: Uuid, raw_key: &str) -> StorageResult<bool> {
        let key = self.policy.normalize(raw_key)?;
        let provider = self.provider(connection_id, CancellationToken::new()).await?;
        provider.exists(&key).await
    }

    /// Keys under `raw_prefix`, relative to the connection root
    pub async fn list_keys(&self, connection_id: Uuid, raw_prefix: &str) -> StorageResult<KeyStream> {
        let prefix = self.policy.normalize_prefix(raw_prefix)?;
        let provider = self.provider(connection_id, CancellationToken::new()).await?;
        provider.list(&prefix).await
    }

    pub async fn get_public_url(&self, connection_id: Uuid, raw_key: &str) -> StorageResult<String> {
        let key = self.policy.normalize(raw_key)?;
        let provider = self.provider(connection_id, CancellationToken::new()).await?;
        Ok(provider.public_url(&key))
    }

    pub async fn get_presigned_upload_url(
        &self,
        connection_id: Uuid,
        raw_key: &str,
        ttl: Duration,
    ) -> StorageResult<String> {
        self.presigned(connection_id, raw_key, ttl, PresignMethod::Put)
            .await
    }

    pub async fn get_presigned_download_url(
        &self,
        connection_id: Uuid,
        raw_key: &str,
        ttl: Duration,
    ) -> StorageResult<String> {
        self.presigned(connection_id, raw_key, ttl, PresignMethod::Get)
            .await
    }

    async fn presigned(
        &self,
        connection_id: Uuid,
        raw_key: &str,
        ttl: Duration,
        method: PresignMethod,
    ) -> StorageResult<String> {
        let key: StorageKey = self.policy.normalize(raw_key)?;
        let provider = self.provider(connection_id, CancellationToken::new()).await?;
        provider.presigned_url(&key, ttl, method).await
    }

    /// Cached usage statistics for `raw_prefix`
    pub async fn get_usage_stats(
        &self,
        connection_id: Uuid,
        raw_prefix: &str,
    ) -> StorageResult<UsageStats> {
        let prefix = self.policy.normalize_prefix(raw_prefix)?;
        let connection = self.repository.get(connection_id).await?;
        if let Some(stats) = self.cache.get(connection_id, &prefix).await {
            return Ok(stats);
        }
        let provider = self.resilient(&connection, CancellationToken::new()).await?;
        self.cache
            .get_or_compute(connection_id, &prefix, || provider.usage_stats(&prefix))
            .await
    }

    pub fn breaker_snapshot(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshot()
    }
}
