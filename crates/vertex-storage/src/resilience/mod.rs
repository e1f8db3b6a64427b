//! Failure isolation around storage providers.
//!
//! Every backend call made through [`ResilientProvider`] runs as
//! retry → circuit breaker → per-attempt timeout → provider. Pure operations
//! (`public_url`, `presigned_url`) and connectivity checks bypass the breaker.

pub mod circuit;
pub mod fallback;
pub mod retry;

pub use circuit::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker, CircuitRegistry};
pub use fallback::{FallbackCoordinator, UploadOutcome};
pub use retry::{RetryConfig, RetryPolicy};

use crate::path_policy::StorageKey;
use crate::traits::{
    ConnectionReport, KeyStream, PresignMethod, StorageError, StorageProvider, StorageResult,
    UsageStats,
};
use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vertex_core::ProviderKind;

/// A provider wrapped in retry, circuit breaker and attempt timeout
#[derive(Clone)]
pub struct ResilientProvider {
    connection_id: Uuid,
    inner: Arc<dyn StorageProvider>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    attempt_timeout: Option<Duration>,
}

impl ResilientProvider {
    pub fn new(
        connection_id: Uuid,
        inner: Arc<dyn StorageProvider>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            connection_id,
            inner,
            breaker,
            retry,
            cancel: CancellationToken::new(),
            attempt_timeout: None,
        }
    }

    /// Bound each attempt; an attempt that runs out of time counts as `Transient`.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Same provider, calls abandoned with `Cancelled` once `cancel` fires
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    async fn guarded<T, F, Fut>(&self, operation: &'static str, op: F) -> StorageResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let breaker = &self.breaker;
        let timeout = self.attempt_timeout;
        let op = &op;
        self.retry
            .run(&self.cancel, operation, move |_| async move {
                breaker.call(within(timeout, op())).await
            })
            .await
    }
}

async fn within<T>(
    limit: Option<Duration>,
    attempt: impl Future<Output = StorageResult<T>>,
) -> StorageResult<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .unwrap_or_else(|_| {
                Err(StorageError::Transient(format!(
                    "attempt timed out after {}ms",
                    limit.as_millis()
                )))
            }),
        None => attempt.await,
    }
}

#[async_trait]
impl StorageProvider for ResilientProvider {
    fn kind(&self) -> ProviderKind {
        self.inner.kind()
    }

    async fn upload(&self, local_path: &Path, key: &StorageKey) -> StorageResult<String> {
        self.guarded("upload", || self.inner.upload(local_path, key))
            .await
    }

    async fn download(&self, key: &StorageKey, local_path: &Path) -> StorageResult<()> {
        self.guarded("download", || self.inner.download(key, local_path))
            .await
    }

    async fn delete(&self, key: &StorageKey) -> StorageResult<()> {
        self.guarded("delete", || self.inner.delete(key)).await
    }

    async fn exists(&self, key: &StorageKey) -> StorageResult<bool> {
        self.guarded("exists", || self.inner.exists(key)).await
    }

    /// Guards opening the listing; pages fetched later are not retried.
    async fn list(&self, prefix: &StorageKey) -> StorageResult<KeyStream> {
        self.guarded("list", || self.inner.list(prefix)).await
    }

    fn public_url(&self, key: &StorageKey) -> String {
        self.inner.public_url(key)
    }

    async fn presigned_url(
        &self,
        key: &StorageKey,
        ttl: Duration,
        method: PresignMethod,
    ) -> StorageResult<String> {
        self.inner.presigned_url(key, ttl, method).await
    }

    async fn usage_stats(&self, prefix: &StorageKey) -> StorageResult<UsageStats> {
        self.guarded("usage_stats", || self.inner.usage_stats(prefix))
            .await
    }

    async fn test_connection(&self) -> ConnectionReport {
        self.inner.test_connection().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_policy::PathPolicy;
    use crate::testing::{StubProvider, StubReply};

    fn key(raw: &str) -> StorageKey {
        PathPolicy::default().normalize(raw).unwrap()
    }

    fn resilient(stub: Arc<StubProvider>, attempts: u32, threshold: u32) -> ResilientProvider {
        let id = Uuid::new_v4();
        ResilientProvider::new(
            id,
            stub,
            Arc::new(CircuitBreaker::new(
                id,
                BreakerConfig {
                    failure_threshold: threshold,
                    cooldown: Duration::from_secs(30),
                },
            )),
            RetryPolicy::new(RetryConfig {
                max_attempts: attempts,
                ..RetryConfig::default()
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_through_breaker() {
        let stub = Arc::new(StubProvider::new());
        stub.script([StubReply::Transient, StubReply::Transient]);
        let provider = resilient(stub.clone(), 3, 5);

        assert!(provider.exists(&key("a.jpg")).await.unwrap());
        assert_eq!(stub.calls(), 3);
        assert_eq!(provider.breaker().state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opening_mid_retry_stops_attempts() {
        let stub = Arc::new(StubProvider::new());
        stub.script([StubReply::Transient; 5]);
        let provider = resilient(stub.clone(), 5, 2);

        let result = provider.exists(&key("a.jpg")).await;
        assert!(matches!(result, Err(StorageError::CircuitOpen { .. })));
        assert_eq!(stub.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_transient() {
        let stub = Arc::new(StubProvider::new());
        stub.script([StubReply::Hang]);
        let provider = resilient(stub.clone(), 2, 5).with_attempt_timeout(Duration::from_secs(1));

        assert!(provider.exists(&key("a.jpg")).await.unwrap());
        assert_eq!(stub.calls(), 2);
        assert_eq!(provider.breaker().snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_call_is_not_a_failure() {
        let stub = Arc::new(StubProvider::new());
        stub.script([StubReply::Hang]);
        let cancel = CancellationToken::new();
        let provider = resilient(stub.clone(), 3, 1).with_cancel(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = provider.exists(&key("a.jpg")).await;
        assert!(matches!(result, Err(StorageError::Cancelled)));
        assert_eq!(provider.breaker().state(), BreakerState::Closed);
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pure_operations_bypass_open_breaker() {
        let stub = Arc::new(StubProvider::new());
        stub.script([StubReply::Transient]);
        let provider = resilient(stub.clone(), 1, 1);

        provider.exists(&key("a.jpg")).await.unwrap_err();
        assert_eq!(provider.breaker().state(), BreakerState::Open);

        assert_eq!(provider.public_url(&key("a.jpg")), "stub://a.jpg");
        assert!(provider.test_connection().await.ok);
        assert!(matches!(
            provider.exists(&key("a.jpg")).await,
            Err(StorageError::CircuitOpen { .. })
        ));
    }
}
