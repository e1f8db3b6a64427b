//! Test helpers: fake backends and fault injection for integration tests.
//!
//! Run from workspace root: `cargo test -p vertex-storage --test resilience_test`.

#![allow(dead_code)]

use async_trait::async_trait;
use object_store::memory::InMemory;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vertex_storage::{
    ConnectionReport, KeyStream, ObjectStorageOptions, ObjectStorageProvider, PresignMethod,
    ProviderKind, StorageError, StorageKey, StorageProvider, StorageResult, UsageStats,
};

/// Object storage provider over an in-memory bucket.
pub fn fake_object_storage(bucket: &str) -> ObjectStorageProvider {
    ObjectStorageProvider::with_store(
        Arc::new(InMemory::new()),
        ObjectStorageOptions {
            bucket: bucket.to_string(),
            public_base_url: format!("http://fake:9000/{}", bucket),
            root: StorageKey::root(),
            multipart_threshold: 8 * 1024 * 1024,
            presigned_max_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        },
    )
}

/// Write `body` to a fresh file inside `dir`.
pub async fn source_file(dir: &TempDir, body: &[u8]) -> PathBuf {
    let path = dir.path().join(format!("src-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&path, body).await.unwrap();
    path
}

/// Wraps a provider with a switchable network partition.
///
/// While partitioned every backend call fails with `Transient` without
/// reaching the wrapped provider. All backend calls are counted either way.
pub struct PartitionedProvider {
    inner: Arc<dyn StorageProvider>,
    partitioned: AtomicBool,
    attempts: AtomicU32,
}

impl PartitionedProvider {
    pub fn new(inner: Arc<dyn StorageProvider>) -> Self {
        Self {
            inner,
            partitioned: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn set_partitioned(&self, partitioned: bool) {
        self.partitioned.store(partitioned, Ordering::SeqCst);
    }

    /// Backend calls attempted so far
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn attempt(&self) -> StorageResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.partitioned.load(Ordering::SeqCst) {
            return Err(StorageError::Transient(
                "connection reset by peer".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for PartitionedProvider {
    fn kind(&self) -> ProviderKind {
        self.inner.kind()
    }

    async fn upload(&self, local_path: &Path, key: &StorageKey) -> StorageResult<String> {
        self.attempt()?;
        self.inner.upload(local_path, key).await
    }

    async fn download(&self, key: &StorageKey, local_path: &Path) -> StorageResult<()> {
        self.attempt()?;
        self.inner.download(key, local_path).await
    }

    async fn delete(&self, key: &StorageKey) -> StorageResult<()> {
        self.attempt()?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &StorageKey) -> StorageResult<bool> {
        self.attempt()?;
        self.inner.exists(key).await
    }

    async fn list(&self, prefix: &StorageKey) -> StorageResult<KeyStream> {
        self.attempt()?;
        self.inner.list(prefix).await
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
        self.attempt()?;
        self.inner.usage_stats(prefix).await
    }

    async fn test_connection(&self) -> ConnectionReport {
        self.inner.test_connection().await
    }
}
