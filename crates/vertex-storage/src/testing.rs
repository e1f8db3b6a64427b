//! Scripted provider for resilience unit tests.

use crate::path_policy::StorageKey;
use crate::traits::{
    ConnectionReport, KeyStream, PresignMethod, StorageError, StorageProvider, StorageResult,
    UsageStats,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use vertex_core::ProviderKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubReply {
    Ok,
    Transient,
    NotFound,
    InvalidCredentials,
    /// Never completes
    Hang,
}

/// Replies from a script, then `Ok` forever. Every backend call is counted.
#[derive(Debug, Default)]
pub struct StubProvider {
    script: Mutex<VecDeque<StubReply>>,
    calls: AtomicU32,
    uploaded: Mutex<Vec<StorageKey>>,
}

impl StubProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, replies: impl IntoIterator<Item = StubReply>) {
        self.script.lock().unwrap().extend(replies);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn uploaded(&self) -> Vec<StorageKey> {
        self.uploaded.lock().unwrap().clone()
    }

    async fn reply(&self) -> StorageResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front().unwrap_or(StubReply::Ok);
        match next {
            StubReply::Ok => Ok(()),
            StubReply::Transient => Err(StorageError::Transient("injected network fault".into())),
            StubReply::NotFound => Err(StorageError::NotFound("stub".into())),
            StubReply::InvalidCredentials => {
                Err(StorageError::InvalidCredentials("stub".into()))
            }
            StubReply::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl StorageProvider for StubProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ObjectStorage
    }

    async fn upload(&self, _local_path: &Path, key: &StorageKey) -> StorageResult<String> {
        self.reply().await?;
        self.uploaded.lock().unwrap().push(key.clone());
        Ok(self.public_url(key))
    }

    async fn download(&self, _key: &StorageKey, _local_path: &Path) -> StorageResult<()> {
        self.reply().await
    }

    async fn delete(&self, _key: &StorageKey) -> StorageResult<()> {
        self.reply().await
    }

    async fn exists(&self, _key: &StorageKey) -> StorageResult<bool> {
        self.reply().await.map(|_| true)
    }

    async fn list(&self, _prefix: &StorageKey) -> StorageResult<KeyStream> {
        self.reply().await?;
        let keys = self.uploaded();
        Ok(futures::stream::iter(keys.into_iter().map(Ok)).boxed())
    }

    fn public_url(&self, key: &StorageKey) -> String {
        format!("stub://{}", key)
    }

    async fn presigned_url(
        &self,
        _key: &StorageKey,
        _ttl: Duration,
        _method: PresignMethod,
    ) -> StorageResult<String> {
        Err(StorageError::Unsupported("stub".into()))
    }

    async fn usage_stats(&self, _prefix: &StorageKey) -> StorageResult<UsageStats> {
        self.reply().await?;
        Ok(UsageStats {
            file_count: self.uploaded.lock().unwrap().len() as u64,
            total_bytes: 0,
        })
    }

    async fn test_connection(&self) -> ConnectionReport {
        ConnectionReport::success("stub")
    }
}
