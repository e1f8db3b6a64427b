//! Two-tier cache for usage statistics.
//!
//! Lookup order is memory → disk → provider. The memory tier is a bounded LRU
//! with a short TTL; the disk tier keeps one JSON file per `(connection, prefix)`
//! and survives restarts. Disk tier failures are logged and treated as misses.

use crate::path_policy::StorageKey;
use crate::traits::{StorageResult, UsageStats};
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;
use vertex_core::StorageConfig;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub memory_capacity: usize,
    pub memory_ttl: Duration,
    pub disk_ttl: Duration,
    /// Disk tier directory; `None` disables the disk tier
    pub disk_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 100,
            memory_ttl: Duration::from_secs(60),
            disk_ttl: Duration::from_secs(24 * 60 * 60),
            disk_dir: None,
        }
    }
}

impl From<&StorageConfig> for CacheConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            memory_capacity: config.cache_memory_capacity,
            memory_ttl: Duration::from_secs(config.cache_memory_ttl_secs),
            disk_ttl: Duration::from_secs(config.cache_disk_ttl_secs),
            disk_dir: config.cache_dir.clone(),
        }
    }
}

/// Disk tier record
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UsageStatsEntry {
    connection_id: Uuid,
    prefix: String,
    file_count: u64,
    total_bytes: u64,
    computed_at: DateTime<Utc>,
}

type MemoryKey = (Uuid, String);

struct MemoryTier {
    entries: LruCache<MemoryKey, (UsageStats, Instant)>,
    /// Bumped by every invalidation of a connection. A result computed across
    /// a bump may predate the write and is not stored.
    epochs: HashMap<Uuid, u64>,
}

impl MemoryTier {
    fn epoch(&self, connection_id: Uuid) -> u64 {
        self.epochs.get(&connection_id).copied().unwrap_or(0)
    }
}

pub struct UsageStatsCache {
    memory: Mutex<MemoryTier>,
    config: CacheConfig,
}

impl UsageStatsCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.memory_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            memory: Mutex::new(MemoryTier {
                entries: LruCache::new(capacity),
                epochs: HashMap::new(),
            }),
            config,
        }
    }

    /// Cached stats for `prefix`, computing and storing them on a miss.
    pub async fn get_or_compute<F, Fut>(
        &self,
        connection_id: Uuid,
        prefix: &StorageKey,
        compute: F,
    ) -> StorageResult<UsageStats>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<UsageStats>>,
    {
        if let Some(stats) = self.get(connection_id, prefix).await {
            return Ok(stats);
        }

        let epoch = self.epoch(connection_id).await;
        let stats = compute().await?;
        self.store(connection_id, prefix, stats, epoch).await;
        Ok(stats)
    }

    async fn epoch(&self, connection_id: Uuid) -> u64 {
        self.memory.lock().await.epoch(connection_id)
    }

    /// Memory tier, then disk tier. A disk hit is promoted into memory.
    pub async fn get(&self, connection_id: Uuid, prefix: &StorageKey) -> Option<UsageStats> {
        let memory_key = (connection_id, prefix.as_str().to_string());
        {
            let mut memory = self.memory.lock().await;
            match memory.entries.get(&memory_key) {
                Some((stats, stored_at)) if stored_at.elapsed() < self.config.memory_ttl => {
                    tracing::trace!(
                        connection_id = %connection_id,
                        prefix = %prefix,
                        "Usage stats memory cache hit"
                    );
                    return Some(*stats);
                }
                Some(_) => {
                    memory.entries.pop(&memory_key);
                }
                None => {}
            }
        }

        let epoch = self.epoch(connection_id).await;
        let stats = self.read_disk(connection_id, prefix).await?;
        tracing::debug!(
            connection_id = %connection_id,
            prefix = %prefix,
            "Usage stats disk cache hit"
        );
        let mut memory = self.memory.lock().await;
        if memory.epoch(connection_id) == epoch {
            memory.entries.put(memory_key, (stats, Instant::now()));
        }
        Some(stats)
    }

    pub async fn put(&self, connection_id: Uuid, prefix: &StorageKey, stats: UsageStats) {
        let epoch = self.epoch(connection_id).await;
        self.store(connection_id, prefix, stats, epoch).await;
    }

    /// Store `stats` in both tiers unless the connection was invalidated
    /// since `epoch`.
    async fn store(
        &self,
        connection_id: Uuid,
        prefix: &StorageKey,
        stats: UsageStats,
        epoch: u64,
    ) {
        {
            let mut memory = self.memory.lock().await;
            if memory.epoch(connection_id) != epoch {
                tracing::debug!(
                    connection_id = %connection_id,
                    prefix = %prefix,
                    "Usage stats invalidated during computation, not cached"
                );
                return;
            }
            memory
                .entries
                .put((connection_id, prefix.as_str().to_string()), (stats, Instant::now()));
        }

        self.write_disk(connection_id, prefix, stats).await;

        // An invalidation that ran while the file was written may have
        // removed it before it existed.
        if self.epoch(connection_id).await != epoch {
            self.remove_disk(connection_id, prefix).await;
        }
    }

    /// Drop every cached entry that covers `key`: the key itself and each
    /// parent prefix up to the root. Unrelated prefixes are untouched.
    pub async fn invalidate(&self, connection_id: Uuid, key: &StorageKey) {
        let mut affected = vec![key.clone()];
        affected.extend(key.ancestors());

        {
            let mut memory = self.memory.lock().await;
            *memory.epochs.entry(connection_id).or_insert(0) += 1;
            for prefix in &affected {
                memory
                    .entries
                    .pop(&(connection_id, prefix.as_str().to_string()));
            }
        }

        for prefix in &affected {
            self.remove_disk(connection_id, prefix).await;
        }

        tracing::debug!(
            connection_id = %connection_id,
            key = %key,
            prefixes = affected.len(),
            "Usage stats cache invalidated"
        );
    }

    async fn remove_disk(&self, connection_id: Uuid, prefix: &StorageKey) {
        let Some(path) = self.disk_path(connection_id, prefix) else {
            return;
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                error = %e,
                path = %path.display(),
                "Failed to remove usage stats cache file"
            ),
        }
    }

    fn disk_path(&self, connection_id: Uuid, prefix: &StorageKey) -> Option<PathBuf> {
        let dir = self.config.disk_dir.as_ref()?;
        let digest = hex::encode(Sha256::digest(prefix.as_str().as_bytes()));
        Some(
            dir.join(connection_id.to_string())
                .join(format!("{}.json", digest)),
        )
    }

    async fn read_disk(&self, connection_id: Uuid, prefix: &StorageKey) -> Option<UsageStats> {
        let path = self.disk_path(connection_id, prefix)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "Failed to read usage stats cache");
                return None;
            }
        };

        let entry: UsageStatsEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "Corrupt usage stats cache file");
                let _ = tokio::fs::remove_file(&path).await;
                return None;
            }
        };

        // Guards against digest collisions.
        if entry.connection_id != connection_id || entry.prefix != prefix.as_str() {
            return None;
        }

        let age = Utc::now().signed_duration_since(entry.computed_at);
        let fresh = age
            .to_std()
            .map(|age| age < self.config.disk_ttl)
            .unwrap_or(true);
        if !fresh {
            return None;
        }

        Some(UsageStats {
            file_count: entry.file_count,
            total_bytes: entry.total_bytes,
        })
    }

    async fn write_disk(&self, connection_id: Uuid, prefix: &StorageKey, stats: UsageStats) {
        let Some(path) = self.disk_path(connection_id, prefix) else {
            return;
        };
        let entry = UsageStatsEntry {
            connection_id,
            prefix: prefix.as_str().to_string(),
            file_count: stats.file_count,
            total_bytes: stats.total_bytes,
            computed_at: Utc::now(),
        };

        if let Err(e) = write_atomically(&path, &entry).await {
            tracing::warn!(
                error = %e,
                path = %path.display(),
                "Failed to write usage stats cache"
            );
        }
    }
}

async fn write_atomically(path: &std::path::Path, entry: &UsageStatsEntry) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec(entry)?;
    let temp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&temp, body).await?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_policy::PathPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn prefix(raw: &str) -> StorageKey {
        PathPolicy::default().normalize_prefix(raw).unwrap()
    }

    fn stats(n: u64) -> UsageStats {
        UsageStats {
            file_count: n,
            total_bytes: n * 10,
        }
    }

    fn cache(dir: Option<PathBuf>) -> UsageStatsCache {
        UsageStatsCache::new(CacheConfig {
            disk_dir: dir,
            ..CacheConfig::default()
        })
    }

    #[tokio::test]
    async fn test_computes_once_then_hits_memory() {
        let cache = cache(None);
        let id = Uuid::new_v4();
        let computed = AtomicU32::new(0);

        for _ in 0..3 {
            let result = cache
                .get_or_compute(id, &prefix("a"), || async {
                    computed.fetch_add(1, Ordering::SeqCst);
                    Ok(stats(3))
                })
                .await
                .unwrap();
            assert_eq!(result, stats(3));
        }
        assert_eq!(computed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_compute_errors_are_not_cached() {
        let cache = cache(None);
        let id = Uuid::new_v4();

        let result = cache
            .get_or_compute(id, &prefix("a"), || async {
                Err::<UsageStats, _>(crate::traits::StorageError::Transient("down".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(cache.get(id, &prefix("a")).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_entries_expire() {
        let cache = cache(None);
        let id = Uuid::new_v4();
        cache.put(id, &prefix("a"), stats(1)).await;

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get(id, &prefix("a")).await, Some(stats(1)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(id, &prefix("a")).await, None);
    }

    #[tokio::test]
    async fn test_disk_tier_survives_restart() {
        let dir = tempdir().unwrap();
        let id = Uuid::new_v4();

        cache(Some(dir.path().to_path_buf()))
            .put(id, &prefix("VertexAR/ProjectX"), stats(7))
            .await;

        let restarted = cache(Some(dir.path().to_path_buf()));
        let computed = AtomicU32::new(0);
        let result = restarted
            .get_or_compute(id, &prefix("VertexAR/ProjectX"), || async {
                computed.fetch_add(1, Ordering::SeqCst);
                Ok(stats(0))
            })
            .await
            .unwrap();
        assert_eq!(result, stats(7));
        assert_eq!(computed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_disk_entries_are_ignored() {
        let dir = tempdir().unwrap();
        let id = Uuid::new_v4();
        let writer = cache(Some(dir.path().to_path_buf()));
        writer.put(id, &prefix("a"), stats(1)).await;

        let reader = UsageStatsCache::new(CacheConfig {
            disk_dir: Some(dir.path().to_path_buf()),
            disk_ttl: Duration::ZERO,
            ..CacheConfig::default()
        });
        assert!(reader.get(id, &prefix("a")).await.is_none());
    }

    #[tokio::test]
    async fn test_write_invalidates_parent_prefixes_only() {
        let dir = tempdir().unwrap();
        let cache = cache(Some(dir.path().to_path_buf()));
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();

        for p in ["a/b", "a", "", "x", "a/bc"] {
            cache.put(id, &prefix(p), stats(1)).await;
        }
        cache.put(other, &prefix("a"), stats(1)).await;

        let written = PathPolicy::default().normalize("a/b/c.jpg").unwrap();
        cache.invalidate(id, &written).await;

        assert!(cache.get(id, &prefix("a/b")).await.is_none());
        assert!(cache.get(id, &prefix("a")).await.is_none());
        assert!(cache.get(id, &prefix("")).await.is_none());
        assert_eq!(cache.get(id, &prefix("x")).await, Some(stats(1)));
        assert_eq!(cache.get(id, &prefix("a/bc")).await, Some(stats(1)));
        assert_eq!(cache.get(other, &prefix("a")).await, Some(stats(1)));
    }

    #[tokio::test]
    async fn test_write_during_computation_discards_result() {
        let cache = cache(None);
        let id = Uuid::new_v4();
        let (release, released) = tokio::sync::oneshot::channel::<()>();

        let scan_prefix = prefix("a");
        let scan = cache.get_or_compute(id, &scan_prefix, || async move {
            released.await.unwrap();
            Ok(stats(1))
        });
        let write = async {
            let written = PathPolicy::default().normalize("a/new.bin").unwrap();
            cache.invalidate(id, &written).await;
            release.send(()).unwrap();
        };
        let (scanned, ()) = tokio::join!(scan, write);

        // The caller still gets its answer; it is just not kept.
        assert_eq!(scanned.unwrap(), stats(1));
        assert!(cache.get(id, &prefix("a")).await.is_none());

        cache
            .get_or_compute(id, &prefix("a"), || async { Ok(stats(2)) })
            .await
            .unwrap();
        assert_eq!(cache.get(id, &prefix("a")).await, Some(stats(2)));
    }

    #[tokio::test]
    async fn test_write_during_computation_leaves_no_disk_entry() {
        let dir = tempdir().unwrap();
        let cache = cache(Some(dir.path().to_path_buf()));
        let id = Uuid::new_v4();
        let (release, released) = tokio::sync::oneshot::channel::<()>();
        let (started, scan_started) = tokio::sync::oneshot::channel::<()>();

        let scan_prefix = prefix("a");
        let scan = cache.get_or_compute(id, &scan_prefix, || async move {
            started.send(()).unwrap();
            released.await.unwrap();
            Ok(stats(1))
        });
        let write = async {
            scan_started.await.unwrap();
            let written = PathPolicy::default().normalize("a/new.bin").unwrap();
            cache.invalidate(id, &written).await;
            release.send(()).unwrap();
        };
        tokio::join!(scan, write).0.unwrap();

        let restarted = UsageStatsCache::new(CacheConfig {
            disk_dir: Some(dir.path().to_path_buf()),
            ..CacheConfig::default()
        });
        assert!(restarted.get(id, &prefix("a")).await.is_none());
    }

    #[tokio::test]
    async fn test_lru_is_bounded() {
        let cache = UsageStatsCache::new(CacheConfig {
            memory_capacity: 2,
            ..CacheConfig::default()
        });
        let id = Uuid::new_v4();
        cache.put(id, &prefix("a"), stats(1)).await;
        cache.put(id, &prefix("b"), stats(2)).await;
        cache.put(id, &prefix("c"), stats(3)).await;

        assert!(cache.get(id, &prefix("a")).await.is_none());
        assert_eq!(cache.get(id, &prefix("c")).await, Some(stats(3)));
    }

    #[tokio::test]
    async fn test_corrupt_disk_entry_is_a_miss() {
        let dir = tempdir().unwrap();
        let cache = cache(Some(dir.path().to_path_buf()));
        let id = Uuid::new_v4();
        let path = cache.disk_path(id, &prefix("a")).unwrap();
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"{not json").await.unwrap();

        assert!(cache.get(id, &prefix("a")).await.is_none());
        assert!(!path.exists());
    }
}
