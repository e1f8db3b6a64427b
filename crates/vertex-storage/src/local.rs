use crate::path_policy::StorageKey;
use crate::traits::{
    ConnectionReport, KeyStream, PresignMethod, StorageError, StorageProvider, StorageResult,
    UsageStats,
};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use uuid::Uuid;
use vertex_core::ProviderKind;

/// Suffix of in-flight upload files; they are skipped by listings.
const PARTIAL_SUFFIX: &str = ".vertex-upload";

/// Local filesystem storage implementation
#[derive(Clone, Debug)]
pub struct LocalDiskProvider {
    base_path: PathBuf,
    base_url: String,
}

impl LocalDiskProvider {
    /// Create a new LocalDiskProvider instance
    ///
    /// # Arguments
    /// * `base_path` - Root directory for file storage (e.g., "/var/lib/vertex/storage")
    /// * `base_url` - Base URL for serving files (e.g., "http://localhost:8000/storage/<connection>")
    pub async fn new(base_path: impl Into<PathBuf>, base_url: String) -> StorageResult<Self> {
        let base_path = base_path.into();

        fs::create_dir_all(&base_path).await.map_err(|e| {
            StorageError::InvalidCredentials(format!(
                "Failed to create storage directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        Ok(LocalDiskProvider {
            base_path,
            base_url,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Convert storage key to filesystem path
    ///
    /// Keys are already free of `..` and absolute prefixes; this additionally
    /// refuses keys that resolve outside the root through a symlink. For a key
    /// that does not exist yet, its nearest existing ancestor is checked, so
    /// nothing is created below a symlinked directory pointing elsewhere.
    fn key_to_path(&self, key: &StorageKey) -> StorageResult<PathBuf> {
        let path = self.base_path.join(key.as_str());
        let base_canonical = self.base_path.canonicalize().map_err(|e| {
            StorageError::Backend(format!(
                "Failed to canonicalize base path {}: {}",
                self.base_path.display(),
                e
            ))
        })?;

        let mut current = Some(path.as_path());
        while let Some(candidate) = current {
            if let Ok(canonical) = candidate.canonicalize() {
                if canonical.strip_prefix(&base_canonical).is_err() {
                    return Err(StorageError::InvalidKey(
                        "Storage key resolves outside storage directory".to_string(),
                    ));
                }
                break;
            }
            current = candidate.parent();
        }

        Ok(path)
    }

    /// Ensure parent directory exists
    async fn ensure_parent_dir(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Walk every regular file under `start`, yielding its key and size.
    fn walk(&self, start: PathBuf) -> BoxStream<'static, StorageResult<(StorageKey, u64)>> {
        let state = WalkState {
            root: self.base_path.clone(),
            pending: vec![start],
            current: None,
            done: false,
        };

        stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            loop {
                if state.current.is_none() {
                    let dir = state.pending.pop()?;
                    match fs::read_dir(&dir).await {
                        Ok(reader) => state.current = Some(reader),
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => {
                            state.done = true;
                            return Some((Err(e.into()), state));
                        }
                    }
                }

                let Some(reader) = state.current.as_mut() else {
                    continue;
                };

                match reader.next_entry().await {
                    Ok(Some(entry)) => {
                        let path = entry.path();
                        let metadata = match entry.metadata().await {
                            Ok(m) => m,
                            // Removed between readdir and stat.
                            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                            Err(e) => {
                                state.done = true;
                                return Some((Err(e.into()), state));
                            }
                        };
                        if metadata.is_dir() {
                            state.pending.push(path);
                            continue;
                        }
                        if !metadata.is_file() || is_partial_upload(&path) {
                            continue;
                        }
                        if let Some(key) = relative_key(&state.root, &path) {
                            return Some((Ok((key, metadata.len())), state));
                        }
                    }
                    Ok(None) => state.current = None,
                    Err(e) => {
                        state.done = true;
                        return Some((Err(e.into()), state));
                    }
                }
            }
        })
        .boxed()
    }

    /// Files under `prefix`, or the single file when `prefix` names one.
    async fn files_under(
        &self,
        prefix: &StorageKey,
    ) -> StorageResult<BoxStream<'static, StorageResult<(StorageKey, u64)>>> {
        let start = self.key_to_path(prefix)?;
        match fs::metadata(&start).await {
            Ok(meta) if meta.is_file() => {
                Ok(stream::once(futures::future::ready(Ok((prefix.clone(), meta.len())))).boxed())
            }
            Ok(_) => Ok(self.walk(start)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(stream::empty().boxed()),
            Err(e) => Err(e.into()),
        }
    }

    fn free_space(&self) -> Option<u64> {
        let base = self.base_path.canonicalize().ok()?;
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| base.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

struct WalkState {
    root: PathBuf,
    pending: Vec<PathBuf>,
    current: Option<fs::ReadDir>,
    done: bool,
}

fn is_partial_upload(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.ends_with(PARTIAL_SUFFIX))
        .unwrap_or(false)
}

fn relative_key(root: &Path, path: &Path) -> Option<StorageKey> {
    let relative = path.strip_prefix(root).ok()?;
    let joined = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() {
        None
    } else {
        Some(StorageKey::from_listing(joined))
    }
}

#[async_trait]
impl StorageProvider for LocalDiskProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn upload(&self, local_path: &Path, key: &StorageKey) -> StorageResult<String> {
        let path = self.key_to_path(key)?;
        let start = Instant::now();

        self.ensure_parent_dir(&path).await?;

        let file_name = key.file_name().unwrap_or("upload");
        let temp_path = path.with_file_name(format!(
            ".{}.{}{}",
            file_name,
            Uuid::new_v4().simple(),
            PARTIAL_SUFFIX
        ));

        let size = fs::copy(local_path, &temp_path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound && !local_path.exists() {
                StorageError::NotFound(format!("source file {}", local_path.display()))
            } else {
                tracing::error!(
                    error = %e,
                    path = %path.display(),
                    key = %key,
                    "Local storage upload failed"
                );
                StorageError::from(e)
            }
        })?;

        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        let url = self.public_url(key);

        tracing::info!(
            path = %path.display(),
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage upload successful"
        );

        Ok(url)
    }

    async fn download(&self, key: &StorageKey, local_path: &Path) -> StorageResult<()> {
        let path = self.key_to_path(key)?;
        let start = Instant::now();

        if !fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let size = fs::copy(&path, local_path).await.map_err(|e| {
            tracing::error!(
                error = %e,
                path = %path.display(),
                key = %key,
                "Local storage download failed"
            );
            match e.kind() {
                io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
                _ => StorageError::from(e),
            }
        })?;

        tracing::info!(
            path = %path.display(),
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage download successful"
        );

        Ok(())
    }

    async fn delete(&self, key: &StorageKey) -> StorageResult<()> {
        let path = self.key_to_path(key)?;
        let start = Instant::now();

        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    path = %path.display(),
                    key = %key,
                    "Local storage delete failed"
                );
                return Err(e.into());
            }
        }

        tracing::info!(
            path = %path.display(),
            key = %key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage delete successful"
        );

        Ok(())
    }

    async fn exists(&self, key: &StorageKey) -> StorageResult<bool> {
        let path = self.key_to_path(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &StorageKey) -> StorageResult<KeyStream> {
        let files = self.files_under(prefix).await?;
        Ok(files.map_ok(|(key, _)| key).boxed())
    }

    fn public_url(&self, key: &StorageKey) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key.url_path())
    }

    async fn presigned_url(
        &self,
        key: &StorageKey,
        _ttl: Duration,
        method: PresignMethod,
    ) -> StorageResult<String> {
        match method {
            PresignMethod::Get => Ok(self.public_url(key)),
            PresignMethod::Put => Err(StorageError::Unsupported(
                "presigned uploads are not available for local storage".to_string(),
            )),
        }
    }

    async fn usage_stats(&self, prefix: &StorageKey) -> StorageResult<UsageStats> {
        let start = Instant::now();
        let stats = self
            .files_under(prefix)
            .await?
            .try_fold(UsageStats::default(), |mut acc, (_, size)| async move {
                acc.file_count += 1;
                acc.total_bytes += size;
                Ok(acc)
            })
            .await?;

        tracing::debug!(
            prefix = %prefix,
            file_count = stats.file_count,
            total_bytes = stats.total_bytes,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage usage computed"
        );

        Ok(stats)
    }

    async fn test_connection(&self) -> ConnectionReport {
        match fs::metadata(&self.base_path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return ConnectionReport::failure(format!(
                    "{} is not a directory",
                    self.base_path.display()
                ))
            }
            Err(e) => {
                return ConnectionReport::failure(format!(
                    "Storage directory {} is not accessible: {}",
                    self.base_path.display(),
                    e
                ))
            }
        }

        let marker = self
            .base_path
            .join(format!(".vertex-write-check-{}", Uuid::new_v4().simple()));
        if let Err(e) = fs::write(&marker, b"ok").await {
            return ConnectionReport::failure(format!(
                "Storage directory {} is not writable: {}",
                self.base_path.display(),
                e
            ));
        }
        if let Err(e) = fs::remove_file(&marker).await {
            tracing::warn!(
                error = %e,
                path = %marker.display(),
                "Failed to remove write check file"
            );
        }

        let provider = self.clone();
        let free_bytes = tokio::task::spawn_blocking(move || provider.free_space())
            .await
            .ok()
            .flatten();

        ConnectionReport {
            ok: true,
            detail: format!("Local storage at {} is writable", self.base_path.display()),
            free_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_policy::PathPolicy;
    use futures::TryStreamExt;
    use tempfile::tempdir;

    fn key(raw: &str) -> StorageKey {
        PathPolicy::default().normalize(raw).unwrap()
    }

    async fn provider(dir: &Path) -> LocalDiskProvider {
        LocalDiskProvider::new(dir.join("root"), "http://localhost:8000/storage/c1".to_string())
            .await
            .unwrap()
    }

    async fn source_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, data).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_local_upload_download_round_trip() {
        let dir = tempdir().unwrap();
        let storage = provider(dir.path()).await;
        let data = b"\x00\x01binary payload\xff".to_vec();
        let src = source_file(dir.path(), "in.bin", &data).await;

        let url = storage
            .upload(&src, &key("VertexAR/ProjectX/ORD-001/photo.jpg"))
            .await
            .unwrap();
        assert_eq!(
            url,
            "http://localhost:8000/storage/c1/VertexAR/ProjectX/ORD-001/photo.jpg"
        );

        let out = dir.path().join("out/photo.jpg");
        storage
            .download(&key("VertexAR/ProjectX/ORD-001/photo.jpg"), &out)
            .await
            .unwrap();
        assert_eq!(fs::read(&out).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_local_upload_overwrites() {
        let dir = tempdir().unwrap();
        let storage = provider(dir.path()).await;
        let first = source_file(dir.path(), "a.txt", b"first").await;
        let second = source_file(dir.path(), "b.txt", b"second").await;

        storage.upload(&first, &key("doc.txt")).await.unwrap();
        storage.upload(&second, &key("doc.txt")).await.unwrap();

        let out = dir.path().join("doc.txt");
        storage.download(&key("doc.txt"), &out).await.unwrap();
        assert_eq!(fs::read(&out).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_local_download_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let storage = provider(dir.path()).await;

        let result = storage
            .download(&key("missing.txt"), &dir.path().join("x"))
            .await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_local_delete_nonexistent() {
        let dir = tempdir().unwrap();
        let storage = provider(dir.path()).await;

        let result = storage.delete(&key("nonexistent/file.txt")).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_local_exists() {
        let dir = tempdir().unwrap();
        let storage = provider(dir.path()).await;
        let src = source_file(dir.path(), "e.txt", b"test").await;

        storage.upload(&src, &key("a/exists.txt")).await.unwrap();

        assert!(storage.exists(&key("a/exists.txt")).await.unwrap());
        assert!(!storage.exists(&key("a/nonexistent.txt")).await.unwrap());
        // Directories are not files.
        assert!(!storage.exists(&key("a")).await.unwrap());
    }

    #[tokio::test]
    async fn test_local_list_and_usage() {
        let dir = tempdir().unwrap();
        let storage = provider(dir.path()).await;
        let src = source_file(dir.path(), "s.bin", b"12345").await;

        for k in ["p/a.jpg", "p/sub/b.jpg", "p/sub/deeper/c.jpg", "q/other.jpg"] {
            storage.upload(&src, &key(k)).await.unwrap();
        }

        let prefix = PathPolicy::default().normalize_prefix("p").unwrap();
        let mut keys: Vec<String> = storage
            .list(&prefix)
            .await
            .unwrap()
            .map_ok(|k| k.to_string())
            .try_collect()
            .await
            .unwrap();
        keys.sort();
        assert_eq!(keys, vec!["p/a.jpg", "p/sub/b.jpg", "p/sub/deeper/c.jpg"]);

        let stats = storage.usage_stats(&prefix).await.unwrap();
        assert_eq!(stats.file_count, 3);
        assert_eq!(stats.total_bytes, 15);

        let all = storage.usage_stats(&StorageKey::root()).await.unwrap();
        assert_eq!(all.file_count, 4);

        let missing = PathPolicy::default().normalize_prefix("nope").unwrap();
        assert_eq!(
            storage.usage_stats(&missing).await.unwrap(),
            UsageStats::default()
        );
    }

    #[tokio::test]
    async fn test_local_list_can_stop_early() {
        let dir = tempdir().unwrap();
        let storage = provider(dir.path()).await;
        let src = source_file(dir.path(), "s.bin", b"x").await;
        for i in 0..10 {
            storage.upload(&src, &key(&format!("many/{i}.bin"))).await.unwrap();
        }

        let mut stream = storage.list(&StorageKey::root()).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(first.as_str().starts_with("many/"));
        drop(stream);

        let count = storage.list(&StorageKey::root()).await.unwrap().count().await;
        assert_eq!(count, 10);
    }

    #[tokio::test]
    async fn test_local_presigned_put_unsupported() {
        let dir = tempdir().unwrap();
        let storage = provider(dir.path()).await;

        let get = storage
            .presigned_url(&key("a.jpg"), Duration::from_secs(60), PresignMethod::Get)
            .await
            .unwrap();
        assert_eq!(get, storage.public_url(&key("a.jpg")));

        let put = storage
            .presigned_url(&key("a.jpg"), Duration::from_secs(60), PresignMethod::Put)
            .await;
        assert!(matches!(put, Err(StorageError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_local_test_connection() {
        let dir = tempdir().unwrap();
        let storage = provider(dir.path()).await;

        let report = storage.test_connection().await;
        assert!(report.ok, "{}", report.detail);

        fs::remove_dir_all(storage.base_path()).await.unwrap();
        let report = storage.test_connection().await;
        assert!(!report.ok);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_rejected() {
        let dir = tempdir().unwrap();
        let storage = provider(dir.path()).await;
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).await.unwrap();
        fs::write(outside.join("secret.txt"), b"s").await.unwrap();
        std::os::unix::fs::symlink(&outside, storage.base_path().join("link")).unwrap();

        let result = storage
            .download(&key("link/secret.txt"), &dir.path().join("x"))
            .await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_upload_below_symlinked_directory_rejected() {
        let dir = tempdir().unwrap();
        let storage = provider(dir.path()).await;
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).await.unwrap();
        std::os::unix::fs::symlink(&outside, storage.base_path().join("link")).unwrap();
        let src = dir.path().join("src.txt");
        fs::write(&src, b"payload").await.unwrap();

        for raw in ["link/new.txt", "link/nested/deeper/new.txt"] {
            let result = storage.upload(&src, &key(raw)).await;
            assert!(matches!(result, Err(StorageError::InvalidKey(_))), "{raw}");
        }
        assert!(!outside.join("new.txt").exists());
        assert!(!outside.join("nested").exists());

        // Fresh directories inside the root are still fine.
        storage.upload(&src, &key("fresh/dir/new.txt")).await.unwrap();
    }
}
