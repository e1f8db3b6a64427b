use crate::path_policy::StorageKey;
use crate::traits::{
    guess_content_type, ConnectionReport, KeyStream, PresignMethod, StorageError,
    StorageProvider, StorageResult, UsageStats,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http::Method;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::Error as ObjectStoreError;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectStore, ObjectStoreExt, PutOptions, PutPayload,
    WriteMultipart,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use vertex_core::ProviderKind;

/// Read buffer used when streaming a file into a multipart upload
const MULTIPART_READ_BUFFER: usize = 1024 * 1024;
/// In-flight parts allowed before the writer waits
const MULTIPART_MAX_CONCURRENCY: usize = 4;

/// Connection parameters for an S3-compatible endpoint
#[derive(Clone)]
pub struct ObjectStorageSettings {
    /// Host (`minio:9000`) or full URL (`https://storage.yandexcloud.net`)
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub secure: bool,
    pub region: String,
}

impl std::fmt::Debug for ObjectStorageSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStorageSettings")
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("secret_key", &"***")
            .field("bucket", &self.bucket)
            .field("secure", &self.secure)
            .field("region", &self.region)
            .finish()
    }
}

impl ObjectStorageSettings {
    /// Endpoint with a scheme, honouring `secure` when none is given
    pub fn endpoint_url(&self) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else if self.secure {
            format!("https://{}", endpoint)
        } else {
            format!("http://{}", endpoint)
        }
    }

    /// Build a signing S3 client. No network I/O happens here.
    pub fn build_client(&self) -> StorageResult<AmazonS3> {
        let endpoint = self.endpoint_url();
        AmazonS3Builder::new()
            .with_endpoint(endpoint.clone())
            .with_allow_http(endpoint.starts_with("http://"))
            .with_access_key_id(self.access_key.clone())
            .with_secret_access_key(self.secret_key.clone())
            .with_bucket_name(self.bucket.clone())
            .with_region(self.region.clone())
            .with_virtual_hosted_style_request(false)
            .with_retry(object_store::RetryConfig {
                max_retries: 0,
                ..Default::default()
            })
            .build()
            .map_err(|e| StorageError::InvalidCredentials(e.to_string()))
    }
}

/// Per-connection behaviour of an [`ObjectStorageProvider`]
#[derive(Debug, Clone)]
pub struct ObjectStorageOptions {
    pub bucket: String,
    /// Prefix for public URLs, e.g. `http://minio:9000/media`
    pub public_base_url: String,
    /// Connection root inside the bucket
    pub root: StorageKey,
    /// Files larger than this use multipart upload
    pub multipart_threshold: u64,
    pub presigned_max_ttl: Duration,
}

/// S3-compatible object storage provider
#[derive(Clone)]
pub struct ObjectStorageProvider {
    store: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn Signer>>,
    options: ObjectStorageOptions,
}

impl ObjectStorageProvider {
    /// Provider over a (possibly shared) S3 client
    pub fn new(client: Arc<AmazonS3>, options: ObjectStorageOptions) -> Self {
        let store: Arc<dyn ObjectStore> = client.clone();
        let signer: Arc<dyn Signer> = client;
        Self {
            store,
            signer: Some(signer),
            options,
        }
    }

    /// Provider over any object store. Presigning is unavailable.
    pub fn with_store(store: Arc<dyn ObjectStore>, options: ObjectStorageOptions) -> Self {
        Self {
            store,
            signer: None,
            options,
        }
    }

    /// Normalized keys are already valid object paths; `parse` keeps them
    /// verbatim where `from` would percent-encode reserved characters.
    fn location(&self, key: &StorageKey) -> StorageResult<ObjectPath> {
        object_path(&self.options.root.join(key))
    }

    fn prefix_location(&self, prefix: &StorageKey) -> StorageResult<Option<ObjectPath>> {
        let full = self.options.root.join(prefix);
        if full.is_root() {
            Ok(None)
        } else {
            object_path(&full).map(Some)
        }
    }

    /// Key relative to the connection root for a listed object
    fn relative_key(&self, location: &ObjectPath) -> Option<StorageKey> {
        let full = StorageKey::from_listing(location.as_ref());
        full.strip_prefix(&self.options.root)
            .filter(|k| !k.is_root())
    }

    async fn put_small(&self, local_path: &Path, location: &ObjectPath) -> StorageResult<u64> {
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| source_error(local_path, e))?;
        let size = data.len() as u64;

        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::ContentType,
            AttributeValue::from(guess_content_type(local_path)),
        );
        let opts = PutOptions {
            attributes,
            ..Default::default()
        };

        self.store
            .put_opts(location, PutPayload::from(Bytes::from(data)), opts)
            .await
            .map_err(|e| map_store_error(e, location))?;

        Ok(size)
    }

    async fn put_multipart(&self, local_path: &Path, location: &ObjectPath) -> StorageResult<u64> {
        let mut file = tokio::fs::File::open(local_path)
            .await
            .map_err(|e| source_error(local_path, e))?;

        let upload = self
            .store
            .put_multipart(location)
            .await
            .map_err(|e| map_store_error(e, location))?;
        let mut writer = WriteMultipart::new(upload);
        let mut buf = vec![0u8; MULTIPART_READ_BUFFER];
        let mut size = 0u64;

        loop {
            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(e.into());
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = writer.wait_for_capacity(MULTIPART_MAX_CONCURRENCY).await {
                let _ = writer.abort().await;
                return Err(map_store_error(e, location));
            }
            writer.write(&buf[..n]);
            size += n as u64;
        }

        // A failed finish aborts the remaining parts itself.
        writer
            .finish()
            .await
            .map_err(|e| map_store_error(e, location))?;

        Ok(size)
    }

    /// Every object under `prefix`, with its size
    fn objects_under(
        &self,
        prefix: &StorageKey,
    ) -> StorageResult<futures::stream::BoxStream<'static, StorageResult<(StorageKey, u64)>>> {
        let provider = self.clone();
        let location = self.prefix_location(prefix)?;
        Ok(self
            .store
            .list(location.as_ref())
            .map_err(|e| map_store_error(e, &ObjectPath::from("")))
            .try_filter_map(move |meta| {
                let entry = provider
                    .relative_key(&meta.location)
                    .map(|key| (key, meta.size as u64));
                futures::future::ready(Ok(entry))
            })
            .boxed())
    }
}

fn object_path(key: &StorageKey) -> StorageResult<ObjectPath> {
    ObjectPath::parse(key.as_str()).map_err(|e| StorageError::InvalidKey(e.to_string()))
}

fn source_error(local_path: &Path, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(format!("source file {}", local_path.display()))
    } else {
        e.into()
    }
}

/// Translate object_store errors into the storage taxonomy
fn map_store_error(err: ObjectStoreError, location: &ObjectPath) -> StorageError {
    match err {
        ObjectStoreError::NotFound { .. } => StorageError::NotFound(location.to_string()),
        ObjectStoreError::NotSupported { .. } | ObjectStoreError::NotImplemented { .. } => {
            StorageError::Unsupported(err.to_string())
        }
        // HTTP, timeout and throttling failures surface as Generic. The client
        // does not retry; RetryPolicy owns that.
        ObjectStoreError::Generic { .. } => StorageError::Transient(err.to_string()),
        ObjectStoreError::Precondition { .. } | ObjectStoreError::AlreadyExists { .. } => {
            StorageError::Conflict(err.to_string())
        }
        other => StorageError::Backend(other.to_string()),
    }
}

#[async_trait]
impl StorageProvider for ObjectStorageProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ObjectStorage
    }

    async fn upload(&self, local_path: &Path, key: &StorageKey) -> StorageResult<String> {
        let location = self.location(key)?;
        let start = Instant::now();

        let file_size = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| source_error(local_path, e))?
            .len();
        let multipart = file_size > self.options.multipart_threshold;

        let result = if multipart {
            self.put_multipart(local_path, &location).await
        } else {
            self.put_small(local_path, &location).await
        };

        let size = result.inspect_err(|e| {
            tracing::error!(
                error = %e,
                bucket = %self.options.bucket,
                key = %location,
                size_bytes = file_size,
                multipart,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "S3 upload failed"
            );
        })?;

        let url = self.public_url(key);

        tracing::info!(
            bucket = %self.options.bucket,
            key = %location,
            size_bytes = size,
            multipart,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 upload successful"
        );

        Ok(url)
    }

    async fn download(&self, key: &StorageKey, local_path: &Path) -> StorageResult<()> {
        let start = Instant::now();
        let location = self.location(key)?;

        let result = self.store.get(&location).await.map_err(|e| match e {
            ObjectStoreError::NotFound { .. } => StorageError::NotFound(key.to_string()),
            other => {
                tracing::error!(
                    error = %other,
                    bucket = %self.options.bucket,
                    key = %location,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 download failed"
                );
                map_store_error(other, &location)
            }
        })?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(local_path).await?;
        let mut stream = result.into_stream();
        let mut size = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_store_error(e, &location))?;
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        tracing::info!(
            bucket = %self.options.bucket,
            key = %location,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 download successful"
        );

        Ok(())
    }

    async fn delete(&self, key: &StorageKey) -> StorageResult<()> {
        let start = Instant::now();
        let location = self.location(key)?;

        match self.store.delete(&location).await {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => {}
            Err(e) => {
                tracing::error!(
                    error = %e,
                    bucket = %self.options.bucket,
                    key = %location,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 delete failed"
                );
                return Err(map_store_error(e, &location));
            }
        }

        tracing::info!(
            bucket = %self.options.bucket,
            key = %location,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 delete successful"
        );

        Ok(())
    }

    async fn exists(&self, key: &StorageKey) -> StorageResult<bool> {
        let location = self.location(key)?;
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(ObjectStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(map_store_error(e, &location)),
        }
    }

    async fn list(&self, prefix: &StorageKey) -> StorageResult<KeyStream> {
        Ok(self
            .objects_under(prefix)?
            .map_ok(|(key, _)| key)
            .boxed())
    }

    /// Path-style URL: `{endpoint}/{bucket}/{root}/{key}`
    fn public_url(&self, key: &StorageKey) -> String {
        format!(
            "{}/{}",
            self.options.public_base_url.trim_end_matches('/'),
            self.options.root.join(key).url_path()
        )
    }

    async fn presigned_url(
        &self,
        key: &StorageKey,
        ttl: Duration,
        method: PresignMethod,
    ) -> StorageResult<String> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            StorageError::Unsupported("object store does not sign URLs".to_string())
        })?;
        let ttl = ttl.clamp(Duration::from_secs(1), self.options.presigned_max_ttl);
        let method = match method {
            PresignMethod::Get => Method::GET,
            PresignMethod::Put => Method::PUT,
        };
        let location = self.location(key)?;

        let url = signer
            .signed_url(method, &location, ttl)
            .await
            .map_err(|e| map_store_error(e, &location))?;

        Ok(url.to_string())
    }

    async fn usage_stats(&self, prefix: &StorageKey) -> StorageResult<UsageStats> {
        let start = Instant::now();
        let stats = self
            .objects_under(prefix)?
            .try_fold(UsageStats::default(), |mut acc, (_, size)| async move {
                acc.file_count += 1;
                acc.total_bytes += size;
                Ok(acc)
            })
            .await?;

        tracing::debug!(
            bucket = %self.options.bucket,
            prefix = %prefix,
            file_count = stats.file_count,
            total_bytes = stats.total_bytes,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 usage computed"
        );

        Ok(stats)
    }

    async fn test_connection(&self) -> ConnectionReport {
        let root = match self.prefix_location(&StorageKey::root()) {
            Ok(root) => root,
            Err(e) => return ConnectionReport::failure(e.to_string()),
        };
        match self.store.list_with_delimiter(root.as_ref()).await {
            Ok(listing) => ConnectionReport::success(format!(
                "Bucket {} reachable ({} entries at root)",
                self.options.bucket,
                listing.objects.len() + listing.common_prefixes.len()
            )),
            Err(e) => ConnectionReport::failure(format!(
                "Bucket {} not reachable: {}",
                self.options.bucket, e
            )),
        }
    }
}
