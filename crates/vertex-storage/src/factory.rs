//! Builds providers from connection records.
//!
//! Credential shapes are validated here, once, before any provider exists or
//! any network call is made.

#[cfg(feature = "storage-cloud-disk")]
use crate::cloud_disk::{CloudDiskProvider, CloudDiskSettings, CloudDiskToken, SharedToken};
#[cfg(feature = "storage-local")]
use crate::local::LocalDiskProvider;
use crate::path_policy::{PathPolicy, StorageKey};
#[cfg(feature = "storage-cloud-disk")]
use crate::repository::CredentialRefreshHandler;
#[cfg(feature = "storage-s3")]
use crate::s3::{ObjectStorageOptions, ObjectStorageProvider, ObjectStorageSettings};
use crate::traits::{StorageError, StorageProvider, StorageResult};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;
use vertex_core::{ProviderKind, StorageConfig, StorageConnection};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LocalCredentials {
    base_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ObjectStorageCredentials {
    endpoint: String,
    access_key: String,
    secret_key: String,
    bucket: String,
    secure: bool,
    region: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CloudDiskCredentials {
    oauth_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

fn parse_credentials<T: DeserializeOwned>(
    kind: ProviderKind,
    credentials: &Map<String, Value>,
) -> StorageResult<T> {
    serde_json::from_value(Value::Object(credentials.clone())).map_err(|e| {
        StorageError::InvalidCredentials(format!("{} credentials: {}", kind, e))
    })
}

fn require_non_empty(kind: ProviderKind, fields: &[(&str, &str)]) -> StorageResult<()> {
    for (name, value) in fields {
        if value.trim().is_empty() {
            return Err(StorageError::InvalidCredentials(format!(
                "{} credentials: `{}` must not be empty",
                kind, name
            )));
        }
    }
    Ok(())
}

/// Object storage clients are reused per endpoint and credential tuple.
#[cfg(feature = "storage-s3")]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ObjectClientKey {
    endpoint: String,
    access_key: String,
    secret_digest: String,
    bucket: String,
    region: String,
}

#[cfg(feature = "storage-s3")]
impl ObjectClientKey {
    fn new(settings: &ObjectStorageSettings) -> Self {
        use sha2::{Digest, Sha256};
        Self {
            endpoint: settings.endpoint_url(),
            access_key: settings.access_key.clone(),
            secret_digest: hex::encode(Sha256::digest(settings.secret_key.as_bytes())),
            bucket: settings.bucket.clone(),
            region: settings.region.clone(),
        }
    }
}

/// Live token state of one cloud disk connection. `stored` is the token the
/// record held when the slot was created, so a stale record read still maps
/// onto the same slot after a refresh.
#[cfg(feature = "storage-cloud-disk")]
struct TokenSlot {
    stored: CloudDiskToken,
    state: SharedToken,
}

#[cfg(feature = "storage-cloud-disk")]
impl TokenSlot {
    /// Whether `token` read from the record still describes this slot.
    /// A slot locked by a refresh in flight is kept.
    fn matches(&self, token: &CloudDiskToken) -> bool {
        if self.stored == *token {
            return true;
        }
        match self.state.try_lock() {
            Ok(current) => *current == *token,
            Err(_) => true,
        }
    }
}

/// Creates a [`StorageProvider`] for a [`StorageConnection`]
pub struct ProviderFactory {
    config: StorageConfig,
    policy: PathPolicy,
    #[cfg(feature = "storage-s3")]
    object_clients: std::sync::Mutex<
        std::collections::HashMap<ObjectClientKey, Arc<object_store::aws::AmazonS3>>,
    >,
    #[cfg(feature = "storage-cloud-disk")]
    http: reqwest::Client,
    #[cfg(feature = "storage-cloud-disk")]
    cloud_disk: Arc<CloudDiskSettings>,
    #[cfg(feature = "storage-cloud-disk")]
    refresh_handler: Option<Arc<dyn CredentialRefreshHandler>>,
    #[cfg(feature = "storage-cloud-disk")]
    cloud_tokens: std::sync::Mutex<std::collections::HashMap<Uuid, TokenSlot>>,
}

impl ProviderFactory {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            config: config.clone(),
            policy: PathPolicy::new(config.max_key_length),
            #[cfg(feature = "storage-s3")]
            object_clients: std::sync::Mutex::new(std::collections::HashMap::new()),
            #[cfg(feature = "storage-cloud-disk")]
            http: reqwest::Client::new(),
            #[cfg(feature = "storage-cloud-disk")]
            cloud_disk: Arc::new(CloudDiskSettings {
                api_url: config.cloud_disk_api_url.clone(),
                oauth_url: config.cloud_disk_oauth_url.clone(),
                public_url: config.cloud_disk_public_url.clone(),
                client_id: config.cloud_disk_client_id.clone(),
                client_secret: config.cloud_disk_client_secret.clone(),
                page_size: config.cloud_disk_page_size,
            }),
            #[cfg(feature = "storage-cloud-disk")]
            refresh_handler: None,
            #[cfg(feature = "storage-cloud-disk")]
            cloud_tokens: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Callback receiving rotated cloud disk tokens
    #[cfg(feature = "storage-cloud-disk")]
    pub fn with_refresh_handler(mut self, handler: Arc<dyn CredentialRefreshHandler>) -> Self {
        self.refresh_handler = Some(handler);
        self
    }

    pub fn policy(&self) -> PathPolicy {
        self.policy
    }

    /// Drop per-connection state kept between `create` calls.
    pub fn forget(&self, connection_id: Uuid) {
        #[cfg(feature = "storage-cloud-disk")]
        self.cloud_tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&connection_id);
        #[cfg(not(feature = "storage-cloud-disk"))]
        let _ = connection_id;
    }

    /// Validate `connection.credentials` and build the matching provider.
    pub async fn create(
        &self,
        connection: &StorageConnection,
    ) -> StorageResult<Arc<dyn StorageProvider>> {
        let root = self.policy.normalize_prefix(&connection.base_path)?;
        let kind = connection.provider_kind;

        match kind {
            ProviderKind::Local => {
                let creds: LocalCredentials = parse_credentials(kind, &connection.credentials)?;
                require_non_empty(kind, &[("basePath", creds.base_path.as_str())])?;
                self.create_local(connection, creds, root).await
            }
            ProviderKind::ObjectStorage => {
                let creds: ObjectStorageCredentials =
                    parse_credentials(kind, &connection.credentials)?;
                require_non_empty(
                    kind,
                    &[
                        ("endpoint", creds.endpoint.as_str()),
                        ("accessKey", creds.access_key.as_str()),
                        ("secretKey", creds.secret_key.as_str()),
                        ("bucket", creds.bucket.as_str()),
                        ("region", creds.region.as_str()),
                    ],
                )?;
                self.create_object_storage(creds, root)
            }
            ProviderKind::CloudDisk => {
                let creds: CloudDiskCredentials =
                    parse_credentials(kind, &connection.credentials)?;
                require_non_empty(kind, &[("oauthToken", creds.oauth_token.as_str())])?;
                self.create_cloud_disk(connection, creds, root)
            }
        }
    }

    #[cfg(feature = "storage-local")]
    async fn create_local(
        &self,
        connection: &StorageConnection,
        creds: LocalCredentials,
        root: StorageKey,
    ) -> StorageResult<Arc<dyn StorageProvider>> {
        let path = std::path::PathBuf::from(creds.base_path).join(root.as_str());
        let base_url = format!(
            "{}/{}",
            self.config.local_base_url.trim_end_matches('/'),
            connection.id
        );
        let provider = LocalDiskProvider::new(path, base_url).await?;
        Ok(Arc::new(provider))
    }

    #[cfg(not(feature = "storage-local"))]
    async fn create_local(
        &self,
        _connection: &StorageConnection,
        _creds: LocalCredentials,
        _root: StorageKey,
    ) -> StorageResult<Arc<dyn StorageProvider>> {
        Err(StorageError::Config(
            "Local storage backend not available (storage-local feature not enabled)".to_string(),
        ))
    }

    #[cfg(feature = "storage-s3")]
    fn create_object_storage(
        &self,
        creds: ObjectStorageCredentials,
        root: StorageKey,
    ) -> StorageResult<Arc<dyn StorageProvider>> {
        let settings = ObjectStorageSettings {
            endpoint: creds.endpoint,
            access_key: creds.access_key,
            secret_key: creds.secret_key,
            bucket: creds.bucket,
            secure: creds.secure,
            region: creds.region,
        };
        let client = self.object_client(&settings)?;
        let options = ObjectStorageOptions {
            bucket: settings.bucket.clone(),
            public_base_url: format!("{}/{}", settings.endpoint_url(), settings.bucket),
            root,
            multipart_threshold: self.config.multipart_threshold_bytes,
            presigned_max_ttl: std::time::Duration::from_secs(self.config.presigned_max_ttl_secs),
        };
        Ok(Arc::new(ObjectStorageProvider::new(client, options)))
    }

    #[cfg(not(feature = "storage-s3"))]
    fn create_object_storage(
        &self,
        _creds: ObjectStorageCredentials,
        _root: StorageKey,
    ) -> StorageResult<Arc<dyn StorageProvider>> {
        Err(StorageError::Config(
            "Object storage backend not available (storage-s3 feature not enabled)".to_string(),
        ))
    }

    #[cfg(feature = "storage-s3")]
    fn object_client(
        &self,
        settings: &ObjectStorageSettings,
    ) -> StorageResult<Arc<object_store::aws::AmazonS3>> {
        let key = ObjectClientKey::new(settings);
        let mut clients = self
            .object_clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let client = Arc::new(settings.build_client()?);
        clients.insert(key, client.clone());
        tracing::debug!(
            endpoint = %settings.endpoint_url(),
            bucket = %settings.bucket,
            "Created object storage client"
        );
        Ok(client)
    }

    #[cfg(feature = "storage-cloud-disk")]
    fn create_cloud_disk(
        &self,
        connection: &StorageConnection,
        creds: CloudDiskCredentials,
        root: StorageKey,
    ) -> StorageResult<Arc<dyn StorageProvider>> {
        let token = CloudDiskToken {
            access_token: creds.oauth_token,
            refresh_token: creds.refresh_token.filter(|t| !t.trim().is_empty()),
            expires_at: creds.expires_at,
        };
        let mut provider = CloudDiskProvider::with_shared_token(
            self.http.clone(),
            self.cloud_disk.clone(),
            connection.id,
            root,
            self.cloud_token(connection.id, token),
        );
        if let Some(ref handler) = self.refresh_handler {
            provider = provider.with_refresh_handler(handler.clone());
        }
        Ok(Arc::new(provider))
    }

    /// Token state for `connection_id`, replaced when the record carries
    /// credentials the slot has never seen.
    #[cfg(feature = "storage-cloud-disk")]
    fn cloud_token(&self, connection_id: Uuid, token: CloudDiskToken) -> SharedToken {
        let mut slots = self
            .cloud_tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(slot) = slots.get(&connection_id) {
            if slot.matches(&token) {
                return slot.state.clone();
            }
            tracing::debug!(
                connection_id = %connection_id,
                "Cloud disk credentials changed, resetting token state"
            );
        }
        let state: SharedToken = Arc::new(tokio::sync::Mutex::new(token.clone()));
        slots.insert(
            connection_id,
            TokenSlot {
                stored: token,
                state: state.clone(),
            },
        );
        state
    }

    #[cfg(not(feature = "storage-cloud-disk"))]
    fn create_cloud_disk(
        &self,
        _connection: &StorageConnection,
        _creds: CloudDiskCredentials,
        _root: StorageKey,
    ) -> StorageResult<Arc<dyn StorageProvider>> {
        Err(StorageError::Config(
            "Cloud disk backend not available (storage-cloud-disk feature not enabled)"
                .to_string(),
        ))
    }

    #[cfg(all(test, feature = "storage-s3"))]
    fn object_client_count(&self) -> usize {
        self.object_clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn connection(kind: ProviderKind, base_path: &str, creds: Value) -> StorageConnection {
        StorageConnection::new("test", kind, base_path, creds.as_object().cloned().unwrap())
    }

    fn minio(secret: &str) -> Value {
        json!({
            "endpoint": "localhost:9000",
            "accessKey": "minioadmin",
            "secretKey": secret,
            "bucket": "media",
            "secure": false,
            "region": "us-east-1"
        })
    }

    fn assert_invalid(result: StorageResult<Arc<dyn StorageProvider>>) {
        match result {
            Err(StorageError::InvalidCredentials(_)) => {}
            Err(other) => panic!("expected InvalidCredentials, got {other:?}"),
            Ok(_) => panic!("expected InvalidCredentials, got a provider"),
        }
    }

    #[tokio::test]
    async fn test_rejects_malformed_credentials() {
        let factory = ProviderFactory::new(&StorageConfig::default());

        let cases = [
            connection(ProviderKind::Local, "", json!({})),
            connection(ProviderKind::Local, "", json!({"basePath": ""})),
            connection(ProviderKind::Local, "", json!({"basePath": 5})),
            connection(
                ProviderKind::Local,
                "",
                json!({"basePath": "/tmp/x", "bucket": "extra"}),
            ),
            connection(ProviderKind::ObjectStorage, "", json!({"endpoint": "x"})),
            connection(
                ProviderKind::ObjectStorage,
                "",
                json!({
                    "endpoint": "x", "accessKey": "a", "secretKey": "s",
                    "bucket": "b", "secure": "yes", "region": "r"
                }),
            ),
            connection(ProviderKind::CloudDisk, "", json!({"refreshToken": "r"})),
            connection(ProviderKind::CloudDisk, "", json!({"oauthToken": "  "})),
            connection(
                ProviderKind::CloudDisk,
                "",
                json!({"oauthToken": "t", "expiresAt": "tomorrow"}),
            ),
        ];

        for conn in cases {
            assert_invalid(factory.create(&conn).await);
        }
    }

    #[tokio::test]
    async fn test_rejects_unsafe_base_path() {
        let factory = ProviderFactory::new(&StorageConfig::default());
        let conn = connection(ProviderKind::ObjectStorage, "../other", minio("s"));
        assert!(matches!(
            factory.create(&conn).await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_builds_each_provider_kind() {
        let dir = tempdir().unwrap();
        let factory = ProviderFactory::new(&StorageConfig::default());

        let local = connection(
            ProviderKind::Local,
            "VertexAR",
            json!({"basePath": dir.path().to_string_lossy()}),
        );
        let provider = factory.create(&local).await.unwrap();
        assert_eq!(provider.kind(), ProviderKind::Local);
        assert!(dir.path().join("VertexAR").is_dir());

        let object = connection(ProviderKind::ObjectStorage, "VertexAR", minio("s"));
        let provider = factory.create(&object).await.unwrap();
        assert_eq!(provider.kind(), ProviderKind::ObjectStorage);
        assert_eq!(
            provider.public_url(&factory.policy().normalize("a b.jpg").unwrap()),
            "http://localhost:9000/media/VertexAR/a%20b.jpg"
        );

        let disk = connection(
            ProviderKind::CloudDisk,
            "VertexAR",
            json!({"oauthToken": "t", "refreshToken": "r", "expiresAt": "2030-01-01T00:00:00Z"}),
        );
        let provider = factory.create(&disk).await.unwrap();
        assert_eq!(provider.kind(), ProviderKind::CloudDisk);
    }

    #[tokio::test]
    async fn test_object_clients_are_cached_per_credentials() {
        let factory = ProviderFactory::new(&StorageConfig::default());

        factory
            .create(&connection(ProviderKind::ObjectStorage, "a", minio("s1")))
            .await
            .unwrap();
        factory
            .create(&connection(ProviderKind::ObjectStorage, "b", minio("s1")))
            .await
            .unwrap();
        assert_eq!(factory.object_client_count(), 1);

        factory
            .create(&connection(ProviderKind::ObjectStorage, "a", minio("s2")))
            .await
            .unwrap();
        assert_eq!(factory.object_client_count(), 2);
    }

    #[cfg(feature = "storage-cloud-disk")]
    #[tokio::test]
    async fn test_cloud_disk_refresh_is_shared_per_connection() {
        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(json!({"access_token": "fresh", "expires_in": 3600}).to_string())
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", "/resources")
            .match_query(mockito::Matcher::Any)
            .match_header("authorization", "OAuth fresh")
            .with_status(404)
            .with_body(json!({"error": "DiskNotFoundError"}).to_string())
            .expect(3)
            .create_async()
            .await;

        let config = StorageConfig {
            cloud_disk_api_url: server.url(),
            cloud_disk_oauth_url: format!("{}/token", server.url()),
            ..StorageConfig::default()
        };
        let factory = ProviderFactory::new(&config);
        let conn = connection(
            ProviderKind::CloudDisk,
            "",
            json!({"oauthToken": "old", "refreshToken": "r1", "expiresAt": "2020-01-01T00:00:00Z"}),
        );

        // One provider per operation, as the service builds them.
        let mut providers = Vec::new();
        for _ in 0..3 {
            providers.push(factory.create(&conn).await.unwrap());
        }
        let target = factory.policy().normalize("a.jpg").unwrap();
        let results =
            futures::future::join_all(providers.iter().map(|p| p.exists(&target))).await;
        for result in results {
            assert!(!result.unwrap());
        }
        refresh.assert_async().await;
    }

    #[cfg(feature = "storage-cloud-disk")]
    #[test]
    fn test_cloud_token_slot_follows_credentials() {
        let factory = ProviderFactory::new(&StorageConfig::default());
        let id = Uuid::new_v4();
        let stored = CloudDiskToken {
            access_token: "t1".to_string(),
            refresh_token: Some("r1".to_string()),
            expires_at: None,
        };

        let first = factory.cloud_token(id, stored.clone());
        assert!(Arc::ptr_eq(&first, &factory.cloud_token(id, stored.clone())));

        // A refreshed record maps onto the live state.
        first.try_lock().unwrap().access_token = "t2".to_string();
        let refreshed = CloudDiskToken {
            access_token: "t2".to_string(),
            ..stored.clone()
        };
        assert!(Arc::ptr_eq(&first, &factory.cloud_token(id, refreshed)));

        let replaced = CloudDiskToken {
            access_token: "other".to_string(),
            refresh_token: Some("r9".to_string()),
            expires_at: None,
        };
        let second = factory.cloud_token(id, replaced.clone());
        assert!(!Arc::ptr_eq(&first, &second));

        factory.forget(id);
        assert!(!Arc::ptr_eq(&second, &factory.cloud_token(id, replaced)));
    }

    #[tokio::test]
    async fn test_local_public_url_is_scoped_by_connection() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            local_base_url: "http://files.local/storage/".to_string(),
            ..StorageConfig::default()
        };
        let factory = ProviderFactory::new(&config);
        let conn = connection(
            ProviderKind::Local,
            "",
            json!({"basePath": dir.path().to_string_lossy()}),
        );

        let provider = factory.create(&conn).await.unwrap();
        let url = provider.public_url(&factory.policy().normalize("x/y.png").unwrap());
        assert_eq!(url, format!("http://files.local/storage/{}/x/y.png", conn.id));
    }
}
