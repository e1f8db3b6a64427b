//! OAuth-authenticated cloud disk REST backend.
//!
//! Resources are addressed as `disk:/{root}/{key}`. Uploads and downloads go
//! through short-lived transfer URLs handed out by the API; everything else is
//! a plain JSON call. The access token is checked before every call and
//! refreshed through the refresh-token grant when it is about to expire.

use crate::path_policy::StorageKey;
use crate::repository::CredentialRefreshHandler;
use crate::traits::{
    ConnectionReport, KeyStream, PresignMethod, StorageError, StorageProvider, StorageResult,
    UsageStats,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;
use vertex_core::ProviderKind;

/// Tokens expiring within this window are refreshed before use.
const REFRESH_LEEWAY_SECS: i64 = 60;

/// Token state and refresh lock shared by every provider built for one connection
pub type SharedToken = Arc<Mutex<CloudDiskToken>>;

/// Endpoints and paging shared by every cloud disk connection
#[derive(Debug, Clone)]
pub struct CloudDiskSettings {
    pub api_url: String,
    pub oauth_url: String,
    pub public_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub page_size: u32,
}

/// OAuth token pair for one connection
#[derive(Clone, PartialEq, Eq)]
pub struct CloudDiskToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for CloudDiskToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudDiskToken")
            .field("access_token", &"***")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "***"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl CloudDiskToken {
    /// Without a refresh token there is nothing to refresh early with, so the
    /// token stays in use until it actually expires.
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        let leeway = if self.refresh_token.is_some() {
            ChronoDuration::seconds(REFRESH_LEEWAY_SECS)
        } else {
            ChronoDuration::zero()
        };
        self.expires_at
            .map(|at| at <= now + leeway)
            .unwrap_or(false)
    }

    /// Credential shape handed to [`CredentialRefreshHandler`]
    pub fn to_credentials(&self) -> Map<String, Value> {
        let mut credentials = Map::new();
        credentials.insert(
            "oauthToken".to_string(),
            Value::String(self.access_token.clone()),
        );
        if let Some(ref refresh) = self.refresh_token {
            credentials.insert("refreshToken".to_string(), Value::String(refresh.clone()));
        }
        if let Some(at) = self.expires_at {
            credentials.insert("expiresAt".to_string(), Value::String(at.to_rfc3339()));
        }
        credentials
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TransferLink {
    href: String,
}

#[derive(Debug, Deserialize)]
struct Resource {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(rename = "_embedded", default)]
    embedded: Option<ResourceList>,
}

#[derive(Debug, Deserialize)]
struct ResourceList {
    #[serde(default)]
    items: Vec<Resource>,
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DiskInfo {
    #[serde(default)]
    total_space: Option<u64>,
    #[serde(default)]
    used_space: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Cloud disk storage provider
#[derive(Clone)]
pub struct CloudDiskProvider {
    client: Client,
    settings: Arc<CloudDiskSettings>,
    connection_id: Uuid,
    root: StorageKey,
    token: SharedToken,
    refresh_handler: Option<Arc<dyn CredentialRefreshHandler>>,
}

impl fmt::Debug for CloudDiskProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudDiskProvider")
            .field("connection_id", &self.connection_id)
            .field("root", &self.root)
            .field("api_url", &self.settings.api_url)
            .finish()
    }
}

impl CloudDiskProvider {
    pub fn new(
        client: Client,
        settings: Arc<CloudDiskSettings>,
        connection_id: Uuid,
        root: StorageKey,
        token: CloudDiskToken,
    ) -> Self {
        Self::with_shared_token(
            client,
            settings,
            connection_id,
            root,
            Arc::new(Mutex::new(token)),
        )
    }

    /// Build a provider over token state owned elsewhere, so that instances
    /// for the same connection refresh at most once between them.
    pub fn with_shared_token(
        client: Client,
        settings: Arc<CloudDiskSettings>,
        connection_id: Uuid,
        root: StorageKey,
        token: SharedToken,
    ) -> Self {
        Self {
            client,
            settings,
            connection_id,
            root,
            token,
            refresh_handler: None,
        }
    }

    /// Receive rotated tokens after a refresh exchange
    pub fn with_refresh_handler(mut self, handler: Arc<dyn CredentialRefreshHandler>) -> Self {
        self.refresh_handler = Some(handler);
        self
    }

    fn disk_path(&self, key: &StorageKey) -> String {
        format!("disk:/{}", self.root.join(key))
    }

    fn api(&self, path: &str) -> String {
        format!("{}{}", self.settings.api_url.trim_end_matches('/'), path)
    }

    /// Key relative to the connection root for an API path like `disk:/root/a.jpg`
    fn relative_key(&self, api_path: &str) -> Option<StorageKey> {
        let raw = api_path.strip_prefix("disk:").unwrap_or(api_path);
        StorageKey::from_listing(raw)
            .strip_prefix(&self.root)
            .filter(|k| !k.is_root())
    }

    /// Current access token, refreshed first when it is about to expire.
    async fn access_token(&self) -> StorageResult<String> {
        let mut token = self.token.lock().await;
        if token.needs_refresh(Utc::now()) {
            self.refresh_locked(&mut token).await?;
        }
        Ok(token.access_token.clone())
    }

    /// Refresh after the API rejected `rejected`, unless a concurrent call already did.
    async fn force_refresh(&self, rejected: &str) -> StorageResult<String> {
        let mut token = self.token.lock().await;
        if token.access_token == rejected {
            self.refresh_locked(&mut token).await?;
        }
        Ok(token.access_token.clone())
    }

    async fn refresh_locked(&self, token: &mut CloudDiskToken) -> StorageResult<()> {
        let refresh_token = token.refresh_token.clone().ok_or_else(|| {
            StorageError::AuthExpired("access token expired and no refresh token is stored".to_string())
        })?;

        let start = Instant::now();
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];
        if let Some(ref id) = self.settings.client_id {
            form.push(("client_id", id.as_str()));
        }
        if let Some(ref secret) = self.settings.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self
            .client
            .post(&self.settings.oauth_url)
            .form(&form)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status.is_client_error() {
            tracing::warn!(
                connection_id = %self.connection_id,
                status = status.as_u16(),
                "Cloud disk token refresh rejected"
            );
            return Err(StorageError::AuthExpired(format!(
                "refresh token rejected with status {}",
                status
            )));
        }
        let response = check_status(response).await?;
        let refreshed: TokenResponse = response.json().await.map_err(map_reqwest_error)?;

        token.access_token = refreshed.access_token;
        if refreshed.refresh_token.is_some() {
            token.refresh_token = refreshed.refresh_token;
        }
        token.expires_at = refreshed
            .expires_in
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs));

        tracing::info!(
            connection_id = %self.connection_id,
            expires_at = ?token.expires_at,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Cloud disk token refreshed"
        );

        if let Some(ref handler) = self.refresh_handler {
            // The new token is already usable; a failed save only affects later processes.
            if let Err(e) = handler
                .save_refreshed_credentials(self.connection_id, token.to_credentials())
                .await
            {
                tracing::error!(
                    error = %e,
                    connection_id = %self.connection_id,
                    "Failed to persist refreshed cloud disk credentials"
                );
            }
        }

        Ok(())
    }

    /// Send an authenticated API request. A 401 triggers one refresh and a resend.
    async fn send<F>(&self, build: F) -> StorageResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let token = self.access_token().await?;
        let response = build(&self.client)
            .header(AUTHORIZATION, format!("OAuth {}", token))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        tracing::debug!(
            connection_id = %self.connection_id,
            "Cloud disk rejected access token, refreshing"
        );
        let token = self.force_refresh(&token).await?;
        let response = build(&self.client)
            .header(AUTHORIZATION, format!("OAuth {}", token))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(response).await
    }

    async fn resource(&self, path: &str, offset: u64) -> StorageResult<Resource> {
        let url = self.api("/resources");
        let limit = self.settings.page_size.to_string();
        let offset = offset.to_string();
        let response = self
            .send(|client| {
                client.get(&url).query(&[
                    ("path", path),
                    ("limit", limit.as_str()),
                    ("offset", offset.as_str()),
                ])
            })
            .await?;
        response.json().await.map_err(map_reqwest_error)
    }

    /// Create every folder from the disk root down to `folder`.
    async fn ensure_folders(&self, folder: &StorageKey) -> StorageResult<()> {
        let url = self.api("/resources");
        let mut current = StorageKey::root();
        for segment in folder.segments() {
            current = current.join(&StorageKey::from_listing(segment));
            let path = format!("disk:/{}", current);
            match self
                .send(|client| client.put(&url).query(&[("path", path.as_str())]))
                .await
            {
                Ok(_) | Err(StorageError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Every file under `prefix`, with its size, following pagination lazily.
    fn files_under(
        &self,
        prefix: &StorageKey,
    ) -> BoxStream<'static, StorageResult<(StorageKey, u64)>> {
        let state = ListState {
            provider: self.clone(),
            pending: vec![self.disk_path(prefix)],
            current: None,
            buffer: VecDeque::new(),
            done: false,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(entry) = state.buffer.pop_front() {
                    return Some((Ok(entry), state));
                }
                if state.done {
                    return None;
                }

                let (dir, offset) = match state.current.take() {
                    Some(page) => page,
                    None => (state.pending.pop()?, 0),
                };

                let resource = match state.provider.resource(&dir, offset).await {
                    Ok(r) => r,
                    // Removed while walking, or the prefix never existed.
                    Err(StorageError::NotFound(_)) => continue,
                    Err(e) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                };

                if resource.kind == "file" {
                    if let Some(key) = state.provider.relative_key(&resource.path) {
                        state.buffer.push_back((key, resource.size.unwrap_or(0)));
                    }
                    continue;
                }

                let Some(listing) = resource.embedded else {
                    continue;
                };
                let fetched = listing.items.len() as u64;
                for item in listing.items {
                    if item.kind == "dir" {
                        state.pending.push(item.path);
                    } else if let Some(key) = state.provider.relative_key(&item.path) {
                        state.buffer.push_back((key, item.size.unwrap_or(0)));
                    }
                }

                let next = offset + fetched;
                let more = match listing.total {
                    Some(total) => next < total,
                    None => fetched >= u64::from(state.provider.settings.page_size),
                };
                if fetched > 0 && more {
                    state.current = Some((dir, next));
                }
            }
        })
        .boxed()
    }
}

struct ListState {
    provider: CloudDiskProvider,
    pending: Vec<String>,
    current: Option<(String, u64)>,
    buffer: VecDeque<(StorageKey, u64)>,
    done: bool,
}

fn map_reqwest_error(err: reqwest::Error) -> StorageError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        StorageError::Transient(err.to_string())
    } else if err.is_decode() {
        StorageError::Backend(format!("unexpected cloud disk response: {}", err))
    } else {
        StorageError::Backend(err.to_string())
    }
}

/// Map a non-success status onto the storage taxonomy
async fn check_status(response: Response) -> StorageResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body: Option<ApiErrorBody> = response.json().await.ok();
    let detail = body
        .and_then(|b| b.error.or(b.description))
        .unwrap_or_else(|| status.to_string());

    Err(match status {
        StatusCode::NOT_FOUND => StorageError::NotFound(detail),
        StatusCode::UNAUTHORIZED => StorageError::AuthExpired(detail),
        StatusCode::CONFLICT => StorageError::Conflict(detail),
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::REQUEST_TIMEOUT
        | StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => StorageError::Transient(detail),
        _ => StorageError::Backend(format!("{}: {}", status, detail)),
    })
}

#[async_trait]
impl StorageProvider for CloudDiskProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CloudDisk
    }

    async fn upload(&self, local_path: &Path, key: &StorageKey) -> StorageResult<String> {
        let start = Instant::now();
        let disk_path = self.disk_path(key);

        let file = tokio::fs::File::open(local_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(format!("source file {}", local_path.display()))
            } else {
                e.into()
            }
        })?;
        let size = file.metadata().await?.len();

        if let Some(parent) = self.root.join(key).parent() {
            self.ensure_folders(&parent).await?;
        }

        let url = self.api("/resources/upload");
        let link: TransferLink = self
            .send(|client| {
                client
                    .get(&url)
                    .query(&[("path", disk_path.as_str()), ("overwrite", "true")])
            })
            .await?
            .json()
            .await
            .map_err(map_reqwest_error)?;

        // Transfer links are pre-authorized.
        let response = self
            .client
            .put(&link.href)
            .body(reqwest::Body::from(file))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        check_status(response).await.inspect_err(|e| {
            tracing::error!(
                error = %e,
                connection_id = %self.connection_id,
                path = %disk_path,
                size_bytes = size,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "Cloud disk upload failed"
            );
        })?;

        tracing::info!(
            connection_id = %self.connection_id,
            path = %disk_path,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Cloud disk upload successful"
        );

        Ok(self.public_url(key))
    }

    async fn download(&self, key: &StorageKey, local_path: &Path) -> StorageResult<()> {
        let start = Instant::now();
        let disk_path = self.disk_path(key);

        let url = self.api("/resources/download");
        let link: TransferLink = self
            .send(|client| client.get(&url).query(&[("path", disk_path.as_str())]))
            .await
            .map_err(|e| match e {
                StorageError::NotFound(_) => StorageError::NotFound(key.to_string()),
                other => other,
            })?
            .json()
            .await
            .map_err(map_reqwest_error)?;

        let response = self
            .client
            .get(&link.href)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let response = check_status(response).await?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(local_path).await?;
        let mut body = response.bytes_stream();
        let mut size = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        tracing::info!(
            connection_id = %self.connection_id,
            path = %disk_path,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Cloud disk download successful"
        );

        Ok(())
    }

    async fn delete(&self, key: &StorageKey) -> StorageResult<()> {
        let start = Instant::now();
        let disk_path = self.disk_path(key);
        let url = self.api("/resources");

        match self
            .send(|client| {
                client
                    .delete(&url)
                    .query(&[("path", disk_path.as_str()), ("permanently", "true")])
            })
            .await
        {
            Ok(_) | Err(StorageError::NotFound(_)) => {}
            Err(e) => {
                tracing::error!(
                    error = %e,
                    connection_id = %self.connection_id,
                    path = %disk_path,
                    "Cloud disk delete failed"
                );
                return Err(e);
            }
        }

        tracing::info!(
            connection_id = %self.connection_id,
            path = %disk_path,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Cloud disk delete successful"
        );

        Ok(())
    }

    async fn exists(&self, key: &StorageKey) -> StorageResult<bool> {
        match self.resource(&self.disk_path(key), 0).await {
            Ok(resource) => Ok(resource.kind == "file"),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, prefix: &StorageKey) -> StorageResult<KeyStream> {
        Ok(self.files_under(prefix).map_ok(|(key, _)| key).boxed())
    }

    fn public_url(&self, key: &StorageKey) -> String {
        format!(
            "{}/{}",
            self.settings.public_url.trim_end_matches('/'),
            self.root.join(key).url_path()
        )
    }

    async fn presigned_url(
        &self,
        _key: &StorageKey,
        _ttl: Duration,
        _method: PresignMethod,
    ) -> StorageResult<String> {
        Err(StorageError::Unsupported(
            "presigned URLs are not available for cloud disk storage".to_string(),
        ))
    }

    async fn usage_stats(&self, prefix: &StorageKey) -> StorageResult<UsageStats> {
        let start = Instant::now();
        let stats = self
            .files_under(prefix)
            .try_fold(UsageStats::default(), |mut acc, (_, size)| async move {
                acc.file_count += 1;
                acc.total_bytes += size;
                Ok(acc)
            })
            .await?;

        tracing::debug!(
            connection_id = %self.connection_id,
            prefix = %prefix,
            file_count = stats.file_count,
            total_bytes = stats.total_bytes,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Cloud disk usage computed"
        );

        Ok(stats)
    }

    async fn test_connection(&self) -> ConnectionReport {
        let url = self.api("/");
        let response = match self.send(|client| client.get(&url)).await {
            Ok(r) => r,
            Err(e) => return ConnectionReport::failure(format!("Cloud disk not reachable: {}", e)),
        };

        match response.json::<DiskInfo>().await {
            Ok(info) => ConnectionReport {
                ok: true,
                detail: "Cloud disk reachable".to_string(),
                free_bytes: match (info.total_space, info.used_space) {
                    (Some(total), Some(used)) => Some(total.saturating_sub(used)),
                    _ => None,
                },
            },
            Err(e) => ConnectionReport::failure(format!("Unexpected cloud disk response: {}", e)),
        }
    }
}
