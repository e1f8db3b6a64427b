//! Storage provider contract
//!
//! This module defines the `StorageProvider` trait that every backend implements,
//! the error taxonomy shared by all backends, and the small value types returned
//! by provider operations.

use crate::path_policy::StorageKey;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;
use vertex_core::{ErrorMetadata, LogLevel, ProviderKind};

/// Storage operation errors
///
/// Variants map one-to-one onto the stable taxonomy strings returned by
/// [`StorageError::code`]. Backend-specific wording only ever appears in the
/// `Display` output, never in `code()` or `client_message()`.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Authorization expired: {0}")]
    AuthExpired(String),

    #[error("Transient backend failure: {0}")]
    Transient(String),

    #[error("Circuit open for connection {connection_id}")]
    CircuitOpen { connection_id: Uuid },

    #[error("Retries exhausted after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<StorageError>,
    },

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Stable taxonomy string for this error.
    pub fn code(&self) -> &'static str {
        storage_error_static_metadata(self).1
    }

    /// Whether RetryPolicy may attempt the operation again.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }

    /// Whether this outcome means the backend is unhealthy and should count
    /// towards opening the circuit.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            StorageError::Transient(_)
                | StorageError::AuthExpired(_)
                | StorageError::Backend(_)
                | StorageError::RetriesExhausted { .. }
        )
    }

    /// Whether the backend answered, proving it reachable, even though the
    /// operation itself did not succeed.
    pub fn is_backend_answer(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(err.to_string()),
            io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::UnexpectedEof => StorageError::Transient(err.to_string()),
            _ => StorageError::Backend(err.to_string()),
        }
    }
}

/// Static metadata for each variant: (http_status, code, recoverable, suggested_action, log_level).
fn storage_error_static_metadata(
    err: &StorageError,
) -> (u16, &'static str, bool, Option<&'static str>, LogLevel) {
    match err {
        StorageError::InvalidCredentials(_) => (
            400,
            "InvalidCredentials",
            false,
            Some("Check the connection credentials"),
            LogLevel::Debug,
        ),
        StorageError::InvalidKey(_) => (
            400,
            "InvalidKey",
            false,
            Some("Use a relative key without '..' segments"),
            LogLevel::Debug,
        ),
        StorageError::NotFound(_) => (
            404,
            "NotFound",
            false,
            Some("Verify the key exists"),
            LogLevel::Debug,
        ),
        StorageError::AuthExpired(_) => (
            401,
            "AuthExpired",
            false,
            Some("Re-authorize the storage connection"),
            LogLevel::Warn,
        ),
        StorageError::Transient(_) => (
            503,
            "Transient",
            true,
            Some("Retry after a short delay"),
            LogLevel::Warn,
        ),
        StorageError::CircuitOpen { .. } => (
            503,
            "CircuitOpen",
            true,
            Some("Storage backend is unavailable, retry later"),
            LogLevel::Warn,
        ),
        StorageError::RetriesExhausted { .. } => (
            503,
            "RetriesExhausted",
            true,
            Some("Retry after a short delay"),
            LogLevel::Error,
        ),
        StorageError::Unsupported(_) => (
            501,
            "Unsupported",
            false,
            Some("This operation is not available for the storage provider"),
            LogLevel::Debug,
        ),
        StorageError::Backend(_) => (
            500,
            "Backend",
            false,
            Some("Contact support if this error persists"),
            LogLevel::Error,
        ),
        StorageError::Cancelled => (499, "Cancelled", true, None, LogLevel::Debug),
        StorageError::Conflict(_) => (
            409,
            "Conflict",
            false,
            Some("Choose a different connection name"),
            LogLevel::Debug,
        ),
        StorageError::Config(_) => (
            500,
            "Config",
            false,
            Some("Contact support if this error persists"),
            LogLevel::Error,
        ),
    }
}

impl ErrorMetadata for StorageError {
    fn http_status_code(&self) -> u16 {
        storage_error_static_metadata(self).0
    }

    fn error_code(&self) -> &'static str {
        storage_error_static_metadata(self).1
    }

    fn is_recoverable(&self) -> bool {
        storage_error_static_metadata(self).2
    }

    fn suggested_action(&self) -> Option<&'static str> {
        storage_error_static_metadata(self).3
    }

    fn log_level(&self) -> LogLevel {
        storage_error_static_metadata(self).4
    }

    fn client_message(&self) -> String {
        match self {
            StorageError::InvalidCredentials(_) => "Storage credentials are invalid".to_string(),
            // Key validation messages only describe the caller's own input.
            StorageError::InvalidKey(ref msg) => msg.clone(),
            StorageError::NotFound(_) => "File not found".to_string(),
            StorageError::AuthExpired(_) => "Storage authorization expired".to_string(),
            StorageError::Transient(_) => "Storage backend temporarily unavailable".to_string(),
            StorageError::CircuitOpen { .. } => "Storage backend unavailable".to_string(),
            StorageError::RetriesExhausted { .. } => {
                "Storage backend temporarily unavailable".to_string()
            }
            StorageError::Unsupported(_) => "Operation not supported by this storage".to_string(),
            StorageError::Backend(_) => "Storage backend error".to_string(),
            StorageError::Cancelled => "Operation cancelled".to_string(),
            StorageError::Conflict(ref msg) => msg.clone(),
            StorageError::Config(_) => "Storage is misconfigured".to_string(),
        }
    }
}

/// Aggregated size of a key subtree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub file_count: u64,
    pub total_bytes: u64,
}

/// Structured result of a connectivity check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionReport {
    pub ok: bool,
    pub detail: String,
    pub free_bytes: Option<u64>,
}

impl ConnectionReport {
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
            free_bytes: None,
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
            free_bytes: None,
        }
    }
}

/// HTTP method a presigned URL grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PresignMethod {
    Get,
    Put,
}

/// Lazy, finite sequence of keys relative to the connection root.
///
/// Dropping the stream early releases every resource it holds. Calling
/// `list` again starts a fresh sequence.
pub type KeyStream = BoxStream<'static, StorageResult<StorageKey>>;

/// Storage provider trait
///
/// All backends (local filesystem, S3-compatible object storage, OAuth cloud disk)
/// implement this trait. Keys reaching a provider have already been normalized
/// by [`crate::PathPolicy`], so providers only join them onto their root.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Backend kind, for logging and dispatch decisions
    fn kind(&self) -> ProviderKind;

    /// Upload a local file to `key` and return its public URL.
    ///
    /// Uploading to an existing key overwrites it.
    async fn upload(&self, local_path: &Path, key: &StorageKey) -> StorageResult<String>;

    /// Download `key` into `local_path`. Fails with `NotFound` if the key is missing.
    async fn download(&self, key: &StorageKey, local_path: &Path) -> StorageResult<()>;

    /// Delete `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &StorageKey) -> StorageResult<()>;

    /// Check if `key` exists
    async fn exists(&self, key: &StorageKey) -> StorageResult<bool>;

    /// Lazily list every file key under `prefix` (the root when `prefix` is empty)
    async fn list(&self, prefix: &StorageKey) -> StorageResult<KeyStream>;

    /// Public URL for `key`, computed from configuration without I/O
    fn public_url(&self, key: &StorageKey) -> String;

    /// Time-limited URL granting direct `method` access to `key`
    async fn presigned_url(
        &self,
        key: &StorageKey,
        ttl: Duration,
        method: PresignMethod,
    ) -> StorageResult<String>;

    /// Count files and bytes under `prefix`
    async fn usage_stats(&self, prefix: &StorageKey) -> StorageResult<UsageStats>;

    /// Check connectivity. Expected connectivity failures are reported, never raised.
    async fn test_connection(&self) -> ConnectionReport;
}

/// Best-effort MIME type from a file extension.
pub fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}
