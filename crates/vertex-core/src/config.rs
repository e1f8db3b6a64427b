//! Configuration module
//!
//! Process-wide settings for the storage core: key policy limits, resilience
//! tuning (circuit breaker, retry), the usage statistics cache, the local
//! fallback target and cloud-disk OAuth endpoints. Connection-specific
//! credentials never live here; they come from `StorageConnection` records.

use std::env;
use std::path::PathBuf;

const MAX_KEY_LENGTH: usize = 1024;
const BREAKER_FAILURE_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN_SECS: u64 = 30;
const RETRY_MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 200;
const RETRY_MAX_DELAY_MS: u64 = 5_000;
const RETRY_JITTER: f64 = 0.2;
const CACHE_MEMORY_CAPACITY: usize = 100;
const CACHE_MEMORY_TTL_SECS: u64 = 60;
const CACHE_DISK_TTL_SECS: u64 = 24 * 60 * 60;
const ATTEMPT_TIMEOUT_SECS: u64 = 300;
const MULTIPART_THRESHOLD_BYTES: u64 = 8 * 1024 * 1024;
const PRESIGNED_MAX_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const CLOUD_DISK_PAGE_SIZE: u32 = 100;

/// Storage core configuration
#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub max_key_length: usize,
    // Circuit breaker
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
    // Retry policy
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter: f64,
    /// Per-attempt timeout in seconds. 0 = disabled.
    pub attempt_timeout_secs: u64,
    // Usage statistics cache
    pub cache_memory_capacity: usize,
    pub cache_memory_ttl_secs: u64,
    pub cache_disk_ttl_secs: u64,
    pub cache_dir: Option<PathBuf>,
    // Local fallback for writes while a primary circuit is open
    pub fallback_path: Option<PathBuf>,
    pub fallback_base_url: String,
    // Local disk provider
    pub local_base_url: String,
    // Object storage provider
    pub multipart_threshold_bytes: u64,
    pub presigned_max_ttl_secs: u64,
    // Cloud disk provider
    pub cloud_disk_api_url: String,
    pub cloud_disk_oauth_url: String,
    pub cloud_disk_public_url: String,
    pub cloud_disk_client_id: Option<String>,
    pub cloud_disk_client_secret: Option<String>,
    pub cloud_disk_page_size: u32,
    // Logging
    pub log_json: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_key_length: MAX_KEY_LENGTH,
            breaker_failure_threshold: BREAKER_FAILURE_THRESHOLD,
            breaker_cooldown_secs: BREAKER_COOLDOWN_SECS,
            retry_max_attempts: RETRY_MAX_ATTEMPTS,
            retry_base_delay_ms: RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: RETRY_MAX_DELAY_MS,
            retry_jitter: RETRY_JITTER,
            attempt_timeout_secs: ATTEMPT_TIMEOUT_SECS,
            cache_memory_capacity: CACHE_MEMORY_CAPACITY,
            cache_memory_ttl_secs: CACHE_MEMORY_TTL_SECS,
            cache_disk_ttl_secs: CACHE_DISK_TTL_SECS,
            cache_dir: Some(env::temp_dir().join("vertex-usage-cache")),
            fallback_path: None,
            fallback_base_url: "http://localhost:8000/storage/fallback".to_string(),
            local_base_url: "http://localhost:8000/storage".to_string(),
            multipart_threshold_bytes: MULTIPART_THRESHOLD_BYTES,
            presigned_max_ttl_secs: PRESIGNED_MAX_TTL_SECS,
            cloud_disk_api_url: "https://cloud-api.yandex.net/v1/disk".to_string(),
            cloud_disk_oauth_url: "https://oauth.yandex.ru/token".to_string(),
            cloud_disk_public_url: "https://disk.yandex.ru/client/disk".to_string(),
            cloud_disk_client_id: None,
            cloud_disk_client_secret: None,
            cloud_disk_page_size: CLOUD_DISK_PAGE_SIZE,
            log_json: false,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

impl StorageConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let defaults = StorageConfig::default();

        let config = StorageConfig {
            max_key_length: env_or("VERTEX_MAX_KEY_LENGTH", MAX_KEY_LENGTH),
            breaker_failure_threshold: env_or(
                "VERTEX_BREAKER_FAILURE_THRESHOLD",
                BREAKER_FAILURE_THRESHOLD,
            ),
            breaker_cooldown_secs: env_or("VERTEX_BREAKER_COOLDOWN_SECS", BREAKER_COOLDOWN_SECS),
            retry_max_attempts: env_or("VERTEX_RETRY_MAX_ATTEMPTS", RETRY_MAX_ATTEMPTS),
            retry_base_delay_ms: env_or("VERTEX_RETRY_BASE_DELAY_MS", RETRY_BASE_DELAY_MS),
            retry_max_delay_ms: env_or("VERTEX_RETRY_MAX_DELAY_MS", RETRY_MAX_DELAY_MS),
            retry_jitter: env_or("VERTEX_RETRY_JITTER", RETRY_JITTER),
            attempt_timeout_secs: env_or("VERTEX_ATTEMPT_TIMEOUT_SECS", ATTEMPT_TIMEOUT_SECS),
            cache_memory_capacity: env_or("VERTEX_CACHE_MEMORY_CAPACITY", CACHE_MEMORY_CAPACITY),
            cache_memory_ttl_secs: env_or("VERTEX_CACHE_MEMORY_TTL_SECS", CACHE_MEMORY_TTL_SECS),
            cache_disk_ttl_secs: env_or("VERTEX_CACHE_DISK_TTL_SECS", CACHE_DISK_TTL_SECS),
            cache_dir: env_string("VERTEX_CACHE_DIR")
                .map(PathBuf::from)
                .or(defaults.cache_dir),
            fallback_path: env_string("VERTEX_FALLBACK_PATH").map(PathBuf::from),
            fallback_base_url: env_string("VERTEX_FALLBACK_BASE_URL")
                .unwrap_or(defaults.fallback_base_url),
            local_base_url: env_string("VERTEX_LOCAL_BASE_URL").unwrap_or(defaults.local_base_url),
            multipart_threshold_bytes: env_or(
                "VERTEX_MULTIPART_THRESHOLD_BYTES",
                MULTIPART_THRESHOLD_BYTES,
            ),
            presigned_max_ttl_secs: env_or("VERTEX_PRESIGNED_MAX_TTL_SECS", PRESIGNED_MAX_TTL_SECS),
            cloud_disk_api_url: env_string("VERTEX_CLOUD_DISK_API_URL")
                .unwrap_or(defaults.cloud_disk_api_url),
            cloud_disk_oauth_url: env_string("VERTEX_CLOUD_DISK_OAUTH_URL")
                .unwrap_or(defaults.cloud_disk_oauth_url),
            cloud_disk_public_url: env_string("VERTEX_CLOUD_DISK_PUBLIC_URL")
                .unwrap_or(defaults.cloud_disk_public_url),
            cloud_disk_client_id: env_string("VERTEX_CLOUD_DISK_CLIENT_ID"),
            cloud_disk_client_secret: env_string("VERTEX_CLOUD_DISK_CLIENT_SECRET"),
            cloud_disk_page_size: env_or("VERTEX_CLOUD_DISK_PAGE_SIZE", CLOUD_DISK_PAGE_SIZE),
            log_json: env_or("VERTEX_LOG_JSON", false),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.max_key_length == 0 {
            return Err(anyhow::anyhow!("VERTEX_MAX_KEY_LENGTH must be greater than 0"));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(anyhow::anyhow!(
                "VERTEX_BREAKER_FAILURE_THRESHOLD must be greater than 0"
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(anyhow::anyhow!("VERTEX_RETRY_MAX_ATTEMPTS must be at least 1"));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(anyhow::anyhow!(
                "VERTEX_RETRY_BASE_DELAY_MS ({}) cannot exceed VERTEX_RETRY_MAX_DELAY_MS ({})",
                self.retry_base_delay_ms,
                self.retry_max_delay_ms
            ));
        }
        if !(0.0..1.0).contains(&self.retry_jitter) {
            return Err(anyhow::anyhow!("VERTEX_RETRY_JITTER must be in [0.0, 1.0)"));
        }
        if self.cache_memory_capacity == 0 {
            return Err(anyhow::anyhow!(
                "VERTEX_CACHE_MEMORY_CAPACITY must be greater than 0"
            ));
        }
        if self.cloud_disk_page_size == 0 {
            return Err(anyhow::anyhow!("VERTEX_CLOUD_DISK_PAGE_SIZE must be greater than 0"));
        }
        Ok(())
    }
}
