//! Vertex Storage Library
//!
//! This crate provides a uniform storage abstraction over several backends
//! (local disk, S3-compatible object storage, OAuth cloud disk) and keeps
//! callers responsive while a backend is failing.
//!
//! # Storage key format
//!
//! Keys are relative, `/`-separated paths below a connection's base path.
//! Every raw key goes through [`PathPolicy`] before a provider sees it, so
//! `..` segments, absolute paths and drive prefixes never reach a backend.
//!
//! # Resilience
//!
//! [`StorageService`] wraps each provider in retry, a per-connection circuit
//! breaker and an attempt timeout. Uploads to a connection whose circuit is
//! open go to a local fallback when one is configured; reads fail fast.

pub mod cache;
#[cfg(feature = "storage-cloud-disk")]
pub mod cloud_disk;
pub mod factory;
#[cfg(feature = "storage-local")]
pub mod local;
pub mod path_policy;
pub mod repository;
pub mod resilience;
#[cfg(feature = "storage-s3")]
pub mod s3;
pub mod service;
#[cfg(test)]
mod testing;
pub mod traits;

// Re-export commonly used types
pub use cache::{CacheConfig, UsageStatsCache};
#[cfg(feature = "storage-cloud-disk")]
pub use cloud_disk::{CloudDiskProvider, CloudDiskSettings, CloudDiskToken};
pub use factory::ProviderFactory;
#[cfg(feature = "storage-local")]
pub use local::LocalDiskProvider;
pub use path_policy::{PathPolicy, StorageKey};
pub use repository::{ConnectionRepository, CredentialRefreshHandler, InMemoryConnectionRepository};
pub use resilience::{
    BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker, CircuitRegistry,
    FallbackCoordinator, ResilientProvider, RetryConfig, RetryPolicy, UploadOutcome,
};
#[cfg(feature = "storage-s3")]
pub use s3::{ObjectStorageOptions, ObjectStorageProvider, ObjectStorageSettings};
pub use service::StorageService;
pub use traits::{
    ConnectionReport, KeyStream, PresignMethod, StorageError, StorageProvider, StorageResult,
    UsageStats,
};
pub use vertex_core::{ProviderKind, StorageConnection};
