//! Vertex Core Library
//!
//! This crate provides the domain types, error presentation contract and
//! configuration shared by the storage core and its callers.

pub mod config;
pub mod error;
pub mod models;
pub mod storage_types;

// Re-export commonly used types
pub use config::StorageConfig;
pub use error::{ErrorMetadata, LogLevel};
pub use models::{StorageConnection, TestStatus};
pub use storage_types::ProviderKind;
