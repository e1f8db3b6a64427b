//! Storage connection model: one configured backend instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::storage_types::ProviderKind;

/// Credential fields that must never be displayed or logged.
pub const SECRET_CREDENTIAL_FIELDS: &[&str] = &["secretKey", "oauthToken", "refreshToken"];

/// Outcome of the last connection test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    #[default]
    Untested,
    Success,
    Failed,
}

/// A configured storage backend instance.
///
/// Owned by the persistence layer. The storage core only ever receives an
/// immutable snapshot of it; credential rotation and test results are written
/// back by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConnection {
    pub id: Uuid,
    pub name: String,
    pub provider_kind: ProviderKind,
    /// Logical root inside the backend (folder, key prefix). May be empty.
    #[serde(default)]
    pub base_path: String,
    /// Provider-specific credential shape, validated by the provider factory.
    #[serde(default)]
    pub credentials: Map<String, Value>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub last_tested_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_test_status: TestStatus,
    #[serde(default)]
    pub last_test_error: Option<String>,
}

fn default_active() -> bool {
    true
}

impl StorageConnection {
    /// Create a new, untested, active connection record.
    pub fn new(
        name: impl Into<String>,
        provider_kind: ProviderKind,
        base_path: impl Into<String>,
        credentials: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            provider_kind,
            base_path: base_path.into(),
            credentials,
            is_default: false,
            is_active: true,
            last_tested_at: None,
            last_test_status: TestStatus::Untested,
            last_test_error: None,
        }
    }

    /// Copy of the record with secret credential values masked, safe for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for field in SECRET_CREDENTIAL_FIELDS {
            if let Some(value) = copy.credentials.get_mut(*field) {
                if !value.is_null() {
                    *value = Value::String("***".to_string());
                }
            }
        }
        copy
    }
}
