//! Shared plumbing for the `vertex` binary.

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use vertex_core::{StorageConfig, StorageConnection};
use vertex_storage::{InMemoryConnectionRepository, StorageService};

/// Initialize tracing for CLI binaries.
///
/// `RUST_LOG` selects the filter (default `info`); `json` switches to JSON lines.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Connection records from a JSON array file
pub fn load_connections(path: &Path) -> anyhow::Result<Vec<StorageConnection>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read connections file {}", path.display()))?;
    let connections: Vec<StorageConnection> = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid connections file {}", path.display()))?;
    Ok(connections)
}

/// Service over the connections declared in `path`
pub fn build_service(config: &StorageConfig, path: &Path) -> anyhow::Result<StorageService> {
    let connections = load_connections(path)?;
    tracing::debug!(count = connections.len(), "Loaded storage connections");
    let repository = Arc::new(InMemoryConnectionRepository::with_connections(connections));
    Ok(StorageService::new(repository, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vertex_core::ProviderKind;

    #[test]
    fn load_connections_reads_array() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{
                "id": "6f1c4b2e-8a43-4c3f-9d51-2b7b0f3c9a10",
                "name": "minio",
                "provider_kind": "object_storage",
                "base_path": "VertexAR",
                "credentials": {{ "endpoint": "minio:9000", "bucket": "media" }}
            }}]"#
        )
        .unwrap();

        let connections = load_connections(file.path()).unwrap();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].provider_kind, ProviderKind::ObjectStorage);
        assert_eq!(connections[0].base_path, "VertexAR");
    }

    #[test]
    fn load_connections_reports_path() {
        let err = load_connections(Path::new("/nonexistent/connections.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/connections.json"));
    }

    #[tokio::test]
    async fn build_service_serves_declared_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.json");
        let data = dir.path().join("data");
        std::fs::write(
            &path,
            serde_json::json!([{
                "id": "6f1c4b2e-8a43-4c3f-9d51-2b7b0f3c9a10",
                "name": "local",
                "provider_kind": "local",
                "credentials": { "basePath": data.to_str().unwrap() }
            }])
            .to_string(),
        )
        .unwrap();

        let service = build_service(&StorageConfig::default(), &path).unwrap();
        let listed = service.list_connections().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "local");
    }

    #[test]
    fn env_file_loading_stays_in_core() {
        // `.env` is read by StorageConfig::from_env; the CLI must not pull its own loader.
        let manifest = include_str!("../Cargo.toml");
        assert!(!manifest.lines().any(|line| line.trim_start().starts_with("dotenvy")));
    }
}
