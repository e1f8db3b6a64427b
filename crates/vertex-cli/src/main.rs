//! Vertex CLI: operate storage connections from the command line.
//!
//! Connections are read from a JSON file (`--connections`). Process-wide
//! settings come from `VERTEX_*` environment variables or `.env`.

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vertex_cli::{build_service, init_tracing};
use vertex_core::{ErrorMetadata, StorageConfig};
use vertex_storage::StorageError;

#[derive(Parser)]
#[command(name = "vertex", about = "Vertex storage CLI")]
struct Cli {
    /// JSON file with an array of storage connection records
    #[arg(long, default_value = "connections.json")]
    connections: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured connections (secrets masked)
    Connections,
    /// Check connectivity of a connection
    Test {
        /// Connection UUID
        connection: Uuid,
    },
    /// Upload a local file
    Upload {
        connection: Uuid,
        /// Path to the file to upload
        file: PathBuf,
        /// Destination key below the connection root
        key: String,
    },
    /// Download a file
    Download {
        connection: Uuid,
        key: String,
        /// Where to write the file
        output: PathBuf,
    },
    /// Print the public URL of a key
    Url { connection: Uuid, key: String },
    /// Print a time-limited URL for a key
    Presign {
        connection: Uuid,
        key: String,
        /// Lifetime in seconds
        #[arg(long, default_value = "3600")]
        ttl: u64,
        /// Grant upload (PUT) instead of download (GET)
        #[arg(long)]
        upload: bool,
    },
    /// File count and total size under a prefix
    Usage {
        connection: Uuid,
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// List keys under a prefix
    List {
        connection: Uuid,
        #[arg(long, default_value = "")]
        prefix: String,
        /// Stop after this many keys
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize response")?;
    println!("{}", out);
    Ok(())
}

/// Cancels the returned token on Ctrl-C
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling transfer");
            trigger.cancel();
        }
    });
    cancel
}

async fn run(cli: Cli, config: StorageConfig) -> anyhow::Result<()> {
    let service = build_service(&config, &cli.connections)?;

    match cli.command {
        Commands::Connections => {
            print_json(&service.list_connections().await?)?;
        }
        Commands::Test { connection } => {
            let report = service.test_connection(connection).await?;
            print_json(&report)?;
        }
        Commands::Upload {
            connection,
            file,
            key,
        } => {
            let outcome = service
                .upload_file(connection, &file, &key, cancel_on_interrupt())
                .await?;
            print_json(&outcome)?;
        }
        Commands::Download {
            connection,
            key,
            output,
        } => {
            service
                .download_file(connection, &key, &output, cancel_on_interrupt())
                .await?;
            print_json(&serde_json::json!({ "key": key, "path": output }))?;
        }
        Commands::Url { connection, key } => {
            let url = service.get_public_url(connection, &key).await?;
            print_json(&serde_json::json!({ "url": url }))?;
        }
        Commands::Presign {
            connection,
            key,
            ttl,
            upload,
        } => {
            let ttl = Duration::from_secs(ttl);
            let url = if upload {
                service.get_presigned_upload_url(connection, &key, ttl).await?
            } else {
                service
                    .get_presigned_download_url(connection, &key, ttl)
                    .await?
            };
            print_json(&serde_json::json!({ "url": url, "expires_in": ttl.as_secs() }))?;
        }
        Commands::Usage { connection, prefix } => {
            let stats = service.get_usage_stats(connection, &prefix).await?;
            print_json(&stats)?;
        }
        Commands::List {
            connection,
            prefix,
            limit,
        } => {
            let stream = service.list_keys(connection, &prefix).await?;
            let keys: Vec<String> = stream
                .map_ok(|key| key.as_str().to_string())
                .take(limit.unwrap_or(usize::MAX))
                .try_collect()
                .await?;
            print_json(&keys)?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = StorageConfig::from_env().context("Failed to load configuration")?;
    init_tracing(config.log_json);

    let cli = Cli::parse();

    if let Err(err) = run(cli, config).await {
        // Storage failures are reported by taxonomy code, never backend wording.
        if let Some(storage) = err.downcast_ref::<StorageError>() {
            tracing::debug!(error = %storage, "Storage operation failed");
            print_json(&serde_json::json!({
                "error": storage.code(),
                "message": storage.client_message(),
                "recoverable": storage.is_recoverable(),
            }))?;
            std::process::exit(1);
        }
        return Err(err);
    }

    Ok(())
}
