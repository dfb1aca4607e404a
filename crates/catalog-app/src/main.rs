//! Catalog application binary - composition root.
//!
//! Ties the catalog crates into a single executable:
//! 1. Load configuration from TOML
//! 2. Initialize tracing
//! 3. Open the SQLite entity store
//! 4. Build the embedding provider and the `Catalog`
//! 5. Run one command, printing JSON to stdout

mod cli;
mod import;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use serde_json::json;

use catalog_core::config::{expand_home, CatalogConfig};
use catalog_core::error::{CatalogError, Result};
use catalog_core::types::EntityId;
use catalog_storage::{EntityStore, SqliteEntityStore};
use catalog_vector::embedding::DynEmbeddingService;
use catalog_vector::{Catalog, HashingEmbedding};

use crate::cli::{CliArgs, Command};

/// Load the config file if it exists. A missing file means defaults; a file
/// that exists but does not parse is an error.
fn load_config(path: &Path) -> Result<CatalogConfig> {
    if path.exists() {
        CatalogConfig::load(path)
    } else {
        Ok(CatalogConfig::default())
    }
}

/// Build the embedding provider named in the config.
fn build_provider(config: &CatalogConfig) -> Result<Arc<dyn DynEmbeddingService>> {
    match config.embedding.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedding::new(config.embedding.dimensions))),
        #[cfg(feature = "onnx")]
        "onnx" => {
            let dir = config.embedding.model_dir.as_deref().ok_or_else(|| {
                CatalogError::Config("embedding.model_dir is required for the onnx provider".into())
            })?;
            let service = catalog_vector::OnnxEmbeddingService::from_directory(
                &expand_home(dir),
                &config.embedding.model,
            )?;
            Ok(Arc::new(service))
        }
        #[cfg(not(feature = "onnx"))]
        "onnx" => Err(CatalogError::Config(
            "this build does not include the onnx provider; rebuild with --features onnx".into(),
        )),
        other => Err(CatalogError::Config(format!(
            "unknown embedding provider '{}'",
            other
        ))),
    }
}

fn database_path(data_dir: &Path) -> PathBuf {
    data_dir.join("catalog.db")
}

/// Open the store and compose the catalog. Loads persisted embeddings into
/// the index when `rebuild` is set.
async fn open_catalog(config: &CatalogConfig, data_dir: &Path, rebuild: bool) -> Result<Catalog> {
    let db_path = database_path(data_dir);
    let store: Arc<dyn EntityStore> = Arc::new(SqliteEntityStore::open(&db_path, &config.store)?);
    tracing::info!(path = %db_path.display(), "SQLite catalog opened");

    let provider = build_provider(config)?;
    let catalog = Catalog::new(store, provider, config);
    if rebuild {
        let loaded = catalog.rebuild_index().await?;
        tracing::debug!(loaded, "Index loaded from store");
    }
    Ok(catalog)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(args: CliArgs, config: CatalogConfig, config_path: PathBuf) -> Result<()> {
    let data_dir = args
        .resolve_data_dir()
        .map(|d| expand_home(&d))
        .unwrap_or_else(|| config.general.data_path());

    match args.command {
        Command::Init => {
            std::fs::create_dir_all(&data_dir)?;
            if !config_path.exists() {
                config.save(&config_path)?;
                tracing::info!(path = %config_path.display(), "Default configuration written");
            }
            let db_path = database_path(&data_dir);
            SqliteEntityStore::open(&db_path, &config.store)?;
            print_json(&json!({
                "config": config_path.display().to_string(),
                "database": db_path.display().to_string(),
            }))
        }
        Command::Import { file, skip_embed } => {
            let catalog = open_catalog(&config, &data_dir, false).await?;
            let contents = import::CatalogFile::read(&file)?;
            let report = import::import(&catalog, contents).await?;
            let sweep = if skip_embed {
                None
            } else {
                Some(catalog.sweep_now().await?)
            };
            print_json(&json!({ "import": report, "sweep": sweep }))
        }
        Command::Similar {
            id,
            k,
            include_related,
        } => {
            let catalog = open_catalog(&config, &data_dir, true).await?;
            let matches = catalog
                .find_similar(&EntityId::from(id), k, include_related)
                .await?;
            print_json(&matches)
        }
        Command::Search {
            query,
            types,
            limit,
            threshold,
        } => {
            let catalog = open_catalog(&config, &data_dir, true).await?;
            let grouped = catalog.search_text(&query, &types, limit, threshold).await?;
            print_json(&grouped)
        }
        Command::Related { id } => {
            let catalog = open_catalog(&config, &data_dir, false).await?;
            print_json(&catalog.related(&EntityId::from(id)).await?)
        }
        Command::Reindex { id } => {
            let catalog = open_catalog(&config, &data_dir, false).await?;
            print_json(&catalog.trigger_reindex(&EntityId::from(id)).await?)
        }
        Command::Delete { id } => {
            let catalog = open_catalog(&config, &data_dir, false).await?;
            let id = EntityId::from(id);
            catalog.delete_entity(&id).await?;
            print_json(&json!({ "deleted": id }))
        }
        Command::Sweep => {
            let catalog = open_catalog(&config, &data_dir, false).await?;
            print_json(&catalog.sweep_now().await?)
        }
        Command::Status => {
            let catalog = open_catalog(&config, &data_dir, true).await?;
            let entities = catalog.store().count().await?;
            print_json(&json!({
                "model": catalog.model_id(),
                "entities": entities,
                "indexed": catalog.index().len(),
                "sweep": catalog.sweep_status(),
            }))
        }
        Command::Serve => {
            if !config.sweeper.enabled {
                return Err(CatalogError::Config(
                    "sweeper.enabled is false; nothing to serve".into(),
                ));
            }
            let catalog = open_catalog(&config, &data_dir, true).await?;
            let handle = catalog.start_sweeper();
            tracing::info!("Sweeper running; press Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutdown requested");
            handle.stop().await?;
            print_json(&catalog.sweep_status())
        }
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config (needed before tracing for the log level).
    let config_path = args.resolve_config_path();
    let config = load_config(&config_path)?;

    // Tracing. RUST_LOG > --log-level > config.
    let level = args.resolve_log_level(&config.general.log_level);
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&level)),
        )
        .init();

    tracing::info!("Starting catalog v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!(path = %config_path.display(), "Configuration resolved");

    if let Err(e) = run(args, config, config_path).await {
        tracing::error!(kind = e.kind(), error = %e, "Command failed");
        eprintln!(
            "{}",
            json!({ "error": { "kind": e.kind(), "message": e.to_string() } })
        );
        std::process::exit(1);
    }
    Ok(())
}
