//! CLI argument definitions for the catalog application.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use catalog_core::types::EntityType;

/// Catalog similarity engine: find semantically similar business objects,
/// data elements, domains and business rules.
#[derive(Parser, Debug)]
#[command(name = "catalog", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory holding the SQLite catalog.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write a default config file (if missing) and create the database.
    Init,

    /// Load entities and relationships from a JSON file.
    Import {
        file: PathBuf,
        /// Do not compute embeddings after loading.
        #[arg(long)]
        skip_embed: bool,
    },

    /// Entities of the same type most similar to ID.
    Similar {
        id: String,
        #[arg(short = 'k', default_value_t = 5)]
        k: usize,
        /// Also return related entities that are not vector matches.
        #[arg(long)]
        include_related: bool,
    },

    /// Free-text search, grouped by entity type.
    Search {
        query: String,
        /// Restrict to these types (repeatable). Defaults to all.
        #[arg(short = 't', long = "type")]
        types: Vec<EntityType>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Entities linked to ID, grouped by type.
    Related { id: String },

    /// Recompute the embedding of ID.
    Reindex { id: String },

    /// Delete ID and its relationships.
    Delete { id: String },

    /// Run one consistency sweep.
    Sweep,

    /// Entity and index counts.
    Status,

    /// Run the periodic sweeper until interrupted.
    Serve,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > CATALOG_CONFIG env var > ~/.catalog/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("CATALOG_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the data directory path.
    ///
    /// Returns `None` if not overridden (use config value).
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    /// Resolve the log filter directive.
    ///
    /// Priority: --log-level flag > config file value. `RUST_LOG` is checked
    /// separately and wins over both.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".catalog").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".catalog").join("config.toml");
    }
    PathBuf::from("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_similar() {
        let args = CliArgs::parse_from(["catalog", "similar", "BO-001", "-k", "3", "--include-related"]);
        match args.command {
            Command::Similar {
                id,
                k,
                include_related,
            } => {
                assert_eq!(id, "BO-001");
                assert_eq!(k, 3);
                assert!(include_related);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_search_types() {
        let args = CliArgs::parse_from([
            "catalog",
            "search",
            "customer",
            "--type",
            "business_object",
            "--type",
            "domain",
        ]);
        match args.command {
            Command::Search { types, limit, .. } => {
                assert_eq!(types, vec![EntityType::BusinessObject, EntityType::Domain]);
                assert!(limit.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = CliArgs::parse_from(["catalog", "status", "--config", "/tmp/c.toml", "-l", "debug"]);
        assert_eq!(args.resolve_config_path(), PathBuf::from("/tmp/c.toml"));
        assert_eq!(args.resolve_log_level("info"), "debug");
    }

    #[test]
    fn test_log_level_falls_back_to_config() {
        let args = CliArgs::parse_from(["catalog", "sweep"]);
        assert_eq!(args.resolve_log_level("warn"), "warn");
        assert!(args.resolve_data_dir().is_none());
    }
}
