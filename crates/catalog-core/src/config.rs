use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CatalogError, Result};

/// Top-level configuration for the catalog similarity engine.
///
/// Loaded from `~/.catalog/config.toml` by default. Each section corresponds
/// to one component of the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
}

impl CatalogConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CatalogConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        self.store.retry.validate("store.retry")?;
        self.embedding.retry.validate("embedding.retry")?;

        if self.store.timeout_ms == 0 {
            return Err(invalid("store.timeout_ms must be greater than zero"));
        }
        if self.embedding.timeout_ms == 0 {
            return Err(invalid("embedding.timeout_ms must be greater than zero"));
        }
        if self.embedding.dimensions == 0 {
            return Err(invalid("embedding.dimensions must be greater than zero"));
        }
        if !matches!(self.embedding.provider.as_str(), "hashing" | "onnx") {
            return Err(invalid(&format!(
                "embedding.provider must be 'hashing' or 'onnx', got '{}'",
                self.embedding.provider
            )));
        }

        let s = &self.similarity;
        if s.overfetch_factor == 0 {
            return Err(invalid("similarity.overfetch_factor must be at least 1"));
        }
        if s.max_k == 0 {
            return Err(invalid("similarity.max_k must be at least 1"));
        }
        if !s.relationship_boost.is_finite() || s.relationship_boost < 0.0 {
            return Err(invalid("similarity.relationship_boost must be a non-negative number"));
        }
        if let Some(min) = s.min_score {
            if !(-1.0..=1.0).contains(&min) {
                return Err(invalid("similarity.min_score must lie in [-1, 1]"));
            }
        }
        if !(-1.0..=1.0).contains(&s.text_threshold) {
            return Err(invalid("similarity.text_threshold must lie in [-1, 1]"));
        }
        if s.text_limit == 0 {
            return Err(invalid("similarity.text_limit must be at least 1"));
        }

        if self.sweeper.batch_size == 0 {
            return Err(invalid("sweeper.batch_size must be at least 1"));
        }
        if self.sweeper.interval_secs == 0 {
            return Err(invalid("sweeper.interval_secs must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> CatalogError {
    CatalogError::Config(message.to_string())
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory holding the SQLite catalog.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.catalog/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl GeneralConfig {
    pub fn data_path(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }
}

/// Retry parameters shared by the store and the embedding provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Cap on any single backoff sleep.
    pub max_delay_ms: u64,
    /// Fraction of each delay randomised, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            jitter: 0.2,
        }
    }
}

impl RetrySettings {
    fn validate(&self, section: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(invalid(&format!("{}.max_attempts must be at least 1", section)));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(invalid(&format!(
                "{}.max_delay_ms must not be below base_delay_ms",
                section
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(invalid(&format!("{}.jitter must lie in [0, 1]", section)));
        }
        Ok(())
    }
}

/// Entity store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Per-call timeout in milliseconds.
    pub timeout_ms: u64,
    pub retry: RetrySettings,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            retry: RetrySettings::default(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Embedding provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// "hashing" (local, deterministic) or "onnx".
    pub provider: String,
    /// Model identity. A change marks every stored embedding stale.
    pub model: String,
    /// Directory with `model.onnx` and `tokenizer.json` for the onnx provider.
    pub model_dir: Option<String>,
    pub dimensions: usize,
    /// LRU cache entries; 0 disables caching.
    pub cache_capacity: usize,
    pub timeout_ms: u64,
    pub retry: RetrySettings,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            model: "all-MiniLM-L6-v2".to_string(),
            model_dir: None,
            dimensions: 384,
            cache_capacity: 1024,
            timeout_ms: 10_000,
            retry: RetrySettings::default(),
        }
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Similarity search tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    /// Candidates fetched from the index per requested result.
    pub overfetch_factor: usize,
    /// Additive score bonus for candidates sharing graph context.
    pub relationship_boost: f64,
    /// Candidates below this cosine are dropped before boosting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f64>,
    pub max_k: usize,
    /// Budget for refreshing a stale source during `find_similar`.
    pub refresh_timeout_ms: u64,
    /// Maximum neighbours explored per node for relationship context.
    pub related_fanout: usize,
    pub text_threshold: f64,
    pub text_limit: usize,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            overfetch_factor: 2,
            relationship_boost: 0.1,
            min_score: None,
            max_k: 100,
            refresh_timeout_ms: 15_000,
            related_fanout: 50,
            text_threshold: 0.7,
            text_limit: 5,
        }
    }
}

impl SimilarityConfig {
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }
}

/// Background consistency sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Stale ids fetched per page.
    pub batch_size: usize,
    /// Budget for repairing one entity.
    pub entity_timeout_ms: u64,
    /// Quiet period after a change event before an early pass.
    pub debounce_ms: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            batch_size: 64,
            entity_timeout_ms: 20_000,
            debounce_ms: 500,
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn entity_timeout(&self) -> Duration {
        Duration::from_millis(self.entity_timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = CatalogConfig::default();
        assert_eq!(config.general.data_dir, "~/.catalog/data");
        assert_eq!(config.embedding.provider, "hashing");
        assert_eq!(config.embedding.model, "all-MiniLM-L6-v2");
        assert_eq!(config.embedding.dimensions, 384);
        assert_eq!(config.similarity.overfetch_factor, 2);
        assert!((config.similarity.relationship_boost - 0.1).abs() < f64::EPSILON);
        assert!(config.similarity.min_score.is_none());
        assert_eq!(config.similarity.max_k, 100);
        assert_eq!(config.store.retry.max_attempts, 3);
        assert_eq!(config.store.retry.max_delay_ms, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let file = create_temp_config(
            r#"
[similarity]
relationship_boost = 0.25
min_score = 0.3

[sweeper]
interval_secs = 60
"#,
        );
        let config = CatalogConfig::load(file.path()).unwrap();
        assert!((config.similarity.relationship_boost - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.similarity.min_score, Some(0.3));
        assert_eq!(config.similarity.overfetch_factor, 2);
        assert_eq!(config.sweeper.interval_secs, 60);
        assert_eq!(config.sweeper.batch_size, 64);
        assert_eq!(config.general.log_level, "info");
    }

    #[test]
    fn test_load_nested_retry_section() {
        let file = create_temp_config(
            r#"
[store.retry]
max_attempts = 5
base_delay_ms = 10

[embedding]
provider = "onnx"
model_dir = "/opt/models/minilm"
"#,
        );
        let config = CatalogConfig::load(file.path()).unwrap();
        assert_eq!(config.store.retry.max_attempts, 5);
        assert_eq!(config.store.retry.base_delay_ms, 10);
        assert_eq!(config.store.retry.max_delay_ms, 10_000);
        assert_eq!(config.embedding.retry, RetrySettings::default());
        assert_eq!(config.embedding.model_dir.as_deref(), Some("/opt/models/minilm"));
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let file = create_temp_config("[similarity]\noverfetch_factor = 0\n");
        assert!(matches!(
            CatalogConfig::load(file.path()),
            Err(CatalogError::Config(_))
        ));

        let file = create_temp_config("[embedding.retry]\nmax_attempts = 0\n");
        assert!(CatalogConfig::load(file.path()).is_err());

        let file = create_temp_config("[embedding]\nprovider = \"openai\"\n");
        assert!(CatalogConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let file = create_temp_config("this is [not valid");
        assert!(matches!(
            CatalogConfig::load(file.path()),
            Err(CatalogError::Config(_))
        ));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = CatalogConfig::load_or_default(Path::new("/nonexistent/catalog.toml"));
        assert_eq!(config.similarity.max_k, 100);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = CatalogConfig::default();
        config.similarity.relationship_boost = 0.2;
        config.sweeper.enabled = false;
        config.save(&path).unwrap();

        let loaded = CatalogConfig::load(&path).unwrap();
        assert!((loaded.similarity.relationship_boost - 0.2).abs() < f64::EPSILON);
        assert!(!loaded.sweeper.enabled);
        assert!(loaded.similarity.min_score.is_none());
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/var/lib/catalog"), PathBuf::from("/var/lib/catalog"));
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(expand_home("~/data"), PathBuf::from(home).join("data"));
        }
    }

    #[test]
    fn test_durations() {
        let config = CatalogConfig::default();
        assert_eq!(config.store.timeout(), Duration::from_millis(5_000));
        assert_eq!(config.sweeper.interval(), Duration::from_secs(300));
        assert_eq!(config.sweeper.debounce(), Duration::from_millis(500));
    }
}
