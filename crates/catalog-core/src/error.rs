use thiserror::Error;

/// Top-level error type for the catalog similarity engine.
///
/// Only the two `*Unavailable` variants are transient. Every component that
/// talks to an external collaborator (the entity store, the embedding model)
/// retries those at the point of occurrence and surfaces them unchanged once
/// retries are exhausted. Everything else is returned to the caller at once.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CatalogError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Entity store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Embedding model unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl CatalogError {
    /// Whether a retry of the failed call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CatalogError::StoreUnavailable(_) | CatalogError::EmbeddingUnavailable(_)
        )
    }

    /// Short machine-readable tag, used in logs and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            CatalogError::NotFound(_) => "not_found",
            CatalogError::Integrity(_) => "integrity_error",
            CatalogError::StoreUnavailable(_) => "store_unavailable",
            CatalogError::EmbeddingUnavailable(_) => "embedding_unavailable",
            CatalogError::InsufficientData(_) => "insufficient_data",
            CatalogError::InvalidArgument(_) => "invalid_argument",
            CatalogError::Storage(_) => "storage_error",
            CatalogError::Config(_) => "config_error",
            CatalogError::Io(_) => "io_error",
            CatalogError::Serialization(_) => "serialization_error",
            CatalogError::ShuttingDown => "shutting_down",
        }
    }
}

impl From<toml::de::Error> for CatalogError {
    fn from(err: toml::de::Error) -> Self {
        CatalogError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for CatalogError {
    fn from(err: toml::ser::Error) -> Self {
        CatalogError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        CatalogError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for catalog operations.
pub type Result<T> = std::result::Result<T, CatalogError>;
