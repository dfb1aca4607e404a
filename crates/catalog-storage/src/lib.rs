//! Catalog Storage crate - SQLite-backed graph store for catalog entities.
//!
//! Provides a WAL-mode SQLite database with migrations, a synchronous
//! repository for entities, typed relationships and persisted embeddings,
//! and the async [`EntityStore`] contract the similarity engine consumes.

pub mod db;
pub mod migrations;
pub mod repository;
pub mod store;

pub use db::Database;
pub use repository::{EmbeddingWrite, EntityRepository, StoredEmbedding, UpsertOutcome};
pub use store::{EntityStore, SqliteEntityStore};
