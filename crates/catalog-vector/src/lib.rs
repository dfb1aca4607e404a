//! Catalog Vector crate - embeddings, similarity index, similarity search and
//! the consistency sweeper.
//!
//! Provides the embedding service trait with a local hashing provider (and
//! an ONNX provider behind the `onnx` feature), a cached and retried
//! embedding generator, a per-type in-memory cosine index, the pipeline that
//! keeps embeddings fresh, relationship-aware similarity search, and the
//! background sweeper. [`Catalog`] wires them together.

pub mod catalog;
pub mod embedding;
pub mod generator;
pub mod index;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod pipeline;
pub mod similarity;
pub mod sweeper;

pub use catalog::Catalog;
pub use embedding::{DynEmbeddingService, EmbeddingService, HashingEmbedding};
pub use generator::EmbeddingGenerator;
pub use index::{IndexEntry, IndexHit, SimilarityIndex};
#[cfg(feature = "onnx")]
pub use onnx::OnnxEmbeddingService;
pub use pipeline::{EmbeddingPipeline, ReindexOutcome, RepairOutcome};
pub use similarity::{Evidence, MatchedVia, RelatedEntity, SimilarityMatch, SimilarityService, TextMatch};
pub use sweeper::{ConsistencySweeper, SweepReport, SweepStatus, SweeperHandle};
