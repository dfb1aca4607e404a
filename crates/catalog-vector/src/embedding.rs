//! Embedding service trait and the built-in local provider.
//!
//! - `HashingEmbedding` maps tokens into a fixed-dimensional space with
//!   FNV-1a hashing. Deterministic, no model files or network needed; the
//!   default provider.
//! - `OnnxEmbeddingService` (feature `onnx`, see [`crate::onnx`]) runs a
//!   sentence-transformer model such as all-MiniLM-L6-v2.

use std::future::Future;
use std::pin::Pin;

use catalog_core::error::CatalogError;

/// Service for generating text embeddings.
///
/// Implementations must be deterministic for a given model: identical text
/// yields an identical vector.
pub trait EmbeddingService: Send + Sync {
    /// Generate an embedding vector for the given text.
    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>, CatalogError>> + Send;

    /// Return the dimensionality of vectors produced by this service.
    fn dimensions(&self) -> usize;

    /// Identity of the model. Stored next to each embedding so a model
    /// change marks existing embeddings stale.
    fn model_id(&self) -> &str;
}

/// Object-safe version of [`EmbeddingService`] for dynamic dispatch.
///
/// Because `EmbeddingService::embed` returns `impl Future` it is not
/// object-safe. A blanket implementation is provided so that every
/// `EmbeddingService` automatically implements `DynEmbeddingService`.
pub trait DynEmbeddingService: Send + Sync {
    fn embed_boxed<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<f32>, CatalogError>> + Send + 'a>>;

    fn dimensions(&self) -> usize;

    fn model_id(&self) -> &str;
}

impl<T: EmbeddingService> DynEmbeddingService for T {
    fn embed_boxed<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<f32>, CatalogError>> + Send + 'a>> {
        Box::pin(self.embed(text))
    }

    fn dimensions(&self) -> usize {
        EmbeddingService::dimensions(self)
    }

    fn model_id(&self) -> &str {
        EmbeddingService::model_id(self)
    }
}

// ---------------------------------------------------------------------------
// HashingEmbedding - deterministic local token hashing
// ---------------------------------------------------------------------------

/// Local bag-of-words embedding.
///
/// Each token (and each adjacent token pair, at lower weight) is hashed to
/// three positions with non-negative weights, then the vector is
/// L2-normalised. Texts sharing vocabulary score high cosine similarity;
/// disjoint texts score zero.
#[derive(Debug, Clone)]
pub struct HashingEmbedding {
    dimensions: usize,
    model_id: String,
}

impl HashingEmbedding {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            model_id: format!("hashing-fnv1a-{}", dimensions.max(1)),
        }
    }

    /// Override the reported model identity.
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    fn tokens(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() > 1)
            .map(str::to_string)
            .collect()
    }

    fn add_feature(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let positions = [
            (fnv1a(feature, 0), 1.0f32),
            (fnv1a(feature, 1), 0.7),
            (fnv1a(feature, 2), 0.5),
        ];
        for (hash, scale) in positions {
            vector[hash as usize % self.dimensions] += weight * scale;
        }
    }

    fn hash_to_vector(&self, text: &str) -> Result<Vec<f32>, CatalogError> {
        let tokens = Self::tokens(text);
        if tokens.is_empty() {
            return Err(CatalogError::InsufficientData(
                "text has no embeddable tokens".to_string(),
            ));
        }

        let mut vector = vec![0.0f32; self.dimensions];
        for token in &tokens {
            self.add_feature(&mut vector, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.add_feature(&mut vector, bigram.as_bytes(), 0.5);
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

impl Default for HashingEmbedding {
    fn default() -> Self {
        Self::new(384)
    }
}

impl EmbeddingService for HashingEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CatalogError> {
        self.hash_to_vector(text)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Seeded FNV-1a.
fn fnv1a(data: &[u8], seed: u8) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for &byte in data.iter().chain(std::iter::once(&seed)) {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// Cosine similarity of two vectors in f64. Zero if either has no magnitude
/// or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum();
    let mag_a = l2_norm(a);
    let mag_b = l2_norm(b);
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

pub fn l2_norm(v: &[f32]) -> f64 {
    v.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt()
}
