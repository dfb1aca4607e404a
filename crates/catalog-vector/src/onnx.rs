//! Sentence-transformer embeddings through ONNX Runtime.
//!
//! Expects a model directory containing `model.onnx` (an export of e.g.
//! all-MiniLM-L6-v2) and the matching HuggingFace `tokenizer.json`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use ort::session::Session;
use ort::value::TensorRef;
use tokenizers::Tokenizer;
use tracing::info;

use catalog_core::error::CatalogError;

use crate::embedding::EmbeddingService;

/// ONNX Runtime-backed embedding service.
///
/// The model should accept `input_ids`, `attention_mask` and
/// `token_type_ids` as i64 inputs and produce token-level embeddings.
/// Masked mean pooling and L2 normalisation yield one vector per text.
pub struct OnnxEmbeddingService {
    session: Arc<Mutex<Session>>,
    tokenizer: Arc<Tokenizer>,
    dimensions: usize,
    model_id: String,
}

impl std::fmt::Debug for OnnxEmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxEmbeddingService")
            .field("model_id", &self.model_id)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

impl OnnxEmbeddingService {
    /// Load a model directory. `model_id` is recorded with every embedding.
    pub fn from_directory(model_dir: &Path, model_id: &str) -> Result<Self, CatalogError> {
        Self::from_files(
            &model_dir.join("model.onnx"),
            &model_dir.join("tokenizer.json"),
            model_id,
        )
    }

    pub fn from_files(
        model_path: &Path,
        tokenizer_path: &Path,
        model_id: &str,
    ) -> Result<Self, CatalogError> {
        if !model_path.exists() {
            return Err(CatalogError::Config(format!(
                "ONNX model not found at {}",
                model_path.display()
            )));
        }
        if !tokenizer_path.exists() {
            return Err(CatalogError::Config(format!(
                "Tokenizer not found at {}",
                tokenizer_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e| CatalogError::Config(format!("ONNX session builder: {}", e)))?
            .with_intra_threads(1)
            .map_err(|e| CatalogError::Config(format!("ONNX set threads: {}", e)))?
            .commit_from_file(model_path)
            .map_err(|e| CatalogError::Config(format!("ONNX load model: {}", e)))?;

        // Output is [batch, seq_len, hidden_dim]; fall back to MiniLM's width.
        let dimensions = session
            .outputs()
            .first()
            .and_then(|out| out.dtype().tensor_shape())
            .and_then(|shape| shape.last().copied())
            .map(|d| if d > 0 { d as usize } else { 384 })
            .unwrap_or(384);

        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| CatalogError::Config(format!("Failed to load tokenizer: {}", e)))?;

        info!(
            model = %model_path.display(),
            model_id,
            dimensions,
            "Loaded ONNX embedding model"
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            tokenizer: Arc::new(tokenizer),
            dimensions,
            model_id: model_id.to_string(),
        })
    }

    fn embed_sync(
        session: &Mutex<Session>,
        tokenizer: &Tokenizer,
        text: &str,
    ) -> Result<Vec<f32>, CatalogError> {
        if text.trim().is_empty() {
            return Err(CatalogError::InsufficientData("Cannot embed empty text".to_string()));
        }
        let unavailable = |what: &str, e: String| {
            CatalogError::EmbeddingUnavailable(format!("{}: {}", what, e))
        };

        let encoding = tokenizer
            .encode(text, true)
            .map_err(|e| CatalogError::InvalidArgument(format!("Tokenization failed: {}", e)))?;

        let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let attention_mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&m| m as i64)
            .collect();
        let token_type_ids: Vec<i64> = encoding.get_type_ids().iter().map(|&t| t as i64).collect();
        let seq_len = input_ids.len();

        let ids_array = ndarray::Array2::from_shape_vec((1, seq_len), input_ids)
            .map_err(|e| unavailable("input_ids array", e.to_string()))?;
        let mask_array = ndarray::Array2::from_shape_vec((1, seq_len), attention_mask.clone())
            .map_err(|e| unavailable("attention_mask array", e.to_string()))?;
        let type_array = ndarray::Array2::from_shape_vec((1, seq_len), token_type_ids)
            .map_err(|e| unavailable("token_type_ids array", e.to_string()))?;

        let ids_ref = TensorRef::from_array_view(&ids_array)
            .map_err(|e| unavailable("input_ids tensor", e.to_string()))?;
        let mask_ref = TensorRef::from_array_view(&mask_array)
            .map_err(|e| unavailable("attention_mask tensor", e.to_string()))?;
        let type_ref = TensorRef::from_array_view(&type_array)
            .map_err(|e| unavailable("token_type_ids tensor", e.to_string()))?;

        let mut session = session
            .lock()
            .map_err(|e| unavailable("session lock poisoned", e.to_string()))?;
        let outputs = session
            .run(ort::inputs![ids_ref, mask_ref, type_ref])
            .map_err(|e| unavailable("ONNX inference failed", e.to_string()))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| unavailable("extract embeddings", e.to_string()))?;
        let hidden_dim = match shape.iter().copied().collect::<Vec<i64>>().as_slice() {
            [_, _, hidden] if *hidden > 0 => *hidden as usize,
            other => {
                return Err(unavailable("unexpected output shape", format!("{:?}", other)));
            }
        };

        let mut pooled = vec![0.0f32; hidden_dim];
        let mut count = 0.0f32;
        for (tok_idx, &mask_val) in attention_mask.iter().enumerate() {
            if mask_val > 0 {
                let offset = tok_idx * hidden_dim;
                for (dim, slot) in pooled.iter_mut().enumerate() {
                    *slot += data[offset + dim];
                }
                count += 1.0;
            }
        }
        if count > 0.0 {
            for val in &mut pooled {
                *val /= count;
            }
        }

        let norm: f32 = pooled.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for val in &mut pooled {
                *val /= norm;
            }
        }
        Ok(pooled)
    }
}

impl EmbeddingService for OnnxEmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CatalogError> {
        // Inference is CPU-bound; run on a blocking thread.
        let session = Arc::clone(&self.session);
        let tokenizer = Arc::clone(&self.tokenizer);
        let text = text.to_string();

        tokio::task::spawn_blocking(move || Self::embed_sync(&session, &tokenizer, &text))
            .await
            .map_err(|e| CatalogError::EmbeddingUnavailable(format!("Embedding task failed: {}", e)))?
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_is_config_error() {
        let result = OnnxEmbeddingService::from_directory(Path::new("/nonexistent"), "minilm");
        assert!(matches!(result, Err(CatalogError::Config(_))));
    }
}
