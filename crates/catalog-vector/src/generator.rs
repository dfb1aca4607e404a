//! Embedding Generator: provider calls with caching, timeout and retry,
//! plus the per-entity locks that make refreshes single-flight.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use catalog_core::config::EmbeddingConfig;
use catalog_core::error::{CatalogError, Result};
use catalog_core::retry::RetryPolicy;
use catalog_core::types::EntityId;

use crate::embedding::DynEmbeddingService;

type CacheKey = [u8; 32];

/// Wraps an embedding provider.
///
/// Identical text under the same model always maps to the same vector, so
/// results are cached by `SHA-256(model id, text)`.
pub struct EmbeddingGenerator {
    provider: Arc<dyn DynEmbeddingService>,
    cache: Option<Mutex<LruCache<CacheKey, Arc<[f32]>>>>,
    retry: RetryPolicy,
    timeout: Duration,
    locks: EntityLocks,
}

impl EmbeddingGenerator {
    pub fn new(provider: Arc<dyn DynEmbeddingService>, config: &EmbeddingConfig) -> Self {
        Self::with_policy(
            provider,
            RetryPolicy::from(&config.retry),
            config.timeout(),
            config.cache_capacity,
        )
    }

    pub fn with_policy(
        provider: Arc<dyn DynEmbeddingService>,
        retry: RetryPolicy,
        timeout: Duration,
        cache_capacity: usize,
    ) -> Self {
        Self {
            provider,
            cache: NonZeroUsize::new(cache_capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            retry,
            timeout,
            locks: EntityLocks::default(),
        }
    }

    pub fn model_id(&self) -> &str {
        self.provider.model_id()
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    pub fn locks(&self) -> &EntityLocks {
        &self.locks
    }

    /// Embed `text`.
    ///
    /// Blank text fails with `InsufficientData`. Timeouts and provider
    /// outages are retried, then surface as `EmbeddingUnavailable`. A vector
    /// of the wrong length or with non-finite components is rejected.
    pub async fn embed(&self, text: &str) -> Result<Arc<[f32]>> {
        if text.trim().is_empty() {
            return Err(CatalogError::InsufficientData(
                "no text to embed".to_string(),
            ));
        }

        let key = self.cache_key(text);
        if let Some(hit) = self.cached(&key) {
            debug!(model = self.model_id(), "Embedding cache hit");
            return Ok(hit);
        }

        let timeout = self.timeout;
        let provider = &self.provider;
        let raw = self
            .retry
            .run("embed", move || async move {
                match tokio::time::timeout(timeout, provider.embed_boxed(text)).await {
                    Ok(result) => result,
                    Err(_) => Err(CatalogError::EmbeddingUnavailable(format!(
                        "embedding timed out after {}ms",
                        timeout.as_millis()
                    ))),
                }
            })
            .await?;

        let expected = self.dimensions();
        if raw.len() != expected {
            warn!(expected, actual = raw.len(), "Provider returned wrong dimension");
            return Err(CatalogError::EmbeddingUnavailable(format!(
                "provider returned {} dimensions, expected {}",
                raw.len(),
                expected
            )));
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(CatalogError::EmbeddingUnavailable(
                "provider returned non-finite values".to_string(),
            ));
        }

        let vector: Arc<[f32]> = raw.into();
        if let Some(cache) = &self.cache {
            if let Ok(mut cache) = cache.lock() {
                cache.put(key, Arc::clone(&vector));
            }
        }
        Ok(vector)
    }

    fn cached(&self, key: &CacheKey) -> Option<Arc<[f32]>> {
        let cache = self.cache.as_ref()?;
        let mut cache = cache.lock().ok()?;
        cache.get(key).cloned()
    }

    fn cache_key(&self, text: &str) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(self.model_id().as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        hasher.finalize().into()
    }
}

/// Per-entity lock plus a counter of completed recomputations.
///
/// The counter lets a caller that queued behind a running recompute detect
/// that the work it asked for has already been done.
#[derive(Debug, Default)]
pub struct EntitySlot {
    pub lock: tokio::sync::Mutex<()>,
    completed: AtomicU64,
}

impl EntitySlot {
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn mark_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Registry of [`EntitySlot`]s keyed by entity id.
///
/// A slot lives only while some caller holds it; the last [`SlotHandle`] to
/// drop removes it from the map.
#[derive(Debug, Default)]
pub struct EntityLocks {
    slots: Mutex<HashMap<EntityId, Arc<EntitySlot>>>,
}

impl EntityLocks {
    pub fn slot(&self, id: &EntityId) -> SlotHandle<'_> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = Arc::clone(slots.entry(id.clone()).or_default());
        SlotHandle {
            locks: self,
            id: id.clone(),
            slot,
        }
    }

    fn release(&self, id: &EntityId, slot: &Arc<EntitySlot>) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one in the handle being dropped.
        let idle = slots
            .get(id)
            .is_some_and(|held| Arc::ptr_eq(held, slot) && Arc::strong_count(slot) == 2);
        if idle {
            slots.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A caller's claim on an [`EntitySlot`].
///
/// Declare lock guards after the handle so they drop first.
#[derive(Debug)]
pub struct SlotHandle<'a> {
    locks: &'a EntityLocks,
    id: EntityId,
    slot: Arc<EntitySlot>,
}

impl std::ops::Deref for SlotHandle<'_> {
    type Target = EntitySlot;

    fn deref(&self) -> &EntitySlot {
        &self.slot
    }
}

impl Drop for SlotHandle<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.id, &self.slot);
    }
}
