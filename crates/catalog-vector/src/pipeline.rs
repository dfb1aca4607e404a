//! Embedding pipeline.
//!
//! Owns the path from a stale entity to a fresh, indexed embedding:
//! read content, embed, compare-and-set into the store, then upsert into
//! the index. Every path takes the entity's slot lock, so one entity is never
//! recomputed twice at once.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use catalog_core::error::{CatalogError, Result};
use catalog_core::events::{CatalogEvent, EventBus};
use catalog_core::types::{Entity, EntityId};
use catalog_storage::{EmbeddingWrite, EntityStore};

use crate::generator::{EmbeddingGenerator, EntitySlot};
use crate::index::{IndexEntry, SimilarityIndex};

/// Times the compare-and-set is re-attempted when content changes mid-embed.
const MAX_SUPERSEDED_RETRIES: usize = 3;

const REBUILD_PAGE: usize = 500;

/// Result of a refresh or forced reindex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReindexOutcome {
    /// A new embedding was computed, persisted and indexed.
    Refreshed { version: u64 },
    /// The stored embedding already matched the content.
    AlreadyCurrent { version: u64 },
    /// A concurrent recompute finished while this call waited.
    Absorbed { version: u64 },
}

impl ReindexOutcome {
    pub fn version(&self) -> u64 {
        match self {
            ReindexOutcome::Refreshed { version }
            | ReindexOutcome::AlreadyCurrent { version }
            | ReindexOutcome::Absorbed { version } => *version,
        }
    }
}

/// Result of a sweeper repair of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    Repaired { version: u64 },
    /// Fresh by the time the lock was taken.
    Current,
    /// No description: embedding dropped from index and store.
    Cleared,
    /// Deleted before the repair ran.
    Vanished,
}

pub struct EmbeddingPipeline {
    store: Arc<dyn EntityStore>,
    generator: Arc<EmbeddingGenerator>,
    index: Arc<SimilarityIndex>,
    events: EventBus,
}

impl EmbeddingPipeline {
    pub fn new(
        store: Arc<dyn EntityStore>,
        generator: Arc<EmbeddingGenerator>,
        index: Arc<SimilarityIndex>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            generator,
            index,
            events,
        }
    }

    pub fn model_id(&self) -> &str {
        self.generator.model_id()
    }

    /// Make sure `id` has a current embedding, recomputing only if stale.
    ///
    /// Returns the entity as persisted after the refresh.
    pub async fn ensure_fresh(&self, id: &EntityId) -> Result<(Entity, ReindexOutcome)> {
        let slot = self.generator.locks().slot(id);
        let _guard = slot.lock.lock().await;

        let entity = self.store.get(id).await?;
        if !entity.has_embeddable_content() {
            return Err(insufficient(&entity));
        }
        if !entity.is_stale(self.model_id()) {
            self.ensure_indexed(&entity)?;
            let version = entity.embedding_version;
            return Ok((entity, ReindexOutcome::AlreadyCurrent { version }));
        }

        let (entity, version) = self.compute(entity, &slot).await?;
        Ok((entity, ReindexOutcome::Refreshed { version }))
    }

    /// Force a recompute of `id`.
    ///
    /// A caller that queued behind a recompute of the same entity which
    /// completed while it waited returns `Absorbed` without calling the
    /// provider again.
    pub async fn reindex(&self, id: &EntityId) -> Result<ReindexOutcome> {
        let slot = self.generator.locks().slot(id);
        let seen = slot.completed();
        let _guard = slot.lock.lock().await;

        let entity = self.store.get(id).await?;
        if slot.completed() != seen {
            debug!(entity_id = %id, "Reindex absorbed by concurrent recompute");
            return Ok(ReindexOutcome::Absorbed {
                version: entity.embedding_version,
            });
        }
        if !entity.has_embeddable_content() {
            return Err(insufficient(&entity));
        }

        let (_, version) = self.compute(entity, &slot).await?;
        Ok(ReindexOutcome::Refreshed { version })
    }

    /// Sweeper entry point: bring one entity back to a consistent state.
    pub async fn repair(&self, id: &EntityId) -> Result<RepairOutcome> {
        let slot = self.generator.locks().slot(id);
        let _guard = slot.lock.lock().await;

        let entity = match self.store.get(id).await {
            Ok(entity) => entity,
            Err(CatalogError::NotFound(_)) => return Ok(RepairOutcome::Vanished),
            Err(e) => return Err(e),
        };
        if !entity.has_embeddable_content() {
            self.clear_locked(&entity).await?;
            return Ok(RepairOutcome::Cleared);
        }
        if !entity.is_stale(self.model_id()) {
            self.ensure_indexed(&entity)?;
            return Ok(RepairOutcome::Current);
        }
        let (_, version) = self.compute(entity, &slot).await?;
        Ok(RepairOutcome::Repaired { version })
    }

    /// Remove an entity: index first, then the store.
    pub async fn remove_entity(&self, id: &EntityId) -> Result<()> {
        let slot = self.generator.locks().slot(id);
        let _guard = slot.lock.lock().await;
        let entity = self.store.get(id).await?;
        self.index.remove(id, entity.entity_type)?;
        self.store.delete(id).await?;
        info!(entity_id = %id, "Entity removed from index and store");
        Ok(())
    }

    /// Drop the embedding of `id` from index and store.
    pub async fn clear(&self, id: &EntityId) -> Result<()> {
        let slot = self.generator.locks().slot(id);
        let _guard = slot.lock.lock().await;
        let entity = self.store.get(id).await?;
        self.clear_locked(&entity).await
    }

    /// Load every persisted embedding of the current model into the index.
    pub async fn rebuild_index(&self) -> Result<usize> {
        let model = self.model_id().to_string();
        let mut after: Option<EntityId> = None;
        let mut loaded = 0;
        loop {
            let page = self
                .store
                .list_embedded(&model, after.clone(), REBUILD_PAGE)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id.clone());
            let full = page.len() == REBUILD_PAGE;

            for row in page {
                let entry = IndexEntry::from(row);
                match self.index.load(std::iter::once(entry.clone())) {
                    Ok(n) => loaded += n,
                    Err(e) => warn!(entity_id = %entry.id, error = %e, "Skipping unloadable embedding"),
                }
            }
            if !full {
                break;
            }
        }
        info!(loaded, model = %model, "Similarity index rebuilt");
        Ok(loaded)
    }

    async fn clear_locked(&self, entity: &Entity) -> Result<()> {
        self.index.remove(&entity.id, entity.entity_type)?;
        if entity.embedding.is_some() {
            self.store.clear_embedding(&entity.id).await?;
            debug!(entity_id = %entity.id, "Embedding cleared");
        }
        Ok(())
    }

    /// Index the stored embedding if the index lacks it or holds an older one.
    fn ensure_indexed(&self, entity: &Entity) -> Result<()> {
        let Some(vector) = &entity.embedding else {
            return Ok(());
        };
        let indexed = self
            .index
            .get(&entity.id, entity.entity_type)
            .map(|e| e.version);
        if indexed.map_or(true, |v| v < entity.embedding_version) {
            self.index.upsert(
                &entity.id,
                entity.entity_type,
                vector.clone().into(),
                entity.embedding_version,
            )?;
        }
        Ok(())
    }

    /// Embed, compare-and-set, index. The caller holds the slot lock.
    async fn compute(&self, mut entity: Entity, slot: &EntitySlot) -> Result<(Entity, u64)> {
        let model = self.model_id().to_string();

        for _ in 0..MAX_SUPERSEDED_RETRIES {
            let text = entity.embedding_text();
            let vector = match self.generator.embed(&text).await {
                Ok(vector) => vector,
                Err(e) => {
                    warn!(entity_id = %entity.id, error = %e, "Embedding failed");
                    self.events.publish(CatalogEvent::EmbeddingFailed {
                        id: entity.id.clone(),
                        reason: e.to_string(),
                        timestamp: Utc::now(),
                    });
                    return Err(e);
                }
            };

            let write = self
                .store
                .record_embedding(&entity.id, &entity.content_hash, &model, vector.to_vec())
                .await?;
            match write {
                EmbeddingWrite::Recorded { version } => {
                    self.index
                        .upsert(&entity.id, entity.entity_type, Arc::clone(&vector), version)?;
                    slot.mark_completed();

                    info!(entity_id = %entity.id, version, "Embedding refreshed");
                    self.events.publish(CatalogEvent::EmbeddingRefreshed {
                        id: entity.id.clone(),
                        version,
                        timestamp: Utc::now(),
                    });

                    entity.embedding = Some(vector.to_vec());
                    entity.embedding_version = version;
                    entity.embedded_hash = Some(entity.content_hash.clone());
                    entity.embedding_model = Some(model);
                    return Ok((entity, version));
                }
                EmbeddingWrite::Superseded => {
                    debug!(entity_id = %entity.id, "Content changed while embedding, retrying");
                    entity = self.store.get(&entity.id).await?;
                    if !entity.has_embeddable_content() {
                        return Err(insufficient(&entity));
                    }
                }
            }
        }

        Err(CatalogError::EmbeddingUnavailable(format!(
            "content of {} kept changing while embedding",
            entity.id
        )))
    }
}

fn insufficient(entity: &Entity) -> CatalogError {
    CatalogError::InsufficientData(format!(
        "entity {} has no description to embed",
        entity.id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use catalog_core::retry::RetryPolicy;
    use catalog_core::types::{EntityDraft, EntityType};
    use catalog_storage::SqliteEntityStore;

    use crate::embedding::HashingEmbedding;

    fn pipeline() -> (EmbeddingPipeline, Arc<dyn EntityStore>, Arc<SimilarityIndex>) {
        let store: Arc<dyn EntityStore> = Arc::new(SqliteEntityStore::in_memory().unwrap());
        let generator = Arc::new(EmbeddingGenerator::with_policy(
            Arc::new(HashingEmbedding::new(64)),
            RetryPolicy::immediate(2),
            Duration::from_secs(5),
            16,
        ));
        let index = Arc::new(SimilarityIndex::new(64));
        let p = EmbeddingPipeline::new(
            Arc::clone(&store),
            generator,
            Arc::clone(&index),
            EventBus::default(),
        );
        (p, store, index)
    }

    async fn add(store: &Arc<dyn EntityStore>, id: &str, desc: &str) -> Entity {
        store
            .upsert(
                EntityDraft::new(EntityType::BusinessObject, id, desc).with_id(id),
                vec![],
            )
            .await
            .unwrap()
            .entity
    }

    #[tokio::test]
    async fn test_ensure_fresh_computes_once() {
        let (p, store, index) = pipeline();
        add(&store, "BO-1", "customer account").await;

        let (entity, outcome) = p.ensure_fresh(&"BO-1".into()).await.unwrap();
        assert_eq!(outcome, ReindexOutcome::Refreshed { version: 1 });
        assert!(!entity.is_stale(p.model_id()));
        assert_eq!(index.len(), 1);

        let (_, again) = p.ensure_fresh(&"BO-1".into()).await.unwrap();
        assert_eq!(again, ReindexOutcome::AlreadyCurrent { version: 1 });
    }

    #[tokio::test]
    async fn test_reindex_forces_new_version() {
        let (p, store, index) = pipeline();
        add(&store, "BO-1", "customer account").await;
        p.ensure_fresh(&"BO-1".into()).await.unwrap();

        let outcome = p.reindex(&"BO-1".into()).await.unwrap();
        assert_eq!(outcome, ReindexOutcome::Refreshed { version: 2 });
        let indexed = index.get(&"BO-1".into(), EntityType::BusinessObject).unwrap();
        assert_eq!(indexed.version, 2);
        assert!(p.generator.locks().is_empty());
    }

    #[tokio::test]
    async fn test_empty_description_is_insufficient() {
        let (p, store, _) = pipeline();
        add(&store, "BO-1", "").await;
        assert!(matches!(
            p.ensure_fresh(&"BO-1".into()).await,
            Err(CatalogError::InsufficientData(_))
        ));
        assert!(matches!(
            p.reindex(&"BO-1".into()).await,
            Err(CatalogError::InsufficientData(_))
        ));
    }

    #[tokio::test]
    async fn test_repair_clears_emptied_entity() {
        let (p, store, index) = pipeline();
        add(&store, "BO-1", "customer account").await;
        p.ensure_fresh(&"BO-1".into()).await.unwrap();
        add(&store, "BO-1", "  ").await;

        assert_eq!(p.repair(&"BO-1".into()).await.unwrap(), RepairOutcome::Cleared);
        assert!(index.is_empty());
        assert!(store.get(&"BO-1".into()).await.unwrap().embedding.is_none());
        assert_eq!(
            p.repair(&"missing".into()).await.unwrap(),
            RepairOutcome::Vanished
        );
    }

    #[tokio::test]
    async fn test_remove_entity_clears_index_first() {
        let (p, store, index) = pipeline();
        add(&store, "BO-1", "customer account").await;
        p.ensure_fresh(&"BO-1".into()).await.unwrap();

        p.remove_entity(&"BO-1".into()).await.unwrap();
        assert!(index.is_empty());
        assert!(matches!(
            store.get(&"BO-1".into()).await,
            Err(CatalogError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rebuild_index_from_store() {
        let (p, store, index) = pipeline();
        add(&store, "BO-1", "customer account").await;
        add(&store, "BO-2", "invoice record").await;
        p.ensure_fresh(&"BO-1".into()).await.unwrap();
        p.ensure_fresh(&"BO-2".into()).await.unwrap();

        index.remove(&"BO-1".into(), EntityType::BusinessObject).unwrap();
        index.remove(&"BO-2".into(), EntityType::BusinessObject).unwrap();
        assert!(index.is_empty());

        assert_eq!(p.rebuild_index().await.unwrap(), 2);
        assert_eq!(index.len(), 2);
    }
}
