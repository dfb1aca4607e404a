//! The `Catalog` facade: the similarity subsystem wired together once and
//! shared by `Arc`.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

use catalog_core::config::CatalogConfig;
use catalog_core::error::{CatalogError, Result};
use catalog_core::events::{CatalogEvent, EventBus};
use catalog_core::types::{Entity, EntityDraft, EntityId, EntityType, Relationship};
use catalog_storage::{EntityStore, UpsertOutcome};

use crate::embedding::DynEmbeddingService;
use crate::generator::EmbeddingGenerator;
use crate::index::SimilarityIndex;
use crate::pipeline::{EmbeddingPipeline, ReindexOutcome};
use crate::similarity::{RelatedEntity, SimilarityMatch, SimilarityService, TextMatch};
use crate::sweeper::{ConsistencySweeper, SweepReport, SweepStatus, SweeperHandle};

pub struct Catalog {
    store: Arc<dyn EntityStore>,
    generator: Arc<EmbeddingGenerator>,
    index: Arc<SimilarityIndex>,
    pipeline: Arc<EmbeddingPipeline>,
    similarity: SimilarityService,
    sweeper: Arc<ConsistencySweeper>,
    events: EventBus,
}

impl Catalog {
    /// Compose the subsystem. The index starts empty; call
    /// [`rebuild_index`](Self::rebuild_index) to load persisted embeddings.
    pub fn new(
        store: Arc<dyn EntityStore>,
        provider: Arc<dyn DynEmbeddingService>,
        config: &CatalogConfig,
    ) -> Self {
        let events = EventBus::default();
        let generator = Arc::new(EmbeddingGenerator::new(provider, &config.embedding));
        let index = Arc::new(SimilarityIndex::new(generator.dimensions()));
        let pipeline = Arc::new(EmbeddingPipeline::new(
            Arc::clone(&store),
            Arc::clone(&generator),
            Arc::clone(&index),
            events.clone(),
        ));
        let similarity = SimilarityService::new(
            Arc::clone(&store),
            Arc::clone(&generator),
            Arc::clone(&index),
            Arc::clone(&pipeline),
            config.similarity.clone(),
        );
        let sweeper = Arc::new(ConsistencySweeper::new(
            Arc::clone(&store),
            Arc::clone(&pipeline),
            config.sweeper.clone(),
            events.clone(),
        ));

        info!(
            model = generator.model_id(),
            dimensions = generator.dimensions(),
            "Catalog similarity engine ready"
        );

        Self {
            store,
            generator,
            index,
            pipeline,
            similarity,
            sweeper,
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<SimilarityIndex> {
        &self.index
    }

    pub fn model_id(&self) -> &str {
        self.generator.model_id()
    }

    // =========================================================================
    // Similarity
    // =========================================================================

    pub async fn find_similar(
        &self,
        id: &EntityId,
        k: usize,
        include_related: bool,
    ) -> Result<Vec<SimilarityMatch>> {
        self.similarity.find_similar(id, k, include_related).await
    }

    pub async fn search_text(
        &self,
        query: &str,
        types: &[EntityType],
        limit: Option<usize>,
        threshold: Option<f64>,
    ) -> Result<BTreeMap<EntityType, Vec<TextMatch>>> {
        self.similarity.search_text(query, types, limit, threshold).await
    }

    pub async fn related(&self, id: &EntityId) -> Result<BTreeMap<EntityType, Vec<RelatedEntity>>> {
        self.similarity.related(id).await
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Force a recompute of one entity's embedding.
    pub async fn trigger_reindex(&self, id: &EntityId) -> Result<ReindexOutcome> {
        self.pipeline.reindex(id).await
    }

    pub fn sweep_status(&self) -> SweepStatus {
        self.sweeper.status()
    }

    pub async fn sweep_now(&self) -> Result<SweepReport> {
        self.sweeper.run_once().await
    }

    /// Spawn the periodic sweeper, nudged by the store's change events.
    pub fn start_sweeper(&self) -> SweeperHandle {
        self.sweeper.spawn(self.store.events())
    }

    pub async fn rebuild_index(&self) -> Result<usize> {
        self.pipeline.rebuild_index().await
    }

    /// Embedding and sweep notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.events.subscribe()
    }

    // =========================================================================
    // Write lifecycle
    // =========================================================================

    /// Insert or update an entity. The new content is embedded later by
    /// the sweeper or on the next search from it.
    pub async fn upsert_entity(
        &self,
        draft: EntityDraft,
        relationships: Vec<Relationship>,
    ) -> Result<UpsertOutcome> {
        let outcome = self.store.upsert(draft, relationships).await?;
        debug!(
            entity_id = %outcome.entity.id,
            created = outcome.created,
            content_changed = outcome.content_changed,
            "Entity upserted"
        );
        Ok(outcome)
    }

    pub async fn get_entity(&self, id: &EntityId) -> Result<Entity> {
        self.store.get(id).await
    }

    pub async fn link(&self, rel: Relationship) -> Result<bool> {
        self.store.link(rel).await
    }

    pub async fn unlink(&self, rel: Relationship) -> Result<bool> {
        self.store.unlink(rel).await
    }

    /// Remove an entity from the index, then from the store.
    pub async fn delete_entity(&self, id: &EntityId) -> Result<()> {
        if id.is_blank() {
            return Err(CatalogError::InvalidArgument("entity id must not be empty".into()));
        }
        self.pipeline.remove_entity(id).await
    }
}
