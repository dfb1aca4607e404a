//! Similarity service combining vector similarity with relationship context.
//!
//! `find_similar` refreshes the source embedding if it is stale, queries
//! the index for the source's type with over-fetch headroom, boosts
//! candidates that share graph context with the source, then re-ranks and
//! truncates.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use catalog_core::config::SimilarityConfig;
use catalog_core::error::{CatalogError, Result};
use catalog_core::types::{
    Direction, Entity, EntityId, EntitySummary, EntityType, RelationshipType,
};
use catalog_storage::EntityStore;

use crate::generator::EmbeddingGenerator;
use crate::index::SimilarityIndex;
use crate::pipeline::EmbeddingPipeline;

/// How a result was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedVia {
    Embedding,
    Relationship,
    Both,
}

/// Graph context shared between the source and a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    /// The match is directly linked to the source.
    Direct { rel_type: RelationshipType },
    /// Both link to `via` with the same relationship type, in the same role.
    SharedNeighbor {
        via: EntityId,
        rel_type: RelationshipType,
    },
}

/// One ranked result of [`SimilarityService::find_similar`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarityMatch {
    /// The matched entity, without its embedding vector.
    pub entity: Entity,
    pub score: f64,
    pub matched_via: MatchedVia,
    pub evidence: Vec<Evidence>,
}

/// One hit of a free-text search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextMatch {
    pub entity: Entity,
    pub score: f64,
}

/// An entity linked to the queried one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelatedEntity {
    pub entity: EntitySummary,
    pub rel_type: RelationshipType,
    /// True when the queried entity is the edge source.
    pub outgoing: bool,
}

struct Candidate {
    id: EntityId,
    score: f64,
    matched_via: MatchedVia,
    evidence: Vec<Evidence>,
}

pub struct SimilarityService {
    store: Arc<dyn EntityStore>,
    generator: Arc<EmbeddingGenerator>,
    index: Arc<SimilarityIndex>,
    pipeline: Arc<EmbeddingPipeline>,
    config: SimilarityConfig,
}

impl SimilarityService {
    pub fn new(
        store: Arc<dyn EntityStore>,
        generator: Arc<EmbeddingGenerator>,
        index: Arc<SimilarityIndex>,
        pipeline: Arc<EmbeddingPipeline>,
        config: SimilarityConfig,
    ) -> Self {
        Self {
            store,
            generator,
            index,
            pipeline,
            config,
        }
    }

    pub fn config(&self) -> &SimilarityConfig {
        &self.config
    }

    /// The `k` entities of the same type most similar to `id`.
    ///
    /// Results are sorted by descending score, ties by ascending id, and
    /// never include `id` itself.
    pub async fn find_similar(
        &self,
        id: &EntityId,
        k: usize,
        include_related: bool,
    ) -> Result<Vec<SimilarityMatch>> {
        if k == 0 || k > self.config.max_k {
            return Err(CatalogError::InvalidArgument(format!(
                "k must be between 1 and {}, got {}",
                self.config.max_k, k
            )));
        }

        let timeout = self.config.refresh_timeout();
        let (source, outcome) =
            match tokio::time::timeout(timeout, self.pipeline.ensure_fresh(id)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(CatalogError::EmbeddingUnavailable(format!(
                        "refreshing embedding of {} timed out after {}ms",
                        id,
                        timeout.as_millis()
                    )))
                }
            };
        let Some(vector) = source.embedding.as_deref() else {
            return Err(CatalogError::EmbeddingUnavailable(format!(
                "entity {} has no embedding after refresh",
                id
            )));
        };
        debug!(entity_id = %id, outcome = ?outcome, "Source embedding ready");

        let fetch = k.saturating_mul(self.config.overfetch_factor).saturating_add(1);
        let hits = self
            .index
            .query(vector, source.entity_type, fetch, self.config.min_score)?;

        let context = self.relationship_context(&source.id).await?;
        let boost = self.config.relationship_boost;

        let mut candidates: Vec<Candidate> = Vec::with_capacity(hits.len());
        for hit in hits {
            if hit.id == source.id {
                continue;
            }
            let (score, matched_via, evidence) = match context.get(&hit.id) {
                Some(evidence) => (hit.score + boost, MatchedVia::Both, evidence.clone()),
                None => (hit.score, MatchedVia::Embedding, Vec::new()),
            };
            candidates.push(Candidate {
                id: hit.id,
                score,
                matched_via,
                evidence,
            });
        }

        if include_related {
            for (related_id, evidence) in &context {
                if *related_id == source.id || candidates.iter().any(|c| &c.id == related_id) {
                    continue;
                }
                let base = self
                    .index
                    .score_of(vector, related_id, source.entity_type)
                    .unwrap_or(0.0);
                candidates.push(Candidate {
                    id: related_id.clone(),
                    score: base + boost,
                    matched_via: MatchedVia::Relationship,
                    evidence: evidence.clone(),
                });
            }
        }

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));

        let mut results = Vec::with_capacity(k);
        for candidate in candidates {
            if results.len() == k {
                break;
            }
            let entity = match self.store.get(&candidate.id).await {
                Ok(entity) => entity,
                // Deleted between the index query and now.
                Err(CatalogError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if entity.entity_type != source.entity_type {
                continue;
            }
            results.push(SimilarityMatch {
                entity: without_embedding(entity),
                score: candidate.score,
                matched_via: candidate.matched_via,
                evidence: candidate.evidence,
            });
        }

        info!(
            entity_id = %id,
            k,
            returned = results.len(),
            include_related,
            "find_similar completed"
        );
        Ok(results)
    }

    /// Free-text search across entity types, grouped by type.
    ///
    /// An empty `types` slice searches every type. `limit` and `threshold`
    /// default to the configured text-search values.
    pub async fn search_text(
        &self,
        query: &str,
        types: &[EntityType],
        limit: Option<usize>,
        threshold: Option<f64>,
    ) -> Result<BTreeMap<EntityType, Vec<TextMatch>>> {
        if query.trim().is_empty() {
            return Err(CatalogError::InvalidArgument(
                "search query must not be empty".to_string(),
            ));
        }
        let limit = limit.unwrap_or(self.config.text_limit);
        if limit == 0 || limit > self.config.max_k {
            return Err(CatalogError::InvalidArgument(format!(
                "limit must be between 1 and {}, got {}",
                self.config.max_k, limit
            )));
        }
        let threshold = threshold.unwrap_or(self.config.text_threshold);
        let types: &[EntityType] = if types.is_empty() {
            &EntityType::ALL
        } else {
            types
        };

        let vector = self.generator.embed(query).await?;

        let mut grouped = BTreeMap::new();
        for &entity_type in types {
            let hits = self.index.query(&vector, entity_type, limit, Some(threshold))?;
            let mut matches = Vec::with_capacity(hits.len());
            for hit in hits {
                match self.store.get(&hit.id).await {
                    Ok(entity) => matches.push(TextMatch {
                        entity: without_embedding(entity),
                        score: hit.score,
                    }),
                    Err(CatalogError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
            grouped.insert(entity_type, matches);
        }
        Ok(grouped)
    }

    /// Entities linked to `id` in either direction, grouped by type.
    pub async fn related(&self, id: &EntityId) -> Result<BTreeMap<EntityType, Vec<RelatedEntity>>> {
        self.store.get(id).await?;
        let edges = self.store.relationships_of(id, Direction::Both, None).await?;

        let mut grouped: BTreeMap<EntityType, Vec<RelatedEntity>> = BTreeMap::new();
        for edge in edges {
            let Some(other) = edge.other_end(id) else {
                continue;
            };
            let entity = match self.store.get(other).await {
                Ok(entity) => entity,
                Err(CatalogError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            grouped
                .entry(entity.entity_type)
                .or_default()
                .push(RelatedEntity {
                    entity: entity.summary(),
                    rel_type: edge.rel_type,
                    outgoing: edge.source == *id,
                });
        }
        for group in grouped.values_mut() {
            group.sort_by(|a, b| {
                (&a.entity.id, a.rel_type.as_str()).cmp(&(&b.entity.id, b.rel_type.as_str()))
            });
        }
        Ok(grouped)
    }

    /// Graph context of `id`: every entity linked to it directly, and every
    /// entity sharing a neighbour with it over the same relationship type
    /// in the same role.
    async fn relationship_context(&self, id: &EntityId) -> Result<HashMap<EntityId, Vec<Evidence>>> {
        let fanout = self.config.related_fanout;
        let mut edges = self.store.relationships_of(id, Direction::Both, None).await?;
        edges.truncate(fanout);

        let mut context: HashMap<EntityId, Vec<Evidence>> = HashMap::new();
        for edge in &edges {
            let Some(neighbor) = edge.other_end(id) else {
                continue;
            };
            context
                .entry(neighbor.clone())
                .or_default()
                .push(Evidence::Direct {
                    rel_type: edge.rel_type,
                });

            let source_is_origin = edge.source == *id;
            let mut second = self
                .store
                .relationships_of(neighbor, Direction::Both, Some(edge.rel_type))
                .await?;
            second.truncate(fanout);

            for far in second {
                let Some(peer) = far.other_end(neighbor) else {
                    continue;
                };
                if peer == id || (far.source == *peer) != source_is_origin {
                    continue;
                }
                context
                    .entry(peer.clone())
                    .or_default()
                    .push(Evidence::SharedNeighbor {
                        via: neighbor.clone(),
                        rel_type: edge.rel_type,
                    });
            }
        }
        Ok(context)
    }
}

fn without_embedding(mut entity: Entity) -> Entity {
    entity.embedding = None;
    entity
}
