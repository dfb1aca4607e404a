//! In-memory similarity index with brute-force cosine search.
//!
//! Partitioned by entity type. Each partition is an `Arc` snapshot: readers
//! clone the `Arc` under a short read lock and scan without holding it,
//! writers copy-on-write through `Arc::make_mut`. A query therefore never
//! observes a half-applied update.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use catalog_core::error::CatalogError;
use catalog_core::types::{EntityId, EntityType};
use catalog_storage::StoredEmbedding;

use crate::embedding::l2_norm;

/// A single hit returned from an index query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexHit {
    pub id: EntityId,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f64,
}

/// A vector held by the index.
#[derive(Debug, Clone)]
pub struct IndexedVector {
    pub vector: Arc<[f32]>,
    pub norm: f64,
    pub version: u64,
}

/// Export/import form of one index entry.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: EntityId,
    pub entity_type: EntityType,
    pub vector: Vec<f32>,
    pub version: u64,
}

impl From<StoredEmbedding> for IndexEntry {
    fn from(row: StoredEmbedding) -> Self {
        Self {
            id: row.id,
            entity_type: row.entity_type,
            vector: row.vector,
            version: row.version,
        }
    }
}

type Partition = HashMap<EntityId, IndexedVector>;

/// Per-type vector index.
#[derive(Debug)]
pub struct SimilarityIndex {
    dimensions: usize,
    partitions: RwLock<HashMap<EntityType, Arc<Partition>>>,
}

impl SimilarityIndex {
    /// Create an empty index accepting vectors of `dimensions` components.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            partitions: RwLock::new(HashMap::new()),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn check_vector(&self, vector: &[f32]) -> Result<f64, CatalogError> {
        if vector.len() != self.dimensions {
            return Err(CatalogError::InvalidArgument(format!(
                "vector has {} dimensions, index expects {}",
                vector.len(),
                self.dimensions
            )));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(CatalogError::InvalidArgument(
                "vector contains non-finite values".to_string(),
            ));
        }
        let norm = l2_norm(vector);
        if norm == 0.0 {
            return Err(CatalogError::InvalidArgument("vector has zero magnitude".to_string()));
        }
        Ok(norm)
    }

    fn snapshot(&self, entity_type: EntityType) -> Result<Option<Arc<Partition>>, CatalogError> {
        let partitions = self
            .partitions
            .read()
            .map_err(|e| CatalogError::Storage(format!("Lock poisoned: {}", e)))?;
        Ok(partitions.get(&entity_type).cloned())
    }

    /// Insert or replace the vector for `id`.
    ///
    /// Returns false, leaving the index unchanged, when the index already
    /// holds a newer version.
    pub fn upsert(
        &self,
        id: &EntityId,
        entity_type: EntityType,
        vector: Arc<[f32]>,
        version: u64,
    ) -> Result<bool, CatalogError> {
        let norm = self.check_vector(&vector)?;
        let mut partitions = self
            .partitions
            .write()
            .map_err(|e| CatalogError::Storage(format!("Lock poisoned: {}", e)))?;
        let partition = partitions.entry(entity_type).or_default();
        if let Some(existing) = partition.get(id) {
            if existing.version > version {
                return Ok(false);
            }
        }
        Arc::make_mut(partition).insert(
            id.clone(),
            IndexedVector {
                vector,
                norm,
                version,
            },
        );
        Ok(true)
    }

    /// Remove `id` from its partition. Returns whether it was present.
    pub fn remove(&self, id: &EntityId, entity_type: EntityType) -> Result<bool, CatalogError> {
        let mut partitions = self
            .partitions
            .write()
            .map_err(|e| CatalogError::Storage(format!("Lock poisoned: {}", e)))?;
        let Some(partition) = partitions.get_mut(&entity_type) else {
            return Ok(false);
        };
        if !partition.contains_key(id) {
            return Ok(false);
        }
        Arc::make_mut(partition).remove(id);
        Ok(true)
    }

    /// The `k` entries of `entity_type` most similar to `vector`, by
    /// descending cosine with ties broken by ascending id.
    pub fn query(
        &self,
        vector: &[f32],
        entity_type: EntityType,
        k: usize,
        min_score: Option<f64>,
    ) -> Result<Vec<IndexHit>, CatalogError> {
        let query_norm = self.check_vector(vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let Some(partition) = self.snapshot(entity_type)? else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<IndexHit> = partition
            .iter()
            .map(|(id, entry)| IndexHit {
                id: id.clone(),
                score: cosine(vector, query_norm, entry),
            })
            .filter(|hit| min_score.map_or(true, |min| hit.score >= min))
            .collect();

        hits.sort_by(rank_order);
        hits.truncate(k);
        Ok(hits)
    }

    pub fn get(&self, id: &EntityId, entity_type: EntityType) -> Option<IndexedVector> {
        self.snapshot(entity_type)
            .ok()
            .flatten()
            .and_then(|p| p.get(id).cloned())
    }

    /// Cosine between `vector` and the indexed vector of `id`, if present.
    pub fn score_of(&self, vector: &[f32], id: &EntityId, entity_type: EntityType) -> Option<f64> {
        let query_norm = self.check_vector(vector).ok()?;
        let entry = self.get(id, entity_type)?;
        Some(cosine(vector, query_norm, &entry))
    }

    /// Export every entry, ordered by type then id.
    pub fn entries(&self) -> Vec<IndexEntry> {
        let Ok(partitions) = self.partitions.read() else {
            return Vec::new();
        };
        let mut out: Vec<IndexEntry> = partitions
            .iter()
            .flat_map(|(entity_type, partition)| {
                partition.iter().map(move |(id, entry)| IndexEntry {
                    id: id.clone(),
                    entity_type: *entity_type,
                    vector: entry.vector.to_vec(),
                    version: entry.version,
                })
            })
            .collect();
        out.sort_by(|a, b| (a.entity_type, &a.id).cmp(&(b.entity_type, &b.id)));
        out
    }

    /// Import entries. Returns how many were applied.
    pub fn load<I>(&self, entries: I) -> Result<usize, CatalogError>
    where
        I: IntoIterator<Item = IndexEntry>,
    {
        let mut applied = 0;
        for entry in entries {
            if self.upsert(&entry.id, entry.entity_type, entry.vector.into(), entry.version)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Total number of indexed vectors.
    pub fn len(&self) -> usize {
        self.partitions
            .read()
            .map(|p| p.values().map(|part| part.len()).sum())
            .unwrap_or(0)
    }

    pub fn len_of(&self, entity_type: EntityType) -> usize {
        self.snapshot(entity_type)
            .ok()
            .flatten()
            .map(|p| p.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cosine(query: &[f32], query_norm: f64, entry: &IndexedVector) -> f64 {
    let dot: f64 = query
        .iter()
        .zip(entry.vector.iter())
        .map(|(a, b)| (*a as f64) * (*b as f64))
        .sum();
    dot / (query_norm * entry.norm)
}

/// Score descending, then id ascending.
pub(crate) fn rank_order(a: &IndexHit, b: &IndexHit) -> Ordering {
    b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id))
}
