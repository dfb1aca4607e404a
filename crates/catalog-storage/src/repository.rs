//! SQLite-backed graph repository for catalog entities.
//!
//! Synchronous and connection-bound: every method locks the shared
//! connection for its duration. The async [`crate::store::SqliteEntityStore`]
//! moves these calls onto the blocking pool.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use catalog_core::error::CatalogError;
use catalog_core::types::{
    Attributes, Direction, Entity, EntityDraft, EntityId, EntityType, Page, Relationship,
    RelationshipType,
};

use crate::db::{map_sqlite, Database};

const ENTITY_COLUMNS: &str = "id, entity_type, name, description, attributes, content_hash, \
     embedding, embedding_version, embedded_hash, embedding_model, created_at, updated_at";

/// Result of a compare-and-set embedding write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmbeddingWrite {
    /// Persisted; the entity now carries this embedding version.
    Recorded { version: u64 },
    /// Content changed since the embedding input was read; nothing written.
    Superseded,
}

/// Result of an entity upsert.
#[derive(Clone, Debug)]
pub struct UpsertOutcome {
    pub entity: Entity,
    pub created: bool,
    /// The content hash changed, leaving the embedding stale.
    pub content_changed: bool,
}

/// A persisted embedding, as loaded into the similarity index.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredEmbedding {
    pub id: EntityId,
    pub entity_type: EntityType,
    pub vector: Vec<f32>,
    pub version: u64,
}

/// Repository for entities and their typed relationships.
pub struct EntityRepository {
    db: Arc<Database>,
}

impl EntityRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Fetch an entity or fail with `NotFound`.
    pub fn get(&self, id: &EntityId) -> Result<Entity, CatalogError> {
        self.find(id)?
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    pub fn find(&self, id: &EntityId) -> Result<Option<Entity>, CatalogError> {
        self.db.with_conn(|conn| find_entity(conn, id))
    }

    /// Insert or update an entity together with the relationships it touches.
    ///
    /// The entity type is immutable once created. Every relationship must
    /// have the entity as one endpoint and an existing entity on the other.
    /// Runs in one transaction: either everything is written or nothing is.
    pub fn upsert(
        &self,
        draft: &EntityDraft,
        relationships: &[Relationship],
    ) -> Result<UpsertOutcome, CatalogError> {
        draft.validate()?;
        let hash = draft.content_hash();
        let attributes = serde_json::to_string(&draft.attributes)?;

        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| map_sqlite("begin upsert", e))?;

            let existing: Option<(String, String)> = tx
                .query_row(
                    "SELECT entity_type, content_hash FROM entities WHERE id = ?1",
                    rusqlite::params![draft.id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|e| map_sqlite("read entity", e))?;

            let now = Utc::now().timestamp_millis();
            let (created, content_changed) = match existing {
                None => {
                    tx.execute(
                        "INSERT INTO entities (id, entity_type, name, description, attributes,
                                               content_hash, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                        rusqlite::params![
                            draft.id.as_str(),
                            draft.entity_type.as_str(),
                            draft.name,
                            draft.description,
                            attributes,
                            hash,
                            now,
                        ],
                    )
                    .map_err(|e| map_sqlite("insert entity", e))?;
                    (true, true)
                }
                Some((stored_type, stored_hash)) => {
                    let stored_type: EntityType = stored_type.parse()?;
                    if stored_type != draft.entity_type {
                        return Err(CatalogError::InvalidArgument(format!(
                            "entity {} is a {} and cannot become a {}",
                            draft.id, stored_type, draft.entity_type
                        )));
                    }
                    if stored_hash == hash {
                        (false, false)
                    } else {
                        tx.execute(
                            "UPDATE entities
                             SET name = ?2, description = ?3, attributes = ?4,
                                 content_hash = ?5, updated_at = ?6
                             WHERE id = ?1",
                            rusqlite::params![
                                draft.id.as_str(),
                                draft.name,
                                draft.description,
                                attributes,
                                hash,
                                now,
                            ],
                        )
                        .map_err(|e| map_sqlite("update entity", e))?;
                        (false, true)
                    }
                }
            };

            for rel in relationships {
                if !rel.involves(&draft.id) {
                    return Err(CatalogError::InvalidArgument(format!(
                        "relationship {} -[{}]-> {} does not involve {}",
                        rel.source, rel.rel_type, rel.target, draft.id
                    )));
                }
                insert_relationship(&tx, rel)?;
            }

            let entity = find_entity(&tx, &draft.id)?
                .ok_or_else(|| CatalogError::NotFound(draft.id.to_string()))?;
            tx.commit().map_err(|e| map_sqlite("commit upsert", e))?;

            debug!(
                entity_id = %draft.id,
                created,
                content_changed,
                relationships = relationships.len(),
                "Entity upserted"
            );
            Ok(UpsertOutcome {
                entity,
                created,
                content_changed,
            })
        })
    }

    /// Delete an entity. Its edges cascade.
    pub fn delete(&self, id: &EntityId) -> Result<(), CatalogError> {
        self.db.with_conn(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM entities WHERE id = ?1",
                    rusqlite::params![id.as_str()],
                )
                .map_err(|e| map_sqlite("delete entity", e))?;
            if removed == 0 {
                return Err(CatalogError::NotFound(id.to_string()));
            }
            Ok(())
        })
    }

    /// Entities of one type, ordered by id.
    pub fn list_by_type(
        &self,
        entity_type: EntityType,
        page: Page,
    ) -> Result<Vec<Entity>, CatalogError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM entities WHERE entity_type = ?1 ORDER BY id LIMIT ?2 OFFSET ?3",
                ENTITY_COLUMNS
            );
            let mut stmt = conn.prepare(&sql).map_err(|e| map_sqlite("prepare list", e))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![entity_type.as_str(), page.limit as i64, page.offset as i64],
                    |row| Ok(row_to_entity(row)),
                )
                .map_err(|e| map_sqlite("list entities", e))?;

            let mut entities = Vec::new();
            for row in rows {
                entities.push(row.map_err(|e| map_sqlite("read entity row", e))??);
            }
            Ok(entities)
        })
    }

    /// Edges incident to `id`, optionally restricted to one type.
    pub fn relationships_of(
        &self,
        id: &EntityId,
        direction: Direction,
        rel_type: Option<RelationshipType>,
    ) -> Result<Vec<Relationship>, CatalogError> {
        let endpoint_filter = match direction {
            Direction::Outgoing => "source = ?1",
            Direction::Incoming => "target = ?1",
            Direction::Both => "(source = ?1 OR target = ?1)",
        };
        let sql = format!(
            "SELECT source, target, rel_type FROM relationships
             WHERE {} AND (?2 IS NULL OR rel_type = ?2)
             ORDER BY source, target, rel_type",
            endpoint_filter
        );

        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| map_sqlite("prepare relationships", e))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![id.as_str(), rel_type.map(|t| t.as_str())],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .map_err(|e| map_sqlite("list relationships", e))?;

            let mut rels = Vec::new();
            for row in rows {
                let (source, target, kind) =
                    row.map_err(|e| map_sqlite("read relationship row", e))?;
                rels.push(Relationship::new(source, target, kind.parse()?));
            }
            Ok(rels)
        })
    }

    /// Add an edge between two existing entities. Returns false if it
    /// already existed.
    pub fn link(&self, rel: &Relationship) -> Result<bool, CatalogError> {
        self.db.with_conn(|conn| insert_relationship(conn, rel))
    }

    /// Remove an edge. Returns false if it did not exist.
    pub fn unlink(&self, rel: &Relationship) -> Result<bool, CatalogError> {
        self.db.with_conn(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM relationships WHERE source = ?1 AND target = ?2 AND rel_type = ?3",
                    rusqlite::params![rel.source.as_str(), rel.target.as_str(), rel.rel_type.as_str()],
                )
                .map_err(|e| map_sqlite("unlink", e))?;
            Ok(removed > 0)
        })
    }

    /// Ids of entities whose embedding is missing or out of date for
    /// `model`, ascending, strictly after the `after` cursor.
    ///
    /// Entities with a blank description and no embedding have nothing to
    /// repair and are not listed.
    pub fn list_stale(
        &self,
        model: &str,
        after: Option<&EntityId>,
        limit: usize,
    ) -> Result<Vec<EntityId>, CatalogError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM entities
                     WHERE (?1 IS NULL OR id > ?1)
                       AND (
                            (embedding IS NULL AND length(trim(description)) > 0)
                         OR (embedding IS NOT NULL AND (
                                embedded_hash IS NOT content_hash
                             OR embedding_model IS NOT ?2
                             OR length(trim(description)) = 0))
                       )
                     ORDER BY id
                     LIMIT ?3",
                )
                .map_err(|e| map_sqlite("prepare stale scan", e))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![after.map(|id| id.as_str()), model, limit as i64],
                    |row| row.get::<_, String>(0),
                )
                .map_err(|e| map_sqlite("stale scan", e))?;

            let mut ids = Vec::new();
            for row in rows {
                ids.push(EntityId::from(row.map_err(|e| map_sqlite("read stale id", e))?));
            }
            Ok(ids)
        })
    }

    /// Persist an embedding computed from `expected_hash`, only if the
    /// entity's content still hashes to it. Increments the version.
    pub fn record_embedding(
        &self,
        id: &EntityId,
        expected_hash: &str,
        model: &str,
        vector: &[f32],
    ) -> Result<EmbeddingWrite, CatalogError> {
        let blob = encode_vector(vector);
        self.db.with_conn(|conn| {
            let version: Option<i64> = conn
                .query_row(
                    "UPDATE entities
                     SET embedding = ?3,
                         embedding_version = embedding_version + 1,
                         embedded_hash = ?2,
                         embedding_model = ?4
                     WHERE id = ?1 AND content_hash = ?2
                     RETURNING embedding_version",
                    rusqlite::params![id.as_str(), expected_hash, blob, model],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| map_sqlite("record embedding", e))?;

            match version {
                Some(v) => Ok(EmbeddingWrite::Recorded { version: v as u64 }),
                None if entity_exists(conn, id)? => Ok(EmbeddingWrite::Superseded),
                None => Err(CatalogError::NotFound(id.to_string())),
            }
        })
    }

    /// Drop the stored embedding. The version counter is kept.
    pub fn clear_embedding(&self, id: &EntityId) -> Result<(), CatalogError> {
        self.db.with_conn(|conn| {
            let updated = conn
                .execute(
                    "UPDATE entities
                     SET embedding = NULL, embedded_hash = NULL, embedding_model = NULL
                     WHERE id = ?1",
                    rusqlite::params![id.as_str()],
                )
                .map_err(|e| map_sqlite("clear embedding", e))?;
            if updated == 0 {
                return Err(CatalogError::NotFound(id.to_string()));
            }
            Ok(())
        })
    }

    /// Persisted embeddings computed with `model`, ascending by id after the
    /// cursor.
    pub fn list_embedded(
        &self,
        model: &str,
        after: Option<&EntityId>,
        limit: usize,
    ) -> Result<Vec<StoredEmbedding>, CatalogError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, entity_type, embedding, embedding_version FROM entities
                     WHERE embedding IS NOT NULL AND embedding_model = ?1
                       AND (?2 IS NULL OR id > ?2)
                     ORDER BY id
                     LIMIT ?3",
                )
                .map_err(|e| map_sqlite("prepare embedded scan", e))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![model, after.map(|id| id.as_str()), limit as i64],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .map_err(|e| map_sqlite("embedded scan", e))?;

            let mut out = Vec::new();
            for row in rows {
                let (id, entity_type, blob, version) =
                    row.map_err(|e| map_sqlite("read embedded row", e))?;
                out.push(StoredEmbedding {
                    id: EntityId::from(id),
                    entity_type: entity_type.parse()?,
                    vector: decode_vector(&blob)?,
                    version: version as u64,
                });
            }
            Ok(out)
        })
    }

    pub fn count(&self) -> Result<u64, CatalogError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))
                .map_err(|e| map_sqlite("count entities", e))?;
            Ok(count as u64)
        })
    }
}

fn entity_exists(conn: &Connection, id: &EntityId) -> Result<bool, CatalogError> {
    conn.query_row(
        "SELECT 1 FROM entities WHERE id = ?1",
        rusqlite::params![id.as_str()],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(|e| map_sqlite("check entity", e))
}

fn entity_type_of(conn: &Connection, id: &EntityId) -> Result<Option<EntityType>, CatalogError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT entity_type FROM entities WHERE id = ?1",
            rusqlite::params![id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| map_sqlite("read entity type", e))?;
    raw.map(|t| t.parse::<EntityType>()).transpose()
}

/// Validate both endpoints and insert the edge if new.
fn insert_relationship(conn: &Connection, rel: &Relationship) -> Result<bool, CatalogError> {
    let source_type = entity_type_of(conn, &rel.source)?.ok_or_else(|| {
        CatalogError::Integrity(format!(
            "{} references missing source entity {}",
            rel.rel_type, rel.source
        ))
    })?;
    let target_type = entity_type_of(conn, &rel.target)?.ok_or_else(|| {
        CatalogError::Integrity(format!(
            "{} references missing target entity {}",
            rel.rel_type, rel.target
        ))
    })?;
    rel.validate_types(source_type, target_type)?;

    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO relationships (source, target, rel_type, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                rel.source.as_str(),
                rel.target.as_str(),
                rel.rel_type.as_str(),
                Utc::now().timestamp_millis(),
            ],
        )
        .map_err(|e| map_sqlite("insert relationship", e))?;
    Ok(inserted > 0)
}

fn find_entity(conn: &Connection, id: &EntityId) -> Result<Option<Entity>, CatalogError> {
    let sql = format!("SELECT {} FROM entities WHERE id = ?1", ENTITY_COLUMNS);
    let result = conn
        .query_row(&sql, rusqlite::params![id.as_str()], |row| {
            Ok(row_to_entity(row))
        })
        .optional()
        .map_err(|e| map_sqlite("read entity", e))?;

    match result {
        Some(entity) => Ok(Some(entity?)),
        None => Ok(None),
    }
}

fn row_to_entity(row: &rusqlite::Row<'_>) -> Result<Entity, CatalogError> {
    let get_err = |e: rusqlite::Error| map_sqlite("decode entity", e);

    let entity_type: String = row.get(1).map_err(get_err)?;
    let attributes: String = row.get(4).map_err(get_err)?;
    let embedding: Option<Vec<u8>> = row.get(6).map_err(get_err)?;
    let version: i64 = row.get(7).map_err(get_err)?;
    let created_at: i64 = row.get(10).map_err(get_err)?;
    let updated_at: i64 = row.get(11).map_err(get_err)?;

    Ok(Entity {
        id: EntityId::from(row.get::<_, String>(0).map_err(get_err)?),
        entity_type: entity_type.parse()?,
        name: row.get(2).map_err(get_err)?,
        description: row.get(3).map_err(get_err)?,
        attributes: serde_json::from_str::<Attributes>(&attributes)?,
        content_hash: row.get(5).map_err(get_err)?,
        embedding: embedding.map(|b| decode_vector(&b)).transpose()?,
        embedding_version: version as u64,
        embedded_hash: row.get(8).map_err(get_err)?,
        embedding_model: row.get(9).map_err(get_err)?,
        created_at: millis_to_datetime(created_at)?,
        updated_at: millis_to_datetime(updated_at)?,
    })
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, CatalogError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| CatalogError::Storage(format!("invalid timestamp {}", ms)))
}

/// Little-endian f32 encoding, so vectors round-trip bit-exactly.
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>, CatalogError> {
    if bytes.len() % 4 != 0 {
        return Err(CatalogError::Storage(format!(
            "embedding blob of {} bytes is not a whole number of f32 values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = "test-model";

    fn setup() -> EntityRepository {
        EntityRepository::new(Arc::new(Database::in_memory().unwrap()))
    }

    fn draft(id: &str, entity_type: EntityType, name: &str, desc: &str) -> EntityDraft {
        EntityDraft::new(entity_type, name, desc).with_id(id)
    }

    #[test]
    fn test_upsert_and_get() {
        let repo = setup();
        let d = draft("BO-1", EntityType::BusinessObject, "Customer", "A buyer")
            .with_attribute("domain", "Sales")
            .with_attribute("criticality", 4i64);
        let outcome = repo.upsert(&d, &[]).unwrap();
        assert!(outcome.created);
        assert!(outcome.content_changed);

        let e = repo.get(&"BO-1".into()).unwrap();
        assert_eq!(e.name, "Customer");
        assert_eq!(e.attributes.len(), 2);
        assert_eq!(e.embedding_version, 0);
        assert!(e.embedding.is_none());
        assert!(e.is_stale(MODEL));
        assert_eq!(e.content_hash, d.content_hash());
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let repo = setup();
        assert!(matches!(
            repo.get(&"nope".into()),
            Err(CatalogError::NotFound(_))
        ));
    }

    #[test]
    fn test_unchanged_upsert_keeps_updated_at() {
        let repo = setup();
        let d = draft("D-1", EntityType::Domain, "Sales", "Selling");
        let first = repo.upsert(&d, &[]).unwrap();
        let second = repo.upsert(&d, &[]).unwrap();
        assert!(!second.created);
        assert!(!second.content_changed);
        assert_eq!(first.entity.updated_at, second.entity.updated_at);
    }

    #[test]
    fn test_entity_type_is_immutable() {
        let repo = setup();
        repo.upsert(&draft("X-1", EntityType::Domain, "Sales", "d"), &[])
            .unwrap();
        let err = repo
            .upsert(&draft("X-1", EntityType::BusinessRule, "Sales", "d"), &[])
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidArgument(_)));
    }

    #[test]
    fn test_upsert_rejects_dangling_relationship() {
        let repo = setup();
        let rel = Relationship::new("BO-1", "D-404", RelationshipType::BelongsToDomain);
        let err = repo
            .upsert(
                &draft("BO-1", EntityType::BusinessObject, "Customer", "x"),
                &[rel],
            )
            .unwrap_err();
        assert!(matches!(err, CatalogError::Integrity(_)));
        // The whole upsert rolled back.
        assert!(repo.find(&"BO-1".into()).unwrap().is_none());
    }

    #[test]
    fn test_upsert_with_relationships() {
        let repo = setup();
        repo.upsert(&draft("D-1", EntityType::Domain, "Sales", "Selling"), &[])
            .unwrap();
        let rel = Relationship::new("BO-1", "D-1", RelationshipType::BelongsToDomain);
        repo.upsert(
            &draft("BO-1", EntityType::BusinessObject, "Customer", "x"),
            &[rel.clone()],
        )
        .unwrap();

        let out = repo
            .relationships_of(&"BO-1".into(), Direction::Outgoing, None)
            .unwrap();
        assert_eq!(out, vec![rel.clone()]);
        let inc = repo
            .relationships_of(&"D-1".into(), Direction::Incoming, Some(RelationshipType::BelongsToDomain))
            .unwrap();
        assert_eq!(inc, vec![rel]);
        let none = repo
            .relationships_of(&"D-1".into(), Direction::Outgoing, None)
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_relationship_must_involve_entity() {
        let repo = setup();
        repo.upsert(&draft("D-1", EntityType::Domain, "A", "a"), &[]).unwrap();
        repo.upsert(&draft("D-2", EntityType::Domain, "B", "b"), &[]).unwrap();
        let rel = Relationship::new("D-1", "D-2", RelationshipType::SubdomainOf);
        let err = repo
            .upsert(&draft("D-3", EntityType::Domain, "C", "c"), &[rel])
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidArgument(_)));
    }

    #[test]
    fn test_link_validates_endpoint_types() {
        let repo = setup();
        repo.upsert(&draft("R-1", EntityType::BusinessRule, "Rule", "r"), &[])
            .unwrap();
        repo.upsert(&draft("D-1", EntityType::Domain, "Sales", "s"), &[])
            .unwrap();

        let wrong = Relationship::new("R-1", "D-1", RelationshipType::BelongsToDomain);
        assert!(matches!(
            repo.link(&wrong),
            Err(CatalogError::InvalidArgument(_))
        ));

        let right = Relationship::new("D-1", "R-1", RelationshipType::EnforcesRule);
        assert!(repo.link(&right).unwrap());
        assert!(!repo.link(&right).unwrap());
        assert!(repo.unlink(&right).unwrap());
        assert!(!repo.unlink(&right).unwrap());
    }

    #[test]
    fn test_delete_cascades_edges() {
        let repo = setup();
        repo.upsert(&draft("D-1", EntityType::Domain, "Sales", "s"), &[])
            .unwrap();
        let rel = Relationship::new("BO-1", "D-1", RelationshipType::BelongsToDomain);
        repo.upsert(
            &draft("BO-1", EntityType::BusinessObject, "Customer", "c"),
            &[rel],
        )
        .unwrap();

        repo.delete(&"D-1".into()).unwrap();
        assert!(repo
            .relationships_of(&"BO-1".into(), Direction::Both, None)
            .unwrap()
            .is_empty());
        assert!(matches!(
            repo.delete(&"D-1".into()),
            Err(CatalogError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_by_type_paginates_by_id() {
        let repo = setup();
        for id in ["D-3", "D-1", "D-2"] {
            repo.upsert(&draft(id, EntityType::Domain, id, "d"), &[]).unwrap();
        }
        repo.upsert(&draft("BO-1", EntityType::BusinessObject, "x", "d"), &[])
            .unwrap();

        let page = repo.list_by_type(EntityType::Domain, Page::new(1, 5)).unwrap();
        let ids: Vec<_> = page.iter().map(|e| e.id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["D-2", "D-3"]);
    }

    #[test]
    fn test_record_embedding_compare_and_set() {
        let repo = setup();
        let d = draft("BO-1", EntityType::BusinessObject, "Customer", "A buyer");
        let created = repo.upsert(&d, &[]).unwrap().entity;

        let v = vec![0.25f32, -1.5, 3.0e-7];
        let write = repo
            .record_embedding(&created.id, &created.content_hash, MODEL, &v)
            .unwrap();
        assert_eq!(write, EmbeddingWrite::Recorded { version: 1 });

        let stored = repo.get(&created.id).unwrap();
        assert_eq!(stored.embedding.as_deref(), Some(v.as_slice()));
        assert!(!stored.is_stale(MODEL));
        assert!(stored.is_stale("other-model"));

        // Content moves on; an embedding of the old text is refused.
        let changed = repo
            .upsert(
                &draft("BO-1", EntityType::BusinessObject, "Customer", "A paying buyer"),
                &[],
            )
            .unwrap();
        assert!(changed.content_changed);
        let write = repo
            .record_embedding(&created.id, &created.content_hash, MODEL, &v)
            .unwrap();
        assert_eq!(write, EmbeddingWrite::Superseded);
        assert_eq!(repo.get(&created.id).unwrap().embedding_version, 1);

        let write = repo
            .record_embedding(&created.id, &changed.entity.content_hash, MODEL, &v)
            .unwrap();
        assert_eq!(write, EmbeddingWrite::Recorded { version: 2 });

        assert!(matches!(
            repo.record_embedding(&"missing".into(), "h", MODEL, &v),
            Err(CatalogError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_stale_with_cursor() {
        let repo = setup();
        for id in ["A", "B", "C", "D"] {
            repo.upsert(&draft(id, EntityType::Domain, id, "has text"), &[])
                .unwrap();
        }
        repo.upsert(&draft("E", EntityType::Domain, "E", ""), &[]).unwrap();

        let fresh = repo.get(&"B".into()).unwrap();
        repo.record_embedding(&fresh.id, &fresh.content_hash, MODEL, &[1.0])
            .unwrap();

        let first = repo.list_stale(MODEL, None, 2).unwrap();
        assert_eq!(first, vec![EntityId::from("A"), EntityId::from("C")]);
        let rest = repo.list_stale(MODEL, first.last(), 10).unwrap();
        assert_eq!(rest, vec![EntityId::from("D")]);

        // A model change makes the embedded entity stale again.
        let all = repo.list_stale("new-model", None, 10).unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_blank_description_with_embedding_is_listed_stale() {
        let repo = setup();
        let e = repo
            .upsert(&draft("A", EntityType::Domain, "A", "text"), &[])
            .unwrap()
            .entity;
        repo.record_embedding(&e.id, &e.content_hash, MODEL, &[1.0]).unwrap();
        repo.upsert(&draft("A", EntityType::Domain, "A", " "), &[]).unwrap();
        assert_eq!(repo.list_stale(MODEL, None, 10).unwrap(), vec![e.id.clone()]);

        repo.clear_embedding(&e.id).unwrap();
        assert!(repo.list_stale(MODEL, None, 10).unwrap().is_empty());
        let cleared = repo.get(&e.id).unwrap();
        assert!(cleared.embedding.is_none());
        assert_eq!(cleared.embedding_version, 1);
    }

    #[test]
    fn test_list_embedded_filters_model() {
        let repo = setup();
        for id in ["A", "B"] {
            let e = repo
                .upsert(&draft(id, EntityType::BusinessRule, id, "text"), &[])
                .unwrap()
                .entity;
            let model = if id == "A" { MODEL } else { "other" };
            repo.record_embedding(&e.id, &e.content_hash, model, &[0.5, 0.5])
                .unwrap();
        }
        let rows = repo.list_embedded(MODEL, None, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, EntityId::from("A"));
        assert_eq!(rows[0].entity_type, EntityType::BusinessRule);
        assert_eq!(rows[0].vector, vec![0.5, 0.5]);
        assert_eq!(rows[0].version, 1);
        assert_eq!(repo.count().unwrap(), 2);
    }

    #[test]
    fn test_vector_codec_rejects_ragged_blob() {
        assert!(decode_vector(&[0, 1, 2]).is_err());
        let v = vec![f32::MIN_POSITIVE, -0.0, 42.5];
        assert_eq!(decode_vector(&encode_vector(&v)).unwrap(), v);
    }
}
