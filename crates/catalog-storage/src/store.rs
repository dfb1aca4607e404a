//! Async entity store contract and its SQLite implementation.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use catalog_core::config::StoreConfig;
use catalog_core::error::{CatalogError, Result};
use catalog_core::events::{CatalogEvent, EventBus};
use catalog_core::retry::RetryPolicy;
use catalog_core::types::{
    Direction, Entity, EntityDraft, EntityId, EntityType, Page, Relationship, RelationshipType,
};

use crate::db::Database;
use crate::repository::{EmbeddingWrite, EntityRepository, StoredEmbedding, UpsertOutcome};

/// Graph-backed persistence of catalog entities and relationships.
///
/// Implementations retry their own transient failures and surface
/// `StoreUnavailable` once retries are exhausted. `NotFound`, `Integrity`
/// and `InvalidArgument` are returned without retrying.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(&self, id: &EntityId) -> Result<Entity>;

    /// Insert or update an entity and the relationships it touches.
    async fn upsert(
        &self,
        draft: EntityDraft,
        relationships: Vec<Relationship>,
    ) -> Result<UpsertOutcome>;

    async fn delete(&self, id: &EntityId) -> Result<()>;

    async fn list_by_type(&self, entity_type: EntityType, page: Page) -> Result<Vec<Entity>>;

    async fn relationships_of(
        &self,
        id: &EntityId,
        direction: Direction,
        rel_type: Option<RelationshipType>,
    ) -> Result<Vec<Relationship>>;

    async fn link(&self, rel: Relationship) -> Result<bool>;

    async fn unlink(&self, rel: Relationship) -> Result<bool>;

    /// Stale entity ids in ascending order, strictly after `after`.
    async fn list_stale(
        &self,
        model: &str,
        after: Option<EntityId>,
        limit: usize,
    ) -> Result<Vec<EntityId>>;

    /// Compare-and-set write of an embedding computed from `expected_hash`.
    async fn record_embedding(
        &self,
        id: &EntityId,
        expected_hash: &str,
        model: &str,
        vector: Vec<f32>,
    ) -> Result<EmbeddingWrite>;

    async fn clear_embedding(&self, id: &EntityId) -> Result<()>;

    async fn list_embedded(
        &self,
        model: &str,
        after: Option<EntityId>,
        limit: usize,
    ) -> Result<Vec<StoredEmbedding>>;

    async fn count(&self) -> Result<u64>;

    /// Change notifications, if the store emits them.
    fn events(&self) -> Option<broadcast::Receiver<CatalogEvent>> {
        None
    }
}

/// [`EntityStore`] over a local SQLite database.
///
/// Each call runs the synchronous repository on the blocking pool, bounded
/// by a per-call timeout, under the store's retry policy.
pub struct SqliteEntityStore {
    repo: Arc<EntityRepository>,
    retry: RetryPolicy,
    timeout: Duration,
    events: EventBus,
}

impl SqliteEntityStore {
    pub fn new(db: Arc<Database>, config: &StoreConfig) -> Self {
        Self::with_policy(db, RetryPolicy::from(&config.retry), config.timeout())
    }

    pub fn with_policy(db: Arc<Database>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            repo: Arc::new(EntityRepository::new(db)),
            retry,
            timeout,
            events: EventBus::default(),
        }
    }

    /// Open the database file and wrap it.
    pub fn open(path: &Path, config: &StoreConfig) -> Result<Self> {
        let db = Database::new(path)?;
        Ok(Self::new(Arc::new(db), config))
    }

    /// In-memory store with default settings (for testing).
    pub fn in_memory() -> Result<Self> {
        let db = Database::in_memory()?;
        Ok(Self::new(Arc::new(db), &StoreConfig::default()))
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    /// Run `f` on the blocking pool under the timeout and retry policy.
    ///
    /// A timed-out task keeps running on the blocking pool, so the next
    /// attempt waits on that same task instead of spawning another. A write
    /// runs at most once per call.
    async fn call<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&EntityRepository) -> Result<T> + Clone + Send + Sync + 'static,
    {
        let timeout = self.timeout;
        let in_flight: Arc<Mutex<Option<JoinHandle<Result<T>>>>> = Arc::new(Mutex::new(None));
        self.retry
            .run(operation, || {
                let repo = Arc::clone(&self.repo);
                let f = f.clone();
                let in_flight = Arc::clone(&in_flight);
                async move {
                    let pending = in_flight.lock().ok().and_then(|mut slot| slot.take());
                    let mut task = match pending {
                        Some(task) => {
                            debug!(operation, "Awaiting timed-out store call");
                            task
                        }
                        None => tokio::task::spawn_blocking(move || f(&repo)),
                    };
                    let waited = tokio::time::timeout(timeout, &mut task).await;
                    match waited {
                        Ok(Ok(result)) => result,
                        Ok(Err(join)) => Err(CatalogError::Storage(format!(
                            "{} task failed: {}",
                            operation, join
                        ))),
                        Err(_) => {
                            if let Ok(mut slot) = in_flight.lock() {
                                *slot = Some(task);
                            }
                            Err(CatalogError::StoreUnavailable(format!(
                                "{} timed out after {}ms",
                                operation,
                                timeout.as_millis()
                            )))
                        }
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl EntityStore for SqliteEntityStore {
    async fn get(&self, id: &EntityId) -> Result<Entity> {
        let id = id.clone();
        self.call("get", move |repo| repo.get(&id)).await
    }

    async fn upsert(
        &self,
        draft: EntityDraft,
        relationships: Vec<Relationship>,
    ) -> Result<UpsertOutcome> {
        let outcome = self
            .call("upsert", move |repo| repo.upsert(&draft, &relationships))
            .await?;

        self.events.publish(CatalogEvent::EntityUpserted {
            id: outcome.entity.id.clone(),
            entity_type: outcome.entity.entity_type,
            content_changed: outcome.content_changed,
            timestamp: Utc::now(),
        });
        Ok(outcome)
    }

    async fn delete(&self, id: &EntityId) -> Result<()> {
        let owned = id.clone();
        self.call("delete", move |repo| repo.delete(&owned)).await?;
        debug!(entity_id = %id, "Entity deleted");
        self.events.publish(CatalogEvent::EntityDeleted {
            id: id.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn list_by_type(&self, entity_type: EntityType, page: Page) -> Result<Vec<Entity>> {
        self.call("list_by_type", move |repo| repo.list_by_type(entity_type, page))
            .await
    }

    async fn relationships_of(
        &self,
        id: &EntityId,
        direction: Direction,
        rel_type: Option<RelationshipType>,
    ) -> Result<Vec<Relationship>> {
        let id = id.clone();
        self.call("relationships_of", move |repo| {
            repo.relationships_of(&id, direction, rel_type)
        })
        .await
    }

    async fn link(&self, rel: Relationship) -> Result<bool> {
        let edge = rel.clone();
        let added = self.call("link", move |repo| repo.link(&edge)).await?;
        if added {
            self.events.publish(CatalogEvent::RelationshipLinked {
                source: rel.source,
                target: rel.target,
                rel_type: rel.rel_type,
                timestamp: Utc::now(),
            });
        }
        Ok(added)
    }

    async fn unlink(&self, rel: Relationship) -> Result<bool> {
        let edge = rel.clone();
        let removed = self.call("unlink", move |repo| repo.unlink(&edge)).await?;
        if removed {
            self.events.publish(CatalogEvent::RelationshipUnlinked {
                source: rel.source,
                target: rel.target,
                rel_type: rel.rel_type,
                timestamp: Utc::now(),
            });
        }
        Ok(removed)
    }

    async fn list_stale(
        &self,
        model: &str,
        after: Option<EntityId>,
        limit: usize,
    ) -> Result<Vec<EntityId>> {
        let model = model.to_string();
        self.call("list_stale", move |repo| {
            repo.list_stale(&model, after.as_ref(), limit)
        })
        .await
    }

    async fn record_embedding(
        &self,
        id: &EntityId,
        expected_hash: &str,
        model: &str,
        vector: Vec<f32>,
    ) -> Result<EmbeddingWrite> {
        let id = id.clone();
        let expected_hash = expected_hash.to_string();
        let model = model.to_string();
        let vector: Arc<[f32]> = vector.into();
        self.call("record_embedding", move |repo| {
            repo.record_embedding(&id, &expected_hash, &model, &vector)
        })
        .await
    }

    async fn clear_embedding(&self, id: &EntityId) -> Result<()> {
        let id = id.clone();
        self.call("clear_embedding", move |repo| repo.clear_embedding(&id))
            .await
    }

    async fn list_embedded(
        &self,
        model: &str,
        after: Option<EntityId>,
        limit: usize,
    ) -> Result<Vec<StoredEmbedding>> {
        let model = model.to_string();
        self.call("list_embedded", move |repo| {
            repo.list_embedded(&model, after.as_ref(), limit)
        })
        .await
    }

    async fn count(&self) -> Result<u64> {
        self.call("count", |repo| repo.count()).await
    }

    fn events(&self) -> Option<broadcast::Receiver<CatalogEvent>> {
        Some(self.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteEntityStore {
        SqliteEntityStore::in_memory().unwrap()
    }

    fn draft(id: &str, entity_type: EntityType, name: &str) -> EntityDraft {
        EntityDraft::new(entity_type, name, format!("{} description", name)).with_id(id)
    }

    #[tokio::test]
    async fn test_upsert_publishes_event() {
        let store = store();
        let mut events = store.events().unwrap();

        store
            .upsert(draft("D-1", EntityType::Domain, "Sales"), vec![])
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            CatalogEvent::EntityUpserted {
                id,
                content_changed,
                ..
            } => {
                assert_eq!(id, EntityId::from("D-1"));
                assert!(content_changed);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried_or_masked() {
        let store = store();
        let err = store.get(&"missing".into()).await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_link_and_relationships() {
        let store = store();
        store
            .upsert(draft("D-1", EntityType::Domain, "Sales"), vec![])
            .await
            .unwrap();
        store
            .upsert(draft("BO-1", EntityType::BusinessObject, "Order"), vec![])
            .await
            .unwrap();

        let rel = Relationship::new("BO-1", "D-1", RelationshipType::BelongsToDomain);
        assert!(store.link(rel.clone()).await.unwrap());
        let rels = store
            .relationships_of(&"D-1".into(), Direction::Both, None)
            .await
            .unwrap();
        assert_eq!(rels, vec![rel.clone()]);

        let dangling = Relationship::new("BO-1", "D-404", RelationshipType::BelongsToDomain);
        assert!(matches!(
            store.link(dangling).await,
            Err(CatalogError::Integrity(_))
        ));

        assert!(store.unlink(rel).await.unwrap());
    }

    #[tokio::test]
    async fn test_embedding_roundtrip_through_store() {
        let store = store();
        let outcome = store
            .upsert(draft("R-1", EntityType::BusinessRule, "Max discount"), vec![])
            .await
            .unwrap();
        let id = outcome.entity.id.clone();

        let stale = store.list_stale("m", None, 10).await.unwrap();
        assert_eq!(stale, vec![id.clone()]);

        let write = store
            .record_embedding(&id, &outcome.entity.content_hash, "m", vec![0.6, 0.8])
            .await
            .unwrap();
        assert_eq!(write, EmbeddingWrite::Recorded { version: 1 });
        assert!(store.list_stale("m", None, 10).await.unwrap().is_empty());

        let embedded = store.list_embedded("m", None, 10).await.unwrap();
        assert_eq!(embedded.len(), 1);
        assert_eq!(embedded[0].vector, vec![0.6, 0.8]);

        store.clear_embedding(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap().embedding.is_none());
    }

    #[tokio::test]
    async fn test_delete_emits_event_and_counts() {
        let store = store();
        store
            .upsert(draft("D-1", EntityType::Domain, "Sales"), vec![])
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 1);

        let mut events = store.events().unwrap();
        store.delete(&"D-1".into()).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap().event_name(),
            "entity_deleted"
        );
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(matches!(
            store.delete(&"D-1".into()).await,
            Err(CatalogError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        {
            let store = SqliteEntityStore::open(&path, &StoreConfig::default()).unwrap();
            store
                .upsert(draft("D-1", EntityType::Domain, "Sales"), vec![])
                .await
                .unwrap();
        }
        let reopened = SqliteEntityStore::open(&path, &StoreConfig::default()).unwrap();
        let entity = reopened.get(&"D-1".into()).await.unwrap();
        assert_eq!(entity.name, "Sales");
        let by_type = reopened
            .list_by_type(EntityType::Domain, Page::default())
            .await
            .unwrap();
        assert_eq!(by_type.len(), 1);
    }

    /// Hold the connection lock on another thread for `hold`. Returns once
    /// the lock is taken.
    fn hold_connection(db: Arc<Database>, hold: Duration) -> std::thread::JoinHandle<()> {
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            db.with_conn(|_| {
                let _ = locked_tx.send(());
                std::thread::sleep(hold);
                Ok(())
            })
            .unwrap();
        });
        locked_rx.recv().unwrap();
        holder
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slow_delete_is_not_run_twice() {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = SqliteEntityStore::with_policy(
            Arc::clone(&db),
            RetryPolicy::immediate(5),
            Duration::from_millis(100),
        );
        store
            .upsert(draft("D-1", EntityType::Domain, "Sales"), vec![])
            .await
            .unwrap();
        let mut events = store.events().unwrap();

        let holder = hold_connection(Arc::clone(&db), Duration::from_millis(250));
        store.delete(&"D-1".into()).await.unwrap();
        holder.join().unwrap();

        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(
            events.recv().await.unwrap().event_name(),
            "entity_deleted"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slow_upsert_reports_content_change_once() {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = SqliteEntityStore::with_policy(
            Arc::clone(&db),
            RetryPolicy::immediate(5),
            Duration::from_millis(100),
        );

        let holder = hold_connection(Arc::clone(&db), Duration::from_millis(250));
        let outcome = store
            .upsert(draft("BO-1", EntityType::BusinessObject, "Order"), vec![])
            .await
            .unwrap();
        holder.join().unwrap();

        assert!(outcome.created);
        assert!(outcome.content_changed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_store_timeout_surfaces_unavailable_after_retries() {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = SqliteEntityStore::with_policy(
            Arc::clone(&db),
            RetryPolicy::immediate(3),
            Duration::from_millis(40),
        );

        let holder = hold_connection(Arc::clone(&db), Duration::from_millis(600));
        let started = std::time::Instant::now();
        let err = store.count().await.unwrap_err();
        let elapsed = started.elapsed();
        holder.join().unwrap();

        assert!(matches!(err, CatalogError::StoreUnavailable(_)));
        assert!(err.to_string().contains("timed out"));
        assert!(elapsed < Duration::from_millis(500), "took {:?}", elapsed);
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
