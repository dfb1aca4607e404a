use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{EntityId, EntityType, RelationshipType};

/// Change notifications emitted by the entity store and the embedding
/// pipeline.
///
/// Consumed by the consistency sweeper (as an early-pass nudge) and by
/// anything else that subscribes to the [`EventBus`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum CatalogEvent {
    // =========================================================================
    // Entity Store Events
    // =========================================================================
    /// An entity was created or updated.
    EntityUpserted {
        id: EntityId,
        entity_type: EntityType,
        /// The content hash changed, so the embedding is now stale.
        content_changed: bool,
        timestamp: DateTime<Utc>,
    },

    /// An entity and its edges were removed.
    EntityDeleted {
        id: EntityId,
        timestamp: DateTime<Utc>,
    },

    RelationshipLinked {
        source: EntityId,
        target: EntityId,
        rel_type: RelationshipType,
        timestamp: DateTime<Utc>,
    },

    RelationshipUnlinked {
        source: EntityId,
        target: EntityId,
        rel_type: RelationshipType,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Embedding Events
    // =========================================================================
    /// A new embedding was persisted and indexed.
    EmbeddingRefreshed {
        id: EntityId,
        version: u64,
        timestamp: DateTime<Utc>,
    },

    /// Computing an embedding failed after retries.
    EmbeddingFailed {
        id: EntityId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A sweeper pass finished.
    SweepCompleted {
        repaired: u64,
        failed: u64,
        skipped: u64,
        timestamp: DateTime<Utc>,
    },
}

impl CatalogEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CatalogEvent::EntityUpserted { timestamp, .. }
            | CatalogEvent::EntityDeleted { timestamp, .. }
            | CatalogEvent::RelationshipLinked { timestamp, .. }
            | CatalogEvent::RelationshipUnlinked { timestamp, .. }
            | CatalogEvent::EmbeddingRefreshed { timestamp, .. }
            | CatalogEvent::EmbeddingFailed { timestamp, .. }
            | CatalogEvent::SweepCompleted { timestamp, .. } => *timestamp,
        }
    }

    /// Stable event name for logs.
    pub fn event_name(&self) -> &'static str {
        match self {
            CatalogEvent::EntityUpserted { .. } => "entity_upserted",
            CatalogEvent::EntityDeleted { .. } => "entity_deleted",
            CatalogEvent::RelationshipLinked { .. } => "relationship_linked",
            CatalogEvent::RelationshipUnlinked { .. } => "relationship_unlinked",
            CatalogEvent::EmbeddingRefreshed { .. } => "embedding_refreshed",
            CatalogEvent::EmbeddingFailed { .. } => "embedding_failed",
            CatalogEvent::SweepCompleted { .. } => "sweep_completed",
        }
    }

    /// Whether this event may leave an entity with a stale embedding.
    pub fn marks_stale(&self) -> bool {
        matches!(
            self,
            CatalogEvent::EntityUpserted {
                content_changed: true,
                ..
            } | CatalogEvent::EmbeddingFailed { .. }
        )
    }
}

/// Fan-out of [`CatalogEvent`]s over a tokio broadcast channel.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// dropped, and slow subscribers observe `Lagged`.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<CatalogEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: CatalogEvent) {
        trace!(event = event.event_name(), "Publishing catalog event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
