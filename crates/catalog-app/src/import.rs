//! Bulk loading of a catalog from JSON.
//!
//! ```json
//! {
//!   "entities": [
//!     { "id": "BO-001", "entity_type": "business_object", "name": "Customer",
//!       "description": "A party that buys goods", "attributes": { "domain": "Sales" } }
//!   ],
//!   "relationships": [
//!     { "source": "BO-001", "target": "D-001", "rel_type": "BELONGS_TO_DOMAIN" }
//!   ]
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use catalog_core::error::Result;
use catalog_core::types::{EntityDraft, Relationship};
use catalog_vector::Catalog;

#[derive(Debug, Default, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub entities: Vec<EntityDraft>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl CatalogFile {
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub entities: usize,
    pub relationships: usize,
    pub rejected: usize,
}

/// Upsert every entity, then link every relationship. Rejected records are
/// logged and counted; transient failures abort the import.
pub async fn import(catalog: &Catalog, file: CatalogFile) -> Result<ImportReport> {
    let mut report = ImportReport::default();

    for draft in file.entities {
        let id = draft.id.clone();
        match catalog.upsert_entity(draft, Vec::new()).await {
            Ok(_) => report.entities += 1,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                warn!(entity_id = %id, error = %e, "Entity rejected");
                report.rejected += 1;
            }
        }
    }

    for rel in file.relationships {
        let label = format!("{} -{}-> {}", rel.source, rel.rel_type, rel.target);
        match catalog.link(rel).await {
            Ok(_) => report.relationships += 1,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                warn!(relationship = %label, error = %e, "Relationship rejected");
                report.rejected += 1;
            }
        }
    }

    info!(
        entities = report.entities,
        relationships = report.relationships,
        rejected = report.rejected,
        "Import completed"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use catalog_core::config::CatalogConfig;
    use catalog_core::types::{Direction, EntityId};
    use catalog_storage::{EntityStore, SqliteEntityStore};
    use catalog_vector::HashingEmbedding;

    const SAMPLE: &str = r#"{
        "entities": [
            {"id": "D-1", "entity_type": "domain", "name": "Sales", "description": "selling things"},
            {"id": "BO-1", "entity_type": "business_object", "name": "Customer",
             "description": "a buyer", "attributes": {"domain": "Sales", "criticality": 4}},
            {"id": "BO-2", "entity_type": "business_object", "name": "", "description": "nameless"}
        ],
        "relationships": [
            {"source": "BO-1", "target": "D-1", "rel_type": "BELONGS_TO_DOMAIN"},
            {"source": "BO-1", "target": "D-404", "rel_type": "BELONGS_TO_DOMAIN"}
        ]
    }"#;

    #[tokio::test]
    async fn test_import_counts_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let store: Arc<dyn EntityStore> = Arc::new(SqliteEntityStore::in_memory().unwrap());
        let catalog = Catalog::new(
            Arc::clone(&store),
            Arc::new(HashingEmbedding::new(32)),
            &CatalogConfig::default(),
        );

        let file = CatalogFile::read(&path).unwrap();
        let report = import(&catalog, file).await.unwrap();
        assert_eq!(
            report,
            ImportReport {
                entities: 2,
                relationships: 1,
                rejected: 2,
            }
        );

        let edges = store
            .relationships_of(&EntityId::from("BO-1"), Direction::Outgoing, None)
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
    }

    #[test]
    fn test_malformed_file_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            CatalogFile::read(&path),
            Err(catalog_core::error::CatalogError::Serialization(_))
        ));
    }
}
