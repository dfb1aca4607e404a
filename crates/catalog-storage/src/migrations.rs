//! Database schema migrations.
//!
//! Applies the initial catalog schema: the entities and relationships
//! tables plus the schema_migrations tracking table.

use rusqlite::Connection;
use tracing::info;

use catalog_core::error::CatalogError;

use crate::db::map_sqlite;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), CatalogError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| map_sqlite("create migrations table", e))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| map_sqlite("query migration version", e))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: catalog_graph");
    }

    Ok(())
}

/// Version 1: entities and typed relationships.
///
/// Embeddings are little-endian f32 BLOBs. `embedded_hash` records the
/// content hash the embedding was computed from; a mismatch with
/// `content_hash` marks the row stale.
fn apply_v1(conn: &Connection) -> Result<(), CatalogError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS entities (
            id                TEXT PRIMARY KEY NOT NULL,
            entity_type       TEXT NOT NULL
                              CHECK (entity_type IN ('business_object', 'data_element', 'domain', 'business_rule')),
            name              TEXT NOT NULL CHECK (length(trim(name)) > 0),
            description       TEXT NOT NULL DEFAULT '',
            attributes        TEXT NOT NULL DEFAULT '{}',
            content_hash      TEXT NOT NULL,
            embedding         BLOB,
            embedding_version INTEGER NOT NULL DEFAULT 0,
            embedded_hash     TEXT,
            embedding_model   TEXT,
            created_at        INTEGER NOT NULL,
            updated_at        INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_entities_type
            ON entities (entity_type, id);

        CREATE INDEX IF NOT EXISTS idx_entities_name
            ON entities (name);

        CREATE TABLE IF NOT EXISTS relationships (
            source      TEXT NOT NULL,
            target      TEXT NOT NULL,
            rel_type    TEXT NOT NULL,
            created_at  INTEGER NOT NULL,
            PRIMARY KEY (source, target, rel_type),
            FOREIGN KEY (source) REFERENCES entities(id) ON DELETE CASCADE,
            FOREIGN KEY (target) REFERENCES entities(id) ON DELETE CASCADE,
            CHECK (source <> target)
        );

        CREATE INDEX IF NOT EXISTS idx_relationships_target
            ON relationships (target, rel_type);

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'catalog_graph');
        ",
    )
    .map_err(|e| map_sqlite("apply migration v1", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    fn insert_entity(conn: &Connection, id: &str, entity_type: &str) {
        conn.execute(
            "INSERT INTO entities (id, entity_type, name, content_hash, created_at, updated_at)
             VALUES (?1, ?2, 'n', 'h', 0, 0)",
            rusqlite::params![id, entity_type],
        )
        .unwrap();
    }

    #[test]
    fn test_migrations_run_once() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_entity_type_check_constraint() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();

        insert_entity(&conn, "BO-1", "business_object");
        let bad = conn.execute(
            "INSERT INTO entities (id, entity_type, name, content_hash, created_at, updated_at)
             VALUES ('X', 'widget', 'n', 'h', 0, 0)",
            [],
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_relationships_cascade_on_delete() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();

        insert_entity(&conn, "BO-1", "business_object");
        insert_entity(&conn, "D-1", "domain");
        conn.execute(
            "INSERT INTO relationships (source, target, rel_type, created_at)
             VALUES ('BO-1', 'D-1', 'BELONGS_TO_DOMAIN', 0)",
            [],
        )
        .unwrap();

        conn.execute("DELETE FROM entities WHERE id = 'D-1'", []).unwrap();
        let edges: i64 = conn
            .query_row("SELECT COUNT(*) FROM relationships", [], |row| row.get(0))
            .unwrap();
        assert_eq!(edges, 0);
    }

    #[test]
    fn test_relationship_requires_existing_endpoints() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();

        insert_entity(&conn, "BO-1", "business_object");
        let dangling = conn.execute(
            "INSERT INTO relationships (source, target, rel_type, created_at)
             VALUES ('BO-1', 'missing', 'BELONGS_TO_DOMAIN', 0)",
            [],
        );
        assert!(dangling.is_err());
    }
}
