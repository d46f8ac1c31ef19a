//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The SQLite
//! `user_version` pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS snapshot (
            id          TEXT PRIMARY KEY,
            content     TEXT
        );

        INSERT OR IGNORE INTO snapshot (id, content) VALUES ('no-content', NULL);

        CREATE TABLE IF NOT EXISTS change (
            id          TEXT PRIMARY KEY,
            file_id     TEXT NOT NULL,
            entity_id   TEXT NOT NULL,
            type        TEXT NOT NULL,
            plugin_key  TEXT NOT NULL,
            snapshot_id TEXT NOT NULL REFERENCES snapshot (id),
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_change_entity ON change (file_id, entity_id);

        CREATE TABLE IF NOT EXISTS branch (
            id          TEXT PRIMARY KEY,
            name        TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS branch_change_pointer (
            branch_id        TEXT NOT NULL REFERENCES branch (id) ON DELETE CASCADE,
            change_id        TEXT NOT NULL REFERENCES change (id),
            change_file_id   TEXT NOT NULL,
            change_entity_id TEXT NOT NULL,
            change_type      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_branch_change_pointer_branch
            ON branch_change_pointer (branch_id);

        CREATE TABLE IF NOT EXISTS branch_target (
            source_branch_id TEXT NOT NULL REFERENCES branch (id) ON DELETE CASCADE,
            target_branch_id TEXT NOT NULL REFERENCES branch (id) ON DELETE CASCADE,
            PRIMARY KEY (source_branch_id, target_branch_id)
        );

        CREATE TABLE IF NOT EXISTS change_conflict (
            id          TEXT PRIMARY KEY,
            key         TEXT NOT NULL UNIQUE,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS change_conflict_element (
            change_conflict_id TEXT NOT NULL REFERENCES change_conflict (id) ON DELETE CASCADE,
            change_id          TEXT NOT NULL REFERENCES change (id),
            PRIMARY KEY (change_conflict_id, change_id)
        );

        CREATE INDEX IF NOT EXISTS idx_change_conflict_element_change
            ON change_conflict_element (change_id);
        "#,
    ),
    (
        2,
        "natural key for branch pointers",
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_branch_change_pointer_entity
            ON branch_change_pointer (branch_id, change_file_id, change_entity_id);
        "#,
    ),
    (
        3,
        "change authors",
        r#"
        CREATE TABLE IF NOT EXISTS change_author (
            change_id   TEXT NOT NULL REFERENCES change (id),
            actor_id    TEXT NOT NULL,
            PRIMARY KEY (change_id, actor_id)
        );
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
pub fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
