//! Append-only change log.
//!
//! Changes are inserted once and never updated or deleted. Ordering among
//! changes touching the same entity is insertion order; the log does not
//! infer causality.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use crate::db::join_or_begin;
use crate::errors::DatabaseError;
use crate::models::{Change, NewChange};
use crate::snapshot;

const CHANGE_COLUMNS: &str =
    "id, file_id, entity_id, type, plugin_key, snapshot_id, created_at";

fn change_from_row(row: &Row<'_>) -> rusqlite::Result<Change> {
    Ok(Change {
        id: row.get(0)?,
        file_id: row.get(1)?,
        entity_id: row.get(2)?,
        change_type: row.get(3)?,
        plugin_key: row.get(4)?,
        snapshot_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Append a change to the log.
///
/// Fails with `NotFound` if the referenced snapshot does not exist and with
/// `Conflict` if a caller-supplied id is already taken.
pub fn insert_change(conn: &Connection, new: &NewChange) -> Result<Change, DatabaseError> {
    join_or_begin(conn, |conn| append(conn, new))
}

fn append(conn: &Connection, new: &NewChange) -> Result<Change, DatabaseError> {
    if !snapshot::snapshot_exists(conn, &new.snapshot_id)? {
        return Err(DatabaseError::not_found("snapshot", new.snapshot_id.as_str()));
    }

    let id = new
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if change_exists(conn, &id)? {
        return Err(DatabaseError::Conflict {
            entity: "change".into(),
            detail: format!("change id '{id}' already exists"),
        });
    }

    let change = Change {
        id,
        file_id: new.file_id.clone(),
        entity_id: new.entity_id.clone(),
        change_type: new.change_type.clone(),
        plugin_key: new.plugin_key.clone(),
        snapshot_id: new.snapshot_id.clone(),
        created_at: Utc::now().to_rfc3339(),
    };

    conn.execute(
        "INSERT INTO change (id, file_id, entity_id, type, plugin_key, snapshot_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            change.id,
            change.file_id,
            change.entity_id,
            change.change_type,
            change.plugin_key,
            change.snapshot_id,
            change.created_at,
        ],
    )?;
    debug!(
        id = %change.id,
        file_id = %change.file_id,
        entity_id = %change.entity_id,
        "inserted change"
    );
    Ok(change)
}

/// Attach an opaque actor id to a change for audit purposes. Idempotent.
pub fn attach_author(conn: &Connection, change_id: &str, actor_id: &str) -> Result<(), DatabaseError> {
    if !change_exists(conn, change_id)? {
        return Err(DatabaseError::not_found("change", change_id));
    }
    conn.execute(
        "INSERT OR IGNORE INTO change_author (change_id, actor_id) VALUES (?1, ?2)",
        params![change_id, actor_id],
    )?;
    Ok(())
}

/// Actor ids recorded for a change.
pub fn list_authors(conn: &Connection, change_id: &str) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT actor_id FROM change_author WHERE change_id = ?1 ORDER BY rowid",
    )?;
    let authors = stmt
        .query_map(params![change_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(authors)
}

/// Get a change by id.
pub fn get_change(conn: &Connection, id: &str) -> Result<Change, DatabaseError> {
    conn.query_row(
        &format!("SELECT {CHANGE_COLUMNS} FROM change WHERE id = ?1"),
        params![id],
        change_from_row,
    )
    .optional()?
    .ok_or_else(|| DatabaseError::not_found("change", id))
}

/// Whether a change with `id` exists.
pub fn change_exists(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM change WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// History of one entity, oldest first.
pub fn list_changes_for_entity(
    conn: &Connection,
    file_id: &str,
    entity_id: &str,
) -> Result<Vec<Change>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHANGE_COLUMNS} FROM change
         WHERE file_id = ?1 AND entity_id = ?2 ORDER BY rowid"
    ))?;
    let changes = stmt
        .query_map(params![file_id, entity_id], change_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(changes)
}

/// Total number of logged changes.
pub fn count_changes(conn: &Connection) -> Result<i64, DatabaseError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM change", [], |row| row.get(0))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::NO_CONTENT_SNAPSHOT_ID;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn mock_change(entity: &str) -> NewChange {
        NewChange::new("mock", entity, "mock", "mock-plugin", NO_CONTENT_SNAPSHOT_ID)
    }

    #[test]
    fn test_insert_and_get() {
        let db = setup_db();
        let conn = db.conn();
        let change = insert_change(&conn, &mock_change("value0")).unwrap();
        assert!(!change.id.is_empty());

        let loaded = get_change(&conn, &change.id).unwrap();
        assert_eq!(loaded, change);
    }

    #[test]
    fn test_caller_supplied_id() {
        let db = setup_db();
        let conn = db.conn();
        let change = insert_change(&conn, &mock_change("value0").with_id("change0")).unwrap();
        assert_eq!(change.id, "change0");

        let err = insert_change(&conn, &mock_change("value1").with_id("change0")).unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict { .. }));
        assert_eq!(count_changes(&conn).unwrap(), 1);
    }

    #[test]
    fn test_missing_snapshot_rejected() {
        let db = setup_db();
        let conn = db.conn();
        let new = NewChange::new("f", "e", "t", "p", "missing-snapshot");
        let err = insert_change(&conn, &new).unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { ref entity, .. } if entity == "snapshot"));
        assert_eq!(count_changes(&conn).unwrap(), 0);
    }

    #[test]
    fn test_entity_history_in_insertion_order() {
        let db = setup_db();
        let conn = db.conn();
        insert_change(&conn, &mock_change("value0").with_id("c-z")).unwrap();
        insert_change(&conn, &mock_change("value0").with_id("c-a")).unwrap();
        insert_change(&conn, &mock_change("other").with_id("c-x")).unwrap();

        let history = list_changes_for_entity(&conn, "mock", "value0").unwrap();
        let ids: Vec<_> = history.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c-z", "c-a"]);
    }

    #[test]
    fn test_authors() {
        let db = setup_db();
        let conn = db.conn();
        let change = insert_change(&conn, &mock_change("value0")).unwrap();
        attach_author(&conn, &change.id, "actor-1").unwrap();
        attach_author(&conn, &change.id, "actor-1").unwrap();
        assert_eq!(list_authors(&conn, &change.id).unwrap(), vec!["actor-1"]);

        let err = attach_author(&conn, "missing", "actor-1").unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[test]
    fn test_get_missing_change() {
        let db = setup_db();
        let conn = db.conn();
        let err = get_change(&conn, "nope").unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { ref entity, .. } if entity == "change"));
    }
}
