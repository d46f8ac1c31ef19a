//! Conflict clustering keyed by a caller-chosen deduplication key.
//!
//! [`create_change_conflict`] is a read-decide-write sequence: look the key
//! up, create the conflict if it is new, then add whichever change ids are
//! not members yet. It runs under the write lock, either the caller's
//! [`crate::db::Database::transaction`] or the `BEGIN IMMEDIATE` that
//! [`crate::db::join_or_begin`] opens on an autocommit connection, so two
//! detection passes racing on the same key converge on one row holding the
//! union of their elements.

use std::collections::BTreeSet;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::change;
use crate::db::join_or_begin;
use crate::errors::DatabaseError;
use crate::models::ChangeConflict;

fn conflict_from_row(row: &Row<'_>) -> rusqlite::Result<ChangeConflict> {
    Ok(ChangeConflict {
        id: row.get(0)?,
        key: row.get(1)?,
        created_at: row.get(2)?,
    })
}

/// Record that `conflicting_change_ids` disagree, under `key`.
///
/// If a conflict with `key` exists, the ids it does not contain yet are added
/// to it and the existing conflict is returned. Keys are never merged with
/// each other: the same change id under two keys yields two conflicts.
///
/// Every id must reference an existing change; otherwise nothing is written
/// and `NotFound` is returned.
pub fn create_change_conflict(
    conn: &Connection,
    key: &str,
    conflicting_change_ids: &BTreeSet<String>,
) -> Result<ChangeConflict, DatabaseError> {
    join_or_begin(conn, |conn| merge_into_key(conn, key, conflicting_change_ids))
}

fn merge_into_key(
    conn: &Connection,
    key: &str,
    conflicting_change_ids: &BTreeSet<String>,
) -> Result<ChangeConflict, DatabaseError> {
    if key.is_empty() {
        return Err(DatabaseError::InvalidArgument(
            "conflict key must not be empty".into(),
        ));
    }
    if conflicting_change_ids.is_empty() {
        return Err(DatabaseError::InvalidArgument(
            "conflicting change set must not be empty".into(),
        ));
    }

    for change_id in conflicting_change_ids {
        if !change::change_exists(conn, change_id)? {
            return Err(DatabaseError::not_found("change", change_id.as_str()));
        }
    }

    let conflict = match get_conflict_by_key(conn, key)? {
        Some(existing) => existing,
        None => {
            let conflict = ChangeConflict {
                id: Uuid::new_v4().to_string(),
                key: key.to_string(),
                created_at: Utc::now().to_rfc3339(),
            };
            conn.execute(
                "INSERT INTO change_conflict (id, key, created_at) VALUES (?1, ?2, ?3)",
                params![conflict.id, conflict.key, conflict.created_at],
            )?;
            info!(id = %conflict.id, key, "created change conflict");
            conflict
        }
    };

    let known: BTreeSet<String> = list_conflict_elements(conn, &conflict.id)?
        .into_iter()
        .collect();

    let mut added = 0usize;
    for change_id in conflicting_change_ids.difference(&known) {
        added += conn.execute(
            "INSERT OR IGNORE INTO change_conflict_element (change_conflict_id, change_id)
             VALUES (?1, ?2)",
            params![conflict.id, change_id],
        )?;
    }
    debug!(
        id = %conflict.id,
        key,
        added,
        already_known = known.len(),
        "merged change conflict elements"
    );

    Ok(conflict)
}

/// Get a conflict by id.
pub fn get_conflict(conn: &Connection, id: &str) -> Result<ChangeConflict, DatabaseError> {
    conn.query_row(
        "SELECT id, key, created_at FROM change_conflict WHERE id = ?1",
        params![id],
        conflict_from_row,
    )
    .optional()?
    .ok_or_else(|| DatabaseError::not_found("change conflict", id))
}

/// Look a conflict up by its deduplication key.
pub fn get_conflict_by_key(
    conn: &Connection,
    key: &str,
) -> Result<Option<ChangeConflict>, DatabaseError> {
    let conflict = conn
        .query_row(
            "SELECT id, key, created_at FROM change_conflict WHERE key = ?1",
            params![key],
            conflict_from_row,
        )
        .optional()?;
    Ok(conflict)
}

/// All conflicts, oldest first.
pub fn list_conflicts(conn: &Connection) -> Result<Vec<ChangeConflict>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT id, key, created_at FROM change_conflict ORDER BY rowid")?;
    let conflicts = stmt
        .query_map([], conflict_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(conflicts)
}

/// Change ids participating in a conflict, in the order they were added.
pub fn list_conflict_elements(
    conn: &Connection,
    conflict_id: &str,
) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT change_id FROM change_conflict_element
         WHERE change_conflict_id = ?1 ORDER BY rowid",
    )?;
    let ids = stmt
        .query_map(params![conflict_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Conflicts a change participates in, across all keys.
pub fn list_conflicts_for_change(
    conn: &Connection,
    change_id: &str,
) -> Result<Vec<ChangeConflict>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.key, c.created_at
         FROM change_conflict c
         JOIN change_conflict_element e ON e.change_conflict_id = c.id
         WHERE e.change_id = ?1
         ORDER BY c.rowid",
    )?;
    let conflicts = stmt
        .query_map(params![change_id], conflict_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(conflicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::insert_change;
    use crate::db::Database;
    use crate::models::{NewChange, NO_CONTENT_SNAPSHOT_ID};

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        for (id, entity) in [("change0", "value0"), ("change1", "value1"), ("change2", "value1")] {
            insert_change(
                &db.conn(),
                &NewChange::new("mock", entity, "mock", "mock-plugin", NO_CONTENT_SNAPSHOT_ID)
                    .with_id(id),
            )
            .unwrap();
        }
        db
    }

    fn ids(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_dedup_by_key() {
        let db = setup_db();
        let conn = db.conn();
        let first = create_change_conflict(&conn, "mock-conflict", &ids(&["change0", "change1"]))
            .unwrap();
        let second = create_change_conflict(&conn, "mock-conflict", &ids(&["change0", "change1"]))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(list_conflicts(&conn).unwrap().len(), 1);
        assert_eq!(
            list_conflict_elements(&conn, &first.id).unwrap(),
            vec!["change0", "change1"]
        );
    }

    #[test]
    fn test_same_key_grows_element_set() {
        let db = setup_db();
        let conn = db.conn();
        let first = create_change_conflict(&conn, "mock-conflict", &ids(&["change0", "change1"]))
            .unwrap();
        let second = create_change_conflict(&conn, "mock-conflict", &ids(&["change1", "change2"]))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(
            list_conflict_elements(&conn, &first.id).unwrap(),
            vec!["change0", "change1", "change2"]
        );
    }

    #[test]
    fn test_keys_stay_separate() {
        let db = setup_db();
        let conn = db.conn();
        let first = create_change_conflict(&conn, "mock-conflict", &ids(&["change0", "change1"]))
            .unwrap();
        let other =
            create_change_conflict(&conn, "mock-conflict-other", &ids(&["change1", "change2"]))
                .unwrap();

        assert_ne!(first.id, other.id);
        let keys: Vec<_> = list_conflicts(&conn)
            .unwrap()
            .into_iter()
            .map(|c| c.key)
            .collect();
        assert_eq!(keys, vec!["mock-conflict", "mock-conflict-other"]);
        assert_eq!(list_conflict_elements(&conn, &first.id).unwrap().len(), 2);
        assert_eq!(list_conflict_elements(&conn, &other.id).unwrap().len(), 2);
        assert_eq!(list_conflicts_for_change(&conn, "change1").unwrap().len(), 2);
    }

    #[test]
    fn test_missing_change_writes_nothing() {
        let db = setup_db();
        let err = db
            .transaction(|tx| {
                create_change_conflict(tx, "mock-conflict", &ids(&["change0", "ghost"]))
            })
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { ref id, .. } if id == "ghost"));

        let conn = db.conn();
        assert!(list_conflicts(&conn).unwrap().is_empty());
        assert!(get_conflict_by_key(&conn, "mock-conflict").unwrap().is_none());
    }

    #[test]
    fn test_invalid_arguments() {
        let db = setup_db();
        let conn = db.conn();
        assert!(matches!(
            create_change_conflict(&conn, "k", &BTreeSet::new()),
            Err(DatabaseError::InvalidArgument(_))
        ));
        assert!(matches!(
            create_change_conflict(&conn, "", &ids(&["change0"])),
            Err(DatabaseError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_get_conflict() {
        let db = setup_db();
        let conn = db.conn();
        let created = create_change_conflict(&conn, "k", &ids(&["change0"])).unwrap();
        assert_eq!(get_conflict(&conn, &created.id).unwrap(), created);
        assert!(matches!(
            get_conflict(&conn, "ghost"),
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[test]
    fn test_failed_insert_on_plain_connection_leaves_no_conflict() {
        let db = setup_db();
        let conn = db.conn();
        conn.execute_batch("DROP TABLE change_conflict_element").unwrap();

        assert!(create_change_conflict(&conn, "mock-conflict", &ids(&["change0"])).is_err());
        assert!(conn.is_autocommit());
        assert!(get_conflict_by_key(&conn, "mock-conflict").unwrap().is_none());
    }
}
