//! Merge-intent graph (`branch_target`).
//!
//! An edge `{source, target}` records that `source` intends to be merged
//! into `target`. Inserting an existing edge is a no-op: the primary key on
//! the pair plus `INSERT OR IGNORE` gives at-most-once semantics without a
//! check-then-insert race.

use rusqlite::{params, Connection};
use tracing::debug;

use crate::errors::DatabaseError;
use crate::models::MergeIntent;

use super::ensure_branch_exists;

/// Record that `source_branch_id` intends to merge into `target_branch_id`.
///
/// Returns `true` if a new edge was created, `false` if it already existed.
pub fn insert_merge_intent(
    conn: &Connection,
    source_branch_id: &str,
    target_branch_id: &str,
) -> Result<bool, DatabaseError> {
    ensure_branch_exists(conn, source_branch_id)?;
    ensure_branch_exists(conn, target_branch_id)?;

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO branch_target (source_branch_id, target_branch_id)
         VALUES (?1, ?2)",
        params![source_branch_id, target_branch_id],
    )?;
    debug!(
        source_branch_id,
        target_branch_id,
        created = inserted > 0,
        "merge intent recorded"
    );
    Ok(inserted > 0)
}

/// Edges pointing into `target_branch_id`: the branches pending merge into it.
pub fn list_intents(
    conn: &Connection,
    target_branch_id: &str,
) -> Result<Vec<MergeIntent>, DatabaseError> {
    ensure_branch_exists(conn, target_branch_id)?;
    query_intents(
        conn,
        "SELECT source_branch_id, target_branch_id FROM branch_target
         WHERE target_branch_id = ?1 ORDER BY source_branch_id",
        target_branch_id,
    )
}

/// Edges leaving `source_branch_id`.
pub fn list_outgoing_intents(
    conn: &Connection,
    source_branch_id: &str,
) -> Result<Vec<MergeIntent>, DatabaseError> {
    ensure_branch_exists(conn, source_branch_id)?;
    query_intents(
        conn,
        "SELECT source_branch_id, target_branch_id FROM branch_target
         WHERE source_branch_id = ?1 ORDER BY target_branch_id",
        source_branch_id,
    )
}

fn query_intents(
    conn: &Connection,
    sql: &str,
    branch_id: &str,
) -> Result<Vec<MergeIntent>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let intents = stmt
        .query_map(params![branch_id], |row| {
            Ok(MergeIntent {
                source_branch_id: row.get(0)?,
                target_branch_id: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(intents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::create_branch;
    use crate::db::Database;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_insert_is_idempotent() {
        let db = setup_db();
        let conn = db.conn();
        let a = create_branch(&conn, None, None).unwrap();
        let b = create_branch(&conn, None, None).unwrap();

        assert!(insert_merge_intent(&conn, &a.id, &b.id).unwrap());
        assert!(!insert_merge_intent(&conn, &a.id, &b.id).unwrap());

        let intents = list_intents(&conn, &b.id).unwrap();
        assert_eq!(
            intents,
            vec![MergeIntent {
                source_branch_id: a.id.clone(),
                target_branch_id: b.id.clone(),
            }]
        );
    }

    #[test]
    fn test_edges_are_directed() {
        let db = setup_db();
        let conn = db.conn();
        let a = create_branch(&conn, None, None).unwrap();
        let b = create_branch(&conn, None, None).unwrap();
        insert_merge_intent(&conn, &a.id, &b.id).unwrap();

        assert!(list_intents(&conn, &a.id).unwrap().is_empty());
        assert_eq!(list_outgoing_intents(&conn, &a.id).unwrap().len(), 1);
        assert!(list_outgoing_intents(&conn, &b.id).unwrap().is_empty());
    }

    #[test]
    fn test_missing_branch() {
        let db = setup_db();
        let conn = db.conn();
        let a = create_branch(&conn, None, None).unwrap();
        let err = insert_merge_intent(&conn, &a.id, "ghost").unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
        assert!(matches!(
            list_intents(&conn, "ghost"),
            Err(DatabaseError::NotFound { .. })
        ));
    }
}
