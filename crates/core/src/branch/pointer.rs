//! Per-branch pointer table: entity -> change currently checked out.
//!
//! One row per `(branch_id, change_file_id, change_entity_id)`. Advancing a
//! pointer overwrites that row instead of adding another, so the table is a
//! materialized view of the branch while the change log stays the history.

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::change;
use crate::db::join_or_begin;
use crate::errors::DatabaseError;
use crate::models::BranchChangePointer;

use super::ensure_branch_exists;

fn pointer_from_row(row: &Row<'_>) -> rusqlite::Result<BranchChangePointer> {
    Ok(BranchChangePointer {
        branch_id: row.get(0)?,
        change_id: row.get(1)?,
        change_file_id: row.get(2)?,
        change_entity_id: row.get(3)?,
        change_type: row.get(4)?,
    })
}

/// Point `branch_id` at `change_id` for the change's entity.
///
/// Inserts a pointer if the branch has never touched the entity, otherwise
/// replaces the existing one. Other branches are not affected.
pub fn apply_change(
    conn: &Connection,
    branch_id: &str,
    change_id: &str,
) -> Result<BranchChangePointer, DatabaseError> {
    ensure_branch_exists(conn, branch_id)?;
    let change = change::get_change(conn, change_id)?;

    conn.execute(
        "INSERT INTO branch_change_pointer
             (branch_id, change_id, change_file_id, change_entity_id, change_type)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (branch_id, change_file_id, change_entity_id)
         DO UPDATE SET change_id = excluded.change_id, change_type = excluded.change_type",
        params![
            branch_id,
            change.id,
            change.file_id,
            change.entity_id,
            change.change_type
        ],
    )?;
    debug!(
        branch_id,
        change_id = %change.id,
        file_id = %change.file_id,
        entity_id = %change.entity_id,
        "advanced branch pointer"
    );

    Ok(BranchChangePointer {
        branch_id: branch_id.to_string(),
        change_id: change.id,
        change_file_id: change.file_id,
        change_entity_id: change.entity_id,
        change_type: change.change_type,
    })
}

/// Apply several changes in order. The last change for an entity wins.
///
/// All or nothing: joins the caller's transaction or opens one.
pub fn apply_changes(
    conn: &Connection,
    branch_id: &str,
    change_ids: &[String],
) -> Result<Vec<BranchChangePointer>, DatabaseError> {
    join_or_begin(conn, |conn| {
        change_ids
            .iter()
            .map(|change_id| apply_change(conn, branch_id, change_id))
            .collect()
    })
}

/// Copy every pointer of `from_branch` into `to_branch` in one statement.
///
/// Returns the number of rows copied. `to_branch` is expected to be empty.
pub(crate) fn copy_pointers(
    conn: &Connection,
    from_branch: &str,
    to_branch: &str,
) -> Result<usize, DatabaseError> {
    let copied = conn.execute(
        "INSERT INTO branch_change_pointer
             (branch_id, change_id, change_file_id, change_entity_id, change_type)
         SELECT ?1, change_id, change_file_id, change_entity_id, change_type
         FROM branch_change_pointer WHERE branch_id = ?2",
        params![to_branch, from_branch],
    )?;
    Ok(copied)
}

/// All pointers of a branch, ordered by `(file_id, entity_id)`.
pub fn list_pointers(
    conn: &Connection,
    branch_id: &str,
) -> Result<Vec<BranchChangePointer>, DatabaseError> {
    ensure_branch_exists(conn, branch_id)?;
    let mut stmt = conn.prepare(
        "SELECT branch_id, change_id, change_file_id, change_entity_id, change_type
         FROM branch_change_pointer WHERE branch_id = ?1
         ORDER BY change_file_id, change_entity_id",
    )?;
    let pointers = stmt
        .query_map(params![branch_id], pointer_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pointers)
}

/// The pointer for one entity in a branch, if the branch has touched it.
///
/// Fails with `NotFound` if the branch does not exist.
pub fn get_pointer(
    conn: &Connection,
    branch_id: &str,
    file_id: &str,
    entity_id: &str,
) -> Result<Option<BranchChangePointer>, DatabaseError> {
    ensure_branch_exists(conn, branch_id)?;
    let pointer = conn
        .query_row(
            "SELECT branch_id, change_id, change_file_id, change_entity_id, change_type
             FROM branch_change_pointer
             WHERE branch_id = ?1 AND change_file_id = ?2 AND change_entity_id = ?3",
            params![branch_id, file_id, entity_id],
            pointer_from_row,
        )
        .optional()?;
    Ok(pointer)
}
