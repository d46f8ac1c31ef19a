//! Branch manager.
//!
//! A branch is a named line of work whose state is its pointer table. Forking
//! copies the parent's live pointers (not its history) and records that the
//! parent intends to merge into the new branch: before the child can be
//! merged back, it has to stay conflict-free relative to its parent.

pub mod merge_intent;
pub mod pointer;

pub use merge_intent::{insert_merge_intent, list_intents, list_outgoing_intents};
pub use pointer::{apply_change, apply_changes, get_pointer, list_pointers};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;
use uuid::Uuid;

use crate::db::join_or_begin;
use crate::errors::DatabaseError;
use crate::models::Branch;

fn branch_from_row(row: &Row<'_>) -> rusqlite::Result<Branch> {
    Ok(Branch {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
    })
}

/// Create a branch, optionally forked from `parent_id`.
///
/// With a parent, the parent's pointers are copied over and the merge intent
/// `{parent -> new}` is inserted. All three steps commit together: the call
/// joins the transaction `conn` holds, or opens one.
pub fn create_branch(
    conn: &Connection,
    parent_id: Option<&str>,
    name: Option<&str>,
) -> Result<Branch, DatabaseError> {
    join_or_begin(conn, |conn| fork(conn, parent_id, name))
}

fn fork(
    conn: &Connection,
    parent_id: Option<&str>,
    name: Option<&str>,
) -> Result<Branch, DatabaseError> {
    if let Some(parent_id) = parent_id {
        ensure_branch_exists(conn, parent_id)?;
    }

    let branch = Branch {
        id: Uuid::new_v4().to_string(),
        name: name.map(str::to_string),
        created_at: Utc::now().to_rfc3339(),
    };

    conn.execute(
        "INSERT INTO branch (id, name, created_at) VALUES (?1, ?2, ?3)",
        params![branch.id, branch.name, branch.created_at],
    )?;

    if let Some(parent_id) = parent_id {
        let copied = pointer::copy_pointers(conn, parent_id, &branch.id)?;
        merge_intent::insert_merge_intent(conn, parent_id, &branch.id)?;
        info!(
            branch_id = %branch.id,
            parent_id,
            pointers_copied = copied,
            "forked branch"
        );
    } else {
        info!(branch_id = %branch.id, name = ?branch.name, "created branch");
    }

    Ok(branch)
}

/// Get a branch by id.
pub fn get_branch(conn: &Connection, id: &str) -> Result<Branch, DatabaseError> {
    conn.query_row(
        "SELECT id, name, created_at FROM branch WHERE id = ?1",
        params![id],
        branch_from_row,
    )
    .optional()?
    .ok_or_else(|| DatabaseError::not_found("branch", id))
}

/// All branches, oldest first.
pub fn list_branches(conn: &Connection) -> Result<Vec<Branch>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT id, name, created_at FROM branch ORDER BY rowid")?;
    let branches = stmt
        .query_map([], branch_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(branches)
}

/// Whether a branch with `id` exists.
pub fn branch_exists(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM branch WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub(crate) fn ensure_branch_exists(conn: &Connection, id: &str) -> Result<(), DatabaseError> {
    if branch_exists(conn, id)? {
        Ok(())
    } else {
        Err(DatabaseError::not_found("branch", id))
    }
}
