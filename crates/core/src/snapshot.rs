//! Content-addressed snapshot store.
//!
//! A snapshot id is the hex SHA-256 of the snapshot's canonical JSON
//! serialization, so storing the same content twice is a no-op that returns
//! the same id. The reserved [`NO_CONTENT_SNAPSHOT_ID`] row is seeded by the
//! schema and stands for "entity deleted".

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::DatabaseError;
use crate::models::{Snapshot, NO_CONTENT_SNAPSHOT_ID};

/// Compute the content address of `content`.
///
/// Object keys are sorted recursively before hashing, so two values that
/// compare equal always hash the same whatever map order serde_json uses.
pub fn content_id(content: &Value) -> Result<String, DatabaseError> {
    let canonical = serde_json::to_vec(&canonicalize(content))?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Store `content` and return its snapshot. Idempotent.
pub fn create_snapshot(
    conn: &Connection,
    content: &Value,
) -> Result<Snapshot, DatabaseError> {
    let id = content_id(content)?;
    let serialized = serde_json::to_string(content)?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO snapshot (id, content) VALUES (?1, ?2)",
        params![id, serialized],
    )?;
    debug!(id = %id, inserted = inserted > 0, "stored snapshot");
    Ok(Snapshot {
        id,
        content: Some(content.clone()),
    })
}

/// Fetch a snapshot by id.
pub fn get_snapshot(conn: &Connection, id: &str) -> Result<Snapshot, DatabaseError> {
    let raw: Option<Option<String>> = conn
        .query_row(
            "SELECT content FROM snapshot WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;

    match raw {
        None => Err(DatabaseError::not_found("snapshot", id)),
        Some(None) => Ok(Snapshot {
            id: id.to_string(),
            content: None,
        }),
        Some(Some(text)) => Ok(Snapshot {
            id: id.to_string(),
            content: Some(serde_json::from_str(&text)?),
        }),
    }
}

/// Whether a snapshot with `id` exists.
pub fn snapshot_exists(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM snapshot WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// The "no content" sentinel snapshot.
pub fn no_content() -> Snapshot {
    Snapshot {
        id: NO_CONTENT_SNAPSHOT_ID.to_string(),
        content: None,
    }
}
