//! Domain model types shared by the store, the engine, and callers.
//!
//! Each struct mirrors one relation of the persisted layout. Ids are opaque
//! strings; the kernel never parses them.

use serde::{Deserialize, Serialize};

/// Reserved snapshot id denoting "no content" (used for deletions).
pub const NO_CONTENT_SNAPSHOT_ID: &str = "no-content";

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Immutable entity state payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    /// `None` only for the [`NO_CONTENT_SNAPSHOT_ID`] sentinel.
    pub content: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Change
// ---------------------------------------------------------------------------

/// One recorded mutation of one entity. Never updated after insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub file_id: String,
    pub entity_id: String,
    #[serde(rename = "type")]
    pub change_type: String,
    pub plugin_key: String,
    pub snapshot_id: String,
    pub created_at: String,
}

/// A change as supplied by a change producer, before it is logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChange {
    /// Caller-supplied id; a UUID is allocated when `None`.
    #[serde(default)]
    pub id: Option<String>,
    pub file_id: String,
    pub entity_id: String,
    #[serde(rename = "type")]
    pub change_type: String,
    pub plugin_key: String,
    pub snapshot_id: String,
}

impl NewChange {
    pub fn new(
        file_id: impl Into<String>,
        entity_id: impl Into<String>,
        change_type: impl Into<String>,
        plugin_key: impl Into<String>,
        snapshot_id: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            file_id: file_id.into(),
            entity_id: entity_id.into(),
            change_type: change_type.into(),
            plugin_key: plugin_key.into(),
            snapshot_id: snapshot_id.into(),
        }
    }

    /// Use a fixed id instead of allocating one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Branch
// ---------------------------------------------------------------------------

/// A named line of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub name: Option<String>,
    pub created_at: String,
}

/// The change currently checked out for one entity inside one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchChangePointer {
    pub branch_id: String,
    pub change_id: String,
    pub change_file_id: String,
    pub change_entity_id: String,
    pub change_type: String,
}

/// "`source_branch_id` intends to be merged into `target_branch_id`."
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MergeIntent {
    pub source_branch_id: String,
    pub target_branch_id: String,
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

/// One unresolved disagreement, deduplicated by `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeConflict {
    pub id: String,
    pub key: String,
    pub created_at: String,
}
