//! Standalone entry points for every kernel operation.
//!
//! Each method opens its own transaction and delegates to the joinable free
//! function of the owning module. Callers composing several operations into
//! one atomic unit should use [`Database::transaction`] with those functions
//! directly instead.

use std::collections::BTreeSet;

use super::Database;
use crate::conflict::{Divergence, RecordedDivergence};
use crate::errors::DatabaseError;
use crate::models::{
    Branch, BranchChangePointer, Change, ChangeConflict, MergeIntent, NewChange, Snapshot,
};
use crate::{branch, change, conflict, snapshot};

impl Database {
    // -- snapshot -----------------------------------------------------------

    /// Store a snapshot (content-addressed, idempotent).
    pub fn create_snapshot(&self, content: &serde_json::Value) -> Result<Snapshot, DatabaseError> {
        self.transaction(|tx| snapshot::create_snapshot(tx, content))
    }

    /// Fetch a snapshot by id.
    pub fn get_snapshot(&self, id: &str) -> Result<Snapshot, DatabaseError> {
        self.read(|conn| snapshot::get_snapshot(conn, id))
    }

    // -- change -------------------------------------------------------------

    /// Append a change to the log, optionally recording the actor behind it.
    pub fn insert_change(
        &self,
        new: &NewChange,
        actor_id: Option<&str>,
    ) -> Result<Change, DatabaseError> {
        self.transaction(|tx| {
            let change = change::insert_change(tx, new)?;
            if let Some(actor_id) = actor_id {
                change::attach_author(tx, &change.id, actor_id)?;
            }
            Ok(change)
        })
    }

    /// Get a change by id.
    pub fn get_change(&self, id: &str) -> Result<Change, DatabaseError> {
        self.read(|conn| change::get_change(conn, id))
    }

    /// History of one entity, oldest first.
    pub fn list_changes_for_entity(
        &self,
        file_id: &str,
        entity_id: &str,
    ) -> Result<Vec<Change>, DatabaseError> {
        self.read(|conn| change::list_changes_for_entity(conn, file_id, entity_id))
    }

    // -- branch -------------------------------------------------------------

    /// Create a branch, optionally forked from `parent_id`, atomically.
    pub fn create_branch(
        &self,
        parent_id: Option<&str>,
        name: Option<&str>,
    ) -> Result<Branch, DatabaseError> {
        self.transaction(|tx| branch::create_branch(tx, parent_id, name))
    }

    /// Get a branch by id.
    pub fn get_branch(&self, id: &str) -> Result<Branch, DatabaseError> {
        self.read(|conn| branch::get_branch(conn, id))
    }

    /// All branches, oldest first.
    pub fn list_branches(&self) -> Result<Vec<Branch>, DatabaseError> {
        self.read(branch::list_branches)
    }

    /// Advance a branch's pointer for the change's entity.
    pub fn apply_change(
        &self,
        branch_id: &str,
        change_id: &str,
    ) -> Result<BranchChangePointer, DatabaseError> {
        self.transaction(|tx| branch::apply_change(tx, branch_id, change_id))
    }

    /// Apply several changes in order, all or nothing.
    pub fn apply_changes(
        &self,
        branch_id: &str,
        change_ids: &[String],
    ) -> Result<Vec<BranchChangePointer>, DatabaseError> {
        self.transaction(|tx| branch::apply_changes(tx, branch_id, change_ids))
    }

    /// The pointer table of a branch.
    pub fn list_pointers(&self, branch_id: &str) -> Result<Vec<BranchChangePointer>, DatabaseError> {
        self.read(|conn| branch::list_pointers(conn, branch_id))
    }

    // -- merge intents ------------------------------------------------------

    /// Record a merge intent (idempotent). Returns whether it was new.
    pub fn insert_merge_intent(
        &self,
        source_branch_id: &str,
        target_branch_id: &str,
    ) -> Result<bool, DatabaseError> {
        self.transaction(|tx| branch::insert_merge_intent(tx, source_branch_id, target_branch_id))
    }

    /// Branches pending merge into `target_branch_id`.
    pub fn list_intents(&self, target_branch_id: &str) -> Result<Vec<MergeIntent>, DatabaseError> {
        self.read(|conn| branch::list_intents(conn, target_branch_id))
    }

    // -- conflicts ----------------------------------------------------------

    /// Create or grow the conflict identified by `key`.
    pub fn create_change_conflict(
        &self,
        key: &str,
        conflicting_change_ids: &BTreeSet<String>,
    ) -> Result<ChangeConflict, DatabaseError> {
        self.transaction(|tx| conflict::create_change_conflict(tx, key, conflicting_change_ids))
    }

    /// Get a conflict by id.
    pub fn get_conflict(&self, id: &str) -> Result<ChangeConflict, DatabaseError> {
        self.read(|conn| conflict::get_conflict(conn, id))
    }

    /// All conflicts, oldest first.
    pub fn list_conflicts(&self) -> Result<Vec<ChangeConflict>, DatabaseError> {
        self.read(conflict::list_conflicts)
    }

    /// Change ids participating in a conflict.
    pub fn list_conflict_elements(&self, conflict_id: &str) -> Result<Vec<String>, DatabaseError> {
        self.read(|conn| conflict::list_conflict_elements(conn, conflict_id))
    }

    /// Entities two branches disagree on, without recording anything.
    pub fn detect_divergence(
        &self,
        source_branch_id: &str,
        target_branch_id: &str,
    ) -> Result<Vec<Divergence>, DatabaseError> {
        self.read(|conn| conflict::detect_divergence(conn, source_branch_id, target_branch_id))
    }

    /// Detect divergences between two branches and record them as conflicts
    /// in one transaction.
    pub fn record_divergences(
        &self,
        source_branch_id: &str,
        target_branch_id: &str,
    ) -> Result<Vec<RecordedDivergence>, DatabaseError> {
        self.transaction(|tx| conflict::record_divergences(tx, source_branch_id, target_branch_id))
    }
}
