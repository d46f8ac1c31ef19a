//! Divergence detection between two branches.
//!
//! Two branches diverge on an entity when both have a pointer for it and the
//! pointers reference different changes with different snapshots. The same
//! change, or two changes that landed on identical content, reconcile
//! trivially and are not reported. Entities only one side has touched are
//! not divergences either; the merge workflow handles them.

use std::collections::BTreeSet;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::branch::ensure_branch_exists;
use crate::db::join_or_begin;
use crate::errors::DatabaseError;
use crate::models::{ChangeConflict, NO_CONTENT_SNAPSHOT_ID};

use super::engine::create_change_conflict;

/// Categorisation of a divergence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    /// Both sides hold different content for the entity.
    Content,
    /// One side deleted the entity, the other edited it.
    EditDelete,
}

impl std::fmt::Display for DivergenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Content => write!(f, "content"),
            Self::EditDelete => write!(f, "edit_delete"),
        }
    }
}

/// One entity on which two branches disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Divergence {
    pub file_id: String,
    pub entity_id: String,
    pub source_change_id: String,
    pub target_change_id: String,
    pub kind: DivergenceKind,
}

impl Divergence {
    /// Stable conflict key for this entity, so repeated detection passes fold
    /// into the same conflict.
    pub fn conflict_key(&self) -> String {
        format!("divergence:{}:{}", self.file_id, self.entity_id)
    }

    /// The two disagreeing changes.
    pub fn change_ids(&self) -> BTreeSet<String> {
        [self.source_change_id.clone(), self.target_change_id.clone()]
            .into_iter()
            .collect()
    }
}

/// A divergence together with the conflict it was recorded under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedDivergence {
    pub divergence: Divergence,
    pub conflict: ChangeConflict,
}

/// Compare the pointer tables of two branches.
///
/// Results are ordered by `(file_id, entity_id)`.
pub fn detect_divergence(
    conn: &Connection,
    source_branch_id: &str,
    target_branch_id: &str,
) -> Result<Vec<Divergence>, DatabaseError> {
    ensure_branch_exists(conn, source_branch_id)?;
    ensure_branch_exists(conn, target_branch_id)?;

    let mut stmt = conn.prepare(
        "SELECT s.change_file_id, s.change_entity_id,
                s.change_id, t.change_id,
                cs.snapshot_id, ct.snapshot_id
         FROM branch_change_pointer s
         JOIN branch_change_pointer t
           ON t.branch_id = ?2
          AND t.change_file_id = s.change_file_id
          AND t.change_entity_id = s.change_entity_id
         JOIN change cs ON cs.id = s.change_id
         JOIN change ct ON ct.id = t.change_id
         WHERE s.branch_id = ?1
           AND s.change_id <> t.change_id
           AND cs.snapshot_id <> ct.snapshot_id
         ORDER BY s.change_file_id, s.change_entity_id",
    )?;

    let divergences = stmt
        .query_map(params![source_branch_id, target_branch_id], |row| {
            let source_snapshot: String = row.get(4)?;
            let target_snapshot: String = row.get(5)?;
            let kind = if source_snapshot == NO_CONTENT_SNAPSHOT_ID
                || target_snapshot == NO_CONTENT_SNAPSHOT_ID
            {
                DivergenceKind::EditDelete
            } else {
                DivergenceKind::Content
            };
            Ok(Divergence {
                file_id: row.get(0)?,
                entity_id: row.get(1)?,
                source_change_id: row.get(2)?,
                target_change_id: row.get(3)?,
                kind,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for d in &divergences {
        debug!(
            file_id = %d.file_id,
            entity_id = %d.entity_id,
            kind = %d.kind,
            "divergence detected"
        );
    }
    info!(
        source_branch_id,
        target_branch_id,
        count = divergences.len(),
        "compared branches"
    );
    Ok(divergences)
}

/// Detect divergences and record each as a change conflict, in a single
/// pass. All-or-nothing: joins the caller's transaction or opens one.
pub fn record_divergences(
    conn: &Connection,
    source_branch_id: &str,
    target_branch_id: &str,
) -> Result<Vec<RecordedDivergence>, DatabaseError> {
    join_or_begin(conn, |conn| {
        detect_divergence(conn, source_branch_id, target_branch_id)?
            .into_iter()
            .map(|divergence| {
                let conflict = create_change_conflict(
                    conn,
                    &divergence.conflict_key(),
                    &divergence.change_ids(),
                )?;
                Ok::<_, DatabaseError>(RecordedDivergence {
                    divergence,
                    conflict,
                })
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::{apply_change, apply_changes, create_branch};
    use crate::change::insert_change;
    use crate::conflict::engine::list_conflict_elements;
    use crate::db::Database;
    use crate::models::NewChange;
    use crate::snapshot::create_snapshot;
    use serde_json::json;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn add_change(conn: &Connection, id: &str, entity: &str, snapshot_id: &str) {
        insert_change(
            conn,
            &NewChange::new("file0", entity, "row", "mock-plugin", snapshot_id).with_id(id),
        )
        .unwrap();
    }

    #[test]
    fn test_detects_content_divergence() {
        let db = setup_db();
        let conn = db.conn();
        let a = create_snapshot(&conn, &json!({"v": "a"})).unwrap();
        let b = create_snapshot(&conn, &json!({"v": "b"})).unwrap();
        add_change(&conn, "c0", "e0", &a.id);
        add_change(&conn, "c1", "e0", &b.id);

        let main = create_branch(&conn, None, None).unwrap();
        let feature = create_branch(&conn, None, None).unwrap();
        apply_change(&conn, &main.id, "c0").unwrap();
        apply_change(&conn, &feature.id, "c1").unwrap();

        let found = detect_divergence(&conn, &main.id, &feature.id).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, DivergenceKind::Content);
        assert_eq!(found[0].conflict_key(), "divergence:file0:e0");
        assert_eq!(found[0].change_ids().len(), 2);
    }

    #[test]
    fn test_identical_content_is_not_a_divergence() {
        let db = setup_db();
        let conn = db.conn();
        let same = create_snapshot(&conn, &json!({"v": 1})).unwrap();
        add_change(&conn, "c0", "e0", &same.id);
        add_change(&conn, "c1", "e0", &same.id);

        let main = create_branch(&conn, None, None).unwrap();
        let feature = create_branch(&conn, Some(&main.id), None).unwrap();
        apply_change(&conn, &main.id, "c0").unwrap();
        apply_change(&conn, &feature.id, "c1").unwrap();

        assert!(detect_divergence(&conn, &main.id, &feature.id).unwrap().is_empty());
    }

    #[test]
    fn test_shared_and_one_sided_entities_are_skipped() {
        let db = setup_db();
        let conn = db.conn();
        let s = create_snapshot(&conn, &json!({"v": 1})).unwrap();
        add_change(&conn, "shared", "e0", &s.id);
        add_change(&conn, "only-main", "e1", &s.id);

        let main = create_branch(&conn, None, None).unwrap();
        apply_change(&conn, &main.id, "shared").unwrap();
        let feature = create_branch(&conn, Some(&main.id), None).unwrap();
        apply_change(&conn, &main.id, "only-main").unwrap();

        assert!(detect_divergence(&conn, &main.id, &feature.id).unwrap().is_empty());
    }

    #[test]
    fn test_edit_delete() {
        let db = setup_db();
        let conn = db.conn();
        let s = create_snapshot(&conn, &json!({"v": 1})).unwrap();
        add_change(&conn, "edit", "e0", &s.id);
        add_change(&conn, "delete", "e0", NO_CONTENT_SNAPSHOT_ID);

        let main = create_branch(&conn, None, None).unwrap();
        let feature = create_branch(&conn, None, None).unwrap();
        apply_change(&conn, &main.id, "edit").unwrap();
        apply_change(&conn, &feature.id, "delete").unwrap();

        let found = detect_divergence(&conn, &main.id, &feature.id).unwrap();
        assert_eq!(found[0].kind, DivergenceKind::EditDelete);
    }

    #[test]
    fn test_record_divergences_folds_repeated_passes() {
        let db = setup_db();
        let (main, feature) = {
            let conn = db.conn();
            let a = create_snapshot(&conn, &json!({"v": "a"})).unwrap();
            let b = create_snapshot(&conn, &json!({"v": "b"})).unwrap();
            let c = create_snapshot(&conn, &json!({"v": "c"})).unwrap();
            add_change(&conn, "c0", "e0", &a.id);
            add_change(&conn, "c1", "e0", &b.id);
            add_change(&conn, "c2", "e0", &c.id);
            let main = create_branch(&conn, None, None).unwrap();
            let feature = create_branch(&conn, None, None).unwrap();
            apply_change(&conn, &main.id, "c0").unwrap();
            apply_change(&conn, &feature.id, "c1").unwrap();
            (main, feature)
        };

        let first = db
            .transaction(|tx| record_divergences(tx, &main.id, &feature.id))
            .unwrap();
        db.transaction(|tx| apply_change(tx, &feature.id, "c2"))
            .unwrap();
        let second = db
            .transaction(|tx| record_divergences(tx, &main.id, &feature.id))
            .unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].conflict.id, second[0].conflict.id);
        assert_eq!(second[0].divergence.target_change_id, "c2");
        assert_eq!(
            list_conflict_elements(&db.conn(), &first[0].conflict.id).unwrap(),
            vec!["c0", "c1", "c2"]
        );
    }

    #[test]
    fn test_recorded_pass_matches_detection() {
        let db = setup_db();
        let conn = db.conn();
        let a = create_snapshot(&conn, &json!({"v": "a"})).unwrap();
        let b = create_snapshot(&conn, &json!({"v": "b"})).unwrap();
        for (id, entity, snapshot) in [
            ("m0", "e0", &a.id),
            ("f0", "e0", &b.id),
            ("m1", "e1", &b.id),
            ("f1", "e1", &a.id),
        ] {
            add_change(&conn, id, entity, snapshot);
        }
        let main = create_branch(&conn, None, None).unwrap();
        let feature = create_branch(&conn, None, None).unwrap();
        apply_changes(&conn, &main.id, &["m0".to_string(), "m1".to_string()]).unwrap();
        apply_changes(&conn, &feature.id, &["f0".to_string(), "f1".to_string()]).unwrap();

        // Called on a plain connection: opens and commits its own transaction.
        let recorded = record_divergences(&conn, &main.id, &feature.id).unwrap();
        assert!(conn.is_autocommit());

        let detected = detect_divergence(&conn, &main.id, &feature.id).unwrap();
        let reported: Vec<_> = recorded.iter().map(|r| r.divergence.clone()).collect();
        assert_eq!(reported, detected);
        for r in &recorded {
            assert_eq!(r.conflict.key, r.divergence.conflict_key());
            let elements: BTreeSet<String> = list_conflict_elements(&conn, &r.conflict.id)
                .unwrap()
                .into_iter()
                .collect();
            assert_eq!(elements, r.divergence.change_ids());
        }
    }
}
