//! Conflict detection and recording.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection** -- comparing two branches' pointer tables to find
//!    entities they disagree on.
//! 2. **Clustering** -- recording disagreeing changes under a stable key,
//!    folding repeated detection passes into the same conflict.
//!
//! Resolution is left to the caller.

pub mod detector;
pub mod engine;

pub use detector::{
    detect_divergence, record_divergences, Divergence, DivergenceKind, RecordedDivergence,
};
pub use engine::{
    create_change_conflict, get_conflict, get_conflict_by_key, list_conflict_elements,
    list_conflicts, list_conflicts_for_change,
};
