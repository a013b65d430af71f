//! photodup: a local photo deduplication engine.
//!
//! The engine discovers image files under caller-supplied roots, computes
//! identity and similarity fingerprints, groups files into exact and near
//! duplicate classes with a deterministic original per group, escalates
//! high-confidence duplicates to a safe-to-delete tier, and persists all
//! state in an embedded SQLite store so later runs only do delta work.
//!
//! The crate is UI-free: hosts consume plain calls, iterators and
//! callbacks. It never moves, renames or deletes user files; it only
//! records roles.
//!
//! ```no_run
//! use photodup::{GroupFilter, RescanOptions, Settings};
//!
//! # fn main() -> photodup::Result<()> {
//! let mut store = photodup::open_store(std::path::Path::new("photodup.db"))?;
//! let settings = Settings::default();
//! let stats = photodup::run_pipeline(
//!     &mut store,
//!     &settings,
//!     RescanOptions::default(),
//!     &["/photos".into()],
//!     None,
//! )?;
//! println!("{} groups", stats.groups_created + stats.groups_updated);
//! for group in photodup::list_groups(&store, GroupFilter::SafeOnly)? {
//!     println!("group {}: original {}", group.id, group.original_path);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod escalation;
pub mod features;
pub mod grouping;
pub mod index;
pub mod logging;
pub mod pool;
pub mod rescan;
pub mod scanner;

use std::path::{Path, PathBuf};

pub use config::{Preset, Settings};
pub use db::{
    Database, FeatureRow, FileRow, FileStatus, GroupFilter, GroupSummary, GroupTier,
    ManualOverride, MemberRole, OverrideReason, OverrideType,
};
pub use error::{Error, Result};
pub use grouping::ConflictInfo;
pub use index::{BkTree, HashKind, SearchIndex};
pub use pool::{PoolState, PoolStats, TaskPriority, WorkerPool};
pub use rescan::{
    recommend_mode, ProgressCallback, ProgressUpdate, RescanMode, RescanOptions, RescanStats,
};

/// Open (creating if needed) the store at `path` and apply any pending
/// schema migrations.
pub fn open_store(path: &Path) -> Result<Database> {
    Database::open(path)
}

/// Run one full pipeline pass: scan, extract features, index, group,
/// escalate. Per-file problems are aggregated into the returned stats;
/// only configuration and store failures error out.
pub fn run_pipeline(
    db: &mut Database,
    settings: &Settings,
    options: RescanOptions,
    roots: &[PathBuf],
    progress: Option<ProgressCallback<'_>>,
) -> Result<RescanStats> {
    rescan::RescanCoordinator::new(settings.clone()).run(db, options, roots, progress)
}

/// Group summaries under a filter. `WithConflicts` narrows to groups whose
/// active override disagrees with what auto-selection would pick today.
pub fn list_groups(db: &Database, filter: GroupFilter) -> Result<Vec<GroupSummary>> {
    match filter {
        GroupFilter::WithConflicts => {
            let ids: Vec<i64> = grouping::detect_conflicts(db)?
                .into_iter()
                .map(|c| c.group_id)
                .collect();
            db.group_summaries_by_ids(&ids)
        }
        other => db.group_summaries(other),
    }
}

/// Pin `file_id` as the original of `group_id`. The choice is applied
/// immediately and consulted by every subsequent grouping run.
pub fn apply_override(
    db: &mut Database,
    group_id: i64,
    file_id: i64,
    override_type: OverrideType,
    reason: OverrideReason,
    note: Option<&str>,
) -> Result<i64> {
    db.put_override(group_id, file_id, override_type, reason, note)
}

/// Drop the group's active override and restore the automatic original.
/// Returns false when no override was active.
pub fn remove_override(db: &mut Database, group_id: i64) -> Result<bool> {
    db.clear_override(group_id)
}

/// Enumerate groups where the active override's choice differs from what
/// automatic selection would pick right now.
pub fn detect_conflicts(db: &Database) -> Result<Vec<ConflictInfo>> {
    grouping::detect_conflicts(db)
}
