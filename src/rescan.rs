//! Rescan coordination: delta, missing-features and full-rebuild runs.
//!
//! The coordinator owns pipeline ordering. Scanning and feature extraction
//! fan out through the worker pool (each task opens its own connection
//! against the WAL store); grouping starts only after the feature phase
//! has fully committed.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::config::Settings;
use crate::db::{Database, GroupTier, MemberRole, MemberRow, OverrideSnapshot};
use crate::error::{Error, Result};
use crate::escalation::EscalationEngine;
use crate::features::FeatureExtractor;
use crate::grouping::{self, GroupingEngine};
use crate::index::SearchIndex;
use crate::pool::{TaskPriority, WorkerPool};
use crate::scanner::Scanner;

/// Progress updates are delivered at most once per this interval; the
/// final update of a phase is always delivered.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

const STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescanMode {
    Delta,
    MissingFeatures,
    FullRebuild,
}

#[derive(Debug, Clone, Copy)]
pub struct RescanOptions {
    pub mode: RescanMode,
    /// Full rebuild only: snapshot active overrides and remap them by path
    /// once the rebuild has regrouped.
    pub preserve_overrides: bool,
    /// Full rebuild only: re-seed the rebuilt store with the previous
    /// groups as hints, remapped by path.
    pub preserve_groups: bool,
}

impl Default for RescanOptions {
    fn default() -> Self {
        Self {
            mode: RescanMode::Delta,
            preserve_overrides: true,
            preserve_groups: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub phase: &'static str,
    pub files_scanned: usize,
    pub features_computed: usize,
    pub features_reused: usize,
    pub thumbnails_reused: usize,
    pub groups_created: usize,
}

pub type ProgressCallback<'a> = &'a mut dyn FnMut(&ProgressUpdate);

#[derive(Debug, Clone)]
pub struct RescanStats {
    pub mode: RescanMode,
    pub files_scanned: usize,
    pub files_new: usize,
    pub files_changed: usize,
    pub files_unchanged: usize,
    pub files_missing: usize,
    pub features_computed: usize,
    pub features_reused: usize,
    /// Reuse reported by the external thumbnail producer, when present.
    pub thumbnails_reused: usize,
    pub unprocessable: usize,
    pub exact_groups: usize,
    pub near_groups: usize,
    pub groups_created: usize,
    pub groups_updated: usize,
    pub groups_deleted: usize,
    pub escalated: usize,
    pub overrides_preserved: usize,
    /// (group_id, vanished file id) events for deactivated overrides.
    pub missing_override_targets: Vec<(i64, i64)>,
    pub conflicts: usize,
    pub errors: Vec<String>,
}

impl RescanStats {
    fn new(mode: RescanMode) -> Self {
        Self {
            mode,
            files_scanned: 0,
            files_new: 0,
            files_changed: 0,
            files_unchanged: 0,
            files_missing: 0,
            features_computed: 0,
            features_reused: 0,
            thumbnails_reused: 0,
            unprocessable: 0,
            exact_groups: 0,
            near_groups: 0,
            groups_created: 0,
            groups_updated: 0,
            groups_deleted: 0,
            escalated: 0,
            overrides_preserved: 0,
            missing_override_targets: Vec::new(),
            conflicts: 0,
            errors: Vec::new(),
        }
    }

    /// reused / (reused + recomputed); 1.0 when nothing had to be done.
    pub fn efficiency_ratio(&self) -> f64 {
        let total = self.features_reused + self.features_computed;
        if total == 0 {
            1.0
        } else {
            self.features_reused as f64 / total as f64
        }
    }
}

/// Which mode a store's current state calls for.
pub fn recommend_mode(db: &Database) -> Result<RescanMode> {
    if db.schema_version()? != Database::expected_schema_version() {
        return Ok(RescanMode::FullRebuild);
    }
    let (active, with_features) = db.feature_coverage()?;
    if active == 0 {
        return Ok(RescanMode::Delta);
    }
    let coverage = with_features as f64 / active as f64;
    Ok(if coverage >= 0.95 {
        RescanMode::Delta
    } else if coverage >= 0.50 {
        RescanMode::MissingFeatures
    } else {
        RescanMode::FullRebuild
    })
}

struct ProgressReporter<'a> {
    callback: Option<ProgressCallback<'a>>,
    last_emit: Option<Instant>,
}

impl<'a> ProgressReporter<'a> {
    fn new(callback: Option<ProgressCallback<'a>>) -> Self {
        Self {
            callback,
            last_emit: None,
        }
    }

    fn emit(&mut self, update: &ProgressUpdate) {
        let due = self
            .last_emit
            .map(|at| at.elapsed() >= PROGRESS_INTERVAL)
            .unwrap_or(true);
        if due {
            if let Some(callback) = self.callback.as_mut() {
                callback(update);
            }
            self.last_emit = Some(Instant::now());
        }
    }

    fn emit_final(&mut self, update: &ProgressUpdate) {
        if let Some(callback) = self.callback.as_mut() {
            callback(update);
        }
        self.last_emit = Some(Instant::now());
    }
}

/// Path-keyed snapshot of a group, used to re-seed hints across a full
/// rebuild.
struct GroupSnapshot {
    tier: GroupTier,
    confidence: f64,
    members: Vec<(String, MemberRole, Option<f64>, Option<String>)>,
}

pub struct RescanCoordinator {
    settings: Settings,
}

impl RescanCoordinator {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub fn run(
        &self,
        db: &mut Database,
        options: RescanOptions,
        roots: &[PathBuf],
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<RescanStats> {
        self.settings.validate()?;
        let db_path = db
            .path()
            .ok_or_else(|| {
                Error::Configuration("the pipeline requires a file-backed store".into())
            })?
            .to_path_buf();

        let mut stats = RescanStats::new(options.mode);
        let mut reporter = ProgressReporter::new(progress);

        let pool = WorkerPool::new(&self.settings);
        pool.start();

        // Full rebuild: snapshot user state, then wipe everything derived.
        let mut override_snapshots: Vec<OverrideSnapshot> = Vec::new();
        let mut group_snapshots: Vec<GroupSnapshot> = Vec::new();
        if options.mode == RescanMode::FullRebuild {
            if options.preserve_overrides {
                override_snapshots = db.snapshot_overrides()?;
            }
            if options.preserve_groups {
                group_snapshots = snapshot_groups(db)?;
            }
            db.truncate_files()?;
            tracing::info!(
                overrides = override_snapshots.len(),
                group_hints = group_snapshots.len(),
                "store truncated for full rebuild"
            );
        }

        // Phase 1: scan (skipped when only features are missing).
        if options.mode != RescanMode::MissingFeatures {
            self.scan_phase(&pool, &db_path, roots, &mut stats, &mut reporter)?;
        }

        // Phase 2: features. The barrier matters: grouping reads committed
        // feature rows only.
        let pending = match options.mode {
            RescanMode::MissingFeatures => db.files_without_features()?,
            _ => db.files_needing_features()?,
        };
        let (_, with_features) = db.feature_coverage()?;
        stats.features_reused = with_features.max(0) as usize;
        self.feature_phase(&pool, &db_path, pending, &mut stats, &mut reporter)?;
        pool.wait_idle();

        // Phase 3: index.
        let index = SearchIndex::build_from_store(db)?;

        // Re-seed group hints before grouping so stable matching can adopt
        // them.
        if !group_snapshots.is_empty() {
            restore_group_hints(db, group_snapshots)?;
        }

        // Overrides whose target vanished are reported before grouping
        // prunes the groups that contained them.
        stats
            .missing_override_targets
            .extend(db.reap_orphan_overrides()?);

        // Phase 4: grouping.
        let grouping_outcome = GroupingEngine::new(self.settings.clone()).run(db, &index)?;
        stats.exact_groups = grouping_outcome.exact_groups;
        stats.near_groups = grouping_outcome.near_groups;
        stats.groups_created = grouping_outcome.groups_created;
        stats.groups_updated = grouping_outcome.groups_updated;
        stats.groups_deleted = grouping_outcome.groups_deleted;
        stats
            .missing_override_targets
            .extend(grouping_outcome.missing_override_targets);
        reporter.emit(&phase_update("grouping", &stats));

        // Restore snapshotted overrides by path, now that groups exist.
        if !override_snapshots.is_empty() {
            stats.overrides_preserved = restore_overrides(db, override_snapshots)?;
        }

        // Phase 5: escalation.
        let escalation = EscalationEngine::new(self.settings.clone()).run(db)?;
        stats.escalated = escalation.escalated;

        stats.conflicts = grouping::detect_conflicts(db)?.len();

        pool.stop(STOP_TIMEOUT);
        reporter.emit_final(&phase_update("done", &stats));
        Ok(stats)
    }

    fn scan_phase(
        &self,
        pool: &WorkerPool,
        db_path: &Path,
        roots: &[PathBuf],
        stats: &mut RescanStats,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel::<Result<crate::scanner::ScanOutcome>>();
        for (i, root) in roots.iter().enumerate() {
            let tx = tx.clone();
            let db_path = db_path.to_path_buf();
            let settings = self.settings.clone();
            let root = root.clone();
            pool.submit(
                format!("scan-root-{i}"),
                TaskPriority::Normal,
                "scan",
                Box::new(move || {
                    let result = (|| {
                        let mut db = Database::open(&db_path)?;
                        let scanner = Scanner::new(&settings)?;
                        scanner.scan_root(&mut db, &root)
                    })();
                    let failed = result.is_err();
                    let _ = tx.send(result);
                    if failed {
                        Err(Error::Pool("scan task failed".into()))
                    } else {
                        Ok(())
                    }
                }),
            )?;
        }
        drop(tx);

        for result in rx {
            let outcome = result?;
            stats.files_scanned += outcome.files_seen;
            stats.files_new += outcome.files_new;
            stats.files_changed += outcome.files_changed;
            stats.files_unchanged += outcome.files_unchanged;
            stats.files_missing += outcome.missing_file_ids.len();
            stats.errors.extend(outcome.errors);
            reporter.emit(&phase_update("scanning", stats));
        }
        Ok(())
    }

    fn feature_phase(
        &self,
        pool: &WorkerPool,
        db_path: &Path,
        pending: Vec<crate::db::FileRow>,
        stats: &mut RescanStats,
        reporter: &mut ProgressReporter<'_>,
    ) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let batch_size = self.settings.batch_hashing.max(1);
        let (tx, rx) = mpsc::channel::<Result<crate::features::ExtractionOutcome>>();
        for (i, batch) in pending.chunks(batch_size).enumerate() {
            let tx = tx.clone();
            let db_path = db_path.to_path_buf();
            let settings = self.settings.clone();
            let batch: Vec<crate::db::FileRow> = batch.to_vec();
            pool.submit(
                format!("features-batch-{i}"),
                TaskPriority::Normal,
                "hash",
                Box::new(move || {
                    let result = (|| {
                        let mut db = Database::open(&db_path)?;
                        let extractor = FeatureExtractor::new(settings);
                        extractor.process_batch(&mut db, &batch)
                    })();
                    let failed = result.is_err();
                    let _ = tx.send(result);
                    if failed {
                        Err(Error::Pool("feature task failed".into()))
                    } else {
                        Ok(())
                    }
                }),
            )?;
        }
        drop(tx);

        for result in rx {
            let outcome = result?;
            stats.features_computed += outcome.processed;
            stats.unprocessable += outcome.unprocessable;
            stats.errors.extend(outcome.errors);
            reporter.emit(&phase_update("features", stats));
        }
        Ok(())
    }
}

fn phase_update(phase: &'static str, stats: &RescanStats) -> ProgressUpdate {
    ProgressUpdate {
        phase,
        files_scanned: stats.files_scanned,
        features_computed: stats.features_computed,
        features_reused: stats.features_reused,
        thumbnails_reused: stats.thumbnails_reused,
        groups_created: stats.groups_created,
    }
}

fn snapshot_groups(db: &Database) -> Result<Vec<GroupSnapshot>> {
    let mut snapshots = Vec::new();
    for (group, members) in db.load_groups_with_members()? {
        let mut member_paths = Vec::new();
        for member in members {
            if let Some(file) = db.file_by_id(member.file_id)? {
                member_paths.push((
                    file.path,
                    member.role,
                    member.similarity_score,
                    member.notes,
                ));
            }
        }
        if member_paths.len() >= 2 {
            snapshots.push(GroupSnapshot {
                tier: group.tier,
                confidence: group.confidence,
                members: member_paths,
            });
        }
    }
    Ok(snapshots)
}

/// Re-insert snapshotted groups whose member paths still resolve to live
/// rows. Hints only: the next grouping pass revalidates them and adopts
/// the ids for matching member sets.
fn restore_group_hints(db: &mut Database, snapshots: Vec<GroupSnapshot>) -> Result<usize> {
    let mut restored = 0;
    for snapshot in snapshots {
        let mut rows = Vec::new();
        let mut has_original = false;
        for (path, role, score, notes) in snapshot.members {
            let Some(file) = db.file_by_path(&path)? else {
                continue;
            };
            if file.status != crate::db::FileStatus::Active {
                continue;
            }
            if role == MemberRole::Original {
                has_original = true;
            }
            rows.push(MemberRow {
                group_id: 0,
                file_id: file.id,
                role,
                similarity_score: score,
                notes,
            });
        }
        if rows.len() < 2 || !has_original {
            continue;
        }
        db.insert_group(snapshot.tier, snapshot.confidence, &rows)?;
        restored += 1;
    }
    tracing::info!(restored, "group hints re-seeded");
    Ok(restored)
}

/// Remap snapshotted overrides by chosen path onto the rebuilt groups.
/// Snapshots whose path no longer maps to a live, grouped file are
/// dropped.
fn restore_overrides(db: &mut Database, snapshots: Vec<OverrideSnapshot>) -> Result<usize> {
    let mut restored = 0;
    for snapshot in snapshots {
        let Some(file) = db.file_by_path(&snapshot.chosen_path)? else {
            continue;
        };
        if file.status != crate::db::FileStatus::Active {
            continue;
        }
        let group_id: Option<i64> = {
            let result = db.conn().query_row(
                "SELECT group_id FROM group_members WHERE file_id = ?1",
                rusqlite::params![file.id],
                |row| row.get(0),
            );
            match result {
                Ok(id) => Some(id),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            }
        };
        let Some(group_id) = group_id else {
            continue;
        };
        db.put_override(
            group_id,
            file.id,
            snapshot.override_type,
            snapshot.reason,
            snapshot.notes.as_deref(),
        )?;
        restored += 1;
    }
    tracing::info!(restored, "overrides restored after rebuild");
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FeatureRow;

    #[test]
    fn recommendation_follows_coverage() {
        let db = Database::open_in_memory().unwrap();
        // Empty store: delta.
        assert_eq!(recommend_mode(&db).unwrap(), RescanMode::Delta);

        for i in 0..20 {
            let id = db.insert_file(&format!("/p/{i}.jpg"), 10, 1.0).unwrap();
            if i < 19 {
                db.upsert_feature(&FeatureRow {
                    file_id: id,
                    phash: Some(i),
                    dhash: None,
                    ahash: None,
                    width: None,
                    height: None,
                    exif_dt: None,
                    camera_make: None,
                    camera_model: None,
                    orientation: 1,
                })
                .unwrap();
            }
        }
        // 19/20 = 95% coverage: delta.
        assert_eq!(recommend_mode(&db).unwrap(), RescanMode::Delta);

        db.conn()
            .execute("DELETE FROM features WHERE file_id % 2 = 0", [])
            .unwrap();
        // Around half: missing-features.
        assert_eq!(recommend_mode(&db).unwrap(), RescanMode::MissingFeatures);

        db.conn().execute("DELETE FROM features", []).unwrap();
        assert_eq!(recommend_mode(&db).unwrap(), RescanMode::FullRebuild);
    }

    #[test]
    fn efficiency_ratio_counts_reuse() {
        let mut stats = RescanStats::new(RescanMode::Delta);
        assert_eq!(stats.efficiency_ratio(), 1.0);

        stats.features_reused = 3;
        stats.features_computed = 1;
        assert!((stats.efficiency_ratio() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn progress_reporter_rate_limits() {
        let mut updates = 0usize;
        let mut callback = |_: &ProgressUpdate| updates += 1;
        let mut reporter = ProgressReporter::new(Some(&mut callback));

        let update = ProgressUpdate {
            phase: "test",
            files_scanned: 0,
            features_computed: 0,
            features_reused: 0,
            thumbnails_reused: 0,
            groups_created: 0,
        };
        for _ in 0..50 {
            reporter.emit(&update);
        }
        reporter.emit_final(&update);
        drop(reporter);

        // One leading edge plus the forced final, not fifty.
        assert!(updates <= 3, "got {updates} updates");
    }

    #[test]
    fn in_memory_store_is_rejected() {
        let mut db = Database::open_in_memory().unwrap();
        let coordinator = RescanCoordinator::new(Settings::default());
        let err = coordinator
            .run(&mut db, RescanOptions::default(), &[], None)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
