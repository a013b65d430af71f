//! Filesystem scanner: walks roots and reconciles what it finds against
//! the store.
//!
//! The scanner never reads file contents; it works purely from directory
//! entries and (path, size, mtime) so a delta run over an unchanged tree is
//! metadata-only. Feature extraction happens later, and only for rows the
//! reconciliation flagged.

use std::path::Path;
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

use crate::config::Settings;
use crate::db::Database;
use crate::error::{Error, Result};

/// Filesystem mtime granularity varies (FAT is 2 s, some network mounts
/// round); differences below this are not treated as modifications.
const MTIME_TOLERANCE_SECS: f64 = 1.0;

/// Directory names that never hold user photos and are pruned outright.
const SYSTEM_CACHE_DIRS: &[&str] = &[
    ".thumbnails",
    "thumbnails",
    ".cache",
    "cache",
    ".git",
    ".svn",
    ".hg",
    "system volume information",
    "$recycle.bin",
    ".trash",
    ".trashes",
    "lost+found",
    "node_modules",
];

#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub files_seen: usize,
    pub files_new: usize,
    pub files_changed: usize,
    pub files_unchanged: usize,
    pub files_filtered: usize,
    pub missing_file_ids: Vec<i64>,
    pub errors: Vec<String>,
}

pub struct Scanner {
    include: Vec<glob::Pattern>,
    exclude: Vec<glob::Pattern>,
}

impl Scanner {
    pub fn new(settings: &Settings) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<glob::Pattern>> {
            patterns
                .iter()
                .map(|p| {
                    glob::Pattern::new(&p.to_lowercase())
                        .map_err(|e| Error::Configuration(format!("bad pattern {p:?}: {e}")))
                })
                .collect()
        };
        Ok(Self {
            include: compile(&settings.include_patterns)?,
            exclude: compile(&settings.exclude_patterns)?,
        })
    }

    /// Excludes override includes.
    fn is_included(&self, file_name: &str) -> bool {
        let name = file_name.to_lowercase();
        if !self.include.iter().any(|p| p.matches(&name)) {
            return false;
        }
        !self.exclude.iter().any(|p| p.matches(&name))
    }

    fn is_cache_dir(name: &str) -> bool {
        SYSTEM_CACHE_DIRS.contains(&name.to_lowercase().as_str())
    }

    /// Walk one root and reconcile every included file with the store:
    /// unknown paths are inserted, stat changes invalidate features,
    /// untouched rows get their last-seen refreshed, and rows not seen by
    /// this scan are flipped to missing.
    pub fn scan_root(&self, db: &mut Database, root: &Path) -> Result<ScanOutcome> {
        let root_str = root.to_string_lossy().to_string();
        let scan_start = crate::db::now_epoch();
        let known = db.known_files_under(&root_str)?;

        let mut outcome = ScanOutcome::default();

        let walker = WalkDir::new(root).follow_links(false).into_iter();
        let walker = walker.filter_entry(|entry| {
            !(entry.file_type().is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(Self::is_cache_dir))
        });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    // Permission denied, vanished entry: skip and move on.
                    let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                    tracing::warn!(%path, error = %e, "scan entry skipped");
                    outcome.errors.push(format!("{path}: {e}"));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            if !self.is_included(&file_name) {
                outcome.files_filtered += 1;
                continue;
            }
            outcome.files_seen += 1;

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "stat failed");
                    outcome.errors.push(format!("{}: {e}", entry.path().display()));
                    continue;
                }
            };
            let size = metadata.len();
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);

            let path_str = entry.path().to_string_lossy().to_string();
            match known.get(&path_str) {
                None => {
                    db.insert_file(&path_str, size, mtime)?;
                    outcome.files_new += 1;
                }
                Some(&(id, known_size, known_mtime)) => {
                    if known_size == size && (known_mtime - mtime).abs() < MTIME_TOLERANCE_SECS {
                        db.touch_last_seen(id)?;
                        outcome.files_unchanged += 1;
                    } else {
                        db.update_file_stat(id, size, mtime)?;
                        outcome.files_changed += 1;
                    }
                }
            }
        }

        outcome.missing_file_ids = db.mark_missing_under(&root_str, scan_start)?;

        tracing::info!(
            root = %root.display(),
            new = outcome.files_new,
            changed = outcome.files_changed,
            unchanged = outcome.files_unchanged,
            missing = outcome.missing_file_ids.len(),
            "scan complete"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FileStatus;
    use std::fs;

    fn scanner() -> Scanner {
        Scanner::new(&Settings::default()).unwrap()
    }

    #[test]
    fn include_and_exclude_patterns() {
        let mut settings = Settings::default();
        settings.exclude_patterns = vec!["*_backup*".to_string()];
        let scanner = Scanner::new(&settings).unwrap();

        assert!(scanner.is_included("photo.jpg"));
        assert!(scanner.is_included("PHOTO.JPG"));
        assert!(scanner.is_included("raw.cr2"));
        assert!(!scanner.is_included("notes.txt"));
        // Excludes win over includes.
        assert!(!scanner.is_included("photo_backup.jpg"));
    }

    #[test]
    fn first_scan_inserts_everything_included() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.jpg"), b"aaaa").unwrap();
        fs::write(dir.path().join("b.png"), b"bbbb").unwrap();
        fs::write(dir.path().join("notes.txt"), b"nope").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/c.jpeg"), b"cccc").unwrap();

        let mut db = Database::open_in_memory().unwrap();
        let outcome = scanner().scan_root(&mut db, dir.path()).unwrap();

        assert_eq!(outcome.files_new, 3);
        assert_eq!(outcome.files_seen, 3);
        assert_eq!(outcome.files_filtered, 1);
        assert_eq!(db.count_active_files().unwrap(), 3);
    }

    #[test]
    fn cache_directories_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".thumbnails")).unwrap();
        fs::write(dir.path().join(".thumbnails/thumb.jpg"), b"t").unwrap();
        fs::write(dir.path().join("real.jpg"), b"r").unwrap();

        let mut db = Database::open_in_memory().unwrap();
        let outcome = scanner().scan_root(&mut db, dir.path()).unwrap();
        assert_eq!(outcome.files_new, 1);
    }

    #[test]
    fn rescan_detects_unchanged_changed_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let keep = dir.path().join("keep.jpg");
        let grow = dir.path().join("grow.jpg");
        let gone = dir.path().join("gone.jpg");
        fs::write(&keep, b"kk").unwrap();
        fs::write(&grow, b"gg").unwrap();
        fs::write(&gone, b"xx").unwrap();

        let mut db = Database::open_in_memory().unwrap();
        let scanner = scanner();
        scanner.scan_root(&mut db, dir.path()).unwrap();

        // Simulate a completed feature pass so invalidation is observable.
        let grow_id = db
            .file_by_path(&grow.to_string_lossy())
            .unwrap()
            .unwrap()
            .id;
        db.clear_needs_features(grow_id).unwrap();

        fs::write(&grow, b"gg-grown").unwrap(); // size change
        fs::remove_file(&gone).unwrap();

        let outcome = scanner.scan_root(&mut db, dir.path()).unwrap();
        assert_eq!(outcome.files_unchanged, 1);
        assert_eq!(outcome.files_changed, 1);
        assert_eq!(outcome.files_new, 0);
        assert_eq!(outcome.missing_file_ids.len(), 1);

        let grow_row = db.file_by_id(grow_id).unwrap().unwrap();
        assert!(grow_row.needs_features);

        let gone_row = db.file_by_path(&gone.to_string_lossy()).unwrap().unwrap();
        assert_eq!(gone_row.status, FileStatus::Missing);
    }
}
