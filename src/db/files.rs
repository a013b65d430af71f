//! File-row operations: insertion, reconciliation lookups, lifecycle flags.

use rusqlite::params;
use std::collections::HashMap;

use super::{now_epoch, Database};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Active,
    Missing,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Active => "active",
            FileStatus::Missing => "missing",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "missing" => FileStatus::Missing,
            _ => FileStatus::Active,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileRow {
    pub id: i64,
    pub path: String,
    pub size: u64,
    pub mtime: f64,
    pub fast_hash: Option<u64>,
    pub sha256: Option<String>,
    pub discovered_at: f64,
    pub last_seen_at: f64,
    pub status: FileStatus,
    pub unprocessable: bool,
    pub needs_features: bool,
}

fn map_file_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRow> {
    Ok(FileRow {
        id: row.get(0)?,
        path: row.get(1)?,
        size: row.get::<_, i64>(2)? as u64,
        mtime: row.get(3)?,
        fast_hash: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
        sha256: row.get(5)?,
        discovered_at: row.get(6)?,
        last_seen_at: row.get(7)?,
        status: FileStatus::parse(&row.get::<_, String>(8)?),
        unprocessable: row.get::<_, i64>(9)? != 0,
        needs_features: row.get::<_, i64>(10)? != 0,
    })
}

const FILE_COLUMNS: &str = "id, path, size, mtime, fast_hash, sha256, \
     discovered_at, last_seen_at, status, unprocessable, needs_features";

impl Database {
    pub fn insert_file(&self, path: &str, size: u64, mtime: f64) -> Result<i64> {
        let now = now_epoch();
        self.conn.execute(
            "INSERT INTO files (path, size, mtime, discovered_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![path, size as i64, mtime, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn file_by_path(&self, path: &str) -> Result<Option<FileRow>> {
        let result = self.conn.query_row(
            &format!("SELECT {FILE_COLUMNS} FROM files WHERE path = ?1"),
            params![path],
            map_file_row,
        );
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn file_by_id(&self, id: i64) -> Result<Option<FileRow>> {
        let result = self.conn.query_row(
            &format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"),
            params![id],
            map_file_row,
        );
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// (path → (id, size, mtime)) for every non-missing row under a root.
    /// The scanner prefetches this once per root instead of issuing one
    /// lookup per directory entry.
    pub fn known_files_under(&self, root: &str) -> Result<HashMap<String, (i64, u64, f64)>> {
        let prefix = format!("{}%", root.trim_end_matches('/'));
        let mut stmt = self.conn.prepare(
            "SELECT path, id, size, mtime FROM files WHERE path LIKE ?1",
        )?;
        let rows = stmt
            .query_map(params![prefix], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    (
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)? as u64,
                        row.get::<_, f64>(3)?,
                    ),
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().collect())
    }

    /// A size or mtime change invalidates the derived feature row: the old
    /// fingerprints describe bytes that no longer exist.
    pub fn update_file_stat(&mut self, id: i64, size: u64, mtime: f64) -> Result<()> {
        let now = now_epoch();
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE files SET size = ?1, mtime = ?2, fast_hash = NULL, sha256 = NULL,
                 last_seen_at = ?3, status = 'active', unprocessable = 0, needs_features = 1
             WHERE id = ?4",
            params![size as i64, mtime, now, id],
        )?;
        tx.execute("DELETE FROM features WHERE file_id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    pub fn touch_last_seen(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE files SET last_seen_at = ?1, status = 'active' WHERE id = ?2",
            params![now_epoch(), id],
        )?;
        Ok(())
    }

    /// Soft-delete rows under a root that were not seen by the scan that
    /// started at `scan_start`. Returns the ids flipped to missing.
    pub fn mark_missing_under(&self, root: &str, scan_start: f64) -> Result<Vec<i64>> {
        let prefix = format!("{}%", root.trim_end_matches('/'));
        let mut stmt = self.conn.prepare(
            "SELECT id FROM files
             WHERE path LIKE ?1 AND last_seen_at < ?2 AND status = 'active'",
        )?;
        let ids = stmt
            .query_map(params![prefix, scan_start], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        self.conn.execute(
            "UPDATE files SET status = 'missing'
             WHERE path LIKE ?1 AND last_seen_at < ?2 AND status = 'active'",
            params![prefix, scan_start],
        )?;
        Ok(ids)
    }

    pub fn mark_unprocessable(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE files SET unprocessable = 1, needs_features = 0 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn set_fast_hash(&self, id: i64, fast_hash: u64) -> Result<()> {
        self.conn.execute(
            "UPDATE files SET fast_hash = ?1 WHERE id = ?2",
            params![fast_hash as i64, id],
        )?;
        Ok(())
    }

    pub fn set_strong_hash(&self, id: i64, sha256: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE files SET sha256 = ?1 WHERE id = ?2",
            params![sha256, id],
        )?;
        Ok(())
    }

    /// Active files still waiting on feature extraction.
    pub fn files_needing_features(&self) -> Result<Vec<FileRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE status = 'active' AND needs_features = 1 AND unprocessable = 0
             ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([], map_file_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Active files with no feature row at all, regardless of the
    /// needs_features flag. The missing-features rescan mode starts here
    /// after a partial crash.
    pub fn files_without_features(&self) -> Result<Vec<FileRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE status = 'active' AND unprocessable = 0
               AND id NOT IN (SELECT file_id FROM features)
             ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([], map_file_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_active_files(&self) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM files WHERE status = 'active'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Wipe file rows (features, members, overrides cascade with them).
    /// Only the full-rebuild path calls this.
    pub fn truncate_files(&self) -> Result<()> {
        self.conn.execute("DELETE FROM files", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup_by_path() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_file("/photos/a.jpg", 1_048_576, 1700000000.5).unwrap();

        let row = db.file_by_path("/photos/a.jpg").unwrap().unwrap();
        assert_eq!(row.id, id);
        assert_eq!(row.size, 1_048_576);
        assert_eq!(row.status, FileStatus::Active);
        assert!(row.needs_features);
        assert!(row.fast_hash.is_none());

        assert!(db.file_by_path("/photos/missing.jpg").unwrap().is_none());
    }

    #[test]
    fn stat_change_invalidates_features() {
        let mut db = Database::open_in_memory().unwrap();
        let id = db.insert_file("/photos/a.jpg", 100, 1.0).unwrap();
        db.set_fast_hash(id, 0xDEAD_BEEF).unwrap();
        db.upsert_feature(&FeatureRowFixture::basic(id)).unwrap();
        db.clear_needs_features(id).unwrap();

        db.update_file_stat(id, 200, 2.0).unwrap();

        let row = db.file_by_id(id).unwrap().unwrap();
        assert!(row.needs_features);
        assert!(row.fast_hash.is_none());
        assert!(db.feature_for(id).unwrap().is_none());
    }

    #[test]
    fn mark_missing_under_scan_start() {
        let db = Database::open_in_memory().unwrap();
        let kept = db.insert_file("/photos/kept.jpg", 1, 1.0).unwrap();
        let gone = db.insert_file("/photos/gone.jpg", 1, 1.0).unwrap();

        let scan_start = now_epoch() + 1.0;
        db.conn
            .execute(
                "UPDATE files SET last_seen_at = ?1 WHERE id = ?2",
                params![scan_start + 1.0, kept],
            )
            .unwrap();

        let missing = db.mark_missing_under("/photos", scan_start).unwrap();
        assert_eq!(missing, vec![gone]);
        assert_eq!(
            db.file_by_id(gone).unwrap().unwrap().status,
            FileStatus::Missing
        );
        assert_eq!(
            db.file_by_id(kept).unwrap().unwrap().status,
            FileStatus::Active
        );
    }

    #[test]
    fn hash_round_trips_high_bit() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_file("/photos/a.jpg", 1, 1.0).unwrap();
        db.set_fast_hash(id, u64::MAX - 3).unwrap();
        let row = db.file_by_id(id).unwrap().unwrap();
        assert_eq!(row.fast_hash, Some(u64::MAX - 3));
    }

    pub(crate) struct FeatureRowFixture;

    impl FeatureRowFixture {
        pub(crate) fn basic(file_id: i64) -> crate::db::FeatureRow {
            crate::db::FeatureRow {
                file_id,
                phash: Some(0),
                dhash: Some(0),
                ahash: Some(0),
                width: Some(640),
                height: Some(480),
                exif_dt: None,
                camera_make: None,
                camera_model: None,
                orientation: 1,
            }
        }
    }
}
