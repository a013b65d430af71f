//! Feature-row operations.
//!
//! A feature row exists iff its file has been successfully processed and the
//! file's size/mtime have not changed since; invalidation happens in
//! `Database::update_file_stat`.

use rusqlite::params;

use super::{now_epoch, Database};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub file_id: i64,
    pub phash: Option<u64>,
    pub dhash: Option<u64>,
    pub ahash: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub exif_dt: Option<f64>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub orientation: u16,
}

fn map_feature_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FeatureRow> {
    Ok(FeatureRow {
        file_id: row.get(0)?,
        phash: row.get::<_, Option<i64>>(1)?.map(|v| v as u64),
        dhash: row.get::<_, Option<i64>>(2)?.map(|v| v as u64),
        ahash: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
        width: row.get(4)?,
        height: row.get(5)?,
        exif_dt: row.get(6)?,
        camera_make: row.get(7)?,
        camera_model: row.get(8)?,
        orientation: row.get::<_, i64>(9)? as u16,
    })
}

impl Database {
    pub fn upsert_feature(&self, feature: &FeatureRow) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO features
                 (file_id, phash, dhash, ahash, width, height, exif_dt,
                  camera_make, camera_model, orientation, generated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                feature.file_id,
                feature.phash.map(|v| v as i64),
                feature.dhash.map(|v| v as i64),
                feature.ahash.map(|v| v as i64),
                feature.width,
                feature.height,
                feature.exif_dt,
                feature.camera_make,
                feature.camera_model,
                feature.orientation as i64,
                now_epoch(),
            ],
        )?;
        Ok(())
    }

    /// Persist the outcome of one file's feature extraction atomically:
    /// feature row, fast hash, and the needs_features flip land together.
    pub fn commit_extraction(&mut self, feature: &FeatureRow, fast_hash: u64) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO features
                 (file_id, phash, dhash, ahash, width, height, exif_dt,
                  camera_make, camera_model, orientation, generated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                feature.file_id,
                feature.phash.map(|v| v as i64),
                feature.dhash.map(|v| v as i64),
                feature.ahash.map(|v| v as i64),
                feature.width,
                feature.height,
                feature.exif_dt,
                feature.camera_make,
                feature.camera_model,
                feature.orientation as i64,
                now_epoch(),
            ],
        )?;
        tx.execute(
            "UPDATE files SET fast_hash = ?1, needs_features = 0, unprocessable = 0
             WHERE id = ?2",
            params![fast_hash as i64, feature.file_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn feature_for(&self, file_id: i64) -> Result<Option<FeatureRow>> {
        let result = self.conn.query_row(
            "SELECT file_id, phash, dhash, ahash, width, height, exif_dt,
                    camera_make, camera_model, orientation
             FROM features WHERE file_id = ?1",
            params![file_id],
            map_feature_row,
        );
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_feature(&self, file_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM features WHERE file_id = ?1", params![file_id])?;
        Ok(())
    }

    pub fn clear_needs_features(&self, file_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE files SET needs_features = 0 WHERE id = ?1",
            params![file_id],
        )?;
        Ok(())
    }

    /// Hashes for every active processed file, in file-id order; feeds the
    /// in-memory search index build.
    pub fn features_for_index(&self) -> Result<Vec<FeatureRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT feat.file_id, feat.phash, feat.dhash, feat.ahash, feat.width,
                    feat.height, feat.exif_dt, feat.camera_make, feat.camera_model,
                    feat.orientation
             FROM features feat
             JOIN files f ON f.id = feat.file_id
             WHERE f.status = 'active' AND f.unprocessable = 0
             ORDER BY feat.file_id",
        )?;
        let rows = stmt
            .query_map([], map_feature_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// (active file count, how many of those have a feature row). Drives
    /// the rescan-mode recommendation.
    pub fn feature_coverage(&self) -> Result<(i64, i64)> {
        self.conn
            .query_row(
                "SELECT
                    (SELECT COUNT(*) FROM files WHERE status = 'active'),
                    (SELECT COUNT(*) FROM features feat
                     JOIN files f ON f.id = feat.file_id
                     WHERE f.status = 'active')",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(Into::into)
    }

    /// Full-rebuild reset: derived data goes, file rows and overrides stay
    /// (the caller snapshots overrides first — groups cascade when files
    /// are truncated, and are wiped here for the non-truncating path).
    pub fn truncate_derived(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM group_members", [])?;
        tx.execute("DELETE FROM groups", [])?;
        tx.execute("DELETE FROM features", [])?;
        tx.execute(
            "UPDATE files SET needs_features = 1, unprocessable = 0,
                 fast_hash = NULL, sha256 = NULL",
            [],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(file_id: i64) -> FeatureRow {
        FeatureRow {
            file_id,
            phash: Some(0xABCD_EF01_2345_6789),
            dhash: Some(42),
            ahash: None,
            width: Some(3840),
            height: Some(2160),
            exif_dt: Some(1700000000.25),
            camera_make: Some("Canon".to_string()),
            camera_model: Some("Canon EOS R5".to_string()),
            orientation: 6,
        }
    }

    #[test]
    fn commit_extraction_is_atomic_and_round_trips() {
        let mut db = Database::open_in_memory().unwrap();
        let id = db.insert_file("/p/a.jpg", 10, 1.0).unwrap();

        db.commit_extraction(&feature(id), 0x1234).unwrap();

        let row = db.feature_for(id).unwrap().unwrap();
        assert_eq!(row, feature(id));

        let file = db.file_by_id(id).unwrap().unwrap();
        assert_eq!(file.fast_hash, Some(0x1234));
        assert!(!file.needs_features);
    }

    #[test]
    fn coverage_counts_active_only() {
        let mut db = Database::open_in_memory().unwrap();
        let a = db.insert_file("/p/a.jpg", 10, 1.0).unwrap();
        let b = db.insert_file("/p/b.jpg", 10, 1.0).unwrap();
        db.commit_extraction(&feature(a), 1).unwrap();
        db.commit_extraction(&feature(b), 2).unwrap();

        db.conn
            .execute("UPDATE files SET status = 'missing' WHERE id = ?1", params![b])
            .unwrap();

        assert_eq!(db.feature_coverage().unwrap(), (1, 1));
    }

    #[test]
    fn truncate_derived_resets_flags() {
        let mut db = Database::open_in_memory().unwrap();
        let id = db.insert_file("/p/a.jpg", 10, 1.0).unwrap();
        db.commit_extraction(&feature(id), 7).unwrap();

        db.truncate_derived().unwrap();

        assert!(db.feature_for(id).unwrap().is_none());
        let file = db.file_by_id(id).unwrap().unwrap();
        assert!(file.needs_features);
        assert!(file.fast_hash.is_none());
    }
}
