//! SQLite-backed store for files, features, groups and overrides.
//!
//! The store is the only shared mutable state in the engine. Connections are
//! cheap to open, so every worker task opens its own against the same WAL
//! database file; readers run concurrently while writers serialize.

mod schema;

pub mod files;
pub mod features;
pub mod groups;
pub mod overrides;

use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub use files::{FileRow, FileStatus};
pub use features::FeatureRow;
pub use groups::{GroupFilter, GroupRow, GroupSummary, GroupTier, MemberRole, MemberRow};
pub use overrides::{ManualOverride, OverrideReason, OverrideSnapshot, OverrideType};

/// Wall-clock seconds since the Unix epoch with sub-second resolution.
/// Used for every persisted timestamp; monotonic clocks are reserved for
/// throttling and back-off.
pub(crate) fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

pub struct Database {
    pub(crate) conn: Connection,
    path: Option<PathBuf>,
}

impl Database {
    /// Open or create the store at the given path and bring the schema up
    /// to the current generation.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // Writers serialize under WAL; worker tasks queue instead of
        // surfacing SQLITE_BUSY.
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        let mut db = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let mut db = Self { conn, path: None };
        db.migrate()?;
        Ok(db)
    }

    /// Open another connection against the same database file. Worker tasks
    /// use this so the coordinator's connection is never shared across
    /// threads.
    pub fn reopen(&self) -> Result<Self> {
        match &self.path {
            Some(path) => Self::open(path),
            None => Self::open_in_memory(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Apply every schema generation above the recorded maximum, one
    /// transaction per generation. Idempotent: re-running is a no-op.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn.execute_batch(schema::VERSION_TABLE)?;

        let current = self.schema_version()?;
        for &(version, ddl) in schema::MIGRATIONS {
            if version <= current {
                continue;
            }
            tracing::info!(version, "applying store migration");
            let tx = self.conn.transaction()?;
            tx.execute_batch(ddl)?;
            tx.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_epoch()],
            )?;
            tx.commit()?;
        }
        Ok(())
    }

    /// Highest applied schema generation, 0 for a fresh store.
    pub fn schema_version(&self) -> Result<i64> {
        let version: Option<i64> = self.conn.query_row(
            "SELECT MAX(version) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        Ok(version.unwrap_or(0))
    }

    /// Latest schema generation this build of the engine knows about.
    pub fn expected_schema_version() -> i64 {
        schema::MIGRATIONS.last().map(|&(v, _)| v).unwrap_or(0)
    }

    /// Row counts per table plus the schema version.
    pub fn stats(&self) -> Result<HashMap<String, i64>> {
        let mut stats = HashMap::new();
        for table in ["files", "features", "groups", "group_members", "manual_overrides"] {
            let count: i64 =
                self.conn
                    .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                        row.get(0)
                    })?;
            stats.insert(format!("{table}_count"), count);
        }
        stats.insert("schema_version".to_string(), self.schema_version()?);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_creates_full_schema() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), Database::expected_schema_version());

        let stats = db.stats().unwrap();
        assert_eq!(stats["files_count"], 0);
        assert_eq!(stats["groups_count"], 0);
        assert_eq!(stats["manual_overrides_count"], 0);
    }

    #[test]
    fn migrate_is_idempotent() {
        let mut db = Database::open_in_memory().unwrap();
        let before = db.schema_version().unwrap();
        db.migrate().unwrap();
        assert_eq!(db.schema_version().unwrap(), before);
    }

    #[test]
    fn reopen_sees_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photodup.db");

        let db = Database::open(&path).unwrap();
        let id = db.insert_file("/p/a.jpg", 10, 1.0).unwrap();

        let other = db.reopen().unwrap();
        let row = other.file_by_path("/p/a.jpg").unwrap().unwrap();
        assert_eq!(row.id, id);
    }
}
