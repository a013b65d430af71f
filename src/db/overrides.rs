//! Manual-override store: user decisions that pin a group's original.
//!
//! At most one override is active per group; the UNIQUE (group_id,
//! is_active) constraint enforces it. Deactivation sets is_active to NULL
//! (NULLs are distinct under SQLite UNIQUE indexes), so historical rows
//! accumulate without tripping the constraint.

use rusqlite::params;

use super::{now_epoch, Database, MemberRole};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideType {
    SingleGroup,
    DefaultRule,
}

impl OverrideType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideType::SingleGroup => "single_group",
            OverrideType::DefaultRule => "default_rule",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "default_rule" => OverrideType::DefaultRule,
            _ => OverrideType::SingleGroup,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideReason {
    UserPreference,
    QualityBetter,
    FormatPreference,
    ManualSelection,
    AlgorithmError,
}

impl OverrideReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideReason::UserPreference => "user_preference",
            OverrideReason::QualityBetter => "quality_better",
            OverrideReason::FormatPreference => "format_preference",
            OverrideReason::ManualSelection => "manual_selection",
            OverrideReason::AlgorithmError => "algorithm_error",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "quality_better" => OverrideReason::QualityBetter,
            "format_preference" => OverrideReason::FormatPreference,
            "manual_selection" => OverrideReason::ManualSelection,
            "algorithm_error" => OverrideReason::AlgorithmError,
            _ => OverrideReason::UserPreference,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManualOverride {
    pub id: i64,
    pub group_id: i64,
    pub original_file_id: i64,
    pub auto_original_id: i64,
    pub override_type: OverrideType,
    pub reason: OverrideReason,
    pub created_at: f64,
    pub notes: Option<String>,
    pub is_active: bool,
}

/// Path-keyed snapshot of an active override, taken before a full rebuild
/// truncates the tables it references.
#[derive(Debug, Clone)]
pub struct OverrideSnapshot {
    pub chosen_path: String,
    pub auto_path: String,
    pub override_type: OverrideType,
    pub reason: OverrideReason,
    pub created_at: f64,
    pub notes: Option<String>,
}

fn map_override(row: &rusqlite::Row<'_>) -> rusqlite::Result<ManualOverride> {
    Ok(ManualOverride {
        id: row.get(0)?,
        group_id: row.get(1)?,
        original_file_id: row.get(2)?,
        auto_original_id: row.get(3)?,
        override_type: OverrideType::parse(&row.get::<_, String>(4)?),
        reason: OverrideReason::parse(&row.get::<_, String>(5)?),
        created_at: row.get(6)?,
        notes: row.get(7)?,
        is_active: row.get::<_, Option<bool>>(8)?.unwrap_or(false),
    })
}

const OVERRIDE_COLUMNS: &str = "id, group_id, original_file_id, auto_original_id, \
     override_type, reason, created_at, notes, is_active";

impl Database {
    /// Record a user's original choice for a group. Any previous active
    /// override for the group is deactivated, the member roles are updated
    /// immediately, and the row remembers what auto-selection had picked so
    /// removal can restore it.
    pub fn put_override(
        &mut self,
        group_id: i64,
        file_id: i64,
        override_type: OverrideType,
        reason: OverrideReason,
        notes: Option<&str>,
    ) -> Result<i64> {
        let auto_original = self
            .group_original(group_id)?
            .ok_or(Error::GroupNotFound(group_id))?;

        let is_member: bool = self
            .conn
            .query_row(
                "SELECT 1 FROM group_members WHERE group_id = ?1 AND file_id = ?2",
                params![group_id, file_id],
                |_| Ok(true),
            )
            .unwrap_or(false);
        if !is_member {
            return Err(Error::NotAGroupMember { group_id, file_id });
        }

        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE manual_overrides SET is_active = NULL
             WHERE group_id = ?1 AND is_active = 1",
            params![group_id],
        )?;
        tx.execute(
            "INSERT INTO manual_overrides
                 (group_id, original_file_id, auto_original_id, override_type,
                  reason, created_at, notes, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
            params![
                group_id,
                file_id,
                auto_original,
                override_type.as_str(),
                reason.as_str(),
                now_epoch(),
                notes,
            ],
        )?;
        let override_id = tx.last_insert_rowid();
        reassign_original(&tx, group_id, file_id)?;
        tx.commit()?;

        tracing::info!(group_id, file_id, "recorded manual override");
        Ok(override_id)
    }

    /// Deactivate the group's active override and restore the original that
    /// auto-selection had picked when the override was recorded.
    pub fn clear_override(&mut self, group_id: i64) -> Result<bool> {
        let Some(existing) = self.lookup_override(group_id)? else {
            return Ok(false);
        };

        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE manual_overrides SET is_active = NULL
             WHERE group_id = ?1 AND is_active = 1",
            params![group_id],
        )?;
        reassign_original(&tx, group_id, existing.auto_original_id)?;
        tx.commit()?;

        tracing::info!(group_id, "cleared manual override");
        Ok(true)
    }

    pub fn lookup_override(&self, group_id: i64) -> Result<Option<ManualOverride>> {
        let result = self.conn.query_row(
            &format!(
                "SELECT {OVERRIDE_COLUMNS} FROM manual_overrides
                 WHERE group_id = ?1 AND is_active = 1"
            ),
            params![group_id],
            map_override,
        );
        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn active_overrides(&self) -> Result<Vec<ManualOverride>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OVERRIDE_COLUMNS} FROM manual_overrides
             WHERE is_active = 1 ORDER BY created_at DESC"
        ))?;
        let rows = stmt
            .query_map([], map_override)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Deactivate without touching member roles; used when the override's
    /// target has disappeared and the computed original stands.
    pub fn deactivate_override(&self, group_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE manual_overrides SET is_active = NULL
             WHERE group_id = ?1 AND is_active = 1",
            params![group_id],
        )?;
        Ok(())
    }

    /// Deactivate overrides whose chosen file has gone missing. Returns
    /// (group_id, chosen_file_id) for each, so the coordinator can emit
    /// MissingOverrideTarget events.
    pub fn reap_orphan_overrides(&self) -> Result<Vec<(i64, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT mo.group_id, mo.original_file_id
             FROM manual_overrides mo
             JOIN files f ON f.id = mo.original_file_id
             WHERE mo.is_active = 1 AND f.status = 'missing'",
        )?;
        let orphans = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        for (group_id, file_id) in &orphans {
            self.deactivate_override(*group_id)?;
            tracing::warn!(group_id, file_id, "override target missing, deactivated");
        }
        Ok(orphans)
    }

    /// Path-keyed snapshot of every active override, for full-rebuild
    /// preservation.
    pub fn snapshot_overrides(&self) -> Result<Vec<OverrideSnapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT chosen.path, auto.path, mo.override_type, mo.reason,
                    mo.created_at, mo.notes
             FROM manual_overrides mo
             JOIN files chosen ON chosen.id = mo.original_file_id
             JOIN files auto ON auto.id = mo.auto_original_id
             WHERE mo.is_active = 1",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(OverrideSnapshot {
                    chosen_path: row.get(0)?,
                    auto_path: row.get(1)?,
                    override_type: OverrideType::parse(&row.get::<_, String>(2)?),
                    reason: OverrideReason::parse(&row.get::<_, String>(3)?),
                    created_at: row.get(4)?,
                    notes: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Counts of total and active overrides, by type and by reason.
    pub fn override_stats(&self) -> Result<OverrideStats> {
        let (total, active) = self.conn.query_row(
            "SELECT COUNT(*),
                    COUNT(CASE WHEN is_active = 1 THEN 1 END)
             FROM manual_overrides",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;

        let mut by_type = Vec::new();
        let mut stmt = self.conn.prepare(
            "SELECT override_type, COUNT(*) FROM manual_overrides
             WHERE is_active = 1 GROUP BY override_type",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            by_type.push(row?);
        }
        drop(stmt);

        let mut by_reason = Vec::new();
        let mut stmt = self.conn.prepare(
            "SELECT reason, COUNT(*) FROM manual_overrides
             WHERE is_active = 1 GROUP BY reason",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            by_reason.push(row?);
        }

        Ok(OverrideStats {
            total,
            active,
            by_type,
            by_reason,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OverrideStats {
    pub total: i64,
    pub active: i64,
    pub by_type: Vec<(String, i64)>,
    pub by_reason: Vec<(String, i64)>,
}

/// Point the group's 'original' role at `new_original`, demoting everything
/// else to 'duplicate'. Escalation recomputes safe flags on the next run.
fn reassign_original(
    tx: &rusqlite::Transaction<'_>,
    group_id: i64,
    new_original: i64,
) -> Result<()> {
    tx.execute(
        "UPDATE group_members SET role = ?1 WHERE group_id = ?2",
        params![MemberRole::Duplicate.as_str(), group_id],
    )?;
    tx.execute(
        "UPDATE group_members SET role = ?1, similarity_score = 1.0
         WHERE group_id = ?2 AND file_id = ?3",
        params![MemberRole::Original.as_str(), group_id, new_original],
    )?;
    Ok(())
}
