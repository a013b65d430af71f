//! Group and membership persistence.
//!
//! Group ids are stable across runs: the grouping engine matches freshly
//! computed groups to existing rows by member set and updates those in
//! place, so an unchanged filesystem reproduces identical ids.

use rusqlite::params;
use std::collections::HashMap;

use super::{now_epoch, Database};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupTier {
    Exact,
    Near,
}

impl GroupTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupTier::Exact => "exact",
            GroupTier::Near => "near",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "exact" => GroupTier::Exact,
            _ => GroupTier::Near,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    Original,
    Duplicate,
    SafeDuplicate,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Original => "original",
            MemberRole::Duplicate => "duplicate",
            MemberRole::SafeDuplicate => "safe_duplicate",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "original" => MemberRole::Original,
            "safe_duplicate" => MemberRole::SafeDuplicate,
            _ => MemberRole::Duplicate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupRow {
    pub id: i64,
    pub tier: GroupTier,
    pub confidence: f64,
    pub created_at: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone)]
pub struct MemberRow {
    pub group_id: i64,
    pub file_id: i64,
    pub role: MemberRole,
    pub similarity_score: Option<f64>,
    pub notes: Option<String>,
}

/// Filters accepted by `list_groups`. `WithConflicts` is resolved at the
/// API layer, which knows how to run a trial re-selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupFilter {
    All,
    Exact,
    Near,
    SafeOnly,
    WithConflicts,
}

#[derive(Debug, Clone)]
pub struct GroupSummary {
    pub id: i64,
    pub tier: GroupTier,
    pub confidence: f64,
    pub original_file_id: i64,
    pub original_path: String,
    pub member_count: usize,
    pub safe_duplicate_count: usize,
}

impl Database {
    pub fn insert_group(
        &mut self,
        tier: GroupTier,
        confidence: f64,
        members: &[MemberRow],
    ) -> Result<i64> {
        let now = now_epoch();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO groups (tier, confidence, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![tier.as_str(), confidence, now],
        )?;
        let group_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO group_members (group_id, file_id, role, similarity_score, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for member in members {
                stmt.execute(params![
                    group_id,
                    member.file_id,
                    member.role.as_str(),
                    member.similarity_score,
                    member.notes,
                ])?;
            }
        }
        tx.commit()?;
        Ok(group_id)
    }

    /// Rewrite an existing group's members and confidence in one
    /// transaction. The member list fully replaces whatever was stored.
    pub fn update_group(
        &mut self,
        group_id: i64,
        confidence: f64,
        members: &[MemberRow],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE groups SET confidence = ?1, updated_at = ?2 WHERE id = ?3",
            params![confidence, now_epoch(), group_id],
        )?;
        tx.execute(
            "DELETE FROM group_members WHERE group_id = ?1",
            params![group_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO group_members (group_id, file_id, role, similarity_score, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for member in members {
                stmt.execute(params![
                    group_id,
                    member.file_id,
                    member.role.as_str(),
                    member.similarity_score,
                    member.notes,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_groups(&mut self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        for chunk in ids.chunks(500) {
            let placeholders: Vec<String> =
                (0..chunk.len()).map(|i| format!("?{}", i + 1)).collect();
            let sql_params: Vec<&dyn rusqlite::types::ToSql> = chunk
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();
            tx.execute(
                &format!(
                    "DELETE FROM groups WHERE id IN ({})",
                    placeholders.join(", ")
                ),
                sql_params.as_slice(),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn all_group_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare("SELECT id FROM groups ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn group_by_id(&self, group_id: i64) -> Result<GroupRow> {
        self.conn
            .query_row(
                "SELECT id, tier, confidence, created_at, updated_at
                 FROM groups WHERE id = ?1",
                params![group_id],
                |row| {
                    Ok(GroupRow {
                        id: row.get(0)?,
                        tier: GroupTier::parse(&row.get::<_, String>(1)?),
                        confidence: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Error::GroupNotFound(group_id),
                other => other.into(),
            })
    }

    pub fn members_of(&self, group_id: i64) -> Result<Vec<MemberRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT group_id, file_id, role, similarity_score, notes
             FROM group_members WHERE group_id = ?1 ORDER BY file_id",
        )?;
        let rows = stmt
            .query_map(params![group_id], map_member_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every group with its members in one JOIN pass, keyed for the
    /// grouping engine's reconciliation against freshly computed groups.
    pub fn load_groups_with_members(&self) -> Result<Vec<(GroupRow, Vec<MemberRow>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT g.id, g.tier, g.confidence, g.created_at, g.updated_at,
                    gm.file_id, gm.role, gm.similarity_score, gm.notes
             FROM groups g
             JOIN group_members gm ON gm.group_id = g.id
             ORDER BY g.id, gm.file_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    GroupRow {
                        id: row.get(0)?,
                        tier: GroupTier::parse(&row.get::<_, String>(1)?),
                        confidence: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    },
                    MemberRow {
                        group_id: row.get(0)?,
                        file_id: row.get(5)?,
                        role: MemberRole::parse(&row.get::<_, String>(6)?),
                        similarity_score: row.get(7)?,
                        notes: row.get(8)?,
                    },
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut order: Vec<i64> = Vec::new();
        let mut map: HashMap<i64, (GroupRow, Vec<MemberRow>)> = HashMap::new();
        for (group, member) in rows {
            map.entry(group.id)
                .or_insert_with(|| {
                    order.push(group.id);
                    (group, Vec::new())
                })
                .1
                .push(member);
        }
        Ok(order
            .into_iter()
            .filter_map(|id| map.remove(&id))
            .collect())
    }

    pub fn group_original(&self, group_id: i64) -> Result<Option<i64>> {
        let result = self.conn.query_row(
            "SELECT file_id FROM group_members WHERE group_id = ?1 AND role = 'original'",
            params![group_id],
            |row| row.get(0),
        );
        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_member_role(
        &self,
        group_id: i64,
        file_id: i64,
        role: MemberRole,
        notes: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE group_members SET role = ?1, notes = ?2
             WHERE group_id = ?3 AND file_id = ?4",
            params![role.as_str(), notes, group_id, file_id],
        )?;
        Ok(())
    }

    /// Member metadata the escalation predicates need, grouped per group:
    /// (group_id, file_id, role, size, exif_dt, camera_model).
    #[allow(clippy::type_complexity)]
    pub fn members_for_escalation(
        &self,
    ) -> Result<Vec<(i64, i64, MemberRole, u64, Option<f64>, Option<String>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT gm.group_id, gm.file_id, gm.role, f.size, feat.exif_dt, feat.camera_model
             FROM group_members gm
             JOIN files f ON f.id = gm.file_id
             LEFT JOIN features feat ON feat.file_id = gm.file_id
             ORDER BY gm.group_id, gm.file_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    MemberRole::parse(&row.get::<_, String>(2)?),
                    row.get::<_, i64>(3)? as u64,
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Summaries for the API layer. `WithConflicts` must be narrowed by the
    /// caller via `group_summaries_by_ids`.
    pub fn group_summaries(&self, filter: GroupFilter) -> Result<Vec<GroupSummary>> {
        let tier_clause = match filter {
            GroupFilter::Exact => " AND g.tier = 'exact'",
            GroupFilter::Near => " AND g.tier = 'near'",
            _ => "",
        };
        let safe_clause = match filter {
            GroupFilter::SafeOnly => {
                " AND EXISTS (SELECT 1 FROM group_members s
                     WHERE s.group_id = g.id AND s.role = 'safe_duplicate')"
            }
            _ => "",
        };
        let sql = format!(
            "SELECT g.id, g.tier, g.confidence, o.file_id, f.path,
                    (SELECT COUNT(*) FROM group_members m WHERE m.group_id = g.id),
                    (SELECT COUNT(*) FROM group_members m
                     WHERE m.group_id = g.id AND m.role = 'safe_duplicate')
             FROM groups g
             JOIN group_members o ON o.group_id = g.id AND o.role = 'original'
             JOIN files f ON f.id = o.file_id
             WHERE 1 = 1{tier_clause}{safe_clause}
             ORDER BY g.id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], map_group_summary)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn group_summaries_by_ids(&self, ids: &[i64]) -> Result<Vec<GroupSummary>> {
        let mut out = Vec::new();
        for chunk in ids.chunks(500) {
            let placeholders: Vec<String> =
                (0..chunk.len()).map(|i| format!("?{}", i + 1)).collect();
            let sql = format!(
                "SELECT g.id, g.tier, g.confidence, o.file_id, f.path,
                        (SELECT COUNT(*) FROM group_members m WHERE m.group_id = g.id),
                        (SELECT COUNT(*) FROM group_members m
                         WHERE m.group_id = g.id AND m.role = 'safe_duplicate')
                 FROM groups g
                 JOIN group_members o ON o.group_id = g.id AND o.role = 'original'
                 JOIN files f ON f.id = o.file_id
                 WHERE g.id IN ({})
                 ORDER BY g.id",
                placeholders.join(", ")
            );
            let sql_params: Vec<&dyn rusqlite::types::ToSql> = chunk
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt
                .query_map(sql_params.as_slice(), map_group_summary)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            out.extend(rows);
        }
        Ok(out)
    }
}

fn map_member_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemberRow> {
    Ok(MemberRow {
        group_id: row.get(0)?,
        file_id: row.get(1)?,
        role: MemberRole::parse(&row.get::<_, String>(2)?),
        similarity_score: row.get(3)?,
        notes: row.get(4)?,
    })
}

fn map_group_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupSummary> {
    Ok(GroupSummary {
        id: row.get(0)?,
        tier: GroupTier::parse(&row.get::<_, String>(1)?),
        confidence: row.get(2)?,
        original_file_id: row.get(3)?,
        original_path: row.get(4)?,
        member_count: row.get::<_, i64>(5)? as usize,
        safe_duplicate_count: row.get::<_, i64>(6)? as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(file_id: i64, role: MemberRole) -> MemberRow {
        MemberRow {
            group_id: 0,
            file_id,
            role,
            similarity_score: Some(1.0),
            notes: None,
        }
    }

    fn seed_files(db: &Database, n: usize) -> Vec<i64> {
        (0..n)
            .map(|i| db.insert_file(&format!("/p/{i}.jpg"), 10, 1.0).unwrap())
            .collect()
    }

    #[test]
    fn insert_and_load_round_trip() {
        let mut db = Database::open_in_memory().unwrap();
        let files = seed_files(&db, 3);

        let gid = db
            .insert_group(
                GroupTier::Exact,
                1.0,
                &[
                    member(files[0], MemberRole::Original),
                    member(files[1], MemberRole::Duplicate),
                    member(files[2], MemberRole::Duplicate),
                ],
            )
            .unwrap();

        let loaded = db.load_groups_with_members().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0.id, gid);
        assert_eq!(loaded[0].0.tier, GroupTier::Exact);
        assert_eq!(loaded[0].1.len(), 3);
        assert_eq!(db.group_original(gid).unwrap(), Some(files[0]));
    }

    #[test]
    fn a_second_original_violates_uniqueness() {
        let mut db = Database::open_in_memory().unwrap();
        let files = seed_files(&db, 3);
        let gid = db
            .insert_group(
                GroupTier::Near,
                0.8,
                &[
                    member(files[0], MemberRole::Original),
                    member(files[1], MemberRole::Duplicate),
                ],
            )
            .unwrap();

        let result = db.conn.execute(
            "INSERT INTO group_members (group_id, file_id, role) VALUES (?1, ?2, 'original')",
            params![gid, files[2]],
        );
        assert!(result.is_err());
    }

    #[test]
    fn deleting_file_cascades_membership() {
        let mut db = Database::open_in_memory().unwrap();
        let files = seed_files(&db, 2);
        let gid = db
            .insert_group(
                GroupTier::Exact,
                1.0,
                &[
                    member(files[0], MemberRole::Original),
                    member(files[1], MemberRole::Duplicate),
                ],
            )
            .unwrap();

        db.conn
            .execute("DELETE FROM files WHERE id = ?1", params![files[1]])
            .unwrap();
        assert_eq!(db.members_of(gid).unwrap().len(), 1);
    }

    #[test]
    fn summaries_respect_filters() {
        let mut db = Database::open_in_memory().unwrap();
        let files = seed_files(&db, 4);
        db.insert_group(
            GroupTier::Exact,
            1.0,
            &[
                member(files[0], MemberRole::Original),
                member(files[1], MemberRole::SafeDuplicate),
            ],
        )
        .unwrap();
        db.insert_group(
            GroupTier::Near,
            0.5,
            &[
                member(files[2], MemberRole::Original),
                member(files[3], MemberRole::Duplicate),
            ],
        )
        .unwrap();

        assert_eq!(db.group_summaries(GroupFilter::All).unwrap().len(), 2);
        assert_eq!(db.group_summaries(GroupFilter::Exact).unwrap().len(), 1);
        assert_eq!(db.group_summaries(GroupFilter::Near).unwrap().len(), 1);

        let safe = db.group_summaries(GroupFilter::SafeOnly).unwrap();
        assert_eq!(safe.len(), 1);
        assert_eq!(safe[0].safe_duplicate_count, 1);
        assert_eq!(safe[0].original_path, "/p/0.jpg");
    }
}
