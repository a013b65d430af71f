//! Two-tier duplicate grouping with deterministic original selection.
//!
//! Tier 1 buckets by (size, fast hash) and optionally confirms with the
//! strong hash; tier 2 walks the BK-tree for bounded-Hamming pHash
//! neighbours and applies dimension and strict-EXIF filters. Near-group
//! membership is validated against the chosen original, so every stored
//! member is within threshold and tolerance of its group's original.
//!
//! Persistence keeps group ids stable: a freshly computed group whose
//! member set and tier match an existing row updates that row in place;
//! everything else is deleted and re-inserted.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

use crate::config::Settings;
use crate::db::{Database, GroupTier, MemberRole, MemberRow};
use crate::error::Result;
use crate::features::hashing;
use crate::index::{HashKind, SearchIndex};

/// A file with everything original selection and the grouping filters need.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub size: u64,
    pub fast_hash: Option<u64>,
    pub sha256: Option<String>,
    pub phash: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub exif_dt: Option<f64>,
}

impl FileRecord {
    fn pixel_area(&self) -> Option<u64> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some(u64::from(w) * u64::from(h)),
            _ => None,
        }
    }
}

/// Format quality ordinal for original selection: RAW beats TIFF beats PNG
/// beats JPEG beats WEBP beats anything else.
fn format_priority(path: &str) -> u8 {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "raw" | "cr2" | "cr3" | "nef" | "orf" | "arw" | "dng" | "raf" | "rw2" | "pef"
        | "srw" => 1,
        "tif" | "tiff" => 2,
        "png" => 3,
        "jpg" | "jpeg" => 4,
        "webp" => 5,
        _ => 6,
    }
}

/// Sort key for original selection. Minimum wins: highest pixel area,
/// then earliest capture time (absent sorts last), then largest size,
/// then best format, then lexicographically smallest path.
fn selection_key(record: &FileRecord) -> (Reverse<u64>, i64, Reverse<u64>, u8, Vec<u8>) {
    let capture_micros = record
        .exif_dt
        .map(|ts| (ts * 1_000_000.0) as i64)
        .unwrap_or(i64::MAX);
    (
        Reverse(record.pixel_area().unwrap_or(0)),
        capture_micros,
        Reverse(record.size),
        format_priority(&record.path),
        record.path.as_bytes().to_vec(),
    )
}

/// Deterministic automatic original choice over a member set.
pub fn select_original<'a>(members: impl IntoIterator<Item = &'a FileRecord>) -> Option<i64> {
    members
        .into_iter()
        .min_by_key(|r| selection_key(r))
        .map(|r| r.id)
}

/// Active, processable files joined with their features.
pub fn load_grouping_records(db: &Database) -> Result<Vec<FileRecord>> {
    let mut stmt = db.conn().prepare(
        "SELECT f.id, f.path, f.size, f.fast_hash, f.sha256,
                feat.phash, feat.width, feat.height, feat.exif_dt
         FROM files f
         LEFT JOIN features feat ON feat.file_id = f.id
         WHERE f.status = 'active' AND f.unprocessable = 0
         ORDER BY f.id",
    )?;
    let records = stmt
        .query_map([], |row| {
            Ok(FileRecord {
                id: row.get(0)?,
                path: row.get(1)?,
                size: row.get::<_, i64>(2)? as u64,
                fast_hash: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
                sha256: row.get(4)?,
                phash: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
                width: row.get(6)?,
                height: row.get(7)?,
                exif_dt: row.get(8)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(records)
}

#[derive(Debug, Clone, Default)]
pub struct GroupingOutcome {
    pub exact_groups: usize,
    pub near_groups: usize,
    pub groups_created: usize,
    pub groups_updated: usize,
    pub groups_deleted: usize,
    /// (group_id, vanished chosen file id) for overrides deactivated
    /// because their target left the group.
    pub missing_override_targets: Vec<(i64, i64)>,
}

/// An override whose chosen original now differs from what automatic
/// selection would pick. Not an error; the host UI resolves it.
#[derive(Debug, Clone)]
pub struct ConflictInfo {
    pub group_id: i64,
    pub auto_original_id: i64,
    pub auto_original_path: String,
    pub override_original_id: i64,
    pub override_original_path: String,
}

struct DesiredGroup {
    tier: GroupTier,
    confidence: f64,
    /// Sorted member ids.
    member_ids: Vec<i64>,
    auto_original: i64,
    /// Similarity to the original per member (the original maps to 1.0).
    scores: HashMap<i64, f64>,
}

pub struct GroupingEngine {
    settings: Settings,
}

impl GroupingEngine {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub fn run(&self, db: &mut Database, index: &SearchIndex) -> Result<GroupingOutcome> {
        let records = load_grouping_records(db)?;
        let by_id: HashMap<i64, usize> = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id, i))
            .collect();

        let mut desired = Vec::new();
        let exact_ids = self.find_exact_groups(db, &records, &mut desired)?;
        self.find_near_groups(index, &records, &by_id, &exact_ids, &mut desired);

        let mut outcome = GroupingOutcome {
            exact_groups: desired
                .iter()
                .filter(|g| g.tier == GroupTier::Exact)
                .count(),
            near_groups: desired.iter().filter(|g| g.tier == GroupTier::Near).count(),
            ..Default::default()
        };

        self.persist(db, desired, &mut outcome)?;

        tracing::info!(
            exact = outcome.exact_groups,
            near = outcome.near_groups,
            created = outcome.groups_created,
            updated = outcome.groups_updated,
            deleted = outcome.groups_deleted,
            "grouping complete"
        );
        Ok(outcome)
    }

    /// Tier 1: bucket by (size, fast hash), then subdivide by strong hash
    /// when confirmation is on. Returns the set of file ids placed in
    /// exact groups.
    fn find_exact_groups(
        &self,
        db: &Database,
        records: &[FileRecord],
        desired: &mut Vec<DesiredGroup>,
    ) -> Result<HashSet<i64>> {
        let mut buckets: BTreeMap<(u64, u64), Vec<usize>> = BTreeMap::new();
        for (i, record) in records.iter().enumerate() {
            if let Some(fast_hash) = record.fast_hash {
                buckets.entry((record.size, fast_hash)).or_default().push(i);
            }
        }

        let mut exact_ids = HashSet::new();
        for indices in buckets.values() {
            if indices.len() < 2 {
                continue;
            }
            if self.settings.enable_strong_hash_confirmation {
                let mut by_strong: BTreeMap<String, Vec<usize>> = BTreeMap::new();
                for &i in indices {
                    match ensure_strong_hash(db, &records[i])? {
                        Some(strong) => by_strong.entry(strong).or_default().push(i),
                        // Unreadable right now: leave it out of the bucket
                        // this run rather than guessing.
                        None => continue,
                    }
                }
                for confirmed in by_strong.values() {
                    if confirmed.len() >= 2 {
                        push_exact_group(records, confirmed, 1.0, desired, &mut exact_ids);
                    }
                }
            } else {
                push_exact_group(records, indices, 0.95, desired, &mut exact_ids);
            }
        }
        Ok(exact_ids)
    }

    /// Tier 2: BK-tree candidates around each unplaced file, filtered and
    /// then re-validated against the chosen original.
    fn find_near_groups(
        &self,
        index: &SearchIndex,
        records: &[FileRecord],
        by_id: &HashMap<i64, usize>,
        exact_ids: &HashSet<i64>,
        desired: &mut Vec<DesiredGroup>,
    ) {
        let threshold = self.settings.phash_threshold;
        let mut absorbed: HashSet<i64> = HashSet::new();

        for record in records {
            if exact_ids.contains(&record.id) || absorbed.contains(&record.id) {
                continue;
            }
            let Some(seed_phash) = record.phash else {
                continue;
            };

            let mut candidates = index.query(HashKind::PHash, seed_phash, threshold);
            candidates.sort_by_key(|&(id, distance)| (distance, id));

            let mut pool: Vec<(&FileRecord, u64)> = vec![(record, seed_phash)];
            let mut seen: HashSet<i64> = HashSet::new();
            for (candidate_id, _) in candidates {
                if candidate_id == record.id
                    || absorbed.contains(&candidate_id)
                    || exact_ids.contains(&candidate_id)
                    || !seen.insert(candidate_id)
                {
                    continue;
                }
                let Some(&ci) = by_id.get(&candidate_id) else {
                    // Stale index entry for a file no longer groupable.
                    continue;
                };
                let candidate = &records[ci];
                let Some(candidate_phash) = candidate.phash else {
                    continue;
                };
                // The index may hold a superseded hash for a re-extracted
                // file; the store is authoritative.
                if hashing::hamming_distance(seed_phash, candidate_phash) > threshold {
                    continue;
                }
                if !self.dimensions_compatible(record, candidate) {
                    continue;
                }
                if self.settings.strict_exif_datetime_match && !exif_datetime_equal(record, candidate)
                {
                    continue;
                }
                pool.push((candidate, candidate_phash));
            }
            if pool.len() < 2 {
                continue;
            }

            let Some(original_id) = select_original(pool.iter().map(|(r, _)| *r)) else {
                continue;
            };
            let Some(&(original, original_phash)) =
                pool.iter().find(|(r, _)| r.id == original_id)
            else {
                continue;
            };

            let mut members: Vec<(i64, u32)> = vec![(original_id, 0)];
            for &(candidate, candidate_phash) in &pool {
                if candidate.id == original_id {
                    continue;
                }
                let distance = hashing::hamming_distance(original_phash, candidate_phash);
                if distance > threshold {
                    continue;
                }
                if !self.dimensions_compatible(original, candidate) {
                    continue;
                }
                if self.settings.strict_exif_datetime_match
                    && !exif_datetime_equal(original, candidate)
                {
                    continue;
                }
                members.push((candidate.id, distance));
            }
            if members.len() < 2 {
                continue;
            }

            let min_distance = members
                .iter()
                .filter(|&&(id, _)| id != original_id)
                .map(|&(_, d)| d)
                .min()
                .unwrap_or(threshold);
            let confidence =
                (1.0 - f64::from(min_distance) / f64::from(threshold.max(1))).clamp(0.0, 1.0);

            let mut scores = HashMap::new();
            for &(id, distance) in &members {
                let score = if id == original_id {
                    1.0
                } else {
                    (1.0 - f64::from(distance) / f64::from(threshold.max(1))).clamp(0.0, 1.0)
                };
                scores.insert(id, score);
            }

            let mut member_ids: Vec<i64> = members.iter().map(|&(id, _)| id).collect();
            member_ids.sort_unstable();
            for &id in &member_ids {
                absorbed.insert(id);
            }

            desired.push(DesiredGroup {
                tier: GroupTier::Near,
                confidence,
                member_ids,
                auto_original: original_id,
                scores,
            });
        }
    }

    /// Pixel-area sanity: |a1 - a2| / max(a1, a2) must stay within the
    /// configured fraction. Unknown dimensions pass.
    fn dimensions_compatible(&self, a: &FileRecord, b: &FileRecord) -> bool {
        match (a.pixel_area(), b.pixel_area()) {
            (Some(area_a), Some(area_b)) => {
                let max = area_a.max(area_b);
                if max == 0 {
                    return true;
                }
                let deviation = (area_a as f64 - area_b as f64).abs() / max as f64;
                deviation <= self.settings.dimension_tolerance_fraction
            }
            _ => true,
        }
    }

    /// Reconcile the desired groups with what the store already holds.
    fn persist(
        &self,
        db: &mut Database,
        desired: Vec<DesiredGroup>,
        outcome: &mut GroupingOutcome,
    ) -> Result<()> {
        let existing = db.load_groups_with_members()?;
        let mut owner: HashMap<i64, i64> = HashMap::new();
        for (group, members) in &existing {
            for member in members {
                owner.insert(member.file_id, group.id);
            }
        }
        let existing_by_id: HashMap<i64, (GroupTier, Vec<MemberRow>)> = existing
            .into_iter()
            .map(|(group, members)| (group.id, (group.tier, members)))
            .collect();

        // Match desired groups to existing ids by identical member sets.
        let mut claimed: HashSet<i64> = HashSet::new();
        let mut matches: Vec<Option<i64>> = Vec::with_capacity(desired.len());
        for group in &desired {
            let overlapping: BTreeSet<i64> = group
                .member_ids
                .iter()
                .filter_map(|id| owner.get(id).copied())
                .collect();
            let matched = if let (1, Some(&gid)) = (overlapping.len(), overlapping.iter().next()) {
                if claimed.contains(&gid) {
                    None
                } else {
                    match existing_by_id.get(&gid) {
                        Some((tier, members)) if *tier == group.tier => {
                            let existing_set: BTreeSet<i64> =
                                members.iter().map(|m| m.file_id).collect();
                            let desired_set: BTreeSet<i64> =
                                group.member_ids.iter().copied().collect();
                            // Identical sets keep their id (the idempotence
                            // contract); a shrunk or grown group keeps it
                            // too so overrides ride out membership churn.
                            if desired_set.is_subset(&existing_set)
                                || existing_set.is_subset(&desired_set)
                            {
                                claimed.insert(gid);
                                Some(gid)
                            } else {
                                None
                            }
                        }
                        _ => None,
                    }
                }
            } else {
                None
            };
            matches.push(matched);
        }

        let doomed: Vec<i64> = existing_by_id
            .keys()
            .filter(|id| !claimed.contains(id))
            .copied()
            .collect();
        outcome.groups_deleted = doomed.len();
        db.delete_groups(&doomed)?;

        for (group, matched) in desired.into_iter().zip(matches) {
            let mut original = group.auto_original;
            let mut previous_roles: HashMap<i64, (MemberRole, Option<String>)> = HashMap::new();
            let mut previous_original: Option<i64> = None;

            if let Some(gid) = matched {
                if let Some(active) = db.lookup_override(gid)? {
                    if group.member_ids.contains(&active.original_file_id) {
                        original = active.original_file_id;
                    } else {
                        db.deactivate_override(gid)?;
                        outcome
                            .missing_override_targets
                            .push((gid, active.original_file_id));
                    }
                }
                if let Some((_, members)) = existing_by_id.get(&gid) {
                    for member in members {
                        if member.role == MemberRole::Original {
                            previous_original = Some(member.file_id);
                        }
                        previous_roles
                            .insert(member.file_id, (member.role, member.notes.clone()));
                    }
                }
            }

            // Safe-duplicate flags survive only while the original stands;
            // an original change resets everyone else to plain duplicate.
            let preserve_roles = matched.is_some() && previous_original == Some(original);

            let rows: Vec<MemberRow> = group
                .member_ids
                .iter()
                .map(|&file_id| {
                    let (role, notes) = if file_id == original {
                        (MemberRole::Original, None)
                    } else if preserve_roles {
                        match previous_roles.get(&file_id) {
                            Some(&(MemberRole::SafeDuplicate, ref notes)) => {
                                (MemberRole::SafeDuplicate, notes.clone())
                            }
                            _ => (MemberRole::Duplicate, None),
                        }
                    } else {
                        (MemberRole::Duplicate, None)
                    };
                    MemberRow {
                        group_id: matched.unwrap_or(0),
                        file_id,
                        role,
                        similarity_score: Some(
                            group.scores.get(&file_id).copied().unwrap_or(1.0),
                        ),
                        notes,
                    }
                })
                .collect();

            match matched {
                Some(gid) => {
                    db.update_group(gid, group.confidence, &rows)?;
                    outcome.groups_updated += 1;
                }
                None => {
                    db.insert_group(group.tier, group.confidence, &rows)?;
                    outcome.groups_created += 1;
                }
            }
        }
        Ok(())
    }
}

fn push_exact_group(
    records: &[FileRecord],
    indices: &[usize],
    confidence: f64,
    desired: &mut Vec<DesiredGroup>,
    exact_ids: &mut HashSet<i64>,
) {
    let members: Vec<&FileRecord> = indices.iter().map(|&i| &records[i]).collect();
    let Some(auto_original) = select_original(members.iter().copied()) else {
        return;
    };
    let mut member_ids: Vec<i64> = members.iter().map(|r| r.id).collect();
    member_ids.sort_unstable();
    let scores = member_ids.iter().map(|&id| (id, 1.0)).collect();
    for &id in &member_ids {
        exact_ids.insert(id);
    }
    desired.push(DesiredGroup {
        tier: GroupTier::Exact,
        confidence,
        member_ids,
        auto_original,
        scores,
    });
}

/// Strong-hash confirmation is lazy: hashes are computed (and cached on
/// the file row) only when an exact bucket actually needs subdividing.
fn ensure_strong_hash(db: &Database, record: &FileRecord) -> Result<Option<String>> {
    if let Some(existing) = &record.sha256 {
        return Ok(Some(existing.clone()));
    }
    match hashing::strong_hash(Path::new(&record.path)) {
        Ok(strong) => {
            db.set_strong_hash(record.id, &strong)?;
            Ok(Some(strong))
        }
        Err(e) => {
            tracing::warn!(path = %record.path, error = %e, "strong hash failed");
            Ok(None)
        }
    }
}

fn exif_datetime_equal(a: &FileRecord, b: &FileRecord) -> bool {
    match (a.exif_dt, b.exif_dt) {
        (Some(ta), Some(tb)) => ta == tb,
        _ => false,
    }
}

/// Trial re-selection over every active override: reports each group whose
/// automatic choice now disagrees with the pinned original.
pub fn detect_conflicts(db: &Database) -> Result<Vec<ConflictInfo>> {
    let records = load_grouping_records(db)?;
    let by_id: HashMap<i64, &FileRecord> = records.iter().map(|r| (r.id, r)).collect();

    let mut conflicts = Vec::new();
    for active in db.active_overrides()? {
        let members = db.members_of(active.group_id)?;
        let member_records: Vec<&FileRecord> = members
            .iter()
            .filter_map(|m| by_id.get(&m.file_id).copied())
            .collect();
        if member_records.len() < 2 {
            continue;
        }
        let Some(override_record) = by_id.get(&active.original_file_id) else {
            // Target vanished; the orphan reaper owns that case.
            continue;
        };
        let Some(auto_id) = select_original(member_records.iter().copied()) else {
            continue;
        };
        if auto_id != active.original_file_id {
            let Some(auto_record) = by_id.get(&auto_id) else {
                continue;
            };
            conflicts.push(ConflictInfo {
                group_id: active.group_id,
                auto_original_id: auto_id,
                auto_original_path: auto_record.path.clone(),
                override_original_id: active.original_file_id,
                override_original_path: override_record.path.clone(),
            });
        }
    }
    Ok(conflicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FeatureRow;

    fn record(id: i64, path: &str) -> FileRecord {
        FileRecord {
            id,
            path: path.to_string(),
            size: 1000,
            fast_hash: None,
            sha256: None,
            phash: None,
            width: Some(1000),
            height: Some(1000),
            exif_dt: None,
        }
    }

    #[test]
    fn resolution_beats_everything() {
        let mut small = record(1, "/a/small.png");
        small.size = 9_999_999;
        let mut big = record(2, "/z/big.jpg");
        big.width = Some(4000);
        big.height = Some(3000);

        assert_eq!(select_original([&small, &big]), Some(2));
    }

    #[test]
    fn earlier_capture_wins_at_equal_resolution() {
        let mut early = record(1, "/z/early.jpg");
        early.exif_dt = Some(1000.0);
        let mut late = record(2, "/a/late.jpg");
        late.exif_dt = Some(1000.4);

        assert_eq!(select_original([&late, &early]), Some(1));

        // A missing capture time sorts after any present one.
        let mut unknown = record(3, "/a/unknown.jpg");
        unknown.exif_dt = None;
        assert_eq!(select_original([&unknown, &late]), Some(2));
    }

    #[test]
    fn size_then_format_then_path_break_ties() {
        let mut large = record(1, "/z/large.jpg");
        large.size = 2000;
        let small = record(2, "/a/small.jpg");
        assert_eq!(select_original([&small, &large]), Some(1));

        let png = record(3, "/z/shot.png");
        let jpeg = record(4, "/a/shot.jpg");
        assert_eq!(select_original([&jpeg, &png]), Some(3));

        let first = record(5, "/a/x.jpg");
        let second = record(6, "/b/x.jpg");
        assert_eq!(select_original([&second, &first]), Some(5));
    }

    #[test]
    fn dimension_tolerance_boundary_is_inclusive() {
        let engine = GroupingEngine::new(Settings::default()); // tolerance 0.10
        let base = record(1, "/a.jpg"); // 1000x1000 = 1_000_000

        let mut at_limit = record(2, "/b.jpg");
        at_limit.width = Some(1000);
        at_limit.height = Some(900); // deviation exactly 0.10
        assert!(engine.dimensions_compatible(&base, &at_limit));

        let mut beyond = record(3, "/c.jpg");
        beyond.width = Some(1000);
        beyond.height = Some(899);
        assert!(!engine.dimensions_compatible(&base, &beyond));

        let mut unknown = record(4, "/d.jpg");
        unknown.width = None;
        assert!(engine.dimensions_compatible(&base, &unknown));
    }

    // ── engine over a seeded store ──────────────────────────────────

    fn seeded_settings() -> Settings {
        let mut settings = Settings::default();
        // Seeded rows have no real files behind them.
        settings.enable_strong_hash_confirmation = false;
        settings
    }

    fn seed_file(
        db: &Database,
        path: &str,
        size: u64,
        fast_hash: Option<u64>,
        phash: Option<u64>,
        dims: (u32, u32),
        exif_dt: Option<f64>,
    ) -> i64 {
        let id = db.insert_file(path, size, 1.0).unwrap();
        if let Some(fh) = fast_hash {
            db.set_fast_hash(id, fh).unwrap();
        }
        db.upsert_feature(&FeatureRow {
            file_id: id,
            phash,
            dhash: phash,
            ahash: phash,
            width: Some(dims.0),
            height: Some(dims.1),
            exif_dt,
            camera_make: None,
            camera_model: None,
            orientation: 1,
        })
        .unwrap();
        db.clear_needs_features(id).unwrap();
        id
    }

    fn run_engine(db: &mut Database, settings: Settings) -> GroupingOutcome {
        let index = SearchIndex::build_from_store(db).unwrap();
        GroupingEngine::new(settings).run(db, &index).unwrap()
    }

    #[test]
    fn exact_bucket_forms_one_group() {
        let mut db = Database::open_in_memory().unwrap();
        let a = seed_file(&db, "/a/x.jpg", 500, Some(7), Some(1), (800, 600), None);
        let b = seed_file(&db, "/b/x.jpg", 500, Some(7), Some(1), (800, 600), None);
        seed_file(&db, "/c/other.jpg", 500, Some(8), Some(u64::MAX), (800, 600), None);

        let outcome = run_engine(&mut db, seeded_settings());
        assert_eq!(outcome.exact_groups, 1);
        assert_eq!(outcome.groups_created, 1);

        let groups = db.load_groups_with_members().unwrap();
        assert_eq!(groups.len(), 1);
        let (group, members) = &groups[0];
        assert_eq!(group.tier, GroupTier::Exact);
        assert!((group.confidence - 0.95).abs() < 1e-9);
        assert_eq!(members.len(), 2);
        assert_eq!(db.group_original(group.id).unwrap(), Some(a));
        assert!(members.iter().any(|m| m.file_id == b && m.role == MemberRole::Duplicate));
    }

    #[test]
    fn near_group_respects_threshold_boundary() {
        let mut db = Database::open_in_memory().unwrap();
        let settings = seeded_settings(); // phash threshold 8

        // Seed phash 0; candidate at distance exactly 8; another at 9.
        let seed = seed_file(&db, "/p/seed.jpg", 900, Some(1), Some(0), (1000, 1000), None);
        let at_8 = seed_file(&db, "/p/at8.jpg", 901, Some(2), Some(0xFF), (1000, 1000), None);
        let at_9 = seed_file(&db, "/p/at9.jpg", 902, Some(3), Some(0x1FF), (1000, 1000), None);

        let outcome = run_engine(&mut db, settings);
        assert_eq!(outcome.near_groups, 1);

        let groups = db.load_groups_with_members().unwrap();
        assert_eq!(groups.len(), 1);
        let member_ids: Vec<i64> = groups[0].1.iter().map(|m| m.file_id).collect();
        assert!(member_ids.contains(&seed));
        assert!(member_ids.contains(&at_8));
        assert!(!member_ids.contains(&at_9));
    }

    #[test]
    fn dimension_filter_blocks_grouping() {
        let mut db = Database::open_in_memory().unwrap();
        seed_file(&db, "/p/a.jpg", 900, Some(1), Some(0), (1000, 1000), None);
        seed_file(&db, "/p/b.jpg", 901, Some(2), Some(1), (2000, 2000), None);

        let outcome = run_engine(&mut db, seeded_settings());
        assert_eq!(outcome.near_groups, 0);
        assert!(db.load_groups_with_members().unwrap().is_empty());
    }

    #[test]
    fn strict_mode_requires_equal_capture_times() {
        let mut db = Database::open_in_memory().unwrap();
        let mut settings = seeded_settings();
        settings.strict_exif_datetime_match = true;

        seed_file(&db, "/p/a.jpg", 900, Some(1), Some(0), (1000, 1000), Some(100.0));
        seed_file(&db, "/p/b.jpg", 901, Some(2), Some(1), (1000, 1000), Some(101.0));
        // One timestamp missing also fails the strict filter.
        seed_file(&db, "/p/c.jpg", 902, Some(3), Some(2), (1000, 1000), None);

        let outcome = run_engine(&mut db, settings.clone());
        assert_eq!(outcome.near_groups, 0);

        // Equal timestamps group.
        let mut db = Database::open_in_memory().unwrap();
        seed_file(&db, "/p/a.jpg", 900, Some(1), Some(0), (1000, 1000), Some(100.0));
        seed_file(&db, "/p/b.jpg", 901, Some(2), Some(1), (1000, 1000), Some(100.0));
        let outcome = run_engine(&mut db, settings);
        assert_eq!(outcome.near_groups, 1);
    }

    #[test]
    fn rerun_preserves_group_ids() {
        let mut db = Database::open_in_memory().unwrap();
        seed_file(&db, "/p/a.jpg", 500, Some(7), Some(1), (800, 600), None);
        seed_file(&db, "/p/b.jpg", 500, Some(7), Some(1), (800, 600), None);
        seed_file(&db, "/q/c.jpg", 900, Some(8), Some(1 << 20), (1000, 1000), None);
        seed_file(&db, "/q/d.jpg", 901, Some(9), Some(1 << 20 | 1), (1000, 1000), None);

        let first = run_engine(&mut db, seeded_settings());
        assert_eq!(first.groups_created, 2);
        let ids_before = db.all_group_ids().unwrap();

        let second = run_engine(&mut db, seeded_settings());
        assert_eq!(second.groups_created, 0);
        assert_eq!(second.groups_updated, 2);
        assert_eq!(second.groups_deleted, 0);
        assert_eq!(db.all_group_ids().unwrap(), ids_before);
    }

    #[test]
    fn override_pins_original_and_survives_reruns() {
        let mut db = Database::open_in_memory().unwrap();
        let _a = seed_file(&db, "/q/A.jpg", 500, Some(7), Some(1), (800, 600), None);
        let b = seed_file(&db, "/q/B.jpg", 500, Some(7), Some(1), (800, 600), None);

        run_engine(&mut db, seeded_settings());
        let gid = db.all_group_ids().unwrap()[0];

        db.put_override(
            gid,
            b,
            crate::db::OverrideType::SingleGroup,
            crate::db::OverrideReason::UserPreference,
            None,
        )
        .unwrap();

        let outcome = run_engine(&mut db, seeded_settings());
        assert!(outcome.missing_override_targets.is_empty());
        assert_eq!(db.group_original(gid).unwrap(), Some(b));

        let conflicts = detect_conflicts(&db).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].override_original_id, b);
    }

    #[test]
    fn vanished_override_target_is_deactivated() {
        let mut db = Database::open_in_memory().unwrap();
        seed_file(&db, "/q/A.jpg", 500, Some(7), Some(1), (800, 600), None);
        let b = seed_file(&db, "/q/B.jpg", 500, Some(7), Some(1), (800, 600), None);
        let c = seed_file(&db, "/q/C.jpg", 500, Some(7), Some(1), (800, 600), None);

        run_engine(&mut db, seeded_settings());
        let gid = db.all_group_ids().unwrap()[0];
        db.put_override(
            gid,
            b,
            crate::db::OverrideType::SingleGroup,
            crate::db::OverrideReason::UserPreference,
            None,
        )
        .unwrap();

        // B's bytes change: different fast hash, drops out of the bucket.
        db.conn()
            .execute(
                "UPDATE files SET fast_hash = 999, size = 777 WHERE id = ?1",
                rusqlite::params![b],
            )
            .unwrap();

        let outcome = run_engine(&mut db, seeded_settings());
        assert_eq!(outcome.missing_override_targets.len(), 1);
        assert_eq!(outcome.missing_override_targets[0].1, b);
        assert!(db.lookup_override(gid).unwrap().is_none());

        // The surviving pair regrouped around the computed original.
        let groups = db.load_groups_with_members().unwrap();
        assert_eq!(groups.len(), 1);
        let roles: Vec<i64> = groups[0]
            .1
            .iter()
            .filter(|m| m.role == MemberRole::Original)
            .map(|m| m.file_id)
            .collect();
        assert_eq!(roles.len(), 1);
        assert_ne!(roles[0], b);
        let _ = c;
    }
}
