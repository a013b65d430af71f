//! Safe-duplicate escalation: promotes `duplicate` members whose size,
//! capture time and camera all agree with the group's original.
//!
//! Promotion is idempotent; rows already marked safe are left alone.
//! Demotion happens in grouping, and only when the original changes or a
//! member's underlying file changes.

use std::collections::BTreeMap;

use crate::config::Settings;
use crate::db::{Database, MemberRole};
use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EscalationCriteria {
    pub size_match: bool,
    pub time_match: bool,
    pub camera_match: bool,
}

impl EscalationCriteria {
    pub fn all_met(&self) -> bool {
        self.size_match && self.time_match && self.camera_match
    }

    fn note(&self) -> String {
        let mut matched = Vec::new();
        if self.size_match {
            matched.push("size_match");
        }
        if self.time_match {
            matched.push("datetime_match");
        }
        if self.camera_match {
            matched.push("camera_match");
        }
        if matched.is_empty() {
            "escalated: no_match".to_string()
        } else {
            format!("escalated: {}", matched.join(" + "))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EscalationOutcome {
    pub groups_processed: usize,
    pub duplicates_analyzed: usize,
    pub escalated: usize,
}

struct MemberMeta {
    file_id: i64,
    role: MemberRole,
    size: u64,
    exif_dt: Option<f64>,
    camera_model: Option<String>,
}

pub struct EscalationEngine {
    settings: Settings,
}

impl EscalationEngine {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub fn run(&self, db: &Database) -> Result<EscalationOutcome> {
        let mut groups: BTreeMap<i64, Vec<MemberMeta>> = BTreeMap::new();
        for (group_id, file_id, role, size, exif_dt, camera_model) in
            db.members_for_escalation()?
        {
            groups.entry(group_id).or_default().push(MemberMeta {
                file_id,
                role,
                size,
                exif_dt,
                camera_model,
            });
        }

        let mut outcome = EscalationOutcome::default();
        for (group_id, members) in groups {
            outcome.groups_processed += 1;
            let Some(original) = members.iter().find(|m| m.role == MemberRole::Original) else {
                continue;
            };
            for member in members.iter().filter(|m| m.role == MemberRole::Duplicate) {
                outcome.duplicates_analyzed += 1;
                let criteria = self.evaluate(original, member);
                if criteria.all_met() {
                    db.set_member_role(
                        group_id,
                        member.file_id,
                        MemberRole::SafeDuplicate,
                        Some(&criteria.note()),
                    )?;
                    outcome.escalated += 1;
                    tracing::debug!(group_id, file_id = member.file_id, "escalated to safe duplicate");
                }
            }
        }

        tracing::info!(
            groups = outcome.groups_processed,
            analyzed = outcome.duplicates_analyzed,
            escalated = outcome.escalated,
            "escalation complete"
        );
        Ok(outcome)
    }

    fn evaluate(&self, original: &MemberMeta, duplicate: &MemberMeta) -> EscalationCriteria {
        EscalationCriteria {
            size_match: original.size == duplicate.size,
            time_match: self.time_match(original.exif_dt, duplicate.exif_dt),
            camera_match: self.camera_match(
                original.camera_model.as_deref(),
                duplicate.camera_model.as_deref(),
            ),
        }
    }

    /// Both present: within tolerance (inclusive). One missing: no match.
    /// Both missing: a match only outside strict-EXIF mode.
    fn time_match(&self, a: Option<f64>, b: Option<f64>) -> bool {
        match (a, b) {
            (Some(ta), Some(tb)) => (ta - tb).abs() <= self.settings.datetime_tolerance_seconds,
            (None, None) => !self.settings.strict_exif_datetime_match,
            _ => false,
        }
    }

    /// Disabled check passes everything. Both present: trimmed,
    /// case-insensitive equality. Both missing: match. One missing: no.
    fn camera_match(&self, a: Option<&str>, b: Option<&str>) -> bool {
        if !self.settings.enable_camera_model_check {
            return true;
        }
        match (a, b) {
            (Some(ma), Some(mb)) => ma.trim().eq_ignore_ascii_case(mb.trim()),
            (None, None) => true,
            _ => false,
        }
    }
}
