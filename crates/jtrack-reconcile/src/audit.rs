//! Per-pass audit trail and the report files written from it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use jtrack_core::{EntityType, RecordId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::category::ScopeFilter;
use crate::error::ReconcileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassState {
    Idle,
    Scanning,
    Classifying,
    Planning,
    Applying,
    Reporting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassOutcome {
    Completed,
    PolicyGuard,
    StorageError,
    InvalidConfiguration,
    Cancelled,
}

impl PassOutcome {
    pub fn of(error: Option<&ReconcileError>) -> Self {
        match error {
            None => PassOutcome::Completed,
            Some(ReconcileError::PolicyGuardTriggered { .. }) => PassOutcome::PolicyGuard,
            Some(ReconcileError::Storage(_)) => PassOutcome::StorageError,
            Some(ReconcileError::InvalidConfiguration(_)) => PassOutcome::InvalidConfiguration,
            Some(ReconcileError::Cancelled) => PassOutcome::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skipped {
    pub count: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitAudit {
    pub label: String,
    /// Entity the found ids belong to; a backfill lists jobs and inserts applications.
    pub entity: EntityType,
    pub action: String,
    pub found: usize,
    pub repaired: u64,
    #[serde(default)]
    pub cascaded: BTreeMap<EntityType, u64>,
    #[serde(default)]
    pub skipped: Vec<Skipped>,
    /// Bounded preview of the affected ids.
    pub sample_ids: Vec<RecordId>,
    #[serde(default)]
    pub error: Option<String>,
}

impl UnitAudit {
    pub fn skipped_count(&self) -> usize {
        self.skipped.iter().map(|s| s.count).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub pass_id: Uuid,
    pub category: String,
    #[serde(default)]
    pub scope: ScopeFilter,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub states: Vec<PassState>,
    pub units: Vec<UnitAudit>,
    pub outcome: PassOutcome,
    #[serde(default)]
    pub error: Option<String>,
}

impl AuditSummary {
    pub fn found(&self) -> usize {
        self.units.iter().map(|u| u.found).sum()
    }

    pub fn repaired(&self) -> u64 {
        self.units.iter().map(|u| u.repaired).sum()
    }

    pub fn skipped(&self) -> usize {
        self.units.iter().map(UnitAudit::skipped_count).sum()
    }

    pub fn unit(&self, label: &str) -> Option<&UnitAudit> {
        self.units.iter().find(|u| u.label == label)
    }

    pub fn console_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "{} [{}] pass {}: found {}, repaired {}, skipped {} ({:?})",
            self.category,
            self.mode,
            self.pass_id,
            self.found(),
            self.repaired(),
            self.skipped(),
            self.outcome
        )];
        for unit in &self.units {
            let mut line = format!(
                "  {:<32} {:<8} found {:>5}  repaired {:>5}",
                unit.label, unit.action, unit.found, unit.repaired
            );
            for (entity, count) in &unit.cascaded {
                line.push_str(&format!("  +{count} {entity}"));
            }
            for skip in &unit.skipped {
                line.push_str(&format!("  skipped {} ({})", skip.count, skip.reason));
            }
            if !unit.sample_ids.is_empty() {
                line.push_str(&format!("  ids {:?}", unit.sample_ids));
            }
            lines.push(line);
            if let Some(error) = &unit.error {
                lines.push(format!("    error: {error}"));
            }
        }
        if let Some(error) = &self.error {
            lines.push(format!("error: {error}"));
        }
        lines
    }

    pub fn to_markdown(&self) -> String {
        let mut out = format!(
            "# Integrity Audit `{}`\n\n- Pass: `{}`\n- Mode: {}\n- Started: {}\n- Finished: {}\n- Outcome: {:?}\n",
            self.category, self.pass_id, self.mode, self.started_at, self.finished_at, self.outcome
        );
        if let Some(source) = &self.scope.source {
            out.push_str(&format!("- Source: `{source}`\n"));
        }
        if let Some(limit) = self.scope.limit {
            out.push_str(&format!("- Limit: {limit}\n"));
        }
        if let Some(error) = &self.error {
            out.push_str(&format!("- Error: {error}\n"));
        }
        out.push_str("\n## Units\n\n| unit | action | found | repaired | cascaded | skipped | sample ids |\n|---|---|---|---|---|---|---|\n");
        for unit in &self.units {
            let cascaded = unit
                .cascaded
                .iter()
                .map(|(entity, count)| format!("{entity}: {count}"))
                .collect::<Vec<_>>()
                .join(", ");
            let skipped = unit
                .skipped
                .iter()
                .map(|s| format!("{} ({})", s.count, s.reason))
                .collect::<Vec<_>>()
                .join(", ");
            let ids = unit
                .sample_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} | {} |\n",
                unit.label, unit.action, unit.found, unit.repaired, cascaded, skipped, ids
            ));
        }
        out.push_str(&format!(
            "\n## States\n\n{}\n",
            self.states
                .iter()
                .map(|s| format!("{s:?}"))
                .collect::<Vec<_>>()
                .join(" -> ")
        ));
        out
    }
}

/// Accumulates decisions while a pass runs; `finish` freezes them into a summary.
#[derive(Debug)]
pub struct AuditReporter {
    summary: AuditSummary,
    preview_limit: usize,
}

impl AuditReporter {
    pub fn new(
        pass_id: Uuid,
        category: &str,
        scope: ScopeFilter,
        mode: &str,
        started_at: DateTime<Utc>,
        preview_limit: usize,
    ) -> Self {
        Self {
            summary: AuditSummary {
                pass_id,
                category: category.to_string(),
                scope,
                mode: mode.to_string(),
                started_at,
                finished_at: started_at,
                states: vec![PassState::Idle],
                units: Vec::new(),
                outcome: PassOutcome::Completed,
                error: None,
            },
            preview_limit,
        }
    }

    pub fn pass_id(&self) -> Uuid {
        self.summary.pass_id
    }

    pub fn enter(&mut self, state: PassState) {
        self.summary.states.push(state);
    }

    pub fn state(&self) -> PassState {
        self.summary
            .states
            .last()
            .copied()
            .unwrap_or(PassState::Idle)
    }

    pub fn found(&mut self, label: &str, entity: EntityType, action: &str, ids: &BTreeSet<RecordId>) {
        let unit = UnitAudit {
            label: label.to_string(),
            entity,
            action: action.to_string(),
            found: ids.len(),
            repaired: 0,
            cascaded: BTreeMap::new(),
            skipped: Vec::new(),
            sample_ids: ids.iter().copied().take(self.preview_limit).collect(),
            error: None,
        };
        match self.summary.units.iter_mut().find(|u| u.label == label) {
            Some(existing) => *existing = unit,
            None => self.summary.units.push(unit),
        }
    }

    pub fn repaired(&mut self, label: &str, count: u64, cascaded: &BTreeMap<EntityType, u64>) {
        if let Some(unit) = self.unit_mut(label) {
            unit.repaired += count;
            for (entity, n) in cascaded {
                *unit.cascaded.entry(*entity).or_default() += n;
            }
        }
    }

    pub fn skipped(&mut self, label: &str, count: usize, reason: &str) {
        if count == 0 {
            return;
        }
        if let Some(unit) = self.unit_mut(label) {
            unit.skipped.push(Skipped {
                count,
                reason: reason.to_string(),
            });
        }
    }

    pub fn unit_error(&mut self, label: &str, error: &ReconcileError) {
        if let Some(unit) = self.unit_mut(label) {
            unit.error = Some(error.to_string());
        }
    }

    pub fn finish(mut self, error: Option<&ReconcileError>, finished_at: DateTime<Utc>) -> AuditSummary {
        if self.state() != PassState::Reporting {
            self.enter(PassState::Reporting);
        }
        self.enter(PassState::Idle);
        self.summary.outcome = PassOutcome::of(error);
        self.summary.error = error.map(ToString::to_string);
        self.summary.finished_at = finished_at;
        self.summary
    }

    fn unit_mut(&mut self, label: &str) -> Option<&mut UnitAudit> {
        self.summary.units.iter_mut().find(|u| u.label == label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifest {
    pub pass_id: Uuid,
    pub files: Vec<ReportFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportFile {
    pub name: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `<dir>/<pass_id>/audit.json`, `audit.md` and a checksum manifest.
pub async fn write_reports(dir: &Path, summary: &AuditSummary) -> anyhow::Result<PathBuf> {
    let pass_dir = dir.join(summary.pass_id.to_string());
    fs::create_dir_all(&pass_dir)
        .await
        .with_context(|| format!("creating {}", pass_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing audit summary")?;
    let markdown = summary.to_markdown().into_bytes();
    let mut files = Vec::new();
    for (name, bytes) in [("audit.json", json), ("audit.md", markdown)] {
        let path = pass_dir.join(name);
        fs::write(&path, &bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        files.push(ReportFile {
            name: name.to_string(),
            sha256: sha256_hex(&bytes),
            bytes: bytes.len() as u64,
        });
    }

    let manifest = ReportManifest {
        pass_id: summary.pass_id,
        files,
    };
    let manifest_path = pass_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(pass_dir)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reporter() -> AuditReporter {
        let started = Utc.with_ymd_and_hms(2025, 8, 25, 7, 41, 0).single().unwrap();
        AuditReporter::new(Uuid::new_v4(), "duplicates", ScopeFilter::default(), "auto-repair", started, 2)
    }

    #[test]
    fn sample_ids_are_bounded_by_preview_limit() {
        let mut audit = reporter();
        audit.found(
            "applications.job_id",
            EntityType::Application,
            "delete",
            &BTreeSet::from([4, 5, 6]),
        );
        audit.skipped("applications.job_id", 1, "already resolved");
        audit.skipped("applications.job_id", 0, "ignored");
        audit.repaired("applications.job_id", 2, &BTreeMap::from([(EntityType::ApplicationNote, 3)]));
        let summary = audit.finish(None, Utc::now());

        let unit = summary.unit("applications.job_id").expect("unit");
        assert_eq!(unit.sample_ids, vec![4, 5]);
        assert_eq!(unit.found, 3);
        assert_eq!(unit.skipped.len(), 1);
        assert_eq!(summary.repaired(), 2);
        assert_eq!(summary.outcome, PassOutcome::Completed);
        assert_eq!(summary.states, vec![PassState::Idle, PassState::Reporting, PassState::Idle]);
    }

    #[test]
    fn errors_set_the_outcome() {
        let summary = reporter().finish(Some(&ReconcileError::Cancelled), Utc::now());
        assert_eq!(summary.outcome, PassOutcome::Cancelled);
        assert_eq!(summary.error.as_deref(), Some("pass cancelled"));
        assert!(summary.console_lines().last().unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn reports_land_under_the_pass_id() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut audit = reporter();
        audit.found("jobs", EntityType::Job, "delete", &BTreeSet::from([9, 10]));
        let summary = audit.finish(None, Utc::now());

        let pass_dir = write_reports(tmp.path(), &summary).await.expect("write reports");
        assert_eq!(pass_dir, tmp.path().join(summary.pass_id.to_string()));

        let json = std::fs::read_to_string(pass_dir.join("audit.json")).expect("audit.json");
        let back: AuditSummary = serde_json::from_str(&json).expect("parse audit.json");
        assert_eq!(back, summary);

        let markdown = std::fs::read_to_string(pass_dir.join("audit.md")).expect("audit.md");
        assert!(markdown.contains("| jobs | delete | 2 | 0 |"));

        let manifest: ReportManifest = serde_json::from_str(
            &std::fs::read_to_string(pass_dir.join("manifest.json")).expect("manifest"),
        )
        .expect("parse manifest");
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].sha256, sha256_hex(json.as_bytes()));
    }
}
