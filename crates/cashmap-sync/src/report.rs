//! Per-run report artifacts under `reports/<run_id>/`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cashmap_adapters::{Termination, UnitCheckpoint, UnitOutcome, UnitStatus};
use cashmap_core::Device;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::merge::MergeSummary;

pub const RUN_REPORT_FILE: &str = "run_report.json";
pub const DAILY_BRIEF_FILE: &str = "daily_brief.md";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every unit completed and the snapshot was published.
    Completed,
    /// Some units failed, were blocked or timed out; the rest was merged.
    Partial,
    Cancelled,
    /// The merge aborted; the store and snapshot were left as they were.
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        }
    }
}

/// Bounded list of error messages; anything past `limit` is only counted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSamples {
    pub limit: usize,
    pub samples: Vec<String>,
    pub truncated: usize,
}

impl ErrorSamples {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn push(&mut self, message: impl Into<String>) {
        if self.samples.len() < self.limit {
            self.samples.push(message.into());
        } else {
            self.truncated += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.samples.len() + self.truncated
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTally {
    pub units_ok: usize,
    pub units_failed: usize,
    pub units_blocked: usize,
    pub units_timed_out: usize,
    pub units_cancelled: usize,
    pub pages_fetched: u32,
    pub pages_skipped: u32,
    pub records: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    pub source: String,
    pub category: String,
    pub status: UnitStatus,
    pub records: usize,
    pub pages_fetched: u32,
    pub pages_skipped: u32,
    pub network_failures: u32,
    pub terminations: Vec<(Device, Termination)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<UnitCheckpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub path: String,
    pub version: String,
    pub total_campaigns: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub units: Vec<UnitReport>,
    pub raw_records: usize,
    pub normalized_records: usize,
    /// Raw records whose link could not be turned into a destination URL.
    pub dropped_records: usize,
    pub unique_records: usize,
    pub collapsed_duplicates: usize,
    pub parse_ambiguities: usize,
    pub ambiguity_samples: ErrorSamples,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotInfo>,
    pub sources: BTreeMap<String, SourceTally>,
    pub errors: ErrorSamples,
}

impl RunReport {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, sample_limit: usize) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: None,
            status: RunStatus::Completed,
            units: Vec::new(),
            raw_records: 0,
            normalized_records: 0,
            dropped_records: 0,
            unique_records: 0,
            collapsed_duplicates: 0,
            parse_ambiguities: 0,
            ambiguity_samples: ErrorSamples::new(sample_limit),
            merge: None,
            snapshot: None,
            sources: BTreeMap::new(),
            errors: ErrorSamples::new(sample_limit),
        }
    }

    pub fn record_unit(&mut self, outcome: &UnitOutcome) {
        let tally = self.sources.entry(outcome.source.clone()).or_default();
        match outcome.status {
            UnitStatus::Completed => tally.units_ok += 1,
            UnitStatus::Failed => tally.units_failed += 1,
            UnitStatus::Blocked => tally.units_blocked += 1,
            UnitStatus::TimedOut => tally.units_timed_out += 1,
            UnitStatus::Cancelled => tally.units_cancelled += 1,
        }
        tally.pages_fetched += outcome.pages_fetched;
        tally.pages_skipped += outcome.pages_skipped;
        tally.records += outcome.records.len();
        self.raw_records += outcome.records.len();

        for error in &outcome.errors {
            self.errors
                .push(format!("{}/{}: {error}", outcome.source, outcome.category));
        }
        self.units.push(UnitReport {
            source: outcome.source.clone(),
            category: outcome.category.clone(),
            status: outcome.status,
            records: outcome.records.len(),
            pages_fetched: outcome.pages_fetched,
            pages_skipped: outcome.pages_skipped,
            network_failures: outcome.network_failures,
            terminations: outcome.terminations.clone(),
            checkpoint: outcome.checkpoint.clone(),
        });
    }

    pub fn units_completed(&self) -> usize {
        self.units
            .iter()
            .filter(|u| u.status == UnitStatus::Completed)
            .count()
    }

    /// Status from unit outcomes alone; a merge failure overrides it.
    pub fn settle_status(&mut self) {
        self.status = if self.units.iter().any(|u| u.status == UnitStatus::Cancelled) {
            RunStatus::Cancelled
        } else if self.units_completed() == self.units.len() {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        };
    }
}

pub fn render_daily_brief(report: &RunReport) -> String {
    let mut out = format!(
        "# Cashmap Daily Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Status: {}\n- Units completed: {}/{}\n- Raw records: {}\n- Unique campaigns: {} ({} duplicates collapsed, {} dropped)\n- Parse ambiguities: {}\n",
        report.run_id,
        report.started_at,
        report
            .finished_at
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string()),
        report.status.as_str(),
        report.units_completed(),
        report.units.len(),
        report.raw_records,
        report.unique_records,
        report.collapsed_duplicates,
        report.dropped_records,
        report.parse_ambiguities,
    );

    if let Some(merge) = &report.merge {
        out.push_str(&format!(
            "\n## Merge\n- inserted: {}\n- updated: {}\n- reactivated: {}\n- misses counted: {}\n- deactivated: {}\n- unchanged: {}\n- writes: {}\n",
            merge.inserted,
            merge.updated,
            merge.reactivated,
            merge.miss_incremented,
            merge.deactivated,
            merge.unchanged,
            merge.writes,
        ));
    }
    if let Some(snapshot) = &report.snapshot {
        out.push_str(&format!(
            "\n## Snapshot\n- path: `{}`\n- campaigns: {}\n- version: `{}`\n",
            snapshot.path, snapshot.total_campaigns, snapshot.version
        ));
    }

    out.push_str("\n## Sources\n");
    for (source, tally) in &report.sources {
        out.push_str(&format!(
            "- {source}: {} ok, {} failed, {} blocked, {} timed out, {} cancelled; {} pages, {} skipped, {} records\n",
            tally.units_ok,
            tally.units_failed,
            tally.units_blocked,
            tally.units_timed_out,
            tally.units_cancelled,
            tally.pages_fetched,
            tally.pages_skipped,
            tally.records,
        ));
    }

    if report.errors.total() > 0 {
        out.push_str("\n## Errors\n");
        for error in &report.errors.samples {
            out.push_str(&format!("- {error}\n"));
        }
        if report.errors.truncated > 0 {
            out.push_str(&format!("- ... {} more\n", report.errors.truncated));
        }
    }
    out
}

/// Write `run_report.json` and `daily_brief.md`; returns the run's report directory.
pub async fn write_run_report(workspace_root: &Path, report: &RunReport) -> Result<PathBuf> {
    let reports_dir = workspace_root
        .join("reports")
        .join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join(DAILY_BRIEF_FILE), render_daily_brief(report))
        .await
        .context("writing daily_brief.md")?;

    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(reports_dir.join(RUN_REPORT_FILE), json)
        .await
        .context("writing run_report.json")?;

    Ok(reports_dir)
}

/// Summarize the latest `runs` reports, newest first.
pub fn report_daily_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut lines = vec!["# Cashmap Run Reports".to_string(), String::new()];
    if !reports_root.exists() {
        lines.push("_no runs recorded_".to_string());
        return Ok(lines.join("\n"));
    }

    let mut reports = Vec::new();
    for entry in std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
    {
        let path = entry.path().join(RUN_REPORT_FILE);
        if !path.exists() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let report: RunReport =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        reports.push((entry.path(), report));
    }
    reports.sort_by(|a, b| b.1.started_at.cmp(&a.1.started_at));

    for (dir, report) in reports.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", report.run_id));
        lines.push(format!("- started: {}", report.started_at));
        lines.push(format!("- status: {}", report.status.as_str()));
        lines.push(format!(
            "- units: {}/{} completed",
            report.units_completed(),
            report.units.len()
        ));
        lines.push(format!("- unique campaigns: {}", report.unique_records));
        if let Some(merge) = &report.merge {
            lines.push(format!(
                "- merge: +{} ~{} ↺{} -{} ({} writes)",
                merge.inserted, merge.updated, merge.reactivated, merge.deactivated, merge.writes
            ));
        }
        if let Some(snapshot) = &report.snapshot {
            lines.push(format!(
                "- snapshot: {} campaigns, version `{}`",
                snapshot.total_campaigns, snapshot.version
            ));
        }
        lines.push(format!("- errors: {}", report.errors.total()));
        let brief = dir.join(DAILY_BRIEF_FILE);
        if brief.exists() {
            lines.push(format!("- daily brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn outcome(source: &str, status: UnitStatus, errors: usize) -> UnitOutcome {
        UnitOutcome {
            source: source.into(),
            category: "shopping".into(),
            unit_index: 0,
            status,
            records: Vec::new(),
            pages_fetched: 2,
            pages_skipped: 0,
            network_failures: 0,
            terminations: vec![(Device::Pc, Termination::NoResults)],
            checkpoint: None,
            errors: (0..errors).map(|i| format!("error {i}")).collect(),
        }
    }

    fn report(started: DateTime<Utc>) -> RunReport {
        let mut report = RunReport::new(Uuid::new_v4(), started, 2);
        report.record_unit(&outcome("chobirich", UnitStatus::Completed, 0));
        report.record_unit(&outcome("moppy", UnitStatus::Blocked, 3));
        report.settle_status();
        report.finished_at = Some(started);
        report
    }

    #[test]
    fn error_samples_are_bounded() {
        let report = report(Utc::now());
        assert_eq!(report.errors.samples.len(), 2);
        assert_eq!(report.errors.truncated, 1);
        assert_eq!(report.errors.total(), 3);
    }

    #[test]
    fn status_reflects_unit_outcomes() {
        let mut report = report(Utc::now());
        assert_eq!(report.status, RunStatus::Partial);
        assert_eq!(report.sources["moppy"].units_blocked, 1);
        assert_eq!(report.sources["chobirich"].pages_fetched, 2);

        report.record_unit(&outcome("moppy", UnitStatus::Cancelled, 0));
        report.settle_status();
        assert_eq!(report.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn writes_artifacts_and_summarizes_latest_runs() {
        let dir = tempfile::tempdir().unwrap();
        let older = report(Utc.with_ymd_and_hms(2026, 6, 1, 6, 0, 0).unwrap());
        let newer = report(Utc.with_ymd_and_hms(2026, 6, 2, 6, 0, 0).unwrap());
        write_run_report(dir.path(), &older).await.unwrap();
        let reports_dir = write_run_report(dir.path(), &newer).await.unwrap();

        let brief = std::fs::read_to_string(reports_dir.join(DAILY_BRIEF_FILE)).unwrap();
        assert!(brief.contains("Units completed: 1/2"));
        assert!(brief.contains("... 1 more"));

        let md = report_daily_markdown(1, Some(dir.path().to_path_buf())).unwrap();
        assert!(md.contains(&newer.run_id.to_string()));
        assert!(!md.contains(&older.run_id.to_string()));
    }

    #[test]
    fn missing_reports_directory_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let md = report_daily_markdown(3, Some(dir.path().to_path_buf())).unwrap();
        assert!(md.contains("no runs recorded"));
    }
}
