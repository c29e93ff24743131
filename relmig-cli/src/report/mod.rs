//! Reconciliation report for a migration run
//!
//! Built incrementally as tables finish, then finalised once: outcomes are
//! ordered by load position and totals are derived from them, so identical
//! inputs yield byte-identical output apart from `run_started_at`.

pub mod excel;

use anyhow::{Context, Result};
use csv::Writer;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;

use crate::error::ErrorClass;
use crate::loader::{LoadStatus, SkipReason};
use crate::repair::{DroppedRow, Placeholder};
use crate::sanitize::{Disambiguation, FlaggedRow, SanitizeStats};
use crate::schema::MissingColumn;

pub use excel::write_excel;

/// A classified problem recorded against a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub class: ErrorClass,
    pub message: String,
}

/// Everything recorded about one table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableOutcome {
    /// 1-based position in the planned load order
    pub position: usize,
    pub table: String,
    pub status: LoadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Human-readable reason for any status other than Succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Rows in the export, when it could be read
    pub source_rows: Option<u64>,
    pub rows_attempted: u64,
    pub rows_before: u64,
    pub rows_after: u64,
    /// Recount at run end, including placeholders added by later tables
    pub final_count: Option<u64>,
    pub attempts: u32,
    pub deferred: bool,
    pub added_columns: Vec<MissingColumn>,
    pub target_only_columns: Vec<String>,
    pub sanitize: SanitizeStats,
    pub disambiguated: Vec<Disambiguation>,
    pub flagged: Vec<FlaggedRow>,
    /// Rows found referencing missing parents
    pub orphans: u64,
    pub placeholders: Vec<Placeholder>,
    pub dropped: Vec<DroppedRow>,
    pub issues: Vec<Issue>,
}

impl TableOutcome {
    pub fn new(position: usize, table: &str) -> Self {
        Self {
            position,
            table: table.to_string(),
            status: LoadStatus::Pending,
            skip_reason: None,
            reason: None,
            source_rows: None,
            rows_attempted: 0,
            rows_before: 0,
            rows_after: 0,
            final_count: None,
            attempts: 0,
            deferred: false,
            added_columns: Vec::new(),
            target_only_columns: Vec::new(),
            sanitize: SanitizeStats::default(),
            disambiguated: Vec::new(),
            flagged: Vec::new(),
            orphans: 0,
            placeholders: Vec::new(),
            dropped: Vec::new(),
            issues: Vec::new(),
        }
    }

    /// Mark the table skipped
    pub fn skip(&mut self, reason: SkipReason, detail: impl Into<String>) {
        self.status = LoadStatus::Skipped;
        self.skip_reason = Some(reason);
        self.reason = Some(detail.into());
    }

    /// Mark the table failed and record the classified cause
    pub fn fail(&mut self, class: ErrorClass, detail: impl Into<String>) {
        let detail = detail.into();
        self.status = LoadStatus::Failed;
        self.reason = Some(detail.clone());
        self.issue(class, detail);
    }

    pub fn issue(&mut self, class: ErrorClass, message: impl Into<String>) {
        self.issues.push(Issue {
            class,
            message: message.into(),
        });
    }

    /// Net rows gained during the table's own load
    pub fn rows_moved(&self) -> i64 {
        self.rows_after as i64 - self.rows_before as i64
    }
}

/// Aggregate counters across tables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub tables: usize,
    pub succeeded: usize,
    pub warned: usize,
    pub failed: usize,
    pub skipped: usize,
    pub rows_moved: i64,
    pub columns_added: usize,
    pub orphans: u64,
    pub placeholders: usize,
    pub dropped_orphans: usize,
    pub flagged_rows: usize,
    pub disambiguated: usize,
}

/// Run-level verdict, also the process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Failure,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Failure => 1,
            RunStatus::Partial => 2,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failure => "failure",
        }
    }
}

/// The durable record of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationReport {
    pub target: String,
    pub run_started_at: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
    pub tables: Vec<TableOutcome>,
    pub totals: Totals,
}

impl ReconciliationReport {
    pub fn new(target: &str, run_started_at: &str) -> Self {
        Self {
            target: target.to_string(),
            run_started_at: run_started_at.to_string(),
            status: RunStatus::Success,
            fatal_error: None,
            tables: Vec::new(),
            totals: Totals::default(),
        }
    }

    /// Add or replace a table's outcome
    pub fn record(&mut self, outcome: TableOutcome) {
        match self.tables.iter_mut().find(|t| t.table == outcome.table) {
            Some(existing) => *existing = outcome,
            None => self.tables.push(outcome),
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableOutcome> {
        self.tables.iter().find(|t| t.table == name)
    }

    pub fn set_fatal(&mut self, message: impl Into<String>) {
        self.fatal_error = Some(message.into());
    }

    /// Order outcomes, compute totals and the run status
    pub fn finalize(&mut self) {
        self.tables.sort_by_key(|t| t.position);

        let mut totals = Totals {
            tables: self.tables.len(),
            ..Default::default()
        };
        for t in &self.tables {
            match t.status {
                LoadStatus::Succeeded => totals.succeeded += 1,
                LoadStatus::SucceededWithWarning => totals.warned += 1,
                LoadStatus::Failed => totals.failed += 1,
                LoadStatus::Skipped | LoadStatus::Pending | LoadStatus::Loading => {
                    totals.skipped += 1
                }
            }
            totals.rows_moved += t.rows_moved();
            totals.columns_added += t.added_columns.len();
            totals.orphans += t.orphans;
            totals.placeholders += t.placeholders.len();
            totals.dropped_orphans += t.dropped.len();
            totals.flagged_rows += t.flagged.len();
            totals.disambiguated += t.disambiguated.len();
        }

        self.status = if self.fatal_error.is_some() || totals.failed > 0 {
            RunStatus::Failure
        } else if totals.warned > 0 || totals.skipped > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Success
        };
        self.totals = totals;
    }

    /// Every placeholder in load order
    pub fn placeholders(&self) -> impl Iterator<Item = &Placeholder> {
        self.tables.iter().flat_map(|t| t.placeholders.iter())
    }

    /// Every dropped orphan in load order
    pub fn dropped(&self) -> impl Iterator<Item = &DroppedRow> {
        self.tables.iter().flat_map(|t| t.dropped.iter())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize report")
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        std::fs::write(path, json + "\n")
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
        log::info!("JSON report written to: {}", path.display());
        Ok(())
    }

    /// One CSV line per table
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = Writer::from_path(path)
            .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;

        wtr.write_record([
            "position",
            "table",
            "status",
            "reason",
            "source_rows",
            "rows_before",
            "rows_after",
            "final_count",
            "attempts",
            "deferred",
            "columns_added",
            "orphans",
            "placeholders",
            "dropped",
            "flagged",
        ])
        .context("Failed to write CSV header")?;

        for t in &self.tables {
            wtr.write_record([
                t.position.to_string(),
                t.table.clone(),
                t.status.label().to_string(),
                t.reason.clone().unwrap_or_default(),
                optional(t.source_rows),
                t.rows_before.to_string(),
                t.rows_after.to_string(),
                optional(t.final_count),
                t.attempts.to_string(),
                t.deferred.to_string(),
                t.added_columns.len().to_string(),
                t.orphans.to_string(),
                t.placeholders.len().to_string(),
                t.dropped.len().to_string(),
                t.flagged.len().to_string(),
            ])
            .with_context(|| format!("Failed to write row for {}", t.table))?;
        }

        wtr.flush().context("Failed to flush CSV writer")?;
        log::info!("CSV report written to: {}", path.display());
        Ok(())
    }

    /// Plain-text summary for the terminal
    pub fn summary_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Reconciliation report for {}", self.target);
        let _ = writeln!(out, "Started: {}", self.run_started_at);
        let _ = writeln!(out, "Status:  {}", self.status.label());
        if let Some(fatal) = &self.fatal_error {
            let _ = writeln!(out, "Fatal:   {}", fatal);
        }
        out.push('\n');

        let width = self
            .tables
            .iter()
            .map(|t| t.table.len())
            .max()
            .unwrap_or(5)
            .max(5);
        let _ = writeln!(
            out,
            "{:>3}  {:<width$}  {:<22}  {:>8}  {:>8}  {:>8}  reason",
            "#", "table", "status", "before", "after", "final"
        );
        for t in &self.tables {
            let _ = writeln!(
                out,
                "{:>3}  {:<width$}  {:<22}  {:>8}  {:>8}  {:>8}  {}",
                t.position,
                t.table,
                t.status.label(),
                t.rows_before,
                t.rows_after,
                optional(t.final_count),
                t.reason.as_deref().unwrap_or("")
            );
        }

        let totals = &self.totals;
        out.push('\n');
        let _ = writeln!(
            out,
            "Tables: {} succeeded, {} warned, {} failed, {} skipped",
            totals.succeeded, totals.warned, totals.failed, totals.skipped
        );
        let _ = writeln!(
            out,
            "Rows moved: {}  Columns added: {}",
            totals.rows_moved, totals.columns_added
        );
        let _ = writeln!(
            out,
            "Orphans: {} ({} placeholders, {} dropped)  Flagged for review: {}",
            totals.orphans, totals.placeholders, totals.dropped_orphans, totals.flagged_rows
        );
        out
    }
}

fn optional(value: Option<u64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(position: usize, table: &str, status: LoadStatus) -> TableOutcome {
        let mut t = TableOutcome::new(position, table);
        t.status = status;
        t
    }

    #[test]
    fn test_status_rules() {
        let mut report = ReconciliationReport::new("sqlite://t.db", "2024-01-01T00:00:00Z");
        report.record(outcome(1, "a", LoadStatus::Succeeded));
        report.finalize();
        assert_eq!(report.status, RunStatus::Success);

        report.record(outcome(2, "b", LoadStatus::Skipped));
        report.finalize();
        assert_eq!(report.status, RunStatus::Partial);
        assert_eq!(report.status.exit_code(), 2);

        report.record(outcome(3, "c", LoadStatus::Failed));
        report.finalize();
        assert_eq!(report.status, RunStatus::Failure);
        assert_eq!(report.totals.failed, 1);
    }

    #[test]
    fn test_fatal_error_fails_run() {
        let mut report = ReconciliationReport::new("t", "now");
        report.record(outcome(1, "a", LoadStatus::Succeeded));
        report.set_fatal("integrity gate failure: restore failed");
        report.finalize();
        assert_eq!(report.status, RunStatus::Failure);
        assert!(report.to_json().unwrap().contains("\"fatal_error\""));
    }

    #[test]
    fn test_finalize_orders_by_position() {
        let mut report = ReconciliationReport::new("t", "now");
        report.record(outcome(2, "child", LoadStatus::Succeeded));
        report.record(outcome(1, "parent", LoadStatus::Succeeded));
        report.finalize();

        let names: Vec<_> = report.tables.iter().map(|t| t.table.as_str()).collect();
        assert_eq!(names, vec!["parent", "child"]);
    }

    #[test]
    fn test_record_replaces_existing() {
        let mut report = ReconciliationReport::new("t", "now");
        report.record(outcome(1, "a", LoadStatus::Loading));
        report.record(outcome(1, "a", LoadStatus::Succeeded));
        assert_eq!(report.tables.len(), 1);
        assert_eq!(report.table("a").unwrap().status, LoadStatus::Succeeded);
    }

    #[test]
    fn test_json_is_reproducible() {
        let build = || {
            let mut report = ReconciliationReport::new("t", "2024-01-01T00:00:00Z");
            let mut t = outcome(1, "a", LoadStatus::SucceededWithWarning);
            t.rows_after = 3;
            t.issue(ErrorClass::SchemaDriftWarning, "added a.extra");
            report.record(t);
            report.finalize();
            report.to_json().unwrap()
        };
        assert_eq!(build(), build());
        assert!(build().contains("\"schema_drift_warning\""));
    }

    #[test]
    fn test_summary_and_csv() {
        let mut report = ReconciliationReport::new("t", "now");
        let mut t = outcome(1, "customer", LoadStatus::Skipped);
        t.skip(SkipReason::ArtifactEmpty, "artifact empty");
        report.record(t);
        report.finalize();

        let text = report.summary_text();
        assert!(text.contains("customer"));
        assert!(text.contains("artifact empty"));
        assert!(text.contains("Status:  partial"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        report.write_csv(&path).unwrap();
        let csv = std::fs::read_to_string(&path).unwrap();
        assert!(csv.starts_with("position,table,status"));
        assert!(csv.contains("1,customer,skipped,artifact empty"));
    }
}
