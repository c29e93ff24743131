//! Bulk loader: streams one table's rows into the target
//!
//! This module provides:
//! - [`LoadUnit`], a table's pending work and running outcome
//! - [`BulkLoader`], which writes batches through a bounded worker pool,
//!   joins every worker before finishing, and retries whole attempts after
//!   clearing their partial rows
//! - Load status and skip-reason types shared with the report

pub mod retry;
pub mod workers;

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinSet;

use crate::config::LoadConfig;
use crate::error::MigrationError;
use crate::target::{ConflictMode, SqlValue, TargetStore};

pub use retry::{RetryConfig, RetryPolicy};
pub use workers::WorkerLimiter;

/// Lifecycle of one table in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Pending,
    Loading,
    Succeeded,
    SucceededWithWarning,
    Failed,
    Skipped,
}

impl LoadStatus {
    pub fn label(&self) -> &'static str {
        match self {
            LoadStatus::Pending => "pending",
            LoadStatus::Loading => "loading",
            LoadStatus::Succeeded => "succeeded",
            LoadStatus::SucceededWithWarning => "succeeded_with_warning",
            LoadStatus::Failed => "failed",
            LoadStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, LoadStatus::Pending | LoadStatus::Loading)
    }
}

/// Why a table was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ArtifactAbsent,
    ArtifactEmpty,
    Unparseable,
    ParseError,
    DependencyFailed,
    Cancelled,
    /// A fatal error stopped the run before this table
    RunAborted,
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::ArtifactAbsent => "artifact absent",
            SkipReason::ArtifactEmpty => "artifact empty",
            SkipReason::Unparseable => "unparseable",
            SkipReason::ParseError => "parse error",
            SkipReason::DependencyFailed => "dependency failed",
            SkipReason::Cancelled => "run cancelled",
            SkipReason::RunAborted => "run aborted",
        }
    }

    /// Whether dependents of a table skipped for this reason must skip too.
    ///
    /// A missing or empty artifact means "no rows", which children can live
    /// with; anything else means the parent's data is unknown.
    pub fn blocks_dependents(&self) -> bool {
        !matches!(self, SkipReason::ArtifactAbsent | SkipReason::ArtifactEmpty)
    }
}

/// Shared flag set when the operator cancels the run
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Running outcome of one table's load
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub rows_before: u64,
    pub rows_after: u64,
    pub status: LoadStatus,
    pub error_detail: Option<String>,
}

impl Default for Outcome {
    fn default() -> Self {
        Self {
            rows_before: 0,
            rows_after: 0,
            status: LoadStatus::Pending,
            error_detail: None,
        }
    }
}

impl Outcome {
    /// Rows gained by the table during the load
    pub fn delta(&self) -> i64 {
        self.rows_after as i64 - self.rows_before as i64
    }

    /// Decide between Succeeded and SucceededWithWarning once a load and its
    /// repairs finished without error
    pub fn settle(&mut self, attempted: u64, dropped: u64, flagged: u64, placeholders: u64) {
        let mut warnings = Vec::new();
        let delta = self.delta();
        let expected = attempted.saturating_sub(dropped) as i64;

        if attempted > 0 && delta == 0 {
            warnings.push(format!(
                "{} rows attempted but row count unchanged (silently rejected)",
                attempted
            ));
        } else if delta < expected {
            warnings.push(format!(
                "{} of {} rows not accepted by the target",
                expected - delta,
                attempted
            ));
        }
        if dropped > 0 {
            warnings.push(format!("{} orphaned rows dropped", dropped));
        }
        if placeholders > 0 {
            warnings.push(format!("{} placeholder parents synthesized", placeholders));
        }
        if flagged > 0 {
            warnings.push(format!("{} rows withheld for manual review", flagged));
        }

        if warnings.is_empty() {
            self.status = LoadStatus::Succeeded;
        } else {
            self.status = LoadStatus::SucceededWithWarning;
            self.error_detail = Some(warnings.join("; "));
        }
    }
}

/// One table's pending work
#[derive(Debug)]
pub struct LoadUnit {
    pub table: Arc<str>,
    pub columns: Arc<Vec<String>>,
    pub batches: Vec<Arc<Vec<Vec<SqlValue>>>>,
    pub outcome: Outcome,
    pub attempts: u32,
    /// Export used `INSERT IGNORE`; colliding rows are skipped
    pub ignore_conflicts: bool,
    rows: u64,
    /// Row ids written by the current attempt, cleared on retry or deferral
    written: Vec<i64>,
}

impl LoadUnit {
    /// Split rows into batches of at most `batch_size` rows, capped so one
    /// statement stays under `max_bind_params`
    pub fn new(
        table: &str,
        columns: Vec<String>,
        rows: Vec<Vec<SqlValue>>,
        batch_size: usize,
        max_bind_params: usize,
    ) -> Self {
        let per_statement = (max_bind_params / columns.len().max(1)).max(1);
        let rows_per_batch = batch_size.clamp(1, per_statement);
        let total = rows.len() as u64;

        let mut batches = Vec::new();
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            let batch: Vec<Vec<SqlValue>> = rows.by_ref().take(rows_per_batch).collect();
            batches.push(Arc::new(batch));
        }

        Self {
            table: Arc::from(table),
            columns: Arc::new(columns),
            batches,
            outcome: Outcome::default(),
            attempts: 0,
            ignore_conflicts: false,
            rows: total,
            written: Vec::new(),
        }
    }

    /// Rows the loader will try to write
    pub fn rows_attempted(&self) -> u64 {
        self.rows
    }

    /// Row ids this unit has written and not yet cleared
    pub fn written_rowids(&self) -> &[i64] {
        &self.written
    }
}

/// Writes load units into the target
pub struct BulkLoader {
    target: Arc<dyn TargetStore>,
    limiter: WorkerLimiter,
    retry: RetryPolicy,
    conflict: ConflictMode,
    cancel: CancelFlag,
}

impl BulkLoader {
    pub fn new(target: Arc<dyn TargetStore>, config: &LoadConfig, cancel: CancelFlag) -> Self {
        Self {
            target,
            limiter: WorkerLimiter::new(config.workers),
            retry: RetryPolicy::new(config.retry.clone()),
            conflict: config.conflict,
            cancel,
        }
    }

    /// Record before-counts, entering Loading
    pub async fn begin(&self, unit: &mut LoadUnit) -> Result<()> {
        unit.outcome.rows_before = self.target.row_count(&unit.table).await?;
        unit.written.clear();
        unit.outcome.rows_after = unit.outcome.rows_before;
        unit.outcome.status = LoadStatus::Loading;
        log::info!(
            "Loading {} ({} rows in {} batches, {} rows present)",
            unit.table,
            unit.rows,
            unit.batches.len(),
            unit.outcome.rows_before
        );
        Ok(())
    }

    /// Write every batch, retrying whole attempts.
    ///
    /// Each failed attempt's rows are cleared before the next one, so the
    /// table never keeps a partial load. On final failure the error is
    /// returned with every row this unit wrote already deleted.
    pub async fn load(&self, unit: &mut LoadUnit) -> Result<u64> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            unit.attempts = attempt;

            let error = match self.attempt(unit).await {
                Ok(written) => {
                    log::debug!("{}: attempt {} wrote {} rows", unit.table, attempt, written);
                    return Ok(written);
                }
                Err(e) => e,
            };

            let cleared = self
                .clear_partial(unit)
                .await
                .with_context(|| format!("Failed to clear partial load of {}", unit.table))?;
            log::warn!(
                "{}: attempt {} failed: {:#} ({} partial rows cleared)",
                unit.table,
                attempt,
                error,
                cleared
            );

            if !self.retry.should_retry(attempt, &error) {
                unit.outcome.error_detail = Some(format!("{:#}", error));
                return Err(error);
            }

            let delay = self.retry.delay_for(attempt);
            log::info!("{}: retrying in {:?}", unit.table, delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// Delete exactly the rows this unit wrote; rows already in the table
    /// are never touched
    pub async fn clear_partial(&self, unit: &mut LoadUnit) -> Result<u64> {
        if unit.written.is_empty() {
            return Ok(0);
        }
        let cleared = self.target.delete_rows(&unit.table, &unit.written).await?;
        unit.written.clear();
        Ok(cleared)
    }

    /// Record after-counts
    pub async fn finish(&self, unit: &mut LoadUnit) -> Result<()> {
        unit.outcome.rows_after = self.target.row_count(&unit.table).await?;
        Ok(())
    }

    async fn attempt(&self, unit: &mut LoadUnit) -> Result<u64> {
        let mut workers = JoinSet::new();
        let mut cancelled = false;

        for (index, batch) in unit.batches.iter().enumerate() {
            let permit = self.limiter.acquire().await?;
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let target = self.target.clone();
            let table = unit.table.clone();
            let columns = unit.columns.clone();
            let batch = batch.clone();
            let conflict = if unit.ignore_conflicts {
                ConflictMode::Ignore
            } else {
                self.conflict
            };
            let cancel = self.cancel.clone();

            workers.spawn(async move {
                let _permit = permit;
                if cancel.is_cancelled() {
                    return Err(anyhow::Error::from(MigrationError::Cancelled));
                }
                log::debug!("{}: writing batch {} ({} rows)", table, index + 1, batch.len());
                target
                    .insert_rows(&table, &columns, &batch, conflict)
                    .await
                    .with_context(|| format!("batch {} of {}", index + 1, table))
            });
        }

        // Barrier: every spawned worker finishes before the attempt is judged
        let mut written = 0;
        let mut first_error: Option<anyhow::Error> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(rowids)) => {
                    written += rowids.len() as u64;
                    unit.written.extend(rowids);
                }
                Ok(Err(e)) => {
                    if matches!(MigrationError::find(&e), Some(MigrationError::Cancelled)) {
                        cancelled = true;
                    }
                    first_error.get_or_insert(e);
                }
                Err(join_error) => {
                    log::error!("{}: batch worker died: {}", unit.table, join_error);
                    first_error.get_or_insert(anyhow::anyhow!("batch worker panicked: {}", join_error));
                }
            }
        }

        if cancelled || self.cancel.is_cancelled() {
            return Err(MigrationError::Cancelled.into());
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }
}
