//! Migration engine: drives every table through the load pipeline
//!
//! Per table, in dependency order:
//! 1. read and parse the export artifact
//! 2. reconcile the header against the live schema
//! 3. sanitize rows
//! 4. suspend integrity enforcement, bulk load, repair orphans, restore
//! 5. record the outcome
//!
//! Table-scoped failures are recorded and the run continues; configuration
//! and integrity-gate failures stop it.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::artifact::{ArtifactRead, ArtifactSource, DumpError, read_artifact};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::{ErrorClass, MigrationError};
use crate::gate::ConstraintGate;
use crate::graph::{DependencyGraph, PlanEntry};
use crate::loader::{BulkLoader, CancelFlag, LoadStatus, LoadUnit, SkipReason};
use crate::repair::{OrphanRepairer, RepairContext, RepairOutcome, WithheldKeys};
use crate::report::{ReconciliationReport, TableOutcome};
use crate::sanitize::Sanitizer;
use crate::schema;
use crate::target::TargetStore;

/// How a table left the pipeline
enum TableFlow {
    Done,
    Deferred { parent: String },
}

/// Mutable state shared across the tables of one run
struct RunState {
    queue: VecDeque<String>,
    pending: HashSet<String>,
    deferred: HashSet<String>,
    withheld: WithheldKeys,
}

pub struct Engine {
    target: Arc<dyn TargetStore>,
    source: Arc<dyn ArtifactSource>,
    catalog: Catalog,
    graph: DependencyGraph,
    config: Config,
    gate: ConstraintGate,
    cancel: CancelFlag,
}

impl Engine {
    /// Validate the catalog and build the dependency graph.
    ///
    /// Fails with a configuration error on an invalid or cyclic catalog.
    pub fn new(
        target: Arc<dyn TargetStore>,
        source: Arc<dyn ArtifactSource>,
        catalog: Catalog,
        config: Config,
    ) -> Result<Self> {
        catalog.validate()?;
        let graph = DependencyGraph::build(&catalog);
        graph
            .topological_sort()
            .map_err(|e| MigrationError::Configuration(e.to_string()))?;

        Ok(Self {
            gate: ConstraintGate::new(target.clone()),
            target,
            source,
            catalog,
            graph,
            config,
            cancel: CancelFlag::new(),
        })
    }

    /// Share an externally owned cancel flag (e.g. set by Ctrl-C)
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn gate(&self) -> &ConstraintGate {
        &self.gate
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Load order with dependency details
    pub fn plan(&self) -> Result<Vec<PlanEntry>> {
        self.graph
            .plan_entries()
            .map_err(|e| MigrationError::Configuration(e.to_string()).into())
    }

    /// Check every catalog table exists in the target
    pub async fn preflight(&self) -> Result<()> {
        for table in &self.catalog.tables {
            let exists = self
                .target
                .table_exists(&table.name)
                .await
                .with_context(|| format!("Failed to inspect target for {}", table.name))?;
            if !exists {
                return Err(MigrationError::Configuration(format!(
                    "catalog table '{}' does not exist in target {}",
                    table.name,
                    self.target.describe()
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Migrate every table and build the report.
    ///
    /// Configuration problems are returned as errors before anything is
    /// written. Once loading starts the run always yields a report; an
    /// integrity-gate failure is recorded as its `fatal_error`.
    pub async fn run(&self, run_started_at: &str) -> Result<ReconciliationReport> {
        let order = self
            .graph
            .load_order()
            .map_err(|e| MigrationError::Configuration(e.to_string()))?;
        self.preflight().await?;

        log::info!(
            "Migrating {} tables into {}",
            order.len(),
            self.target.describe()
        );

        let positions: HashMap<String, usize> = order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i + 1))
            .collect();
        let mut state = RunState {
            queue: order.iter().cloned().collect(),
            pending: order.iter().cloned().collect(),
            deferred: HashSet::new(),
            withheld: WithheldKeys::new(),
        };
        let mut report = ReconciliationReport::new(&self.target.describe(), run_started_at);
        let loader = BulkLoader::new(self.target.clone(), &self.config.load, self.cancel.clone());
        let repairer = OrphanRepairer::new(self.target.clone());
        let mut aborted = false;

        while let Some(table) = state.queue.pop_front() {
            state.pending.remove(&table);
            let mut outcome = TableOutcome::new(positions[&table], &table);
            outcome.deferred = state.deferred.contains(&table);

            if aborted {
                outcome.skip(SkipReason::RunAborted, "run aborted by a fatal error");
                report.record(outcome);
                continue;
            }
            if self.cancel.is_cancelled() {
                outcome.skip(SkipReason::Cancelled, "run cancelled");
                report.record(outcome);
                continue;
            }
            if let Some(reason) = self.blocked_by(&table, &report) {
                log::warn!("Skipping {}: {}", table, reason);
                outcome.skip(SkipReason::DependencyFailed, reason);
                report.record(outcome);
                continue;
            }

            log::info!("[{}/{}] {}", outcome.position, order.len(), table);
            match self
                .process_table(&table, &mut outcome, &loader, &repairer, &mut state)
                .await
            {
                Ok(TableFlow::Done) => {}
                Ok(TableFlow::Deferred { parent }) => {
                    self.defer(&table, &parent, &mut state);
                    continue;
                }
                Err(e) => {
                    if self.record_failure(&mut outcome, &e) {
                        report.set_fatal(format!("{:#}", e));
                        aborted = true;
                    }
                }
            }

            log::info!("{}: {}", table, outcome.status.label());
            report.record(outcome);
        }

        for outcome in &mut report.tables {
            match self.target.row_count(&outcome.table).await {
                Ok(count) => outcome.final_count = Some(count),
                Err(e) => log::warn!("Failed to recount {}: {:#}", outcome.table, e),
            }
        }

        report.finalize();
        log::info!("Run finished: {}", report.status.label());
        Ok(report)
    }

    /// Reason a table must skip because a catalog parent did not load
    fn blocked_by(&self, table: &str, report: &ReconciliationReport) -> Option<String> {
        for parent in self.graph.dependencies(table) {
            let Some(done) = report.table(parent) else {
                continue;
            };
            match done.status {
                LoadStatus::Failed => return Some(format!("dependency {} failed", parent)),
                LoadStatus::Skipped
                    if done.skip_reason.is_some_and(|r| r.blocks_dependents()) =>
                {
                    return Some(format!(
                        "dependency {} skipped ({})",
                        parent,
                        done.skip_reason.map(|r| r.label()).unwrap_or("unknown")
                    ));
                }
                _ => {}
            }
        }
        None
    }

    /// Record a table-level error; returns whether the run must stop
    fn record_failure(&self, outcome: &mut TableOutcome, error: &anyhow::Error) -> bool {
        let detail = format!("{:#}", error);
        match MigrationError::find(error) {
            Some(MigrationError::Cancelled) => {
                log::warn!("{}: cancelled, partial rows cleared", outcome.table);
                outcome.status = LoadStatus::Failed;
                outcome.reason = Some("run cancelled".to_string());
                false
            }
            Some(fatal @ (MigrationError::IntegrityGate(_) | MigrationError::Configuration(_))) => {
                log::error!("{}: {}", outcome.table, detail);
                let class = fatal.class().unwrap_or(ErrorClass::IntegrityGateFailure);
                outcome.fail(class, detail);
                true
            }
            _ => {
                log::error!("{}: load failed: {}", outcome.table, detail);
                outcome.fail(ErrorClass::ConstraintViolation, detail);
                false
            }
        }
    }

    /// Re-queue `table` and its pending dependents right after `parent`
    fn defer(&self, table: &str, parent: &str, state: &mut RunState) {
        let dependents: HashSet<&str> = self.graph.transitive_dependents(table).into_iter().collect();
        let moved: Vec<String> = state
            .queue
            .iter()
            .filter(|t| dependents.contains(t.as_str()))
            .cloned()
            .collect();
        state.queue.retain(|t| !dependents.contains(t.as_str()));

        let at = state
            .queue
            .iter()
            .position(|t| t == parent)
            .map(|i| i + 1)
            .unwrap_or(state.queue.len());
        for (offset, name) in std::iter::once(table.to_string()).chain(moved).enumerate() {
            state.queue.insert(at + offset, name);
        }

        state.pending.insert(table.to_string());
        state.deferred.insert(table.to_string());
        log::warn!("{}: deferred until after {}", table, parent);
    }

    async fn process_table(
        &self,
        table: &str,
        outcome: &mut TableOutcome,
        loader: &BulkLoader,
        repairer: &OrphanRepairer,
        state: &mut RunState,
    ) -> Result<TableFlow> {
        let descriptor = self
            .catalog
            .table(table)
            .with_context(|| format!("Table {} is not in the catalog", table))?;
        let present = self.target.row_count(table).await?;
        outcome.rows_before = present;
        outcome.rows_after = present;

        let location = self.source.locate(descriptor);
        let dump = match read_artifact(self.source.as_ref(), descriptor)? {
            ArtifactRead::Absent => {
                log::info!("{}: no artifact at {}", table, location);
                outcome.skip(SkipReason::ArtifactAbsent, format!("artifact absent: {}", location));
                return Ok(TableFlow::Done);
            }
            ArtifactRead::Empty => {
                log::info!("{}: artifact {} is empty", table, location);
                outcome.skip(SkipReason::ArtifactEmpty, format!("artifact empty: {}", location));
                return Ok(TableFlow::Done);
            }
            ArtifactRead::Invalid(err) => {
                log::warn!("{}: {} ({})", table, err, location);
                let reason = match err {
                    DumpError::Header(_) => SkipReason::Unparseable,
                    DumpError::Body(_) | DumpError::Encoding { .. } => SkipReason::ParseError,
                };
                outcome.issue(ErrorClass::ParseError, err.to_string());
                outcome.skip(reason, format!("{}: {}", reason.label(), err));
                return Ok(TableFlow::Done);
            }
            ArtifactRead::Parsed(dump) => dump,
        };
        outcome.source_rows = Some(dump.rows.len() as u64);

        let reconciled = schema::reconcile(self.target.as_ref(), table, &dump.columns).await?;
        for added in &reconciled.diff.missing {
            outcome.issue(
                ErrorClass::SchemaDriftWarning,
                format!(
                    "added nullable {} column {}.{} ({} rule)",
                    added.column_type.label(),
                    table,
                    added.name,
                    added.rule
                ),
            );
        }
        outcome.added_columns = reconciled.diff.missing.clone();
        outcome.target_only_columns = reconciled.diff.target_only.clone();

        let sanitizer = Sanitizer::new(&reconciled.insert_columns, &reconciled.columns, Some(descriptor));
        let clean = sanitizer.sanitize(&dump.rows);
        for flagged in &clean.flagged {
            outcome.issue(
                ErrorClass::ConstraintViolation,
                format!(
                    "row {} withheld for manual review: {}={} ({})",
                    flagged.row, flagged.column, flagged.value, flagged.reason
                ),
            );
        }
        outcome.sanitize = clean.stats.clone();
        outcome.disambiguated = clean.disambiguated.clone();
        outcome.flagged = clean.flagged.clone();
        if !clean.withheld_keys.is_empty() {
            state.withheld.insert(table.to_string(), clean.withheld_keys.clone());
        }

        let mut unit = LoadUnit::new(
            table,
            reconciled.insert_columns.clone(),
            clean.rows,
            self.config.load.batch_size,
            self.target.max_bind_params(),
        );
        unit.ignore_conflicts = dump.ignore;
        outcome.rows_attempted = unit.rows_attempted();

        let policy = descriptor
            .orphan_policy
            .unwrap_or(self.config.repair.default_policy);
        let ctx = RepairContext {
            table,
            policy,
            catalog: &self.catalog,
            graph: &self.graph,
            pending: &state.pending,
            may_defer: !state.deferred.contains(table),
            withheld: &state.withheld,
        };

        let unit_ref = &mut unit;
        let outcome_ref = &mut *outcome;
        let ctx_ref = &ctx;
        self.gate
            .scoped(table, move || {
                self.load_and_repair(unit_ref, outcome_ref, loader, repairer, ctx_ref)
            })
            .await
    }

    /// The part of a table's pipeline that runs with enforcement suspended
    async fn load_and_repair(
        &self,
        unit: &mut LoadUnit,
        outcome: &mut TableOutcome,
        loader: &BulkLoader,
        repairer: &OrphanRepairer,
        ctx: &RepairContext<'_>,
    ) -> Result<TableFlow> {
        loader.begin(unit).await?;
        outcome.rows_before = unit.outcome.rows_before;

        let loaded = loader.load(unit).await;
        outcome.attempts = unit.attempts;
        loaded?;

        let summary = match repairer.repair(ctx).await {
            Ok(RepairOutcome::Clean) => None,
            Ok(RepairOutcome::Deferred { parent }) => {
                loader.clear_partial(unit).await?;
                return Ok(TableFlow::Deferred { parent });
            }
            Ok(RepairOutcome::Repaired(summary)) => Some(summary),
            Err(e) => {
                let cleared = loader.clear_partial(unit).await?;
                log::error!("{}: unresolved violations, {} rows cleared", ctx.table, cleared);
                return Err(e);
            }
        };

        if let Some(summary) = summary {
            for p in &summary.placeholders {
                outcome.issue(
                    ErrorClass::ConstraintViolation,
                    format!(
                        "placeholder synthesized for {}.{}={} (referenced by {}.{})",
                        p.parent, p.key_column, p.key, p.child, p.child_column
                    ),
                );
            }
            for d in &summary.dropped {
                outcome.issue(
                    ErrorClass::ConstraintViolation,
                    format!(
                        "row {} dropped ({}={} -> {}): {}",
                        d.rowid, d.column, d.key, d.parent, d.reason
                    ),
                );
            }
            outcome.orphans = summary.orphans;
            outcome.placeholders = summary.placeholders;
            outcome.dropped = summary.dropped;
        }

        loader.finish(unit).await?;
        unit.outcome.settle(
            unit.rows_attempted(),
            outcome.dropped.len() as u64,
            outcome.flagged.len() as u64,
            outcome.placeholders.len() as u64,
        );

        outcome.rows_after = unit.outcome.rows_after;
        outcome.status = unit.outcome.status;
        outcome.reason = unit.outcome.error_detail.clone();
        Ok(TableFlow::Done)
    }
}
