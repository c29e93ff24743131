//! `relmig run`

use anyhow::Result;
use clap::Args;
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;

use super::{CommonArgs, load_config, open_target, resolve_catalog};
use crate::artifact::DirectorySource;
use crate::catalog::OrphanPolicy;
use crate::config::Config;
use crate::engine::Engine;
use crate::loader::CancelFlag;
use crate::lock::RunLock;
use crate::report::{ReconciliationReport, RunStatus, write_excel};

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Catalog TOML; the target schema is introspected when omitted
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// Directory holding one artifact per table
    #[arg(short, long)]
    pub export_dir: Option<PathBuf>,

    /// Write the JSON report here
    #[arg(long)]
    pub report_json: Option<PathBuf>,

    /// Write the per-table CSV here
    #[arg(long)]
    pub report_csv: Option<PathBuf>,

    /// Write the Excel workbook here
    #[arg(long)]
    pub report_excel: Option<PathBuf>,

    /// Concurrent batch writers per table
    #[arg(long)]
    pub workers: Option<usize>,

    /// Rows per insert batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Default orphan policy: placeholder or drop
    #[arg(long)]
    pub policy: Option<OrphanPolicy>,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.export_dir {
            config.export.dir = dir.clone();
        }
        if let Some(path) = &self.report_json {
            config.report.json = Some(path.clone());
        }
        if let Some(path) = &self.report_csv {
            config.report.csv = Some(path.clone());
        }
        if let Some(path) = &self.report_excel {
            config.report.excel = Some(path.clone());
        }
        if let Some(workers) = self.workers {
            config.load.workers = workers.max(1);
        }
        if let Some(rows) = self.batch_size {
            config.load.batch_size = rows.max(1);
        }
        if let Some(policy) = self.policy {
            config.repair.default_policy = policy;
        }
    }
}

pub async fn handle_run_command(args: RunArgs) -> Result<i32> {
    let mut config = load_config(&args.common)?;
    args.apply(&mut config);

    let target = open_target(&config).await?;
    let _lock = match config.target.lock_path() {
        Some(path) => Some(RunLock::acquire(&path)?),
        None => None,
    };

    let catalog = resolve_catalog(&config, args.catalog.as_deref(), &target).await?;
    let source = Arc::new(DirectorySource::new(&config.export.dir, &config.export.extension));

    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received; stopping after in-flight batches");
            on_interrupt.cancel();
        }
    });

    let engine = Engine::new(target, source, catalog, config.clone())?.with_cancel(cancel);
    let started = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let report = engine.run(&started).await?;

    write_outputs(&report, &config)?;
    print_summary(&report);

    Ok(report.status.exit_code())
}

fn write_outputs(report: &ReconciliationReport, config: &Config) -> Result<()> {
    if let Some(path) = &config.report.json {
        report.write_json(path)?;
    }
    if let Some(path) = &config.report.csv {
        report.write_csv(path)?;
    }
    if let Some(path) = &config.report.excel {
        write_excel(report, path)?;
    }
    Ok(())
}

fn print_summary(report: &ReconciliationReport) {
    println!("{}", report.summary_text());

    let status = match report.status {
        RunStatus::Success => "SUCCESS".bright_green().bold(),
        RunStatus::Partial => "PARTIAL".yellow().bold(),
        RunStatus::Failure => "FAILURE".red().bold(),
    };
    println!("Run status: {}", status);
}
