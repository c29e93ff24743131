//! `relmig plan`

use anyhow::Result;
use clap::Args;
use colored::*;
use std::path::PathBuf;

use super::{CommonArgs, load_config, open_target, resolve_catalog};
use crate::catalog::load_catalog;
use crate::error::MigrationError;
use crate::graph::{DependencyCategory, DependencyGraph, PlanEntry};

#[derive(Args, Debug, Clone, Default)]
pub struct PlanArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Catalog TOML; the target schema is introspected when omitted
    #[arg(long)]
    pub catalog: Option<PathBuf>,
}

pub async fn handle_plan_command(args: PlanArgs) -> Result<i32> {
    let config = load_config(&args.common)?;

    let explicit = args.catalog.as_deref().or(config.catalog.path.as_deref());
    let catalog = match explicit {
        Some(path) => load_catalog(path)?,
        None => {
            let target = open_target(&config).await?;
            resolve_catalog(&config, None, &target).await?
        }
    };

    let graph = DependencyGraph::build(&catalog);
    let entries = graph
        .plan_entries()
        .map_err(|e| MigrationError::Configuration(e.to_string()))?;

    let reset_order = graph
        .delete_order()
        .map_err(|e| MigrationError::Configuration(e.to_string()))?;

    print!("{}", render_plan(&entries, &reset_order));
    Ok(0)
}

/// Numbered load order with each table's category and parents, followed by
/// the order in which to empty the target before a re-run
pub fn render_plan(entries: &[PlanEntry], reset_order: &[String]) -> String {
    let mut out = format!("Load order ({} tables):\n", entries.len());
    for entry in entries {
        let category = match entry.category {
            DependencyCategory::Standalone => entry.category.label().green(),
            DependencyCategory::Dependent => entry.category.label().cyan(),
            DependencyCategory::Junction => entry.category.label().magenta(),
        };
        out.push_str(&format!("{:>3}. {} [{}]", entry.position, entry.table.bold(), category));
        if !entry.depends_on.is_empty() {
            out.push_str(&format!(" depends on: {}", entry.depends_on.join(", ")));
        }
        if entry.self_referencing {
            out.push_str(&format!(" {}", "(self-referencing)".dimmed()));
        }
        out.push('\n');
    }
    if !reset_order.is_empty() {
        out.push_str(&format!("Reset order (children first): {}\n", reset_order.join(", ")));
    }
    out
}
