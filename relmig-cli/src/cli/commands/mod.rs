//! Subcommand handlers and the setup they share

pub mod catalog;
pub mod plan;
pub mod run;

use anyhow::Result;
use clap::Args;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::catalog::{Catalog, introspect_catalog, load_catalog};
use crate::config::Config;
use crate::target::SqliteTarget;

/// Flags every subcommand accepts
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Config file (defaults to ./relmig.toml when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Target database URL, e.g. sqlite://data/target.db
    #[arg(short, long)]
    pub target: Option<String>,
}

/// File, then environment, then command line
pub fn load_config(common: &CommonArgs) -> Result<Config> {
    let mut config = Config::load(common.config.as_deref())?;
    config.apply_env();
    if let Some(url) = &common.target {
        config.target.url = url.clone();
    }
    Ok(config)
}

pub async fn open_target(config: &Config) -> Result<Arc<SqliteTarget>> {
    let target = SqliteTarget::connect(&config.target.url, config.target.busy_timeout()).await?;
    Ok(Arc::new(target))
}

/// Catalog from an explicit path, the configured path, or the live schema
pub async fn resolve_catalog(
    config: &Config,
    explicit: Option<&Path>,
    target: &SqliteTarget,
) -> Result<Catalog> {
    match explicit.or(config.catalog.path.as_deref()) {
        Some(path) => load_catalog(path),
        None => {
            log::info!("No catalog given, introspecting the target schema");
            introspect_catalog(target).await
        }
    }
}
