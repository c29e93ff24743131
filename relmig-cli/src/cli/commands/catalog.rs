//! `relmig catalog`

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use super::{CommonArgs, load_config, open_target};
use crate::catalog::{introspect_catalog, render_catalog};

#[derive(Args, Debug, Clone, Default)]
pub struct CatalogArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Write the catalog here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub async fn handle_catalog_command(args: CatalogArgs) -> Result<i32> {
    let config = load_config(&args.common)?;
    let target = open_target(&config).await?;

    let catalog = introspect_catalog(target.as_ref()).await?;
    let text = render_catalog(&catalog)?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, &text)
                .with_context(|| format!("Failed to write catalog to: {}", path.display()))?;
            log::info!("Catalog with {} tables written to {}", catalog.tables.len(), path.display());
        }
        None => print!("{}", text),
    }
    Ok(0)
}
