//! Hand-authored catalog files

use anyhow::{Context, Result};
use std::path::Path;

use super::Catalog;

/// Parse a catalog from TOML text and validate it
pub fn parse_catalog(text: &str) -> Result<Catalog> {
    let catalog: Catalog = toml::from_str(text).context("Failed to parse catalog TOML")?;
    catalog.validate()?;
    Ok(catalog)
}

/// Load a catalog from a TOML file
pub fn load_catalog(path: &Path) -> Result<Catalog> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read catalog file {}", path.display()))?;

    parse_catalog(&text).with_context(|| format!("Invalid catalog {}", path.display()))
}

/// Render a catalog as TOML
pub fn render_catalog(catalog: &Catalog) -> Result<String> {
    toml::to_string_pretty(catalog).context("Failed to serialize catalog")
}
