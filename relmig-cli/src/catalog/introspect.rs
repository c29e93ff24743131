//! Build a catalog from the live target schema

use anyhow::{Context, Result};

use super::{Catalog, TableDescriptor};
use crate::target::TargetStore;

/// Describe every table of the target as a catalog.
///
/// Composite foreign keys are left out: orphan repair works on single
/// columns, and the target still enforces them once integrity is restored.
pub async fn introspect_catalog(target: &dyn TargetStore) -> Result<Catalog> {
    let mut tables = Vec::new();

    for name in target.list_tables().await? {
        let mut table = TableDescriptor::new(name.clone());
        table.columns = target
            .columns(&name)
            .await
            .with_context(|| format!("Failed to read columns of {}", name))?;

        for fk in target
            .foreign_keys(&name)
            .await
            .with_context(|| format!("Failed to read foreign keys of {}", name))?
        {
            match fk.as_edge() {
                Some(edge) => table.foreign_keys.push(edge),
                None => log::warn!(
                    "{}: composite foreign key to {} is not tracked for repair",
                    name,
                    fk.parent
                ),
            }
        }
        tables.push(table);
    }

    let catalog = Catalog::new(tables);
    catalog.validate()?;
    log::debug!(
        "Introspected {} tables from {}",
        catalog.tables.len(),
        target.describe()
    );
    Ok(catalog)
}
