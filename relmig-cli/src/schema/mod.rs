//! Schema reconciliation between an export header and the live target
//!
//! This module provides functions to:
//! - Compare export columns against live target columns (case-insensitive)
//! - Categorize columns as matched, missing from target, or target-only
//! - Infer a type for missing columns from an ordered name-rule table
//! - Add missing columns to the target, additively and nullable

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;

use crate::catalog::{ColumnDescriptor, ColumnType};
use crate::target::TargetStore;

/// A name-pattern rule that types a column the target does not have yet
pub struct TypeRule {
    pub name: &'static str,
    pattern: Regex,
    pub column_type: ColumnType,
}

impl TypeRule {
    fn new(name: &'static str, pattern: &str, column_type: ColumnType) -> Self {
        Self {
            name,
            pattern: Regex::new(pattern).expect("type rule pattern is a valid regex"),
            column_type,
        }
    }

    pub fn matches(&self, column: &str) -> bool {
        self.pattern.is_match(column)
    }
}

/// Ordered rule table; the first matching rule wins
pub static TYPE_RULES: Lazy<Vec<TypeRule>> = Lazy::new(|| {
    vec![
        TypeRule::new("identifier", r"(?i:^id$|_id$)|[a-z0-9]Id$", ColumnType::Integer),
        TypeRule::new(
            "timestamp",
            r"(?i)(_at|_on|_date|_time|timestamp)$",
            ColumnType::Timestamp,
        ),
        TypeRule::new("amount", r"(?i)(amount|value|price|total)$", ColumnType::Decimal),
        TypeRule::new("boolean", r"(?i)^(is|has|can|should)_", ColumnType::Boolean),
        TypeRule::new("text", r".*", ColumnType::Text),
    ]
});

/// Infer the type of a column from its name, returning the rule that decided
pub fn infer_column_type(column: &str) -> (ColumnType, &'static str) {
    TYPE_RULES
        .iter()
        .find(|rule| rule.matches(column))
        .map(|rule| (rule.column_type.clone(), rule.name))
        .unwrap_or((ColumnType::Text, "text"))
}

/// An export column found in the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchedColumn {
    /// Spelling used by the export header
    pub export_name: String,
    /// Spelling used by the target
    pub target_name: String,
}

/// An export column the target lacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingColumn {
    pub name: String,
    pub column_type: ColumnType,
    /// Name of the type rule that matched
    pub rule: &'static str,
}

/// Column-level comparison of one export header against the live schema
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaDiff {
    pub table: String,
    pub matched: Vec<MatchedColumn>,
    pub missing: Vec<MissingColumn>,
    /// Target columns the export does not mention; reported, never touched
    pub target_only: Vec<String>,
}

impl SchemaDiff {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty()
    }

    /// Target column names in export-header order, valid once missing
    /// columns have been added
    pub fn insert_columns(&self, export_columns: &[String]) -> Vec<String> {
        export_columns
            .iter()
            .map(|name| {
                self.matched
                    .iter()
                    .find(|m| &m.export_name == name)
                    .map(|m| m.target_name.clone())
                    .unwrap_or_else(|| name.clone())
            })
            .collect()
    }
}

/// Compare an export header against live columns
pub fn compare_schemas(
    table: &str,
    export_columns: &[String],
    live_columns: &[ColumnDescriptor],
) -> SchemaDiff {
    let live_map: HashMap<String, &ColumnDescriptor> = live_columns
        .iter()
        .map(|c| (c.name.to_lowercase(), c))
        .collect();

    let mut diff = SchemaDiff {
        table: table.to_string(),
        ..Default::default()
    };

    for name in export_columns {
        match live_map.get(&name.to_lowercase()) {
            Some(live) => diff.matched.push(MatchedColumn {
                export_name: name.clone(),
                target_name: live.name.clone(),
            }),
            None => {
                let (column_type, rule) = infer_column_type(name);
                diff.missing.push(MissingColumn {
                    name: name.clone(),
                    column_type,
                    rule,
                });
            }
        }
    }

    for live in live_columns {
        if !export_columns.iter().any(|c| c.eq_ignore_ascii_case(&live.name)) {
            diff.target_only.push(live.name.clone());
        }
    }

    diff
}

/// Outcome of reconciling one table
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub diff: SchemaDiff,
    /// Live columns after any additions
    pub columns: Vec<ColumnDescriptor>,
    /// Target column names to insert into, in export-header order
    pub insert_columns: Vec<String>,
}

/// Compare a header against the target and add every missing column.
///
/// Existing columns are never dropped, renamed or retyped.
pub async fn reconcile(
    target: &dyn TargetStore,
    table: &str,
    export_columns: &[String],
) -> Result<Reconciliation> {
    let live = target
        .columns(table)
        .await
        .with_context(|| format!("Failed to read live schema of {}", table))?;
    let diff = compare_schemas(table, export_columns, &live);

    for missing in &diff.missing {
        log::warn!(
            "SchemaDriftWarning: {}.{} missing from target; adding nullable {} column ({} rule)",
            table,
            missing.name,
            missing.column_type.label(),
            missing.rule
        );
        let column = ColumnDescriptor::nullable(missing.name.clone(), missing.column_type.clone());
        target.add_column(table, &column).await?;
    }

    if !diff.target_only.is_empty() {
        log::debug!(
            "{}: target-only columns left untouched: {}",
            table,
            diff.target_only.join(", ")
        );
    }

    let columns = if diff.missing.is_empty() {
        live
    } else {
        target.columns(table).await?
    };
    let insert_columns = diff.insert_columns(export_columns);

    Ok(Reconciliation {
        diff,
        columns,
        insert_columns,
    })
}
