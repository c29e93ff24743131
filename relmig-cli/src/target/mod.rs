//! Target store abstraction
//!
//! The engine only ever reaches the database through [`TargetStore`]. This
//! module provides:
//! - The store trait and the small types it exchanges
//! - [`SqliteTarget`], the sqlx-backed implementation

#[cfg(test)]
pub mod faulty;
pub mod sqlite;
pub mod value;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::{ColumnDescriptor, ForeignKeyEdge, ReferentialAction};

pub use sqlite::SqliteTarget;
pub use value::SqlValue;

/// How the target treats rows that collide with an existing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictMode {
    /// Raise a write error
    #[default]
    Abort,
    /// Silently skip the colliding row
    Ignore,
}

/// A foreign key as declared in the live schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveForeignKey {
    /// Store-assigned constraint id, referenced by violations
    pub id: i64,
    pub parent: String,
    /// `(from_column, to_column)` pairs; `to_column` is `None` for the parent's primary key
    pub columns: Vec<(String, Option<String>)>,
    pub on_delete: ReferentialAction,
}

impl LiveForeignKey {
    pub fn is_composite(&self) -> bool {
        self.columns.len() > 1
    }

    /// Single-column form, `None` for composite keys
    pub fn as_edge(&self) -> Option<ForeignKeyEdge> {
        match self.columns.as_slice() {
            [(from, to)] => Some(ForeignKeyEdge {
                from_column: from.clone(),
                to_table: self.parent.clone(),
                to_column: to.clone(),
                on_delete: self.on_delete,
            }),
            _ => None,
        }
    }
}

/// One row reported by the integrity check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub rowid: i64,
    pub parent: String,
    /// Matches [`LiveForeignKey::id`]
    pub fk_id: i64,
}

/// Operations the migration engine needs from a relational target
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Short description for logs, e.g. the database path
    fn describe(&self) -> String;

    /// All user tables in the target
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Check if a table exists
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Live columns, with key and uniqueness flags filled in
    async fn columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>>;

    /// Live foreign keys of a table
    async fn foreign_keys(&self, table: &str) -> Result<Vec<LiveForeignKey>>;

    /// Add a nullable column; never removes or alters existing ones
    async fn add_column(&self, table: &str, column: &ColumnDescriptor) -> Result<()>;

    /// Turn referential-integrity enforcement on or off
    async fn set_integrity_enforcement(&self, enabled: bool) -> Result<()>;

    /// Whether referential-integrity enforcement is currently on
    async fn integrity_enforced(&self) -> Result<bool>;

    /// Get the row count for a table
    async fn row_count(&self, table: &str) -> Result<u64>;

    /// Insert a batch of rows as one statement, returning the row ids the
    /// store accepted. A failed call writes nothing.
    async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<SqlValue>],
        conflict: ConflictMode,
    ) -> Result<Vec<i64>>;

    /// Rows whose foreign keys reference missing parents
    async fn integrity_violations(&self, table: &str) -> Result<Vec<Violation>>;

    /// Read selected columns of one row
    async fn read_row(&self, table: &str, rowid: i64, columns: &[String])
    -> Result<Vec<SqlValue>>;

    /// Delete rows by row id
    async fn delete_rows(&self, table: &str, rowids: &[i64]) -> Result<u64>;

    /// Largest bind-parameter count a single statement may carry
    fn max_bind_params(&self) -> usize;
}
