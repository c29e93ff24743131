//! Table catalog: the static description of what gets migrated
//!
//! This module provides:
//! - Table, column and foreign-key descriptors
//! - Loading a hand-authored catalog from TOML
//! - Deriving a catalog from the live target schema
//! - Structural validation (missing references, undeclared columns)

pub mod file;
pub mod introspect;

use serde::{Deserialize, Serialize};

use crate::error::MigrationError;

pub use file::{load_catalog, parse_catalog, render_catalog};
pub use introspect::introspect_catalog;

/// Storage type of a column, as far as the migration cares
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ColumnType {
    Integer,
    Decimal,
    Boolean,
    Timestamp,
    Text,
    Blob,
    /// A declared type the engine has no special handling for
    Other(String),
}

impl ColumnType {
    /// Map a declared SQL type onto a column type.
    ///
    /// Follows SQLite's affinity rules, with boolean and timestamp split out
    /// because the sanitizer normalises those differently.
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.trim().to_ascii_uppercase();
        if upper.is_empty() {
            return ColumnType::Text;
        }
        if upper.contains("BOOL") {
            ColumnType::Boolean
        } else if upper.contains("INT") {
            ColumnType::Integer
        } else if upper.contains("DATE") || upper.contains("TIME") {
            ColumnType::Timestamp
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            ColumnType::Text
        } else if upper.contains("BLOB") {
            ColumnType::Blob
        } else if upper.contains("DEC")
            || upper.contains("NUMERIC")
            || upper.contains("REAL")
            || upper.contains("DOUB")
            || upper.contains("FLOA")
            || upper.contains("MONEY")
        {
            ColumnType::Decimal
        } else {
            ColumnType::Other(declared.trim().to_string())
        }
    }

    /// Type name used when adding a column to the target
    pub fn sql_type(&self) -> &str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Decimal => "DECIMAL",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Text => "TEXT",
            ColumnType::Blob => "BLOB",
            ColumnType::Other(s) => s,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Decimal => "decimal",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Text => "text",
            ColumnType::Blob => "blob",
            ColumnType::Other(s) => s,
        }
    }

    /// Whether values of this type can take a textual discriminator suffix
    pub fn is_textual(&self) -> bool {
        matches!(self, ColumnType::Text)
    }
}

impl From<String> for ColumnType {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "integer" => ColumnType::Integer,
            "decimal" => ColumnType::Decimal,
            "boolean" => ColumnType::Boolean,
            "timestamp" => ColumnType::Timestamp,
            "text" => ColumnType::Text,
            "blob" => ColumnType::Blob,
            _ => ColumnType::from_declared(&value),
        }
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.label().to_string()
    }
}

/// A column as declared in the catalog or read from the live target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    #[serde(rename = "type", default = "default_column_type")]
    pub column_type: ColumnType,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub has_default: bool,
}

impl ColumnDescriptor {
    /// A nullable column with no constraints
    pub fn nullable(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            primary_key: false,
            unique: false,
            has_default: false,
        }
    }

    /// Whether a row may omit this column on insert
    pub fn can_omit(&self) -> bool {
        self.nullable || self.has_default
    }

    /// Whether values must be distinct across rows
    pub fn is_unique_key(&self) -> bool {
        self.unique || self.primary_key
    }
}

fn default_column_type() -> ColumnType {
    ColumnType::Text
}

fn default_true() -> bool {
    true
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Action taken by the target when a referenced parent row is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    /// Parse the spelling used by `PRAGMA foreign_key_list`
    pub fn from_sql(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "RESTRICT" => ReferentialAction::Restrict,
            "CASCADE" => ReferentialAction::Cascade,
            "SET NULL" => ReferentialAction::SetNull,
            "SET DEFAULT" => ReferentialAction::SetDefault,
            _ => ReferentialAction::NoAction,
        }
    }
}

/// A foreign-key reference from one table's column to another table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKeyEdge {
    pub from_column: String,
    pub to_table: String,
    /// Referenced column; `None` means the parent's primary key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_column: Option<String>,
    #[serde(default)]
    pub on_delete: ReferentialAction,
}

impl ForeignKeyEdge {
    pub fn new(from_column: &str, to_table: &str, to_column: &str) -> Self {
        Self {
            from_column: from_column.to_string(),
            to_table: to_table.to_string(),
            to_column: Some(to_column.to_string()),
            on_delete: ReferentialAction::NoAction,
        }
    }

    /// Human-readable form, e.g. `order.customer_id -> customer.id`
    pub fn describe(&self, from_table: &str) -> String {
        format!(
            "{}.{} -> {}.{}",
            from_table,
            self.from_column,
            self.to_table,
            self.to_column.as_deref().unwrap_or("<primary key>")
        )
    }
}

/// What to do with child rows whose parent cannot be found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Synthesize a marked placeholder parent so the child survives
    #[default]
    Placeholder,
    /// Delete the child rows and record them as dropped
    Drop,
}

impl OrphanPolicy {
    pub fn label(&self) -> &'static str {
        match self {
            OrphanPolicy::Placeholder => "placeholder",
            OrphanPolicy::Drop => "drop",
        }
    }
}

impl std::str::FromStr for OrphanPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "placeholder" => Ok(OrphanPolicy::Placeholder),
            "drop" => Ok(OrphanPolicy::Drop),
            other => Err(format!(
                "unknown orphan policy '{}' (expected 'placeholder' or 'drop')",
                other
            )),
        }
    }
}

/// One table of the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<ColumnDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKeyEdge>,
    /// Per-table override of the configured orphan policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orphan_policy: Option<OrphanPolicy>,
    /// Descriptive column that carries the placeholder marker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder_column: Option<String>,
    /// Artifact file name relative to the export directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            orphan_policy: None,
            placeholder_column: None,
            artifact: None,
        }
    }

    pub fn with_column(mut self, column: ColumnDescriptor) -> Self {
        self.columns.push(column);
        self
    }

    pub fn with_foreign_key(mut self, edge: ForeignKeyEdge) -> Self {
        self.foreign_keys.push(edge);
        self
    }

    pub fn with_policy(mut self, policy: OrphanPolicy) -> Self {
        self.orphan_policy = Some(policy);
        self
    }

    /// Tables this one references, excluding itself, in declaration order
    pub fn referenced_tables(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for edge in &self.foreign_keys {
            if edge.to_table != self.name && !seen.contains(&edge.to_table.as_str()) {
                seen.push(edge.to_table.as_str());
            }
        }
        seen
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// The full set of tables taking part in a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub tables: Vec<TableDescriptor>,
}

impl Catalog {
    pub fn new(tables: Vec<TableDescriptor>) -> Self {
        Self { tables }
    }

    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// Check structural invariants that do not need the live target.
    ///
    /// Cycles are detected separately by the dependency graph builder.
    pub fn validate(&self) -> Result<(), MigrationError> {
        let mut seen = std::collections::HashSet::new();
        for table in &self.tables {
            if table.name.trim().is_empty() {
                return Err(MigrationError::Configuration(
                    "catalog contains a table with an empty name".to_string(),
                ));
            }
            if !seen.insert(table.name.as_str()) {
                return Err(MigrationError::Configuration(format!(
                    "table '{}' is declared more than once",
                    table.name
                )));
            }
        }

        for table in &self.tables {
            for edge in &table.foreign_keys {
                let Some(parent) = self.table(&edge.to_table) else {
                    return Err(MigrationError::Configuration(format!(
                        "missing catalog entry: {} references undeclared table '{}'",
                        table.name, edge.to_table
                    )));
                };

                if !table.columns.is_empty() && table.column(&edge.from_column).is_none() {
                    return Err(MigrationError::Configuration(format!(
                        "foreign key column '{}' is not declared on table '{}'",
                        edge.from_column, table.name
                    )));
                }

                if let Some(to_column) = &edge.to_column {
                    if !parent.columns.is_empty() && parent.column(to_column).is_none() {
                        return Err(MigrationError::Configuration(format!(
                            "foreign key {} targets undeclared column",
                            edge.describe(&table.name)
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}
