//! SQLite target store over sqlx

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::{ConflictMode, LiveForeignKey, SqlValue, TargetStore, Violation};
use crate::catalog::{ColumnDescriptor, ColumnType, ReferentialAction};
use crate::error::MigrationError;

/// SQLite's default SQLITE_MAX_VARIABLE_NUMBER since 3.32
const MAX_BIND_PARAMS: usize = 32766;

/// Row ids per `DELETE ... WHERE rowid IN (...)` statement
const DELETE_CHUNK: usize = 500;

/// Quote an identifier for interpolation into SQL text
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// File path behind a `sqlite:` URL, `None` for in-memory databases
pub fn database_path(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    let path = rest.split('?').next().unwrap_or(rest);

    if path.is_empty() || path == ":memory:" || path.starts_with("memory") {
        None
    } else {
        Some(PathBuf::from(path))
    }
}

/// A target database reached through a single pooled connection.
///
/// `PRAGMA foreign_keys` is per connection, so the pool is pinned to exactly
/// one connection that never idles out. Otherwise the gate could suspend
/// enforcement on one connection while the loader writes through another.
pub struct SqliteTarget {
    pool: SqlitePool,
    url: String,
}

impl SqliteTarget {
    /// Connect to an existing database
    pub async fn connect(url: &str, busy_timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| MigrationError::Configuration(format!("invalid target url '{}': {}", url, e)))?
            .busy_timeout(busy_timeout)
            .foreign_keys(true)
            .create_if_missing(false);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| {
                MigrationError::Configuration(format!("target unreachable '{}': {}", url, e))
            })?;

        log::debug!("Connected to target {}", url);

        Ok(Self {
            pool,
            url: url.to_string(),
        })
    }

    /// Fresh in-memory database, mainly for tests
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", Duration::from_secs(5)).await
    }

    /// Run a batch of raw SQL statements, e.g. a schema script
    pub async fn execute_script(&self, sql: &str) -> Result<()> {
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .context("Failed to execute SQL script")?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn unique_columns(&self, table: &str) -> Result<Vec<String>> {
        let indexes = sqlx::query(r#"SELECT name, "unique", origin FROM pragma_index_list(?)"#)
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list indexes")?;

        let mut unique = Vec::new();
        for index in indexes {
            let is_unique: i64 = index.try_get("unique")?;
            let origin: String = index.try_get("origin")?;
            if is_unique == 0 || origin == "pk" {
                continue;
            }

            let name: String = index.try_get("name")?;
            let columns: Vec<(Option<String>,)> =
                sqlx::query_as("SELECT name FROM pragma_index_info(?)")
                    .bind(&name)
                    .fetch_all(&self.pool)
                    .await
                    .context("Failed to read index columns")?;

            // Only single-column indexes can be disambiguated row by row
            if let [(Some(column),)] = columns.as_slice() {
                unique.push(column.clone());
            }
        }

        Ok(unique)
    }
}

#[async_trait]
impl TargetStore for SqliteTarget {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list tables")?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_one(&self.pool)
                .await
                .context("Failed to check table existence")?;

        Ok(count > 0)
    }

    async fn columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let rows = sqlx::query(
            r#"SELECT name, type, "notnull", dflt_value, pk FROM pragma_table_info(?) ORDER BY cid"#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to read columns of {}", table))?;

        let unique = self.unique_columns(table).await?;

        let mut columns = Vec::new();
        for row in rows {
            let name: String = row.try_get("name")?;
            let declared: String = row.try_get("type")?;
            let not_null: i64 = row.try_get("notnull")?;
            let default: Option<String> = row.try_get("dflt_value")?;
            let pk: i64 = row.try_get("pk")?;

            columns.push(ColumnDescriptor {
                unique: unique.iter().any(|u| u.eq_ignore_ascii_case(&name)),
                name,
                column_type: ColumnType::from_declared(&declared),
                nullable: not_null == 0,
                primary_key: pk > 0,
                has_default: default.is_some(),
            });
        }

        Ok(columns)
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<LiveForeignKey>> {
        let rows = sqlx::query(
            r#"SELECT id, seq, "table", "from", "to", on_delete
               FROM pragma_foreign_key_list(?)
               ORDER BY id, seq"#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to read foreign keys of {}", table))?;

        let mut by_id: BTreeMap<i64, LiveForeignKey> = BTreeMap::new();
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let parent: String = row.try_get("table")?;
            let from: String = row.try_get("from")?;
            let to: Option<String> = row.try_get("to")?;
            let on_delete: String = row.try_get("on_delete")?;

            by_id
                .entry(id)
                .or_insert_with(|| LiveForeignKey {
                    id,
                    parent,
                    columns: Vec::new(),
                    on_delete: ReferentialAction::from_sql(&on_delete),
                })
                .columns
                .push((from, to));
        }

        Ok(by_id.into_values().collect())
    }

    async fn add_column(&self, table: &str, column: &ColumnDescriptor) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_ident(table),
            quote_ident(&column.name),
            column.column_type.sql_type()
        );

        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to add column {}.{}", table, column.name))?;

        Ok(())
    }

    async fn set_integrity_enforcement(&self, enabled: bool) -> Result<()> {
        let sql = if enabled {
            "PRAGMA foreign_keys = ON"
        } else {
            "PRAGMA foreign_keys = OFF"
        };

        sqlx::query(sql)
            .execute(&self.pool)
            .await
            .context("Failed to toggle foreign key enforcement")?;

        Ok(())
    }

    async fn integrity_enforced(&self) -> Result<bool> {
        let (enabled,): (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&self.pool)
            .await
            .context("Failed to read foreign key enforcement")?;

        Ok(enabled == 1)
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let (count,): (i64,) = sqlx::query_as(&sql)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to count rows in {}", table))?;

        Ok(count.max(0) as u64)
    }

    async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<SqlValue>],
        conflict: ConflictMode,
    ) -> Result<Vec<i64>> {
        if rows.is_empty() || columns.is_empty() {
            return Ok(Vec::new());
        }

        let verb = match conflict {
            ConflictMode::Abort => "INSERT",
            ConflictMode::Ignore => "INSERT OR IGNORE",
        };
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "{} INTO {} ({}) ",
            verb,
            quote_ident(table),
            column_list
        ));

        builder.push_values(rows.iter(), |mut b, row| {
            for value in row {
                match value {
                    SqlValue::Null => {
                        b.push_bind(None::<String>);
                    }
                    SqlValue::Integer(i) => {
                        b.push_bind(*i);
                    }
                    SqlValue::Real(f) => {
                        b.push_bind(*f);
                    }
                    SqlValue::Text(s) => {
                        b.push_bind(s.clone());
                    }
                    SqlValue::Blob(v) => {
                        b.push_bind(v.clone());
                    }
                }
            }
        });

        // Ignored rows are not returned, so only rows this call wrote come back
        builder.push(" RETURNING rowid");

        let returned = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to insert {} rows into {}", rows.len(), table))?;

        returned
            .iter()
            .map(|row| row.try_get::<i64, _>(0).map_err(Into::into))
            .collect()
    }

    async fn integrity_violations(&self, table: &str) -> Result<Vec<Violation>> {
        let sql = format!("PRAGMA foreign_key_check({})", quote_ident(table));
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to check foreign keys of {}", table))?;

        let mut violations = Vec::new();
        for row in rows {
            // Columns: table, rowid, parent, fkid
            let rowid: Option<i64> = row.try_get(1)?;
            let parent: String = row.try_get(2)?;
            let fk_id: i64 = row.try_get(3)?;

            let Some(rowid) = rowid else {
                anyhow::bail!(
                    "table {} has no rowid; clear-then-reload is not supported for WITHOUT ROWID tables",
                    table
                );
            };

            violations.push(Violation {
                rowid,
                parent,
                fk_id,
            });
        }

        violations.sort_by_key(|v| (v.fk_id, v.rowid));
        Ok(violations)
    }

    async fn read_row(
        &self,
        table: &str,
        rowid: i64,
        columns: &[String],
    ) -> Result<Vec<SqlValue>> {
        if columns.is_empty() {
            return Ok(Vec::new());
        }

        let select = columns
            .iter()
            .map(|c| format!("typeof({0}), {0}", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM {} WHERE rowid = ?",
            select,
            quote_ident(table)
        );

        let row = sqlx::query(&sql)
            .bind(rowid)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to read row {} of {}", rowid, table))?;

        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            let kind: String = row.try_get(2 * i)?;
            let index = 2 * i + 1;
            let value = match kind.as_str() {
                "integer" => SqlValue::Integer(row.try_get_unchecked::<i64, _>(index)?),
                "real" => SqlValue::Real(row.try_get_unchecked::<f64, _>(index)?),
                "text" => SqlValue::Text(row.try_get_unchecked::<String, _>(index)?),
                "blob" => SqlValue::Blob(row.try_get_unchecked::<Vec<u8>, _>(index)?),
                _ => SqlValue::Null,
            };
            values.push(value);
        }

        Ok(values)
    }

    async fn delete_rows(&self, table: &str, rowids: &[i64]) -> Result<u64> {
        let mut deleted = 0;
        for chunk in rowids.chunks(DELETE_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "DELETE FROM {} WHERE rowid IN (",
                quote_ident(table)
            ));
            let mut separated = builder.separated(", ");
            for rowid in chunk {
                separated.push_bind(*rowid);
            }
            separated.push_unseparated(")");

            let result = builder
                .build()
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to delete rows from {}", table))?;
            deleted += result.rows_affected();
        }

        Ok(deleted)
    }

    fn max_bind_params(&self) -> usize {
        MAX_BIND_PARAMS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"
        CREATE TABLE parent (id INTEGER PRIMARY KEY, name TEXT NOT NULL, code TEXT UNIQUE);
        CREATE TABLE child (
            id INTEGER PRIMARY KEY,
            parent_id INTEGER REFERENCES parent(id) ON DELETE CASCADE,
            note TEXT DEFAULT 'n/a'
        );
    "#;

    async fn setup() -> SqliteTarget {
        let target = SqliteTarget::in_memory().await.unwrap();
        target.execute_script(SCHEMA).await.unwrap();
        target
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_database_path() {
        assert_eq!(
            database_path("sqlite://data/target.db"),
            Some(PathBuf::from("data/target.db"))
        );
        assert_eq!(
            database_path("sqlite:target.db?mode=rw"),
            Some(PathBuf::from("target.db"))
        );
        assert_eq!(database_path("sqlite::memory:"), None);
    }

    #[tokio::test]
    async fn test_columns_and_keys() {
        let target = setup().await;

        let columns = target.columns("parent").await.unwrap();
        let names: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name", "code"]);
        assert!(columns[0].primary_key);
        assert!(!columns[1].nullable);
        assert!(columns[2].unique);
        assert_eq!(columns[2].column_type, ColumnType::Text);

        let child = target.columns("child").await.unwrap();
        assert!(child[2].has_default);

        let fks = target.foreign_keys("child").await.unwrap();
        assert_eq!(fks.len(), 1);
        let edge = fks[0].as_edge().unwrap();
        assert_eq!(edge.to_table, "parent");
        assert_eq!(edge.to_column.as_deref(), Some("id"));
        assert_eq!(edge.on_delete, ReferentialAction::Cascade);
    }

    #[tokio::test]
    async fn test_enforcement_toggle() {
        let target = setup().await;
        assert!(target.integrity_enforced().await.unwrap());

        target.set_integrity_enforcement(false).await.unwrap();
        assert!(!target.integrity_enforced().await.unwrap());

        target.set_integrity_enforcement(true).await.unwrap();
        assert!(target.integrity_enforced().await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_returns_written_rowids() {
        let target = setup().await;
        let columns = vec!["id".to_string(), "name".to_string()];
        target
            .execute_script("INSERT INTO parent (id, name) VALUES (50, 'existing');")
            .await
            .unwrap();

        let written = target
            .insert_rows(
                "parent",
                &columns,
                &[
                    vec![SqlValue::Integer(2), SqlValue::Text("b".into())],
                    vec![SqlValue::Integer(3), SqlValue::Text("c".into())],
                ],
                ConflictMode::Abort,
            )
            .await
            .unwrap();
        let mut sorted = written.clone();
        sorted.sort();
        assert_eq!(sorted, vec![2, 3]);
        assert_eq!(target.row_count("parent").await.unwrap(), 3);

        assert_eq!(target.delete_rows("parent", &written).await.unwrap(), 2);
        assert_eq!(target.row_count("parent").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_insert_writes_nothing() {
        let target = setup().await;
        let columns = vec!["id".to_string(), "name".to_string()];

        // The second row violates NOT NULL, so the whole statement is undone
        let result = target
            .insert_rows(
                "parent",
                &columns,
                &[
                    vec![SqlValue::Integer(1), SqlValue::Text("a".into())],
                    vec![SqlValue::Integer(2), SqlValue::Null],
                ],
                ConflictMode::Abort,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(target.row_count("parent").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insert_conflict_modes() {
        let target = setup().await;
        let columns = vec!["id".to_string(), "name".to_string()];
        let row = vec![vec![SqlValue::Integer(1), SqlValue::Text("a".into())]];

        target
            .insert_rows("parent", &columns, &row, ConflictMode::Abort)
            .await
            .unwrap();

        let ignored = target
            .insert_rows("parent", &columns, &row, ConflictMode::Ignore)
            .await
            .unwrap();
        assert!(ignored.is_empty());

        assert!(
            target
                .insert_rows("parent", &columns, &row, ConflictMode::Abort)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_violations_and_row_access() {
        let target = setup().await;
        target.set_integrity_enforcement(false).await.unwrap();
        target
            .insert_rows(
                "child",
                &["id".to_string(), "parent_id".to_string()],
                &[vec![SqlValue::Integer(10), SqlValue::Integer(999)]],
                ConflictMode::Abort,
            )
            .await
            .unwrap();

        let violations = target.integrity_violations("child").await.unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].parent, "parent");
        assert_eq!(violations[0].rowid, 10);

        let values = target
            .read_row("child", 10, &["parent_id".to_string(), "note".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![SqlValue::Integer(999), SqlValue::Text("n/a".into())]);

        assert_eq!(target.delete_rows("child", &[10]).await.unwrap(), 1);
        assert!(target.integrity_violations("child").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_column_is_nullable() {
        let target = setup().await;
        let column = ColumnDescriptor::nullable("new_field", ColumnType::Text);
        target.add_column("parent", &column).await.unwrap();

        let columns = target.columns("parent").await.unwrap();
        let added = columns.iter().find(|c| c.name == "new_field").unwrap();
        assert!(added.nullable);
        assert_eq!(added.column_type, ColumnType::Text);
    }

    #[tokio::test]
    async fn test_unreachable_target_is_configuration_error() {
        let err = SqliteTarget::connect(
            "sqlite:///nonexistent/dir/target.db",
            Duration::from_millis(100),
        )
        .await
        .err()
        .unwrap();

        assert!(matches!(
            MigrationError::find(&err),
            Some(MigrationError::Configuration(_))
        ));
    }
}
