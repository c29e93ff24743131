//! End-to-end migrations against a real SQLite target and export directory

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;

use relmig::artifact::DirectorySource;
use relmig::catalog::{Catalog, ColumnDescriptor, OrphanPolicy, introspect_catalog, parse_catalog};
use relmig::config::{Config, LoadConfig};
use relmig::loader::{CancelFlag, LoadStatus, SkipReason};
use relmig::repair::{PLACEHOLDER_MARKER, REASON_IRRECOVERABLE, REASON_WITHHELD};
use relmig::target::{ConflictMode, LiveForeignKey, SqlValue, SqliteTarget, TargetStore, Violation};
use relmig::{Engine, ErrorClass, MigrationError, ReconciliationReport, RunStatus};

const STARTED: &str = "2024-01-01T00:00:00Z";

const FAMILY_SCHEMA: &str = r#"
    CREATE TABLE parent (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
    CREATE TABLE child (
        id INTEGER PRIMARY KEY,
        parent_id INTEGER NOT NULL REFERENCES parent(id),
        label TEXT
    );
    CREATE TABLE grandchild (
        id INTEGER PRIMARY KEY,
        child_id INTEGER REFERENCES child(id),
        note TEXT
    );
"#;

struct Fixture {
    export: TempDir,
    target: Arc<SqliteTarget>,
}

impl Fixture {
    async fn new(schema: &str) -> Self {
        let target = SqliteTarget::in_memory().await.unwrap();
        target.execute_script(schema).await.unwrap();
        Self {
            export: tempfile::tempdir().unwrap(),
            target: Arc::new(target),
        }
    }

    fn write(&self, table: &str, text: &str) {
        std::fs::write(self.export.path().join(format!("{}.sql", table)), text).unwrap();
    }

    fn source(&self) -> Arc<DirectorySource> {
        Arc::new(DirectorySource::new(self.export.path(), "sql"))
    }

    async fn catalog(&self) -> Catalog {
        introspect_catalog(self.target.as_ref()).await.unwrap()
    }

    async fn engine(&self, config: Config) -> Engine {
        Engine::new(self.target.clone(), self.source(), self.catalog().await, config).unwrap()
    }

    async fn run(&self, config: Config) -> ReconciliationReport {
        self.engine(config).await.run(STARTED).await.unwrap()
    }

    async fn count(&self, table: &str) -> u64 {
        self.target.row_count(table).await.unwrap()
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.load = LoadConfig::disabled();
    config
}

fn write_family(fixture: &Fixture) {
    fixture.write(
        "parent",
        "INSERT INTO `parent` (`id`, `name`) VALUES (1, 'alpha'), (2, 'beta');",
    );
    fixture.write(
        "child",
        "INSERT INTO `child` (`id`, `parent_id`, `label`) VALUES (1, 1, 'a'), (2, 2, 'b'), (3, 2, 'c');",
    );
    fixture.write(
        "grandchild",
        "INSERT INTO `grandchild` (`id`, `child_id`, `note`) VALUES (1, 1, 'x'), (2, 3, 'y');",
    );
}

#[tokio::test]
async fn test_clean_family_loads_in_dependency_order() {
    let fixture = Fixture::new(FAMILY_SCHEMA).await;
    write_family(&fixture);

    let report = fixture.run(config()).await;

    let order: Vec<_> = report.tables.iter().map(|t| t.table.as_str()).collect();
    assert_eq!(order, vec!["parent", "child", "grandchild"]);
    assert_eq!(report.status, RunStatus::Success);
    assert!(report.tables.iter().all(|t| t.status == LoadStatus::Succeeded));
    assert_eq!(fixture.count("parent").await, 2);
    assert_eq!(fixture.count("child").await, 3);
    assert_eq!(fixture.count("grandchild").await, 2);
    assert_eq!(report.totals.rows_moved, 7);
    assert!(fixture.target.integrity_enforced().await.unwrap());
}

#[tokio::test]
async fn test_missing_parent_gets_placeholder() {
    let fixture = Fixture::new(FAMILY_SCHEMA).await;
    fixture.write("parent", "INSERT INTO parent (id, name) VALUES (1, 'alpha'), (2, 'beta');");
    fixture.write(
        "child",
        "INSERT INTO child (id, parent_id, label) VALUES (1, 1, 'a'), (2, 999, 'lost');",
    );

    let report = fixture.run(config()).await;

    assert_eq!(fixture.count("parent").await, 3);
    assert_eq!(fixture.count("child").await, 2);

    let child = report.table("child").unwrap();
    assert_eq!(child.status, LoadStatus::SucceededWithWarning);
    assert_eq!(child.placeholders.len(), 1);
    let placeholder = &child.placeholders[0];
    assert_eq!(placeholder.parent, "parent");
    assert_eq!(placeholder.key, "999");
    assert_eq!(placeholder.marker_column, "name");

    let marker: String = sqlx::query_scalar("SELECT name FROM parent WHERE id = 999")
        .fetch_one(fixture.target.pool())
        .await
        .unwrap();
    assert!(marker.starts_with(PLACEHOLDER_MARKER));

    // Placeholder rows show up in the parent's final count only
    let parent = report.table("parent").unwrap();
    assert_eq!(parent.rows_after, 2);
    assert_eq!(parent.final_count, Some(3));
    assert_eq!(report.status, RunStatus::Partial);
}

#[tokio::test]
async fn test_drop_policy_removes_orphans() {
    let fixture = Fixture::new(FAMILY_SCHEMA).await;
    fixture.write("parent", "INSERT INTO parent (id, name) VALUES (1, 'alpha');");
    fixture.write(
        "child",
        "INSERT INTO child (id, parent_id, label) VALUES \
         (1, 1, 'a'), (2, 7, 'b'), (3, 1, 'c'), (4, 8, 'd'), (5, 1, 'e');",
    );

    let mut config = config();
    config.repair.default_policy = OrphanPolicy::Drop;
    let report = fixture.run(config).await;

    assert_eq!(fixture.count("parent").await, 1);
    assert_eq!(fixture.count("child").await, 3);

    let child = report.table("child").unwrap();
    assert_eq!(child.orphans, 2);
    assert_eq!(child.dropped.len(), 2);
    assert!(child.placeholders.is_empty());
    assert!(child.dropped.iter().all(|d| d.reason == REASON_IRRECOVERABLE));
    let mut keys: Vec<_> = child.dropped.iter().map(|d| d.key.as_str()).collect();
    keys.sort();
    assert_eq!(keys, vec!["7", "8"]);
    assert_eq!(report.totals.dropped_orphans, 2);
}

#[tokio::test]
async fn test_empty_artifact_is_skipped_and_run_continues() {
    let fixture = Fixture::new(
        r#"
        CREATE TABLE audit_log (id INTEGER PRIMARY KEY, message TEXT);
        CREATE TABLE region (id INTEGER PRIMARY KEY, name TEXT);
        "#,
    )
    .await;
    fixture.write("audit_log", "");
    fixture.write("region", "INSERT INTO region (id, name) VALUES (1, 'north'), (2, 'south');");

    let report = fixture.run(config()).await;

    let audit = report.table("audit_log").unwrap();
    assert_eq!(audit.status, LoadStatus::Skipped);
    assert_eq!(audit.skip_reason, Some(SkipReason::ArtifactEmpty));
    assert_eq!(report.table("region").unwrap().status, LoadStatus::Succeeded);
    assert_eq!(fixture.count("region").await, 2);
    assert_eq!(report.status, RunStatus::Partial);
}

#[tokio::test]
async fn test_missing_export_column_is_added() {
    let fixture = Fixture::new("CREATE TABLE widget (id INTEGER PRIMARY KEY, name TEXT);").await;
    fixture.write(
        "widget",
        "INSERT INTO widget (id, name, new_field) VALUES (1, 'gear', 'steel'), (2, 'cog', NULL);",
    );

    let report = fixture.run(config()).await;

    let widget = report.table("widget").unwrap();
    assert_eq!(widget.status, LoadStatus::Succeeded);
    assert_eq!(widget.added_columns.len(), 1);
    assert_eq!(widget.added_columns[0].name, "new_field");
    assert!(
        widget
            .issues
            .iter()
            .any(|i| i.class == ErrorClass::SchemaDriftWarning)
    );

    let columns: Vec<ColumnDescriptor> = fixture.target.columns("widget").await.unwrap();
    let added = columns.iter().find(|c| c.name == "new_field").unwrap();
    assert!(added.nullable);

    let value: Option<String> = sqlx::query_scalar("SELECT new_field FROM widget WHERE id = 1")
        .fetch_one(fixture.target.pool())
        .await
        .unwrap();
    assert_eq!(value.as_deref(), Some("steel"));
    assert_eq!(fixture.count("widget").await, 2);
}

#[tokio::test]
async fn test_identical_inputs_give_identical_reports() {
    let mut outputs = Vec::new();
    for _ in 0..2 {
        let fixture = Fixture::new(FAMILY_SCHEMA).await;
        write_family(&fixture);
        fixture.write(
            "child",
            "INSERT INTO child (id, parent_id, label) VALUES (1, 1, 'a'), (2, 2, 'b'), (3, 77, 'c');",
        );
        let report = fixture.run(config()).await;
        outputs.push((
            report.to_json().unwrap(),
            fixture.count("parent").await,
            fixture.count("child").await,
            fixture.count("grandchild").await,
        ));
    }

    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0].1, 3);
    assert!(outputs[0].0.contains("\"key\": \"77\""));
}

#[tokio::test]
async fn test_cyclic_catalog_is_rejected() {
    let fixture = Fixture::new(FAMILY_SCHEMA).await;
    let catalog = parse_catalog(
        r#"
        [[tables]]
        name = "invoice"
        foreign_keys = [{ from_column = "order_id", to_table = "orders", to_column = "id" }]

        [[tables]]
        name = "orders"
        foreign_keys = [{ from_column = "invoice_id", to_table = "invoice", to_column = "id" }]
        "#,
    )
    .unwrap();

    let err = Engine::new(fixture.target.clone(), fixture.source(), catalog, config())
        .err()
        .unwrap();
    assert!(matches!(
        MigrationError::find(&err),
        Some(MigrationError::Configuration(_))
    ));
    assert!(err.to_string().contains("invoice"));
}

#[tokio::test]
async fn test_dependents_of_unparseable_table_are_skipped() {
    let fixture = Fixture::new(FAMILY_SCHEMA).await;
    write_family(&fixture);
    fixture.write("parent", "INSERT INTO invoice (id) VALUES (1);");

    let report = fixture.run(config()).await;

    let parent = report.table("parent").unwrap();
    assert_eq!(parent.status, LoadStatus::Skipped);
    assert_eq!(parent.skip_reason, Some(SkipReason::Unparseable));
    assert!(parent.issues.iter().any(|i| i.class == ErrorClass::ParseError));

    for table in ["child", "grandchild"] {
        let outcome = report.table(table).unwrap();
        assert_eq!(outcome.skip_reason, Some(SkipReason::DependencyFailed), "{}", table);
    }
    assert_eq!(fixture.count("child").await, 0);
    assert_eq!(report.totals.skipped, 3);
}

#[tokio::test]
async fn test_duplicate_unique_text_is_suffixed() {
    let fixture = Fixture::new(
        "CREATE TABLE customer (id INTEGER PRIMARY KEY, email TEXT NOT NULL UNIQUE);",
    )
    .await;
    fixture.write(
        "customer",
        "INSERT INTO customer (id, email) VALUES (1, 'sam@example.com'), (2, 'sam@example.com');",
    );

    let report = fixture.run(config()).await;

    let customer = report.table("customer").unwrap();
    assert_eq!(customer.disambiguated.len(), 1);
    assert_eq!(customer.disambiguated[0].assigned, "sam@example.com_2");
    assert_eq!(fixture.count("customer").await, 2);

    let email: String = sqlx::query_scalar("SELECT email FROM customer WHERE id = 2")
        .fetch_one(fixture.target.pool())
        .await
        .unwrap();
    assert_eq!(email, "sam@example.com_2");
}

#[tokio::test]
async fn test_children_of_withheld_rows_are_dropped() {
    let fixture = Fixture::new(
        r#"
        CREATE TABLE account (id INTEGER PRIMARY KEY, code INTEGER UNIQUE, name TEXT);
        CREATE TABLE entry (
            id INTEGER PRIMARY KEY,
            account_id INTEGER REFERENCES account(id),
            memo TEXT
        );
        "#,
    )
    .await;
    fixture.write(
        "account",
        "INSERT INTO account (id, code, name) VALUES (1, 10, 'cash'), (2, 10, 'bank');",
    );
    fixture.write(
        "entry",
        "INSERT INTO entry (id, account_id, memo) VALUES (1, 1, 'ok'), (2, 2, 'needs review');",
    );

    let report = fixture.run(config()).await;

    let account = report.table("account").unwrap();
    assert_eq!(account.flagged.len(), 1);
    assert_eq!(account.status, LoadStatus::SucceededWithWarning);
    assert_eq!(fixture.count("account").await, 1);

    let entry = report.table("entry").unwrap();
    assert!(entry.placeholders.is_empty());
    assert_eq!(entry.dropped.len(), 1);
    assert_eq!(entry.dropped[0].reason, REASON_WITHHELD);
    assert_eq!(fixture.count("entry").await, 1);
}

#[tokio::test]
async fn test_cancelled_before_start_loads_nothing() {
    let fixture = Fixture::new(FAMILY_SCHEMA).await;
    write_family(&fixture);

    let cancel = CancelFlag::new();
    cancel.cancel();
    let engine = fixture.engine(config()).await.with_cancel(cancel);
    let report = engine.run(STARTED).await.unwrap();

    assert!(report.tables.iter().all(|t| t.skip_reason == Some(SkipReason::Cancelled)));
    assert_ne!(report.status, RunStatus::Success);
    assert_eq!(fixture.count("parent").await, 0);
    assert_eq!(engine.gate().holder(), None);
}

/// Delegates to SQLite, cancelling the run or failing writes for one table
struct InterferingTarget {
    inner: SqliteTarget,
    table: String,
    cancel: Option<CancelFlag>,
    fail_inserts: AtomicBool,
}

#[async_trait]
impl TargetStore for InterferingTarget {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.inner.list_tables().await
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        self.inner.table_exists(table).await
    }

    async fn columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        self.inner.columns(table).await
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<LiveForeignKey>> {
        self.inner.foreign_keys(table).await
    }

    async fn add_column(&self, table: &str, column: &ColumnDescriptor) -> Result<()> {
        self.inner.add_column(table, column).await
    }

    async fn set_integrity_enforcement(&self, enabled: bool) -> Result<()> {
        self.inner.set_integrity_enforcement(enabled).await
    }

    async fn integrity_enforced(&self) -> Result<bool> {
        self.inner.integrity_enforced().await
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        self.inner.row_count(table).await
    }

    async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<SqlValue>],
        conflict: ConflictMode,
    ) -> Result<Vec<i64>> {
        if table == self.table && self.fail_inserts.load(Ordering::SeqCst) {
            anyhow::bail!("disk I/O error");
        }
        let written = self.inner.insert_rows(table, columns, rows, conflict).await?;
        if table == self.table {
            if let Some(cancel) = &self.cancel {
                cancel.cancel();
            }
        }
        Ok(written)
    }

    async fn integrity_violations(&self, table: &str) -> Result<Vec<Violation>> {
        self.inner.integrity_violations(table).await
    }

    async fn read_row(
        &self,
        table: &str,
        rowid: i64,
        columns: &[String],
    ) -> Result<Vec<SqlValue>> {
        self.inner.read_row(table, rowid, columns).await
    }

    async fn delete_rows(&self, table: &str, rowids: &[i64]) -> Result<u64> {
        self.inner.delete_rows(table, rowids).await
    }

    fn max_bind_params(&self) -> usize {
        self.inner.max_bind_params()
    }
}

async fn interfering(table: &str, cancel: Option<CancelFlag>, fail: bool) -> Arc<InterferingTarget> {
    let inner = SqliteTarget::in_memory().await.unwrap();
    inner.execute_script(FAMILY_SCHEMA).await.unwrap();
    Arc::new(InterferingTarget {
        inner,
        table: table.to_string(),
        cancel,
        fail_inserts: AtomicBool::new(fail),
    })
}

#[tokio::test]
async fn test_failed_load_restores_enforcement() {
    let fixture = Fixture::new(FAMILY_SCHEMA).await;
    write_family(&fixture);
    let target = interfering("child", None, true).await;
    let catalog = introspect_catalog(target.as_ref()).await.unwrap();

    let engine = Engine::new(target.clone(), fixture.source(), catalog, config()).unwrap();
    let report = engine.run(STARTED).await.unwrap();

    let child = report.table("child").unwrap();
    assert_eq!(child.status, LoadStatus::Failed);
    assert!(child.reason.as_deref().unwrap().contains("disk I/O error"));
    assert_eq!(target.row_count("child").await.unwrap(), 0);

    assert_eq!(report.table("parent").unwrap().status, LoadStatus::Succeeded);
    assert_eq!(
        report.table("grandchild").unwrap().skip_reason,
        Some(SkipReason::DependencyFailed)
    );
    assert_eq!(report.status, RunStatus::Failure);
    assert!(report.fatal_error.is_none());

    assert_eq!(engine.gate().holder(), None);
    assert!(target.integrity_enforced().await.unwrap());
}

#[tokio::test]
async fn test_cancel_mid_run_clears_current_table() {
    let fixture = Fixture::new(FAMILY_SCHEMA).await;
    write_family(&fixture);
    let cancel = CancelFlag::new();
    let target = interfering("child", Some(cancel.clone()), false).await;
    // Rows already in the target sit above the exported ids
    target
        .inner
        .execute_script(
            "INSERT INTO parent (id, name) VALUES (9, 'kept'); \
             INSERT INTO child (id, parent_id, label) VALUES (100, 9, 'kept');",
        )
        .await
        .unwrap();
    let catalog = introspect_catalog(target.as_ref()).await.unwrap();

    let engine = Engine::new(target.clone(), fixture.source(), catalog, config())
        .unwrap()
        .with_cancel(cancel);
    let report = engine.run(STARTED).await.unwrap();

    assert_eq!(report.table("parent").unwrap().status, LoadStatus::Succeeded);
    let child = report.table("child").unwrap();
    assert_eq!(child.status, LoadStatus::Failed);
    assert_eq!(child.reason.as_deref(), Some("run cancelled"));
    let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM child")
        .fetch_all(target.inner.pool())
        .await
        .unwrap();
    assert_eq!(ids, vec![100]);
    assert_eq!(
        report.table("grandchild").unwrap().skip_reason,
        Some(SkipReason::Cancelled)
    );
    assert!(target.integrity_enforced().await.unwrap());
}
