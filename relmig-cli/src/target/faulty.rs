//! Fault-injecting wrapper store for tests

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{ConflictMode, LiveForeignKey, SqlValue, SqliteTarget, TargetStore, Violation};
use crate::catalog::ColumnDescriptor;

/// Delegates to a real store, failing selected calls on demand
pub struct FaultyTarget {
    pub inner: SqliteTarget,
    pub fail_suspend: AtomicBool,
    pub fail_restore: AtomicBool,
    /// Number of upcoming insert calls that fail without writing
    pub fail_inserts: AtomicUsize,
    /// Panic on the next insert call
    pub panic_insert: AtomicBool,
    pub insert_calls: AtomicUsize,
}

impl FaultyTarget {
    pub fn new(inner: SqliteTarget) -> Self {
        Self {
            inner,
            fail_suspend: AtomicBool::new(false),
            fail_restore: AtomicBool::new(false),
            fail_inserts: AtomicUsize::new(0),
            panic_insert: AtomicBool::new(false),
            insert_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TargetStore for FaultyTarget {
    fn describe(&self) -> String {
        format!("faulty({})", self.inner.describe())
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
        if !enabled && self.fail_suspend.load(Ordering::SeqCst) {
            anyhow::bail!("injected suspend failure");
        }
        if enabled && self.fail_restore.load(Ordering::SeqCst) {
            anyhow::bail!("injected restore failure");
        }
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
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_insert.swap(false, Ordering::SeqCst) {
            panic!("injected insert panic");
        }

        let failing = self
            .fail_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("injected insert failure for {} rows", rows.len());
        }
        self.inner.insert_rows(table, columns, rows, conflict).await
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
