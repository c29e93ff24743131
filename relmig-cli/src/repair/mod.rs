//! Orphan repair after a table load
//!
//! Rows whose foreign key points at a missing parent are found with the
//! target's integrity check and resolved one pass at a time:
//! - deferred when the parent is still waiting to load in this run
//! - kept alive with a marked placeholder parent when policy allows
//! - dropped (and recorded) otherwise
//!
//! The table is re-checked after the pass; anything left fails the table.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::catalog::{Catalog, ColumnDescriptor, ColumnType, ForeignKeyEdge, OrphanPolicy};
use crate::error::MigrationError;
use crate::graph::DependencyGraph;
use crate::target::{ConflictMode, LiveForeignKey, SqlValue, TargetStore};

/// Prefix of every synthesized value
pub const PLACEHOLDER_MARKER: &str = "[relmig placeholder]";

pub const REASON_IRRECOVERABLE: &str = "orphaned foreign key, parent irrecoverable";
pub const REASON_WITHHELD: &str = "parent row withheld for manual review";
pub const REASON_PARENT_PENDING: &str = "parent table loads later in the run";

/// Key values withheld by the sanitizer: table -> lowercase column -> key text
pub type WithheldKeys = HashMap<String, HashMap<String, HashSet<String>>>;

/// A child row whose foreign key has no matching parent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrphanRecord {
    pub rowid: i64,
    pub parent: String,
    /// `None` for composite keys
    pub edge: Option<ForeignKeyEdge>,
    /// Missing parent key, `Null` for composite keys
    pub key: SqlValue,
}

/// A synthesized parent row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placeholder {
    pub parent: String,
    pub key_column: String,
    pub key: String,
    pub child: String,
    pub child_column: String,
    pub marker_column: String,
}

/// A child row deleted by the repair pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedRow {
    pub table: String,
    pub rowid: i64,
    pub column: String,
    pub parent: String,
    pub key: String,
    pub reason: String,
}

/// Result of one repair pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepairSummary {
    /// Orphaned rows found by the integrity check
    pub orphans: u64,
    pub placeholders: Vec<Placeholder>,
    pub dropped: Vec<DroppedRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RepairOutcome {
    /// No violations
    Clean,
    /// The table must be cleared and re-queued after `parent`
    Deferred { parent: String },
    Repaired(RepairSummary),
}

/// What the repairer needs to know about the rest of the run
pub struct RepairContext<'a> {
    pub table: &'a str,
    pub policy: OrphanPolicy,
    pub catalog: &'a Catalog,
    pub graph: &'a DependencyGraph,
    /// Tables still waiting to load
    pub pending: &'a HashSet<String>,
    /// False once the table has been deferred
    pub may_defer: bool,
    pub withheld: &'a WithheldKeys,
}

impl RepairContext<'_> {
    /// Whether the table may be re-queued behind `parent`.
    ///
    /// Refused when the parent depends on this table in the catalog, since
    /// loading the table after it would break the catalog order.
    fn can_defer_to(&self, parent: &str) -> bool {
        self.may_defer
            && parent != self.table
            && self.pending.contains(parent)
            && !self.graph.transitive_dependents(self.table).contains(&parent)
    }

    fn is_withheld(&self, parent: &str, column: &str, key: &str) -> bool {
        self.withheld
            .get(parent)
            .and_then(|columns| columns.get(&column.to_lowercase()))
            .is_some_and(|keys| keys.contains(key))
    }
}

enum Resolution {
    Placeholder,
    Drop(&'static str),
}

/// Finds and resolves orphaned rows
pub struct OrphanRepairer {
    target: Arc<dyn TargetStore>,
}

impl OrphanRepairer {
    pub fn new(target: Arc<dyn TargetStore>) -> Self {
        Self { target }
    }

    /// Rows of `table` that currently violate a foreign key
    pub async fn find_orphans(&self, table: &str) -> Result<Vec<OrphanRecord>> {
        let violations = self.target.integrity_violations(table).await?;
        if violations.is_empty() {
            return Ok(Vec::new());
        }

        let keys: HashMap<i64, LiveForeignKey> = self
            .target
            .foreign_keys(table)
            .await?
            .into_iter()
            .map(|fk| (fk.id, fk))
            .collect();

        let mut orphans = Vec::with_capacity(violations.len());
        for violation in violations {
            let edge = keys.get(&violation.fk_id).and_then(LiveForeignKey::as_edge);
            let key = match &edge {
                Some(edge) => self
                    .target
                    .read_row(table, violation.rowid, std::slice::from_ref(&edge.from_column))
                    .await?
                    .into_iter()
                    .next()
                    .unwrap_or(SqlValue::Null),
                None => SqlValue::Null,
            };

            orphans.push(OrphanRecord {
                rowid: violation.rowid,
                parent: violation.parent,
                edge,
                key,
            });
        }

        Ok(orphans)
    }

    /// Run one repair pass over `ctx.table`, then re-check it.
    ///
    /// Returns a `ConstraintViolation` error when rows still violate a
    /// foreign key after the pass.
    pub async fn repair(&self, ctx: &RepairContext<'_>) -> Result<RepairOutcome> {
        let orphans = self.find_orphans(ctx.table).await?;
        if orphans.is_empty() {
            return Ok(RepairOutcome::Clean);
        }
        log::warn!("{}: {} rows reference missing parents", ctx.table, orphans.len());

        if let Some(orphan) = orphans.iter().find(|o| ctx.can_defer_to(&o.parent)) {
            log::warn!(
                "{}: parent {} has not loaded yet, deferring the table",
                ctx.table,
                orphan.parent
            );
            return Ok(RepairOutcome::Deferred {
                parent: orphan.parent.clone(),
            });
        }

        let mut summary = RepairSummary {
            orphans: orphans.len() as u64,
            ..Default::default()
        };
        // (parent, key column, key) -> whether a placeholder now exists
        let mut synthesized: HashMap<(String, String, String), bool> = HashMap::new();
        let mut doomed = Vec::new();

        for orphan in &orphans {
            let key_text = orphan.key.display();
            let (resolution, key_column) = match &orphan.edge {
                None => (Resolution::Drop(REASON_IRRECOVERABLE), String::new()),
                Some(edge) => {
                    let key_column = self.parent_key_column(&orphan.parent, edge).await?;
                    let resolution = self.classify(ctx, orphan, key_column.as_deref(), &key_text);
                    (resolution, key_column.unwrap_or_default())
                }
            };
            let child_column = orphan
                .edge
                .as_ref()
                .map(|e| e.from_column.clone())
                .unwrap_or_default();

            let reason = match resolution {
                Resolution::Drop(reason) => Some(reason),
                Resolution::Placeholder => {
                    let slot = (orphan.parent.clone(), key_column.clone(), key_text.clone());
                    let exists = match synthesized.get(&slot) {
                        Some(done) => *done,
                        None => {
                            let created = self
                                .synthesize(ctx, orphan, &key_column, &child_column)
                                .await?;
                            let done = match created {
                                Ok(placeholder) => {
                                    summary.placeholders.push(placeholder);
                                    true
                                }
                                Err(refusal) => {
                                    log::warn!(
                                        "{}: no placeholder for {}.{}={}: {}",
                                        ctx.table,
                                        orphan.parent,
                                        key_column,
                                        key_text,
                                        refusal
                                    );
                                    false
                                }
                            };
                            synthesized.insert(slot, done);
                            done
                        }
                    };
                    (!exists).then_some(REASON_IRRECOVERABLE)
                }
            };

            if let Some(reason) = reason {
                log::warn!(
                    "{}: dropping row {} ({}={} -> {}): {}",
                    ctx.table,
                    orphan.rowid,
                    child_column,
                    key_text,
                    orphan.parent,
                    reason
                );
                doomed.push(orphan.rowid);
                summary.dropped.push(DroppedRow {
                    table: ctx.table.to_string(),
                    rowid: orphan.rowid,
                    column: child_column,
                    parent: orphan.parent.clone(),
                    key: key_text,
                    reason: reason.to_string(),
                });
            }
        }

        doomed.sort_unstable();
        doomed.dedup();
        if !doomed.is_empty() {
            self.target
                .delete_rows(ctx.table, &doomed)
                .await
                .with_context(|| format!("Failed to drop orphaned rows of {}", ctx.table))?;
        }

        let remaining = self.target.integrity_violations(ctx.table).await?;
        if !remaining.is_empty() {
            return Err(MigrationError::ConstraintViolation(format!(
                "{} rows of {} still reference missing parents after repair",
                remaining.len(),
                ctx.table
            ))
            .into());
        }

        log::info!(
            "{}: repaired {} orphans ({} placeholders, {} dropped)",
            ctx.table,
            summary.orphans,
            summary.placeholders.len(),
            summary.dropped.len()
        );
        Ok(RepairOutcome::Repaired(summary))
    }

    fn classify(
        &self,
        ctx: &RepairContext<'_>,
        orphan: &OrphanRecord,
        key_column: Option<&str>,
        key_text: &str,
    ) -> Resolution {
        if ctx.pending.contains(&orphan.parent) && orphan.parent != ctx.table {
            return Resolution::Drop(REASON_PARENT_PENDING);
        }
        let Some(key_column) = key_column else {
            return Resolution::Drop(REASON_IRRECOVERABLE);
        };
        if ctx.is_withheld(&orphan.parent, key_column, key_text) {
            return Resolution::Drop(REASON_WITHHELD);
        }
        match ctx.policy {
            OrphanPolicy::Drop => Resolution::Drop(REASON_IRRECOVERABLE),
            OrphanPolicy::Placeholder => Resolution::Placeholder,
        }
    }

    /// Referenced parent column, resolving an implicit primary key
    async fn parent_key_column(&self, parent: &str, edge: &ForeignKeyEdge) -> Result<Option<String>> {
        if let Some(column) = &edge.to_column {
            return Ok(Some(column.clone()));
        }
        let columns = self.target.columns(parent).await?;
        let keys: Vec<&ColumnDescriptor> = columns.iter().filter(|c| c.primary_key).collect();
        Ok(match keys.as_slice() {
            [single] => Some(single.name.clone()),
            _ => None,
        })
    }

    /// Insert a marked parent row for an orphan.
    ///
    /// The inner error is a refusal reason; the outer one a store failure.
    async fn synthesize(
        &self,
        ctx: &RepairContext<'_>,
        orphan: &OrphanRecord,
        key_column: &str,
        child_column: &str,
    ) -> Result<std::result::Result<Placeholder, String>> {
        let parent = orphan.parent.as_str();
        let columns = self.target.columns(parent).await?;
        let parent_fks: HashSet<String> = self
            .target
            .foreign_keys(parent)
            .await?
            .iter()
            .flat_map(|fk| fk.columns.iter().map(|(from, _)| from.to_lowercase()))
            .collect();

        let preferred = ctx
            .catalog
            .table(parent)
            .and_then(|t| t.placeholder_column.as_deref());
        let marker_column = preferred
            .and_then(|name| columns.iter().find(|c| c.name.eq_ignore_ascii_case(name)))
            .or_else(|| {
                columns
                    .iter()
                    .find(|c| c.column_type.is_textual() && !c.name.eq_ignore_ascii_case(key_column))
            });
        let Some(marker_column) = marker_column else {
            return Ok(Err(format!("{} has no text column to carry the marker", parent)));
        };

        let key_text = orphan.key.display();
        let marker = format!(
            "{} missing {}.{}={} referenced by {}.{}",
            PLACEHOLDER_MARKER, parent, key_column, key_text, ctx.table, child_column
        );

        let mut names = Vec::new();
        let mut values = Vec::new();
        for column in &columns {
            let value = if column.name.eq_ignore_ascii_case(key_column) {
                orphan.key.clone()
            } else if column.name == marker_column.name {
                SqlValue::Text(marker.clone())
            } else if column.can_omit() {
                continue;
            } else if parent_fks.contains(&column.name.to_lowercase()) {
                return Ok(Err(format!(
                    "{}.{} is a NOT NULL foreign key without a default",
                    parent, column.name
                )));
            } else {
                filler(&column.column_type, &marker)
            };
            names.push(column.name.clone());
            values.push(value);
        }

        if let Err(e) = self
            .target
            .insert_rows(parent, &names, &[values], ConflictMode::Abort)
            .await
        {
            return Ok(Err(format!("insert rejected: {:#}", e)));
        }

        log::warn!(
            "{}: synthesized placeholder {}.{}={}",
            ctx.table,
            parent,
            key_column,
            key_text
        );
        Ok(Ok(Placeholder {
            parent: parent.to_string(),
            key_column: key_column.to_string(),
            key: key_text,
            child: ctx.table.to_string(),
            child_column: child_column.to_string(),
            marker_column: marker_column.name.clone(),
        }))
    }
}

/// Value for a required column of a placeholder row
fn filler(column_type: &ColumnType, marker: &str) -> SqlValue {
    match column_type {
        ColumnType::Integer | ColumnType::Decimal | ColumnType::Boolean => SqlValue::Integer(0),
        ColumnType::Timestamp => SqlValue::Text("1970-01-01 00:00:00".to_string()),
        ColumnType::Blob => SqlValue::Blob(Vec::new()),
        ColumnType::Text | ColumnType::Other(_) => SqlValue::Text(marker.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TableDescriptor;
    use crate::target::SqliteTarget;

    const SCHEMA: &str = "
        CREATE TABLE parent (id INTEGER PRIMARY KEY, name TEXT NOT NULL, score INTEGER NOT NULL);
        CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parent(id));
        PRAGMA foreign_keys = OFF;
        INSERT INTO parent (id, name, score) VALUES (1, 'one', 10);
        INSERT INTO child (id, parent_id) VALUES (1, 1), (2, 999), (3, 999), (4, 555);
    ";

    fn catalog() -> Catalog {
        Catalog::new(vec![
            TableDescriptor::new("parent"),
            TableDescriptor::new("child").with_foreign_key(ForeignKeyEdge::new("parent_id", "parent", "id")),
        ])
    }

    async fn setup() -> Arc<SqliteTarget> {
        let target = SqliteTarget::in_memory().await.unwrap();
        target.execute_script(SCHEMA).await.unwrap();
        Arc::new(target)
    }

    fn context<'a>(
        catalog: &'a Catalog,
        graph: &'a DependencyGraph,
        pending: &'a HashSet<String>,
        withheld: &'a WithheldKeys,
        policy: OrphanPolicy,
    ) -> RepairContext<'a> {
        RepairContext {
            table: "child",
            policy,
            catalog,
            graph,
            pending,
            may_defer: true,
            withheld,
        }
    }

    #[tokio::test]
    async fn test_find_orphans() {
        let target = setup().await;
        let repairer = OrphanRepairer::new(target);

        let orphans = repairer.find_orphans("child").await.unwrap();
        let keys: Vec<_> = orphans.iter().map(|o| (o.rowid, o.key.display())).collect();
        assert_eq!(
            keys,
            vec![(2, "999".to_string()), (3, "999".to_string()), (4, "555".to_string())]
        );
        assert_eq!(orphans[0].edge.as_ref().unwrap().from_column, "parent_id");
    }

    #[tokio::test]
    async fn test_placeholder_policy_keeps_children() {
        let target = setup().await;
        let repairer = OrphanRepairer::new(target.clone());
        let (catalog, pending, withheld) = (catalog(), HashSet::new(), WithheldKeys::new());
        let graph = DependencyGraph::build(&catalog);

        let outcome = repairer
            .repair(&context(&catalog, &graph, &pending, &withheld, OrphanPolicy::Placeholder))
            .await
            .unwrap();

        let RepairOutcome::Repaired(summary) = outcome else {
            panic!("expected a repair, got {:?}", outcome);
        };
        assert_eq!(summary.orphans, 3);
        assert_eq!(summary.placeholders.len(), 2);
        assert!(summary.dropped.is_empty());
        assert_eq!(target.row_count("child").await.unwrap(), 4);
        assert_eq!(target.row_count("parent").await.unwrap(), 3);

        let name = target
            .read_row("parent", 999, &["name".to_string()])
            .await
            .unwrap();
        assert_eq!(
            name,
            vec![SqlValue::Text(
                "[relmig placeholder] missing parent.id=999 referenced by child.parent_id".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_drop_policy_removes_orphans() {
        let target = setup().await;
        let repairer = OrphanRepairer::new(target.clone());
        let (catalog, pending, withheld) = (catalog(), HashSet::new(), WithheldKeys::new());
        let graph = DependencyGraph::build(&catalog);

        let outcome = repairer
            .repair(&context(&catalog, &graph, &pending, &withheld, OrphanPolicy::Drop))
            .await
            .unwrap();

        let RepairOutcome::Repaired(summary) = outcome else {
            panic!("expected a repair, got {:?}", outcome);
        };
        assert_eq!(summary.dropped.len(), 3);
        assert!(summary.dropped.iter().all(|d| d.reason == REASON_IRRECOVERABLE));
        assert_eq!(target.row_count("child").await.unwrap(), 1);
        assert_eq!(target.row_count("parent").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_composite_orphans_are_dropped() {
        let target = SqliteTarget::in_memory().await.unwrap();
        target
            .execute_script(
                "
                CREATE TABLE parent (region TEXT, code INTEGER, name TEXT, PRIMARY KEY (region, code));
                CREATE TABLE child (
                    id INTEGER PRIMARY KEY,
                    region TEXT,
                    code INTEGER,
                    FOREIGN KEY (region, code) REFERENCES parent(region, code)
                );
                PRAGMA foreign_keys = OFF;
                INSERT INTO parent (region, code, name) VALUES ('eu', 1, 'one');
                INSERT INTO child (id, region, code) VALUES (1, 'eu', 1), (2, 'us', 7);
                ",
            )
            .await
            .unwrap();
        let target = Arc::new(target);
        let repairer = OrphanRepairer::new(target.clone());
        let (catalog, pending, withheld) = (catalog(), HashSet::new(), WithheldKeys::new());
        let graph = DependencyGraph::build(&catalog);

        let orphans = repairer.find_orphans("child").await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert!(orphans[0].edge.is_none());

        let outcome = repairer
            .repair(&context(&catalog, &graph, &pending, &withheld, OrphanPolicy::Placeholder))
            .await
            .unwrap();

        let RepairOutcome::Repaired(summary) = outcome else {
            panic!("expected a repair, got {:?}", outcome);
        };
        assert!(summary.placeholders.is_empty());
        assert_eq!(summary.dropped.len(), 1);
        assert_eq!(summary.dropped[0].reason, REASON_IRRECOVERABLE);
        assert_eq!(target.row_count("child").await.unwrap(), 1);
        assert_eq!(target.row_count("parent").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_withheld_parent_is_not_replaced() {
        let target = setup().await;
        let repairer = OrphanRepairer::new(target.clone());
        let (catalog, pending) = (catalog(), HashSet::new());
        let graph = DependencyGraph::build(&catalog);
        let mut withheld = WithheldKeys::new();
        withheld
            .entry("parent".to_string())
            .or_default()
            .entry("id".to_string())
            .or_default()
            .insert("999".to_string());

        let outcome = repairer
            .repair(&context(&catalog, &graph, &pending, &withheld, OrphanPolicy::Placeholder))
            .await
            .unwrap();

        let RepairOutcome::Repaired(summary) = outcome else {
            panic!("expected a repair, got {:?}", outcome);
        };
        assert_eq!(summary.dropped.len(), 2);
        assert!(summary.dropped.iter().all(|d| d.reason == REASON_WITHHELD));
        assert_eq!(summary.placeholders.len(), 1);
        assert_eq!(summary.placeholders[0].key, "555");
    }

    #[tokio::test]
    async fn test_pending_parent_defers() {
        let target = setup().await;
        let repairer = OrphanRepairer::new(target.clone());
        // Live schema knows the edge, the catalog does not
        let catalog = Catalog::new(vec![TableDescriptor::new("child"), TableDescriptor::new("parent")]);
        let graph = DependencyGraph::build(&catalog);
        let pending: HashSet<String> = ["parent".to_string()].into_iter().collect();
        let withheld = WithheldKeys::new();

        let mut ctx = context(&catalog, &graph, &pending, &withheld, OrphanPolicy::Placeholder);
        let outcome = repairer.repair(&ctx).await.unwrap();
        assert_eq!(
            outcome,
            RepairOutcome::Deferred {
                parent: "parent".to_string()
            }
        );

        // Deferred once already: the parent is still pending, so rows go
        ctx.may_defer = false;
        let RepairOutcome::Repaired(summary) = repairer.repair(&ctx).await.unwrap() else {
            panic!("expected a repair");
        };
        assert!(summary.dropped.iter().all(|d| d.reason == REASON_PARENT_PENDING));
        assert!(summary.placeholders.is_empty());
    }

    #[tokio::test]
    async fn test_placeholder_refused_for_required_foreign_key() {
        let target = SqliteTarget::in_memory().await.unwrap();
        target
            .execute_script(
                "CREATE TABLE region (id INTEGER PRIMARY KEY, label TEXT);
                 CREATE TABLE parent (id INTEGER PRIMARY KEY, name TEXT,
                                      region_id INTEGER NOT NULL REFERENCES region(id));
                 CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parent(id));
                 PRAGMA foreign_keys = OFF;
                 INSERT INTO child (id, parent_id) VALUES (1, 7);",
            )
            .await
            .unwrap();
        let target = Arc::new(target);
        let repairer = OrphanRepairer::new(target.clone());
        let (catalog, pending, withheld) = (catalog(), HashSet::new(), WithheldKeys::new());
        let graph = DependencyGraph::build(&catalog);

        let RepairOutcome::Repaired(summary) = repairer
            .repair(&context(&catalog, &graph, &pending, &withheld, OrphanPolicy::Placeholder))
            .await
            .unwrap()
        else {
            panic!("expected a repair");
        };
        assert!(summary.placeholders.is_empty());
        assert_eq!(summary.dropped.len(), 1);
        assert_eq!(target.row_count("parent").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clean_table() {
        let target = SqliteTarget::in_memory().await.unwrap();
        target
            .execute_script("CREATE TABLE parent (id INTEGER PRIMARY KEY, name TEXT);")
            .await
            .unwrap();
        let repairer = OrphanRepairer::new(Arc::new(target));
        let catalog = Catalog::new(vec![TableDescriptor::new("parent")]);
        let graph = DependencyGraph::build(&catalog);
        let (pending, withheld) = (HashSet::new(), WithheldKeys::new());

        let mut ctx = context(&catalog, &graph, &pending, &withheld, OrphanPolicy::Placeholder);
        ctx.table = "parent";
        assert_eq!(repairer.repair(&ctx).await.unwrap(), RepairOutcome::Clean);
    }

    #[test]
    fn test_filler_values() {
        assert_eq!(filler(&ColumnType::Integer, "m"), SqlValue::Integer(0));
        assert_eq!(filler(&ColumnType::Text, "m"), SqlValue::Text("m".to_string()));
        assert_eq!(filler(&ColumnType::Blob, "m"), SqlValue::Blob(Vec::new()));
    }
}
