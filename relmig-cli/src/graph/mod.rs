//! Dependency graph logic for ordering table loads
//!
//! This module provides functions to:
//! - Build a dependency graph from catalog foreign keys
//! - Perform a deterministic topological sort for load and delete ordering
//! - Categorize tables as standalone, dependent, or junction
//! - Answer dependency queries used for skips and deferral

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use crate::catalog::Catalog;

/// How a table relates to the rest of the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyCategory {
    /// References no other table
    Standalone,
    /// References exactly one other table
    Dependent,
    /// References two or more other tables
    Junction,
}

impl DependencyCategory {
    pub fn label(&self) -> &'static str {
        match self {
            DependencyCategory::Standalone => "standalone",
            DependencyCategory::Dependent => "dependent",
            DependencyCategory::Junction => "junction",
        }
    }
}

/// Dependency graph over the catalog's tables.
///
/// Nodes are identified by declaration index, so every traversal that
/// iterates a `BTreeSet` visits tables in catalog order.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    /// table -> tables it references
    dependencies: Vec<BTreeSet<usize>>,
    /// table -> tables that reference it
    dependents: Vec<BTreeSet<usize>>,
    self_referencing: Vec<bool>,
}

impl DependencyGraph {
    /// Build a dependency graph from a catalog.
    ///
    /// References to tables outside the catalog are ignored here; catalog
    /// validation rejects them before a plan is built.
    pub fn build(catalog: &Catalog) -> Self {
        let names: Vec<String> = catalog.tables.iter().map(|t| t.name.clone()).collect();
        let index: HashMap<String, usize> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        let mut graph = DependencyGraph {
            dependencies: vec![BTreeSet::new(); names.len()],
            dependents: vec![BTreeSet::new(); names.len()],
            self_referencing: vec![false; names.len()],
            names,
            index,
        };

        for (i, table) in catalog.tables.iter().enumerate() {
            for edge in &table.foreign_keys {
                let Some(&target) = graph.index.get(&edge.to_table) else {
                    continue;
                };
                // Self-references load inside the same gate window
                if target == i {
                    log::warn!(
                        "{}: self-referencing foreign key {} left out of the load order; \
                         rows are checked together after the table loads",
                        table.name,
                        edge.describe(&table.name)
                    );
                    graph.self_referencing[i] = true;
                    continue;
                }
                graph.dependencies[i].insert(target);
                graph.dependents[target].insert(i);
            }
        }

        graph
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, table: &str) -> bool {
        self.index.contains_key(table)
    }

    /// Categorize a table based on how many other tables it references
    pub fn categorize(&self, table: &str) -> DependencyCategory {
        let Some(&i) = self.index.get(table) else {
            return DependencyCategory::Standalone;
        };

        match self.dependencies[i].len() {
            0 => DependencyCategory::Standalone,
            1 => DependencyCategory::Dependent,
            _ => DependencyCategory::Junction,
        }
    }

    pub fn is_self_referencing(&self, table: &str) -> bool {
        self.index
            .get(table)
            .map(|&i| self.self_referencing[i])
            .unwrap_or(false)
    }

    /// Tables this table references directly, in catalog order
    pub fn dependencies(&self, table: &str) -> Vec<&str> {
        self.lookup(table, &self.dependencies)
    }

    /// Tables that reference this table directly, in catalog order
    pub fn dependents(&self, table: &str) -> Vec<&str> {
        self.lookup(table, &self.dependents)
    }

    /// Every table that reaches this one through dependency edges
    pub fn transitive_dependents(&self, table: &str) -> Vec<&str> {
        let Some(&start) = self.index.get(table) else {
            return Vec::new();
        };

        let mut seen = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for &dependent in &self.dependents[node] {
                if dependent != start && seen.insert(dependent) {
                    stack.push(dependent);
                }
            }
        }

        seen.into_iter().map(|i| self.names[i].as_str()).collect()
    }

    fn lookup<'a>(&'a self, table: &str, edges: &[BTreeSet<usize>]) -> Vec<&'a str> {
        self.index
            .get(table)
            .map(|&i| edges[i].iter().map(|&j| self.names[j].as_str()).collect())
            .unwrap_or_default()
    }

    /// Perform topological sort using Kahn's algorithm.
    /// Returns tables in load order (referenced tables first); ties are
    /// broken by catalog declaration order.
    pub fn topological_sort(&self) -> Result<Vec<String>, CycleError> {
        let mut remaining: Vec<usize> = self.dependencies.iter().map(|d| d.len()).collect();
        let mut ready: BTreeSet<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.names.len());

        while let Some(node) = ready.pop_first() {
            order.push(node);

            for &dependent in &self.dependents[node] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != self.names.len() {
            return Err(self.find_cycle(&remaining));
        }

        Ok(order.into_iter().map(|i| self.names[i].clone()).collect())
    }

    /// Walk unresolved dependencies from the lowest-declared unresolved table
    /// until a table repeats. Every unresolved table still has an unresolved
    /// dependency, so the walk always closes a cycle.
    fn find_cycle(&self, remaining: &[usize]) -> CycleError {
        let unresolved = |i: usize| remaining[i] > 0;
        let Some(start) = (0..self.names.len()).find(|&i| unresolved(i)) else {
            return CycleError { tables: Vec::new() };
        };

        let mut path: Vec<usize> = Vec::new();
        let mut current = start;
        loop {
            if let Some(pos) = path.iter().position(|&n| n == current) {
                let mut tables: Vec<String> =
                    path[pos..].iter().map(|&i| self.names[i].clone()).collect();
                tables.push(self.names[current].clone());
                return CycleError { tables };
            }
            path.push(current);

            match self.dependencies[current].iter().copied().find(|&d| unresolved(d)) {
                Some(next) => current = next,
                None => {
                    return CycleError {
                        tables: path.iter().map(|&i| self.names[i].clone()).collect(),
                    };
                }
            }
        }
    }

    /// Get load order (dependencies before dependents)
    pub fn load_order(&self) -> Result<Vec<String>, CycleError> {
        self.topological_sort()
    }

    /// Order in which to empty tables before a re-run (reverse of load)
    pub fn delete_order(&self) -> Result<Vec<String>, CycleError> {
        let mut order = self.topological_sort()?;
        order.reverse();
        Ok(order)
    }

    /// Build plan entries for all tables with assigned positions
    pub fn plan_entries(&self) -> Result<Vec<PlanEntry>, CycleError> {
        let order = self.load_order()?;

        let entries = order
            .iter()
            .enumerate()
            .map(|(position, table)| PlanEntry {
                position: position + 1,
                table: table.clone(),
                category: self.categorize(table),
                depends_on: self.dependencies(table).into_iter().map(String::from).collect(),
                dependents: self.dependents(table).into_iter().map(String::from).collect(),
                self_referencing: self.is_self_referencing(table),
            })
            .collect();

        Ok(entries)
    }
}

/// One step of the load plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
    /// 1-based load position
    pub position: usize,
    pub table: String,
    pub category: DependencyCategory,
    pub depends_on: Vec<String>,
    pub dependents: Vec<String>,
    pub self_referencing: bool,
}

/// Error when a cycle is detected in the dependency graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    /// Cycle members in traversal order, first member repeated at the end
    pub tables: Vec<String>,
}

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Circular dependency detected: {}", self.tables.join(" -> "))
    }
}

impl std::error::Error for CycleError {}
