//! relmig: dependency-aware relational data migration
//!
//! Loads per-table export artifacts into an existing relational target in
//! foreign-key order, reconciling schema drift, repairing orphaned references
//! and producing an auditable reconciliation report.

pub mod artifact;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod graph;
pub mod loader;
pub mod lock;
pub mod repair;
pub mod report;
pub mod sanitize;
pub mod schema;
pub mod target;

pub use engine::Engine;
pub use error::{ErrorClass, MigrationError};
pub use report::{ReconciliationReport, RunStatus};
