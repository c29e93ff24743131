//! Error taxonomy for migration runs
//!
//! Most failures travel as `anyhow::Error`. Failures the engine must classify
//! are represented by [`MigrationError`] so it can downcast and decide
//! whether a failure is table-scoped or aborts the run.

use serde::{Deserialize, Serialize};

/// Classification of every problem the engine can record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Cyclic graph, missing catalog entry, unreachable target
    ConfigurationError,
    /// Export declares a column the target lacks
    SchemaDriftWarning,
    /// Foreign key or uniqueness violation
    ConstraintViolation,
    /// Artifact could not be interpreted
    ParseError,
    /// Integrity enforcement could not be suspended or restored
    IntegrityGateFailure,
}

impl ErrorClass {
    /// Whether this class aborts the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorClass::ConfigurationError | ErrorClass::IntegrityGateFailure
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ErrorClass::ConfigurationError => "ConfigurationError",
            ErrorClass::SchemaDriftWarning => "SchemaDriftWarning",
            ErrorClass::ConstraintViolation => "ConstraintViolation",
            ErrorClass::ParseError => "ParseError",
            ErrorClass::IntegrityGateFailure => "IntegrityGateFailure",
        }
    }
}

/// Classified failures carried inside `anyhow::Error`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    /// Invalid catalog, unreachable target, or held run lock
    Configuration(String),
    /// Violations left after the repair pass; fails only the table
    ConstraintViolation(String),
    /// The constraint gate could not suspend or restore enforcement
    IntegrityGate(String),
    /// The run was cancelled by the operator
    Cancelled,
}

impl MigrationError {
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            MigrationError::Configuration(_) => Some(ErrorClass::ConfigurationError),
            MigrationError::ConstraintViolation(_) => Some(ErrorClass::ConstraintViolation),
            MigrationError::IntegrityGate(_) => Some(ErrorClass::IntegrityGateFailure),
            MigrationError::Cancelled => None,
        }
    }

    /// Find a `MigrationError` anywhere in an anyhow chain
    pub fn find(err: &anyhow::Error) -> Option<&MigrationError> {
        err.chain().find_map(|e| e.downcast_ref::<MigrationError>())
    }
}

impl std::fmt::Display for MigrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            MigrationError::ConstraintViolation(msg) => write!(f, "constraint violation: {}", msg),
            MigrationError::IntegrityGate(msg) => write!(f, "integrity gate failure: {}", msg),
            MigrationError::Cancelled => write!(f, "run cancelled"),
        }
    }
}

impl std::error::Error for MigrationError {}
