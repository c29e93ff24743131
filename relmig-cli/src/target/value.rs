//! Typed cell values exchanged with the target

use serde::{Deserialize, Serialize};

/// A single cell value as the target stores it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Canonical text form used to compare key values across types.
    ///
    /// `Integer(7)`, `Real(7.0)` and `Text("7")` all yield `"7"`, matching how
    /// the target compares a child key against an integer parent key.
    pub fn key_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Integer(i) => Some(i.to_string()),
            SqlValue::Real(f) => {
                if f.fract() == 0.0 && f.abs() < 9.0e15 {
                    Some(format!("{}", *f as i64))
                } else {
                    Some(f.to_string())
                }
            }
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Blob(b) => Some(format!("x'{}'", hex_string(b))),
        }
    }

    /// Short rendering for logs and reports
    pub fn display(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            other => other.key_text().unwrap_or_default(),
        }
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
