//! Data sanitizer: turns raw export literals into values the target accepts
//!
//! This module provides:
//! - Escape decoding across mixed quoting conventions
//! - Literal normalisation by live column type (empty, zero dates, booleans, numerics)
//! - Unique-key disambiguation with deterministic discriminator suffixes
//! - Manual-review flagging for duplicates that cannot be disambiguated

use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::artifact::RawLiteral;
use crate::catalog::{ColumnDescriptor, ColumnType, TableDescriptor};
use crate::target::SqlValue;

/// Highest discriminator tried before a duplicate is flagged
pub const MAX_DISCRIMINATOR: usize = 1000;

/// Counters describing what the sanitizer changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SanitizeStats {
    /// Values that carried escape sequences or doubled quotes
    pub escaped_values: u64,
    /// Empty strings stored as NULL in non-text columns
    pub empty_to_null: u64,
    /// Zero dates stored as NULL
    pub zero_dates: u64,
    /// Boolean spellings stored as 1/0
    pub booleans: u64,
    /// Numeric text stored as integers
    pub numeric_coercions: u64,
    /// Duplicate unique values given a discriminator suffix
    pub disambiguated: u64,
    /// Rows withheld for manual review
    pub flagged: u64,
}

/// A duplicate unique value that was renamed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Disambiguation {
    /// 1-based position of the row in the export
    pub row: usize,
    pub column: String,
    pub original: String,
    pub assigned: String,
}

/// A row withheld from the load because it could not be repaired safely
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlaggedRow {
    /// 1-based position of the row in the export
    pub row: usize,
    pub column: String,
    pub value: String,
    pub reason: String,
}

/// Sanitized rows ready for the loader
#[derive(Debug, Clone, Default)]
pub struct SanitizedTable {
    pub rows: Vec<Vec<SqlValue>>,
    pub stats: SanitizeStats,
    pub disambiguated: Vec<Disambiguation>,
    pub flagged: Vec<FlaggedRow>,
    /// Key values of withheld rows: lowercase column -> canonical key text
    pub withheld_keys: HashMap<String, HashSet<String>>,
}

/// Decode a quoted literal's escapes into stored text.
///
/// Handles doubled quotes and backslash escapes as dump tools write them.
/// Returns the text and whether anything was decoded.
pub fn decode_escapes(raw: &str, quote: char) -> (String, bool) {
    let mut out = String::with_capacity(raw.len());
    let mut escaped = false;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            let Some(next) = chars.next() else {
                out.push('\\');
                break;
            };
            escaped = true;
            match next {
                'n' => out.push('\n'),
                'r' => out.push('\r'),
                't' => out.push('\t'),
                '0' => out.push('\0'),
                'Z' => out.push('\u{1a}'),
                'b' => out.push('\u{8}'),
                // Pattern escapes keep their backslash
                '%' | '_' => {
                    out.push('\\');
                    out.push(next);
                }
                other => out.push(other),
            }
        } else if c == quote && chars.peek() == Some(&quote) {
            chars.next();
            escaped = true;
            out.push(quote);
        } else {
            out.push(c);
        }
    }

    (out, escaped)
}

fn parse_boolean(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

fn is_zero_date(text: &str) -> bool {
    let text = text.trim();
    text.starts_with("0000-00-00")
        && text["0000-00-00".len()..]
            .chars()
            .all(|c| matches!(c, '0' | ':' | ' ' | '.' | 'T'))
}

fn parse_number(text: &str) -> Option<SqlValue> {
    let trimmed = text.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(SqlValue::Integer(i));
    }
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(SqlValue::Real)
}

/// Row-wise sanitizer bound to one table's insert columns
pub struct Sanitizer {
    columns: Vec<ColumnDescriptor>,
    key_columns: Vec<usize>,
}

impl Sanitizer {
    /// Build a sanitizer for `insert_columns`, typed by the live schema.
    ///
    /// Key columns are those declared unique in the catalog or the target,
    /// plus a single-column primary key.
    pub fn new(
        insert_columns: &[String],
        live_columns: &[ColumnDescriptor],
        table: Option<&TableDescriptor>,
    ) -> Self {
        let live_pk: Vec<&ColumnDescriptor> =
            live_columns.iter().filter(|c| c.primary_key).collect();

        let columns: Vec<ColumnDescriptor> = insert_columns
            .iter()
            .map(|name| {
                live_columns
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(name))
                    .cloned()
                    .unwrap_or_else(|| ColumnDescriptor::nullable(name.clone(), ColumnType::Text))
            })
            .collect();

        let key_columns = columns
            .iter()
            .enumerate()
            .filter(|(_, column)| {
                let declared_unique = table
                    .and_then(|t| t.column(&column.name))
                    .map(|c| c.unique)
                    .unwrap_or(false);
                let single_pk = column.primary_key && live_pk.len() == 1;
                column.unique || declared_unique || single_pk
            })
            .map(|(i, _)| i)
            .collect();

        Self {
            columns,
            key_columns,
        }
    }

    pub fn key_column_names(&self) -> Vec<&str> {
        self.key_columns
            .iter()
            .map(|&i| self.columns[i].name.as_str())
            .collect()
    }

    /// Convert one literal for a column, updating counters
    fn convert(&self, column: &ColumnDescriptor, literal: &RawLiteral, stats: &mut SanitizeStats) -> SqlValue {
        match literal {
            RawLiteral::Null => SqlValue::Null,
            RawLiteral::Bool(b) => SqlValue::Integer(i64::from(*b)),
            RawLiteral::Hex(bytes) => SqlValue::Blob(bytes.clone()),
            RawLiteral::Number(text) => match column.column_type {
                ColumnType::Text => SqlValue::Text(text.clone()),
                ColumnType::Integer => match parse_number(text) {
                    Some(SqlValue::Real(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => {
                        stats.numeric_coercions += 1;
                        SqlValue::Integer(f as i64)
                    }
                    Some(value) => value,
                    None => SqlValue::Text(text.clone()),
                },
                _ => parse_number(text).unwrap_or_else(|| SqlValue::Text(text.clone())),
            },
            RawLiteral::Quoted { raw, quote } => {
                let (text, escaped) = decode_escapes(raw, *quote);
                if escaped {
                    stats.escaped_values += 1;
                }
                self.normalise_text(column, text, stats)
            }
        }
    }

    fn normalise_text(&self, column: &ColumnDescriptor, text: String, stats: &mut SanitizeStats) -> SqlValue {
        let typed = matches!(
            column.column_type,
            ColumnType::Integer | ColumnType::Decimal | ColumnType::Boolean | ColumnType::Timestamp
        );
        if typed && text.trim().is_empty() {
            stats.empty_to_null += 1;
            return SqlValue::Null;
        }

        match column.column_type {
            ColumnType::Timestamp if is_zero_date(&text) => {
                stats.zero_dates += 1;
                SqlValue::Null
            }
            ColumnType::Boolean => match parse_boolean(&text) {
                Some(b) => {
                    stats.booleans += 1;
                    SqlValue::Integer(i64::from(b))
                }
                None => SqlValue::Text(text),
            },
            ColumnType::Integer => match text.trim().parse::<i64>() {
                Ok(i) => {
                    stats.numeric_coercions += 1;
                    SqlValue::Integer(i)
                }
                Err(_) => SqlValue::Text(text),
            },
            _ => SqlValue::Text(text),
        }
    }

    /// Sanitize all rows of one export
    pub fn sanitize(&self, rows: &[Vec<RawLiteral>]) -> SanitizedTable {
        let mut result = SanitizedTable::default();

        let mut converted: Vec<Vec<SqlValue>> = rows
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&self.columns)
                    .map(|(literal, column)| self.convert(column, literal, &mut result.stats))
                    .collect()
            })
            .collect();

        let mut withheld = vec![false; converted.len()];
        for &col in &self.key_columns {
            self.disambiguate(col, &mut converted, &mut withheld, &mut result);
        }

        for (index, row) in converted.into_iter().enumerate() {
            if withheld[index] {
                for (column, value) in self.columns.iter().zip(&row) {
                    if let Some(key) = value.key_text() {
                        result
                            .withheld_keys
                            .entry(column.name.to_lowercase())
                            .or_default()
                            .insert(key);
                    }
                }
            } else {
                result.rows.push(row);
            }
        }

        result.stats.flagged = result.flagged.len() as u64;
        result.stats.disambiguated = result.disambiguated.len() as u64;
        result
    }

    fn disambiguate(
        &self,
        col: usize,
        rows: &mut [Vec<SqlValue>],
        withheld: &mut [bool],
        result: &mut SanitizedTable,
    ) {
        let column = &self.columns[col];
        let originals: HashSet<String> = rows
            .iter()
            .filter_map(|row| row.get(col).and_then(SqlValue::key_text))
            .collect();
        let mut used: HashSet<String> = HashSet::new();

        for (index, row) in rows.iter_mut().enumerate() {
            if withheld[index] {
                continue;
            }
            let Some(key) = row.get(col).and_then(SqlValue::key_text) else {
                continue;
            };
            if used.insert(key.clone()) {
                continue;
            }

            let text = match &row[col] {
                SqlValue::Text(s) if column.column_type.is_textual() => Some(s.clone()),
                _ => None,
            };
            let Some(text) = text else {
                log::warn!(
                    "{}: duplicate non-text key '{}' in row {}; flagged for manual review",
                    column.name,
                    key,
                    index + 1
                );
                withheld[index] = true;
                result.flagged.push(FlaggedRow {
                    row: index + 1,
                    column: column.name.clone(),
                    value: key,
                    reason: "duplicate non-text unique key".to_string(),
                });
                continue;
            };

            let candidate = (2..=MAX_DISCRIMINATOR)
                .map(|n| format!("{}_{}", text, n))
                .find(|c| !originals.contains(c) && !used.contains(c));

            match candidate {
                Some(assigned) => {
                    log::warn!(
                        "{}: duplicate unique value '{}' in row {} renamed to '{}'",
                        column.name,
                        text,
                        index + 1,
                        assigned
                    );
                    used.insert(assigned.clone());
                    result.disambiguated.push(Disambiguation {
                        row: index + 1,
                        column: column.name.clone(),
                        original: text,
                        assigned: assigned.clone(),
                    });
                    row[col] = SqlValue::Text(assigned);
                }
                None => {
                    log::warn!(
                        "{}: no free discriminator for '{}' in row {}; flagged for manual review",
                        column.name,
                        text,
                        index + 1
                    );
                    withheld[index] = true;
                    result.flagged.push(FlaggedRow {
                        row: index + 1,
                        column: column.name.clone(),
                        value: text,
                        reason: format!("no free discriminator within {}", MAX_DISCRIMINATOR),
                    });
                }
            }
        }
    }
}
