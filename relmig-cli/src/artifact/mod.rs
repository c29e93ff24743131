//! Export artifacts: locating, reading and classifying per-table dumps

pub mod parser;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::catalog::TableDescriptor;

pub use parser::{DumpError, ParseError, ParsedDump, RawLiteral, parse_dump};

/// Where export artifacts come from
pub trait ArtifactSource: Send + Sync {
    /// Human-readable location of a table's artifact
    fn locate(&self, table: &TableDescriptor) -> String;

    /// Raw artifact bytes, `None` when the artifact does not exist
    fn fetch(&self, table: &TableDescriptor) -> Result<Option<Vec<u8>>>;
}

/// Artifacts stored as files in one export directory
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
    extension: String,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<artifact override>` or `<dir>/<table>.<extension>`
    pub fn path_for(&self, table: &TableDescriptor) -> PathBuf {
        match &table.artifact {
            Some(name) => self.dir.join(name),
            None => self.dir.join(format!("{}.{}", table.name, self.extension)),
        }
    }
}

impl ArtifactSource for DirectorySource {
    fn locate(&self, table: &TableDescriptor) -> String {
        self.path_for(table).display().to_string()
    }

    fn fetch(&self, table: &TableDescriptor) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(table);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read artifact {}", path.display())),
        }
    }
}

/// Artifacts held in memory, keyed by table name
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    artifacts: HashMap<String, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, table: &str, text: &str) -> Self {
        self.artifacts.insert(table.to_string(), text.as_bytes().to_vec());
        self
    }

    pub fn with_bytes(mut self, table: &str, bytes: &[u8]) -> Self {
        self.artifacts.insert(table.to_string(), bytes.to_vec());
        self
    }
}

impl ArtifactSource for MemorySource {
    fn locate(&self, table: &TableDescriptor) -> String {
        format!("memory:{}", table.name)
    }

    fn fetch(&self, table: &TableDescriptor) -> Result<Option<Vec<u8>>> {
        Ok(self.artifacts.get(&table.name).cloned())
    }
}

/// Result of reading one table's artifact
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactRead {
    Absent,
    /// Present but carrying no rows
    Empty,
    Parsed(ParsedDump),
    Invalid(DumpError),
}

/// Fetch and parse a table's artifact
pub fn read_artifact(source: &dyn ArtifactSource, table: &TableDescriptor) -> Result<ArtifactRead> {
    let Some(bytes) = source.fetch(table)? else {
        return Ok(ArtifactRead::Absent);
    };
    // Undecodable bytes are never replaced; the whole artifact is rejected
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            let offset = e.utf8_error().valid_up_to();
            log::warn!("{}: artifact is not valid UTF-8 at byte {}", table.name, offset);
            return Ok(ArtifactRead::Invalid(DumpError::Encoding { offset }));
        }
    };

    if text.trim().is_empty() {
        return Ok(ArtifactRead::Empty);
    }

    match parse_dump(&text, &table.name) {
        Ok(dump) if dump.rows.is_empty() => Ok(ArtifactRead::Empty),
        Ok(dump) => Ok(ArtifactRead::Parsed(dump)),
        Err(e) => Ok(ArtifactRead::Invalid(e)),
    }
}
