//! Parser for row-insert export artifacts
//!
//! Accepts the statement subset that dump tools emit for data:
//! `INSERT [IGNORE] INTO <table> (<columns>) VALUES (...), (...);`.
//! Comments, conditional comments and session statements are skipped.

use std::iter::Peekable;
use std::str::CharIndices;

/// Statement keywords that carry no row data and are skipped whole
const SKIPPED_STATEMENTS: &[&str] = &[
    "SET", "LOCK", "UNLOCK", "ALTER", "DROP", "CREATE", "USE", "START", "BEGIN", "COMMIT",
];

/// One literal from a VALUES tuple, before any type interpretation
#[derive(Debug, Clone, PartialEq)]
pub enum RawLiteral {
    Null,
    /// Unquoted numeric text, sign and exponent preserved
    Number(String),
    /// Quoted text with escapes still encoded
    Quoted { raw: String, quote: char },
    Bool(bool),
    /// `0x...` or `X'...'` literal
    Hex(Vec<u8>),
}

/// Rows parsed from one artifact
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedDump {
    /// Table named by the INSERT statements
    pub table: String,
    /// Column list declared by the header
    pub columns: Vec<String>,
    pub rows: Vec<Vec<RawLiteral>>,
    /// Whether any statement used `INSERT IGNORE`
    pub ignore: bool,
}

/// Parse error with position information
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub position: usize,
    pub line: usize,
    pub context: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {} (offset {}): {} near '{}'",
            self.line, self.position, self.message, self.context
        )
    }
}

impl std::error::Error for ParseError {}

/// Why an artifact could not be turned into rows
#[derive(Debug, Clone, PartialEq)]
pub enum DumpError {
    /// The header (table name or column list) is malformed
    Header(String),
    /// A statement body could not be interpreted
    Body(ParseError),
    /// The artifact is not valid UTF-8 past this byte offset
    Encoding { offset: usize },
}

impl std::fmt::Display for DumpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DumpError::Header(msg) => write!(f, "unparseable header: {}", msg),
            DumpError::Body(err) => write!(f, "parse error at {}", err),
            DumpError::Encoding { offset } => write!(f, "invalid UTF-8 at byte {}", offset),
        }
    }
}

impl std::error::Error for DumpError {}

impl From<ParseError> for DumpError {
    fn from(err: ParseError) -> Self {
        DumpError::Body(err)
    }
}

/// Parse an artifact's text, checking every INSERT against `expected_table`
pub fn parse_dump(input: &str, expected_table: &str) -> Result<ParsedDump, DumpError> {
    let mut scanner = Scanner::new(input);
    let mut dump = ParsedDump {
        table: expected_table.to_string(),
        ..Default::default()
    };
    let mut header_seen = false;

    loop {
        scanner.skip_trivia()?;
        let Some(ch) = scanner.peek() else {
            break;
        };

        // Leftover terminator, e.g. after a conditional comment
        if ch == ';' {
            scanner.bump();
            continue;
        }

        let start = scanner.pos();
        let keyword = scanner.word().to_ascii_uppercase();
        match keyword.as_str() {
            "INSERT" => {
                let header = parse_insert_header(&mut scanner)?;

                if !header.table.eq_ignore_ascii_case(expected_table) {
                    return Err(DumpError::Header(format!(
                        "INSERT targets '{}' but the artifact belongs to '{}'",
                        header.table, expected_table
                    )));
                }
                if header_seen {
                    if header.columns != dump.columns {
                        return Err(DumpError::Header(
                            "statements declare different column lists".to_string(),
                        ));
                    }
                } else {
                    dump.columns = header.columns;
                    header_seen = true;
                }
                dump.ignore |= header.ignore;

                parse_values(&mut scanner, dump.columns.len(), &mut dump.rows)?;
            }
            kw if SKIPPED_STATEMENTS.contains(&kw) => {
                log::debug!("Skipping {} statement at offset {}", kw, start);
                scanner.skip_statement()?;
            }
            "" => {
                return Err(scanner.error_at(start, "unexpected character").into());
            }
            other => {
                return Err(scanner
                    .error_at(start, &format!("unsupported statement '{}'", other))
                    .into());
            }
        }
    }

    Ok(dump)
}

struct InsertHeader {
    table: String,
    columns: Vec<String>,
    ignore: bool,
}

fn parse_insert_header(scanner: &mut Scanner) -> Result<InsertHeader, DumpError> {
    let mut ignore = false;

    scanner.skip_trivia()?;
    let mut word = scanner.word().to_ascii_uppercase();
    while matches!(word.as_str(), "IGNORE" | "LOW_PRIORITY" | "DELAYED" | "HIGH_PRIORITY") {
        ignore |= word == "IGNORE";
        scanner.skip_trivia()?;
        word = scanner.word().to_ascii_uppercase();
    }
    if word != "INTO" {
        return Err(DumpError::Header("expected INTO after INSERT".to_string()));
    }

    scanner.skip_trivia()?;
    let mut table = scanner
        .identifier()?
        .ok_or_else(|| DumpError::Header("missing table name".to_string()))?;
    // Schema-qualified name: keep the table part
    while scanner.peek() == Some('.') {
        scanner.bump();
        table = scanner
            .identifier()?
            .ok_or_else(|| DumpError::Header("missing table name after '.'".to_string()))?;
    }

    scanner.skip_trivia()?;
    if scanner.peek() != Some('(') {
        return Err(DumpError::Header(format!(
            "INSERT into '{}' has no column list",
            table
        )));
    }
    scanner.bump();

    let mut columns: Vec<String> = Vec::new();
    loop {
        scanner.skip_trivia()?;
        let column = scanner
            .identifier()?
            .ok_or_else(|| DumpError::Header("malformed column list".to_string()))?;
        if columns.iter().any(|c| c.eq_ignore_ascii_case(&column)) {
            return Err(DumpError::Header(format!("duplicate column '{}'", column)));
        }
        columns.push(column);

        scanner.skip_trivia()?;
        match scanner.bump() {
            Some(',') => continue,
            Some(')') => break,
            _ => return Err(DumpError::Header("malformed column list".to_string())),
        }
    }

    scanner.skip_trivia()?;
    let values_start = scanner.pos();
    let keyword = scanner.word().to_ascii_uppercase();
    if keyword != "VALUES" && keyword != "VALUE" {
        return Err(scanner.error_at(values_start, "expected VALUES").into());
    }

    Ok(InsertHeader {
        table,
        columns,
        ignore,
    })
}

fn parse_values(
    scanner: &mut Scanner,
    arity: usize,
    rows: &mut Vec<Vec<RawLiteral>>,
) -> Result<(), ParseError> {
    loop {
        scanner.skip_trivia()?;
        let tuple_start = scanner.pos();
        if scanner.bump() != Some('(') {
            return Err(scanner.error_at(tuple_start, "expected '(' to open a row"));
        }

        let mut row = Vec::with_capacity(arity);
        loop {
            scanner.skip_trivia()?;
            row.push(scanner.literal()?);
            scanner.skip_trivia()?;
            let at = scanner.pos();
            match scanner.bump() {
                Some(',') => continue,
                Some(')') => break,
                _ => return Err(scanner.error_at(at, "expected ',' or ')' in row")),
            }
        }

        if row.len() != arity {
            return Err(scanner.error_at(
                tuple_start,
                &format!("row has {} values but header has {} columns", row.len(), arity),
            ));
        }
        rows.push(row);

        scanner.skip_trivia()?;
        let at = scanner.pos();
        match scanner.peek() {
            Some(',') => {
                scanner.bump();
            }
            Some(';') => {
                scanner.bump();
                return Ok(());
            }
            None => return Ok(()),
            _ => return Err(scanner.error_at(at, "expected ',' or ';' after row")),
        }
    }
}

/// Character scanner over the artifact text
struct Scanner<'a> {
    input: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
        }
    }

    fn pos(&mut self) -> usize {
        self.chars.peek().map(|(i, _)| *i).unwrap_or(self.input.len())
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn peek_second(&mut self) -> Option<char> {
        let pos = self.pos();
        self.input[pos..].chars().nth(1)
    }

    fn bump(&mut self) -> Option<char> {
        self.chars.next().map(|(_, c)| c)
    }

    fn error_at(&self, position: usize, message: &str) -> ParseError {
        let position = position.min(self.input.len());
        ParseError {
            message: message.to_string(),
            position,
            line: self.input[..position].matches('\n').count() + 1,
            context: self.input[position..].chars().take(20).collect(),
        }
    }

    /// Skip whitespace and all comment forms, including `/*! ... */`
    fn skip_trivia(&mut self) -> Result<(), ParseError> {
        loop {
            match (self.peek(), self.peek_second()) {
                (Some(c), _) if c.is_whitespace() => {
                    self.bump();
                }
                (Some('-'), Some('-')) | (Some('#'), _) => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                (Some('/'), Some('*')) => {
                    let start = self.pos();
                    self.bump();
                    self.bump();
                    let mut closed = false;
                    while let Some(c) = self.bump() {
                        if c == '*' && self.peek() == Some('/') {
                            self.bump();
                            closed = true;
                            break;
                        }
                    }
                    if !closed {
                        return Err(self.error_at(start, "unclosed comment"));
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Consume a bare word; empty when the next char cannot start one
    fn word(&mut self) -> &'a str {
        let start = self.pos();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '$' {
                self.bump();
            } else {
                break;
            }
        }
        let end = self.pos();
        let input = self.input;
        &input[start..end]
    }

    /// Skip to just past the next `;` outside quotes
    fn skip_statement(&mut self) -> Result<(), ParseError> {
        while let Some(c) = self.peek() {
            match c {
                ';' => {
                    self.bump();
                    return Ok(());
                }
                '\'' | '"' | '`' => {
                    self.quoted(c)?;
                }
                '-' | '#' | '/' => {
                    let before = self.pos();
                    self.skip_trivia()?;
                    if self.pos() == before {
                        self.bump();
                    }
                }
                _ => {
                    self.bump();
                }
            }
        }
        Ok(())
    }

    /// Bare, double-quoted, backticked or bracketed identifier
    fn identifier(&mut self) -> Result<Option<String>, ParseError> {
        match self.peek() {
            Some('"') => self.quoted('"').map(|raw| Some(raw.replace("\"\"", "\""))),
            Some('`') => self.quoted('`').map(|raw| Some(raw.replace("``", "`"))),
            Some('[') => {
                let start = self.pos();
                self.bump();
                let mut name = String::new();
                loop {
                    match self.bump() {
                        Some(']') if self.peek() == Some(']') => {
                            self.bump();
                            name.push(']');
                        }
                        Some(']') => return Ok(Some(name)),
                        Some(c) => name.push(c),
                        None => return Err(self.error_at(start, "unclosed bracketed identifier")),
                    }
                }
            }
            _ => {
                let word = self.word();
                Ok((!word.is_empty()).then(|| word.to_string()))
            }
        }
    }

    /// Consume a quoted run and return its raw contents.
    ///
    /// Backslash escapes and doubled quotes are kept as written; only the
    /// end of the run is decided here.
    fn quoted(&mut self, quote: char) -> Result<String, ParseError> {
        let start = self.pos();
        self.bump();
        let content_start = self.pos();

        loop {
            let at = self.pos();
            match self.bump() {
                Some('\\') if quote != '`' => {
                    if self.bump().is_none() {
                        return Err(self.error_at(start, "unterminated escape in quoted value"));
                    }
                }
                Some(c) if c == quote => {
                    if self.peek() == Some(quote) {
                        self.bump();
                    } else {
                        return Ok(self.input[content_start..at].to_string());
                    }
                }
                Some(_) => {}
                None => return Err(self.error_at(start, "unclosed quoted value")),
            }
        }
    }

    fn literal(&mut self) -> Result<RawLiteral, ParseError> {
        let start = self.pos();
        let Some(ch) = self.peek() else {
            return Err(self.error_at(start, "unexpected end of input in row"));
        };

        match ch {
            '\'' | '"' => {
                let raw = self.quoted(ch)?;
                Ok(RawLiteral::Quoted { raw, quote: ch })
            }
            '0' if matches!(self.peek_second(), Some('x') | Some('X')) => {
                self.bump();
                self.bump();
                let digits = self.word();
                decode_hex(digits).ok_or_else(|| self.error_at(start, "invalid hex literal"))
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => self.number(),
            _ => {
                let word = self.word();
                let upper = word.to_ascii_uppercase();
                let next = self.peek();
                match upper.as_str() {
                    "NULL" => Ok(RawLiteral::Null),
                    "TRUE" => Ok(RawLiteral::Bool(true)),
                    "FALSE" => Ok(RawLiteral::Bool(false)),
                    "X" if next == Some('\'') => {
                        let raw = self.quoted('\'')?;
                        decode_hex(&raw).ok_or_else(|| self.error_at(start, "invalid hex literal"))
                    }
                    // Charset introducer such as _utf8mb4'text'
                    _ if word.starts_with('_') && matches!(next, Some('\'') | Some('"')) => {
                        self.literal()
                    }
                    _ => Err(self.error_at(start, "unrecognized literal")),
                }
            }
        }
    }

    fn number(&mut self) -> Result<RawLiteral, ParseError> {
        let start = self.pos();
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.bump();
        }

        let mut digits = 0;
        let mut seen_dot = false;
        let mut seen_exp = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                digits += 1;
                self.bump();
            } else if c == '.' && !seen_dot && !seen_exp {
                seen_dot = true;
                self.bump();
            } else if (c == 'e' || c == 'E') && digits > 0 && !seen_exp {
                seen_exp = true;
                self.bump();
                if matches!(self.peek(), Some('-') | Some('+')) {
                    self.bump();
                }
            } else {
                break;
            }
        }

        if digits == 0 {
            return Err(self.error_at(start, "malformed number"));
        }
        let end = self.pos();
        Ok(RawLiteral::Number(self.input[start..end].to_string()))
    }
}

fn decode_hex(digits: &str) -> Option<RawLiteral> {
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let padded = if digits.len() % 2 == 1 {
        format!("0{}", digits)
    } else {
        digits.to_string()
    };

    let bytes = (0..padded.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&padded[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .ok()?;

    Some(RawLiteral::Hex(bytes))
}
