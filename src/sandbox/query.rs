//! Lexical linter and runner for `query` artifacts.
//!
//! A query artifact is exactly one SQLite statement. The linter tokenizes it
//! (string literals, quoted identifiers and comments are understood, so a
//! keyword inside a string is never mistaken for one outside it) and
//! classifies it before anything is prepared against the store.

use serde_json::json;

use super::capability::{CapabilitySet, Meter};
use super::fault::{Fault, MalformedArtifact};
use crate::domain::{ArtifactKind, ExecutionOutput};
use crate::store::{StoreTxn, is_internal_table};

/// Statements that change schema, attach files, or control transactions.
const FORBIDDEN_STATEMENTS: &[&str] = &[
    "ATTACH", "DETACH", "PRAGMA", "CREATE", "DROP", "ALTER", "VACUUM", "BEGIN", "COMMIT", "END", "ROLLBACK",
    "SAVEPOINT", "RELEASE", "REINDEX", "ANALYZE",
];

/// Functions that reach outside the database or load native code.
const FORBIDDEN_FUNCTIONS: &[&str] = &["LOAD_EXTENSION", "READFILE", "WRITEFILE", "EDIT", "FTS3_TOKENIZER", "FTS5"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Bare word, upper-cased, with its original spelling
    Word { upper: String, raw: String },
    /// `"ident"`, `` `ident` `` or `[ident]`
    Quoted(String),
    Str,
    Number,
    Punct(char),
}

/// What a statement does to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryClass {
    Read,
    Write { table: String },
}

/// A linted, single statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// The statement text without a trailing terminator or comment
    pub sql: String,
    pub class: QueryClass,
    /// Whether the statement reads tables (a SELECT appears anywhere)
    pub reads: bool,
}

/// Why a statement was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LintError {
    Malformed(MalformedArtifact),
    Forbidden(String),
}

impl LintError {
    fn malformed(reason: impl Into<String>) -> Self {
        LintError::Malformed(MalformedArtifact::new(ArtifactKind::Query, reason))
    }

    pub fn into_fault(self) -> Fault {
        match self {
            LintError::Malformed(m) => Fault::runtime(m.to_string()),
            LintError::Forbidden(reason) => Fault::capability(reason),
        }
    }
}

/// Tokenize `source`, returning the tokens and the byte offset where the
/// statement ends (before any terminator).
fn tokenize(source: &str) -> Result<(Vec<Token>, usize), LintError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut end = 0;
    let mut terminated = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c == b'-' && bytes.get(i + 1) == Some(&b'-') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if c == b'/' && bytes.get(i + 1) == Some(&b'*') {
            match source[i + 2..].find("*/") {
                Some(off) => i = i + 2 + off + 2,
                None => return Err(LintError::malformed("unterminated block comment")),
            }
            continue;
        }

        if terminated {
            return Err(LintError::malformed("multiple statements are not allowed"));
        }
        if c == b';' {
            terminated = true;
            i += 1;
            continue;
        }

        let start = i;
        match c {
            b'\'' => {
                i = skip_quoted(bytes, i, b'\'').ok_or_else(|| LintError::malformed("unterminated string literal"))?;
                tokens.push(Token::Str);
            }
            b'"' | b'`' => {
                i = skip_quoted(bytes, i, c).ok_or_else(|| LintError::malformed("unterminated quoted identifier"))?;
                tokens.push(Token::Quoted(unquote(&source[start + 1..i - 1], c)));
            }
            b'[' => {
                let off = source[i..]
                    .find(']')
                    .ok_or_else(|| LintError::malformed("unterminated bracketed identifier"))?;
                tokens.push(Token::Quoted(source[i + 1..i + off].to_string()));
                i += off + 1;
            }
            b'x' | b'X' if bytes.get(i + 1) == Some(&b'\'') => {
                i = skip_quoted(bytes, i + 1, b'\'').ok_or_else(|| LintError::malformed("unterminated blob literal"))?;
                tokens.push(Token::Str);
            }
            c if c.is_ascii_alphabetic() || c == b'_' || c >= 0x80 => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$' || bytes[i] >= 0x80) {
                    i += 1;
                }
                let raw = source[start..i].to_string();
                tokens.push(Token::Word {
                    upper: raw.to_ascii_uppercase(),
                    raw,
                });
            }
            c if c.is_ascii_digit() => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.') {
                    i += 1;
                }
                tokens.push(Token::Number);
            }
            other => {
                tokens.push(Token::Punct(other as char));
                i += 1;
            }
        }
        end = i;
    }

    Ok((tokens, end))
}

/// Index just past the closing quote, honoring doubled-quote escapes.
fn skip_quoted(bytes: &[u8], open: usize, quote: u8) -> Option<usize> {
    let mut i = open + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

fn unquote(inner: &str, quote: u8) -> String {
    let q = quote as char;
    inner.replace(&format!("{}{}", q, q), &q.to_string())
}

fn ident(token: Option<&Token>) -> Option<String> {
    match token {
        Some(Token::Word { raw, .. }) => Some(raw.clone()),
        Some(Token::Quoted(name)) => Some(name.clone()),
        _ => None,
    }
}

fn is_word(token: Option<&Token>, word: &str) -> bool {
    matches!(token, Some(Token::Word { upper, .. }) if upper == word)
}

/// Read a possibly schema-qualified table name starting at `i`.
fn table_name(tokens: &[Token], i: usize) -> Result<String, LintError> {
    let first = ident(tokens.get(i)).ok_or_else(|| LintError::malformed("expected a table name"))?;
    if tokens.get(i + 1) == Some(&Token::Punct('.')) {
        let table = ident(tokens.get(i + 2)).ok_or_else(|| LintError::malformed("expected a table name after '.'"))?;
        if !first.eq_ignore_ascii_case("main") {
            return Err(LintError::Forbidden(format!("schema '{}' is not accessible", first)));
        }
        Ok(table)
    } else {
        Ok(first)
    }
}

/// Skip an optional `OR <conflict-resolution>` clause.
fn skip_or_clause(tokens: &[Token], i: usize) -> usize {
    if is_word(tokens.get(i), "OR") { i + 2 } else { i }
}

/// Target table of a write statement whose verb is at `i`.
fn write_target(tokens: &[Token], i: usize) -> Result<String, LintError> {
    let verb = match tokens.get(i) {
        Some(Token::Word { upper, .. }) => upper.as_str(),
        _ => return Err(LintError::malformed("expected a statement")),
    };
    match verb {
        "INSERT" | "REPLACE" => {
            let mut j = skip_or_clause(tokens, i + 1);
            if !is_word(tokens.get(j), "INTO") {
                return Err(LintError::malformed("expected INTO after INSERT"));
            }
            j += 1;
            table_name(tokens, j)
        }
        "UPDATE" => table_name(tokens, skip_or_clause(tokens, i + 1)),
        "DELETE" => {
            if !is_word(tokens.get(i + 1), "FROM") {
                return Err(LintError::malformed("expected FROM after DELETE"));
            }
            table_name(tokens, i + 2)
        }
        other => Err(LintError::malformed(format!("unexpected {}", other))),
    }
}

/// Lint one statement.
pub fn lint(source: &str) -> Result<Statement, LintError> {
    let (tokens, end) = tokenize(source)?;
    if tokens.is_empty() {
        return Err(LintError::malformed("empty statement"));
    }

    for (i, token) in tokens.iter().enumerate() {
        let name = match token {
            Token::Word { upper, raw } => {
                if FORBIDDEN_FUNCTIONS.contains(&upper.as_str()) && tokens.get(i + 1) == Some(&Token::Punct('(')) {
                    return Err(LintError::Forbidden(format!("function {} is not available", raw)));
                }
                raw
            }
            Token::Quoted(name) => name,
            _ => continue,
        };
        if is_internal_table(name) {
            return Err(LintError::Forbidden(format!("internal table {} is not accessible", name)));
        }
    }

    let first = match &tokens[0] {
        Token::Word { upper, .. } => upper.as_str(),
        _ => return Err(LintError::malformed("statement must start with a keyword")),
    };

    if FORBIDDEN_STATEMENTS.contains(&first) {
        return Err(LintError::Forbidden(format!("{} statements are not allowed", first)));
    }

    let class = match first {
        "SELECT" | "VALUES" => QueryClass::Read,
        "INSERT" | "REPLACE" | "UPDATE" | "DELETE" => QueryClass::Write {
            table: write_target(&tokens, 0)?,
        },
        "WITH" => {
            let mut depth = 0i32;
            let mut verb = None;
            for (i, token) in tokens.iter().enumerate() {
                match token {
                    Token::Punct('(') => depth += 1,
                    Token::Punct(')') => depth -= 1,
                    Token::Word { upper, .. } if depth == 0 => match upper.as_str() {
                        "SELECT" | "VALUES" => {
                            verb = Some(None);
                            break;
                        }
                        "INSERT" | "REPLACE" | "UPDATE" | "DELETE" => {
                            verb = Some(Some(i));
                            break;
                        }
                        _ => {}
                    },
                    _ => {}
                }
            }
            match verb {
                Some(None) => QueryClass::Read,
                Some(Some(i)) => QueryClass::Write {
                    table: write_target(&tokens, i)?,
                },
                None => return Err(LintError::malformed("WITH clause without a statement")),
            }
        }
        "EXPLAIN" => return Err(LintError::Forbidden("EXPLAIN statements are not allowed".to_string())),
        other => return Err(LintError::malformed(format!("'{}' does not start a SQL statement", other))),
    };

    let reads = tokens.iter().any(|t| is_word(Some(t), "SELECT"));

    Ok(Statement {
        sql: source[..end].trim().to_string(),
        class,
        reads,
    })
}

/// Check that a statement stays within `caps` before it runs.
pub fn check(statement: &Statement, caps: &CapabilitySet) -> Result<(), Fault> {
    match &statement.class {
        QueryClass::Read => caps.check_read("query"),
        QueryClass::Write { table } => {
            caps.check_write(table)?;
            if statement.reads {
                caps.check_read("subquery")?;
            }
            Ok(())
        }
    }
}

/// Run a linted statement inside an open transaction.
pub fn run(txn: &mut StoreTxn<'_>, statement: &Statement, caps: &CapabilitySet, meter: &mut Meter) -> Result<ExecutionOutput, Fault> {
    meter.step()?;
    check(statement, caps)?;

    match &statement.class {
        QueryClass::Read => {
            let readonly = txn.is_readonly(&statement.sql).map_err(Fault::from_store)?;
            if !readonly {
                return Err(Fault::capability("statement is not read-only"));
            }
            match txn.query(&statement.sql, meter.max_rows()).map_err(Fault::from_store)? {
                Some(rows) => Ok(ExecutionOutput::Table(rows)),
                None => Err(Fault::capability(format!(
                    "query returned more than {} rows",
                    meter.max_rows()
                ))),
            }
        }
        QueryClass::Write { .. } => {
            let affected = txn.execute(&statement.sql).map_err(Fault::from_store)?;
            meter.record_mutations(affected)?;
            Ok(ExecutionOutput::Value(json!({ "rows_affected": affected })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExecutionStatus;
    use crate::sandbox::ResourceLimits;
    use crate::store::{Demo, demo_store};

    fn forbidden(sql: &str) -> bool {
        matches!(lint(sql), Err(LintError::Forbidden(_)))
    }

    fn malformed(sql: &str) -> bool {
        matches!(lint(sql), Err(LintError::Malformed(_)))
    }

    #[test]
    fn test_classify_reads() {
        let stmt = lint("SELECT color, SUM(quantity) FROM sales GROUP BY color;").unwrap();
        assert_eq!(stmt.class, QueryClass::Read);
        assert_eq!(stmt.sql, "SELECT color, SUM(quantity) FROM sales GROUP BY color");

        let cte = lint("WITH t AS (SELECT 1 AS n) SELECT n FROM t -- trailing comment").unwrap();
        assert_eq!(cte.class, QueryClass::Read);
        assert!(!cte.sql.contains("comment"));
    }

    #[test]
    fn test_classify_writes() {
        let cases = [
            ("INSERT INTO sales (product) VALUES ('x')", "sales"),
            ("INSERT OR REPLACE INTO \"sales\" (product) VALUES ('x')", "sales"),
            ("UPDATE OR IGNORE main.inventory SET price = 1", "inventory"),
            ("DELETE FROM [transactions] WHERE amount < 0", "transactions"),
            ("WITH gone AS (SELECT 1) DELETE FROM sales WHERE sale_id IN (SELECT * FROM gone)", "sales"),
        ];
        for (sql, table) in cases {
            assert_eq!(
                lint(sql).unwrap().class,
                QueryClass::Write {
                    table: table.to_string()
                },
                "{}",
                sql
            );
        }
    }

    #[test]
    fn test_forbidden_statements() {
        assert!(forbidden("ATTACH DATABASE '/tmp/x.db' AS x"));
        assert!(forbidden("pragma writable_schema = 1"));
        assert!(forbidden("DROP TABLE sales"));
        assert!(forbidden("BEGIN"));
        assert!(forbidden("SELECT * FROM sqlite_master"));
        assert!(forbidden("SELECT * FROM \"_reflector_meta\""));
        assert!(forbidden("SELECT writefile('/tmp/out', 'data')"));
        assert!(forbidden("SELECT load_extension('evil')"));
        assert!(forbidden("INSERT INTO temp.sales VALUES (1)"));
    }

    #[test]
    fn test_keywords_inside_literals_are_ignored() {
        let stmt = lint("SELECT 'DROP TABLE sales; --' AS note, \"a;b\" FROM sales").unwrap();
        assert_eq!(stmt.class, QueryClass::Read);
        assert!(lint("SELECT 'it''s' AS s").is_ok());
    }

    #[test]
    fn test_malformed() {
        assert!(malformed(""));
        assert!(malformed("   -- only a comment"));
        assert!(malformed("SELECT 1; SELECT 2"));
        assert!(malformed("SELECT 'open"));
        assert!(malformed("SELECT 1 /* open"));
        assert!(malformed("import os"));
        assert!(malformed("DELETE sales"));
    }

    #[test]
    fn test_check_capabilities() {
        let read = lint("SELECT * FROM sales").unwrap();
        assert!(check(&read, &CapabilitySet::none()).is_err());
        assert!(check(&read, &CapabilitySet::read_only()).is_ok());

        let write = lint("UPDATE sales SET quantity = 0").unwrap();
        let err = check(&write, &CapabilitySet::read_only()).unwrap_err();
        assert_eq!(err.status, ExecutionStatus::CapabilityViolation);
        assert!(check(&write, &CapabilitySet::none().with_write("sales")).is_ok());

        let copy = lint("INSERT INTO sales SELECT * FROM sales").unwrap();
        assert!(check(&copy, &CapabilitySet::none().with_write("sales")).is_err());
    }

    #[test]
    fn test_run_read_and_row_budget() {
        let store = demo_store(Demo::Sales).unwrap();
        let mut txn = store.begin().unwrap();
        let caps = CapabilitySet::read_only();

        let stmt = lint("SELECT product FROM sales WHERE color = 'red' ORDER BY sale_id").unwrap();
        let mut meter = Meter::start(&ResourceLimits::default());
        let output = run(&mut txn, &stmt, &caps, &mut meter).unwrap();
        assert_eq!(output.as_table().unwrap().len(), 3);

        let mut tight = Meter::start(&ResourceLimits::default().with_max_rows(2));
        let err = run(&mut txn, &stmt, &caps, &mut tight).unwrap_err();
        assert_eq!(err.status, ExecutionStatus::CapabilityViolation);
    }

    #[test]
    fn test_run_write_counts_mutations() {
        let store = demo_store(Demo::Sales).unwrap();
        let mut txn = store.begin().unwrap();
        let caps = CapabilitySet::none().with_write("sales");
        let stmt = lint("UPDATE sales SET quantity = quantity + 1 WHERE color = 'black'").unwrap();

        let mut meter = Meter::start(&ResourceLimits::default());
        let output = run(&mut txn, &stmt, &caps, &mut meter).unwrap();
        assert_eq!(output.as_value().unwrap()["rows_affected"], json!(4));

        let mut tight = Meter::start(&ResourceLimits::default().with_max_mutations(3));
        let err = run(&mut txn, &stmt, &caps, &mut tight).unwrap_err();
        assert_eq!(err.status, ExecutionStatus::CapabilityViolation);
    }

    #[test]
    fn test_runtime_error_for_unknown_column() {
        let store = demo_store(Demo::Sales).unwrap();
        let mut txn = store.begin().unwrap();
        let stmt = lint("SELECT colour FROM sales").unwrap();
        let mut meter = Meter::start(&ResourceLimits::default());
        let err = run(&mut txn, &stmt, &CapabilitySet::read_only(), &mut meter).unwrap_err();
        assert_eq!(err.status, ExecutionStatus::RuntimeError);
    }
}
