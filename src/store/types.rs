//! Store record types: schemas, rows, mutations and commit receipts.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Column values of one row, keyed by column name.
pub type RowValues = BTreeMap<String, Value>;

/// SQLite storage class of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }

    /// Map a declared SQLite type to a storage class using SQLite's affinity rules.
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            ColumnType::Integer
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") || upper.contains("NUM") {
            ColumnType::Real
        } else {
            ColumnType::Text
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Declared shape of one store table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Add a column (builder style).
    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(ColumnDef::new(name, column_type));
        self
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// One-line description, e.g. `inventory(item_id TEXT, price REAL)`.
    pub fn describe(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.column_type.as_sql()))
            .collect();
        format!("{}({})", self.name, cols.join(", "))
    }
}

/// Whether `s` is a plain SQL identifier (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

/// Names reserved for SQLite and the store's own bookkeeping.
pub fn is_internal_table(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("sqlite_") || lower.starts_with("_reflector")
}

/// A stored row with its SQLite rowid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub rowid: i64,
    pub values: RowValues,
}

impl Row {
    /// The row as a JSON object (rowid excluded).
    pub fn to_object(&self) -> Value {
        Value::Object(self.values.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

/// Tabular query output with column order preserved.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryRows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Render as a markdown table, showing at most `max_rows` rows.
    pub fn to_markdown(&self, max_rows: usize) -> String {
        if self.columns.is_empty() {
            return "(no columns)".to_string();
        }

        let mut out = String::new();
        out.push_str(&format!("| {} |\n", self.columns.join(" | ")));
        out.push_str(&format!("|{}\n", " --- |".repeat(self.columns.len())));

        for row in self.rows.iter().take(max_rows) {
            let cells: Vec<String> = row.iter().map(render_cell).collect();
            out.push_str(&format!("| {} |\n", cells.join(" | ")));
        }

        if self.rows.len() > max_rows {
            out.push_str(&format!("... and {} more rows\n", self.rows.len() - max_rows));
        }
        if self.rows.is_empty() {
            out.push_str("(no rows)\n");
        }

        out
    }
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.replace('|', "\\|"),
        other => other.to_string(),
    }
}

/// Simple comparison operators used by row filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cmp {
    #[default]
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
}

impl Cmp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Cmp::Eq => "=",
            Cmp::Ne => "<>",
            Cmp::Lt => "<",
            Cmp::Lte => "<=",
            Cmp::Gt => ">",
            Cmp::Gte => ">=",
            Cmp::Like => "LIKE",
        }
    }
}

/// One resolved `column <cmp> value` filter term. Terms are conjunctive.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub cmp: Cmp,
    pub value: Value,
}

impl Filter {
    pub fn new(column: impl Into<String>, cmp: Cmp, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            cmp,
            value: value.into(),
        }
    }

    /// Equality filter.
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, Cmp::Eq, value)
    }
}

/// A row-level change to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    Insert {
        table: String,
        rowid: i64,
        row: RowValues,
    },
    Update {
        table: String,
        rowid: i64,
        before: RowValues,
        after: RowValues,
    },
    Delete {
        table: String,
        rowid: i64,
        row: RowValues,
    },
}

impl Mutation {
    pub fn table(&self) -> &str {
        match self {
            Mutation::Insert { table, .. } | Mutation::Update { table, .. } | Mutation::Delete { table, .. } => table,
        }
    }

    pub fn rowid(&self) -> i64 {
        match self {
            Mutation::Insert { rowid, .. } | Mutation::Update { rowid, .. } | Mutation::Delete { rowid, .. } => *rowid,
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutation::Insert { table, rowid, .. } => write!(f, "insert {}#{}", table, rowid),
            Mutation::Update { table, rowid, .. } => write!(f, "update {}#{}", table, rowid),
            Mutation::Delete { table, rowid, .. } => write!(f, "delete {}#{}", table, rowid),
        }
    }
}

/// Who a commit belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Attribution {
    pub session_id: Option<String>,
    pub attempt: Option<u32>,
    pub artifact_id: String,
}

impl Attribution {
    /// Attribute to an artifact executed outside any session.
    pub fn artifact(artifact_id: impl Into<String>) -> Self {
        Self {
            session_id: None,
            attempt: None,
            artifact_id: artifact_id.into(),
        }
    }

    /// Attribute to one attempt of a session.
    pub fn attempt(session_id: impl Into<String>, attempt: u32, artifact_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            attempt: Some(attempt),
            artifact_id: artifact_id.into(),
        }
    }
}

/// Record of one committed change set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitReceipt {
    /// Store version after the commit
    pub version: u64,
    pub attribution: Attribution,
    pub mutations: usize,
    pub committed_at: DateTime<Utc>,
}

/// Result of a boundary write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WriteOutcome {
    Committed { receipt: CommitReceipt },
    Rejected { reason: String, current_version: u64 },
}

impl WriteOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, WriteOutcome::Committed { .. })
    }
}

/// Full, comparable copy of the store contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u64,
    pub tables: BTreeMap<String, Vec<Row>>,
}

/// Compute the ordered row-level diff between two states of one table.
pub fn diff_rows(table: &str, before: &[Row], after: &[Row]) -> Vec<Mutation> {
    let before: BTreeMap<i64, &RowValues> = before.iter().map(|r| (r.rowid, &r.values)).collect();
    let after: BTreeMap<i64, &RowValues> = after.iter().map(|r| (r.rowid, &r.values)).collect();

    let mut rowids: Vec<i64> = before.keys().chain(after.keys()).copied().collect();
    rowids.sort_unstable();
    rowids.dedup();

    let mut mutations = Vec::new();
    for rowid in rowids {
        match (before.get(&rowid), after.get(&rowid)) {
            (None, Some(row)) => mutations.push(Mutation::Insert {
                table: table.to_string(),
                rowid,
                row: (*row).clone(),
            }),
            (Some(row), None) => mutations.push(Mutation::Delete {
                table: table.to_string(),
                rowid,
                row: (*row).clone(),
            }),
            (Some(old), Some(new)) if old != new => mutations.push(Mutation::Update {
                table: table.to_string(),
                rowid,
                before: (*old).clone(),
                after: (*new).clone(),
            }),
            _ => {}
        }
    }
    mutations
}
