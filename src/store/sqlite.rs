//! SQLite-backed store with single-writer transactions and optimistic versioning.
//!
//! The connection lives behind a `Mutex`, so every transaction holds exclusive
//! access for its whole lifetime and concurrent sessions serialize. The store
//! version is bumped by every commit that carries mutations; boundary writes
//! that name an expected version are rejected when another writer got there
//! first.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, InterruptHandle, OptionalExtension, params_from_iter};
use serde_json::Value;

use super::types::{
    Attribution, ColumnDef, ColumnType, CommitReceipt, Filter, Mutation, QueryRows, Row, RowValues, StoreSnapshot,
    TableSchema, WriteOutcome, is_identifier, is_internal_table,
};
use crate::error::{ReflectorError, Result};
use crate::id::generate_ticket;

const META_TABLE: &str = "_reflector_meta";
const LOCK_POLL: Duration = Duration::from_millis(2);

struct StoreInner {
    conn: Connection,
    version: u64,
    tables: BTreeMap<String, TableSchema>,
    log: Vec<CommitReceipt>,
}

/// The shared, mutable domain state generated code may read and write.
pub struct Store {
    inner: Mutex<StoreInner>,
    interrupt: InterruptHandle,
    /// Ticket of the transaction currently holding the connection
    active: Mutex<Option<u64>>,
    /// Last committed version, readable without the connection lock
    committed: AtomicU64,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open a fresh in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Open or create a store backed by a SQLite file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY, value INTEGER NOT NULL);",
            META_TABLE
        ))?;

        let version: Option<i64> = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE key = 'version'", META_TABLE),
                [],
                |row| row.get(0),
            )
            .optional()?;

        let tables = load_tables(&conn)?;
        let interrupt = conn.get_interrupt_handle();
        let version = version.unwrap_or(0).max(0) as u64;

        Ok(Self {
            inner: Mutex::new(StoreInner {
                conn,
                version,
                tables,
                log: Vec::new(),
            }),
            interrupt,
            active: Mutex::new(None),
            committed: AtomicU64::new(version),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreInner>> {
        self.inner.lock().map_err(ReflectorError::poisoned)
    }

    /// Declare and create a new table.
    pub fn define_table(&self, schema: TableSchema) -> Result<()> {
        if !is_identifier(&schema.name) || is_internal_table(&schema.name) {
            return Err(ReflectorError::Store(format!("invalid table name: {}", schema.name)));
        }
        if schema.columns.is_empty() {
            return Err(ReflectorError::Store(format!("table {} has no columns", schema.name)));
        }
        if let Some(bad) = schema.columns.iter().find(|c| !is_identifier(&c.name)) {
            return Err(ReflectorError::Store(format!("invalid column name: {}", bad.name)));
        }

        let mut inner = self.lock()?;
        if inner.tables.contains_key(&schema.name) {
            return Err(ReflectorError::Store(format!("table already exists: {}", schema.name)));
        }

        let columns: Vec<String> = schema
            .columns
            .iter()
            .map(|c| format!("\"{}\" {}", c.name, c.column_type.as_sql()))
            .collect();
        inner
            .conn
            .execute_batch(&format!("CREATE TABLE \"{}\" ({});", schema.name, columns.join(", ")))?;

        tracing::debug!(table = %schema.name, "Table defined");
        inner.tables.insert(schema.name.clone(), schema);
        Ok(())
    }

    /// Current store version. Does not wait for a running transaction.
    pub fn version(&self) -> Result<u64> {
        Ok(self.committed.load(Ordering::Acquire))
    }

    /// All declared tables, ordered by name.
    pub fn tables(&self) -> Result<Vec<TableSchema>> {
        Ok(self.lock()?.tables.values().cloned().collect())
    }

    /// Look up one table's schema.
    pub fn table(&self, name: &str) -> Result<Option<TableSchema>> {
        Ok(self.lock()?.tables.get(name).cloned())
    }

    /// Begin a transaction. Blocks until no other transaction holds the store.
    pub fn begin(&self) -> Result<StoreTxn<'_>> {
        let guard = self.lock()?;
        self.start(guard)
    }

    /// Begin a transaction, giving up once `deadline` passes.
    ///
    /// Returns `None` when another transaction still holds the store at the
    /// deadline.
    pub fn begin_until(&self, deadline: Instant) -> Result<Option<StoreTxn<'_>>> {
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return self.start(guard).map(Some),
                Err(TryLockError::Poisoned(e)) => return Err(ReflectorError::poisoned(e)),
                Err(TryLockError::WouldBlock) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::debug!("Store still locked at deadline");
                        return Ok(None);
                    }
                    thread::sleep(LOCK_POLL.min(deadline - now));
                }
            }
        }
    }

    fn start<'a>(&'a self, guard: MutexGuard<'a, StoreInner>) -> Result<StoreTxn<'a>> {
        guard.conn.execute_batch("BEGIN IMMEDIATE")?;

        let ticket = generate_ticket();
        *self.active.lock().map_err(ReflectorError::poisoned)? = Some(ticket);

        Ok(StoreTxn {
            store: self,
            guard,
            ticket,
            finished: false,
        })
    }

    /// Abort the running statement of the transaction holding `ticket`.
    ///
    /// Returns false (and does nothing) when that transaction has already
    /// finished, so a late interrupt never lands on another session's work.
    pub fn interrupt(&self, ticket: u64) -> bool {
        match self.active.lock() {
            Ok(active) if *active == Some(ticket) => {
                self.interrupt.interrupt();
                true
            }
            _ => false,
        }
    }

    /// Run a read-only SQL statement outside any artifact execution.
    pub fn read(&self, sql: &str) -> Result<QueryRows> {
        let inner = self.lock()?;
        let stmt = inner.conn.prepare(sql)?;
        if !stmt.readonly() {
            return Err(ReflectorError::Store("read() only accepts read-only statements".to_string()));
        }
        drop(stmt);
        run_query(&inner.conn, sql, usize::MAX)?
            .ok_or_else(|| ReflectorError::Store("row limit exceeded".to_string()))
    }

    /// Insert rows into a table as one atomic commit.
    ///
    /// With `expected_version`, the write is rejected if the store has moved on.
    pub fn write(
        &self,
        table: &str,
        rows: &[RowValues],
        expected_version: Option<u64>,
        attribution: Attribution,
    ) -> Result<WriteOutcome> {
        let mut txn = self.begin()?;
        if let Some(expected) = expected_version
            && txn.base_version() != expected
        {
            let current = txn.base_version();
            txn.rollback()?;
            return Ok(WriteOutcome::Rejected {
                reason: format!("version conflict: expected {}, store is at {}", expected, current),
                current_version: current,
            });
        }

        for row in rows {
            txn.insert(table, row)?;
        }

        match txn.commit(attribution, rows.len())? {
            Some(receipt) => Ok(WriteOutcome::Committed { receipt }),
            None => Ok(WriteOutcome::Rejected {
                reason: "nothing to write".to_string(),
                current_version: self.version()?,
            }),
        }
    }

    /// Apply a staged change set if the store is still at `expected_version`.
    pub fn apply(&self, mutations: &[Mutation], expected_version: u64, attribution: Attribution) -> Result<WriteOutcome> {
        let mut txn = self.begin()?;
        let current = txn.base_version();
        if current != expected_version {
            txn.rollback()?;
            tracing::warn!(
                expected = expected_version,
                current = current,
                artifact_id = %attribution.artifact_id,
                "Change set rejected: version conflict"
            );
            return Ok(WriteOutcome::Rejected {
                reason: format!(
                    "version conflict: expected {}, store is at {}",
                    expected_version, current
                ),
                current_version: current,
            });
        }

        for mutation in mutations {
            txn.apply_mutation(mutation)?;
        }

        match txn.commit(attribution, mutations.len())? {
            Some(receipt) => Ok(WriteOutcome::Committed { receipt }),
            None => Ok(WriteOutcome::Rejected {
                reason: "empty change set".to_string(),
                current_version: current,
            }),
        }
    }

    /// Copy out every declared table.
    pub fn snapshot(&self) -> Result<StoreSnapshot> {
        let inner = self.lock()?;
        let mut tables = BTreeMap::new();
        for schema in inner.tables.values() {
            tables.insert(schema.name.clone(), select_rows(&inner.conn, schema, &[])?);
        }
        Ok(StoreSnapshot {
            version: inner.version,
            tables,
        })
    }

    /// Receipts of every commit made through this handle, oldest first.
    pub fn commit_log(&self) -> Result<Vec<CommitReceipt>> {
        Ok(self.lock()?.log.clone())
    }

    /// Schema block with a few sample rows per table, for prompts.
    pub fn describe(&self, sample_rows: usize) -> Result<String> {
        let inner = self.lock()?;
        let mut out = String::new();
        for schema in inner.tables.values() {
            out.push_str(&format!("Table {}\n", schema.describe()));
            let rows = select_rows(&inner.conn, schema, &[])?;
            out.push_str(&format!("  rows: {}\n", rows.len()));
            for row in rows.iter().take(sample_rows) {
                out.push_str(&format!("  sample: {}\n", row.to_object()));
            }
        }
        Ok(out)
    }
}

/// An open transaction. Rolls back on drop unless committed.
pub struct StoreTxn<'a> {
    store: &'a Store,
    guard: MutexGuard<'a, StoreInner>,
    ticket: u64,
    finished: bool,
}

impl<'a> StoreTxn<'a> {
    /// Ticket used to interrupt this transaction.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Store version at the start of the transaction.
    pub fn base_version(&self) -> u64 {
        self.guard.version
    }

    /// Schema of a declared table. Names match case-insensitively, as in SQLite.
    pub fn schema(&self, table: &str) -> Result<&TableSchema> {
        self.guard
            .tables
            .get(table)
            .or_else(|| {
                self.guard
                    .tables
                    .values()
                    .find(|schema| schema.name.eq_ignore_ascii_case(table))
            })
            .ok_or_else(|| ReflectorError::Store(format!("no such table: {}", table)))
    }

    /// Every declared table, ordered by name.
    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.guard.tables.values()
    }

    /// Every row of a table, ordered by rowid.
    pub fn table_rows(&self, table: &str) -> Result<Vec<Row>> {
        self.select(table, &[])
    }

    /// Rows matching all filters, ordered by rowid.
    pub fn select(&self, table: &str, filters: &[Filter]) -> Result<Vec<Row>> {
        let schema = self.schema(table)?;
        select_rows(&self.guard.conn, schema, filters)
    }

    /// Insert one row and return its rowid.
    pub fn insert(&mut self, table: &str, values: &RowValues) -> Result<i64> {
        let schema = self.schema(table)?;
        check_columns(schema, values.keys())?;

        if values.is_empty() {
            self.guard
                .conn
                .execute(&format!("INSERT INTO \"{}\" DEFAULT VALUES", table), [])?;
        } else {
            let columns: Vec<String> = values.keys().map(|c| format!("\"{}\"", c)).collect();
            let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{}", i)).collect();
            let params = values.values().map(to_sql).collect::<Result<Vec<_>>>()?;
            self.guard.conn.execute(
                &format!(
                    "INSERT INTO \"{}\" ({}) VALUES ({})",
                    table,
                    columns.join(", "),
                    placeholders.join(", ")
                ),
                params_from_iter(params.iter()),
            )?;
        }

        Ok(self.guard.conn.last_insert_rowid())
    }

    /// Overwrite the given columns of one row.
    pub fn update_row(&mut self, table: &str, rowid: i64, values: &RowValues) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let schema = self.schema(table)?;
        check_columns(schema, values.keys())?;

        let assignments: Vec<String> = values
            .keys()
            .enumerate()
            .map(|(i, c)| format!("\"{}\" = ?{}", c, i + 1))
            .collect();
        let mut params = values.values().map(to_sql).collect::<Result<Vec<_>>>()?;
        params.push(SqlValue::Integer(rowid));

        let changed = self.guard.conn.execute(
            &format!(
                "UPDATE \"{}\" SET {} WHERE rowid = ?{}",
                table,
                assignments.join(", "),
                params.len()
            ),
            params_from_iter(params.iter()),
        )?;
        if changed == 0 {
            return Err(ReflectorError::Store(format!("no row {}#{}", table, rowid)));
        }
        Ok(())
    }

    /// Delete one row.
    pub fn delete_row(&mut self, table: &str, rowid: i64) -> Result<()> {
        self.schema(table)?;
        let changed = self
            .guard
            .conn
            .execute(&format!("DELETE FROM \"{}\" WHERE rowid = ?1", table), [rowid])?;
        if changed == 0 {
            return Err(ReflectorError::Store(format!("no row {}#{}", table, rowid)));
        }
        Ok(())
    }

    /// Whether SQLite considers a statement read-only.
    pub fn is_readonly(&self, sql: &str) -> Result<bool> {
        let stmt = self.guard.conn.prepare(sql)?;
        Ok(stmt.readonly())
    }

    /// Run a query, returning `None` if it yields more than `max_rows` rows.
    pub fn query(&self, sql: &str, max_rows: usize) -> Result<Option<QueryRows>> {
        run_query(&self.guard.conn, sql, max_rows)
    }

    /// Run a write statement and return the number of affected rows.
    pub fn execute(&mut self, sql: &str) -> Result<usize> {
        Ok(self.guard.conn.execute(sql, [])?)
    }

    /// Replay one staged mutation.
    pub fn apply_mutation(&mut self, mutation: &Mutation) -> Result<()> {
        match mutation {
            Mutation::Insert { table, rowid, row } => {
                let schema = self.schema(table)?;
                check_columns(schema, row.keys())?;
                let mut columns = vec!["rowid".to_string()];
                columns.extend(row.keys().map(|c| format!("\"{}\"", c)));
                let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
                let mut params = vec![SqlValue::Integer(*rowid)];
                for value in row.values() {
                    params.push(to_sql(value)?);
                }
                self.guard.conn.execute(
                    &format!(
                        "INSERT INTO \"{}\" ({}) VALUES ({})",
                        table,
                        columns.join(", "),
                        placeholders.join(", ")
                    ),
                    params_from_iter(params.iter()),
                )?;
                Ok(())
            }
            Mutation::Update { table, rowid, after, .. } => self.update_row(table, *rowid, after),
            Mutation::Delete { table, rowid, .. } => self.delete_row(table, *rowid),
        }
    }

    /// Commit. Bumps the version and logs a receipt when `mutations > 0`.
    pub fn commit(mut self, attribution: Attribution, mutations: usize) -> Result<Option<CommitReceipt>> {
        let receipt = if mutations > 0 {
            let version = self.guard.version + 1;
            self.guard.conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO {} (key, value) VALUES ('version', ?1)",
                    META_TABLE
                ),
                [version as i64],
            )?;
            Some(CommitReceipt {
                version,
                attribution,
                mutations,
                committed_at: Utc::now(),
            })
        } else {
            None
        };

        self.guard.conn.execute_batch("COMMIT")?;
        self.finish();

        if let Some(receipt) = &receipt {
            self.guard.version = receipt.version;
            self.store.committed.store(receipt.version, Ordering::Release);
            self.guard.log.push(receipt.clone());
            tracing::info!(
                version = receipt.version,
                mutations = receipt.mutations,
                artifact_id = %receipt.attribution.artifact_id,
                "Store commit"
            );
        }
        Ok(receipt)
    }

    /// Discard every change made in this transaction.
    pub fn rollback(mut self) -> Result<()> {
        let result = self.abort();
        self.finish();
        result.map_err(ReflectorError::from)
    }

    /// SQLite already rolls back by itself when an interrupted write aborts
    /// the transaction; there is nothing left to undo then.
    fn abort(&self) -> rusqlite::Result<()> {
        if self.guard.conn.is_autocommit() {
            tracing::debug!(ticket = self.ticket, "Transaction already rolled back by SQLite");
            return Ok(());
        }
        self.guard.conn.execute_batch("ROLLBACK")
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Ok(mut active) = self.store.active.lock()
            && *active == Some(self.ticket)
        {
            *active = None;
        }
    }
}

impl Drop for StoreTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.abort() {
                tracing::error!(error = %e, "Rollback on drop failed");
            }
            self.finish();
        }
    }
}

fn load_tables(conn: &Connection) -> Result<BTreeMap<String, TableSchema>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    let mut tables = BTreeMap::new();
    for name in names {
        if is_internal_table(&name) || !is_identifier(&name) {
            continue;
        }
        let mut info = conn.prepare(&format!("PRAGMA table_info(\"{}\")", name))?;
        let columns = info
            .query_map([], |row| {
                let column: String = row.get(1)?;
                let declared: String = row.get(2)?;
                Ok(ColumnDef::new(column, ColumnType::from_declared(&declared)))
            })?
            .collect::<rusqlite::Result<Vec<ColumnDef>>>()?;
        tables.insert(name.clone(), TableSchema { name, columns });
    }
    Ok(tables)
}

fn check_columns<'k>(schema: &TableSchema, columns: impl Iterator<Item = &'k String>) -> Result<()> {
    for column in columns {
        if !schema.has_column(column) {
            return Err(ReflectorError::Store(format!("no such column: {}.{}", schema.name, column)));
        }
    }
    Ok(())
}

fn select_rows(conn: &Connection, schema: &TableSchema, filters: &[Filter]) -> Result<Vec<Row>> {
    check_columns(schema, filters.iter().map(|f| &f.column))?;

    let columns: Vec<String> = schema.columns.iter().map(|c| format!("\"{}\"", c.name)).collect();
    let mut sql = format!("SELECT rowid, {} FROM \"{}\"", columns.join(", "), schema.name);
    if !filters.is_empty() {
        let terms: Vec<String> = filters
            .iter()
            .enumerate()
            .map(|(i, f)| format!("\"{}\" {} ?{}", f.column, f.cmp.as_sql(), i + 1))
            .collect();
        sql.push_str(" WHERE ");
        sql.push_str(&terms.join(" AND "));
    }
    sql.push_str(" ORDER BY rowid");

    let params = filters.iter().map(|f| to_sql(&f.value)).collect::<Result<Vec<_>>>()?;
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(params.iter()))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let rowid: i64 = row.get(0)?;
        let mut values = RowValues::new();
        for (i, column) in schema.columns.iter().enumerate() {
            values.insert(column.name.clone(), from_sql(row.get_ref(i + 1)?));
        }
        out.push(Row { rowid, values });
    }
    Ok(out)
}

fn run_query(conn: &Connection, sql: &str, max_rows: usize) -> Result<Option<QueryRows>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        if out.len() >= max_rows {
            return Ok(None);
        }
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(from_sql(row.get_ref(i)?));
        }
        out.push(values);
    }
    Ok(Some(QueryRows { columns, rows: out }))
}

/// Convert a JSON value into an SQLite value.
pub fn to_sql(value: &Value) -> Result<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => SqlValue::Integer(i),
            (None, Some(f)) => SqlValue::Real(f),
            _ => return Err(ReflectorError::Store(format!("unsupported number: {}", n))),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => {
            return Err(ReflectorError::Store(format!("cannot store composite value: {}", value)));
        }
    })
}

/// Convert an SQLite value into JSON. Blobs are hex encoded.
pub fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

/// Whether an error is SQLite reporting an interrupted statement.
pub fn is_interrupted(err: &ReflectorError) -> bool {
    matches!(
        err,
        ReflectorError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::OperationInterrupted
    )
}
