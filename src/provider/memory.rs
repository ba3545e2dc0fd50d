//! In-memory provider.
//!
//! A logical backend holding tables as plain maps. It honors the full
//! [`Provider`] contract by interpreting each statement's
//! [`StatementKind`] instead of parsing SQL, which makes it exact enough
//! for integration tests and useful as an embedded backend when no SQL
//! server is configured.
//!
//! The provider also exposes a small simulation surface (`insert_remote_row`,
//! `tombstone`, `set_connected`, `fail_next_statement`, `executed_statements`)
//! so tests can stage external writes, deletions and outages.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::error::SyncError;
use crate::provider::{render_statement, Provider, QueryResult};
use crate::query::{Dialect, Statement, StatementKind};
use crate::schema::SchemaCache;

#[derive(Debug, Default)]
struct MemRow {
    values: BTreeMap<String, String>,
    timestamp: Option<i64>,
}

#[derive(Debug, Default)]
struct MemTable {
    next_id: u64,
    columns: BTreeSet<String>,
    rows: BTreeMap<u64, MemRow>,
}

impl MemTable {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn reserve_id(&mut self, id: u64) {
        if id > self.next_id {
            self.next_id = id;
        }
    }
}

/// Logical in-process backend.
pub struct MemoryProvider {
    name: String,
    clock: Arc<dyn Clock>,
    schema: SchemaCache,
    tables: Mutex<HashMap<String, MemTable>>,
    connected: AtomicBool,
    fail_next: Mutex<Option<String>>,
    executed: Mutex<Vec<StatementKind>>,
}

impl MemoryProvider {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_clock(name, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            clock,
            schema: SchemaCache::new(),
            tables: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            fail_next: Mutex::new(None),
            executed: Mutex::new(Vec::new()),
        }
    }

    // --- Simulation surface ---

    /// Toggle simulated connectivity.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Fail the next executed statement with the given error message.
    pub fn fail_next_statement(&self, message: impl Into<String>) {
        *self.fail_next.lock() = Some(message.into());
    }

    /// Stage a row as if written by another process.
    pub fn insert_remote_row(
        &self,
        table: &str,
        id: u64,
        values: &[(&str, &str)],
        timestamp: Option<i64>,
    ) {
        let mut tables = self.tables.lock();
        let entry = tables.entry(table.to_string()).or_default();
        entry.columns.insert("id".to_string());
        entry.columns.insert("timestamp".to_string());
        let mut row = MemRow {
            values: BTreeMap::new(),
            timestamp,
        };
        for (column, value) in values {
            entry.columns.insert((*column).to_string());
            row.values.insert((*column).to_string(), (*value).to_string());
        }
        entry.reserve_id(id);
        entry.rows.insert(id, row);
    }

    /// Null out a row's timestamp, marking it as an externally deleted
    /// tombstone.
    pub fn tombstone(&self, table: &str, id: u64) {
        if let Some(entry) = self.tables.lock().get_mut(table) {
            if let Some(row) = entry.rows.get_mut(&id) {
                row.timestamp = None;
            }
        }
    }

    /// Snapshot of one row's values.
    #[must_use]
    pub fn row(&self, table: &str, id: u64) -> Option<BTreeMap<String, String>> {
        self.tables
            .lock()
            .get(table)
            .and_then(|t| t.rows.get(&id))
            .map(|r| r.values.clone())
    }

    /// A row's timestamp: `None` when the row is missing, `Some(None)` for
    /// tombstones.
    #[must_use]
    pub fn row_timestamp(&self, table: &str, id: u64) -> Option<Option<i64>> {
        self.tables
            .lock()
            .get(table)
            .and_then(|t| t.rows.get(&id))
            .map(|r| r.timestamp)
    }

    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.lock().get(table).map_or(0, |t| t.rows.len())
    }

    /// Kinds of all statements executed so far, in execution order.
    #[must_use]
    pub fn executed_statements(&self) -> Vec<StatementKind> {
        self.executed.lock().clone()
    }

    pub fn clear_executed_statements(&self) {
        self.executed.lock().clear();
    }

    // --- Interpretation ---

    fn apply(&self, statement: &Statement, rendered: String) -> QueryResult {
        let mut tables = self.tables.lock();
        match &statement.kind {
            StatementKind::Describe { table } => {
                let rows = tables
                    .get(table)
                    .map(|t| {
                        t.columns
                            .iter()
                            .map(|c| {
                                let mut row = BTreeMap::new();
                                row.insert("name".to_string(), c.clone());
                                row
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                QueryResult::with_rows(rendered, rows)
            }
            StatementKind::CreateTable { table, columns } => {
                if tables.contains_key(table) {
                    return QueryResult::failure(
                        rendered,
                        format!("table {} already exists", table),
                    );
                }
                let mut entry = MemTable::default();
                entry.columns.insert("id".to_string());
                entry.columns.insert("timestamp".to_string());
                entry.columns.extend(columns.iter().cloned());
                tables.insert(table.clone(), entry);
                QueryResult::ok(rendered)
            }
            StatementKind::AlterAdd { table, column } => match tables.get_mut(table) {
                Some(entry) => {
                    entry.columns.insert(column.clone());
                    QueryResult::ok(rendered)
                }
                None => QueryResult::failure(rendered, format!("no such table {}", table)),
            },
            StatementKind::Upsert { table, id } => {
                let Some(entry) = tables.get_mut(table) else {
                    return QueryResult::failure(rendered, format!("no such table {}", table));
                };
                for column in statement.params.keys() {
                    if !entry.columns.contains(column) {
                        return QueryResult::failure(
                            rendered,
                            format!("no such column {}.{}", table, column),
                        );
                    }
                }
                let (row_id, generated) = if *id == 0 {
                    (entry.allocate_id(), true)
                } else {
                    entry.reserve_id(*id);
                    (*id, false)
                };
                let row = entry.rows.entry(row_id).or_default();
                for (column, value) in &statement.params {
                    row.values.insert(column.clone(), value.clone());
                }
                row.timestamp = Some(self.clock.now());
                let mut result = QueryResult::ok(rendered);
                if generated {
                    result.generated_id = Some(row_id);
                }
                result
            }
            StatementKind::Delete { table, id } => {
                if let Some(entry) = tables.get_mut(table) {
                    entry.rows.remove(id);
                }
                QueryResult::ok(rendered)
            }
            StatementKind::SelectSince { table, since } => {
                let rows = tables
                    .get(table)
                    .map(|t| {
                        t.rows
                            .iter()
                            .filter(|(_, row)| row.timestamp.is_none_or(|ts| ts >= *since))
                            .map(|(id, row)| {
                                let mut out = row.values.clone();
                                // Staged values may shadow the identity
                                // columns (simulating corrupt rows).
                                out.entry("id".to_string())
                                    .or_insert_with(|| id.to_string());
                                out.entry("timestamp".to_string()).or_insert_with(|| {
                                    row.timestamp.map(|ts| ts.to_string()).unwrap_or_default()
                                });
                                out
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                QueryResult::with_rows(rendered, rows)
            }
            StatementKind::TouchTimestamp { table, id, stamp } => {
                if let Some(row) = tables.get_mut(table).and_then(|t| t.rows.get_mut(id)) {
                    row.timestamp = Some(*stamp);
                }
                QueryResult::ok(rendered)
            }
            StatementKind::ClearTombstones { table } => {
                if let Some(entry) = tables.get_mut(table) {
                    entry.rows.retain(|_, row| row.timestamp.is_some());
                }
                QueryResult::ok(rendered)
            }
        }
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn connect(&self) -> Result<(), SyncError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::Connection(format!(
                "memory backend {} is offline",
                self.name
            )))
        }
    }

    async fn check_connection(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn execute(&self, statement: &Statement) -> QueryResult {
        let rendered = render_statement(statement, self);
        if !self.connected.load(Ordering::SeqCst) {
            return QueryResult::failure(
                rendered,
                format!("no connection to {}", self.name),
            );
        }
        self.executed.lock().push(statement.kind.clone());
        if let Some(message) = self.fail_next.lock().take() {
            return QueryResult::failure(rendered, message);
        }
        self.apply(statement, rendered)
    }

    async fn discover_columns(&self, table: &str) -> Vec<String> {
        self.tables
            .lock()
            .get(table)
            .map(|t| t.columns.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn schema(&self) -> &SchemaCache {
        &self.schema
    }

    fn time_expr(&self, unix: i64) -> String {
        unix.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::record::SerializedRecord;

    fn provider() -> (Arc<MemoryProvider>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let provider = Arc::new(MemoryProvider::with_clock("memory/main", clock.clone()));
        (provider, clock)
    }

    fn record(fields: &[(&str, &str)]) -> SerializedRecord {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_persist_creates_table_and_generates_id() {
        let (provider, _) = provider();
        let result = provider
            .persist("accounts", 0, &record(&[("nick", "alice")]))
            .await;

        assert!(result.is_ok());
        assert_eq!(result.generated_id, Some(1));
        assert_eq!(
            provider.row("accounts", 1).unwrap().get("nick").map(String::as_str),
            Some("alice")
        );

        let kinds = provider.executed_statements();
        assert!(matches!(kinds[0], StatementKind::CreateTable { .. }));
        assert!(matches!(kinds[1], StatementKind::Upsert { .. }));
    }

    #[tokio::test]
    async fn test_persist_alters_for_new_field_once() {
        let (provider, _) = provider();
        provider.persist("accounts", 0, &record(&[("nick", "x")])).await;
        provider.clear_executed_statements();

        provider
            .persist("accounts", 1, &record(&[("nick", "x"), ("host", "h")]))
            .await;
        let kinds = provider.executed_statements();
        let alters = kinds
            .iter()
            .filter(|k| matches!(k, StatementKind::AlterAdd { .. }))
            .count();
        assert_eq!(alters, 1);

        provider.clear_executed_statements();
        provider
            .persist("accounts", 1, &record(&[("nick", "x"), ("host", "h")]))
            .await;
        let kinds = provider.executed_statements();
        assert!(kinds
            .iter()
            .all(|k| !matches!(k, StatementKind::AlterAdd { .. })));
    }

    #[tokio::test]
    async fn test_persist_with_existing_id_updates_in_place() {
        let (provider, _) = provider();
        let first = provider.persist("accounts", 0, &record(&[("nick", "a")])).await;
        let id = first.generated_id.unwrap();

        let second = provider
            .persist("accounts", id, &record(&[("nick", "b")]))
            .await;
        assert!(second.is_ok());
        assert_eq!(second.generated_id, None);
        assert_eq!(provider.row_count("accounts"), 1);
        assert_eq!(
            provider.row("accounts", id).unwrap().get("nick").map(String::as_str),
            Some("b")
        );
    }

    #[tokio::test]
    async fn test_select_since_and_tombstones() {
        let (provider, clock) = provider();
        provider.persist("accounts", 0, &record(&[("nick", "a")])).await;
        clock.advance(10);
        provider.persist("accounts", 0, &record(&[("nick", "b")])).await;
        provider.tombstone("accounts", 1);

        let select = crate::query::build_select_since(
            Dialect::Sqlite,
            "accounts",
            1_005,
            &provider.time_expr(1_005),
        );
        let result = provider.execute(&select).await;

        // Row 2 (fresh) and row 1 (tombstone) match; the tombstone renders
        // an empty timestamp.
        assert_eq!(result.rows.len(), 2);
        let tombstone = result
            .rows
            .iter()
            .find(|r| r.get("id").map(String::as_str) == Some("1"))
            .unwrap();
        assert_eq!(tombstone.get("timestamp").map(String::as_str), Some(""));

        let clear = crate::query::build_clear_tombstones(Dialect::Sqlite, "accounts");
        provider.execute(&clear).await;
        assert_eq!(provider.row_count("accounts"), 1);
    }

    #[tokio::test]
    async fn test_touch_timestamp() {
        let (provider, _) = provider();
        provider.insert_remote_row("accounts", 4, &[("nick", "a")], None);

        let touch = crate::query::build_touch_timestamp(
            Dialect::Sqlite,
            "accounts",
            4,
            2_000,
            &provider.time_expr(2_000),
        );
        provider.execute(&touch).await;

        assert_eq!(provider.row_timestamp("accounts", 4), Some(Some(2_000)));
    }

    #[tokio::test]
    async fn test_disconnected_execution_fails_softly() {
        let (provider, _) = provider();
        provider.set_connected(false);

        let result = provider.persist("accounts", 0, &record(&[("nick", "a")])).await;
        assert!(!result.is_ok());
        assert!(result.error.as_deref().unwrap().contains("no connection"));
        assert!(!provider.check_connection().await);
    }

    #[tokio::test]
    async fn test_fail_next_statement() {
        let (provider, _) = provider();
        provider.persist("accounts", 0, &record(&[("nick", "a")])).await;

        provider.fail_next_statement("disk full");
        let delete = crate::query::build_delete(Dialect::Sqlite, "accounts", 1);
        let result = provider.execute(&delete).await;

        assert_eq!(result.error.as_deref(), Some("disk full"));
        // The failure consumed the script; the next statement succeeds.
        let result = provider.execute(&delete).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_insert_remote_row_reserves_id() {
        let (provider, _) = provider();
        provider.insert_remote_row("accounts", 10, &[("nick", "r")], Some(1_000));

        let result = provider.persist("accounts", 0, &record(&[("nick", "new")])).await;
        assert_eq!(result.generated_id, Some(11));
    }
}
