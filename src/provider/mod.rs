// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend provider contract.
//!
//! A [`Provider`] executes one statement at a time against a backend and
//! reports the outcome as a [`QueryResult`] — a tri-state value carrying
//! rows, an optional generated id and an error string. Backend failures are
//! *contained* here: `execute` never panics and never returns `Err`; a
//! broken connection or rejected statement comes back as a result with a
//! non-empty error and no rows, and callers branch on that.
//!
//! Two implementations ship with the engine:
//! - [`sql::SqlProvider`] — sqlx `Any` driver (SQLite, MySQL, Postgres)
//! - [`memory::MemoryProvider`] — in-process tables for tests and embedded
//!   operation

pub mod memory;
pub mod sql;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::warn;

use crate::error::SyncError;
use crate::query::{self, Dialect, Statement};
use crate::record::SerializedRecord;
use crate::schema::SchemaCache;

/// Outcome of one executed statement.
///
/// `error == None` means success. The fully rendered statement text is kept
/// for diagnostics regardless of outcome.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Ordered result rows, column name → text value. Null column values
    /// are rendered as empty strings.
    pub rows: Vec<BTreeMap<String, String>>,
    /// Backend-generated id, present when the statement inserted a new row.
    pub generated_id: Option<u64>,
    /// Error message; `None` on success.
    pub error: Option<String>,
    /// Fully rendered statement text.
    pub statement: String,
}

impl QueryResult {
    #[must_use]
    pub fn ok(statement: String) -> Self {
        Self {
            statement,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_rows(statement: String, rows: Vec<BTreeMap<String, String>>) -> Self {
        Self {
            rows,
            statement,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failure(statement: String, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            statement,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Value of one column in one row, if present.
    #[must_use]
    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        self.rows.get(row)?.get(column).map(String::as_str)
    }
}

/// Abstract backend contract.
///
/// One provider instance exists per configured connection name, and each
/// provider is driven by exactly one dispatcher worker — `execute` calls
/// are serialized, never concurrent.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Logical connection name from configuration.
    fn name(&self) -> &str;

    /// Dialect for statements targeting this backend.
    fn dialect(&self) -> Dialect;

    /// Establish the underlying connection.
    async fn connect(&self) -> Result<(), SyncError>;

    /// Liveness check with lazy reconnect: when the connection handle is
    /// absent or broken, one reconnect is attempted. Returns whether the
    /// backend is usable.
    async fn check_connection(&self) -> bool;

    /// Execute one statement, blocking the worker until the backend
    /// answers. The only place real I/O happens.
    async fn execute(&self, statement: &Statement) -> QueryResult;

    /// Existing column names of a table; empty when the table is missing.
    async fn discover_columns(&self, table: &str) -> Vec<String>;

    /// Schema cache owned by this provider.
    fn schema(&self) -> &SchemaCache;

    /// Reconcile schema for `record`, then insert-or-update the row.
    ///
    /// Runs on the dispatcher worker so that discovery, DDL and the upsert
    /// all execute on the single serialized connection.
    async fn persist(&self, table: &str, id: u64, record: &SerializedRecord) -> QueryResult {
        reconcile_and_upsert(self, table, id, record).await
    }

    /// Escape a literal value for inline rendering.
    fn escape_literal(&self, raw: &str) -> String {
        raw.replace('\'', "''")
    }

    /// Backend expression converting a unix timestamp into the backend's
    /// timestamp representation.
    fn time_expr(&self, unix: i64) -> String;
}

/// Substitute every `@name@` placeholder with its escaped, quoted value.
#[must_use]
pub fn render_statement(statement: &Statement, provider: &(impl Provider + ?Sized)) -> String {
    let mut text = statement.text.clone();
    for (name, value) in &statement.params {
        let placeholder = format!("@{}@", name);
        let literal = format!("'{}'", provider.escape_literal(value));
        text = text.replace(&placeholder, &literal);
    }
    text
}

/// Shared persist flow: lazy column discovery, DDL for novel fields, then
/// the upsert.
pub(crate) async fn reconcile_and_upsert(
    provider: &(impl Provider + ?Sized),
    table: &str,
    id: u64,
    record: &SerializedRecord,
) -> QueryResult {
    let dialect = provider.dialect();
    let schema = provider.schema();

    if !schema.is_discovered(table) {
        let columns = provider.discover_columns(table).await;
        if !columns.is_empty() {
            schema.observe(table, columns);
        }
    }

    let known = schema.columns(table);
    for statement in query::build_schema(dialect, table, record, &known) {
        let result = provider.execute(&statement).await;
        if let Some(ref error) = result.error {
            warn!(
                backend = provider.name(),
                statement = %result.statement,
                error = %error,
                "schema statement failed"
            );
        }
    }
    schema.observe(table, ["id", "timestamp"]);
    schema.observe(table, record.names());

    let known = schema.columns(table);
    let upsert = query::build_upsert(dialect, table, id, record, &known);
    let result = provider.execute(&upsert).await;
    if result.error.is_some() {
        // The cached columns may be stale for this table; rediscover on the
        // next write.
        schema.forget(table);
    }
    result
}
