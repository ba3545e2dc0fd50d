// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL provider over the sqlx `Any` driver.
//!
//! One [`SqlProvider`] wraps one logical connection (a pool capped at a
//! single connection, so statements stay serialized the way the dispatcher
//! expects). The dialect is inferred from the connection URL; SQLite,
//! MySQL and Postgres are supported.
//!
//! ## sqlx Any driver quirks
//!
//! The `Any` driver needs its concrete drivers installed at runtime, and
//! it is loose about column types — MySQL TEXT often decodes only as bytes,
//! numeric columns only as `i64`/`f64`. Row decoding therefore walks a
//! fallback chain (String → bytes → i64 → f64) and renders SQL NULL as an
//! empty string, which is exactly the representation the reconciliation
//! layer expects for tombstones.

use std::collections::BTreeMap;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Row, ValueRef};
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::provider::{render_statement, Provider, QueryResult};
use crate::query::{self, Dialect, Statement, StatementKind};
use crate::schema::SchemaCache;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Provider backed by a real SQL server (or SQLite file/memory database).
pub struct SqlProvider {
    name: String,
    url: String,
    dialect: Dialect,
    pool: tokio::sync::RwLock<Option<AnyPool>>,
    schema: SchemaCache,
}

impl SqlProvider {
    /// Create a provider for a connection URL. No connection is opened
    /// until the first execute (or an explicit [`connect`](Provider::connect)).
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        let dialect = if url.starts_with("sqlite") {
            Dialect::Sqlite
        } else if url.starts_with("postgres") {
            Dialect::Postgres
        } else {
            Dialect::MySql
        };
        Self {
            name: name.into(),
            url,
            dialect,
            pool: tokio::sync::RwLock::new(None),
            schema: SchemaCache::new(),
        }
    }

    async fn open_pool(&self) -> Result<AnyPool, sqlx::Error> {
        install_drivers();
        AnyPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&self.url)
            .await
    }

    /// Live pool, attempting one reconnect when the handle is absent or
    /// broken.
    async fn acquire(&self) -> Option<AnyPool> {
        {
            let guard = self.pool.read().await;
            if let Some(pool) = guard.as_ref() {
                if !pool.is_closed() {
                    return Some(pool.clone());
                }
            }
        }

        match self.open_pool().await {
            Ok(pool) => {
                debug!(backend = %self.name, "connected");
                *self.pool.write().await = Some(pool.clone());
                Some(pool)
            }
            Err(e) => {
                warn!(backend = %self.name, error = %e, "connection attempt failed");
                None
            }
        }
    }

    fn decode_row(row: &AnyRow) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (index, column) in row.columns().iter().enumerate() {
            let is_null = row
                .try_get_raw(index)
                .map(|raw| raw.is_null())
                .unwrap_or(true);
            let value = if is_null {
                String::new()
            } else {
                row.try_get::<String, _>(index)
                    .or_else(|_| {
                        row.try_get::<Vec<u8>, _>(index)
                            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    })
                    .or_else(|_| row.try_get::<i64, _>(index).map(|v| v.to_string()))
                    .or_else(|_| row.try_get::<f64, _>(index).map(|v| v.to_string()))
                    .unwrap_or_default()
            };
            out.insert(column.name().to_string(), value);
        }
        out
    }

    /// Column holding the name in the dialect's describe result.
    fn describe_name_column(&self) -> &'static str {
        match self.dialect {
            Dialect::MySql => "Field",
            Dialect::Sqlite => "name",
            Dialect::Postgres => "column_name",
        }
    }

    /// Postgres reports generated ids through RETURNING rows.
    fn wants_returning_rows(&self, statement: &Statement) -> bool {
        self.dialect == Dialect::Postgres
            && matches!(statement.kind, StatementKind::Upsert { .. })
    }
}

#[async_trait]
impl Provider for SqlProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn connect(&self) -> Result<(), SyncError> {
        match self.acquire().await {
            Some(_) => Ok(()),
            None => Err(SyncError::Connection(format!(
                "unable to connect to {}",
                self.name
            ))),
        }
    }

    async fn check_connection(&self) -> bool {
        self.acquire().await.is_some()
    }

    async fn execute(&self, statement: &Statement) -> QueryResult {
        let rendered = render_statement(statement, self);

        let Some(pool) = self.acquire().await else {
            return QueryResult::failure(
                rendered,
                format!("no connection to {}", self.name),
            );
        };

        if statement.returns_rows() || self.wants_returning_rows(statement) {
            match sqlx::query(&rendered).fetch_all(&pool).await {
                Ok(rows) => {
                    let decoded: Vec<BTreeMap<String, String>> =
                        rows.iter().map(Self::decode_row).collect();
                    let mut result = QueryResult::with_rows(rendered, decoded);
                    if let StatementKind::Upsert { id: 0, .. } = statement.kind {
                        result.generated_id = result
                            .get(0, "id")
                            .and_then(|v| v.parse::<u64>().ok())
                            .filter(|v| *v != 0);
                    }
                    result
                }
                Err(e) => QueryResult::failure(rendered, e.to_string()),
            }
        } else {
            match sqlx::query(&rendered).execute(&pool).await {
                Ok(done) => {
                    let mut result = QueryResult::ok(rendered);
                    if let StatementKind::Upsert { id: 0, .. } = statement.kind {
                        result.generated_id = done
                            .last_insert_id()
                            .and_then(|v| u64::try_from(v).ok())
                            .filter(|v| *v != 0);
                    }
                    result
                }
                Err(e) => QueryResult::failure(rendered, e.to_string()),
            }
        }
    }

    async fn discover_columns(&self, table: &str) -> Vec<String> {
        let statement = query::build_describe(self.dialect, table);
        let result = self.execute(&statement).await;
        if !result.is_ok() {
            // Missing tables surface as errors on MySQL/Postgres; an empty
            // column set sends reconciliation down the CREATE TABLE path.
            return Vec::new();
        }
        let name_column = self.describe_name_column();
        result
            .rows
            .iter()
            .filter_map(|row| row.get(name_column).cloned())
            .filter(|name| !name.is_empty())
            .collect()
    }

    fn schema(&self) -> &SchemaCache {
        &self.schema
    }

    fn escape_literal(&self, raw: &str) -> String {
        match self.dialect {
            // MySQL treats backslash as an escape character inside literals.
            Dialect::MySql => raw.replace('\\', "\\\\").replace('\'', "''"),
            Dialect::Sqlite | Dialect::Postgres => raw.replace('\'', "''"),
        }
    }

    fn time_expr(&self, unix: i64) -> String {
        match self.dialect {
            Dialect::MySql => format!("FROM_UNIXTIME({})", unix),
            Dialect::Sqlite => format!("datetime({}, 'unixepoch')", unix),
            Dialect::Postgres => format!("to_timestamp({})", unix),
        }
    }
}
