// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pure statement builders.
//!
//! Every statement the engine issues is produced here from a table name, a
//! [`SerializedRecord`] and the set of columns already known to exist. The
//! builders perform no I/O and hold no state; dialect differences (identifier
//! quoting, column types, upsert conflict clauses) are passed in as a
//! [`Dialect`].
//!
//! Field values are never concatenated into statement text. Each value is
//! bound by name as an `@name@` placeholder and substituted — escaped — by
//! the provider at render time, which keeps the builders backend-agnostic
//! and the statements injection-safe.
//!
//! Alongside the text, every [`Statement`] carries a structural
//! [`StatementKind`] so that logical providers (the in-memory backend, test
//! doubles) can interpret a statement without parsing SQL.

use std::collections::{BTreeMap, BTreeSet};

use crate::record::{FieldKind, SerializedRecord};

/// SQL dialect targeted by a rendered statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    MySql,
    Postgres,
}

impl Dialect {
    /// Quote an identifier (table or column name).
    #[must_use]
    pub fn quote(&self, ident: &str) -> String {
        match self {
            Dialect::MySql => format!("`{}`", ident),
            Dialect::Sqlite | Dialect::Postgres => format!("\"{}\"", ident),
        }
    }

    /// Column type for a serialized field kind.
    #[must_use]
    pub fn column_type(&self, kind: FieldKind) -> &'static str {
        match (self, kind) {
            (Dialect::MySql, FieldKind::Integer) => "int(11)",
            (Dialect::MySql, FieldKind::Text) => "text",
            (Dialect::Sqlite, FieldKind::Integer) => "INTEGER",
            (Dialect::Sqlite, FieldKind::Text) => "TEXT",
            (Dialect::Postgres, FieldKind::Integer) => "integer",
            (Dialect::Postgres, FieldKind::Text) => "text",
        }
    }
}

/// Structural shape of a statement, for providers that interpret rather
/// than parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    /// Column discovery for a table.
    Describe { table: String },
    /// Create a table with the listed field columns (id/timestamp implied).
    CreateTable { table: String, columns: Vec<String> },
    /// Add one column to an existing table.
    AlterAdd { table: String, column: String },
    /// Insert-or-update one row; `id == 0` means "generate an id".
    Upsert { table: String, id: u64 },
    /// Delete one row by id.
    Delete { table: String, id: u64 },
    /// Select rows with `timestamp >= since` or a null timestamp.
    SelectSince { table: String, since: i64 },
    /// Stamp one row's timestamp (marks an unreconcilable row as seen).
    TouchTimestamp { table: String, id: u64, stamp: i64 },
    /// Delete all tombstone rows (null timestamp).
    ClearTombstones { table: String },
}

/// A parameterized statement: rendered text with `@name@` placeholders plus
/// the values to substitute for them.
#[derive(Debug, Clone)]
pub struct Statement {
    pub text: String,
    pub params: BTreeMap<String, String>,
    pub kind: StatementKind,
}

impl Statement {
    fn new(text: String, kind: StatementKind) -> Self {
        Self {
            text,
            params: BTreeMap::new(),
            kind,
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        match &self.kind {
            StatementKind::Describe { table }
            | StatementKind::CreateTable { table, .. }
            | StatementKind::AlterAdd { table, .. }
            | StatementKind::Upsert { table, .. }
            | StatementKind::Delete { table, .. }
            | StatementKind::SelectSince { table, .. }
            | StatementKind::TouchTimestamp { table, .. }
            | StatementKind::ClearTombstones { table } => table,
        }
    }

    /// True for statements that produce rows rather than row counts.
    #[must_use]
    pub fn returns_rows(&self) -> bool {
        matches!(
            self.kind,
            StatementKind::Describe { .. } | StatementKind::SelectSince { .. }
        )
    }
}

/// Schema reconciliation statements for `record` against `known_columns`.
///
/// With no known columns this is a single `CREATE TABLE` carrying an
/// auto-increment `id` primary key, a nullable `timestamp` column and one
/// typed column per record field. Otherwise it is one `ALTER TABLE ADD`
/// per field present in the record but absent from the known set. Known
/// columns are a set: discovery order never changes the result, and a
/// record that omits a known column produces no statement for it.
#[must_use]
pub fn build_schema(
    dialect: Dialect,
    table: &str,
    record: &SerializedRecord,
    known_columns: &BTreeSet<String>,
) -> Vec<Statement> {
    if known_columns.is_empty() {
        return vec![build_create_table(dialect, table, record)];
    }

    record
        .iter()
        .filter(|(name, _)| !known_columns.contains(*name))
        .map(|(name, field)| {
            let text = match dialect {
                Dialect::MySql => format!(
                    "ALTER TABLE {} ADD {} {}",
                    dialect.quote(table),
                    dialect.quote(name),
                    dialect.column_type(field.kind)
                ),
                Dialect::Sqlite | Dialect::Postgres => format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    dialect.quote(table),
                    dialect.quote(name),
                    dialect.column_type(field.kind)
                ),
            };
            Statement::new(
                text,
                StatementKind::AlterAdd {
                    table: table.to_string(),
                    column: name.to_string(),
                },
            )
        })
        .collect()
}

fn build_create_table(dialect: Dialect, table: &str, record: &SerializedRecord) -> Statement {
    let q = |s: &str| dialect.quote(s);
    let mut text = match dialect {
        Dialect::MySql => format!(
            "CREATE TABLE {} ({} int(10) unsigned NOT NULL AUTO_INCREMENT, \
             {} timestamp NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP",
            q(table),
            q("id"),
            q("timestamp")
        ),
        Dialect::Sqlite => format!(
            "CREATE TABLE {} ({} INTEGER PRIMARY KEY AUTOINCREMENT, \
             {} TEXT NULL DEFAULT CURRENT_TIMESTAMP",
            q(table),
            q("id"),
            q("timestamp")
        ),
        Dialect::Postgres => format!(
            "CREATE TABLE {} ({} bigserial PRIMARY KEY, \
             {} timestamp NULL DEFAULT CURRENT_TIMESTAMP",
            q(table),
            q("id"),
            q("timestamp")
        ),
    };

    for (name, field) in record.iter() {
        text.push_str(&format!(
            ", {} {}",
            q(name),
            dialect.column_type(field.kind)
        ));
    }

    match dialect {
        Dialect::MySql => {
            text.push_str(&format!(
                ", PRIMARY KEY ({}), KEY {} ({}))",
                q("id"),
                q("timestamp_idx"),
                q("timestamp")
            ));
        }
        Dialect::Sqlite | Dialect::Postgres => text.push(')'),
    }

    Statement::new(
        text,
        StatementKind::CreateTable {
            table: table.to_string(),
            columns: record.names().map(str::to_string).collect(),
        },
    )
}

/// Insert-or-update one row.
///
/// Every known column absent from the record is padded with an empty value
/// so schema and row stay aligned. An id of `0` means the row is new: the
/// id column is omitted and the backend generates one. Field values are
/// bound by `@name@` placeholder, never inlined.
#[must_use]
pub fn build_upsert(
    dialect: Dialect,
    table: &str,
    id: u64,
    record: &SerializedRecord,
    known_columns: &BTreeSet<String>,
) -> Statement {
    let q = |s: &str| dialect.quote(s);

    let mut padded = record.clone();
    for column in known_columns {
        if column != "id" && column != "timestamp" && !padded.contains(column) {
            padded.set(column.as_str(), "");
        }
    }

    let kind = StatementKind::Upsert {
        table: table.to_string(),
        id,
    };

    if padded.is_empty() && id == 0 {
        // Nothing but a generated id and a default timestamp.
        let text = match dialect {
            Dialect::MySql => format!("INSERT INTO {} () VALUES ()", q(table)),
            Dialect::Sqlite => format!("INSERT INTO {} DEFAULT VALUES", q(table)),
            Dialect::Postgres => {
                format!("INSERT INTO {} DEFAULT VALUES RETURNING {}", q(table), q("id"))
            }
        };
        return Statement::new(text, kind);
    }

    let mut columns: Vec<String> = Vec::new();
    let mut values: Vec<String> = Vec::new();
    if id != 0 {
        columns.push(q("id"));
        values.push(id.to_string());
    }
    for (name, _) in padded.iter() {
        columns.push(q(name));
        values.push(format!("@{}@", name));
    }

    let mut text = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        q(table),
        columns.join(", "),
        values.join(", ")
    );

    match dialect {
        Dialect::MySql => {
            let assignments: Vec<String> = if padded.is_empty() {
                vec![format!("{} = VALUES({})", q("id"), q("id"))]
            } else {
                padded
                    .names()
                    .map(|name| format!("{} = VALUES({})", q(name), q(name)))
                    .collect()
            };
            text.push_str(" ON DUPLICATE KEY UPDATE ");
            text.push_str(&assignments.join(", "));
        }
        Dialect::Sqlite | Dialect::Postgres => {
            let excluded = match dialect {
                Dialect::Sqlite => "excluded",
                _ => "EXCLUDED",
            };
            let mut assignments: Vec<String> = padded
                .names()
                .map(|name| format!("{} = {}.{}", q(name), excluded, q(name)))
                .collect();
            // SQLite and Postgres have no ON UPDATE clause in the schema, so
            // the row timestamp is refreshed on every conflicting write.
            assignments.push(format!("{} = CURRENT_TIMESTAMP", q("timestamp")));
            text.push_str(&format!(" ON CONFLICT({}) DO UPDATE SET ", q("id")));
            text.push_str(&assignments.join(", "));
            // Postgres reports generated ids through RETURNING, not through
            // the driver's last-insert-id.
            if dialect == Dialect::Postgres {
                text.push_str(&format!(" RETURNING {}", q("id")));
            }
        }
    }

    let mut statement = Statement::new(text, kind);
    for (name, field) in padded.iter() {
        statement.params.insert(name.to_string(), field.value.clone());
    }
    statement
}

/// Delete one row by id.
#[must_use]
pub fn build_delete(dialect: Dialect, table: &str, id: u64) -> Statement {
    let text = format!(
        "DELETE FROM {} WHERE {} = {}",
        dialect.quote(table),
        dialect.quote("id"),
        id
    );
    Statement::new(
        text,
        StatementKind::Delete {
            table: table.to_string(),
            id,
        },
    )
}

/// Select rows changed at or after `since`, plus tombstones.
///
/// `time_expr` is the provider-rendered comparison bound for `since`
/// (e.g. `FROM_UNIXTIME(n)`); a null timestamp marks a row whose deletion
/// still needs local propagation.
#[must_use]
pub fn build_select_since(
    dialect: Dialect,
    table: &str,
    since: i64,
    time_expr: &str,
) -> Statement {
    let text = format!(
        "SELECT * FROM {} WHERE ({} >= {} OR {} IS NULL)",
        dialect.quote(table),
        dialect.quote("timestamp"),
        time_expr,
        dialect.quote("timestamp")
    );
    Statement::new(
        text,
        StatementKind::SelectSince {
            table: table.to_string(),
            since,
        },
    )
}

/// Stamp one row's timestamp, marking it seen without changing its fields.
#[must_use]
pub fn build_touch_timestamp(
    dialect: Dialect,
    table: &str,
    id: u64,
    stamp: i64,
    time_expr: &str,
) -> Statement {
    let text = format!(
        "UPDATE {} SET {} = {} WHERE {} = {}",
        dialect.quote(table),
        dialect.quote("timestamp"),
        time_expr,
        dialect.quote("id"),
        id
    );
    Statement::new(
        text,
        StatementKind::TouchTimestamp {
            table: table.to_string(),
            id,
            stamp,
        },
    )
}

/// Delete all tombstone rows of a table.
#[must_use]
pub fn build_clear_tombstones(dialect: Dialect, table: &str) -> Statement {
    let text = format!(
        "DELETE FROM {} WHERE {} IS NULL",
        dialect.quote(table),
        dialect.quote("timestamp")
    );
    Statement::new(
        text,
        StatementKind::ClearTombstones {
            table: table.to_string(),
        },
    )
}

/// Column discovery statement for a table.
#[must_use]
pub fn build_describe(dialect: Dialect, table: &str) -> Statement {
    let text = match dialect {
        Dialect::MySql => format!("SHOW COLUMNS FROM {}", dialect.quote(table)),
        Dialect::Sqlite => format!("PRAGMA table_info({})", dialect.quote(table)),
        Dialect::Postgres => format!(
            "SELECT column_name FROM information_schema.columns WHERE table_name = '{}'",
            table
        ),
    };
    Statement::new(
        text,
        StatementKind::Describe {
            table: table.to_string(),
        },
    )
}
