//! Engine error taxonomy.
//!
//! Backend-facing failures never cross the owner/worker boundary as `Err`
//! values; they are contained in [`QueryResult::error`](crate::QueryResult)
//! and handled where outcomes are drained. The variants here cover the
//! remaining hard failures: configuration problems at startup, rejected
//! submissions and identity parsing.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid configuration; fatal at initialization, never at steady
    /// state.
    #[error("configuration error: {0}")]
    Config(String),

    /// Backend unreachable.
    #[error("backend unreachable: {0}")]
    Connection(String),

    /// The backend rejected a statement.
    #[error("statement rejected: {message} (statement: {statement})")]
    Statement { statement: String, message: String },

    /// A result row's id could not be parsed.
    #[error("unparseable row id: {0}")]
    Identity(String),

    /// A request or outcome was cancelled before delivery.
    #[error("cancelled: {0}")]
    Cancelled(String),
}
