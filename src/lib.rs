//! # rowsync
//!
//! A write-behind object-relational synchronization engine: keeps long-lived
//! in-memory domain objects consistent with rows in a SQL-like backing
//! store without blocking callers on network I/O.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Owner side                            │
//! │  • host lifecycle hooks (created / updated / destroyed)     │
//! │  • ChangeTracker: dirty map, action coalescing              │
//! │  • drain(): outcome callbacks, id writeback, registries     │
//! └─────────────────────────────────────────────────────────────┘
//!                  │ submit (records + statements only)
//!                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Dispatcher (one worker)                    │
//! │  • unbounded FIFO, executed in submission order             │
//! │  • owner-tagged cancellation, bounded in-flight wait        │
//! │  • outcome buffer handed back through drain()               │
//! └─────────────────────────────────────────────────────────────┘
//!                  │ execute / persist (the only blocking I/O)
//!                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Provider                             │
//! │  • schema reconciliation (lazy discovery, grow-only cache)  │
//! │  • @name@ parameter rendering with escaping                 │
//! │  • SQL (sqlx Any: SQLite/MySQL/Postgres) or in-memory       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Mutations mark objects dirty in the [`ChangeTracker`]; a flush swaps the
//! pending set and submits one upsert per object through the
//! [`Dispatcher`], whose single worker reconciles table schema and executes
//! statements serially. Completed outcomes return through a notification
//! channel and are applied on the owner side: generated ids are written
//! back and objects enter their type's [`Registry`]. Periodic sync checks
//! select rows newer than each type's last-known timestamp and reconcile
//! them back into memory — including tombstones for externally deleted
//! rows.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use rowsync::{SyncConfig, BackendConfig, BackendDriver, SyncCoordinator};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig {
//!         backends: vec![BackendConfig {
//!             name: "sql/main".into(),
//!             driver: BackendDriver::MySql,
//!             host: "127.0.0.1".into(),
//!             database: "services".into(),
//!             username: "services".into(),
//!             password: "secret".into(),
//!             ..Default::default()
//!         }],
//!         ..Default::default()
//!     };
//!
//!     let engine = SyncCoordinator::from_config(config).expect("engine");
//!     // engine.register_type(...) for each persisted object type, then
//!     // wire the host's lifecycle hooks to engine.on_object_created() /
//!     // on_object_updated() / on_object_destroyed() and run the loop:
//!     // engine.run().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`SyncCoordinator`] orchestrating all components
//! - [`tracker`]: write-behind [`ChangeTracker`]
//! - [`dispatcher`]: single-worker [`Dispatcher`] and outcome delivery
//! - [`provider`]: backend contract plus the SQL and in-memory providers
//! - [`query`]: pure statement builders
//! - [`schema`]: per-table known-column cache
//! - [`record`] / [`object`]: serialized records, object traits, registries

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod object;
pub mod provider;
pub mod query;
pub mod record;
pub mod schema;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackendConfig, BackendDriver, SyncConfig};
pub use coordinator::SyncCoordinator;
pub use dispatcher::{Dispatcher, OwnerId, QueryRequest, QuerySink, Work, GOING_AWAY};
pub use error::SyncError;
pub use object::{ObjectHandle, ObjectType, Registry, Storable};
pub use provider::memory::MemoryProvider;
pub use provider::sql::SqlProvider;
pub use provider::{Provider, QueryResult};
pub use query::{Dialect, Statement, StatementKind};
pub use record::{Field, FieldKind, SerializedRecord};
pub use schema::SchemaCache;
pub use tracker::{ChangeTracker, PendingAction};
