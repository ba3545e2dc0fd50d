//! Configuration surface.
//!
//! # Example
//!
//! ```
//! use rowsync::{SyncConfig, BackendConfig, BackendDriver};
//!
//! // Minimal config (uses defaults)
//! let config = SyncConfig::default();
//! assert!(config.write_behind);
//!
//! // Full config
//! let config = SyncConfig {
//!     backends: vec![BackendConfig {
//!         name: "sql/main".into(),
//!         driver: BackendDriver::MySql,
//!         host: "db.example.net".into(),
//!         database: "services".into(),
//!         username: "services".into(),
//!         password: "secret".into(),
//!         ..Default::default()
//!     }],
//!     sync_interval_secs: 30,
//!     ..Default::default()
//! };
//! assert_eq!(config.first_backend().unwrap().name, "sql/main");
//! ```

use serde::Deserialize;

use crate::error::SyncError;

/// Engine configuration.
///
/// The first configured backend is authoritative; at most one persistence
/// engine may be active per process.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Named backend connection blocks; the first one is authoritative.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    /// When true (the default), writes are coalesced and flushed
    /// asynchronously. When false, every mark flushes immediately,
    /// recovering fully-synchronous persistence.
    #[serde(default = "default_write_behind")]
    pub write_behind: bool,

    /// Cadence of periodic backend checks and incremental read-backs.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Minimum spacing of repeated "still unreachable" warnings while
    /// degraded.
    #[serde(default = "default_warn_interval_secs")]
    pub warn_interval_secs: u64,
}

fn default_write_behind() -> bool {
    true
}
fn default_sync_interval_secs() -> u64 {
    60
}
fn default_warn_interval_secs() -> u64 {
    300
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            write_behind: default_write_behind(),
            sync_interval_secs: default_sync_interval_secs(),
            warn_interval_secs: default_warn_interval_secs(),
        }
    }
}

impl SyncConfig {
    /// The authoritative backend: the first configured one.
    #[must_use]
    pub fn first_backend(&self) -> Option<&BackendConfig> {
        self.backends.first()
    }

    /// Startup validation: at least one backend, unique names.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.backends.is_empty() {
            return Err(SyncError::Config("no backend configured".to_string()));
        }
        for (i, backend) in self.backends.iter().enumerate() {
            if self.backends[..i].iter().any(|b| b.name == backend.name) {
                return Err(SyncError::Config(format!(
                    "duplicate backend name: {}",
                    backend.name
                )));
            }
        }
        Ok(())
    }
}

/// Backend driver selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendDriver {
    #[default]
    MySql,
    Sqlite,
    Postgres,
    /// In-process tables; no server.
    Memory,
}

/// One named backend connection block.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Logical connection name the provider is looked up by.
    #[serde(default = "default_backend_name")]
    pub name: String,

    #[serde(default)]
    pub driver: BackendDriver,

    #[serde(default = "default_host")]
    pub host: String,

    /// 0 selects the driver's default port.
    #[serde(default)]
    pub port: u16,

    /// Database name, or the file path for SQLite.
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,
}

fn default_backend_name() -> String {
    "sql/main".to_string()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_database() -> String {
    "rowsync".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: default_backend_name(),
            driver: BackendDriver::default(),
            host: default_host(),
            port: 0,
            database: default_database(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl BackendConfig {
    /// Port to use, falling back to the driver default.
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        if self.port != 0 {
            return self.port;
        }
        match self.driver {
            BackendDriver::MySql => 3306,
            BackendDriver::Postgres => 5432,
            BackendDriver::Sqlite | BackendDriver::Memory => 0,
        }
    }

    /// Connection URL for the sqlx `Any` driver.
    #[must_use]
    pub fn connection_url(&self) -> String {
        match self.driver {
            BackendDriver::Sqlite => format!("sqlite:{}", self.database),
            BackendDriver::Memory => format!("memory:{}", self.name),
            BackendDriver::MySql => format!(
                "mysql://{}:{}@{}:{}/{}",
                self.username,
                self.password,
                self.host,
                self.effective_port(),
                self.database
            ),
            BackendDriver::Postgres => format!(
                "postgres://{}:{}@{}:{}/{}",
                self.username,
                self.password,
                self.host,
                self.effective_port(),
                self.database
            ),
        }
    }
}
