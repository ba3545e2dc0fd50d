// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync coordinator.
//!
//! The [`SyncCoordinator`] orchestrates the full cycle: host lifecycle
//! hooks feed the [`ChangeTracker`], flushes travel through the
//! [`Dispatcher`] to the authoritative [`Provider`], and periodic sync
//! checks pull rows newer than each type's last-known timestamp back into
//! the in-memory object set, preserving identity.
//!
//! Read-back is a three-state machine per row:
//! - *fresh remote insert/update* — reconcile the row into an existing
//!   object in place, or construct a new one;
//! - *remote tombstone* (null timestamp) — destroy the local object and
//!   schedule tombstone cleanup;
//! - *unreconcilable* — local state wins: destroy the local object when one
//!   exists, otherwise stamp the row as seen so it is not reselected every
//!   cycle.
//!
//! When the authoritative backend stops answering, the coordinator degrades
//! to read-only mode, logs the transition (throttled) and recovers lazily
//! on the next successful connection check.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{BackendDriver, SyncConfig};
use crate::dispatcher::{Dispatcher, OwnerId, QueryRequest, QuerySink};
use crate::error::SyncError;
use crate::object::{ObjectHandle, ObjectType};
use crate::provider::memory::MemoryProvider;
use crate::provider::sql::SqlProvider;
use crate::provider::{Provider, QueryResult};
use crate::query;
use crate::record::SerializedRecord;
use crate::tracker::ChangeTracker;

/// At most one persistence engine may be active per process.
static ENGINE_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Orchestrates tracker, dispatcher and provider for one process.
pub struct SyncCoordinator {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<Dispatcher>,
    provider: Arc<dyn Provider>,
    tracker: Arc<ChangeTracker>,
    types: DashMap<String, Arc<dyn ObjectType>>,
    last_sync: DashMap<String, i64>,
    owner: OwnerId,
    read_only: AtomicBool,
    last_warn: AtomicI64,
    shutdown: watch::Sender<bool>,
    holds_claim: bool,
}

impl SyncCoordinator {
    /// Build the engine from configuration.
    ///
    /// The first configured backend is authoritative. Fails when no backend
    /// is configured, when backend names collide, or when another engine is
    /// already active in this process — all fatal at initialization, never
    /// at steady state.
    pub fn from_config(config: SyncConfig) -> Result<Arc<Self>, SyncError> {
        config.validate()?;
        if ENGINE_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::Config(
                "another persistence engine is already active in this process".to_string(),
            ));
        }

        let backend = config.first_backend().expect("validated non-empty");
        info!(backend = %backend.name, driver = ?backend.driver, "using authoritative backend");
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let provider: Arc<dyn Provider> = match backend.driver {
            BackendDriver::Memory => Arc::new(MemoryProvider::with_clock(
                backend.name.clone(),
                clock.clone(),
            )),
            _ => Arc::new(SqlProvider::new(
                backend.name.clone(),
                backend.connection_url(),
            )),
        };

        Ok(Self::build(config, provider, clock, true))
    }

    /// Build the engine around an injected provider (embedded backends,
    /// tests). Does not take the process-wide engine claim.
    #[must_use]
    pub fn with_provider(
        config: SyncConfig,
        provider: Arc<dyn Provider>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Self::build(config, provider, clock, false)
    }

    fn build(
        config: SyncConfig,
        provider: Arc<dyn Provider>,
        clock: Arc<dyn Clock>,
        holds_claim: bool,
    ) -> Arc<Self> {
        let dispatcher = Dispatcher::spawn();
        let owner = OwnerId::next();
        let tracker = Arc::new(ChangeTracker::new(
            provider.clone(),
            dispatcher.clone(),
            owner,
        ));
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            clock,
            dispatcher,
            provider,
            tracker,
            types: DashMap::new(),
            last_sync: DashMap::new(),
            owner,
            read_only: AtomicBool::new(false),
            last_warn: AtomicI64::new(0),
            shutdown,
            holds_claim,
        })
    }

    /// Register an object type for tracking and read-back.
    pub fn register_type(&self, ty: Arc<dyn ObjectType>) {
        self.types.insert(ty.table().to_string(), ty);
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<ChangeTracker> {
        &self.tracker
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// True while the backend is unreachable and writes are being skipped.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    // --- Host lifecycle hooks ---

    pub fn on_object_created(&self, handle: &ObjectHandle) {
        let Some(ty) = self.type_of(handle) else { return };
        if self.skip_writes() {
            return;
        }
        self.tracker.mark_create(&ty, handle);
        self.after_mark();
    }

    pub fn on_object_updated(&self, handle: &ObjectHandle) {
        let Some(ty) = self.type_of(handle) else { return };
        if self.skip_writes() {
            return;
        }
        self.tracker.mark_update(&ty, handle);
        self.after_mark();
    }

    pub fn on_object_destroyed(&self, handle: &ObjectHandle) {
        let Some(ty) = self.type_of(handle) else { return };
        if self.skip_writes() {
            return;
        }
        self.tracker.mark_delete(&ty, handle);
    }

    /// Periodic (or on-demand) incremental read-back for one type.
    pub fn on_periodic_check(&self, table: &str) {
        let Some(ty) = self.types.get(table).map(|t| t.value().clone()) else {
            debug!(table, "periodic check for unregistered type");
            return;
        };
        self.sync_check(&ty);
    }

    fn type_of(&self, handle: &ObjectHandle) -> Option<Arc<dyn ObjectType>> {
        let table = handle.read().table().to_string();
        let ty = self.types.get(&table).map(|t| t.value().clone());
        if ty.is_none() {
            debug!(table = %table, "object of unregistered type ignored");
        }
        ty
    }

    fn skip_writes(&self) -> bool {
        if self.is_read_only() {
            debug!("read-only mode, change not tracked");
            return true;
        }
        false
    }

    fn after_mark(&self) {
        // With write-behind disabled every mark flushes immediately,
        // recovering the fully-synchronous strategy.
        if !self.config.write_behind {
            self.flush();
        }
    }

    // --- Flush / drain pump ---

    /// Flush pending writes into the dispatcher. Returns writes submitted.
    pub fn flush(&self) -> usize {
        self.tracker.flush()
    }

    /// Deliver completed outcomes on the calling task. Returns outcomes
    /// delivered.
    pub fn drain(&self) -> usize {
        self.dispatcher.drain()
    }

    // --- Incremental read-back ---

    /// Pull rows newer than the type's last-known timestamp and reconcile
    /// them into the registry.
    ///
    /// `last_sync` advances to "now" before the query returns so writes
    /// landing during the round trip are not missed; a check within the
    /// same tick is an idempotent no-op.
    pub fn sync_check(&self, ty: &Arc<dyn ObjectType>) {
        if self.is_read_only() {
            return;
        }
        let table = ty.table().to_string();
        let now = self.clock.now();
        let since = self.last_sync.get(&table).map(|e| *e.value()).unwrap_or(0);
        if since == now {
            return;
        }
        self.last_sync.insert(table.clone(), now);

        let statement = query::build_select_since(
            self.provider.dialect(),
            &table,
            since,
            &self.provider.time_expr(since),
        );
        let sink = Arc::new(ReconcileSink {
            ty: ty.clone(),
            provider: self.provider.clone(),
            dispatcher: self.dispatcher.clone(),
            tracker: self.tracker.clone(),
            owner: self.owner,
            stamp: now,
        });
        if let Err(e) = self.dispatcher.submit(
            QueryRequest::execute(self.owner, self.provider.clone(), statement).with_sink(sink),
        ) {
            warn!(table = %table, error = %e, "sync check not submitted");
        }
    }

    /// Probe the backend and update read-only state accordingly.
    pub async fn check_backend(&self) -> bool {
        let ok = self.provider.check_connection().await;
        self.note_connection(ok);
        ok
    }

    fn note_connection(&self, ok: bool) {
        if ok {
            if self.read_only.swap(false, Ordering::SeqCst) {
                info!(
                    backend = self.provider.name(),
                    "backend reachable again, leaving read-only mode"
                );
            }
            return;
        }
        let now = self.clock.now();
        if !self.read_only.swap(true, Ordering::SeqCst) {
            warn!(
                backend = self.provider.name(),
                "backend unreachable, entering read-only mode"
            );
            self.last_warn.store(now, Ordering::SeqCst);
        } else if now - self.last_warn.load(Ordering::SeqCst)
            >= self.config.warn_interval_secs as i64
        {
            warn!(
                backend = self.provider.name(),
                "backend still unreachable, staying read-only"
            );
            self.last_warn.store(now, Ordering::SeqCst);
        }
    }

    // --- Event loop ---

    /// Run the engine's event loop: flush on request, drain completed
    /// outcomes, and run periodic backend/sync checks until
    /// [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut sync_interval =
            tokio::time::interval(Duration::from_secs(self.config.sync_interval_secs.max(1)));
        sync_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("sync coordinator running");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }

                _ = self.tracker.flush_requested() => {
                    self.flush();
                }

                _ = self.dispatcher.results_ready() => {
                    self.drain();
                }

                _ = sync_interval.tick() => {
                    if self.check_backend().await {
                        let types: Vec<Arc<dyn ObjectType>> =
                            self.types.iter().map(|t| t.value().clone()).collect();
                        for ty in types {
                            self.sync_check(&ty);
                        }
                    }
                }
            }
        }
        info!("sync coordinator stopped");
    }

    /// Graceful shutdown: final flush, wait out in-flight work, deliver the
    /// remaining outcomes, join the worker.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.flush();
        self.dispatcher.quiesce().await;
        self.drain();
        self.dispatcher.shutdown().await;
        info!("sync coordinator shutdown complete");
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        if self.holds_claim {
            ENGINE_ACTIVE.store(false, Ordering::SeqCst);
        }
    }
}

/// Drain-side row reconciliation for one sync check.
struct ReconcileSink {
    ty: Arc<dyn ObjectType>,
    provider: Arc<dyn Provider>,
    dispatcher: Arc<Dispatcher>,
    tracker: Arc<ChangeTracker>,
    owner: OwnerId,
    stamp: i64,
}

impl ReconcileSink {
    fn submit(&self, statement: query::Statement) {
        if let Err(e) = self.dispatcher.submit(QueryRequest::execute(
            self.owner,
            self.provider.clone(),
            statement,
        )) {
            warn!(table = self.ty.table(), error = %e, "follow-up not submitted");
        }
    }
}

impl QuerySink for ReconcileSink {
    fn on_result(&self, result: QueryResult) {
        let table = self.ty.table();
        let registry = self.ty.registry();
        let mut saw_tombstone = false;

        for row in &result.rows {
            let raw_id = row.get("id").map(String::as_str).unwrap_or("");
            let Ok(id) = raw_id.parse::<u64>() else {
                debug!(table, raw_id, "row with unparseable id skipped");
                continue;
            };

            let tombstone = row.get("timestamp").map_or(true, String::is_empty);
            if tombstone {
                saw_tombstone = true;
                if let Some(handle) = registry.remove(id) {
                    self.tracker.forget(&handle);
                    debug!(table, id, "remote tombstone destroyed local object");
                }
                continue;
            }

            let record: SerializedRecord =
                row.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            let existing = registry.get(id);
            let had_existing = existing.is_some();

            match self.ty.reconcile(existing.clone(), &record) {
                Some(handle) => {
                    let merged_in_place = existing
                        .as_ref()
                        .is_some_and(|e| Arc::ptr_eq(e, &handle));
                    if !merged_in_place {
                        handle.write().set_object_id(id);
                        registry.insert(id, handle.clone());
                        debug!(table, id, "remote row materialized locally");
                    }
                    // The row may carry columns the object does not use;
                    // re-serialize so the cached content matches the object.
                    self.tracker.prime(&handle);
                }
                None if had_existing => {
                    // Local state is authoritative over an unreconcilable
                    // row.
                    if let Some(handle) = registry.remove(id) {
                        self.tracker.forget(&handle);
                    }
                    debug!(table, id, "unreconcilable row, local object destroyed");
                }
                None => {
                    // Stamp the row as seen so it is not reselected every
                    // cycle.
                    self.submit(query::build_touch_timestamp(
                        self.provider.dialect(),
                        table,
                        id,
                        self.stamp,
                        &self.provider.time_expr(self.stamp),
                    ));
                }
            }
        }

        if saw_tombstone {
            self.submit(query::build_clear_tombstones(
                self.provider.dialect(),
                table,
            ));
        }
    }

    fn on_error(&self, result: QueryResult) {
        warn!(
            table = self.ty.table(),
            statement = %result.statement,
            error = %result.error.as_deref().unwrap_or(""),
            "sync check failed"
        );
    }
}
