// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write-behind change tracker.
//!
//! The tracker sits in front of the dispatcher and decides *what* needs to
//! be written. It records at most one pending action per live object — a
//! later mark replaces the earlier one, so repeated mutations coalesce into
//! a single write — and turns the captured set into dispatcher work on
//! [`flush`](ChangeTracker::flush).
//!
//! Deletion is deliberately not write-behind: a pending write replayed
//! after a delete would resurrect the row, so `mark_delete` issues the
//! backend delete immediately.
//!
//! Failure semantics are at-most-once per flush cycle: a failed write is
//! logged with the rendered statement and dropped, never retried
//! automatically.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::dispatcher::{Dispatcher, OwnerId, QueryRequest, QuerySink};
use crate::object::{object_key, ObjectHandle, ObjectType};
use crate::provider::{Provider, QueryResult};
use crate::query;

/// Pending write for one object. Delete is not represented: it executes
/// immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Create,
    Update,
}

struct PendingEntry {
    ty: Arc<dyn ObjectType>,
    handle: ObjectHandle,
    action: PendingAction,
}

type ContentMap = Arc<Mutex<HashMap<usize, String>>>;

/// Dirty-tracking write-behind cache.
pub struct ChangeTracker {
    provider: Arc<dyn Provider>,
    dispatcher: Arc<Dispatcher>,
    owner: OwnerId,
    pending: Mutex<HashMap<usize, PendingEntry>>,
    /// Content hash of the last write per live object; lets a flush skip
    /// upserts whose serialized form did not move.
    content: ContentMap,
    flush_wanted: Notify,
}

impl ChangeTracker {
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, dispatcher: Arc<Dispatcher>, owner: OwnerId) -> Self {
        Self {
            provider,
            dispatcher,
            owner,
            pending: Mutex::new(HashMap::new()),
            content: Arc::new(Mutex::new(HashMap::new())),
            flush_wanted: Notify::new(),
        }
    }

    /// Record an object as needing its first persist.
    ///
    /// An object that already carries an id is really an update.
    pub fn mark_create(&self, ty: &Arc<dyn ObjectType>, handle: &ObjectHandle) {
        if handle.read().object_id() != 0 {
            self.mark_update(ty, handle);
            return;
        }
        handle.write().mark_timestamp_fresh();
        self.pending.lock().insert(
            object_key(handle),
            PendingEntry {
                ty: ty.clone(),
                handle: handle.clone(),
                action: PendingAction::Create,
            },
        );
        self.flush_wanted.notify_one();
    }

    /// Record an object as mutated.
    ///
    /// An object without an id was never persisted and becomes a create. A
    /// timestamp-fresh object has not logically changed since the last sync
    /// tick and is skipped. A pending create is never downgraded: create
    /// subsumes update.
    pub fn mark_update(&self, ty: &Arc<dyn ObjectType>, handle: &ObjectHandle) {
        if handle.read().object_id() == 0 {
            self.mark_create(ty, handle);
            return;
        }
        if handle.read().is_timestamp_fresh() {
            return;
        }
        handle.write().mark_timestamp_fresh();
        let mut pending = self.pending.lock();
        let entry = pending.entry(object_key(handle));
        match entry {
            std::collections::hash_map::Entry::Occupied(occupied)
                if occupied.get().action == PendingAction::Create => {}
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                occupied.get_mut().action = PendingAction::Update;
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(PendingEntry {
                    ty: ty.clone(),
                    handle: handle.clone(),
                    action: PendingAction::Update,
                });
            }
        }
        drop(pending);
        self.flush_wanted.notify_one();
    }

    /// Drop any pending write for the object, delete its row immediately
    /// when one exists, and remove it from its type's registry.
    pub fn mark_delete(&self, ty: &Arc<dyn ObjectType>, handle: &ObjectHandle) {
        let key = object_key(handle);
        self.pending.lock().remove(&key);
        self.content.lock().remove(&key);

        let id = handle.read().object_id();
        if id != 0 {
            let statement = query::build_delete(self.provider.dialect(), ty.table(), id);
            if let Err(e) = self.dispatcher.submit(QueryRequest::execute(
                self.owner,
                self.provider.clone(),
                statement,
            )) {
                warn!(table = ty.table(), id, error = %e, "delete not submitted");
            }
            ty.registry().remove(id);
        }
    }

    /// Swap out the pending map and submit one persist per captured object.
    ///
    /// Returns the number of writes submitted. Generated-id writeback and
    /// registry insertion happen later, in the outcome sink during drain —
    /// never on the worker.
    pub fn flush(&self) -> usize {
        let captured = std::mem::take(&mut *self.pending.lock());
        let mut submitted = 0usize;

        for (key, entry) in captured {
            let (table, id, record) = {
                let obj = entry.handle.read();
                (obj.table().to_string(), obj.object_id(), obj.serialize())
            };

            let hash = record.content_hash();
            if self.content.lock().get(&key) == Some(&hash) {
                debug!(table = %table, id, "content unchanged, write skipped");
                continue;
            }
            self.content.lock().insert(key, hash);

            let sink = Arc::new(PersistSink {
                ty: entry.ty.clone(),
                handle: entry.handle.clone(),
                content: self.content.clone(),
            });
            let request = QueryRequest::persist(
                self.owner,
                self.provider.clone(),
                table.clone(),
                id,
                record,
            )
            .with_sink(sink);

            match self.dispatcher.submit(request) {
                Ok(()) => submitted += 1,
                Err(e) => {
                    warn!(table = %table, id, error = %e, "write not submitted");
                }
            }
        }

        submitted
    }

    /// Resolves when a mark has requested a flush.
    pub async fn flush_requested(&self) {
        self.flush_wanted.notified().await;
    }

    /// Record an object's current content as already persisted, so the next
    /// flush does not echo a reconciled row straight back to the backend.
    pub fn prime(&self, handle: &ObjectHandle) {
        let hash = handle.read().serialize().content_hash();
        self.content.lock().insert(object_key(handle), hash);
    }

    /// Forget the cached content of a destroyed object.
    pub fn forget(&self, handle: &ObjectHandle) {
        self.content.lock().remove(&object_key(handle));
    }

    /// Number of objects with pending writes.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Drain-side completion for one persisted object: assigns a generated id
/// and registers the object under it.
struct PersistSink {
    ty: Arc<dyn ObjectType>,
    handle: ObjectHandle,
    content: ContentMap,
}

impl QuerySink for PersistSink {
    fn on_result(&self, result: QueryResult) {
        if let Some(id) = result.generated_id {
            let current = self.handle.read().object_id();
            if current != id {
                self.handle.write().set_object_id(id);
                self.ty.registry().insert(id, self.handle.clone());
                debug!(table = self.ty.table(), id, "object entered registry");
            }
        }
    }

    fn on_error(&self, result: QueryResult) {
        warn!(
            table = self.ty.table(),
            statement = %result.statement,
            error = %result.error.as_deref().unwrap_or(""),
            "write dropped"
        );
        // The recorded hash no longer reflects backend state; a later mark
        // must be able to write this content again.
        self.content.lock().remove(&object_key(&self.handle));
    }
}
