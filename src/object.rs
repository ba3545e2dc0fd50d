//! Object traits and the in-memory instance registry.
//!
//! The engine never owns domain objects; the host does. What crosses the
//! API boundary is an [`ObjectHandle`] (a shared, lockable reference to
//! something implementing [`Storable`]) plus an [`ObjectType`] descriptor
//! that knows the table name, holds the live-instance [`Registry`] and can
//! reconcile a backend row back into an object.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::record::SerializedRecord;

/// Shared handle to a live domain object.
///
/// Handles are only ever locked on the owner side (flush, drain and
/// reconcile callbacks); the dispatcher worker sees serialized records, not
/// handles.
pub type ObjectHandle = Arc<RwLock<dyn Storable + Send + Sync>>;

/// A domain object the engine can persist.
///
/// Identity is a mutable unsigned id where `0` means "not yet persisted";
/// the first successful flush assigns the backend-generated id through
/// [`set_object_id`](Storable::set_object_id).
pub trait Storable {
    /// Table name for this object's type.
    fn table(&self) -> &str;

    /// Current id; `0` until first persisted.
    fn object_id(&self) -> u64;

    /// Assign the backend-generated id.
    fn set_object_id(&mut self, id: u64);

    /// Render the persisted field set. Called fresh on every sync attempt.
    fn serialize(&self) -> SerializedRecord;

    /// True when the object has not logically changed since the last sync
    /// tick; fresh objects are skipped by update tracking.
    fn is_timestamp_fresh(&self) -> bool;

    /// Stamp the object as synced this tick.
    fn mark_timestamp_fresh(&mut self);
}

/// Type descriptor: table name, live-instance registry and reconciliation.
pub trait ObjectType: Send + Sync {
    /// Table name shared by all instances of this type.
    fn table(&self) -> &str;

    /// The in-memory registry of live instances, keyed by id.
    fn registry(&self) -> &Registry;

    /// Merge a backend record into an existing object in place, or
    /// construct a new one. Returning `None` marks the row as
    /// unreconcilable; the coordinator then treats local state as
    /// authoritative.
    fn reconcile(
        &self,
        existing: Option<ObjectHandle>,
        record: &SerializedRecord,
    ) -> Option<ObjectHandle>;
}

/// In-memory registry of live instances of one type, keyed by id.
///
/// Owned by the owner side exclusively; mutated only during flush/drain
/// callbacks and reconciliation.
#[derive(Default)]
pub struct Registry {
    objects: DashMap<u64, ObjectHandle>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: u64, handle: ObjectHandle) {
        self.objects.insert(id, handle);
    }

    /// Remove an instance; returns the handle if one was registered.
    pub fn remove(&self, id: u64) -> Option<ObjectHandle> {
        self.objects.remove(&id).map(|(_, h)| h)
    }

    #[must_use]
    pub fn get(&self, id: u64) -> Option<ObjectHandle> {
        self.objects.get(&id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.objects.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Snapshot of all registered ids.
    #[must_use]
    pub fn ids(&self) -> Vec<u64> {
        self.objects.iter().map(|r| *r.key()).collect()
    }
}

/// Pending-map identity of a handle: the heap address of the shared object.
///
/// Two clones of the same handle key identically; distinct objects never
/// collide while both are alive.
#[must_use]
pub(crate) fn object_key(handle: &ObjectHandle) -> usize {
    Arc::as_ptr(handle) as *const () as usize
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Minimal `Storable`/`ObjectType` implementations shared by unit tests.

    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::record::SerializedRecord;

    pub struct TestObject {
        pub table: String,
        pub id: u64,
        pub fields: Vec<(String, String)>,
        pub fresh: bool,
    }

    impl TestObject {
        pub fn handle(table: &str, fields: &[(&str, &str)]) -> ObjectHandle {
            Arc::new(RwLock::new(TestObject {
                table: table.to_string(),
                id: 0,
                fields: fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                fresh: false,
            }))
        }
    }

    impl Storable for TestObject {
        fn table(&self) -> &str {
            &self.table
        }

        fn object_id(&self) -> u64 {
            self.id
        }

        fn set_object_id(&mut self, id: u64) {
            self.id = id;
        }

        fn serialize(&self) -> SerializedRecord {
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        }

        fn is_timestamp_fresh(&self) -> bool {
            self.fresh
        }

        fn mark_timestamp_fresh(&mut self) {
            self.fresh = true;
        }
    }

    pub struct TestType {
        pub table: String,
        pub registry: Registry,
        /// When set, reconcile refuses every row.
        pub refuse_reconcile: AtomicBool,
    }

    impl TestType {
        pub fn new(table: &str) -> Arc<Self> {
            Arc::new(TestType {
                table: table.to_string(),
                registry: Registry::new(),
                refuse_reconcile: AtomicBool::new(false),
            })
        }
    }

    impl ObjectType for TestType {
        fn table(&self) -> &str {
            &self.table
        }

        fn registry(&self) -> &Registry {
            &self.registry
        }

        fn reconcile(
            &self,
            existing: Option<ObjectHandle>,
            record: &SerializedRecord,
        ) -> Option<ObjectHandle> {
            if self.refuse_reconcile.load(Ordering::Relaxed) {
                return None;
            }
            // An existing instance is kept as-is; a missing one is rebuilt
            // from the row's columns (id/timestamp are identity, not fields).
            if let Some(handle) = existing {
                return Some(handle);
            }
            let fields: Vec<(String, String)> = record
                .iter()
                .filter(|(name, _)| *name != "id" && *name != "timestamp")
                .map(|(name, field)| (name.to_string(), field.value.clone()))
                .collect();
            Some(Arc::new(RwLock::new(TestObject {
                table: self.table.clone(),
                id: 0,
                fields,
                fresh: false,
            })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn test_registry_insert_get_remove() {
        let registry = Registry::new();
        let handle = TestObject::handle("accounts", &[("nick", "alice")]);

        registry.insert(7, handle.clone());
        assert!(registry.contains(7));
        assert_eq!(registry.len(), 1);

        let fetched = registry.get(7).expect("registered");
        assert!(Arc::ptr_eq(&fetched, &handle));

        let removed = registry.remove(7).expect("removed");
        assert!(Arc::ptr_eq(&removed, &handle));
        assert!(registry.is_empty());
        assert!(registry.get(7).is_none());
    }

    #[test]
    fn test_registry_ids_snapshot() {
        let registry = Registry::new();
        registry.insert(1, TestObject::handle("accounts", &[]));
        registry.insert(2, TestObject::handle("accounts", &[]));

        let mut ids = registry.ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_object_key_identity() {
        let a = TestObject::handle("accounts", &[]);
        let b = TestObject::handle("accounts", &[]);

        assert_eq!(object_key(&a), object_key(&a.clone()));
        assert_ne!(object_key(&a), object_key(&b));
    }

    #[test]
    fn test_storable_roundtrip() {
        let handle = TestObject::handle("accounts", &[("nick", "alice")]);
        {
            let obj = handle.read();
            assert_eq!(obj.object_id(), 0);
            assert_eq!(obj.table(), "accounts");
            let record = obj.serialize();
            assert_eq!(record.get("nick"), Some("alice"));
        }
        handle.write().set_object_id(42);
        assert_eq!(handle.read().object_id(), 42);
    }
}
