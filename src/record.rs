//! Serialized record data structure.
//!
//! A [`SerializedRecord`] is the flat, typed key/value rendering of one
//! domain object's persisted fields. It is the only representation of an
//! object that ever crosses the owner/worker boundary: the engine asks an
//! object to serialize itself fresh on every synchronization attempt and
//! never stores the record anywhere long-lived.
//!
//! # Example
//!
//! ```
//! use rowsync::{SerializedRecord, FieldKind};
//!
//! let mut record = SerializedRecord::new();
//! record.set("nick", "alice");
//! record.set_with_kind("flags", "7", FieldKind::Integer);
//!
//! assert_eq!(record.get("nick"), Some("alice"));
//! assert_eq!(record.kind("flags"), FieldKind::Integer);
//! assert_eq!(record.kind("nick"), FieldKind::Text);
//! ```

use std::collections::BTreeMap;
use sha2::{Digest, Sha256};

/// Column type tag for a serialized field.
///
/// Only consulted when creating or altering a table; values themselves are
/// always carried as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Rendered as a TEXT column.
    Text,
    /// Rendered as an INTEGER column.
    Integer,
}

/// One serialized field: a text value plus its column type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub value: String,
    pub kind: FieldKind,
}

/// Flat, typed key/value representation of one object's persisted fields.
///
/// Field names are unique and case-sensitive. Iteration order is the sorted
/// field-name order, so two records with the same content always hash and
/// render identically regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializedRecord {
    fields: BTreeMap<String, Field>,
}

impl SerializedRecord {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a text field, replacing any previous value under the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.set_with_kind(name, value, FieldKind::Text);
    }

    /// Set a field with an explicit column type tag.
    pub fn set_with_kind(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        kind: FieldKind,
    ) {
        self.fields.insert(
            name.into(),
            Field {
                value: value.into(),
                kind,
            },
        );
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|f| f.value.as_str())
    }

    /// Type tag for a field. Unknown fields default to [`FieldKind::Text`].
    #[must_use]
    pub fn kind(&self, name: &str) -> FieldKind {
        self.fields.get(name).map_or(FieldKind::Text, |f| f.kind)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate fields in sorted name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Field names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Content hash over sorted (name, value) pairs, hex-encoded.
    ///
    /// Unchanged content hashes identically, which is what lets the tracker
    /// skip upserts whose serialized form did not move since the last write.
    /// Empty values do not contribute, so padding a record with empty
    /// columns does not change its hash.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, field) in &self.fields {
            if field.value.is_empty() {
                continue;
            }
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(field.value.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

impl FromIterator<(String, String)> for SerializedRecord {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut record = Self::new();
        for (name, value) in iter {
            record.set(name, value);
        }
        record
    }
}
