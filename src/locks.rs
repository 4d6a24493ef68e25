//! Bookkeeping records written next to entities: blob locks keep referenced
//! uploads alive, unique locks claim unique values.

use std::collections::BTreeSet;

use crate::datatype::{Entity, Key, Value};
use crate::error::{OssatureError, Result};
use crate::persist::Store;

pub const BLOB_LOCKS_KIND: &str = "viur-blob-locks";

// ------------- Blob locks -------------
/// Blobs an entity references now (`active`) and used to reference
/// (`old`). Old references are candidates for garbage collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobLock {
    pub key: Key,
    pub active: BTreeSet<String>,
    pub old: BTreeSet<String>,
    pub is_stale: bool,
}

impl BlobLock {
    pub fn key_for(entity_key: &Key) -> Key {
        Key::with_name(BLOB_LOCKS_KIND, &entity_key.encode())
    }

    pub fn new(entity_key: &Key) -> Self {
        Self {
            key: Self::key_for(entity_key),
            active: BTreeSet::new(),
            old: BTreeSet::new(),
            is_stale: false,
        }
    }

    pub fn load(store: &dyn Store, entity_key: &Key) -> Result<Option<Self>> {
        match store.get(&Self::key_for(entity_key))? {
            Some(entity) => Ok(Some(Self::from_entity(&entity)?)),
            None => Ok(None),
        }
    }

    pub fn from_entity(entity: &Entity) -> Result<Self> {
        let key = entity.key().cloned().ok_or_else(|| OssatureError::DataCorruption {
            message: "blob lock record without key".into(),
        })?;
        Ok(Self {
            key,
            active: string_set(entity.get("active_blob_references")),
            old: string_set(entity.get("old_blob_references")),
            is_stale: entity
                .get("is_stale")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    pub fn to_entity(&self) -> Entity {
        let mut entity = Entity::with_key(self.key.clone());
        entity.set("active_blob_references", list_of(&self.active), true);
        entity.set("old_blob_references", list_of(&self.old), true);
        entity.set("has_old_blob_references", Value::Bool(self.has_old()), true);
        entity.set("is_stale", Value::Bool(self.is_stale), true);
        entity
    }

    pub fn has_old(&self) -> bool {
        !self.old.is_empty()
    }

    /// Replaces the active references: dropped ones become old, re-used
    /// ones are no longer old.
    pub fn update_active(&mut self, referenced: BTreeSet<String>) {
        let removed: Vec<String> = self.active.difference(&referenced).cloned().collect();
        self.old.extend(removed);
        self.old.retain(|blob| !referenced.contains(blob));
        self.active = referenced;
        self.is_stale = false;
    }

    /// The owning entity is gone: everything becomes old.
    pub fn mark_stale(&mut self) {
        let active = std::mem::take(&mut self.active);
        self.old.extend(active);
        self.is_stale = true;
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.old.is_empty()
    }
}

fn string_set(value: Option<&Value>) -> BTreeSet<String> {
    match value {
        Some(Value::List(items)) => items
            .iter()
            .filter_map(Value::as_text)
            .map(str::to_string)
            .collect(),
        Some(Value::Text(s)) if !s.is_empty() => BTreeSet::from([s.clone()]),
        _ => BTreeSet::new(),
    }
}

fn list_of(set: &BTreeSet<String>) -> Value {
    Value::List(set.iter().map(|s| Value::Text(s.clone())).collect())
}

// ------------- Unique locks -------------
/// Claim of one unique value, named by the value's digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueLock {
    pub key: Key,
    pub references: Option<Key>,
}

impl UniqueLock {
    pub fn key_for(lock_kind: &str, value: &str) -> Key {
        Key::with_name(lock_kind, value)
    }

    pub fn new(lock_kind: &str, value: &str, owner: &Key) -> Self {
        Self {
            key: Self::key_for(lock_kind, value),
            references: Some(owner.clone()),
        }
    }

    pub fn load(store: &dyn Store, lock_kind: &str, value: &str) -> Result<Option<Self>> {
        let Some(entity) = store.get(&Self::key_for(lock_kind, value))? else {
            return Ok(None);
        };
        let references = match entity.get("references") {
            Some(Value::Text(encoded)) => Some(Key::decode(encoded)?),
            Some(Value::Key(key)) => Some(key.clone()),
            _ => None,
        };
        Ok(Some(Self {
            key: Self::key_for(lock_kind, value),
            references,
        }))
    }

    /// Held by an entity other than `owner` (a lock without owner is held by nobody).
    pub fn is_held_by_other(&self, owner: Option<&Key>) -> bool {
        match (&self.references, owner) {
            (Some(holder), Some(owner)) => holder != owner,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn to_entity(&self) -> Entity {
        let mut entity = Entity::with_key(self.key.clone());
        let references = self
            .references
            .as_ref()
            .map(|k| Value::Text(k.encode()))
            .unwrap_or_default();
        entity.set("references", references, true);
        entity
    }
}
