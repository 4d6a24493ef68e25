//! The persistence engine: reads skeletons from and writes them to the
//! datastore, keeping unique locks, blob locks, search documents and
//! relation records in line with every write.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bones::{ClientData, ReadFromClientError, Severity};
use crate::config::Settings;
use crate::datatype::{Entity, Key, Value};
use crate::error::{OssatureError, Result};
use crate::locks::{BlobLock, UniqueLock};
use crate::persist::{Cursor, Datastore, PersistenceMode, Query, Store, TransactionOptions};
use crate::registry::{self, SkeletonRegistry};
use crate::search::{Document, NoSearchIndex, SearchIndex};
use crate::skeleton::{Skeleton, SkeletonDefinition};
use crate::skellist::SkelList;
use crate::tasks::{DeferredTask, LocalTaskQueue, TaskQueue};

/// Property stamped on every write, read by relation propagation.
pub const DELAYED_UPDATE_TAG: &str = "viur_delayed_update_tag";
/// Search tags written when no search index is configured.
pub const TAGS_PROPERTY: &str = "viur_tags";

fn unique_property(bone: &str) -> String {
    format!("{}.uniqueIndexValue", bone)
}

pub struct Database {
    store: Datastore,
    registry: Arc<SkeletonRegistry>,
    search: Arc<dyn SearchIndex>,
    tasks: Arc<dyn TaskQueue>,
    settings: Settings,
}

impl Database {
    pub fn new(mode: PersistenceMode) -> Result<Self> {
        let settings = Settings {
            database: crate::config::DatabaseSettings {
                path: match &mode {
                    PersistenceMode::File(path) => Some(path.clone()),
                    PersistenceMode::InMemory => None,
                },
            },
            ..Settings::default()
        };
        Self::open(settings)
    }

    pub fn open(settings: Settings) -> Result<Self> {
        let store = Datastore::new(settings.persistence_mode())?;
        let tasks = Arc::new(LocalTaskQueue::new(settings.tasks.max_attempts));
        debug!(mode = ?store.mode(), "database opened");
        Ok(Self {
            store,
            registry: registry::global(),
            search: Arc::new(NoSearchIndex),
            tasks,
            settings,
        })
    }

    pub fn with_registry(mut self, registry: Arc<SkeletonRegistry>) -> Self {
        self.registry = registry;
        self
    }
    pub fn with_search_index(mut self, search: Arc<dyn SearchIndex>) -> Self {
        self.search = search;
        self
    }
    pub fn with_task_queue(mut self, tasks: Arc<dyn TaskQueue>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn store(&self) -> &Datastore {
        &self.store
    }
    pub fn registry(&self) -> &Arc<SkeletonRegistry> {
        &self.registry
    }
    pub fn settings(&self) -> &Settings {
        &self.settings
    }
    pub fn task_queue(&self) -> &Arc<dyn TaskQueue> {
        &self.tasks
    }

    // ------------- Read -------------
    /// Populates the skeleton from storage. Keys of another kind and keys
    /// that are not stored yield `false` and leave the skeleton untouched.
    pub fn load(&self, skel: &mut Skeleton, key: &Key) -> Result<bool> {
        if key.kind() != skel.kind() {
            debug!(kind = skel.kind(), key = %key, "refusing to load a key of another kind");
            return Ok(false);
        }
        match self.store.get(key)? {
            Some(entity) => {
                skel.from_entity(&entity);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Like [`Database::load`], also accepting a bare id or name of the
    /// skeleton's kind.
    pub fn load_encoded(&self, skel: &mut Skeleton, raw: &str) -> Result<bool> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(false);
        }
        let key = match Key::decode(raw) {
            Ok(key) => key,
            Err(_) => match raw.parse::<u64>() {
                Ok(id) => Key::with_id(skel.kind(), id),
                Err(_) => Key::with_name(skel.kind(), raw),
            },
        };
        self.load(skel, &key)
    }

    pub fn list(
        &self,
        definition: &Arc<SkeletonDefinition>,
        query: &Query,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<SkelList> {
        if query.kind() != definition.kind() {
            return Err(OssatureError::KindMismatch {
                expected: definition.kind().to_string(),
                found: query.kind().to_string(),
            });
        }
        let batch = self.store.run_query(query, limit, cursor)?;
        let cursor = if batch.more { batch.cursor } else { None };
        let mut list = SkelList::new(Arc::clone(definition), cursor);
        for entity in &batch.entities {
            let mut skel = definition.instance();
            skel.from_entity(entity);
            list.push(skel);
        }
        Ok(list)
    }

    // ------------- Client input -------------
    /// Reads client input and additionally checks what needs the datastore:
    /// referenced entities must exist and unique values must be available.
    pub fn from_client(&self, skel: &mut Skeleton, data: &ClientData) -> Result<bool> {
        let mut complete = skel.from_client(data);
        let mut errors: Vec<ReadFromClientError> = Vec::new();
        for (name, bone) in skel.bones_mut() {
            if bone.params().read_only || bone.value().is_empty() {
                continue;
            }
            errors.extend(bone.validate_references(name, &self.store)?);
        }
        let definition = Arc::clone(skel.definition());
        if let Some(unique) = definition.unique() {
            let value = skel.get(&unique.bone).and_then(|b| b.unique_index_value());
            if let Some(value) = value {
                let lock = UniqueLock::load(&self.store, &definition.unique_lock_kind(), &value)?;
                if lock.is_some_and(|l| l.is_held_by_other(skel.key())) {
                    errors.push(ReadFromClientError::new(
                        Severity::Invalid,
                        &unique.message(),
                        vec![unique.bone.clone()],
                    ));
                }
            }
        }
        for error in errors {
            complete = false;
            skel.push_error(error);
        }
        Ok(complete)
    }

    // ------------- Write -------------
    /// Writes the skeleton and everything that hangs off it in one
    /// transaction, returning the key it was stored under.
    ///
    /// With `suppress_dirty_mark` the entity is not tagged as changed and no
    /// relation propagation is scheduled.
    pub fn save(&self, skel: &mut Skeleton, suppress_dirty_mark: bool) -> Result<Key> {
        let definition = Arc::clone(skel.definition());
        let is_add = skel.key().is_none();
        for (_, bone) in skel.bones_mut() {
            bone.perform_magic(is_add, !suppress_dirty_mark);
        }
        let now = Utc::now().timestamp_millis();
        let current_key = skel.key().cloned();
        let lock_kind = definition.unique_lock_kind();
        let max_tag_length = self.settings.search.max_tag_length;

        let outcome = self.store.run_in_transaction(TransactionOptions::cross_group(), |txn| {
            let mut entity = match &current_key {
                Some(key) => txn.get(key)?.unwrap_or_else(|| Entity::with_key(key.clone())),
                None => Entity::new(definition.kind()),
            };
            let old_blob_lock = match &current_key {
                Some(key) => BlobLock::load(txn, key)?,
                None => None,
            };
            let old_unique = definition
                .unique()
                .and_then(|u| entity.get(&unique_property(&u.bone)))
                .and_then(Value::as_text)
                .map(str::to_string);

            // stored state first, then everything held in memory on top
            let mut merged = definition.instance();
            merged.from_entity(&entity);
            for (name, bone) in skel.items() {
                match merged.get_mut(name) {
                    Some(target) => target.merge_from(bone),
                    None => merged.set(name, Some(bone.box_clone()))?,
                }
            }
            merged.serialize(&mut entity);
            let blobs = merged.referenced_blobs();

            let tag = if suppress_dirty_mark { 0 } else { now };
            entity.set(DELAYED_UPDATE_TAG, Value::Int(tag), true);

            if let Some(hook) = &definition.hooks().pre_process_serialized_data {
                hook(&merged, &mut entity);
            }
            let mut new_unique = None;
            if let Some(unique) = definition.unique() {
                new_unique = merged.get(&unique.bone).and_then(|b| b.unique_index_value());
                match &new_unique {
                    Some(value) => {
                        if let Some(lock) = UniqueLock::load(txn, &lock_kind, value)? {
                            if lock.is_held_by_other(current_key.as_ref()) {
                                return Err(OssatureError::UniqueConflict {
                                    field: unique.bone.clone(),
                                    message: unique.message(),
                                });
                            }
                        }
                        entity.set(&unique_property(&unique.bone), Value::Text(value.clone()), true);
                    }
                    None => {
                        entity.remove(&unique_property(&unique.bone));
                    }
                }
            }

            if definition.search_index().is_none() {
                let tags = merged
                    .search_tags()
                    .into_iter()
                    .filter(|t| t.chars().count() < max_tag_length)
                    .map(Value::Text)
                    .collect();
                entity.set(TAGS_PROPERTY, Value::List(tags), true);
            }
            let key = txn.put(&mut entity)?;

            let blobs = match &definition.hooks().pre_process_blob_locks {
                Some(hook) => hook(&merged, blobs),
                None => blobs,
            };
            let mut blob_lock = old_blob_lock.unwrap_or_else(|| BlobLock::new(&key));
            blob_lock.update_active(blobs);
            txn.put(&mut blob_lock.to_entity())?;

            if old_unique != new_unique {
                if let Some(old) = &old_unique {
                    txn.delete(&UniqueLock::key_for(&lock_kind, old))?;
                }
                if let Some(new) = &new_unique {
                    txn.put(&mut UniqueLock::new(&lock_kind, new, &key).to_entity())?;
                }
            }
            Ok((key, merged))
        });
        if let Err(OssatureError::UniqueConflict { field, message }) = &outcome {
            skel.push_error(ReadFromClientError::new(
                Severity::Invalid,
                message,
                vec![field.clone()],
            ));
        }
        let (key, merged) = outcome?;
        skel.set_key(Some(key.clone()));
        debug!(kind = definition.kind(), key = %key, add = is_add, "skeleton saved");

        if let Some(index) = definition.search_index() {
            let fields = merged.search_fields();
            let updated = if fields.is_empty() {
                self.search.remove(index, &Document::doc_id_for(&key))
            } else {
                self.search.put(index, Document::new(&key, fields))
            };
            if let Err(err) = updated {
                warn!(index, key = %key, error = %err, "could not update search document");
            }
        }
        for (name, bone) in merged.items() {
            bone.post_saved(name, &self.store, &key)?;
        }
        if let Some(hook) = &definition.hooks().post_saved {
            hook(skel, &key, &self.store)?;
        }
        if !suppress_dirty_mark {
            self.tasks.defer(DeferredTask::UpdateRelations {
                dest: key.clone(),
                min_change_time: now + self.settings.relations.change_time_offset_ms,
                cursor: None,
            })?;
        }
        Ok(key)
    }

    // ------------- Delete -------------
    pub fn delete(&self, skel: &mut Skeleton) -> Result<()> {
        let key = skel.key().cloned().ok_or(OssatureError::NotPersisted)?;
        let definition = Arc::clone(skel.definition());
        let lock_kind = definition.unique_lock_kind();

        let stored = self.store.run_in_transaction(TransactionOptions::cross_group(), |txn| {
            let entity = txn.get(&key)?.ok_or(OssatureError::NotPersisted)?;
            let mut stored = definition.instance();
            stored.from_entity(&entity);
            if let Some(unique) = definition.unique() {
                if let Some(value) = entity.get(&unique_property(&unique.bone)).and_then(Value::as_text) {
                    txn.delete(&UniqueLock::key_for(&lock_kind, value))?;
                }
            }
            if let Some(mut blob_lock) = BlobLock::load(txn, &key)? {
                blob_lock.mark_stale();
                if blob_lock.is_empty() {
                    txn.delete(&blob_lock.key)?;
                } else {
                    txn.put(&mut blob_lock.to_entity())?;
                }
            }
            txn.delete(&key)?;
            Ok(stored)
        })?;
        debug!(kind = definition.kind(), key = %key, "skeleton deleted");

        for (name, bone) in stored.items() {
            bone.post_deleted(name, &self.store, &key)?;
        }
        if let Some(hook) = &definition.hooks().post_deleted {
            hook(skel, &key, &self.store)?;
        }
        if let Some(index) = definition.search_index() {
            if let Err(err) = self.search.remove(index, &Document::doc_id_for(&key)) {
                warn!(index, key = %key, error = %err, "could not remove search document");
            }
        }
        skel.set_key(None);
        Ok(())
    }
}
