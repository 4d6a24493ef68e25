use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::bones::{tokenize, BoneParams, ClientData, ReadFromClientError, Severity};
use crate::datatype::{Entity, Key, Value};
use crate::error::Result;
use crate::persist::{FilterOp, Query, Store};
use crate::relskel::{promote_missing, RelSkelDefinition};

use super::Bone;

/// Kind of the denormalized records pointing from a source to a destination.
pub const RELATIONS_KIND: &str = "viur-relations";

const RECORD_PAGE: usize = 500;

/// Reference to entities of another kind.
///
/// Each referenced entity is held as a map
/// `{"dest": {"key": .., <copied ref_keys>..}, "rel": {..} | null}`.
/// The whole value is stored unindexed under the bone name, the referenced
/// keys additionally indexed as `<name>.dest.key`. After every save the bone
/// writes one relation record per reference so changes of the destination
/// can be propagated back.
#[derive(Debug, Clone)]
pub struct RelationalBone {
    params: BoneParams,
    value: Value,
    kind: String,
    ref_keys: Vec<String>,
    using: Option<RelSkelDefinition>,
}

impl RelationalBone {
    pub fn new(descr: &str, kind: &str) -> Self {
        Self {
            params: BoneParams::new(descr),
            value: Value::Null,
            kind: kind.to_string(),
            ref_keys: vec!["name".to_string()],
            using: None,
        }
    }
    /// Properties of the destination copied into the relation.
    pub fn ref_keys(mut self, ref_keys: &[&str]) -> Self {
        self.ref_keys = ref_keys.iter().map(|k| k.to_string()).collect();
        self
    }
    /// Extra fields stored with each relation.
    pub fn using(mut self, using: RelSkelDefinition) -> Self {
        self.using = Some(using);
        self
    }
    pub fn dest_kind(&self) -> &str {
        &self.kind
    }

    pub fn entries(&self) -> Vec<&Value> {
        match &self.value {
            Value::List(items) => items.iter().collect(),
            Value::Null => Vec::new(),
            single => vec![single],
        }
    }

    fn entries_mut(&mut self) -> Vec<&mut Value> {
        match &mut self.value {
            Value::List(items) => items.iter_mut().collect(),
            Value::Null => Vec::new(),
            single => vec![single],
        }
    }

    /// Encoded keys of every referenced entity, in order.
    pub fn dest_keys(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(dest_key)
            .map(str::to_string)
            .collect()
    }

    fn copy_ref_keys(&self, dest: &mut BTreeMap<String, Value>, entity: &Entity) {
        for ref_key in &self.ref_keys {
            let prefix = format!("{}.", ref_key);
            for (property, value) in entity.properties() {
                if property == ref_key || property.starts_with(&prefix) {
                    dest.insert(property.clone(), value.clone());
                }
            }
        }
    }

    fn previous_dest(&self, encoded: &str) -> Option<BTreeMap<String, Value>> {
        self.entries()
            .into_iter()
            .find(|e| dest_key(e) == Some(encoded))
            .and_then(|e| e.as_map())
            .and_then(|m| m.get("dest"))
            .and_then(|d| d.as_map())
            .cloned()
    }

    fn parse_entry(
        &self,
        raw_key: &str,
        nested: &ClientData,
        path: &[String],
        errors: &mut Vec<ReadFromClientError>,
    ) -> Option<Value> {
        let key = match Key::decode(raw_key) {
            Ok(key) if key.kind() == self.kind => key,
            Ok(key) => {
                errors.push(ReadFromClientError::new(
                    Severity::Invalid,
                    &format!("Expected a key of kind {}, got {}", self.kind, key.kind()),
                    path.to_vec(),
                ));
                return None;
            }
            Err(_) => {
                errors.push(ReadFromClientError::new(Severity::Invalid, "Invalid key", path.to_vec()));
                return None;
            }
        };
        let encoded = key.encode();
        let mut dest = self.previous_dest(&encoded).unwrap_or_default();
        dest.insert("key".to_string(), Value::Text(encoded));
        let rel = match &self.using {
            Some(using) => {
                let mut rel = using.instance();
                for error in rel.from_client(nested) {
                    let mut error = promote_missing(error);
                    let mut full_path = path.to_vec();
                    full_path.append(&mut error.field_path);
                    error.field_path = full_path;
                    errors.push(error);
                }
                rel.to_value()
            }
            None => Value::Null,
        };
        Some(entry(dest, rel))
    }

    /// Record keys are derived from the bone name and position, so saving
    /// again overwrites the previous records.
    fn record_key(name: &str, index: usize, source: &Key) -> Key {
        Key::with_name(RELATIONS_KIND, &format!("{}.{}", name, index)).child_of(source)
    }

    fn records_of(name: &str, store: &dyn Store, source: &Key) -> Result<Vec<Key>> {
        let query = Query::new(RELATIONS_KIND)
            .ancestor(source)
            .filter("viur_src_property", FilterOp::Eq, name);
        let mut keys = Vec::new();
        let mut cursor = None;
        loop {
            let batch = store.run_query(&query, RECORD_PAGE, cursor.as_ref())?;
            keys.extend(batch.entities.iter().filter_map(|e| e.key().cloned()));
            if !batch.more {
                break;
            }
            cursor = batch.cursor;
        }
        Ok(keys)
    }
}

fn entry(dest: BTreeMap<String, Value>, rel: Value) -> Value {
    let mut map = BTreeMap::new();
    map.insert("dest".to_string(), Value::Map(dest));
    map.insert("rel".to_string(), rel);
    Value::Map(map)
}

fn dest_key(entry: &Value) -> Option<&str> {
    entry.as_map()?.get("dest")?.as_map()?.get("key")?.as_text()
}

/// Positions submitted as `<name>.<index>.<field>`, ascending.
fn submitted_indices(name: &str, data: &ClientData) -> BTreeSet<usize> {
    let prefix = format!("{}.", name);
    data.keys()
        .filter_map(|k| k.strip_prefix(&prefix))
        .filter_map(|rest| rest.split('.').next())
        .filter_map(|index| index.parse().ok())
        .collect()
}

impl Bone for RelationalBone {
    bone_state!("relational");

    fn single_from_client(&self, raw: &str) -> std::result::Result<Value, String> {
        let mut errors = Vec::new();
        self.parse_entry(raw, &ClientData::new(), &[], &mut errors)
            .ok_or_else(|| errors.first().map(|e| e.message.clone()).unwrap_or_default())
    }

    fn single_unserialize(&self, value: &Value) -> Value {
        let (Some(using), Some(map)) = (&self.using, value.as_map()) else {
            return value.clone();
        };
        let mut stored = map.clone();
        if let Some(rel) = map.get("rel").filter(|rel| rel.as_map().is_some()) {
            // stored fields are read through the current relation skeleton
            let mut instance = using.instance();
            instance.from_value(rel);
            stored.insert("rel".to_string(), instance.to_value());
        }
        Value::Map(stored)
    }

    fn single_search_tags(&self, value: &Value) -> Vec<String> {
        let mut tags = Vec::new();
        let dest = value.as_map().and_then(|m| m.get("dest")).and_then(|d| d.as_map());
        for (property, v) in dest.into_iter().flatten() {
            if property == "key" {
                continue;
            }
            for text in super::single_values(v).into_iter().filter_map(Value::as_text) {
                tags.extend(tokenize(text));
            }
        }
        tags
    }

    fn serialize(&self, name: &str, entity: &mut Entity) {
        entity.remove_tree(name);
        let stored = if self.params.multiple {
            Value::List(self.entries().into_iter().cloned().collect())
        } else {
            self.entries().into_iter().next().cloned().unwrap_or_default()
        };
        entity.set(name, stored, false);
        let keys: Vec<Value> = self.dest_keys().into_iter().map(Value::Text).collect();
        let indexed = if self.params.multiple {
            Value::List(keys)
        } else {
            keys.into_iter().next().unwrap_or_default()
        };
        entity.set(&format!("{}.dest.key", name), indexed, self.params.indexed);
    }

    fn from_client(&mut self, name: &str, data: &ClientData) -> Option<Vec<ReadFromClientError>> {
        // either plain keys under `name`, or `name.<i>.key` plus relation fields
        let mut submitted: Vec<(Vec<String>, String, ClientData)> = Vec::new();
        let indices = submitted_indices(name, data);
        if let Some(raw) = data.get(name) {
            for (i, key) in raw.values().into_iter().enumerate() {
                if !key.trim().is_empty() {
                    let path = vec![name.to_string(), i.to_string()];
                    submitted.push((path, key.trim().to_string(), ClientData::new()));
                }
            }
        } else {
            for i in &indices {
                let nested = data.nested(&format!("{}.{}", name, i));
                if let Some(key) = nested.first("key").map(str::trim).filter(|k| !k.is_empty()) {
                    let path = vec![name.to_string(), i.to_string()];
                    submitted.push((path, key.to_string(), nested.clone()));
                }
            }
        }
        if submitted.is_empty() {
            self.value = self.empty_value();
            let severity = if data.contains(name) || !indices.is_empty() {
                Severity::Empty
            } else {
                Severity::NotSet
            };
            return Some(vec![ReadFromClientError::new(
                severity,
                "No value entered",
                vec![name.to_string()],
            )]);
        }
        if !self.params.multiple {
            submitted.truncate(1);
        }
        let mut errors = Vec::new();
        let mut parsed = Vec::new();
        for (path, raw_key, nested) in &submitted {
            if let Some(entry) = self.parse_entry(raw_key, nested, path, &mut errors) {
                parsed.push(entry);
            }
        }
        if errors.iter().any(|e| e.severity == Severity::Invalid) {
            return Some(errors);
        }
        self.value = if self.params.multiple {
            Value::List(parsed)
        } else {
            parsed.into_iter().next().unwrap_or_default()
        };
        if errors.is_empty() { None } else { Some(errors) }
    }

    fn unique_index_value(&self) -> Option<String> {
        let mut keys = self.dest_keys();
        if keys.is_empty() {
            return None;
        }
        keys.sort();
        Some(blake3::hash(keys.join("\n").as_bytes()).to_hex().to_string())
    }

    fn refresh(&mut self, name: &str, store: &dyn Store) -> Result<()> {
        let mut loaded = Vec::new();
        for encoded in self.dest_keys() {
            let entity = store.get(&Key::decode(&encoded)?)?;
            loaded.push(entity);
        }
        let copies: Vec<Option<BTreeMap<String, Value>>> = loaded
            .iter()
            .map(|entity| {
                entity.as_ref().map(|entity| {
                    let mut dest = BTreeMap::new();
                    self.copy_ref_keys(&mut dest, entity);
                    dest
                })
            })
            .collect();
        for (entry, copy) in self.entries_mut().into_iter().zip(copies) {
            let Some(dest) = entry
                .as_map_mut()
                .and_then(|m| m.get_mut("dest"))
                .and_then(Value::as_map_mut)
            else {
                continue;
            };
            match copy {
                Some(copy) => {
                    dest.retain(|k, _| k == "key");
                    dest.extend(copy);
                }
                // a vanished destination keeps its last known copy
                None => debug!(bone = name, "referenced entity is gone, keeping stale copy"),
            }
        }
        Ok(())
    }

    fn validate_references(&mut self, name: &str, store: &dyn Store) -> Result<Vec<ReadFromClientError>> {
        let mut errors = Vec::new();
        for (i, encoded) in self.dest_keys().into_iter().enumerate() {
            if store.get(&Key::decode(&encoded)?)?.is_none() {
                errors.push(ReadFromClientError::new(
                    Severity::Invalid,
                    "Referenced entity does not exist",
                    vec![name.to_string(), i.to_string()],
                ));
            }
        }
        if errors.is_empty() {
            self.refresh(name, store)?;
        }
        Ok(errors)
    }

    fn post_saved(&self, name: &str, store: &dyn Store, key: &Key) -> Result<()> {
        let tag = chrono::Utc::now().timestamp_millis();
        let mut written = BTreeSet::new();
        for (i, value) in self.entries().into_iter().enumerate() {
            let Some(map) = value.as_map() else { continue };
            let mut record = Entity::with_key(Self::record_key(name, i, key));
            record.set("viur_src_kind", Value::from(key.kind()), true);
            record.set("viur_src_property", Value::from(name), true);
            record.set("viur_dest_kind", Value::from(self.kind.as_str()), true);
            record.set("viur_delayed_update_tag", Value::Int(tag), true);
            for (section, fields) in map {
                for (field, v) in fields.as_map().into_iter().flatten() {
                    record.set(&format!("{}.{}", section, field), v.clone(), true);
                }
            }
            written.insert(store.put(&mut record)?);
        }
        for stale in Self::records_of(name, store, key)? {
            if !written.contains(&stale) {
                store.delete(&stale)?;
            }
        }
        debug!(bone = name, key = %key, records = written.len(), "relation records written");
        Ok(())
    }

    fn post_deleted(&self, name: &str, store: &dyn Store, key: &Key) -> Result<()> {
        for record in Self::records_of(name, store, key)? {
            store.delete(&record)?;
        }
        Ok(())
    }

    fn structure(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut structure = super::base_structure(self);
        structure.insert("type".into(), format!("relational.{}", self.kind).into());
        structure.insert("module".into(), self.kind.clone().into());
        structure.insert("refKeys".into(), serde_json::json!(self.ref_keys));
        structure.insert(
            "using".into(),
            self.using
                .as_ref()
                .map(RelSkelDefinition::structure)
                .unwrap_or(serde_json::Value::Null),
        );
        structure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bones::Configure;
    use crate::persist::{Datastore, PersistenceMode};

    #[test]
    fn client_keys_must_match_destination_kind() {
        let mut bone = RelationalBone::new("Author", "person").multiple();
        let data = ClientData::new().with("author", vec!["person:1", "page:2"]);
        let errors = bone.from_client("author", &data).unwrap_or_default();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field_path, vec!["author", "1"]);
        assert!(bone.entries().is_empty());
    }

    #[test]
    fn refresh_copies_ref_keys() {
        let store = Datastore::new(PersistenceMode::InMemory).unwrap();
        let mut person = Entity::new("person");
        person.set("name", Value::from("Ada"), true);
        person.set("age", Value::Int(36), true);
        let person_key = store.put(&mut person).unwrap();

        let mut bone = RelationalBone::new("Author", "person");
        let data = ClientData::new().with("author", person_key.encode().as_str());
        assert!(bone.from_client("author", &data).is_none());
        assert!(bone.validate_references("author", &store).unwrap().is_empty());
        let dest = bone.entries()[0].as_map().unwrap()["dest"].as_map().unwrap().clone();
        assert_eq!(dest.get("name"), Some(&Value::from("Ada")));
        assert!(dest.get("age").is_none());
    }

    #[test]
    fn stored_relation_fields_are_read_through_using() {
        use crate::bones::NumericBone;
        use crate::relskel::RelSkelBuilder;

        let using = RelSkelBuilder::new()
            .bone("minutes", NumericBone::new("Minutes"))
            .build()
            .unwrap();
        let mut bone = RelationalBone::new("Speaker", "person").using(using);
        let mut dest = BTreeMap::new();
        dest.insert("key".to_string(), Value::from("person:1"));
        let mut rel = BTreeMap::new();
        rel.insert("minutes".to_string(), Value::from("45"));
        rel.insert("dropped".to_string(), Value::from("no longer declared"));
        let mut entity = Entity::new("talk");
        entity.set("speaker", entry(dest, Value::Map(rel)), false);

        assert!(bone.unserialize("speaker", &entity));
        let rel = bone.entries()[0].as_map().unwrap()["rel"].as_map().unwrap().clone();
        assert_eq!(rel.get("minutes"), Some(&Value::Int(45)));
        assert!(rel.get("dropped").is_none());
    }
}
