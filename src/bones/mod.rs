//! Bones are the typed fields of a skeleton.
//!
//! Every bone owns its current [`Value`] and knows how to
//! * flatten that value into properties of an [`Entity`] and read it back,
//! * read and validate raw client input,
//! * contribute search tags, blob references and a unique index value.
//!
//! Bones holding several values (`multiple`) keep a `Value::List`; bones
//! with `languages` keep a `Value::Map` from language code to the value of
//! that language. Concrete bones only describe how a *single* value is
//! parsed and stored; the shared handling of lists and languages lives in
//! the helper functions of this module.

use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::datatype::{Entity, Key, Value};
use crate::error::Result;
use crate::persist::Store;
use crate::search::{SearchField, SearchFieldKind};

// Implements the accessors every bone shares; expects `params` and `value` fields.
macro_rules! bone_state {
    ($type_name:expr) => {
        fn type_name(&self) -> &'static str {
            $type_name
        }
        fn params(&self) -> &$crate::bones::BoneParams {
            &self.params
        }
        fn params_mut(&mut self) -> &mut $crate::bones::BoneParams {
            &mut self.params
        }
        fn value(&self) -> &$crate::datatype::Value {
            &self.value
        }
        fn value_mut(&mut self) -> &mut $crate::datatype::Value {
            &mut self.value
        }
        fn box_clone(&self) -> Box<dyn $crate::bones::Bone> {
            Box::new(self.clone())
        }
    };
}

mod base;
mod boolean;
mod date;
mod file;
mod numeric;
mod relational;
mod string;

pub use base::IdBone;
pub use boolean::BooleanBone;
pub use date::DateBone;
pub use file::FileBone;
pub use numeric::NumericBone;
pub use relational::{RelationalBone, RELATIONS_KIND};
pub use string::{escape_string, StringBone};

// ------------- Parameters -------------
/// Attributes shared by every bone.
#[derive(Debug, Clone, PartialEq)]
pub struct BoneParams {
    pub descr: String,
    pub required: bool,
    pub read_only: bool,
    pub visible: bool,
    pub indexed: bool,
    pub multiple: bool,
    pub languages: Vec<String>,
    pub searchable: bool,
    pub unique: bool,
    pub default_value: Option<Value>,
    /// Free-form parameters handed through to renderers.
    pub params: BTreeMap<String, String>,
}

impl BoneParams {
    pub fn new(descr: &str) -> Self {
        Self {
            descr: descr.to_string(),
            required: false,
            read_only: false,
            visible: true,
            indexed: true,
            multiple: false,
            languages: Vec::new(),
            searchable: false,
            unique: false,
            default_value: None,
            params: BTreeMap::new(),
        }
    }
}

// ------------- Client input -------------
/// One raw value submitted by a client: a single string or a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientValue {
    Single(String),
    Multiple(Vec<String>),
}

impl ClientValue {
    pub fn values(&self) -> Vec<&str> {
        match self {
            ClientValue::Single(s) => vec![s.as_str()],
            ClientValue::Multiple(l) => l.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for ClientValue {
    fn from(s: &str) -> Self {
        ClientValue::Single(s.to_string())
    }
}
impl From<String> for ClientValue {
    fn from(s: String) -> Self {
        ClientValue::Single(s)
    }
}
impl From<Vec<String>> for ClientValue {
    fn from(l: Vec<String>) -> Self {
        ClientValue::Multiple(l)
    }
}
impl From<Vec<&str>> for ClientValue {
    fn from(l: Vec<&str>) -> Self {
        ClientValue::Multiple(l.into_iter().map(str::to_string).collect())
    }
}

/// Raw request data as handed to `from_client`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientData(BTreeMap<String, ClientValue>);

impl ClientData {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with(mut self, key: &str, value: impl Into<ClientValue>) -> Self {
        self.insert(key, value);
        self
    }
    pub fn insert(&mut self, key: &str, value: impl Into<ClientValue>) {
        self.0.insert(key.to_string(), value.into());
    }
    pub fn get(&self, key: &str) -> Option<&ClientValue> {
        self.0.get(key)
    }
    pub fn first(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.values().into_iter().next())
    }
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
    /// Entries below `prefix.`, with the prefix stripped.
    pub fn nested(&self, prefix: &str) -> ClientData {
        let prefix = format!("{}.", prefix);
        ClientData(
            self.0
                .iter()
                .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|rest| (rest.to_string(), v.clone())))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<ClientValue>> FromIterator<(K, V)> for ClientData {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        ClientData(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    /// The field was not submitted at all.
    NotSet = 0,
    /// The value is fine, but makes another field invalid.
    InvalidatesOther = 1,
    /// The field was submitted without a value.
    Empty = 2,
    Invalid = 3,
}

/// A rejected client value and the path of the field it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadFromClientError {
    pub severity: Severity,
    pub field_path: Vec<String>,
    pub message: String,
    pub invalidated_fields: Vec<String>,
}

impl ReadFromClientError {
    pub fn new(severity: Severity, message: &str, field_path: Vec<String>) -> Self {
        Self {
            severity,
            field_path,
            message: message.to_string(),
            invalidated_fields: Vec::new(),
        }
    }
    /// The top-level field this error is about.
    pub fn field(&self) -> Option<&str> {
        self.field_path.first().map(String::as_str)
    }
    pub fn is_missing(&self) -> bool {
        matches!(self.severity, Severity::NotSet | Severity::Empty)
    }
}

// ------------- Bone -------------
pub trait Bone: fmt::Debug + Send + Sync {
    fn type_name(&self) -> &'static str;
    fn params(&self) -> &BoneParams;
    fn params_mut(&mut self) -> &mut BoneParams;
    fn value(&self) -> &Value;
    fn value_mut(&mut self) -> &mut Value;
    fn box_clone(&self) -> Box<dyn Bone>;

    /// The empty form of a single value.
    fn single_empty(&self) -> Value {
        Value::Null
    }
    fn single_serialize(&self, value: &Value) -> Value {
        value.clone()
    }
    fn single_unserialize(&self, value: &Value) -> Value {
        value.clone()
    }
    /// Parses one raw client value; `Err` carries the message shown to the user.
    fn single_from_client(&self, raw: &str) -> std::result::Result<Value, String>;
    fn single_search_tags(&self, value: &Value) -> Vec<String> {
        tokenize(&value.to_string())
    }

    fn set_value(&mut self, value: Value) {
        *self.value_mut() = value;
    }
    fn empty_value(&self) -> Value {
        empty_value(self)
    }
    fn initial_value(&self) -> Value {
        match &self.params().default_value {
            Some(v) => v.clone(),
            None => self.empty_value(),
        }
    }
    fn serialize(&self, name: &str, entity: &mut Entity) {
        serialize_value(self, name, entity)
    }
    fn unserialize(&mut self, name: &str, entity: &Entity) -> bool {
        unserialize_value(self, name, entity)
    }
    /// `None` accepts the input, `Some` rejects it with the reasons.
    fn from_client(&mut self, name: &str, data: &ClientData) -> Option<Vec<ReadFromClientError>> {
        from_client_value(self, name, data)
    }
    /// Takes over the state of the same bone from another skeleton instance.
    fn merge_from(&mut self, other: &dyn Bone) {
        self.set_value(other.value().clone());
    }
    /// Automatic values set right before a write. `is_update` is false for
    /// writes that must not count as a change of the entity.
    fn perform_magic(&mut self, _is_add: bool, _is_update: bool) {}
    fn referenced_blobs(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }
    /// Canonical form of the current value used to claim unique values,
    /// `None` if there is nothing to claim.
    fn unique_index_value(&self) -> Option<String> {
        unique_index_value(self.value())
    }
    fn search_tags(&self) -> Vec<String> {
        let mut tags = Vec::new();
        for v in single_values(self.value()) {
            for tag in self.single_search_tags(v) {
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
            }
        }
        tags
    }
    fn search_document_fields(&self, name: &str) -> Vec<SearchField> {
        if !self.params().searchable {
            return Vec::new();
        }
        single_values(self.value())
            .into_iter()
            .filter(|v| !v.is_empty())
            .map(|v| SearchField::new(name, &v.to_string(), SearchFieldKind::Text))
            .collect()
    }
    /// Re-derives cached data (e.g. copies of referenced entities).
    fn refresh(&mut self, _name: &str, _store: &dyn Store) -> Result<()> {
        Ok(())
    }
    /// Checks values that need the datastore to be validated.
    fn validate_references(
        &mut self,
        _name: &str,
        _store: &dyn Store,
    ) -> Result<Vec<ReadFromClientError>> {
        Ok(Vec::new())
    }
    fn post_saved(&self, _name: &str, _store: &dyn Store, _key: &Key) -> Result<()> {
        Ok(())
    }
    fn post_deleted(&self, _name: &str, _store: &dyn Store, _key: &Key) -> Result<()> {
        Ok(())
    }
    /// Structural description for renderers.
    fn structure(&self) -> serde_json::Map<String, serde_json::Value> {
        base_structure(self)
    }
}

impl Clone for Box<dyn Bone> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Builder-style configuration available on every concrete bone.
pub trait Configure: Bone + Sized {
    fn descr(mut self, descr: &str) -> Self {
        self.params_mut().descr = descr.to_string();
        self
    }
    fn required(mut self) -> Self {
        self.params_mut().required = true;
        self
    }
    fn read_only(mut self) -> Self {
        self.params_mut().read_only = true;
        self
    }
    fn hidden(mut self) -> Self {
        self.params_mut().visible = false;
        self
    }
    fn unindexed(mut self) -> Self {
        self.params_mut().indexed = false;
        self
    }
    fn searchable(mut self) -> Self {
        self.params_mut().searchable = true;
        self
    }
    fn multiple(mut self) -> Self {
        self.params_mut().multiple = true;
        let initial = self.initial_value();
        self.set_value(initial);
        self
    }
    fn languages(mut self, languages: &[&str]) -> Self {
        self.params_mut().languages = languages.iter().map(|l| l.to_string()).collect();
        let initial = self.initial_value();
        self.set_value(initial);
        self
    }
    fn with_default(mut self, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.params_mut().default_value = Some(value.clone());
        self.set_value(value);
        self
    }
    fn param(mut self, key: &str, value: &str) -> Self {
        self.params_mut().params.insert(key.to_string(), value.to_string());
        self
    }
}

impl<B: Bone> Configure for B {}

// ------------- Shared value handling -------------
fn empty_slot<B: Bone + ?Sized>(bone: &B) -> Value {
    if bone.params().multiple {
        Value::List(Vec::new())
    } else {
        bone.single_empty()
    }
}

pub fn empty_value<B: Bone + ?Sized>(bone: &B) -> Value {
    let languages = &bone.params().languages;
    if languages.is_empty() {
        empty_slot(bone)
    } else {
        Value::Map(languages.iter().map(|l| (l.clone(), empty_slot(bone))).collect())
    }
}

/// Flattens every scalar held by a bone value (lists and language maps).
pub fn single_values(value: &Value) -> Vec<&Value> {
    match value {
        Value::List(items) => items.iter().flat_map(single_values).collect(),
        Value::Map(m) if !m.contains_key("dest") => m.values().flat_map(single_values).collect(),
        other => vec![other],
    }
}

fn serialize_slot<B: Bone + ?Sized>(bone: &B, value: &Value) -> Value {
    match (bone.params().multiple, value) {
        (true, Value::List(items)) => Value::List(items.iter().map(|v| bone.single_serialize(v)).collect()),
        (true, other) if other.is_empty() => Value::List(Vec::new()),
        (true, other) => Value::List(vec![bone.single_serialize(other)]),
        (false, other) => bone.single_serialize(other),
    }
}

/// Writes `name` (or `name.<lang>` for every language) into the entity.
pub fn serialize_value<B: Bone + ?Sized>(bone: &B, name: &str, entity: &mut Entity) {
    let params = bone.params();
    entity.remove_tree(name);
    if params.languages.is_empty() {
        entity.set(name, serialize_slot(bone, bone.value()), params.indexed);
        return;
    }
    let empty = empty_slot(bone);
    for language in &params.languages {
        let slot = bone
            .value()
            .as_map()
            .and_then(|m| m.get(language))
            .unwrap_or(&empty);
        entity.set(
            &format!("{}.{}", name, language),
            serialize_slot(bone, slot),
            params.indexed,
        );
    }
}

fn unserialize_slot<B: Bone + ?Sized>(bone: &B, stored: Option<&Value>) -> Value {
    let multiple = bone.params().multiple;
    match stored {
        None | Some(Value::Null) => empty_slot(bone),
        Some(Value::List(items)) if multiple => {
            Value::List(items.iter().map(|v| bone.single_unserialize(v)).collect())
        }
        Some(Value::List(items)) => items
            .first()
            .map(|v| bone.single_unserialize(v))
            .unwrap_or_else(|| bone.single_empty()),
        Some(v) if multiple => Value::List(vec![bone.single_unserialize(v)]),
        Some(v) => bone.single_unserialize(v),
    }
}

/// Reads a value back from the entity; missing properties yield the empty value.
pub fn unserialize_value<B: Bone + ?Sized>(bone: &mut B, name: &str, entity: &Entity) -> bool {
    let languages = bone.params().languages.clone();
    let value = if languages.is_empty() {
        unserialize_slot(bone, entity.get(name))
    } else {
        let mut map = BTreeMap::new();
        for (i, language) in languages.iter().enumerate() {
            let mut stored = entity.get(&format!("{}.{}", name, language));
            // a bone that gained languages still finds its old plain value
            if stored.is_none() && i == 0 {
                stored = entity.get(name);
            }
            map.insert(language.clone(), unserialize_slot(bone, stored));
        }
        Value::Map(map)
    };
    bone.set_value(value);
    true
}

fn parse_slot<B: Bone + ?Sized>(
    bone: &B,
    raw: Option<&ClientValue>,
    path: Vec<String>,
    errors: &mut Vec<ReadFromClientError>,
) -> Value {
    let Some(raw) = raw else {
        errors.push(ReadFromClientError::new(Severity::NotSet, "Field not submitted", path));
        return empty_slot(bone);
    };
    let values: Vec<&str> = raw.values().into_iter().filter(|v| !v.trim().is_empty()).collect();
    if values.is_empty() {
        errors.push(ReadFromClientError::new(Severity::Empty, "No value entered", path));
        return empty_slot(bone);
    }
    if bone.params().multiple {
        let mut parsed = Vec::new();
        for (i, raw) in values.iter().enumerate() {
            match bone.single_from_client(raw) {
                Ok(v) => parsed.push(v),
                Err(message) => {
                    let mut p = path.clone();
                    p.push(i.to_string());
                    errors.push(ReadFromClientError::new(Severity::Invalid, &message, p));
                }
            }
        }
        Value::List(parsed)
    } else {
        match bone.single_from_client(values[0]) {
            Ok(v) => v,
            Err(message) => {
                errors.push(ReadFromClientError::new(Severity::Invalid, &message, path));
                bone.single_empty()
            }
        }
    }
}

/// Reads `name` (or `name.<lang>` per language) from client data.
///
/// Invalid input leaves the current value untouched; missing input resets
/// the bone to its empty value and is reported as `NotSet`/`Empty`.
pub fn from_client_value<B: Bone + ?Sized>(
    bone: &mut B,
    name: &str,
    data: &ClientData,
) -> Option<Vec<ReadFromClientError>> {
    let languages = bone.params().languages.clone();
    let mut errors = Vec::new();
    let value = if languages.is_empty() {
        parse_slot(bone, data.get(name), vec![name.to_string()], &mut errors)
    } else {
        let mut map = BTreeMap::new();
        for language in &languages {
            let raw = data.get(&format!("{}.{}", name, language));
            let path = vec![name.to_string(), language.clone()];
            map.insert(language.clone(), parse_slot(bone, raw, path, &mut errors));
        }
        let missing = errors.iter().filter(|e| e.is_missing()).count();
        if missing == languages.len() {
            let severity = if errors.iter().all(|e| e.severity == Severity::NotSet) {
                Severity::NotSet
            } else {
                Severity::Empty
            };
            errors.retain(|e| !e.is_missing());
            errors.push(ReadFromClientError::new(severity, "No value entered", vec![name.to_string()]));
        } else {
            errors.retain(|e| !e.is_missing());
        }
        Value::Map(map)
    };
    if errors.iter().any(|e| e.severity == Severity::Invalid) {
        return Some(errors);
    }
    bone.set_value(value);
    if errors.is_empty() { None } else { Some(errors) }
}

/// blake3 digest of the canonical JSON form; lists are order-independent.
pub fn unique_index_value(value: &Value) -> Option<String> {
    if value.is_empty() {
        return None;
    }
    let canonical = match value {
        Value::List(items) => {
            let mut items: Vec<&Value> = items.iter().collect();
            items.sort_by(|a, b| a.canonical_cmp(b));
            serde_json::Value::Array(items.into_iter().map(Value::to_json).collect()).to_string()
        }
        other => other.to_json().to_string(),
    };
    Some(blake3::hash(canonical.as_bytes()).to_hex().to_string())
}

/// Lowercased words of a text, one tag per word.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for word in text.split_whitespace() {
        let tag = word.to_lowercase();
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

pub fn base_structure<B: Bone + ?Sized>(bone: &B) -> serde_json::Map<String, serde_json::Value> {
    let p = bone.params();
    let structure = json!({
        "descr": p.descr,
        "type": bone.type_name(),
        "required": p.required,
        "params": p.params,
        "visible": p.visible,
        "readonly": p.read_only,
        "unique": p.unique,
        "languages": if p.languages.is_empty() { serde_json::Value::Null } else { json!(p.languages) },
        "multiple": p.multiple,
        "emptyValue": bone.empty_value().to_json(),
    });
    match structure {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}
