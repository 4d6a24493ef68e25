// used for persistence
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

// used for timestamps stored in properties
use chrono::{DateTime, Utc};

// values are stored as JSON in the datastore
use serde::{Deserialize, Serialize};

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
// used to print out readable forms of a data type
use std::fmt;

use crate::error::{OssatureError, Result};

// ------------- Value -------------
/// A single property value as held by bones and stored in entities.
///
/// Bones holding several values use `List`, bones holding one value per
/// language use `Map` keyed by language code.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    DateTime(DateTime<Utc>),
    Key(Key),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Null, the empty string and empty collections count as "no value".
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Text(s) => s.is_empty(),
            Value::List(l) => l.is_empty(),
            Value::Map(m) => m.is_empty(),
            _ => false,
        }
    }
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
    pub fn as_datetime(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::DateTime(d) => Some(d),
            _ => None,
        }
    }
    pub fn as_key(&self) -> Option<&Key> {
        match self {
            Value::Key(k) => Some(k),
            _ => None,
        }
    }
    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Text(_) => 3,
            Value::DateTime(_) => 4,
            Value::Key(_) => 5,
            Value::List(_) => 6,
            Value::Map(_) => 7,
        }
    }

    /// Total ordering used for query filters, sort orders and cursors.
    ///
    /// Values of different families order by family; integers and floats
    /// share one numeric family.
    pub fn canonical_cmp(&self, other: &Value) -> Ordering {
        let rank = self.rank().cmp(&other.rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Int(_), _) | (Value::Float(_), _) => {
                let a = self.as_float().unwrap_or_default();
                let b = other.as_float().unwrap_or_default();
                a.total_cmp(&b)
            }
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Key(a), Value::Key(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let o = x.canonical_cmp(y);
                    if o != Ordering::Equal {
                        return o;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Map(a), Value::Map(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let o = ka.cmp(kb).then_with(|| va.canonical_cmp(vb));
                    if o != Ordering::Equal {
                        return o;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => Ordering::Equal,
        }
    }

    /// Plain JSON form used by the renderers.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::DateTime(d) => serde_json::Value::String(d.to_rfc3339()),
            Value::Key(k) => serde_json::Value::String(k.encode()),
            Value::List(l) => serde_json::Value::Array(l.iter().map(Value::to_json).collect()),
            Value::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
            Value::DateTime(d) => write!(f, "{}", d.to_rfc3339()),
            Value::Key(k) => write!(f, "{}", k),
            Value::List(_) | Value::Map(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}
impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::DateTime(d)
    }
}
impl From<Key> for Value {
    fn from(k: Key) -> Self {
        Value::Key(k)
    }
}
impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

// ------------- Key -------------
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyId {
    Id(u64),
    Name(String),
}

/// Storage key of an entity: its kind, a numeric id or a name, and an
/// optional parent key. The string form produced by [`Key::encode`] is
/// opaque to callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key {
    parent: Option<Box<Key>>,
    kind: String,
    id: KeyId,
}

impl Key {
    pub fn with_id(kind: &str, id: u64) -> Self {
        Self {
            parent: None,
            kind: kind.to_string(),
            id: KeyId::Id(id),
        }
    }
    pub fn with_name(kind: &str, name: &str) -> Self {
        Self {
            parent: None,
            kind: kind.to_string(),
            id: KeyId::Name(name.to_string()),
        }
    }
    pub fn child_of(mut self, parent: &Key) -> Self {
        self.parent = Some(Box::new(parent.clone()));
        self
    }
    pub fn kind(&self) -> &str {
        &self.kind
    }
    pub fn id(&self) -> &KeyId {
        &self.id
    }
    pub fn parent(&self) -> Option<&Key> {
        self.parent.as_deref()
    }
    /// True if `ancestor` is this key's parent, grandparent, and so on.
    pub fn has_ancestor(&self, ancestor: &Key) -> bool {
        let mut current = self.parent();
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = p.parent();
        }
        false
    }
    pub fn encode(&self) -> String {
        let segment = match &self.id {
            KeyId::Id(id) => format!("{}:{}", escape(&self.kind), id),
            KeyId::Name(name) => format!("{}:~{}", escape(&self.kind), escape(name)),
        };
        match &self.parent {
            Some(p) => format!("{}/{}", p.encode(), segment),
            None => segment,
        }
    }
    pub fn decode(encoded: &str) -> Result<Key> {
        let bad = |reason: &str| OssatureError::BadKey {
            key: encoded.to_string(),
            reason: reason.to_string(),
        };
        let mut key: Option<Key> = None;
        for segment in encoded.split('/') {
            let (kind, id) = segment.split_once(':').ok_or_else(|| bad("missing ':'"))?;
            if kind.is_empty() {
                return Err(bad("empty kind"));
            }
            let id = match id.strip_prefix('~') {
                Some(name) => KeyId::Name(unescape(name).ok_or_else(|| bad("bad escape"))?),
                None => KeyId::Id(id.parse().map_err(|_| bad("id is not numeric"))?),
            };
            key = Some(Key {
                parent: key.map(Box::new),
                kind: unescape(kind).ok_or_else(|| bad("bad escape"))?,
                id,
            });
        }
        key.ok_or_else(|| bad("empty key"))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}
impl TryFrom<String> for Key {
    type Error = OssatureError;
    fn try_from(s: String) -> Result<Self> {
        Key::decode(&s)
    }
}
impl From<Key> for String {
    fn from(k: Key) -> String {
        k.encode()
    }
}
impl ToSql for Key {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.encode()))
    }
}
impl FromSql for Key {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Key::decode(text).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            ':' => out.push_str("%3A"),
            '~' => out.push_str("%7E"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3)?;
        out.push(match code {
            "25" => '%',
            "2F" => '/',
            "3A" => ':',
            "7E" => '~',
            _ => return None,
        });
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Some(out)
}

// ------------- Entity -------------
/// The flat property bag written to and read from the datastore.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    kind: String,
    key: Option<Key>,
    parent: Option<Key>,
    properties: BTreeMap<String, Value>,
    unindexed: BTreeSet<String>,
}

impl Entity {
    /// A new entity without a key; one is allocated when it is first put.
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            key: None,
            parent: None,
            properties: BTreeMap::new(),
            unindexed: BTreeSet::new(),
        }
    }
    pub fn with_key(key: Key) -> Self {
        Self {
            kind: key.kind().to_string(),
            parent: key.parent().cloned(),
            key: Some(key),
            properties: BTreeMap::new(),
            unindexed: BTreeSet::new(),
        }
    }
    pub fn child_of(mut self, parent: &Key) -> Self {
        self.parent = Some(parent.clone());
        self
    }
    pub(crate) fn restore(
        key: Key,
        properties: BTreeMap<String, Value>,
        unindexed: BTreeSet<String>,
    ) -> Self {
        Self {
            kind: key.kind().to_string(),
            parent: key.parent().cloned(),
            key: Some(key),
            properties,
            unindexed,
        }
    }
    pub fn kind(&self) -> &str {
        &self.kind
    }
    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }
    pub fn parent(&self) -> Option<&Key> {
        self.parent.as_ref()
    }
    pub(crate) fn assign_key(&mut self, key: Key) {
        self.key = Some(key);
    }
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
    pub fn contains(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }
    /// Sets a property; unindexed properties are stored but never match a query filter.
    pub fn set(&mut self, name: &str, value: Value, indexed: bool) {
        if indexed {
            self.unindexed.remove(name);
        } else {
            self.unindexed.insert(name.to_string());
        }
        self.properties.insert(name.to_string(), value);
    }
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.unindexed.remove(name);
        self.properties.remove(name)
    }
    pub fn is_indexed(&self, name: &str) -> bool {
        self.properties.contains_key(name) && !self.unindexed.contains(name)
    }
    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }
    pub fn unindexed(&self) -> &BTreeSet<String> {
        &self.unindexed
    }
    /// Removes every property equal to `name` or below it (`name.*`).
    pub fn remove_tree(&mut self, name: &str) {
        let prefix = format!("{}.", name);
        let doomed: Vec<String> = self
            .properties
            .keys()
            .filter(|k| *k == name || k.starts_with(&prefix))
            .cloned()
            .collect();
        for k in doomed {
            self.remove(&k);
        }
    }
}
