// used for persistence
use rusqlite::{params, params_from_iter, Connection, Error, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::datatype::{Entity, Key, Value};
use crate::error::{OssatureError, Result};

/// Where the datastore keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    InMemory,
    File(String),
}

// ------------- Store -------------
/// The operations the persistence engine needs from a storage backend.
///
/// Implemented by [`Datastore`] (every call is its own transaction) and by
/// [`Txn`] (calls join the surrounding transaction).
pub trait Store {
    fn get(&self, key: &Key) -> Result<Option<Entity>>;
    /// Writes the entity, allocating a numeric id first if it has no key yet.
    fn put(&self, entity: &mut Entity) -> Result<Key>;
    fn delete(&self, key: &Key) -> Result<()>;
    fn run_query(&self, query: &Query, limit: usize, cursor: Option<&Cursor>)
        -> Result<QueryBatch>;
}

// ------------- Query -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FilterOp {
    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            FilterOp::Eq => ordering == Ordering::Equal,
            FilterOp::Ne => ordering != Ordering::Equal,
            FilterOp::Lt => ordering == Ordering::Less,
            FilterOp::Le => ordering != Ordering::Greater,
            FilterOp::Gt => ordering == Ordering::Greater,
            FilterOp::Ge => ordering != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub property: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    /// List properties match when any of their elements matches.
    fn matches(&self, entity: &Entity) -> bool {
        if !entity.is_indexed(&self.property) {
            return false;
        }
        match entity.get(&self.property) {
            Some(Value::List(items)) => items
                .iter()
                .any(|v| self.op.accepts(v.canonical_cmp(&self.value))),
            Some(v) => self.op.accepts(v.canonical_cmp(&self.value)),
            None => false,
        }
    }
}

/// A kind-scoped query. Results are ordered by the given orders and then by key.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    kind: String,
    ancestor: Option<Key>,
    filters: Vec<Filter>,
    orders: Vec<(String, SortOrder)>,
}

impl Query {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ancestor: None,
            filters: Vec::new(),
            orders: Vec::new(),
        }
    }
    pub fn filter(mut self, property: &str, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            property: property.to_string(),
            op,
            value: value.into(),
        });
        self
    }
    pub fn order(mut self, property: &str, order: SortOrder) -> Self {
        self.orders.push((property.to_string(), order));
        self
    }
    pub fn ancestor(mut self, key: &Key) -> Self {
        self.ancestor = Some(key.clone());
        self
    }
    pub fn kind(&self) -> &str {
        &self.kind
    }
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Encoded-key prefix shared by every descendant of the ancestor.
    fn ancestor_prefix(&self) -> Option<String> {
        self.ancestor.as_ref().map(|a| format!("{}/", a.encode()))
    }

    /// Serialized values that must occur in the stored property bag of any
    /// match. Only equality filters whose values serialize one way qualify;
    /// the filters themselves still decide.
    fn required_fragments(&self) -> Result<Vec<String>> {
        let mut fragments = Vec::new();
        for filter in &self.filters {
            if filter.op != FilterOp::Eq {
                continue;
            }
            if let Value::Text(_) | Value::Key(_) | Value::Bool(_) = filter.value {
                fragments.push(serde_json::to_string(&filter.value)?);
            }
        }
        Ok(fragments)
    }

    fn accepts(&self, entity: &Entity) -> bool {
        if let Some(ancestor) = &self.ancestor {
            match entity.key() {
                Some(k) if k.has_ancestor(ancestor) => {}
                _ => return false,
            }
        }
        self.filters.iter().all(|f| f.matches(entity))
    }

    fn position(&self, entity: &Entity) -> Option<Position> {
        let key = entity.key()?.clone();
        let values = self
            .orders
            .iter()
            .map(|(p, _)| entity.get(p).cloned().unwrap_or(Value::Null))
            .collect();
        Some(Position { values, key })
    }

    fn compare(&self, a: &Position, b: &Position) -> Ordering {
        for ((_, order), (x, y)) in self.orders.iter().zip(a.values.iter().zip(b.values.iter())) {
            let o = match order {
                SortOrder::Ascending => x.canonical_cmp(y),
                SortOrder::Descending => y.canonical_cmp(x),
            };
            if o != Ordering::Equal {
                return o;
            }
        }
        a.key.cmp(&b.key)
    }
}

/// Where a query stopped: the sort values and key of the last returned entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Position {
    values: Vec<Value>,
    key: Key,
}

/// Opaque continuation token for a paged query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
    fn from_position(position: &Position) -> Result<Self> {
        Ok(Self(serde_json::to_string(position)?))
    }
    fn position(&self) -> Result<Position> {
        serde_json::from_str(&self.0).map_err(|e| OssatureError::DataCorruption {
            message: format!("unusable cursor: {}", e),
        })
    }
}

/// One page of query results.
#[derive(Debug, Clone)]
pub struct QueryBatch {
    pub entities: Vec<Entity>,
    /// Resumes after the last returned entity; `None` when nothing was returned.
    pub cursor: Option<Cursor>,
    /// True if further matching entities exist past this page.
    pub more: bool,
}

// ------------- Transactions -------------
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    /// The transaction may touch several entity groups.
    pub cross_group: bool,
}

impl TransactionOptions {
    pub fn cross_group() -> Self {
        Self { cross_group: true }
    }
}

/// A handle on an open transaction, only valid inside
/// [`Datastore::run_in_transaction`].
pub struct Txn<'t> {
    connection: &'t Connection,
}

impl Store for Txn<'_> {
    fn get(&self, key: &Key) -> Result<Option<Entity>> {
        get_entity(self.connection, key)
    }
    fn put(&self, entity: &mut Entity) -> Result<Key> {
        put_entity(self.connection, entity)
    }
    fn delete(&self, key: &Key) -> Result<()> {
        delete_entity(self.connection, key)
    }
    fn run_query(
        &self,
        query: &Query,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<QueryBatch> {
        run_query(self.connection, query, limit, cursor)
    }
}

// ------------- Persistence -------------
/// SQLite-backed datastore holding every entity as a JSON property bag.
pub struct Datastore {
    connection: Mutex<Connection>,
    mode: PersistenceMode,
}

impl Datastore {
    pub fn new(mode: PersistenceMode) -> Result<Self> {
        let connection = match &mode {
            PersistenceMode::InMemory => Connection::open_in_memory()?,
            PersistenceMode::File(path) => Connection::open(path)?,
        };
        // The "STRICT" keyword introduced in 3.37.0 breaks JDBC connections, which makes
        // debugging using an external tool like DBeaver impossible
        connection.execute_batch(
            "
            create table if not exists Entity (
                Entity_Key text not null,
                Kind text not null,
                Properties text not null,
                Unindexed text not null,
                constraint referenceable_Entity_Key primary key (
                    Entity_Key
                )
            );-- STRICT;
            create index if not exists Entity_by_Kind on Entity (
                Kind
            );
            create table if not exists KeySequence (
                Sequence_Identity integer primary key autoincrement
            );-- STRICT;
            ",
        )?;
        debug!(?mode, "datastore opened");
        Ok(Self {
            connection: Mutex::new(connection),
            mode,
        })
    }

    pub fn mode(&self) -> &PersistenceMode {
        &self.mode
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        Ok(self.connection.lock()?)
    }

    /// Runs `f` inside one transaction. `Ok` commits, `Err` rolls back and
    /// leaves no partial effects behind.
    pub fn run_in_transaction<T, F>(&self, options: TransactionOptions, f: F) -> Result<T>
    where
        F: FnOnce(&Txn<'_>) -> Result<T>,
    {
        let mut connection = self.lock()?;
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let txn = Txn { connection: &tx };
        match f(&txn) {
            Ok(out) => {
                tx.commit()?;
                debug!(cross_group = options.cross_group, "transaction committed");
                Ok(out)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    warn!(error = %rollback, "rollback failed");
                }
                debug!(error = %e, "transaction rolled back");
                Err(e)
            }
        }
    }

    /// Every kind present in the store with its number of entities.
    pub fn kinds(&self) -> Result<Vec<(String, usize)>> {
        let connection = self.lock()?;
        let mut stmt = connection
            .prepare_cached("select Kind, count(*) from Entity group by Kind order by Kind")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as usize)))?;
        let mut kinds = Vec::new();
        for row in rows {
            kinds.push(row?);
        }
        Ok(kinds)
    }
}

impl Store for Datastore {
    fn get(&self, key: &Key) -> Result<Option<Entity>> {
        get_entity(&*self.lock()?, key)
    }
    fn put(&self, entity: &mut Entity) -> Result<Key> {
        put_entity(&*self.lock()?, entity)
    }
    fn delete(&self, key: &Key) -> Result<()> {
        delete_entity(&*self.lock()?, key)
    }
    fn run_query(
        &self,
        query: &Query,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<QueryBatch> {
        run_query(&*self.lock()?, query, limit, cursor)
    }
}

fn restore_entity(key: Key, properties: &str, unindexed: &str) -> Result<Entity> {
    let properties: BTreeMap<String, Value> = serde_json::from_str(properties)?;
    let unindexed: BTreeSet<String> = serde_json::from_str(unindexed)?;
    Ok(Entity::restore(key, properties, unindexed))
}

fn get_entity(connection: &Connection, key: &Key) -> Result<Option<Entity>> {
    let mut stmt = connection.prepare_cached(
        "
        select Properties, Unindexed
            from Entity
            where Entity_Key = ?
        ",
    )?;
    match stmt.query_row::<(String, String), _, _>(params![key], |r| Ok((r.get(0)?, r.get(1)?))) {
        Ok((properties, unindexed)) => Ok(Some(restore_entity(key.clone(), &properties, &unindexed)?)),
        Err(Error::QueryReturnedNoRows) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn allocate_id(connection: &Connection) -> Result<u64> {
    connection
        .prepare_cached("insert into KeySequence default values")?
        .execute([])?;
    Ok(connection.last_insert_rowid() as u64)
}

fn put_entity(connection: &Connection, entity: &mut Entity) -> Result<Key> {
    let key = match entity.key() {
        Some(key) => key.clone(),
        None => {
            let mut key = Key::with_id(entity.kind(), allocate_id(connection)?);
            if let Some(parent) = entity.parent() {
                key = key.child_of(parent);
            }
            entity.assign_key(key.clone());
            key
        }
    };
    let properties = serde_json::to_string(entity.properties())?;
    let unindexed = serde_json::to_string(entity.unindexed())?;
    connection
        .prepare_cached(
            "
            insert or replace into Entity (
                Entity_Key,
                Kind,
                Properties,
                Unindexed
            ) values (?, ?, ?, ?)
            ",
        )?
        .execute(params![&key, key.kind(), properties, unindexed])?;
    Ok(key)
}

fn delete_entity(connection: &Connection, key: &Key) -> Result<()> {
    connection
        .prepare_cached("delete from Entity where Entity_Key = ?")?
        .execute(params![key])?;
    Ok(())
}

fn run_query(
    connection: &Connection,
    query: &Query,
    limit: usize,
    cursor: Option<&Cursor>,
) -> Result<QueryBatch> {
    let mut sql = String::from(
        "
        select Entity_Key, Properties, Unindexed
            from Entity
            where Kind = ?
        ",
    );
    let mut args = vec![query.kind().to_string()];
    // narrow down before decoding any property bag
    if let Some(prefix) = query.ancestor_prefix() {
        sql.push_str("and substr(Entity_Key, 1, length(?)) = ?\n");
        args.push(prefix.clone());
        args.push(prefix);
    }
    for fragment in query.required_fragments()? {
        sql.push_str("and instr(Properties, ?) > 0\n");
        args.push(fragment);
    }
    let mut stmt = connection.prepare_cached(&sql)?;
    let mut rows = stmt.query(params_from_iter(args.iter()))?;
    let mut matching = Vec::new();
    while let Some(row) = rows.next()? {
        let key: Key = row.get(0)?;
        let properties: String = row.get(1)?;
        let unindexed: String = row.get(2)?;
        let entity = restore_entity(key, &properties, &unindexed)?;
        if query.accepts(&entity) {
            if let Some(position) = query.position(&entity) {
                matching.push((position, entity));
            }
        }
    }
    matching.sort_by(|(a, _), (b, _)| query.compare(a, b));
    if let Some(cursor) = cursor {
        let after = cursor.position()?;
        matching.retain(|(p, _)| query.compare(p, &after) == Ordering::Greater);
    }
    let more = matching.len() > limit;
    matching.truncate(limit);
    let cursor = match matching.last() {
        Some((position, _)) => Some(Cursor::from_position(position)?),
        None => None,
    };
    Ok(QueryBatch {
        entities: matching.into_iter().map(|(_, e)| e).collect(),
        cursor,
        more,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Datastore {
        let store = Datastore::new(PersistenceMode::InMemory).unwrap();
        for (name, age) in [("carla", 31), ("anna", 25), ("bert", 40), ("dora", 25)] {
            let mut e = Entity::new("person");
            e.set("name", name.into(), true);
            e.set("age", Value::Int(age), true);
            e.set("bio", "secret".into(), false);
            store.put(&mut e).unwrap();
        }
        store
    }

    #[test]
    fn put_allocates_increasing_ids() {
        let store = Datastore::new(PersistenceMode::InMemory).unwrap();
        let a = store.put(&mut Entity::new("thing")).unwrap();
        let b = store.put(&mut Entity::new("thing")).unwrap();
        assert!(a < b);
        assert!(store.get(&a).unwrap().is_some());
    }

    #[test]
    fn filters_orders_and_cursor_paging() {
        let store = seeded();
        let query = Query::new("person")
            .filter("age", FilterOp::Le, Value::Int(31))
            .order("age", SortOrder::Ascending)
            .order("name", SortOrder::Descending);
        let first = store.run_query(&query, 2, None).unwrap();
        let names: Vec<_> = first.entities.iter().map(|e| e.get("name").cloned().unwrap()).collect();
        assert_eq!(names, vec![Value::from("dora"), Value::from("anna")]);
        assert!(first.more);
        let second = store.run_query(&query, 2, first.cursor.as_ref()).unwrap();
        assert_eq!(second.entities.len(), 1);
        assert_eq!(second.entities[0].get("name"), Some(&Value::from("carla")));
        assert!(!second.more);
    }

    #[test]
    fn unindexed_properties_never_match() {
        let store = seeded();
        let query = Query::new("person").filter("bio", FilterOp::Eq, "secret");
        assert!(store.run_query(&query, 10, None).unwrap().entities.is_empty());
    }

    #[test]
    fn ancestor_queries_only_see_descendants() {
        let store = Datastore::new(PersistenceMode::InMemory).unwrap();
        let one = Key::with_id("thing", 1);
        let ten = Key::with_id("thing", 10);
        for (parent, name) in [(&one, "a"), (&one, "b"), (&ten, "a")] {
            let key = Key::with_name("part", name).child_of(parent);
            store.put(&mut Entity::with_key(key)).unwrap();
        }
        let grandchild = Key::with_name("part", "deep").child_of(&Key::with_name("part", "a").child_of(&one));
        store.put(&mut Entity::with_key(grandchild.clone())).unwrap();

        let found = store.run_query(&Query::new("part").ancestor(&one), 10, None).unwrap();
        assert_eq!(found.entities.len(), 3);
        assert!(found.entities.iter().all(|e| e.key().unwrap().has_ancestor(&one)));
        let found = store.run_query(&Query::new("part").ancestor(&ten), 10, None).unwrap();
        assert_eq!(found.entities.len(), 1);
    }

    #[test]
    fn equality_needs_the_whole_value_in_the_right_property() {
        let store = Datastore::new(PersistenceMode::InMemory).unwrap();
        for (label, alias) in [("ab", "x"), ("abc", "ab"), ("x", "y")] {
            let mut e = Entity::new("tag");
            e.set("label", label.into(), true);
            e.set("alias", alias.into(), true);
            e.set("labels", Value::List(vec![label.into(), "shared".into()]), true);
            store.put(&mut e).unwrap();
        }
        let query = Query::new("tag").filter("label", FilterOp::Eq, "ab");
        let found = store.run_query(&query, 10, None).unwrap();
        assert_eq!(found.entities.len(), 1);
        assert_eq!(found.entities[0].get("alias"), Some(&Value::from("x")));

        let query = Query::new("tag").filter("labels", FilterOp::Eq, "shared");
        assert_eq!(store.run_query(&query, 10, None).unwrap().entities.len(), 3);
        let query = Query::new("tag").filter("label", FilterOp::Eq, Value::Int(1));
        assert!(store.run_query(&query, 10, None).unwrap().entities.is_empty());
    }

    #[test]
    fn failed_transaction_leaves_nothing_behind() {
        let store = Datastore::new(PersistenceMode::InMemory).unwrap();
        let outcome: Result<()> = store.run_in_transaction(TransactionOptions::cross_group(), |txn| {
            txn.put(&mut Entity::with_key(Key::with_name("thing", "a")))?;
            Err(OssatureError::NotPersisted)
        });
        assert!(outcome.is_err());
        assert!(store.get(&Key::with_name("thing", "a")).unwrap().is_none());
    }
}
