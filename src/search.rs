//! Full text search documents and the index they are pushed to.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::Mutex;

// used for fast hashing of document ids
use seahash::SeaHasher;
use serde::Serialize;

use crate::datatype::Key;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SearchFieldKind {
    Text,
    Number,
    Date,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchField {
    pub name: String,
    pub value: String,
    pub kind: SearchFieldKind,
}

impl SearchField {
    pub fn new(name: &str, value: &str, kind: SearchFieldKind) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub doc_id: String,
    pub fields: Vec<SearchField>,
}

impl Document {
    pub fn doc_id_for(key: &Key) -> String {
        format!("s_{}", key.encode())
    }
    pub fn new(key: &Key, fields: Vec<SearchField>) -> Self {
        Self {
            doc_id: Self::doc_id_for(key),
            fields,
        }
    }
}

/// A full text index; entities of skeletons with a `search_index` are
/// mirrored into it after every write.
pub trait SearchIndex: Send + Sync {
    fn put(&self, index: &str, document: Document) -> Result<()>;
    fn remove(&self, index: &str, doc_id: &str) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoSearchIndex;

impl SearchIndex for NoSearchIndex {
    fn put(&self, _index: &str, _document: Document) -> Result<()> {
        Ok(())
    }
    fn remove(&self, _index: &str, _doc_id: &str) -> Result<()> {
        Ok(())
    }
}

type Documents = HashMap<String, Document, BuildHasherDefault<SeaHasher>>;

/// Keeps documents in memory, one map per index name.
#[derive(Debug, Default)]
pub struct MemorySearchIndex {
    indexes: Mutex<HashMap<String, Documents, BuildHasherDefault<SeaHasher>>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn document(&self, index: &str, doc_id: &str) -> Result<Option<Document>> {
        let indexes = self.indexes.lock()?;
        Ok(indexes.get(index).and_then(|docs| docs.get(doc_id)).cloned())
    }
    pub fn len(&self, index: &str) -> Result<usize> {
        Ok(self.indexes.lock()?.get(index).map(HashMap::len).unwrap_or(0))
    }
    /// Documents with a field containing the (lowercased) word.
    pub fn search(&self, index: &str, word: &str) -> Result<Vec<String>> {
        let word = word.to_lowercase();
        let indexes = self.indexes.lock()?;
        let mut hits: Vec<String> = indexes
            .get(index)
            .into_iter()
            .flat_map(|docs| docs.values())
            .filter(|doc| {
                doc.fields
                    .iter()
                    .any(|f| f.value.to_lowercase().split_whitespace().any(|w| w == word))
            })
            .map(|doc| doc.doc_id.clone())
            .collect();
        hits.sort();
        Ok(hits)
    }
}

impl SearchIndex for MemorySearchIndex {
    fn put(&self, index: &str, document: Document) -> Result<()> {
        let mut indexes = self.indexes.lock()?;
        indexes
            .entry(index.to_string())
            .or_default()
            .insert(document.doc_id.clone(), document);
        Ok(())
    }
    fn remove(&self, index: &str, doc_id: &str) -> Result<()> {
        let mut indexes = self.indexes.lock()?;
        if let Some(docs) = indexes.get_mut(index) {
            docs.remove(doc_id);
        }
        Ok(())
    }
}
