use std::ops::Index;
use std::sync::Arc;

use crate::persist::Cursor;
use crate::skeleton::{Skeleton, SkeletonDefinition};

/// Populated skeletons returned by a query, in query order.
#[derive(Debug, Clone)]
pub struct SkelList {
    definition: Arc<SkeletonDefinition>,
    skels: Vec<Skeleton>,
    cursor: Option<Cursor>,
}

impl SkelList {
    pub(crate) fn new(definition: Arc<SkeletonDefinition>, cursor: Option<Cursor>) -> Self {
        Self {
            definition,
            skels: Vec::new(),
            cursor,
        }
    }
    pub(crate) fn push(&mut self, skel: Skeleton) {
        self.skels.push(skel);
    }

    pub fn definition(&self) -> &Arc<SkeletonDefinition> {
        &self.definition
    }
    /// Continues the query after the last skeleton; `None` on the last page.
    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Skeleton> {
        self.skels.iter()
    }
    pub fn get(&self, index: usize) -> Option<&Skeleton> {
        self.skels.get(index)
    }
    pub fn len(&self) -> usize {
        self.skels.len()
    }
    pub fn is_empty(&self) -> bool {
        self.skels.is_empty()
    }
}

impl Index<usize> for SkelList {
    type Output = Skeleton;
    fn index(&self, index: usize) -> &Skeleton {
        &self.skels[index]
    }
}

impl<'a> IntoIterator for &'a SkelList {
    type Item = &'a Skeleton;
    type IntoIter = std::slice::Iter<'a, Skeleton>;
    fn into_iter(self) -> Self::IntoIter {
        self.skels.iter()
    }
}
