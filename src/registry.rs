//! Maps kind names to skeleton definitions.
//!
//! Framework code registers default skeletons, applications may override
//! them. The precedence rules are:
//! * a new kind is stored,
//! * an application definition replaces a framework definition,
//! * a framework definition never replaces an application definition,
//! * two applications defining the same kind from different sources is an
//!   error, the same source registering again replaces its definition.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::error::{OssatureError, Result};
use crate::skeleton::SkeletonDefinition;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Framework,
    /// Application code, identified by where it was defined.
    Application(String),
}

#[derive(Debug, Default)]
struct Entries {
    order: Vec<String>,
    definitions: HashMap<String, (Arc<SkeletonDefinition>, Origin)>,
}

#[derive(Debug, Default)]
pub struct SkeletonRegistry {
    entries: RwLock<Entries>,
}

impl SkeletonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition and returns the one now in effect for its kind.
    pub fn register(
        &self,
        definition: Arc<SkeletonDefinition>,
        origin: Origin,
    ) -> Result<Arc<SkeletonDefinition>> {
        definition.validate()?;
        let kind = definition.kind().to_string();
        if kind.is_empty() {
            return Ok(definition);
        }
        let mut guard = self.entries.write()?;
        let entries = &mut *guard;
        let previous = entries
            .definitions
            .get(&kind)
            .map(|(d, o)| (Arc::clone(d), o.clone()));
        match previous {
            None => entries.order.push(kind.clone()),
            Some((existing, existing_origin)) => match (&existing_origin, &origin) {
                (Origin::Framework, _) => {}
                (Origin::Application(_), Origin::Framework) => {
                    debug!(kind = %kind, "keeping application skeleton over framework default");
                    return Ok(existing);
                }
                (Origin::Application(a), Origin::Application(b)) if a == b => {}
                (Origin::Application(a), Origin::Application(b)) => {
                    return Err(OssatureError::Definition(format!(
                        "duplicate definition for {} in {} and {}",
                        kind, a, b
                    )));
                }
            },
        }
        debug!(kind = %kind, origin = ?origin, "skeleton registered");
        entries
            .definitions
            .insert(kind, (Arc::clone(&definition), origin));
        Ok(definition)
    }

    pub fn lookup(&self, kind: &str) -> Result<Arc<SkeletonDefinition>> {
        let entries = self.entries.read()?;
        entries
            .definitions
            .get(kind)
            .map(|(d, _)| Arc::clone(d))
            .ok_or_else(|| OssatureError::UnknownKind(kind.to_string()))
    }

    /// Registered kinds in registration order.
    pub fn list_kinds(&self) -> Result<Vec<String>> {
        Ok(self.entries.read()?.order.clone())
    }
}

lazy_static! {
    static ref GLOBAL: Arc<SkeletonRegistry> = Arc::new(SkeletonRegistry::new());
}

/// The process-wide registry.
pub fn global() -> Arc<SkeletonRegistry> {
    Arc::clone(&GLOBAL)
}

pub fn register(definition: Arc<SkeletonDefinition>, origin: Origin) -> Result<Arc<SkeletonDefinition>> {
    GLOBAL.register(definition, origin)
}

pub fn skeleton_by_kind(kind: &str) -> Result<Arc<SkeletonDefinition>> {
    GLOBAL.lookup(kind)
}

pub fn list_known_skeletons() -> Result<Vec<String>> {
    GLOBAL.list_kinds()
}
