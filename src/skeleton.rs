//! Skeletons describe the shape of one kind of entity.
//!
//! A [`SkeletonDefinition`] is built once (usually at startup) and
//! registered under its kind name. Every [`Skeleton`] instance deep-copies
//! the bones of its definition, so instances never share field state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::bones::{Bone, ClientData, DateBone, IdBone, ReadFromClientError, Severity};
use crate::bones::Configure;
use crate::datatype::{Entity, Key, Value};
use crate::error::{OssatureError, Result};
use crate::persist::Store;
use crate::search::SearchField;

pub(crate) type BoneMap = Vec<(String, Box<dyn Bone>)>;

/// Names that clash with request parameters and cannot be used for bones.
pub const RESERVED_NAMES: [&str; 6] = ["self", "cursor", "amount", "orderby", "orderdir", "style"];

pub fn validate_bone_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(OssatureError::Definition("bone names must not be empty".into()));
    }
    if name.to_lowercase() != name {
        return Err(OssatureError::Definition(format!("bone '{}' must be lowercase", name)));
    }
    if name.contains('.') {
        return Err(OssatureError::Definition(format!("bone '{}' must not contain a dot", name)));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(OssatureError::Definition(format!("'{}' is a reserved bone name", name)));
    }
    Ok(())
}

// ------------- Hooks -------------
pub type SerializedDataHook = Arc<dyn Fn(&Skeleton, &mut Entity) + Send + Sync>;
pub type BlobLocksHook = Arc<dyn Fn(&Skeleton, BTreeSet<String>) -> BTreeSet<String> + Send + Sync>;
pub type LifecycleHook = Arc<dyn Fn(&Skeleton, &Key, &dyn Store) -> Result<()> + Send + Sync>;
pub type SearchFieldsHook = Arc<dyn Fn(&Skeleton, Vec<SearchField>) -> Vec<SearchField> + Send + Sync>;

/// Optional callbacks a definition may install around the persistence steps.
#[derive(Clone, Default)]
pub struct Hooks {
    pub pre_process_serialized_data: Option<SerializedDataHook>,
    pub pre_process_blob_locks: Option<BlobLocksHook>,
    pub post_saved: Option<LifecycleHook>,
    pub post_deleted: Option<LifecycleHook>,
    pub search_document_fields: Option<SearchFieldsHook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("pre_process_serialized_data", &self.pre_process_serialized_data.is_some())
            .field("pre_process_blob_locks", &self.pre_process_blob_locks.is_some())
            .field("post_saved", &self.post_saved.is_some())
            .field("post_deleted", &self.post_deleted.is_some())
            .field("search_document_fields", &self.search_document_fields.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueConstraint {
    pub bone: String,
    pub message: Option<String>,
}

impl UniqueConstraint {
    pub fn message(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| "This value is not available".to_string())
    }
}

// ------------- Definition -------------
pub struct SkeletonBuilder {
    kind: String,
    bones: BoneMap,
    unique: Option<UniqueConstraint>,
    search_index: Option<String>,
    sub_skels: BTreeMap<String, Vec<String>>,
    hooks: Hooks,
    deprecated: Vec<&'static str>,
}

impl SkeletonBuilder {
    pub fn new(kind: &str) -> Self {
        let bones: BoneMap = vec![
            ("id".to_string(), Box::new(IdBone::new())),
            (
                "creationdate".to_string(),
                Box::new(DateBone::new("created at").creation_magic().hidden()),
            ),
            (
                "changedate".to_string(),
                Box::new(DateBone::new("updated at").update_magic().hidden()),
            ),
        ];
        Self {
            kind: kind.to_string(),
            bones,
            unique: None,
            search_index: None,
            sub_skels: BTreeMap::new(),
            hooks: Hooks::default(),
            deprecated: Vec::new(),
        }
    }

    /// Declares a bone; declaring an existing name replaces it in place.
    pub fn bone(mut self, name: &str, bone: impl Bone + 'static) -> Self {
        let bone: Box<dyn Bone> = Box::new(bone);
        match self.bones.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = bone,
            None => self.bones.push((name.to_string(), bone)),
        }
        self
    }
    pub fn enforce_unique_values_for(mut self, bone: &str, message: Option<&str>) -> Self {
        self.unique = Some(UniqueConstraint {
            bone: bone.to_string(),
            message: message.map(str::to_string),
        });
        self
    }
    pub fn search_index(mut self, index: &str) -> Self {
        self.search_index = Some(index.to_string());
        self
    }
    /// Names a subset of bones; a trailing `*` matches by prefix.
    pub fn sub_skel(mut self, name: &str, bones: &[&str]) -> Self {
        self.sub_skels
            .insert(name.to_string(), bones.iter().map(|b| b.to_string()).collect());
        self
    }
    pub fn pre_process_serialized_data(
        mut self,
        hook: impl Fn(&Skeleton, &mut Entity) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.pre_process_serialized_data = Some(Arc::new(hook));
        self
    }
    pub fn pre_process_blob_locks(
        mut self,
        hook: impl Fn(&Skeleton, BTreeSet<String>) -> BTreeSet<String> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.pre_process_blob_locks = Some(Arc::new(hook));
        self
    }
    pub fn post_saved(
        mut self,
        hook: impl Fn(&Skeleton, &Key, &dyn Store) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.post_saved = Some(Arc::new(hook));
        self
    }
    pub fn post_deleted(
        mut self,
        hook: impl Fn(&Skeleton, &Key, &dyn Store) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.post_deleted = Some(Arc::new(hook));
        self
    }
    pub fn search_document_fields(
        mut self,
        hook: impl Fn(&Skeleton, Vec<SearchField>) -> Vec<SearchField> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.search_document_fields = Some(Arc::new(hook));
        self
    }
    /// Replaced by `post_saved`; definitions using it fail to build.
    #[deprecated(note = "use post_saved instead")]
    pub fn post_process_serialized_data(
        mut self,
        _hook: impl Fn(&Skeleton, &mut Entity) + Send + Sync + 'static,
    ) -> Self {
        self.deprecated.push("post_process_serialized_data");
        self
    }

    pub fn build(mut self) -> Result<Arc<SkeletonDefinition>> {
        if let Some(unique) = &self.unique {
            if let Some((_, bone)) = self.bones.iter_mut().find(|(n, _)| *n == unique.bone) {
                bone.params_mut().unique = true;
            }
        }
        let definition = SkeletonDefinition {
            kind: self.kind,
            bones: self.bones,
            unique: self.unique,
            search_index: self.search_index,
            sub_skels: self.sub_skels,
            hooks: self.hooks,
            deprecated: self.deprecated,
        };
        definition.validate()?;
        Ok(Arc::new(definition))
    }
}

#[derive(Debug)]
pub struct SkeletonDefinition {
    kind: String,
    bones: BoneMap,
    unique: Option<UniqueConstraint>,
    search_index: Option<String>,
    sub_skels: BTreeMap<String, Vec<String>>,
    hooks: Hooks,
    deprecated: Vec<&'static str>,
}

impl SkeletonDefinition {
    pub fn kind(&self) -> &str {
        &self.kind
    }
    pub fn unique(&self) -> Option<&UniqueConstraint> {
        self.unique.as_ref()
    }
    pub fn search_index(&self) -> Option<&str> {
        self.search_index.as_deref()
    }
    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }
    pub fn bone_names(&self) -> impl Iterator<Item = &str> {
        self.bones.iter().map(|(n, _)| n.as_str())
    }
    pub fn sub_skel_names(&self) -> impl Iterator<Item = &str> {
        self.sub_skels.keys().map(String::as_str)
    }
    /// Kind of the records claiming unique values of this kind.
    pub fn unique_lock_kind(&self) -> String {
        format!("{}_uniquePropertyIndex", self.kind)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(hook) = self.deprecated.first() {
            return Err(OssatureError::Definition(format!(
                "{}: the {} hook is gone, use post_saved instead",
                self.kind, hook
            )));
        }
        let mut seen = BTreeSet::new();
        for (name, bone) in &self.bones {
            validate_bone_name(name)?;
            if !seen.insert(name.as_str()) {
                return Err(OssatureError::Definition(format!(
                    "{}: bone '{}' is declared twice",
                    self.kind, name
                )));
            }
            if bone.type_name() == "relational" && !bone.params().languages.is_empty() {
                return Err(OssatureError::Definition(format!(
                    "{}: relational bone '{}' cannot have languages",
                    self.kind, name
                )));
            }
        }
        if let Some(unique) = &self.unique {
            let bone = self
                .bones
                .iter()
                .find(|(n, _)| *n == unique.bone)
                .map(|(_, b)| b)
                .ok_or_else(|| {
                    OssatureError::Definition(format!(
                        "{}: unique values enforced for unknown bone '{}'",
                        self.kind, unique.bone
                    ))
                })?;
            if !bone.params().languages.is_empty() {
                return Err(OssatureError::Definition(format!(
                    "{}: unique values cannot be enforced for the multi-language bone '{}'",
                    self.kind, unique.bone
                )));
            }
        }
        Ok(())
    }

    /// A fresh instance holding deep copies of every declared bone.
    pub fn instance(self: &Arc<Self>) -> Skeleton {
        Skeleton {
            definition: Arc::clone(self),
            bones: self.bones.clone(),
            key: None,
            errors: Vec::new(),
        }
    }

    /// A fresh instance restricted to the named sub-skeletons.
    pub fn sub_skel(self: &Arc<Self>, names: &[&str]) -> Result<Skeleton> {
        self.instance().subset(names)
    }

    fn sub_skel_patterns(&self, names: &[&str]) -> Result<Vec<&str>> {
        let mut patterns = Vec::new();
        for name in names {
            let bones = self.sub_skels.get(*name).ok_or_else(|| OssatureError::UnknownSubSkeleton {
                kind: self.kind.clone(),
                name: name.to_string(),
            })?;
            patterns.extend(bones.iter().map(String::as_str));
        }
        Ok(patterns)
    }
}

fn matches_pattern(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

// ------------- Instance -------------
/// One entity's worth of bones, in declaration order.
#[derive(Debug, Clone)]
pub struct Skeleton {
    definition: Arc<SkeletonDefinition>,
    bones: BoneMap,
    key: Option<Key>,
    errors: Vec<ReadFromClientError>,
}

impl Skeleton {
    pub fn definition(&self) -> &Arc<SkeletonDefinition> {
        &self.definition
    }
    pub fn kind(&self) -> &str {
        self.definition.kind()
    }
    /// The key this instance was loaded from or saved as.
    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Bone> {
        self.bones.iter().find(|(n, _)| n == name).map(|(_, b)| b.as_ref())
    }
    pub fn get_mut(&mut self, name: &str) -> Option<&mut dyn Bone> {
        self.bones
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b.as_mut() as &mut dyn Bone)
    }
    /// Adds, replaces (`Some`) or removes (`None`) a bone.
    pub fn set(&mut self, name: &str, bone: Option<Box<dyn Bone>>) -> Result<()> {
        match bone {
            Some(bone) => {
                validate_bone_name(name)?;
                match self.bones.iter_mut().find(|(n, _)| n == name) {
                    Some(slot) => slot.1 = bone,
                    None => self.bones.push((name.to_string(), bone)),
                }
            }
            None => self.bones.retain(|(n, _)| n != name),
        }
        Ok(())
    }
    pub fn contains(&self, name: &str) -> bool {
        self.bones.iter().any(|(n, _)| n == name)
    }
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.bones.iter().map(|(n, _)| n.as_str())
    }
    pub fn items(&self) -> impl Iterator<Item = (&str, &dyn Bone)> {
        self.bones.iter().map(|(n, b)| (n.as_str(), b.as_ref()))
    }
    pub fn values(&self) -> impl Iterator<Item = &dyn Bone> {
        self.bones.iter().map(|(_, b)| b.as_ref())
    }
    pub fn len(&self) -> usize {
        self.bones.len()
    }
    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.get(name).map(|b| b.value())
    }
    pub fn set_value(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let kind = self.kind().to_string();
        let bone = self.get_mut(name).ok_or_else(|| {
            OssatureError::Definition(format!("{} has no bone '{}'", kind, name))
        })?;
        bone.set_value(value.into());
        Ok(())
    }

    pub(crate) fn bones_mut(&mut self) -> impl Iterator<Item = (&str, &mut Box<dyn Bone>)> {
        self.bones.iter_mut().map(|(n, b)| (n.as_str(), b))
    }

    /// Records the canonical key and mirrors it into the `id` bone.
    pub(crate) fn set_key(&mut self, key: Option<Key>) {
        let id = key.as_ref().map(|k| Value::Text(k.encode())).unwrap_or(Value::from(""));
        if let Some(bone) = self.get_mut("id") {
            bone.set_value(id);
        }
        self.key = key;
    }

    // ------------- Import / export -------------
    pub fn from_entity(&mut self, entity: &Entity) {
        for (name, bone) in self.bones.iter_mut() {
            bone.unserialize(name, entity);
        }
        self.set_key(entity.key().cloned());
    }

    /// Writes every bone into the property bag.
    pub fn serialize(&self, entity: &mut Entity) {
        for (name, bone) in &self.bones {
            bone.serialize(name, entity);
        }
    }

    pub fn get_values(&self) -> BTreeMap<String, Value> {
        self.bones
            .iter()
            .map(|(n, b)| (n.clone(), b.value().clone()))
            .collect()
    }
    /// Raw import; names without a bone are ignored.
    pub fn set_values(&mut self, values: BTreeMap<String, Value>) {
        for (name, value) in values {
            if let Some(bone) = self.get_mut(&name) {
                bone.set_value(value);
            }
        }
    }

    /// Reads client input into every writable bone.
    ///
    /// Returns true if the input was complete and valid; otherwise the
    /// reasons are available through [`Skeleton::errors`]. Missing values
    /// only count for required bones and are ignored altogether when the
    /// data carries `nomissing=1`.
    pub fn from_client(&mut self, data: &ClientData) -> bool {
        let ignore_missing = data.first("nomissing") == Some("1");
        self.errors.clear();
        let mut complete = true;
        for (name, bone) in self.bones.iter_mut() {
            if bone.params().read_only {
                continue;
            }
            let required = bone.params().required;
            for error in bone.from_client(name, data).unwrap_or_default() {
                let fatal = match error.severity {
                    Severity::Invalid | Severity::InvalidatesOther => true,
                    Severity::NotSet | Severity::Empty => required && !ignore_missing,
                };
                if fatal {
                    complete = false;
                    self.errors.push(error);
                }
            }
        }
        complete
    }

    pub fn errors(&self) -> &[ReadFromClientError] {
        &self.errors
    }
    pub fn error_for(&self, field: &str) -> Option<&ReadFromClientError> {
        self.errors.iter().find(|e| e.field() == Some(field))
    }
    pub(crate) fn push_error(&mut self, error: ReadFromClientError) {
        self.errors.push(error);
    }

    /// A deep copy restricted to the union of the named sub-skeletons,
    /// always keeping `id`.
    pub fn subset(&self, names: &[&str]) -> Result<Skeleton> {
        let patterns = self.definition.sub_skel_patterns(names)?;
        let bones = self
            .bones
            .iter()
            .filter(|(name, _)| name == "id" || patterns.iter().any(|p| matches_pattern(p, name)))
            .cloned()
            .collect();
        Ok(Skeleton {
            definition: Arc::clone(&self.definition),
            bones,
            key: self.key.clone(),
            errors: Vec::new(),
        })
    }

    /// Lets every bone re-derive its cached data.
    pub fn refresh(&mut self, store: &dyn Store) -> Result<()> {
        for (name, bone) in self.bones.iter_mut() {
            bone.refresh(name, store)?;
        }
        Ok(())
    }

    pub fn referenced_blobs(&self) -> BTreeSet<String> {
        self.bones.iter().flat_map(|(_, b)| b.referenced_blobs()).collect()
    }

    /// Search tags of all searchable bones, deduplicated.
    pub fn search_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        for (_, bone) in self.bones.iter().filter(|(_, b)| b.params().searchable) {
            for tag in bone.search_tags() {
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
            }
        }
        tags
    }

    pub fn search_fields(&self) -> Vec<SearchField> {
        let fields = self
            .bones
            .iter()
            .flat_map(|(n, b)| b.search_document_fields(n))
            .collect();
        match &self.definition.hooks.search_document_fields {
            Some(hook) => hook(self, fields),
            None => fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bones::{NumericBone, StringBone};

    fn article() -> Arc<SkeletonDefinition> {
        SkeletonBuilder::new("article")
            .bone("title", StringBone::new("Title").required())
            .bone("teaser", StringBone::new("Teaser"))
            .bone("views", NumericBone::new("Views"))
            .sub_skel("add", &["title", "teaser"])
            .sub_skel("stats", &["views", "creation*"])
            .build()
            .unwrap()
    }

    #[test]
    fn implicit_bones_come_first() {
        let skel = article().instance();
        let keys: Vec<&str> = skel.keys().collect();
        assert_eq!(keys, vec!["id", "creationdate", "changedate", "title", "teaser", "views"]);
    }

    #[test]
    fn reserved_and_malformed_names_are_rejected() {
        for name in ["self", "Title", "a.b", ""] {
            assert!(validate_bone_name(name).is_err(), "{}", name);
        }
        let result = SkeletonBuilder::new("x").bone("orderby", StringBone::new("x")).build();
        assert!(result.is_err());
    }

    #[test]
    fn subset_keeps_id_and_wildcards() {
        let skel = article().sub_skel(&["stats"]).unwrap();
        let keys: Vec<&str> = skel.keys().collect();
        assert_eq!(keys, vec!["id", "creationdate", "views"]);
        let union = article().sub_skel(&["add", "stats"]).unwrap();
        assert_eq!(union.len(), 5);
        assert!(matches!(
            article().sub_skel(&["nope"]),
            Err(OssatureError::UnknownSubSkeleton { .. })
        ));
    }

    #[test]
    fn instances_do_not_share_bones() {
        let definition = article();
        let mut a = definition.instance();
        let b = definition.instance();
        a.set_value("title", "changed").unwrap();
        assert_eq!(b.value("title"), Some(&Value::from("")));
        let c = a.clone();
        a.set_value("title", "again").unwrap();
        assert_eq!(c.value("title"), Some(&Value::from("changed")));
    }

    #[test]
    fn set_none_removes_bone() {
        let mut skel = article().instance();
        skel.set("teaser", None).unwrap();
        assert!(!skel.contains("teaser"));
        skel.set("teaser", Some(Box::new(StringBone::new("Teaser")))).unwrap();
        assert_eq!(skel.keys().last(), Some("teaser"));
    }

    #[test]
    #[allow(deprecated)]
    fn deprecated_hook_fails_to_build() {
        let result = SkeletonBuilder::new("legacy")
            .post_process_serialized_data(|_, _| {})
            .build();
        match result {
            Err(OssatureError::Definition(message)) => assert!(message.contains("post_saved")),
            other => panic!("unexpected {:?}", other.map(|d| d.kind().to_string())),
        }
    }
}
