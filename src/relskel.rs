//! Relation skeletons hold the extra fields stored on a relation, next to
//! the referenced entity. They validate like a skeleton but are never
//! persisted on their own.

use std::collections::BTreeMap;

use crate::bones::{Bone, ClientData, ReadFromClientError, Severity};
use crate::datatype::{Entity, Value};
use crate::error::{OssatureError, Result};
use crate::skeleton::{validate_bone_name, BoneMap};

pub struct RelSkelBuilder {
    bones: BoneMap,
}

impl RelSkelBuilder {
    pub fn new() -> Self {
        Self { bones: Vec::new() }
    }
    pub fn bone(mut self, name: &str, bone: impl Bone + 'static) -> Self {
        self.bones.push((name.to_string(), Box::new(bone)));
        self
    }
    pub fn build(self) -> Result<RelSkelDefinition> {
        for (i, (name, _)) in self.bones.iter().enumerate() {
            validate_bone_name(name)?;
            if self.bones[..i].iter().any(|(n, _)| n == name) {
                return Err(OssatureError::Definition(format!(
                    "bone '{}' is declared twice",
                    name
                )));
            }
        }
        Ok(RelSkelDefinition { bones: self.bones })
    }
}

impl Default for RelSkelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct RelSkelDefinition {
    bones: BoneMap,
}

impl RelSkelDefinition {
    pub fn instance(&self) -> RelSkel {
        RelSkel {
            bones: self.bones.clone(),
        }
    }
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bones.iter().map(|(n, _)| n.as_str())
    }
    pub fn structure(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.bones
                .iter()
                .map(|(name, bone)| {
                    serde_json::Value::Array(vec![
                        serde_json::Value::String(name.clone()),
                        serde_json::Value::Object(bone.structure()),
                    ])
                })
                .collect(),
        )
    }
}

/// One instance of a relation skeleton, bones in declaration order.
#[derive(Debug, Clone)]
pub struct RelSkel {
    bones: BoneMap,
}

impl RelSkel {
    pub fn get(&self, name: &str) -> Option<&dyn Bone> {
        self.bones.iter().find(|(n, _)| n == name).map(|(_, b)| b.as_ref())
    }
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.get(name).map(|b| b.value())
    }
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.bones.iter().map(|(n, _)| n.as_str())
    }

    /// Reads every bone from client data, returning the errors that make
    /// the input unacceptable. Missing values only count for required bones.
    pub fn from_client(&mut self, data: &ClientData) -> Vec<ReadFromClientError> {
        let mut errors = Vec::new();
        for (name, bone) in self.bones.iter_mut() {
            if bone.params().read_only {
                continue;
            }
            let required = bone.params().required;
            for error in bone.from_client(name, data).unwrap_or_default() {
                if !error.is_missing() || required {
                    errors.push(error);
                }
            }
        }
        errors
    }

    /// Loads the bones from a stored `rel` map.
    pub fn from_value(&mut self, value: &Value) {
        let mut entity = Entity::new("rel");
        if let Some(map) = value.as_map() {
            for (k, v) in map {
                entity.set(k, v.clone(), false);
            }
        }
        for (name, bone) in self.bones.iter_mut() {
            bone.unserialize(name, &entity);
        }
    }

    /// The flattened properties of every bone as one map.
    pub fn to_value(&self) -> Value {
        let mut entity = Entity::new("rel");
        for (name, bone) in &self.bones {
            bone.serialize(name, &mut entity);
        }
        let map: BTreeMap<String, Value> = entity.properties().clone();
        Value::Map(map)
    }
}

/// Missing values of required relation fields reject the whole relation.
pub(crate) fn promote_missing(mut error: ReadFromClientError) -> ReadFromClientError {
    if error.is_missing() {
        error.severity = Severity::Invalid;
        error.message = "Field is required".to_string();
    }
    error
}
