use crate::bones::{BoneParams, ClientData, ReadFromClientError};
use crate::datatype::{Entity, Value};

use super::Bone;

/// Mirrors the key of the entity a skeleton is bound to.
///
/// The value is the encoded key (empty while unsaved), it is never written
/// as a property and ignores client input.
#[derive(Debug, Clone)]
pub struct IdBone {
    params: BoneParams,
    value: Value,
}

impl IdBone {
    pub fn new() -> Self {
        let mut params = BoneParams::new("Id");
        params.read_only = true;
        params.visible = false;
        Self {
            params,
            value: Value::from(""),
        }
    }
}

impl Default for IdBone {
    fn default() -> Self {
        Self::new()
    }
}

impl Bone for IdBone {
    bone_state!("key");

    fn single_empty(&self) -> Value {
        Value::from("")
    }
    fn single_from_client(&self, raw: &str) -> Result<Value, String> {
        Ok(Value::from(raw))
    }
    fn serialize(&self, _name: &str, _entity: &mut Entity) {}
    fn unserialize(&mut self, _name: &str, entity: &Entity) -> bool {
        self.value = entity
            .key()
            .map(|k| Value::Text(k.encode()))
            .unwrap_or_else(|| Value::from(""));
        true
    }
    fn from_client(&mut self, _name: &str, _data: &ClientData) -> Option<Vec<ReadFromClientError>> {
        None
    }
    fn unique_index_value(&self) -> Option<String> {
        None
    }
}
