use crate::bones::{BoneParams, ClientData, ReadFromClientError};
use crate::datatype::Value;

use super::{from_client_value, Bone};

#[derive(Debug, Clone)]
pub struct BooleanBone {
    params: BoneParams,
    value: Value,
}

impl BooleanBone {
    pub fn new(descr: &str) -> Self {
        Self {
            params: BoneParams::new(descr),
            value: Value::Bool(false),
        }
    }
}

impl Bone for BooleanBone {
    bone_state!("bool");

    fn single_empty(&self) -> Value {
        Value::Bool(false)
    }
    fn single_unserialize(&self, value: &Value) -> Value {
        match value {
            Value::Bool(_) => value.clone(),
            Value::Int(i) => Value::Bool(*i != 0),
            Value::Text(s) => Value::Bool(is_truthy(s)),
            _ => Value::Bool(false),
        }
    }
    fn single_from_client(&self, raw: &str) -> Result<Value, String> {
        Ok(Value::Bool(is_truthy(raw)))
    }
    fn single_search_tags(&self, _value: &Value) -> Vec<String> {
        Vec::new()
    }

    // an unchecked checkbox is simply not submitted
    fn from_client(&mut self, name: &str, data: &ClientData) -> Option<Vec<ReadFromClientError>> {
        let errors = from_client_value(self, name, data)?;
        let errors: Vec<_> = errors.into_iter().filter(|e| !e.is_missing()).collect();
        if errors.is_empty() { None } else { Some(errors) }
    }
}

fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
