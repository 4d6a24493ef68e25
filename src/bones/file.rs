use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;

use crate::bones::{single_values, BoneParams};
use crate::datatype::Value;

use super::Bone;

lazy_static! {
    static ref DOWNLOAD_KEY: Regex = Regex::new(r"^[A-Za-z0-9_\-./]{1,500}$").unwrap();
}

/// References an uploaded blob by its download key.
///
/// Every non-empty download key is reported as referenced so the blob is
/// kept alive while a skeleton points at it.
#[derive(Debug, Clone)]
pub struct FileBone {
    params: BoneParams,
    value: Value,
}

impl FileBone {
    pub fn new(descr: &str) -> Self {
        Self {
            params: BoneParams::new(descr),
            value: Value::Null,
        }
    }
}

impl Bone for FileBone {
    bone_state!("file");

    fn single_from_client(&self, raw: &str) -> Result<Value, String> {
        let raw = raw.trim();
        if DOWNLOAD_KEY.is_match(raw) {
            Ok(Value::from(raw))
        } else {
            Err("Invalid download key".to_string())
        }
    }
    fn single_search_tags(&self, _value: &Value) -> Vec<String> {
        Vec::new()
    }
    fn referenced_blobs(&self) -> BTreeSet<String> {
        single_values(&self.value)
            .into_iter()
            .filter_map(Value::as_text)
            .filter(|dlkey| !dlkey.is_empty())
            .map(str::to_string)
            .collect()
    }
}
