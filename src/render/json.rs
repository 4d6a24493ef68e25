use serde_json::{json, Map, Value as Json};

use crate::error::Result;
use crate::skeleton::Skeleton;
use crate::skellist::SkelList;

use super::Renderer;

/// Ordered `[name, structure]` pairs describing every bone.
pub fn render_structure(skel: &Skeleton) -> Json {
    Json::Array(
        skel.items()
            .map(|(name, bone)| json!([name, Json::Object(bone.structure())]))
            .collect(),
    )
}

pub fn render_values(skel: &Skeleton) -> Json {
    let values: Map<String, Json> = skel
        .items()
        .map(|(name, bone)| (name.to_string(), bone.value().to_json()))
        .collect();
    Json::Object(values)
}

pub fn render_errors(skel: &Skeleton) -> Json {
    Json::Array(
        skel.errors()
            .iter()
            .map(|e| {
                json!({
                    "severity": e.severity as u8,
                    "fieldPath": e.field_path,
                    "errorMessage": e.message,
                    "invalidatedFields": e.invalidated_fields,
                })
            })
            .collect(),
    )
}

pub fn entry(skel: &Skeleton, action: &str) -> Json {
    json!({
        "values": render_values(skel),
        "structure": render_structure(skel),
        "errors": render_errors(skel),
        "action": action,
        "params": Json::Null,
    })
}

pub fn list(skellist: &SkelList, action: &str) -> Json {
    let skels: Vec<Json> = skellist.iter().map(render_values).collect();
    let structure = if skellist.is_empty() {
        Json::Null
    } else {
        render_structure(&skellist.definition().instance())
    };
    json!({
        "skellist": skels,
        "structure": structure,
        "cursor": skellist.cursor().map(|c| c.as_str()),
        "action": action,
        "params": Json::Null,
    })
}

pub fn render_entry(skel: &Skeleton, action: &str) -> Result<String> {
    Ok(serde_json::to_string(&entry(skel, action))?)
}

pub fn render_list(skellist: &SkelList, action: &str) -> Result<String> {
    Ok(serde_json::to_string(&list(skellist, action))?)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRender;

impl Renderer for JsonRender {
    fn view(&self, skel: &Skeleton, action: &str) -> Result<String> {
        render_entry(skel, action)
    }
    fn list(&self, skellist: &SkelList, action: &str) -> Result<String> {
        render_list(skellist, action)
    }
}
