use serde_json::{json, Value as Json};
use std::fmt::Write;

use crate::error::Result;
use crate::skeleton::Skeleton;
use crate::skellist::SkelList;

use super::json::{render_structure, render_values};
use super::Renderer;

fn data_type(value: &Json) -> &'static str {
    match value {
        Json::Object(_) => "dict",
        Json::Array(_) => "list",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "numeric",
        Json::String(_) => "string",
        Json::Null => "none",
    }
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Map keys are not always valid element names (e.g. `name.en`, `0`).
fn element_name(key: &str) -> String {
    let mut name: String = key
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if !name.starts_with(|c: char| c.is_alphabetic() || c == '_') {
        name.insert(0, '_');
    }
    name
}

fn write_element(out: &mut String, name: &str, value: &Json, depth: usize) {
    let indent = "\t".repeat(depth);
    let _ = write!(out, "{}<{} ViurDataType=\"{}\"", indent, name, data_type(value));
    match value {
        Json::Object(map) if !map.is_empty() => {
            out.push_str(">\n");
            for (key, child) in map {
                write_element(out, &element_name(key), child, depth + 1);
            }
            let _ = writeln!(out, "{}</{}>", indent, name);
        }
        Json::Array(items) if !items.is_empty() => {
            out.push_str(">\n");
            for child in items {
                write_element(out, "entry", child, depth + 1);
            }
            let _ = writeln!(out, "{}</{}>", indent, name);
        }
        Json::Object(_) | Json::Array(_) | Json::Null => out.push_str("/>\n"),
        Json::String(s) => {
            let _ = writeln!(out, ">{}</{}>", escape(s), name);
        }
        other => {
            let _ = writeln!(out, ">{}</{}>", other, name);
        }
    }
}

/// A `<ViurResult>` document mirroring the JSON value; every element names
/// its type in a `ViurDataType` attribute.
pub fn serialize_xml(data: &Json) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    write_element(&mut out, "ViurResult", data, 0);
    out
}

#[derive(Debug, Default, Clone, Copy)]
pub struct XmlRender;

impl Renderer for XmlRender {
    fn view(&self, skel: &Skeleton, _action: &str) -> Result<String> {
        Ok(serialize_xml(&json!({
            "values": render_values(skel),
            "structure": render_structure(skel),
        })))
    }
    fn list(&self, skellist: &SkelList, _action: &str) -> Result<String> {
        let skels: Vec<Json> = skellist.iter().map(render_values).collect();
        let structure = match skellist.get(0) {
            Some(skel) => render_structure(skel),
            None => Json::Null,
        };
        Ok(serialize_xml(&json!({
            "skellist": skels,
            "structure": structure,
            "cursor": skellist.cursor().map(|c| c.as_str()),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_values_carry_types() {
        let xml = serialize_xml(&json!({"a": [1, "x<y"], "b": null, "c": true}));
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<ViurResult ViurDataType=\"dict\">"));
        assert!(xml.contains("<a ViurDataType=\"list\">"));
        assert!(xml.contains("<entry ViurDataType=\"numeric\">1</entry>"));
        assert!(xml.contains("<entry ViurDataType=\"string\">x&lt;y</entry>"));
        assert!(xml.contains("<b ViurDataType=\"none\"/>"));
        assert!(xml.contains("<c ViurDataType=\"boolean\">true</c>"));
    }

    #[test]
    fn invalid_keys_become_element_names() {
        assert_eq!(element_name("title.en"), "title_en");
        assert_eq!(element_name("0"), "_0");
    }
}
