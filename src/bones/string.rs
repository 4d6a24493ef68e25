use crate::bones::{tokenize, unique_index_value, BoneParams};
use crate::datatype::{Entity, Value};

use super::{serialize_value, Bone};

/// Strips and truncates a client string and escapes characters that are
/// unsafe to echo back into markup.
pub fn escape_string(raw: &str, max_length: usize) -> String {
    let truncated: String = raw.trim().chars().take(max_length).collect();
    let mut escaped = String::with_capacity(truncated.len());
    for c in truncated.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            '(' => escaped.push_str("&#040;"),
            ')' => escaped.push_str("&#041;"),
            '=' => escaped.push_str("&#061;"),
            '\n' | '\0' => {}
            c => escaped.push(c),
        }
    }
    escaped
}

#[derive(Debug, Clone)]
pub struct StringBone {
    params: BoneParams,
    value: Value,
    max_length: usize,
    case_sensitive: bool,
}

impl StringBone {
    pub fn new(descr: &str) -> Self {
        Self {
            params: BoneParams::new(descr),
            value: Value::from(""),
            max_length: 254,
            case_sensitive: true,
        }
    }
    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }
    /// Queries and unique checks compare this bone lowercased.
    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self
    }
    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    fn lowered(value: &Value) -> Value {
        match value {
            Value::Text(s) => Value::Text(s.to_lowercase()),
            Value::List(items) => Value::List(items.iter().map(Self::lowered).collect()),
            Value::Map(m) => Value::Map(m.iter().map(|(k, v)| (k.clone(), Self::lowered(v))).collect()),
            other => other.clone(),
        }
    }
}

impl Bone for StringBone {
    bone_state!("str");

    fn single_empty(&self) -> Value {
        Value::from("")
    }
    fn single_unserialize(&self, value: &Value) -> Value {
        match value {
            Value::Text(_) => value.clone(),
            Value::Null => Value::from(""),
            other => Value::Text(other.to_string()),
        }
    }
    fn single_from_client(&self, raw: &str) -> Result<Value, String> {
        if raw.trim().chars().count() > self.max_length {
            return Err(format!("Maximum length is {}", self.max_length));
        }
        Ok(Value::Text(escape_string(raw, self.max_length)))
    }
    fn single_search_tags(&self, value: &Value) -> Vec<String> {
        value.as_text().map(tokenize).unwrap_or_default()
    }

    fn serialize(&self, name: &str, entity: &mut Entity) {
        serialize_value(self, name, entity);
        if self.case_sensitive || !self.params.indexed {
            return;
        }
        // lowercased shadow properties for case-insensitive filters
        if self.params.languages.is_empty() {
            entity.set(&format!("{}.idx", name), Self::lowered(&self.value), true);
        } else {
            for language in &self.params.languages {
                let value = self
                    .value
                    .as_map()
                    .and_then(|m| m.get(language))
                    .map(Self::lowered)
                    .unwrap_or_default();
                entity.set(&format!("{}.{}.idx", name, language), value, true);
            }
        }
    }

    fn unique_index_value(&self) -> Option<String> {
        if self.case_sensitive {
            unique_index_value(&self.value)
        } else {
            unique_index_value(&Self::lowered(&self.value))
        }
    }

    fn structure(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut structure = super::base_structure(self);
        structure.insert("maxlength".into(), self.max_length.into());
        structure.insert("caseSensitive".into(), self.case_sensitive.into());
        structure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bones::{ClientData, Configure, Severity};

    #[test]
    fn escapes_markup() {
        assert_eq!(escape_string(" <b>hi</b> ", 254), "&lt;b&gt;hi&lt;/b&gt;");
    }

    #[test]
    fn too_long_input_is_invalid_and_keeps_old_value() {
        let mut bone = StringBone::new("Name").max_length(3);
        bone.set_value(Value::from("abc"));
        let errors = bone
            .from_client("name", &ClientData::new().with("name", "abcd"))
            .unwrap_or_default();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].severity, Severity::Invalid);
        assert_eq!(bone.value(), &Value::from("abc"));
    }

    #[test]
    fn case_insensitive_writes_lowercase_shadow() {
        let mut bone = StringBone::new("Name").case_insensitive();
        bone.set_value(Value::from("Alice"));
        let mut entity = Entity::new("person");
        bone.serialize("name", &mut entity);
        assert_eq!(entity.get("name"), Some(&Value::from("Alice")));
        assert_eq!(entity.get("name.idx"), Some(&Value::from("alice")));
    }

    #[test]
    fn multi_language_values_use_language_properties() {
        let mut bone = StringBone::new("Title").languages(&["de", "en"]);
        let data = ClientData::new().with("title.en", "Hello");
        assert!(bone.from_client("title", &data).is_none());
        let mut entity = Entity::new("page");
        bone.serialize("title", &mut entity);
        assert_eq!(entity.get("title.en"), Some(&Value::from("Hello")));
        assert_eq!(entity.get("title.de"), Some(&Value::from("")));
    }
}
