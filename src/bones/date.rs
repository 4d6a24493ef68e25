use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::bones::BoneParams;
use crate::datatype::Value;

use super::Bone;

/// Date and time values, stored in UTC.
///
/// `creation_magic` stamps the value when the entity is first written,
/// `update_magic` on every write that marks the entity as changed.
#[derive(Debug, Clone)]
pub struct DateBone {
    params: BoneParams,
    value: Value,
    creation_magic: bool,
    update_magic: bool,
}

impl DateBone {
    pub fn new(descr: &str) -> Self {
        Self {
            params: BoneParams::new(descr),
            value: Value::Null,
            creation_magic: false,
            update_magic: false,
        }
    }
    pub fn creation_magic(mut self) -> Self {
        self.creation_magic = true;
        self.params.read_only = true;
        self
    }
    pub fn update_magic(mut self) -> Self {
        self.update_magic = true;
        self.params.read_only = true;
        self
    }
}

pub fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%d.%m.%Y %H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    for format in ["%d.%m.%Y", "%Y-%m-%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

impl Bone for DateBone {
    bone_state!("date");

    fn single_unserialize(&self, value: &Value) -> Value {
        match value {
            Value::DateTime(_) => value.clone(),
            Value::Text(s) => parse_datetime(s).map(Value::DateTime).unwrap_or_default(),
            _ => Value::Null,
        }
    }
    fn single_from_client(&self, raw: &str) -> Result<Value, String> {
        parse_datetime(raw)
            .map(Value::DateTime)
            .ok_or_else(|| "Invalid value entered".to_string())
    }
    fn single_search_tags(&self, _value: &Value) -> Vec<String> {
        Vec::new()
    }
    fn perform_magic(&mut self, is_add: bool, is_update: bool) {
        if (self.creation_magic && is_add) || (self.update_magic && (is_add || is_update)) {
            self.value = Value::DateTime(Utc::now());
        }
    }

    fn structure(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut structure = super::base_structure(self);
        structure.insert("creationMagic".into(), self.creation_magic.into());
        structure.insert("updateMagic".into(), self.update_magic.into());
        structure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn accepts_common_formats() {
        let dt = parse_datetime("24.12.2023 18:30:00").unwrap();
        assert_eq!((dt.day(), dt.month(), dt.hour()), (24, 12, 18));
        assert!(parse_datetime("2023-12-24").is_some());
        assert!(parse_datetime("2023-12-24T18:30:00+01:00").is_some());
        assert!(parse_datetime("christmas").is_none());
    }

    #[test]
    fn magic_only_stamps_when_due() {
        let mut created = DateBone::new("Created").creation_magic();
        created.perform_magic(false, true);
        assert_eq!(created.value(), &Value::Null);
        created.perform_magic(true, true);
        assert!(created.value().as_datetime().is_some());

        let mut changed = DateBone::new("Changed").update_magic();
        changed.perform_magic(false, false);
        assert_eq!(changed.value(), &Value::Null);
        changed.perform_magic(false, true);
        assert!(changed.value().as_datetime().is_some());
    }
}
