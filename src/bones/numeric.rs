use crate::bones::BoneParams;
use crate::datatype::Value;

use super::Bone;

/// Integer (precision 0) or decimal numbers within an optional range.
#[derive(Debug, Clone)]
pub struct NumericBone {
    params: BoneParams,
    value: Value,
    precision: u32,
    min: f64,
    max: f64,
}

impl NumericBone {
    pub fn new(descr: &str) -> Self {
        Self {
            params: BoneParams::new(descr),
            value: Value::Null,
            precision: 0,
            min: i64::MIN as f64,
            max: i64::MAX as f64,
        }
    }
    pub fn precision(mut self, precision: u32) -> Self {
        self.precision = precision;
        self
    }
    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    fn coerce(&self, number: f64) -> Value {
        if self.precision == 0 {
            Value::Int(number.round() as i64)
        } else {
            let factor = 10f64.powi(self.precision as i32);
            Value::Float((number * factor).round() / factor)
        }
    }
}

impl Bone for NumericBone {
    bone_state!("numeric");

    fn single_unserialize(&self, value: &Value) -> Value {
        match value {
            Value::Int(_) | Value::Float(_) => value.as_float().map(|f| self.coerce(f)).unwrap_or_default(),
            Value::Text(s) => s.trim().parse::<f64>().map(|f| self.coerce(f)).unwrap_or_default(),
            _ => Value::Null,
        }
    }
    fn single_from_client(&self, raw: &str) -> Result<Value, String> {
        let number: f64 = raw
            .trim()
            .replace(',', ".")
            .parse()
            .map_err(|_| "Invalid number entered".to_string())?;
        if !number.is_finite() {
            return Err("Invalid number entered".to_string());
        }
        if number < self.min || number > self.max {
            return Err(format!("Value must be between {} and {}", self.min, self.max));
        }
        Ok(self.coerce(number))
    }
    fn single_search_tags(&self, _value: &Value) -> Vec<String> {
        Vec::new()
    }

    fn structure(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut structure = super::base_structure(self);
        structure.insert("precision".into(), self.precision.into());
        structure.insert("min".into(), self.min.into());
        structure.insert("max".into(), self.max.into());
        structure
    }
}
