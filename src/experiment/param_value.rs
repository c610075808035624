//! Param Value - scalar or string run parameter

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A run parameter value.
///
/// Serialized untagged, so `params.json` holds plain JSON scalars.
/// Nested objects and arrays are flattened to their compact JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Explicit null
    Null,
    /// Boolean flag
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point
    Float(f64),
    /// Text, including flattened nested structures
    Text(String),
}

impl ParamValue {
    /// Convert an arbitrary JSON value into a parameter.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match (n.as_i64(), n.as_u64()) {
                (Some(i), _) => Self::Int(i),
                // Beyond `i64` a float would round, text keeps every digit.
                (None, Some(_)) => Self::Text(n.to_string()),
                (None, None) => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::Text(s.clone()),
            nested @ (Value::Array(_) | Value::Object(_)) => Self::Text(nested.to_string()),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("None"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_values_flatten_to_json() {
        let value = ParamValue::from_json(&json!({"depth": 3, "act": "relu"}));
        assert_eq!(value, ParamValue::Text(r#"{"act":"relu","depth":3}"#.to_string()));
    }

    #[test]
    fn test_large_unsigned_stays_exact() {
        let value = ParamValue::from_json(&json!(u64::MAX));
        assert_eq!(value, ParamValue::Text("18446744073709551615".to_string()));
        assert_eq!(value.to_string(), u64::MAX.to_string());
        assert_eq!(ParamValue::from_json(&json!(i64::MAX)), ParamValue::Int(i64::MAX));
    }

    #[test]
    fn test_json_round_trip_keeps_variant() {
        let params = vec![
            ParamValue::Int(3),
            ParamValue::Float(1.0),
            ParamValue::Float(0.1),
            ParamValue::Bool(true),
            ParamValue::Null,
            ParamValue::Text("adam".into()),
        ];
        let encoded = serde_json::to_string(&params).unwrap();
        let decoded: Vec<ParamValue> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_display() {
        assert_eq!(ParamValue::Float(0.1).to_string(), "0.1");
        assert_eq!(ParamValue::Int(32).to_string(), "32");
        assert_eq!(ParamValue::Null.to_string(), "None");
    }
}
