//! Source run config → run params, and dual-write detection.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::experiment::ParamValue;

/// Config key a dual-writing run records its destination experiment under.
pub const DUAL_WRITE_EXPERIMENT_KEY: &str = "mlflow_experiment_id";
/// Config key listing the loggers attached to a run.
pub const LOGGERS_KEY: &str = "loggers";
/// Logger name that indicates dual writing.
pub const DUAL_WRITE_LOGGER: &str = "mlflow";

/// Convert a source run config into params.
///
/// Nested objects and arrays become their compact JSON text so the
/// destination shows one param per top-level config key.
#[must_use]
pub fn config_to_params(config: &Map<String, Value>) -> BTreeMap<String, ParamValue> {
    config
        .iter()
        .map(|(key, value)| (key.clone(), ParamValue::from_json(value)))
        .collect()
}

/// Whether a source run is already written to the destination by the
/// training job itself.
#[must_use]
pub fn is_dual_writing(config: &Map<String, Value>) -> bool {
    if config.contains_key(DUAL_WRITE_EXPERIMENT_KEY) {
        return true;
    }
    match config.get(LOGGERS_KEY) {
        Some(Value::Object(loggers)) => loggers.contains_key(DUAL_WRITE_LOGGER),
        Some(Value::Array(loggers)) => loggers
            .iter()
            .any(|logger| logger.as_str() == Some(DUAL_WRITE_LOGGER)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test configs are objects"),
        }
    }

    #[test]
    fn test_config_to_params() {
        let params = config_to_params(&config(json!({
            "lr": 0.1,
            "epochs": 10,
            "optimizer": {"name": "adam", "beta": 0.9},
            "layers": [64, 32],
        })));

        assert_eq!(params["lr"], ParamValue::Float(0.1));
        assert_eq!(params["epochs"], ParamValue::Int(10));
        assert_eq!(
            params["optimizer"],
            ParamValue::Text(r#"{"beta":0.9,"name":"adam"}"#.to_string())
        );
        assert_eq!(params["layers"], ParamValue::Text("[64,32]".to_string()));
    }

    #[test]
    fn test_dual_writing_detection() {
        assert!(is_dual_writing(&config(json!({"mlflow_experiment_id": "42"}))));
        assert!(is_dual_writing(&config(json!({"loggers": {"mlflow": {}}}))));
        assert!(is_dual_writing(&config(json!({"loggers": ["wandb", "mlflow"]}))));
        assert!(!is_dual_writing(&config(json!({"loggers": {"wandb": {}}}))));
        assert!(!is_dual_writing(&config(json!({"lr": 0.1}))));
    }
}
