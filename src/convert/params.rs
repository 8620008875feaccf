use std::collections::BTreeMap;

use serde_json::Value;

use crate::metric::Row;

/// Converts a run's config mapping into destination params.
///
/// Nested objects and arrays are rendered as compact JSON so the
/// destination UI shows one stable string per key; scalars keep their
/// natural rendering (strings unquoted).
pub fn convert_config(config: &Row) -> BTreeMap<String, String> {
    config
        .iter()
        .map(|(key, value)| (key.clone(), render_value(value)))
        .collect()
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Object(_) | Value::Array(_) => value.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars_render_naturally() {
        let config = json!({
            "lr": 0.001,
            "epochs": 10,
            "optimizer": "adamw",
            "amp": true,
        });
        let params = convert_config(config.as_object().expect("object"));
        assert_eq!(params["lr"], "0.001");
        assert_eq!(params["epochs"], "10");
        assert_eq!(params["optimizer"], "adamw");
        assert_eq!(params["amp"], "true");
    }

    #[test]
    fn test_nested_objects_become_json() {
        let config = json!({
            "scheduler": {"name": "cosine", "t_max": 100},
            "betas": [0.9, 0.999],
        });
        let params = convert_config(config.as_object().expect("object"));
        assert_eq!(params["scheduler"], r#"{"name":"cosine","t_max":100}"#);
        assert_eq!(params["betas"], "[0.9,0.999]");
    }

    #[test]
    fn test_null_renders_empty() {
        let config = json!({"resume_path": null});
        let params = convert_config(config.as_object().expect("object"));
        assert_eq!(params["resume_path"], "");
    }
}
