//! Workload parameter handling.
//!
//! Algorithms ship a default parameter document, and callers may upload an override document at
//! submission time. The two are merged into the `params.json` staged into the workload's input
//! directory.

use serde_json::{Map, Value};

/// Merges caller-supplied parameter overrides into an algorithm's defaults.
///
/// The merge is shallow: a top-level key in `overrides` replaces the same key in `defaults`
/// wholesale, except for the `options` key, whose object members are merged key-wise so a caller
/// can override a single option without restating the rest.
pub fn merge_params(defaults: &Value, overrides: &Value) -> Value {
    let (Value::Object(defaults), Value::Object(overrides)) = (defaults, overrides) else {
        // Non-object documents cannot be merged; the override wins.
        return overrides.clone();
    };

    let mut merged = defaults.clone();
    for (key, value) in overrides {
        match (key.as_str(), merged.get_mut(key), value) {
            ("options", Some(Value::Object(merged_options)), Value::Object(options)) => {
                for (option, value) in options {
                    merged_options.insert(option.clone(), value.clone());
                }
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(merged)
}

/// Returns an empty parameter document.
pub fn empty_params() -> Value {
    Value::Object(Map::new())
}

#[cfg(test)]
mod tests {
    use super::{empty_params, merge_params};
    use serde_json::json;

    #[test]
    fn top_level_keys_replace() {
        let merged = merge_params(
            &json!({"algorithm": "rf", "epochs": 10}),
            &json!({"epochs": 50, "seed": 7}),
        );
        assert_eq!(merged, json!({"algorithm": "rf", "epochs": 50, "seed": 7}));
    }

    #[test]
    fn options_merge_keywise() {
        let merged = merge_params(
            &json!({"options": {"depth": 3, "trees": 100}, "epochs": 10}),
            &json!({"options": {"depth": 8}}),
        );
        assert_eq!(
            merged,
            json!({"options": {"depth": 8, "trees": 100}, "epochs": 10})
        );
    }

    #[test]
    fn options_replace_when_defaults_have_none() {
        let merged = merge_params(&json!({"epochs": 10}), &json!({"options": {"depth": 8}}));
        assert_eq!(merged, json!({"epochs": 10, "options": {"depth": 8}}));
    }

    #[test]
    fn non_object_override_wins() {
        let merged = merge_params(&json!({"epochs": 10}), &json!([1, 2, 3]));
        assert_eq!(merged, json!([1, 2, 3]));
    }

    #[test]
    fn empty_overrides_leave_defaults() {
        let defaults = json!({"options": {"depth": 3}});
        assert_eq!(merge_params(&defaults, &empty_params()), defaults);
    }
}
