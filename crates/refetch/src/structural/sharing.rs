use std::collections::BTreeMap;
use std::sync::Arc;

use crate::value::Value;

/// Rebuilds `incoming` reusing every subtree of `previous` that is deeply
/// equal to its counterpart, preserving instance identity for consumers that
/// compare by identity.
///
/// Returns `previous` itself when the two trees are deeply equal, so a
/// payload that was deserialized fresh but did not change collapses back to
/// the instance consumers already hold.
pub fn reuse_instances(previous: &Value, incoming: &Value) -> Value {
    if Value::same_instance(previous, incoming) {
        return previous.clone();
    }
    match (previous, incoming) {
        (Value::Array(previous_items), Value::Array(incoming_items)) => {
            let mut all_reused = previous_items.len() == incoming_items.len();
            let rebuilt: Vec<Value> = incoming_items
                .iter()
                .enumerate()
                .map(|(index, item)| match previous_items.get(index) {
                    Some(cached) => {
                        let chosen = reuse_instances(cached, item);
                        if !Value::same_instance(&chosen, cached) {
                            all_reused = false;
                        }
                        chosen
                    }
                    None => {
                        all_reused = false;
                        item.clone()
                    }
                })
                .collect();
            if all_reused {
                previous.clone()
            } else {
                Value::Array(rebuilt.into())
            }
        }
        (Value::Object(previous_fields), Value::Object(incoming_fields)) => {
            let mut all_reused = true;
            let mut rebuilt = BTreeMap::new();
            for (key, item) in incoming_fields.iter() {
                let chosen = match previous_fields.get(key) {
                    Some(cached) => {
                        let chosen = reuse_instances(cached, item);
                        if !Value::same_instance(&chosen, cached) {
                            all_reused = false;
                        }
                        chosen
                    }
                    None => {
                        all_reused = false;
                        item.clone()
                    }
                };
                rebuilt.insert(key.clone(), chosen);
            }
            // A key owned by `previous` but absent from `incoming` means the
            // shapes differ, even though every incoming key was reused.
            if previous_fields
                .keys()
                .any(|key| !incoming_fields.contains_key(key))
            {
                all_reused = false;
            }
            if all_reused {
                previous.clone()
            } else {
                Value::Object(Arc::new(rebuilt))
            }
        }
        _ => incoming.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_reuse_identical_instance() {
        let a = Value::from(json!({"x": 1, "y": 2}));
        assert!(Value::same_instance(&reuse_instances(&a, &a.clone()), &a));
    }

    #[test]
    fn test_reuse_deep_equal_tree() {
        let a = Value::from(json!({"x": 1, "y": 2}));
        let b = Value::from(json!({"x": 1, "y": 2}));
        assert!(!Value::same_instance(&a, &b));
        assert!(Value::same_instance(&reuse_instances(&a, &b), &a));
    }

    #[test]
    fn test_reuse_unchanged_subtree() {
        let c = Value::from(json!({"z": {"x": 1, "y": 2}}));
        let d = Value::from(json!({"z": {"x": 1, "y": 2}}));
        let merged = reuse_instances(&c, &d);
        assert!(Value::same_instance(
            merged.get("z").unwrap(),
            c.get("z").unwrap()
        ));
        assert!(!Value::same_instance(
            merged.get("z").unwrap(),
            d.get("z").unwrap()
        ));

        let e = Value::from(json!({"z": {"x": 6, "y": 7}}));
        let merged = reuse_instances(&c, &e);
        assert_ne!(merged.get("z").unwrap(), c.get("z").unwrap());
        assert_eq!(merged.get("z").unwrap(), e.get("z").unwrap());
    }

    #[test]
    fn test_reuse_arrays_elementwise() {
        let previous = Value::from(json!([{"a": 1}, {"b": 2}]));
        let incoming = Value::from(json!([{"a": 1}, {"b": 3}]));
        let merged = reuse_instances(&previous, &incoming);
        let merged_items = merged.as_array().unwrap();
        let previous_items = previous.as_array().unwrap();
        assert!(Value::same_instance(&merged_items[0], &previous_items[0]));
        assert_eq!(merged_items[1], Value::from(json!({"b": 3})));
        assert!(!Value::same_instance(&merged, &previous));
    }

    #[test]
    fn test_removed_key_forces_reconstruction() {
        let previous = Value::from(json!({"a": 1, "b": 2}));
        let incoming = Value::from(json!({"a": 1}));
        let merged = reuse_instances(&previous, &incoming);
        assert!(!Value::same_instance(&merged, &previous));
        assert_eq!(merged, incoming);
    }

    #[test]
    fn test_length_change_forces_reconstruction() {
        let previous = Value::from(json!([1, 2, 3]));
        let incoming = Value::from(json!([1, 2]));
        let merged = reuse_instances(&previous, &incoming);
        assert!(!Value::same_instance(&merged, &previous));
        assert_eq!(merged, incoming);
    }

    #[test]
    fn test_scalars_pass_through() {
        let merged = reuse_instances(&Value::from(1.0), &Value::from("one"));
        assert_eq!(merged, Value::from("one"));
    }
}
