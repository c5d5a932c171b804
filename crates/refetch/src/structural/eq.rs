use crate::value::Value;

/// Deep structural equality.
///
/// Arrays are order- and length-sensitive. Mappings are compared over the
/// union of both sides' keys, with an absent key reading as [`Value::Null`],
/// so a key holding `Null` is equal to a missing key. Numbers follow `f64`
/// equality, meaning `NaN` is unequal to itself.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    if Value::same_instance(a, b) {
        return true;
    }
    match (a, b) {
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(a, b)| deep_equal(a, b))
        }
        (Value::Object(a), Value::Object(b)) => a.keys().chain(b.keys()).all(|key| {
            let left = a.get(key).unwrap_or(&Value::Null);
            let right = b.get(key).unwrap_or(&Value::Null);
            deep_equal(left, right)
        }),
        _ => false,
    }
}

/// Deep equality restricted to the shape of `pattern`.
///
/// Only keys present in `pattern` are checked against `value`; for arrays,
/// elements are compared index-by-index up to `pattern`'s length, so the
/// pattern matches a prefix of `value`. Positions missing from `value` read
/// as [`Value::Null`].
///
/// This is what [`invalidate_partial`](crate::Query::invalidate_partial)
/// matches entries with.
pub fn partial_deep_equal(pattern: &Value, value: &Value) -> bool {
    if Value::same_instance(pattern, value) {
        return true;
    }
    match (pattern, value) {
        (Value::Array(pattern), Value::Array(value)) => {
            pattern.iter().enumerate().all(|(index, expected)| {
                let actual = value.get(index).unwrap_or(&Value::Null);
                partial_deep_equal(expected, actual)
            })
        }
        (Value::Object(pattern), Value::Object(value)) => {
            pattern.iter().all(|(key, expected)| {
                let actual = value.get(key).unwrap_or(&Value::Null);
                partial_deep_equal(expected, actual)
            })
        }
        _ => false,
    }
}
