//! Path resolution and coercions over `serde_json::Value`.
//!
//! Dynamic payloads (trigger bodies, node outputs, filter targets) are
//! parsed once at the boundary and traversed with the resolver here.
//! Paths use dotted segments with optional array indexes: `a.b[0].c`.
//! A leading `$.` (JSONPath child form) is accepted and stripped.

use serde_json::Value;

/// Resolve a dotted path against a JSON value.
///
/// Returns `None` when any segment is missing. A bare `$` (or empty path)
/// resolves to the root.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix("$.").unwrap_or(path);
    let path = if path == "$" { "" } else { path };

    let mut current = root;
    if path.is_empty() {
        return Some(current);
    }

    for segment in path.split('.') {
        let (name, indexes) = split_indexes(segment)?;

        if !name.is_empty() {
            current = match current {
                Value::Object(map) => map.get(name)?,
                // Numeric segments index into arrays: `items.0` == `items[0]`.
                Value::Array(items) => items.get(name.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        for idx in indexes {
            current = match current {
                Value::Array(items) => items.get(idx)?,
                _ => return None,
            };
        }
    }

    Some(current)
}

/// Split a path segment into its name and trailing `[n]` indexes.
fn split_indexes(segment: &str) -> Option<(&str, Vec<usize>)> {
    let Some(bracket) = segment.find('[') else {
        return Some((segment, Vec::new()));
    };

    let (name, mut rest) = segment.split_at(bracket);
    let mut indexes = Vec::new();
    while let Some(stripped) = rest.strip_prefix('[') {
        let close = stripped.find(']')?;
        indexes.push(stripped[..close].parse().ok()?);
        rest = &stripped[close + 1..];
    }
    if !rest.is_empty() {
        return None;
    }
    Some((name, indexes))
}

/// Coerce a value to the string used in `${...}` interpolation.
///
/// Missing keys resolve to `Null`, which renders as the empty string per
/// the context contract; strings render without quotes.
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Truthiness used by conditions and break expressions when a non-boolean
/// value appears in boolean position.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "user": {"name": "ada", "tags": ["admin", "ops"]},
            "items": [{"sku": "a-1"}, {"sku": "b-2"}],
            "count": 3
        })
    }

    #[test]
    fn resolves_nested_object() {
        let v = sample();
        assert_eq!(resolve_path(&v, "user.name"), Some(&json!("ada")));
    }

    #[test]
    fn resolves_array_index() {
        let v = sample();
        assert_eq!(resolve_path(&v, "items[1].sku"), Some(&json!("b-2")));
        assert_eq!(resolve_path(&v, "user.tags[0]"), Some(&json!("admin")));
    }

    #[test]
    fn resolves_numeric_segment_as_index() {
        let v = sample();
        assert_eq!(resolve_path(&v, "items.0.sku"), Some(&json!("a-1")));
    }

    #[test]
    fn accepts_jsonpath_prefix() {
        let v = sample();
        assert_eq!(resolve_path(&v, "$.user.name"), Some(&json!("ada")));
        assert_eq!(resolve_path(&v, "$"), Some(&v));
    }

    #[test]
    fn missing_segments_return_none() {
        let v = sample();
        assert_eq!(resolve_path(&v, "user.missing"), None);
        assert_eq!(resolve_path(&v, "items[9].sku"), None);
        assert_eq!(resolve_path(&v, "count.inner"), None);
    }

    #[test]
    fn malformed_brackets_return_none() {
        let v = sample();
        assert_eq!(resolve_path(&v, "items[x]"), None);
        assert_eq!(resolve_path(&v, "items[0"), None);
    }

    #[test]
    fn display_strings() {
        assert_eq!(to_display_string(&Value::Null), "");
        assert_eq!(to_display_string(&json!("hi")), "hi");
        assert_eq!(to_display_string(&json!(42)), "42");
        assert_eq!(to_display_string(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1.5)));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!({"a": 1})));
    }
}
