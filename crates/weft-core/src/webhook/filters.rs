//! Pure webhook filter evaluation.
//!
//! Filters sharing a `logic_group` combine with AND; distinct groups
//! combine with OR. Groups whose enabled filters all match pass the
//! payload; a payload passes overall when at least one group passes.
//! Groups with zero enabled filters do not contribute, and a filter set
//! with no contributing groups passes everything.

use std::collections::BTreeMap;

use serde_json::Value;

use weft_db::models::{FilterOperator, WebhookFilter};

use crate::value::resolve_path;

/// Evaluate a webhook's filters against a payload. Deterministic and pure.
pub fn evaluate_filters(filters: &[WebhookFilter], payload: &Value) -> bool {
    let mut groups: BTreeMap<i32, Vec<&WebhookFilter>> = BTreeMap::new();
    for filter in filters.iter().filter(|f| f.enabled) {
        groups.entry(filter.logic_group).or_default().push(filter);
    }

    if groups.is_empty() {
        return true;
    }

    groups
        .values()
        .any(|group| group.iter().all(|f| filter_matches(f, payload)))
}

/// Evaluate one filter predicate.
pub fn filter_matches(filter: &WebhookFilter, payload: &Value) -> bool {
    let resolved = resolve_path(payload, &filter.field_path);

    if filter.operator == FilterOperator::Exists {
        return resolved.is_some_and(|v| !v.is_null());
    }

    let Some(actual) = resolved else {
        // Missing fields only satisfy the negated operators.
        return matches!(
            filter.operator,
            FilterOperator::NotEquals | FilterOperator::NotContains | FilterOperator::NotIn
        );
    };

    let expected = parse_expected(filter.value.as_deref());

    match filter.operator {
        FilterOperator::Equals => loose_eq(actual, &expected),
        FilterOperator::NotEquals => !loose_eq(actual, &expected),
        FilterOperator::Contains => contains(actual, &expected),
        FilterOperator::NotContains => !contains(actual, &expected),
        FilterOperator::In => in_list(actual, &expected),
        FilterOperator::NotIn => !in_list(actual, &expected),
        FilterOperator::Regex => regex_match(actual, &expected),
        FilterOperator::Exists => unreachable!("handled above"),
    }
}

/// Filter values are stored as text; interpret JSON when it parses, fall
/// back to the raw string.
fn parse_expected(value: Option<&str>) -> Value {
    match value {
        None => Value::Null,
        Some(s) => serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_owned())),
    }
}

/// Equality with numeric coercion and string/scalar leniency: the payload
/// `{"count": 3}` matches a filter value of `"3"` or `3`.
fn loose_eq(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    if let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) {
        return a == b;
    }
    match (actual, expected) {
        (Value::String(a), b) | (b, Value::String(a)) if !b.is_string() => {
            a == &scalar_string(b)
        }
        _ => false,
    }
}

fn scalar_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(s) => s.contains(&scalar_string(expected)),
        Value::Array(items) => items.iter().any(|item| loose_eq(item, expected)),
        _ => false,
    }
}

fn in_list(actual: &Value, expected: &Value) -> bool {
    match expected {
        Value::Array(items) => items.iter().any(|item| loose_eq(actual, item)),
        // A scalar filter value degenerates to equality.
        other => loose_eq(actual, other),
    }
}

fn regex_match(actual: &Value, expected: &Value) -> bool {
    let Value::String(pattern) = expected else {
        return false;
    };
    let Ok(re) = regex::Regex::new(pattern) else {
        return false;
    };
    match actual {
        Value::String(s) => re.is_match(s),
        other => re.is_match(&other.to_string()),
    }
}
