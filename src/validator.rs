//! Response checks: status codes, headers and body matchers.

use serde_json::Value;
use std::collections::HashMap;

/// Name of the matcher used when an API does not pick one.
pub const DEFAULT_MATCHER: &str = "partial";

/// A body comparison strategy, selected by name from an API definition.
pub trait Matcher: Send + Sync {
    fn name(&self) -> &str;

    /// Human-readable mismatches, empty when `actual` satisfies
    /// `expected`.
    fn compare(&self, expected: &Value, actual: &Value) -> Vec<String>;
}

/// Deep equality.
#[derive(Debug, Default)]
pub struct ExactMatcher;

impl Matcher for ExactMatcher {
    fn name(&self) -> &str {
        "exact"
    }

    fn compare(&self, expected: &Value, actual: &Value) -> Vec<String> {
        if expected == actual {
            Vec::new()
        } else {
            vec![format!(
                "response body does not match. expected: {expected}, actual: {actual}"
            )]
        }
    }
}

/// `expected` must be contained in `actual`: maps by key, lists
/// element-wise, scalars by equality.
#[derive(Debug, Default)]
pub struct PartialMatcher;

impl Matcher for PartialMatcher {
    fn name(&self) -> &str {
        "partial"
    }

    fn compare(&self, expected: &Value, actual: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        compare_subset(expected, actual, "", &mut errors);
        errors
    }
}

fn compare_subset(
    expected: &Value,
    actual: &Value,
    path: &str,
    errors: &mut Vec<String>,
) {
    let at = if path.is_empty() { "$" } else { path };
    match (expected, actual) {
        (Value::Object(expected), Value::Object(actual)) => {
            for (key, expected_value) in expected {
                let child = join_path(path, key);
                match actual.get(key) {
                    Some(actual_value) => {
                        compare_subset(expected_value, actual_value, &child, errors)
                    }
                    None => errors
                        .push(format!("field '{child}' is missing from the response")),
                }
            }
        }
        (Value::Array(expected), Value::Array(actual)) => {
            if expected.len() > actual.len() {
                errors.push(format!(
                    "list '{at}' is too short. expected at least {}, actual: {}",
                    expected.len(),
                    actual.len()
                ));
                return;
            }
            for (idx, (expected_item, actual_item)) in
                expected.iter().zip(actual).enumerate()
            {
                let child = join_path(path, &idx.to_string());
                compare_subset(expected_item, actual_item, &child, errors);
            }
        }
        (expected, actual) if expected == actual => {}
        (expected, actual) => errors.push(format!(
            "value at '{at}' does not match. expected: {expected}, actual: {actual}"
        )),
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

/// Check a status code against the accepted list. An empty list
/// accepts any 2xx.
pub fn validate_status(status: u16, expected: &[u16]) -> Option<String> {
    let accepted = if expected.is_empty() {
        (200..300).contains(&status)
    } else {
        expected.contains(&status)
    };
    if accepted {
        None
    } else if expected.is_empty() {
        Some(format!("unexpected status code. expected: 2xx, actual: {status}"))
    } else {
        Some(format!(
            "unexpected status code. expected one of {expected:?}, actual: {status}"
        ))
    }
}

/// Compare expected headers, names case-insensitively.
pub fn validate_headers(
    headers: &HashMap<String, String>,
    expectations: &HashMap<String, String>,
) -> Vec<String> {
    let mut errors = Vec::new();

    for (name, expected) in expectations {
        let actual = headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value);
        match actual {
            Some(actual) => {
                if actual != expected {
                    errors.push(format!(
                        "header '{name}' does not match. expected: {expected}, actual: {actual}"
                    ));
                }
            }
            None => {
                errors.push(format!("header '{name}' is missing from the response"));
            }
        }
    }

    errors
}
