//! `remove` / `add` operations on a request body.
//!
//! Paths are dot separated. Inside lists a segment must be a numeric
//! index.

use serde_json::{Map, Value};

/// Remove the value addressed by `path`. Returns the removed value; a
/// missing path leaves `target` untouched.
pub fn remove_path(target: &mut Value, path: &str) -> Option<Value> {
    let (parent_path, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (Some(parent), last),
        None => (None, path),
    };

    let parent = match parent_path {
        Some(parent_path) => get_mut(target, parent_path)?,
        None => target,
    };

    match parent {
        Value::Object(map) => map.shift_remove(last),
        Value::Array(items) => {
            let index = last.parse::<usize>().ok()?;
            (index < items.len()).then(|| items.remove(index))
        }
        _ => None,
    }
}

/// Insert `value` at `path`, creating intermediate maps. A numeric
/// segment equal to a list's length appends.
pub fn add_path(target: &mut Value, path: &str, value: Value) {
    let mut current = target;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        let last = segments.peek().is_none();

        if !current.is_object() && !current.is_array() {
            *current = Value::Object(Map::new());
        }

        current = match current {
            Value::Array(items) => {
                let Ok(index) = segment.parse::<usize>() else {
                    return;
                };
                if index > items.len() {
                    return;
                }
                if index == items.len() {
                    items.push(Value::Null);
                }
                &mut items[index]
            }
            Value::Object(map) => {
                map.entry(segment.to_string()).or_insert(Value::Null)
            }
            _ => return,
        };

        if last {
            *current = value;
            return;
        }
    }
}

fn get_mut<'a>(target: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = target;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => {
                items.get_mut(segment.parse::<usize>().ok()?)?
            }
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remove_nested_key() {
        let mut body = json!({"user": {"name": "a", "password": "p"}});
        assert_eq!(remove_path(&mut body, "user.password"), Some(json!("p")));
        assert_eq!(body, json!({"user": {"name": "a"}}));
    }

    #[test]
    fn test_remove_list_element() {
        let mut body = json!({"items": [1, 2, 3]});
        assert_eq!(remove_path(&mut body, "items.1"), Some(json!(2)));
        assert_eq!(body, json!({"items": [1, 3]}));
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let mut body = json!({"a": 1});
        assert_eq!(remove_path(&mut body, "b.c"), None);
        assert_eq!(remove_path(&mut body, "a.c"), None);
        assert_eq!(body, json!({"a": 1}));
    }

    #[test]
    fn test_add_creates_intermediate_maps() {
        let mut body = json!({"user": {"name": "a"}});
        add_path(&mut body, "user.address.city", json!("Oslo"));
        assert_eq!(
            body,
            json!({"user": {"name": "a", "address": {"city": "Oslo"}}})
        );
    }

    #[test]
    fn test_add_overwrites_and_appends() {
        let mut body = json!({"tags": ["a"], "n": 1});
        add_path(&mut body, "n", json!(2));
        add_path(&mut body, "tags.1", json!("b"));
        assert_eq!(body, json!({"tags": ["a", "b"], "n": 2}));
    }

    #[test]
    fn test_add_into_null_body() {
        let mut body = Value::Null;
        add_path(&mut body, "a", json!(true));
        assert_eq!(body, json!({"a": true}));
    }
}
