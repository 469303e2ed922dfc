//! Process-wide configuration properties.
//!
//! Properties are consulted last when a variable cannot be found in any
//! context nor in the process environment.

use std::collections::HashMap;
use std::sync::{OnceLock, PoisonError, RwLock};

fn store() -> &'static RwLock<HashMap<String, String>> {
    static PROPERTIES: OnceLock<RwLock<HashMap<String, String>>> =
        OnceLock::new();
    PROPERTIES.get_or_init(|| RwLock::new(HashMap::new()))
}

pub fn set_property(key: impl Into<String>, value: impl Into<String>) {
    store()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(key.into(), value.into());
}

pub fn property(key: &str) -> Option<String> {
    store()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(key)
        .cloned()
}

/// Merge a set of properties, overwriting existing keys.
pub fn load_properties(properties: &HashMap<String, String>) {
    if properties.is_empty() {
        return;
    }
    let mut guard =
        store().write().unwrap_or_else(PoisonError::into_inner);
    for (key, value) in properties {
        guard.insert(key.clone(), value.clone());
    }
}

pub fn remove_property(key: &str) -> Option<String> {
    store()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(key)
}

pub fn clear_properties() {
    store()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_read_property() {
        set_property("props_test_region", "eu-west");
        assert_eq!(
            property("props_test_region").as_deref(),
            Some("eu-west")
        );
        assert_eq!(
            remove_property("props_test_region").as_deref(),
            Some("eu-west")
        );
        assert!(property("props_test_region").is_none());
    }

    #[test]
    fn test_load_properties_overwrites() {
        set_property("props_test_tier", "free");
        let mut incoming = HashMap::new();
        incoming.insert("props_test_tier".to_string(), "paid".to_string());
        load_properties(&incoming);
        assert_eq!(property("props_test_tier").as_deref(), Some("paid"));
        remove_property("props_test_tier");
    }
}
