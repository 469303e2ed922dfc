//! Hierarchical variable scopes.
//!
//! Every executed node owns one [`ScopedContext`]. Lookups fall back to
//! the parent chain, then to the process environment, then to the
//! process-wide [`properties`](crate::properties). Parent links and
//! child registrations are both [`Weak`], so the tree never owns itself.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use tracing::trace;

use crate::properties;

/// Name of the process-wide root context.
pub const GLOBAL_CONTEXT_NAME: &str = "global";

/// A local entry of a context.
#[derive(Debug, Clone)]
pub enum Binding {
    Value(Value),
    /// A live child context registered under its name.
    Scope(Weak<ScopedContext>),
}

/// Result of a lookup: either plain data or a child context that can be
/// navigated further.
#[derive(Debug, Clone)]
pub enum Resolved {
    Value(Value),
    Scope(Arc<ScopedContext>),
}

impl Resolved {
    /// Plain data for this result. Contexts are rendered as a map of
    /// their local bindings.
    pub fn into_value(self) -> Value {
        match self {
            Resolved::Value(value) => value,
            Resolved::Scope(scope) => scope.snapshot(),
        }
    }
}

#[derive(Debug)]
pub struct ScopedContext {
    name: String,
    bindings: Mutex<HashMap<String, Binding>>,
    parent: Option<Weak<ScopedContext>>,
}

impl ScopedContext {
    /// Create a parentless context.
    pub fn root(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            bindings: Mutex::new(HashMap::new()),
            parent: None,
        })
    }

    /// Create a context under `parent` and register it there, so that
    /// `parent.resolve_value(name)` yields the new context.
    pub fn child(name: impl Into<String>, parent: &Arc<ScopedContext>) -> Arc<Self> {
        let child = Arc::new(Self {
            name: name.into(),
            bindings: Mutex::new(HashMap::new()),
            parent: Some(Arc::downgrade(parent)),
        });
        parent.register_child(&child);
        child
    }

    /// Like [`ScopedContext::child`], defaulting to the Global Context.
    pub fn with_parent(
        name: impl Into<String>,
        parent: Option<&Arc<ScopedContext>>,
    ) -> Arc<Self> {
        match parent {
            Some(parent) => Self::child(name, parent),
            None => Self::child(name, &global()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<Arc<ScopedContext>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    fn bindings(&self) -> MutexGuard<'_, HashMap<String, Binding>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_child(&self, child: &Arc<ScopedContext>) {
        self.bindings().insert(
            child.name.clone(),
            Binding::Scope(Arc::downgrade(child)),
        );
    }

    /// Insert or overwrite a local binding.
    pub fn add_value(&self, key: impl Into<String>, value: Value) {
        self.bindings().insert(key.into(), Binding::Value(value));
    }

    /// Bulk [`ScopedContext::add_value`].
    pub fn put_all(&self, values: Option<&Map<String, Value>>) {
        let Some(values) = values else {
            return;
        };
        if values.is_empty() {
            return;
        }
        let mut bindings = self.bindings();
        for (key, value) in values {
            bindings.insert(key.clone(), Binding::Value(value.clone()));
        }
    }

    /// Local binding only, no fallback.
    pub fn get_local(&self, key: &str) -> Option<Resolved> {
        match self.bindings().get(key)? {
            Binding::Value(value) => Some(Resolved::Value(value.clone())),
            Binding::Scope(weak) => weak.upgrade().map(Resolved::Scope),
        }
    }

    pub fn contains_local(&self, key: &str) -> bool {
        self.get_local(key).is_some()
    }

    /// Nearest binding on the ancestor chain, then the environment
    /// variable `key`, then the property `key`.
    pub fn resolve_value(&self, key: &str) -> Option<Resolved> {
        if let Some(found) = self.get_local(key) {
            return Some(found);
        }
        if let Some(parent) = self.parent() {
            return parent.resolve_value(key);
        }
        if let Ok(value) = std::env::var(key) {
            trace!(key, "resolved from environment");
            return Some(Resolved::Value(Value::String(value)));
        }
        if let Some(value) = properties::property(key) {
            trace!(key, "resolved from properties");
            return Some(Resolved::Value(Value::String(value)));
        }
        None
    }

    /// Drop every local binding. The parent link is kept.
    pub fn reset(&self) {
        self.bindings().clear();
    }

    /// Local bindings as a map, live children rendered recursively.
    pub fn snapshot(&self) -> Value {
        let mut entries: Vec<(String, Binding)> = self
            .bindings()
            .iter()
            .map(|(key, binding)| (key.clone(), binding.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut map = Map::new();
        for (key, binding) in entries {
            match binding {
                Binding::Value(value) => {
                    map.insert(key, value);
                }
                Binding::Scope(weak) => {
                    if let Some(scope) = weak.upgrade() {
                        map.insert(key, scope.snapshot());
                    }
                }
            }
        }
        Value::Object(map)
    }

    /// Replace this context's registration in its parent with a snapshot
    /// of its bindings, so the data outlives the context.
    pub fn publish_to_parent(&self) {
        if let Some(parent) = self.parent() {
            parent.add_value(self.name.clone(), self.snapshot());
        }
    }
}

fn global_slot() -> &'static Arc<ScopedContext> {
    static GLOBAL: OnceLock<Arc<ScopedContext>> = OnceLock::new();
    GLOBAL.get_or_init(|| ScopedContext::root(GLOBAL_CONTEXT_NAME))
}

/// The process-wide Global Context, created on first access.
pub fn global() -> Arc<ScopedContext> {
    Arc::clone(global_slot())
}

/// Clear the Global Context between test runs.
pub fn reset_global() {
    global_slot().reset();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn value_of(ctx: &ScopedContext, key: &str) -> Option<Value> {
        ctx.resolve_value(key).map(Resolved::into_value)
    }

    #[test]
    fn test_local_binding_wins() {
        let root = ScopedContext::root("root");
        let child = ScopedContext::child("child", &root);
        root.add_value("k", json!("parent"));
        child.add_value("k", json!("child"));

        assert_eq!(value_of(&child, "k"), Some(json!("child")));
        assert_eq!(value_of(&root, "k"), Some(json!("parent")));
    }

    #[test]
    fn test_falls_back_to_ancestors() {
        let root = ScopedContext::root("root");
        let mid = ScopedContext::child("mid", &root);
        let leaf = ScopedContext::child("leaf", &mid);
        root.add_value("deep", json!(42));

        assert_eq!(value_of(&leaf, "deep"), Some(json!(42)));
    }

    #[test]
    fn test_ancestor_binding_beats_environment() {
        std::env::set_var("CTX_TEST_SHADOWED_VAR", "from-env");
        let root = ScopedContext::root("root");
        let leaf = ScopedContext::child("leaf", &root);
        root.add_value("CTX_TEST_SHADOWED_VAR", json!("from-root"));

        assert_eq!(
            value_of(&leaf, "CTX_TEST_SHADOWED_VAR"),
            Some(json!("from-root"))
        );
    }

    #[test]
    fn test_environment_beats_property() {
        std::env::set_var("CTX_TEST_ENV_OVER_PROP", "env");
        properties::set_property("CTX_TEST_ENV_OVER_PROP", "prop");
        properties::set_property("ctx_test_prop_only", "prop");
        let root = ScopedContext::root("root");

        assert_eq!(
            value_of(&root, "CTX_TEST_ENV_OVER_PROP"),
            Some(json!("env"))
        );
        assert_eq!(value_of(&root, "ctx_test_prop_only"), Some(json!("prop")));
        assert!(root.resolve_value("ctx_test_nothing_here").is_none());
    }

    #[test]
    fn test_child_registers_on_parent() {
        let root = ScopedContext::root("root");
        let child = ScopedContext::child("orders", &root);
        child.add_value("id", json!(7));

        match root.resolve_value("orders") {
            Some(Resolved::Scope(scope)) => {
                assert_eq!(scope.name(), "orders");
                assert_eq!(
                    scope.get_local("id").map(Resolved::into_value),
                    Some(json!(7))
                );
            }
            other => panic!("expected child scope, got {other:?}"),
        }
    }

    #[test]
    fn test_dropped_child_is_not_resolvable() {
        let root = ScopedContext::root("root");
        {
            let _child = ScopedContext::child("gone", &root);
        }
        assert!(root.get_local("gone").is_none());
    }

    #[test]
    fn test_publish_survives_child_drop() {
        let root = ScopedContext::root("root");
        {
            let child = ScopedContext::child("login", &root);
            child.add_value("response", json!({"token": "abc"}));
            child.publish_to_parent();
        }
        assert_eq!(
            value_of(&root, "login"),
            Some(json!({"response": {"token": "abc"}}))
        );
    }

    #[test]
    fn test_reset_keeps_parent() {
        let root = ScopedContext::root("root");
        let child = ScopedContext::child("child", &root);
        root.add_value("inherited", json!(true));
        child.add_value("local", json!(1));

        child.reset();

        assert!(child.get_local("local").is_none());
        assert_eq!(value_of(&child, "inherited"), Some(json!(true)));
    }

    #[test]
    fn test_put_all_ignores_empty() {
        let root = ScopedContext::root("root");
        root.put_all(None);
        root.put_all(Some(&Map::new()));
        assert_eq!(root.snapshot(), json!({}));

        let mut values = Map::new();
        values.insert("a".into(), json!(1));
        values.insert("b".into(), json!([1, 2]));
        root.put_all(Some(&values));
        assert_eq!(root.snapshot(), json!({"a": 1, "b": [1, 2]}));
    }

    #[test]
    fn test_snapshot_renders_live_children() {
        let root = ScopedContext::root("root");
        let child = ScopedContext::child("child", &root);
        child.add_value("x", json!("y"));

        assert_eq!(root.snapshot(), json!({"child": {"x": "y"}}));
    }

    #[test]
    fn test_global_is_shared() {
        let a = global();
        let b = global();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), GLOBAL_CONTEXT_NAME);
    }
}
