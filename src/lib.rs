//! Chained API testing.
//!
//! API definitions are grouped into scenarios and suites that form
//! dependency graphs. Each executed node gets a scoped variable context;
//! `${...}` expressions in urls, headers, queries and bodies are resolved
//! against it, so a call can use the responses of the calls it depends
//! on.

pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod model;
pub mod pipeline;
pub mod plan;
pub mod properties;
pub mod resolver;
pub mod runner;
pub mod shaping;
pub mod validator;

pub use config::*;
pub use context::{global, reset_global, Resolved, ScopedContext};
pub use error::*;
pub use graph::{DependencyGraph, GraphNode};
pub use model::*;
pub use pipeline::{
    CallOptions, CallOutcome, CallPipeline, CallResponse, CancelToken, HttpTransport, Middleware,
    ResolvedRequest, Transport,
};
pub use plan::ExecutionPlan;
pub use runner::*;
pub use validator::{Matcher, DEFAULT_MATCHER};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_project_serialization() {
        let yaml = r#"
name: roundtrip
apis:
  - name: create
    method: POST
    url: /users
    body:
      name: ${name}
    expected_status: [201]
scenarios:
  - name: signup
    steps:
      - create
      - api: create
        remove: [name]
suites:
  - name: all
    scenarios: [signup]
"#;
        let project = Project::from_yaml(yaml).unwrap();
        let again = Project::from_yaml(&project.to_yaml().unwrap()).unwrap();

        assert_eq!(again.name, "roundtrip");
        assert_eq!(again.apis[0].method, HttpMethod::Post);
        assert_eq!(again.apis[0].body, Some(json!({"name": "${name}"})));
        assert_eq!(again.scenarios[0].steps.len(), 2);
        assert_eq!(again.scenarios[0].steps[1].api(), "create");
        assert!(again.scenarios[0].steps[1].overrides().is_some());
    }

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
