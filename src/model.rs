//! Project definitions and run results.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// A complete test project: API definitions, the scenarios that chain
/// them, and the suites that group scenarios.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    /// Project name, used in reports.
    #[serde(default)]
    pub name: String,
    /// Runtime settings.
    #[serde(default)]
    pub config: RunConfig,
    /// Process-wide properties, the last fallback of variable lookup.
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub apis: Vec<ApiDefinition>,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
    #[serde(default)]
    pub suites: Vec<Suite>,
}

/// A templated HTTP call.
///
/// Every string inside `url`, `headers`, `query` and `body` may contain
/// `${...}` references that are resolved against the context of the
/// call right before it is sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiDefinition {
    pub name: String,
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Accepted status codes. Empty means any 2xx.
    #[serde(default = "default_expected_status")]
    pub expected_status: Vec<u16>,
    /// Expected response body, compared with `matcher`.
    #[serde(default)]
    pub expected_response: Option<Value>,
    /// Expected response headers (names compared case-insensitively).
    #[serde(default)]
    pub expected_headers: HashMap<String, String>,
    /// Name of the matcher used for `expected_response`.
    #[serde(default)]
    pub matcher: Option<String>,
    /// Middleware names applied before the request is sent.
    #[serde(default)]
    pub pre_hooks: Vec<String>,
    /// Middleware names applied after the response is received.
    #[serde(default)]
    pub post_hooks: Vec<String>,
    /// APIs that must be called (in the same scenario) before this one.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub params: Option<Map<String, Value>>,
}

/// An ordered chain of API calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<ScenarioStep>,
    #[serde(default)]
    pub params: Option<Map<String, Value>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Scenarios of the same suite that must finish before this one.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A reference to an API definition inside a scenario, optionally
/// reshaping the request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScenarioStep {
    Name(String),
    Detailed(StepOverride),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOverride {
    pub api: String,
    /// Dotted paths removed from the resolved request body.
    #[serde(default)]
    pub remove: Vec<String>,
    /// Dotted paths inserted into the resolved request body.
    #[serde(default)]
    pub add: Map<String, Value>,
}

impl ScenarioStep {
    pub fn api(&self) -> &str {
        match self {
            ScenarioStep::Name(name) => name,
            ScenarioStep::Detailed(step) => &step.api,
        }
    }

    pub fn overrides(&self) -> Option<&StepOverride> {
        match self {
            ScenarioStep::Name(_) => None,
            ScenarioStep::Detailed(step) => Some(step),
        }
    }
}

/// A named group of scenarios sharing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suite {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub params: Option<Map<String, Value>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub scenarios: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime settings shared by every node of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Prefix for relative API urls.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Headers added to every request unless the API sets them.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Upper bound of scenarios executing at the same time.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Keep running steps and dependents after a failure.
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            headers: HashMap::new(),
            timeout: default_timeout(),
            max_workers: default_max_workers(),
            continue_on_failure: false,
        }
    }
}

fn default_expected_status() -> Vec<u16> {
    vec![200]
}

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

fn default_max_workers() -> usize {
    4
}

impl Project {
    /// Deserialize a project from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Serialize the project to a YAML string.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Append the definitions of another project file.
    pub fn merge(&mut self, other: Project) {
        if self.name.is_empty() {
            self.name = other.name;
        }
        self.properties.extend(other.properties);
        self.apis.extend(other.apis);
        self.scenarios.extend(other.scenarios);
        self.suites.extend(other.suites);
    }
}

/// The three kinds of graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Api,
    Scenario,
    Suite,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeKind::Api => "api",
            NodeKind::Scenario => "scenario",
            NodeKind::Suite => "suite",
        })
    }
}

/// Execution state of a node. `Passed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Passed,
    Failed,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Passed | NodeStatus::Failed)
    }
}

/// Why a node failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum Failure {
    /// The response did not meet the expectations.
    Assertion(Vec<String>),
    /// No usable response was obtained.
    Transport(String),
    /// The node could not be prepared.
    Configuration(String),
    /// A dependency failed and the node was not executed.
    Dependency(String),
    /// One or more child nodes failed.
    Children(Vec<String>),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Assertion(messages) => {
                write!(f, "assertion failed: {}", messages.join("; "))
            }
            Failure::Transport(message) => {
                write!(f, "transport error: {message}")
            }
            Failure::Configuration(message) => {
                write!(f, "configuration error: {message}")
            }
            Failure::Dependency(id) => {
                write!(f, "dependency '{id}' failed")
            }
            Failure::Children(ids) => {
                write!(f, "failed: {}", ids.join(", "))
            }
        }
    }
}

/// Verdict of one executed node, with its children for scenarios and
/// suites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub id: String,
    pub kind: NodeKind,
    pub status: NodeStatus,
    #[serde(default)]
    pub failure: Option<Failure>,
    /// Literal request sent (api nodes only).
    #[serde(default)]
    pub request: Option<Value>,
    /// Literal response received (api nodes only).
    #[serde(default)]
    pub response: Option<Value>,
    pub duration_ms: u64,
    #[serde(default)]
    pub children: Vec<NodeResult>,
}

impl NodeResult {
    pub fn passed(&self) -> bool {
        self.status == NodeStatus::Passed
    }

    /// Find a descendant (or self) by kind and id.
    pub fn find(&self, kind: NodeKind, id: &str) -> Option<&NodeResult> {
        if self.kind == kind && self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(kind, id))
    }
}

/// Full report of one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub project: String,
    pub suites: Vec<NodeResult>,
    pub passed: usize,
    pub failed: usize,
    pub total_duration_ms: u64,
    pub timestamp: String,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.failed == 0
    }

    pub fn find(&self, kind: NodeKind, id: &str) -> Option<&NodeResult> {
        self.suites.iter().find_map(|suite| suite.find(kind, id))
    }
}
