//! Validated, immutable view of a project.
//!
//! [`ExecutionPlan::build`] turns a loaded [`Project`] into three
//! dependency graphs (apis, scenarios, suites) and rejects it with every
//! configuration problem at once: duplicate names, dangling references,
//! unknown matchers or hooks, parameter collisions and cycles. Nothing is
//! sent over the wire for a project that does not plan.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument};

use crate::error::{ConfigError, PlanError};
use crate::graph::{DependencyGraph, GraphNode};
use crate::model::{ApiDefinition, NodeKind, Project, RunConfig, Scenario, Suite};
use crate::pipeline::CallPipeline;
use crate::validator::DEFAULT_MATCHER;

#[derive(Debug)]
pub struct ExecutionPlan {
    name: String,
    config: RunConfig,
    properties: HashMap<String, String>,
    apis: HashMap<String, ApiDefinition>,
    scenarios: HashMap<String, Scenario>,
    suites: HashMap<String, Suite>,
    api_graph: DependencyGraph,
    scenario_graph: DependencyGraph,
    suite_graph: DependencyGraph,
}

impl ExecutionPlan {
    /// Validate `project` against the names registered on `pipeline`.
    #[instrument(skip_all, fields(project = %project.name))]
    pub fn build(project: Project, pipeline: &CallPipeline) -> Result<Self, PlanError> {
        let mut errors = Vec::new();

        let mut api_graph = DependencyGraph::new(NodeKind::Api);
        let mut apis = HashMap::new();
        for api in project.apis {
            let node = GraphNode::new(&api.name)
                .with_enabled(api.enabled)
                .with_params(api.params.clone());
            match api_graph.add_node(node) {
                Ok(()) => {
                    apis.insert(api.name.clone(), api);
                }
                Err(err) => errors.push(err),
            }
        }

        let mut scenario_graph = DependencyGraph::new(NodeKind::Scenario);
        let mut scenarios = HashMap::new();
        for scenario in project.scenarios {
            let node = GraphNode::new(&scenario.name)
                .with_enabled(scenario.enabled)
                .with_params(scenario.params.clone());
            match scenario_graph.add_node(node) {
                Ok(()) => {
                    scenarios.insert(scenario.name.clone(), scenario);
                }
                Err(err) => errors.push(err),
            }
        }

        let mut suite_graph = DependencyGraph::new(NodeKind::Suite);
        let mut suites = HashMap::new();
        for suite in project.suites {
            let node = GraphNode::new(&suite.name)
                .with_enabled(suite.enabled)
                .with_params(suite.params.clone());
            match suite_graph.add_node(node) {
                Ok(()) => {
                    suites.insert(suite.name.clone(), suite);
                }
                Err(err) => errors.push(err),
            }
        }

        let mut plan = Self {
            name: project.name,
            config: project.config,
            properties: project.properties,
            apis,
            scenarios,
            suites,
            api_graph,
            scenario_graph,
            suite_graph,
        };

        plan.link_edges(&mut errors);
        plan.check_references(&mut errors);
        plan.check_pipeline_names(pipeline, &mut errors);

        for graph in [&plan.api_graph, &plan.scenario_graph, &plan.suite_graph] {
            if let Err(err) = graph.validate_acyclic() {
                errors.push(err);
            }
        }

        plan.check_param_collisions(&mut errors);

        if errors.is_empty() {
            debug!(
                apis = plan.apis.len(),
                scenarios = plan.scenarios.len(),
                suites = plan.suites.len(),
                "execution plan built"
            );
            Ok(plan)
        } else {
            Err(PlanError { errors })
        }
    }

    fn link_edges(&mut self, errors: &mut Vec<ConfigError>) {
        fn link<'a>(
            graph: &mut DependencyGraph,
            edges: impl Iterator<Item = (&'a String, &'a Vec<String>)>,
            errors: &mut Vec<ConfigError>,
        ) {
            let mut edges: Vec<_> = edges.collect();
            edges.sort_by(|a, b| a.0.cmp(b.0));
            for (id, deps) in edges {
                for dep in deps {
                    if let Err(err) = graph.add_edge(id, dep) {
                        errors.push(err);
                    }
                }
            }
        }

        link(
            &mut self.api_graph,
            self.apis.iter().map(|(id, api)| (id, &api.depends_on)),
            errors,
        );
        link(
            &mut self.scenario_graph,
            self.scenarios.iter().map(|(id, s)| (id, &s.depends_on)),
            errors,
        );
        link(
            &mut self.suite_graph,
            self.suites.iter().map(|(id, s)| (id, &s.depends_on)),
            errors,
        );
    }

    /// Cross-kind references: scenario steps name apis, suites name
    /// scenarios.
    fn check_references(&self, errors: &mut Vec<ConfigError>) {
        for scenario in sorted(&self.scenarios) {
            for step in &scenario.steps {
                if !self.apis.contains_key(step.api()) {
                    errors.push(ConfigError::MissingReference {
                        kind: NodeKind::Scenario,
                        from: scenario.name.clone(),
                        target: NodeKind::Api,
                        name: step.api().to_string(),
                    });
                }
            }
        }
        for suite in sorted(&self.suites) {
            for name in &suite.scenarios {
                if !self.scenarios.contains_key(name) {
                    errors.push(ConfigError::MissingReference {
                        kind: NodeKind::Suite,
                        from: suite.name.clone(),
                        target: NodeKind::Scenario,
                        name: name.clone(),
                    });
                }
            }
        }
    }

    fn check_pipeline_names(&self, pipeline: &CallPipeline, errors: &mut Vec<ConfigError>) {
        for api in sorted(&self.apis) {
            let matcher = api.matcher.as_deref().unwrap_or(DEFAULT_MATCHER);
            if !pipeline.has_matcher(matcher) {
                errors.push(ConfigError::UnknownMatcher {
                    api: api.name.clone(),
                    matcher: matcher.to_string(),
                });
            }
            for hook in api.pre_hooks.iter().chain(&api.post_hooks) {
                if !pipeline.has_hook(hook) {
                    errors.push(ConfigError::UnknownHook {
                        api: api.name.clone(),
                        hook: hook.clone(),
                    });
                }
            }
        }
    }

    /// A node's params may not redefine a key its suite or scenario
    /// already seeds.
    fn check_param_collisions(&self, errors: &mut Vec<ConfigError>) {
        let mut seen = HashSet::new();
        let mut report = |error: ConfigError| {
            if seen.insert(error.clone()) {
                errors.push(error);
            }
        };

        for suite in sorted(&self.suites) {
            for scenario_id in self.scenario_closure(&suite.name) {
                let Some(scenario) = self.scenarios.get(scenario_id) else {
                    continue;
                };
                if let Some(error) = collision(
                    (NodeKind::Suite, suite.name.as_str(), suite.params.as_ref()),
                    (NodeKind::Scenario, scenario.name.as_str(), scenario.params.as_ref()),
                ) {
                    report(error);
                }
                for api_id in self.api_closure(scenario_id) {
                    let Some(api) = self.apis.get(api_id) else {
                        continue;
                    };
                    if let Some(error) = collision(
                        (NodeKind::Suite, suite.name.as_str(), suite.params.as_ref()),
                        (NodeKind::Api, api.name.as_str(), api.params.as_ref()),
                    ) {
                        report(error);
                    }
                }
            }
        }

        for scenario in sorted(&self.scenarios) {
            for api_id in self.api_closure(&scenario.name) {
                let Some(api) = self.apis.get(api_id) else {
                    continue;
                };
                if let Some(error) = collision(
                    (NodeKind::Scenario, scenario.name.as_str(), scenario.params.as_ref()),
                    (NodeKind::Api, api.name.as_str(), api.params.as_ref()),
                ) {
                    report(error);
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn api(&self, id: &str) -> Option<&ApiDefinition> {
        self.apis.get(id)
    }

    pub fn scenario(&self, id: &str) -> Option<&Scenario> {
        self.scenarios.get(id)
    }

    pub fn suite(&self, id: &str) -> Option<&Suite> {
        self.suites.get(id)
    }

    pub fn api_graph(&self) -> &DependencyGraph {
        &self.api_graph
    }

    pub fn scenario_graph(&self) -> &DependencyGraph {
        &self.scenario_graph
    }

    pub fn suite_graph(&self) -> &DependencyGraph {
        &self.suite_graph
    }

    /// Suites to run, dependencies first. With `only`, just that suite
    /// and the suites it depends on.
    pub fn suite_order(&self, only: Option<&str>) -> Vec<&str> {
        match only {
            Some(id) => self.suite_graph.topological_order(id),
            None => self.suite_graph.execution_order(),
        }
    }

    /// Every scenario a suite can reach: its listed scenarios and their
    /// dependencies, each after the scenarios it depends on.
    pub fn scenario_closure(&self, suite: &str) -> Vec<&str> {
        let Some(suite) = self.suites.get(suite) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        for scenario in &suite.scenarios {
            for id in self.scenario_graph.topological_order(scenario) {
                if seen.insert(id) {
                    order.push(id);
                }
            }
        }
        order
    }

    /// Every api a scenario calls, including api dependencies, each after
    /// the apis it depends on.
    pub fn api_closure(&self, scenario: &str) -> Vec<&str> {
        let Some(scenario) = self.scenarios.get(scenario) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        for step in &scenario.steps {
            for id in self.api_graph.topological_order(step.api()) {
                if seen.insert(id) {
                    order.push(id);
                }
            }
        }
        order
    }
}

fn sorted<T>(map: &HashMap<String, T>) -> Vec<&T> {
    let mut entries: Vec<(&String, &T)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries.into_iter().map(|(_, value)| value).collect()
}

fn collision(
    outer: (NodeKind, &str, Option<&Map<String, Value>>),
    inner: (NodeKind, &str, Option<&Map<String, Value>>),
) -> Option<ConfigError> {
    let (outer_kind, outer_name, Some(outer_params)) = outer else {
        return None;
    };
    let (kind, node, Some(params)) = inner else {
        return None;
    };
    let keys: Vec<String> = params
        .keys()
        .filter(|key| outer_params.contains_key(*key))
        .cloned()
        .collect();
    (!keys.is_empty()).then(|| ConfigError::ParamCollision {
        kind,
        node: node.to_string(),
        outer_kind,
        outer: outer_name.to_string(),
        keys,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(yaml: &str) -> Result<ExecutionPlan, PlanError> {
        let project = Project::from_yaml(yaml).unwrap();
        ExecutionPlan::build(project, &CallPipeline::http())
    }

    const VALID: &str = r#"
name: shop
apis:
  - name: login
    method: POST
    url: /login
  - name: profile
    method: GET
    url: /me
    depends_on: [login]
scenarios:
  - name: browse
    steps: [profile]
  - name: checkout
    depends_on: [browse]
    steps:
      - api: login
        remove: [password]
suites:
  - name: smoke
    scenarios: [checkout]
"#;

    #[test]
    fn test_valid_project_plans() {
        let plan = build(VALID).unwrap();
        assert_eq!(plan.name(), "shop");
        assert_eq!(plan.scenario_closure("smoke"), vec!["browse", "checkout"]);
        assert_eq!(plan.api_closure("browse"), vec!["login", "profile"]);
        assert_eq!(plan.suite_order(None), vec!["smoke"]);
        assert!(plan.api("login").is_some());
    }

    #[test]
    fn test_all_errors_are_collected() {
        let yaml = r#"
apis:
  - name: a
    method: GET
    url: /a
    matcher: fuzzy
    pre_hooks: [sign]
  - name: a
    method: GET
    url: /a2
scenarios:
  - name: s
    steps: [a, ghost]
suites:
  - name: suite
    scenarios: [s, nope]
"#;
        let err = build(yaml).unwrap_err();
        assert!(err.errors.contains(&ConfigError::DuplicateName {
            kind: NodeKind::Api,
            name: "a".into(),
        }));
        assert!(err.errors.contains(&ConfigError::UnknownMatcher {
            api: "a".into(),
            matcher: "fuzzy".into(),
        }));
        assert!(err.errors.contains(&ConfigError::UnknownHook {
            api: "a".into(),
            hook: "sign".into(),
        }));
        assert!(err.errors.iter().any(|e| matches!(
            e,
            ConfigError::MissingReference { name, target: NodeKind::Api, .. } if name == "ghost"
        )));
        assert!(err.errors.iter().any(|e| matches!(
            e,
            ConfigError::MissingReference { name, target: NodeKind::Scenario, .. } if name == "nope"
        )));
        assert_eq!(err.errors.len(), 5);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let yaml = r#"
scenarios:
  - name: r
    steps: []
    depends_on: [a]
  - name: a
    steps: []
    depends_on: [b]
  - name: b
    steps: []
    depends_on: [a]
"#;
        let err = build(yaml).unwrap_err();
        assert_eq!(err.errors.len(), 1);
        assert!(err.to_string().contains("a -> b -> a"), "{err}");
    }

    #[test]
    fn test_param_collisions_reported_for_every_node() {
        let yaml = r#"
apis:
  - name: create
    method: POST
    url: /users
    params:
      role: admin
scenarios:
  - name: one
    steps: [create]
    params:
      user: alice
  - name: two
    steps: [create]
    params:
      user: bob
      role: guest
suites:
  - name: regression
    params:
      user: root
    scenarios: [one, two]
"#;
        let err = build(yaml).unwrap_err();
        let collisions: Vec<(&str, &str)> = err
            .errors
            .iter()
            .filter_map(|e| match e {
                ConfigError::ParamCollision { node, outer, .. } => {
                    Some((node.as_str(), outer.as_str()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            collisions,
            vec![("one", "regression"), ("two", "regression"), ("create", "two")]
        );
    }

    #[test]
    fn test_suite_filter_includes_dependencies() {
        let yaml = r#"
scenarios:
  - name: s
    steps: []
suites:
  - name: setup
    scenarios: [s]
  - name: main
    depends_on: [setup]
    scenarios: [s]
  - name: other
    scenarios: [s]
"#;
        let plan = build(yaml).unwrap();
        assert_eq!(plan.suite_order(Some("main")), vec!["setup", "main"]);
        assert!(plan.suite_order(Some("missing")).is_empty());
        assert_eq!(plan.suite_order(None).len(), 3);
    }
}
