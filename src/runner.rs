//! Execution orchestrator.
//!
//! Suites run one after another in dependency order. Inside a suite the
//! root scenarios are spawned onto a [`JoinSet`] bounded by a semaphore
//! of `max_workers` permits; each root walks its dependency chain
//! sequentially. Inside a scenario the steps run in order, each api after
//! its own dependencies.
//!
//! Every scenario and api executes at most once per run. Its slot holds
//! the state (`Pending -> Running -> Passed | Failed`) and, once settled,
//! the verdict and published bindings that later references reuse, from
//! any suite or scenario.
//!
//! Every executed node gets its own [`ScopedContext`], registered on the
//! context of the node that runs it. When a node finishes, its bindings
//! are published to the parent so later nodes can reference
//! `${node.request}` / `${node.response}`.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::context::{self, ScopedContext};
use crate::model::{
    ApiDefinition, Failure, NodeKind, NodeResult, NodeStatus, RunReport, Scenario, StepOverride,
    Suite,
};
use crate::pipeline::{CallOptions, CallPipeline, CancelToken, Expectations, ResolvedRequest};
use crate::plan::ExecutionPlan;
use crate::{properties, resolver, shaping};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs a validated plan.
#[async_trait]
pub trait PlanRunner: Send + Sync {
    /// Execute every enabled suite of `plan`. Never fails: problems are
    /// reported per node.
    async fn run(&self, plan: Arc<ExecutionPlan>) -> RunReport;
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    pipeline: Arc<CallPipeline>,
    global: Arc<ScopedContext>,
    cancel: CancelToken,
    suite_filter: Option<String>,
}

impl Orchestrator {
    /// Orchestrator writing into the process-wide Global Context.
    pub fn new(pipeline: Arc<CallPipeline>) -> Self {
        Self {
            pipeline,
            global: context::global(),
            cancel: CancelToken::new(),
            suite_filter: None,
        }
    }

    /// Use `global` as the root of every context created by the run.
    pub fn with_global(mut self, global: Arc<ScopedContext>) -> Self {
        self.global = global;
        self
    }

    /// Run only `suite` and the suites it depends on.
    pub fn with_suite_filter(mut self, suite: Option<String>) -> Self {
        self.suite_filter = suite;
        self
    }

    /// Token cancelling every in-flight and future call of this
    /// orchestrator.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn global(&self) -> &Arc<ScopedContext> {
        &self.global
    }

    async fn run_suite(&self, state: &Arc<RunState>, suite: &Suite) -> NodeResult {
        let started = Instant::now();
        info!("Starting suite: {}", suite.name);

        let ctx = ScopedContext::child(&suite.name, &self.global);
        ctx.put_all(suite.params.as_ref());

        let closure: Vec<String> = state
            .plan
            .scenario_closure(&suite.name)
            .into_iter()
            .map(str::to_string)
            .collect();

        let workers = state.plan.config().max_workers.max(1);
        let permits = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();

        for root in suite_roots(&state.plan, suite, &closure) {
            let state = Arc::clone(state);
            let ctx = Arc::clone(&ctx);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                state.scenario_result(&ctx, &root).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!("scenario task aborted: {}", err);
            }
        }

        let children: Vec<NodeResult> = closure
            .iter()
            .filter_map(|id| state.settled(&state.scenarios, id))
            .collect();

        ctx.publish_to_parent();

        let result = finish(&suite.name, NodeKind::Suite, started, None, children);
        info!(
            "Suite finished: {} ({} ms) - Success: {}",
            suite.name,
            result.duration_ms,
            result.passed()
        );
        result
    }

    /// Result for a suite that was not executed because `dependency`
    /// failed. Scenarios another suite already ran keep their verdict,
    /// the rest fail the same way as the suite.
    fn blocked_suite(&self, state: &RunState, suite: &Suite, dependency: &str) -> NodeResult {
        warn!("Skipping suite {}: dependency {} failed", suite.name, dependency);
        let children = state
            .plan
            .scenario_closure(&suite.name)
            .into_iter()
            .filter(|id| state.plan.scenario(id).is_some_and(|s| s.enabled))
            .map(|id| {
                state
                    .settled(&state.scenarios, id)
                    .unwrap_or_else(|| blocked(id, NodeKind::Scenario, dependency))
            })
            .collect();
        let mut result = blocked(&suite.name, NodeKind::Suite, dependency);
        result.children = children;
        result
    }
}

#[async_trait]
impl PlanRunner for Orchestrator {
    #[instrument(skip(self, plan), fields(project = %plan.name()))]
    async fn run(&self, plan: Arc<ExecutionPlan>) -> RunReport {
        let started = Instant::now();
        properties::load_properties(plan.properties());

        let state = Arc::new(RunState {
            plan: Arc::clone(&plan),
            pipeline: Arc::clone(&self.pipeline),
            cancel: self.cancel.clone(),
            apis: Mutex::new(HashMap::new()),
            scenarios: Mutex::new(HashMap::new()),
        });

        let continue_on_failure = plan.config().continue_on_failure;
        let mut verdicts: HashMap<String, bool> = HashMap::new();
        let mut suites = Vec::new();

        for id in plan.suite_order(self.suite_filter.as_deref()) {
            let Some(suite) = plan.suite(id) else {
                continue;
            };
            if !suite.enabled {
                info!("Skipping disabled suite: {}", id);
                continue;
            }

            let failed_dependency = suite
                .depends_on
                .iter()
                .find(|dep| verdicts.get(dep.as_str()) == Some(&false));

            let result = match failed_dependency {
                Some(dep) if !continue_on_failure => self.blocked_suite(&state, suite, dep),
                _ => self.run_suite(&state, suite).await,
            };
            verdicts.insert(id.to_string(), result.passed());
            suites.push(result);
        }

        // a scenario listed by several suites counts once, last verdict wins
        let scenarios: BTreeMap<&str, bool> = suites
            .iter()
            .flat_map(|suite| &suite.children)
            .map(|scenario| (scenario.id.as_str(), scenario.passed()))
            .collect();
        let passed = scenarios.values().filter(|passed| **passed).count();
        let failed = scenarios.len() - passed;

        RunReport {
            project: plan.name().to_string(),
            suites,
            passed,
            failed,
            total_duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Where a suite starts: the scenario graph roots it reaches, then the
/// listed scenarios only depended on from outside the suite.
fn suite_roots(plan: &ExecutionPlan, suite: &Suite, closure: &[String]) -> Vec<String> {
    let graph = plan.scenario_graph();
    let mut roots: Vec<String> = graph
        .roots()
        .into_iter()
        .filter(|node| closure.contains(&node.id))
        .map(|node| node.id.clone())
        .collect();

    for id in &suite.scenarios {
        let Some(node) = graph.node(id) else {
            continue;
        };
        let depended_within = node.parents.iter().any(|parent| closure.contains(parent));
        if !depended_within && !roots.contains(id) {
            roots.push(id.clone());
        }
    }
    roots
}

/// A node that finished: its verdict and, when it actually ran, the
/// bindings it published to its parent.
#[derive(Debug, Clone)]
struct Executed {
    result: NodeResult,
    published: Option<Value>,
}

/// Run-wide record of one node.
#[derive(Debug, Default)]
struct NodeSlot {
    status: Mutex<NodeStatus>,
    /// `None` once settled means the node is disabled.
    outcome: OnceCell<Option<Executed>>,
}

impl NodeSlot {
    fn status(&self) -> NodeStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: NodeStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Outcome of the node. `execute` only runs for the first caller,
    /// everybody else awaits or reuses its outcome.
    async fn settle<F>(&self, execute: F) -> Option<Executed>
    where
        F: Future<Output = Option<Executed>>,
    {
        self.outcome
            .get_or_init(|| async move {
                self.set_status(NodeStatus::Running);
                let outcome = execute.await;
                // disabled nodes never leave `Pending`
                self.set_status(
                    outcome
                        .as_ref()
                        .map_or(NodeStatus::Pending, |done| done.result.status),
                );
                outcome
            })
            .await
            .clone()
    }

    fn verdict(&self) -> Option<bool> {
        self.outcome
            .get()
            .and_then(Option::as_ref)
            .map(|done| done.result.passed())
    }
}

type Slots = Mutex<HashMap<String, Arc<NodeSlot>>>;

/// Shared state of one orchestrator run.
struct RunState {
    plan: Arc<ExecutionPlan>,
    pipeline: Arc<CallPipeline>,
    cancel: CancelToken,
    apis: Slots,
    scenarios: Slots,
}

impl RunState {
    fn slot(slots: &Slots, id: &str) -> Arc<NodeSlot> {
        let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(id.to_string()).or_default())
    }

    /// Result of `id` if it already ran in this run.
    fn settled(&self, slots: &Slots, id: &str) -> Option<NodeResult> {
        let slot = slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()?;
        slot.outcome.get().cloned().flatten().map(|done| done.result)
    }

    fn continue_on_failure(&self) -> bool {
        self.plan.config().continue_on_failure
    }

    /// Verdict of scenario `id`, executing it on first request. Its
    /// published bindings are made visible in `suite_ctx` either way.
    fn scenario_result<'a>(
        self: &'a Arc<Self>,
        suite_ctx: &'a Arc<ScopedContext>,
        id: &'a str,
    ) -> BoxFuture<'a, Option<NodeResult>> {
        Box::pin(async move {
            let slot = Self::slot(&self.scenarios, id);
            if slot.status().is_terminal() {
                debug!("Reusing result of scenario {}", id);
            }
            let done = slot.settle(self.execute_scenario(suite_ctx, id)).await?;
            adopt(suite_ctx, id, done.published.as_ref());
            Some(done.result)
        })
    }

    async fn execute_scenario(
        self: &Arc<Self>,
        suite_ctx: &Arc<ScopedContext>,
        id: &str,
    ) -> Option<Executed> {
        let scenario = self.plan.scenario(id)?;
        if !scenario.enabled {
            info!("Skipping disabled scenario: {}", id);
            return None;
        }

        let started = Instant::now();
        for dep in &scenario.depends_on {
            let Some(result) = self.scenario_result(suite_ctx, dep).await else {
                continue;
            };
            if !result.passed() && !self.continue_on_failure() {
                warn!("Skipping scenario {}: dependency {} failed", id, dep);
                return Some(Executed {
                    result: blocked(id, NodeKind::Scenario, dep),
                    published: None,
                });
            }
        }

        info!("Starting scenario: {}", id);
        let ctx = ScopedContext::child(id, suite_ctx);
        ctx.put_all(scenario.params.as_ref());

        let children = self.execute_steps(&ctx, scenario).await;
        ctx.publish_to_parent();

        let result = finish(id, NodeKind::Scenario, started, None, children);
        info!(
            "Scenario finished: {} ({} ms) - Success: {}",
            id,
            result.duration_ms,
            result.passed()
        );
        Some(Executed {
            result,
            published: Some(ctx.snapshot()),
        })
    }

    async fn execute_steps(&self, ctx: &Arc<ScopedContext>, scenario: &Scenario) -> Vec<NodeResult> {
        // apis already reported by this scenario
        let mut seen = HashSet::new();
        let mut results = Vec::new();

        for (idx, step) in scenario.steps.iter().enumerate() {
            debug!(
                "Running step {}/{}: {}",
                idx + 1,
                scenario.steps.len(),
                step.api()
            );

            let order = self.plan.api_graph().topological_order(step.api());
            let Some((target, dependencies)) = order.split_last() else {
                continue;
            };

            for dep in dependencies {
                if !seen.insert(*dep) {
                    continue;
                }
                if let Some(result) = self.api_result(ctx, dep, None).await {
                    results.push(result);
                }
            }

            if !seen.insert(*target) {
                debug!("Api {} already ran in scenario {}", target, scenario.name);
                continue;
            }
            let Some(result) = self.api_result(ctx, target, step.overrides()).await else {
                continue;
            };
            let failed = !result.passed();
            results.push(result);

            if failed && !self.continue_on_failure() {
                info!("Stopping scenario {} due to step failure", scenario.name);
                break;
            }
        }

        results
    }

    /// Verdict of api `id`, executing it on first request. Overrides only
    /// shape the execution that actually happens.
    async fn api_result(
        &self,
        scenario_ctx: &Arc<ScopedContext>,
        id: &str,
        overrides: Option<&StepOverride>,
    ) -> Option<NodeResult> {
        let slot = Self::slot(&self.apis, id);
        if slot.status().is_terminal() {
            debug!("Reusing result of api {}", id);
        }
        let done = slot
            .settle(self.execute_api_node(scenario_ctx, id, overrides))
            .await?;
        adopt(scenario_ctx, id, done.published.as_ref());
        Some(done.result)
    }

    /// Run api `id` unless it is disabled (`None`) or one of its
    /// dependencies failed.
    async fn execute_api_node(
        &self,
        ctx: &Arc<ScopedContext>,
        id: &str,
        overrides: Option<&StepOverride>,
    ) -> Option<Executed> {
        let api = self.plan.api(id)?;
        if !api.enabled {
            info!("Skipping disabled api: {}", id);
            return None;
        }
        if !self.continue_on_failure() {
            let failed = api
                .depends_on
                .iter()
                .find(|dep| Self::slot(&self.apis, dep.as_str()).verdict() == Some(false));
            if let Some(dep) = failed {
                return Some(Executed {
                    result: blocked(id, NodeKind::Api, dep),
                    published: None,
                });
            }
        }
        Some(self.execute_api(ctx, api, overrides).await)
    }

    #[instrument(skip(self, scenario_ctx, api, overrides), fields(api = %api.name))]
    async fn execute_api(
        &self,
        scenario_ctx: &Arc<ScopedContext>,
        api: &ApiDefinition,
        overrides: Option<&StepOverride>,
    ) -> Executed {
        let started = Instant::now();
        let ctx = ScopedContext::child(&api.name, scenario_ctx);
        ctx.put_all(api.params.as_ref());

        let request = match materialize_request(&ctx, api, overrides, self.plan.config().base_url.as_deref()) {
            Ok(request) => request,
            Err(failure) => {
                warn!("Could not build request for {}: {}", api.name, failure);
                ctx.publish_to_parent();
                return Executed {
                    result: finish(&api.name, NodeKind::Api, started, Some(failure), Vec::new()),
                    published: Some(ctx.snapshot()),
                };
            }
        };

        let options = CallOptions {
            timeout: Duration::from_secs(self.plan.config().timeout),
            cancel: self.cancel.clone(),
        };
        let expected_body = api
            .expected_response
            .as_ref()
            .map(|body| resolver::resolve(&ctx, body));
        let expected_headers: HashMap<String, String> = api
            .expected_headers
            .iter()
            .map(|(name, value)| (name.clone(), resolver::resolve_to_string(&ctx, value)))
            .collect();
        let expect = Expectations {
            body: expected_body.as_ref(),
            headers: &expected_headers,
            ..Expectations::of(api)
        };

        let outcome = self.pipeline.call(request, api, &expect, &options).await;

        let request_value = outcome.request.to_value();
        let response_value = outcome.response.as_ref().map(|r| r.to_value());
        ctx.add_value("request", request_value.clone());
        if let Some(response) = &response_value {
            ctx.add_value("response", response.clone());
        }
        ctx.publish_to_parent();

        let mut result = finish(&api.name, NodeKind::Api, started, outcome.failure, Vec::new());
        result.request = Some(request_value);
        result.response = response_value;
        if let Some(failure) = &result.failure {
            warn!("Api {} failed: {}", api.name, failure);
        }
        Executed {
            result,
            published: Some(ctx.snapshot()),
        }
    }
}

/// Make a node that ran under another parent visible in `ctx` too.
fn adopt(ctx: &ScopedContext, id: &str, published: Option<&Value>) {
    if let Some(published) = published {
        if !ctx.contains_local(id) {
            ctx.add_value(id, published.clone());
        }
    }
}

/// Resolve every templated part of `api` against `ctx`.
pub fn materialize_request(
    ctx: &ScopedContext,
    api: &ApiDefinition,
    overrides: Option<&StepOverride>,
    base_url: Option<&str>,
) -> Result<ResolvedRequest, Failure> {
    let url = resolver::resolve_to_string(ctx, &api.url);
    let url = match base_url {
        Some(base) => join_url(&resolver::resolve_to_string(ctx, base), &url)?,
        None => url,
    };
    Url::parse(&url).map_err(|e| Failure::Configuration(format!("invalid url '{url}': {e}")))?;

    let resolve_map = |map: &HashMap<String, String>| -> BTreeMap<String, String> {
        map.iter()
            .map(|(key, value)| {
                (
                    resolver::resolve_to_string(ctx, key),
                    resolver::resolve_to_string(ctx, value),
                )
            })
            .collect()
    };

    let mut body = api.body.as_ref().map(|body| resolver::resolve(ctx, body));
    if let Some(step) = overrides {
        if let Some(body) = body.as_mut() {
            for path in &step.remove {
                shaping::remove_path(body, &resolver::resolve_to_string(ctx, path));
            }
        }
        if !step.add.is_empty() {
            let target = body.get_or_insert(Value::Null);
            for (path, value) in &step.add {
                shaping::add_path(
                    target,
                    &resolver::resolve_to_string(ctx, path),
                    resolver::resolve(ctx, value),
                );
            }
        }
    }

    Ok(ResolvedRequest {
        method: api.method,
        url,
        headers: resolve_map(&api.headers),
        query: resolve_map(&api.query),
        body,
    })
}

fn join_url(base: &str, url: &str) -> Result<String, Failure> {
    if url.contains("://") {
        return Ok(url.to_string());
    }
    let mut base = Url::parse(base)
        .map_err(|e| Failure::Configuration(format!("invalid base_url '{base}': {e}")))?;
    if url.is_empty() {
        return Ok(base.to_string());
    }
    // keep the base path: "http://h/api" + "users" -> "http://h/api/users"
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(url.trim_start_matches('/'))
        .map(|joined| joined.to_string())
        .map_err(|e| {
            Failure::Configuration(format!("failed to join base_url '{base}' with path '{url}': {e}"))
        })
}

fn finish(
    id: &str,
    kind: NodeKind,
    started: Instant,
    failure: Option<Failure>,
    children: Vec<NodeResult>,
) -> NodeResult {
    let failure = failure.or_else(|| {
        let failed: Vec<String> = children
            .iter()
            .filter(|child| !child.passed())
            .map(|child| child.id.clone())
            .collect();
        (!failed.is_empty()).then_some(Failure::Children(failed))
    });
    NodeResult {
        id: id.to_string(),
        kind,
        status: if failure.is_some() {
            NodeStatus::Failed
        } else {
            NodeStatus::Passed
        },
        failure,
        request: None,
        response: None,
        duration_ms: started.elapsed().as_millis() as u64,
        children,
    }
}

fn blocked(id: &str, kind: NodeKind, dependency: &str) -> NodeResult {
    NodeResult {
        id: id.to_string(),
        kind,
        status: NodeStatus::Failed,
        failure: Some(Failure::Dependency(dependency.to_string())),
        request: None,
        response: None,
        duration_ms: 0,
        children: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::model::{HttpMethod, Project};
    use crate::pipeline::{CallResponse, Transport};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers every request with a body built from the request, and
    /// fails urls containing "fail".
    #[derive(Default)]
    struct EchoTransport {
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn send(
            &self,
            request: &ResolvedRequest,
            _options: &CallOptions,
        ) -> Result<CallResponse, TransportError> {
            self.calls.lock().unwrap().push(request.url.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let status = if request.url.contains("fail") { 500 } else { 200 };
            Ok(CallResponse {
                status,
                headers: BTreeMap::new(),
                body: json!({
                    "url": request.url,
                    "token": "t-1",
                    "echo": request.body.clone().unwrap_or(Value::Null),
                }),
            })
        }
    }

    fn plan(yaml: &str, pipeline: &CallPipeline) -> Arc<ExecutionPlan> {
        let project = Project::from_yaml(yaml).unwrap();
        Arc::new(ExecutionPlan::build(project, pipeline).unwrap())
    }

    async fn run(yaml: &str, transport: Arc<EchoTransport>) -> (RunReport, Arc<ScopedContext>) {
        let pipeline = Arc::new(CallPipeline::new(transport));
        let plan = plan(yaml, &pipeline);
        let global = ScopedContext::root("test-global");
        let report = Orchestrator::new(pipeline)
            .with_global(Arc::clone(&global))
            .run(plan)
            .await;
        (report, global)
    }

    fn calls(transport: &EchoTransport) -> Vec<String> {
        transport.calls.lock().unwrap().clone()
    }

    const CHAIN: &str = r#"
name: chain
config:
  base_url: http://api.test
apis:
  - name: login
    method: POST
    url: /login
  - name: profile
    method: GET
    url: /users/${login.response.body.token}
    depends_on: [login]
scenarios:
  - name: view
    steps: [profile]
suites:
  - name: smoke
    scenarios: [view]
"#;

    #[tokio::test]
    async fn test_dependencies_run_first_and_feed_later_calls() {
        let transport = Arc::new(EchoTransport::default());
        let (report, global) = run(CHAIN, transport.clone()).await;

        assert!(report.success(), "{report:?}");
        assert_eq!(report.passed, 1);
        assert_eq!(
            calls(&transport),
            vec!["http://api.test/login", "http://api.test/users/t-1"]
        );

        let profile = report.find(NodeKind::Api, "profile").unwrap();
        assert_eq!(
            profile.request.as_ref().unwrap()["url"],
            json!("http://api.test/users/t-1")
        );

        // published all the way up to the injected root
        let token = resolver::resolve_str(&global, "${smoke.view.login.response.body.token}");
        assert_eq!(token, json!("t-1"));
    }

    #[tokio::test]
    async fn test_failed_dependency_blocks_dependents() {
        let yaml = r#"
apis:
  - name: broken
    method: GET
    url: http://api.test/fail
  - name: after
    method: GET
    url: http://api.test/after
    depends_on: [broken]
  - name: other
    method: GET
    url: http://api.test/other
scenarios:
  - name: first
    steps: [after]
  - name: second
    depends_on: [first]
    steps: [other]
  - name: independent
    steps: [other]
suites:
  - name: s
    scenarios: [second, independent]
"#;
        let transport = Arc::new(EchoTransport::default());
        let (report, _) = run(yaml, transport.clone()).await;

        assert!(!report.success());
        let after = report.find(NodeKind::Api, "after").unwrap();
        assert_eq!(after.failure, Some(Failure::Dependency("broken".into())));
        let second = report.find(NodeKind::Scenario, "second").unwrap();
        assert_eq!(second.failure, Some(Failure::Dependency("first".into())));
        assert!(report.find(NodeKind::Scenario, "independent").unwrap().passed());
        assert_eq!((report.passed, report.failed), (1, 2));
        assert!(!calls(&transport).contains(&"http://api.test/after".to_string()));
    }

    #[tokio::test]
    async fn test_shared_scenario_runs_once() {
        let yaml = r#"
apis:
  - name: ping
    method: GET
    url: http://api.test/ping
scenarios:
  - name: setup
    steps: [ping]
  - name: a
    depends_on: [setup]
    steps: []
  - name: b
    depends_on: [setup]
    steps: []
suites:
  - name: s
    scenarios: [a, b]
"#;
        let transport = Arc::new(EchoTransport::default());
        let (report, _) = run(yaml, transport.clone()).await;

        assert!(report.success());
        assert_eq!(calls(&transport).len(), 1);
        assert_eq!(report.suites[0].children.len(), 3);
    }

    #[tokio::test]
    async fn test_workers_bound_concurrency() {
        let mut yaml = String::from(
            "config:\n  max_workers: 2\napis:\n  - name: slow\n    method: GET\n    url: http://api.test/slow\nscenarios:\n",
        );
        for i in 0..6 {
            yaml.push_str(&format!("  - name: s{i}\n    steps: [slow]\n"));
        }
        yaml.push_str("suites:\n  - name: all\n    scenarios: [s0, s1, s2, s3, s4, s5]\n");

        let transport = Arc::new(EchoTransport {
            delay: Some(Duration::from_millis(30)),
            ..Default::default()
        });
        let (report, _) = run(&yaml, transport.clone()).await;

        assert!(report.success());
        assert_eq!(calls(&transport).len(), 6);
        let peak = transport.peak.load(Ordering::SeqCst);
        assert!(peak <= 2 && peak >= 1, "peak concurrency {peak}");
    }

    #[tokio::test]
    async fn test_disabled_nodes_are_skipped() {
        let yaml = r#"
apis:
  - name: off
    method: GET
    url: http://api.test/off
    enabled: false
  - name: on
    method: GET
    url: http://api.test/on
    depends_on: [off]
scenarios:
  - name: run
    steps: [on]
  - name: skipped
    enabled: false
    steps: [on]
suites:
  - name: s
    scenarios: [run, skipped]
"#;
        let transport = Arc::new(EchoTransport::default());
        let (report, _) = run(yaml, transport.clone()).await;

        assert!(report.success());
        assert_eq!(calls(&transport), vec!["http://api.test/on"]);
        assert!(report.find(NodeKind::Scenario, "skipped").is_none());
        assert!(report.find(NodeKind::Api, "off").is_none());
    }

    #[tokio::test]
    async fn test_step_overrides_shape_body() {
        let yaml = r#"
apis:
  - name: create
    method: POST
    url: http://api.test/users
    body:
      name: ${user}
      password: secret
scenarios:
  - name: signup
    params:
      user: alice
    steps:
      - api: create
        remove: [password]
        add:
          profile.city: ${city}
suites:
  - name: s
    params:
      city: Oslo
    scenarios: [signup]
"#;
        let transport = Arc::new(EchoTransport::default());
        let (report, _) = run(yaml, transport).await;

        let create = report.find(NodeKind::Api, "create").unwrap();
        assert_eq!(
            create.request.as_ref().unwrap()["body"],
            json!({"name": "alice", "profile": {"city": "Oslo"}})
        );
    }

    #[tokio::test]
    async fn test_nodes_run_once_across_suites_and_steps() {
        let yaml = r#"
apis:
  - name: login
    method: POST
    url: http://api.test/login
  - name: create
    method: POST
    url: http://api.test/create
    depends_on: [login]
scenarios:
  - name: s
    steps: [create, login]
  - name: t
    steps: [login]
suites:
  - name: a
    scenarios: [s]
  - name: b
    scenarios: [s, t]
"#;
        let transport = Arc::new(EchoTransport::default());
        let (report, global) = run(yaml, transport.clone()).await;

        assert!(report.success(), "{report:?}");
        assert_eq!(
            calls(&transport),
            vec!["http://api.test/login", "http://api.test/create"]
        );
        assert_eq!((report.passed, report.failed), (2, 0));

        let b = &report.suites[1];
        let ids: Vec<&str> = b.children.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["s", "t"]);

        // reused results are visible where they are referenced
        let t = report.find(NodeKind::Scenario, "t").unwrap();
        assert_eq!(t.children[0].id, "login");
        assert_eq!(
            resolver::resolve_str(&global, "${b.t.login.request.url}"),
            json!("http://api.test/login")
        );
        assert_eq!(
            resolver::resolve_str(&global, "${b.s.create.response.status}"),
            json!(200)
        );
    }

    #[tokio::test]
    async fn test_failed_api_is_not_retried_by_later_scenarios() {
        let yaml = r#"
apis:
  - name: broken
    method: GET
    url: http://api.test/fail
scenarios:
  - name: first
    steps: [broken]
  - name: second
    steps: [broken]
suites:
  - name: s
    scenarios: [first, second]
"#;
        let transport = Arc::new(EchoTransport::default());
        let (report, _) = run(yaml, transport.clone()).await;

        assert_eq!(calls(&transport), vec!["http://api.test/fail"]);
        assert_eq!((report.passed, report.failed), (0, 2));
    }

    #[tokio::test]
    async fn test_slot_walks_the_state_machine_once() {
        let slot = NodeSlot::default();
        assert_eq!(slot.status(), NodeStatus::Pending);

        let runs = AtomicUsize::new(0);
        let execute = || async {
            runs.fetch_add(1, Ordering::SeqCst);
            assert_eq!(slot.status(), NodeStatus::Running);
            Some(Executed {
                result: blocked("x", NodeKind::Api, "y"),
                published: None,
            })
        };

        let first = slot.settle(execute()).await;
        assert_eq!(first.unwrap().result.status, NodeStatus::Failed);
        assert!(slot.status().is_terminal());
        assert_eq!(slot.verdict(), Some(false));

        let again = slot.settle(execute()).await;
        assert_eq!(again.unwrap().result.id, "x");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_slot_stays_pending() {
        let slot = NodeSlot::default();
        assert!(slot.settle(async { None }).await.is_none());
        assert_eq!(slot.status(), NodeStatus::Pending);
        assert_eq!(slot.verdict(), None);
    }

    #[test]
    fn test_suite_roots_include_scenarios_needed_elsewhere() {
        let yaml = r#"
apis:
  - name: ping
    method: GET
    url: http://api.test/ping
scenarios:
  - name: setup
    steps: [ping]
  - name: main
    depends_on: [setup]
    steps: [ping]
  - name: extra
    steps: [ping]
suites:
  - name: prepare
    scenarios: [setup]
  - name: full
    scenarios: [main, extra]
"#;
        let pipeline = CallPipeline::new(Arc::new(EchoTransport::default()));
        let plan = plan(yaml, &pipeline);

        let roots = |suite: &str| {
            let closure: Vec<String> = plan
                .scenario_closure(suite)
                .into_iter()
                .map(str::to_string)
                .collect();
            suite_roots(&plan, plan.suite(suite).unwrap(), &closure)
        };
        assert_eq!(roots("prepare"), vec!["setup"]);
        let mut full = roots("full");
        full.sort();
        assert_eq!(full, vec!["extra", "main"]);
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://h", "/a").unwrap(), "http://h/a");
        assert_eq!(join_url("http://h/api", "users").unwrap(), "http://h/api/users");
        assert_eq!(join_url("http://h/api/", "/users").unwrap(), "http://h/api/users");
        assert_eq!(join_url("http://h", "https://other/x").unwrap(), "https://other/x");
        assert!(join_url("not a url", "/x").is_err());
    }

    #[test]
    fn test_materialize_request_resolves_everything() {
        let ctx = ScopedContext::root("r");
        ctx.add_value("id", json!(7));
        ctx.add_value("auth", json!("Bearer x"));
        let api: ApiDefinition = serde_yaml::from_str(
            r#"
name: get
method: GET
url: /items/${id}
headers:
  Authorization: ${auth}
query:
  page: "${id}"
"#,
        )
        .unwrap();

        let request = materialize_request(&ctx, &api, None, Some("http://h")).unwrap();
        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.url, "http://h/items/7");
        assert_eq!(request.headers["Authorization"], "Bearer x");
        assert_eq!(request.query["page"], "7");
        assert!(request.body.is_none());
    }

    #[test]
    fn test_relative_url_without_base_is_configuration_error() {
        let ctx = ScopedContext::root("r");
        let api: ApiDefinition =
            serde_yaml::from_str("name: x\nmethod: GET\nurl: /relative\n").unwrap();
        assert!(matches!(
            materialize_request(&ctx, &api, None, None),
            Err(Failure::Configuration(_))
        ));
    }
}
