//! Call pipeline: middleware, transport and matchers.
//!
//! The orchestrator hands a fully resolved request to
//! [`CallPipeline::call`], which runs the `before` hooks, sends the
//! request through the [`Transport`], runs the `after` hooks and finally
//! checks status, headers and body.

use async_trait::async_trait;
use reqwest::{Client, Method as ReqMethod, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

use crate::error::TransportError;
use crate::model::{ApiDefinition, Failure, HttpMethod};
use crate::validator::{
    self, ExactMatcher, Matcher, PartialMatcher, DEFAULT_MATCHER,
};

/// A request ready for the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRequest {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl ResolvedRequest {
    /// The payload record stored under `request`.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("method".into(), Value::String(self.method.to_string()));
        map.insert("url".into(), Value::String(self.url.clone()));
        map.insert("headers".into(), string_map_value(&self.headers));
        map.insert("query".into(), string_map_value(&self.query));
        map.insert("body".into(), self.body.clone().unwrap_or(Value::Null));
        Value::Object(map)
    }
}

/// What came back from the transport. Header names are lower case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON when possible, raw text otherwise, `null` when empty.
    #[serde(default)]
    pub body: Value,
}

impl CallResponse {
    /// The payload record stored under `response`.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("status".into(), Value::Number(Number::from(self.status)));
        map.insert("headers".into(), string_map_value(&self.headers));
        map.insert("body".into(), self.body.clone());
        Value::Object(map)
    }

    pub fn headers_map(&self) -> HashMap<String, String> {
        self.headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

fn string_map_value(map: &BTreeMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// Parse a response body: JSON if it parses, text otherwise.
pub fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Cooperative cancellation shared by every call of a run.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once [`CancelToken::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // sender gone, never cancelled
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-call limits propagated from the orchestrator.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub timeout: Duration,
    pub cancel: CancelToken,
}

/// Request/response hook. Both sides default to no-ops.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn before(&self, _request: &mut ResolvedRequest) {}

    fn after(&self, _request: &ResolvedRequest, _response: &mut CallResponse) {}
}

/// Adds configured headers unless the request already sets them.
#[derive(Debug, Default)]
pub struct DefaultHeaders {
    headers: HashMap<String, String>,
}

impl DefaultHeaders {
    pub fn new(headers: HashMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Middleware for DefaultHeaders {
    fn name(&self) -> &str {
        "default_headers"
    }

    fn before(&self, request: &mut ResolvedRequest) {
        for (name, value) in &self.headers {
            let present = request
                .headers
                .keys()
                .any(|key| key.eq_ignore_ascii_case(name));
            if !present {
                request.headers.insert(name.clone(), value.clone());
            }
        }
    }
}

/// Logs every exchange at info level.
#[derive(Debug, Default)]
pub struct LogExchange;

impl Middleware for LogExchange {
    fn name(&self) -> &str {
        "log"
    }

    fn before(&self, request: &mut ResolvedRequest) {
        info!(method = %request.method, url = %request.url, "sending request");
    }

    fn after(&self, request: &ResolvedRequest, response: &mut CallResponse) {
        info!(
            method = %request.method,
            url = %request.url,
            status = response.status,
            "received response"
        );
    }
}

/// Sends a resolved request somewhere and returns what came back.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: &ResolvedRequest,
        options: &CallOptions,
    ) -> Result<CallResponse, TransportError>;
}

/// [`Transport`] over reqwest.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Create a transport with a custom client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn convert_method(method: HttpMethod) -> ReqMethod {
        match method {
            HttpMethod::Get => ReqMethod::GET,
            HttpMethod::Post => ReqMethod::POST,
            HttpMethod::Put => ReqMethod::PUT,
            HttpMethod::Delete => ReqMethod::DELETE,
            HttpMethod::Patch => ReqMethod::PATCH,
            HttpMethod::Head => ReqMethod::HEAD,
            HttpMethod::Options => ReqMethod::OPTIONS,
        }
    }

    async fn exchange(
        &self,
        request: &ResolvedRequest,
        timeout: Duration,
    ) -> Result<CallResponse, TransportError> {
        // a `before` hook may have rewritten the url
        let url = Url::parse(&request.url).map_err(|e| TransportError::InvalidUrl {
            url: request.url.clone(),
            reason: e.to_string(),
        })?;
        let mut builder = self
            .client
            .request(Self::convert_method(request.method), url)
            .timeout(timeout);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        match &request.body {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => {
                builder = builder.body(text.clone());
            }
            Some(body) => {
                builder = builder.json(body);
            }
        }

        debug!("Sending request to {}", request.url);
        let response = builder.send().await?;
        let status = response.status().as_u16();
        debug!("Received response with status: {}", status);

        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    value.to_str().unwrap_or("").to_string(),
                )
            })
            .collect();

        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))?;

        Ok(CallResponse {
            status,
            headers,
            body: parse_body(&text),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, request, options), fields(url = %request.url, method = %request.method))]
    async fn send(
        &self,
        request: &ResolvedRequest,
        options: &CallOptions,
    ) -> Result<CallResponse, TransportError> {
        if options.cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        tokio::select! {
            result = tokio::time::timeout(options.timeout, self.exchange(request, options.timeout)) => {
                match result {
                    Ok(response) => response,
                    Err(_) => Err(TransportError::Timeout(options.timeout)),
                }
            }
            _ = options.cancel.cancelled() => Err(TransportError::Cancelled),
        }
    }
}

/// Expectations of one API call.
#[derive(Debug, Clone, Copy)]
pub struct Expectations<'a> {
    pub status: &'a [u16],
    pub headers: &'a HashMap<String, String>,
    pub body: Option<&'a Value>,
    pub matcher: &'a str,
}

impl<'a> Expectations<'a> {
    pub fn of(api: &'a ApiDefinition) -> Self {
        Self {
            status: &api.expected_status,
            headers: &api.expected_headers,
            body: api.expected_response.as_ref(),
            matcher: api.matcher.as_deref().unwrap_or(DEFAULT_MATCHER),
        }
    }
}

/// Result of one pass through the pipeline.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// The request as sent, after `before` hooks.
    pub request: ResolvedRequest,
    pub response: Option<CallResponse>,
    pub failure: Option<Failure>,
}

impl CallOutcome {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct CallPipeline {
    transport: Arc<dyn Transport>,
    defaults: DefaultHeaders,
    hooks: HashMap<String, Arc<dyn Middleware>>,
    matchers: HashMap<String, Arc<dyn Matcher>>,
}

impl CallPipeline {
    /// Pipeline with the built-in `log` hook and the `exact` / `partial`
    /// matchers.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let mut pipeline = Self {
            transport,
            defaults: DefaultHeaders::default(),
            hooks: HashMap::new(),
            matchers: HashMap::new(),
        };
        pipeline.register_hook(Arc::new(LogExchange));
        pipeline.register_matcher(Arc::new(ExactMatcher));
        pipeline.register_matcher(Arc::new(PartialMatcher));
        pipeline
    }

    /// Pipeline over [`HttpTransport`].
    pub fn http() -> Self {
        Self::new(Arc::new(HttpTransport::new()))
    }

    pub fn with_default_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.defaults = DefaultHeaders::new(headers);
        self
    }

    pub fn register_hook(&mut self, hook: Arc<dyn Middleware>) {
        self.hooks.insert(hook.name().to_string(), hook);
    }

    pub fn register_matcher(&mut self, matcher: Arc<dyn Matcher>) {
        self.matchers.insert(matcher.name().to_string(), matcher);
    }

    /// `default_headers` always runs, naming it in a hook list is allowed.
    pub fn has_hook(&self, name: &str) -> bool {
        name == self.defaults.name() || self.hooks.contains_key(name)
    }

    pub fn has_matcher(&self, name: &str) -> bool {
        self.matchers.contains_key(name)
    }

    fn hooks_named<'a>(
        &'a self,
        names: &'a [String],
    ) -> impl Iterator<Item = &'a Arc<dyn Middleware>> + 'a {
        names.iter().filter_map(move |name| self.hooks.get(name))
    }

    /// Run one call end to end, using the hooks named by `api`. Never
    /// fails: transport problems and mismatches are reported in the
    /// outcome.
    pub async fn call(
        &self,
        mut request: ResolvedRequest,
        api: &ApiDefinition,
        expect: &Expectations<'_>,
        options: &CallOptions,
    ) -> CallOutcome {
        self.defaults.before(&mut request);
        for hook in self.hooks_named(&api.pre_hooks) {
            hook.before(&mut request);
        }

        let mut response = match self.transport.send(&request, options).await {
            Ok(response) => response,
            Err(err) => {
                return CallOutcome {
                    request,
                    response: None,
                    failure: Some(Failure::Transport(err.to_string())),
                };
            }
        };

        for hook in self.hooks_named(&api.post_hooks) {
            hook.after(&request, &mut response);
        }

        let errors = self.check(&response, expect);
        let failure = (!errors.is_empty()).then_some(Failure::Assertion(errors));

        CallOutcome {
            request,
            response: Some(response),
            failure,
        }
    }

    /// Every mismatch between a response and its expectations.
    pub fn check(&self, response: &CallResponse, expect: &Expectations<'_>) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(error) = validator::validate_status(response.status, expect.status) {
            errors.push(error);
        }

        errors.extend(validator::validate_headers(
            &response.headers_map(),
            expect.headers,
        ));

        if let Some(expected) = expect.body {
            match self.matchers.get(expect.matcher) {
                Some(matcher) => errors.extend(matcher.compare(expected, &response.body)),
                None => errors.push(format!("unknown matcher '{}'", expect.matcher)),
            }
        }

        errors
    }
}

impl std::fmt::Debug for CallPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut hooks: Vec<&String> = self.hooks.keys().collect();
        hooks.sort();
        let mut matchers: Vec<&String> = self.matchers.keys().collect();
        matchers.sort();
        f.debug_struct("CallPipeline")
            .field("hooks", &hooks)
            .field("matchers", &matchers)
            .finish()
    }
}
