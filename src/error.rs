//! Error types for plan construction and HTTP transport.
//!
//! Configuration problems are collected rather than returned one at a
//! time, so a broken project reports every offending node before any
//! request is sent.

use std::fmt;

use crate::model::NodeKind;

/// A single configuration problem found while building the execution
/// plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate {kind} name '{name}'")]
    DuplicateName { kind: NodeKind, name: String },

    #[error("{kind} '{from}' references unknown {target} '{name}'")]
    MissingReference {
        kind: NodeKind,
        from: String,
        target: NodeKind,
        name: String,
    },

    #[error("{kind} '{node}' redefines parameter(s) already set by {outer_kind} '{outer}': {}", .keys.join(", "))]
    ParamCollision {
        kind: NodeKind,
        node: String,
        outer_kind: NodeKind,
        outer: String,
        keys: Vec<String>,
    },

    #[error("api '{api}' uses unknown matcher '{matcher}'")]
    UnknownMatcher { api: String, matcher: String },

    #[error("api '{api}' uses unknown hook '{hook}'")]
    UnknownHook { api: String, hook: String },

    #[error("cyclic {kind} dependency: {}", .path.join(" -> "))]
    Cycle { kind: NodeKind, path: Vec<String> },
}

/// Every configuration problem of a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanError {
    pub errors: Vec<ConfigError>,
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} configuration error(s)", self.errors.len())?;
        for error in &self.errors {
            write!(f, "\n  - {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for PlanError {}

impl From<ConfigError> for PlanError {
    fn from(error: ConfigError) -> Self {
        Self {
            errors: vec![error],
        }
    }
}

/// Failure to obtain a response, as opposed to a response that did not
/// match expectations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to read response body: {0}")]
    Body(String),
}
