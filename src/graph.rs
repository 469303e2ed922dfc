//! Dependency graph of same-kind nodes.
//!
//! Edges point from a node to the nodes it depends on. Validation uses a
//! three-state depth-first search whose marks live only for the duration
//! of the call, so a cycle anywhere below the node being checked is
//! found and reported with its full path.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

use crate::error::ConfigError;
use crate::model::NodeKind;

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: String,
    pub depends_on: Vec<String>,
    pub enabled: bool,
    pub params: Option<Map<String, Value>>,
    /// Ids of the nodes depending on this one. Filled by
    /// [`DependencyGraph::add_edge`], informational only.
    pub parents: Vec<String>,
}

impl GraphNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            enabled: true,
            params: None,
            parents: Vec::new(),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_params(mut self, params: Option<Map<String, Value>>) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    kind: NodeKind,
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
}

impl DependencyGraph {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_node(&mut self, node: GraphNode) -> Result<(), ConfigError> {
        if self.index.contains_key(&node.id) {
            return Err(ConfigError::DuplicateName {
                kind: self.kind,
                name: node.id,
            });
        }
        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    /// Record that `node` depends on `dependency`.
    pub fn add_edge(
        &mut self,
        node: &str,
        dependency: &str,
    ) -> Result<(), ConfigError> {
        let missing = |name: &str| ConfigError::MissingReference {
            kind: self.kind,
            from: node.to_string(),
            target: self.kind,
            name: name.to_string(),
        };
        let from = *self.index.get(node).ok_or_else(|| missing(node))?;
        let to = *self
            .index
            .get(dependency)
            .ok_or_else(|| missing(dependency))?;

        self.nodes[from].depends_on.push(dependency.to_string());
        self.nodes[to].parents.push(node.to_string());
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.index.get(id).map(|&idx| &self.nodes[idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter()
    }

    /// Fail with the first cycle found, reported as the full path
    /// (`a -> b -> a`).
    pub fn validate_acyclic(&self) -> Result<(), ConfigError> {
        let mut marks: HashMap<usize, Mark> = HashMap::new();
        let mut stack: Vec<usize> = Vec::new();

        for idx in 0..self.nodes.len() {
            if marks.contains_key(&idx) {
                continue;
            }
            if let Some(path) = self.visit(idx, &mut marks, &mut stack) {
                return Err(ConfigError::Cycle {
                    kind: self.kind,
                    path,
                });
            }
        }
        Ok(())
    }

    fn visit(
        &self,
        idx: usize,
        marks: &mut HashMap<usize, Mark>,
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        marks.insert(idx, Mark::InProgress);
        stack.push(idx);

        for dep in &self.nodes[idx].depends_on {
            let Some(&dep_idx) = self.index.get(dep) else {
                continue;
            };
            match marks.get(&dep_idx) {
                Some(Mark::Done) => {}
                Some(Mark::InProgress) => {
                    let start = stack
                        .iter()
                        .position(|&i| i == dep_idx)
                        .unwrap_or(0);
                    let mut path: Vec<String> = stack[start..]
                        .iter()
                        .map(|&i| self.nodes[i].id.clone())
                        .collect();
                    path.push(self.nodes[dep_idx].id.clone());
                    return Some(path);
                }
                None => {
                    if let Some(path) = self.visit(dep_idx, marks, stack) {
                        return Some(path);
                    }
                }
            }
        }

        stack.pop();
        marks.insert(idx, Mark::Done);
        None
    }

    /// Nodes nobody depends on: the entry points of execution.
    pub fn roots(&self) -> Vec<&GraphNode> {
        self.nodes
            .iter()
            .filter(|node| node.parents.is_empty())
            .collect()
    }

    /// Every node reachable from `id` through `depends_on`, each after
    /// all of its dependencies, `id` last.
    pub fn topological_order(&self, id: &str) -> Vec<&str> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        if let Some(&idx) = self.index.get(id) {
            self.post_order(idx, &mut visited, &mut order);
        }
        order
    }

    /// Topological order of the whole graph, root by root.
    pub fn execution_order(&self) -> Vec<&str> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.parents.is_empty() {
                self.post_order(idx, &mut visited, &mut order);
            }
        }
        // nodes only reachable through a cycle
        for idx in 0..self.nodes.len() {
            self.post_order(idx, &mut visited, &mut order);
        }
        order
    }

    fn post_order<'a>(
        &'a self,
        idx: usize,
        visited: &mut HashSet<usize>,
        order: &mut Vec<&'a str>,
    ) {
        if !visited.insert(idx) {
            return;
        }
        for dep in &self.nodes[idx].depends_on {
            if let Some(&dep_idx) = self.index.get(dep) {
                self.post_order(dep_idx, visited, order);
            }
        }
        order.push(self.nodes[idx].id.as_str());
    }
}
