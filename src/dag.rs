//! Workflow DAG definitions and validation.
//!
//! A workflow spec carries a directed acyclic graph of nodes. Every node
//! names the nodes it depends on; a node becomes executable once all of its
//! dependencies have succeeded. Validation runs at spec registration and
//! again at submit so a cyclic or dangling graph never produces a run.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::retry::BackoffPolicy;

/// Default number of execution attempts within a single task delivery.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Executor family a node dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    #[serde(rename = "LLM")]
    Llm,
    Tool,
    Function,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "LLM",
            Self::Tool => "Tool",
            Self::Function => "Function",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Priority tier of a task queue. Workers drain Gold before Silver before
/// Bronze.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    Gold,
    Silver,
    Bronze,
}

impl Tier {
    /// All tiers in strict priority order.
    pub fn all() -> [Tier; 3] {
        [Tier::Gold, Tier::Silver, Tier::Bronze]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gold => "Gold",
            Self::Silver => "Silver",
            Self::Bronze => "Bronze",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Gold" => Some(Self::Gold),
            "Silver" => Some(Self::Silver),
            "Bronze" => Some(Self::Bronze),
            _ => None,
        }
    }

    /// Log subject this tier's tasks are published on.
    pub fn subject(&self) -> String {
        format!("tasks.{self}")
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn default_max_retries() -> i32 {
    DEFAULT_MAX_RETRIES
}

/// Per-node execution policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePolicy {
    /// Execution attempts per delivery before the worker reports failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Wall-clock budget for the task, from enqueue to completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<i64>,
    /// Explicit queue tier; falls back to the run's `tier` tag, then Bronze.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
}

impl Default for NodePolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
            deadline_secs: None,
            tier: None,
        }
    }
}

/// A single node of a workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub policy: NodePolicy,
    /// Type-specific parameters, opaque to the scheduler.
    #[serde(default)]
    pub params: Value,
    /// When true, a terminal failure of this node does not fail the run.
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl NodeDef {
    /// Queue tier for this node given the run's tags.
    pub fn tier(&self, run_tags: &std::collections::BTreeMap<String, String>) -> Tier {
        if let Some(tier) = self.policy.tier {
            return tier;
        }
        run_tags
            .get("tier")
            .and_then(|value| Tier::parse(value))
            .unwrap_or(Tier::Bronze)
    }
}

/// The dependency graph payload of a workflow spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dag {
    pub nodes: Vec<NodeDef>,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SpecValidationError(pub String);

impl Dag {
    pub fn new(nodes: Vec<NodeDef>) -> Self {
        Self { nodes }
    }

    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Nodes with no dependencies; the initial ready frontier.
    pub fn roots(&self) -> impl Iterator<Item = &NodeDef> {
        self.nodes.iter().filter(|node| node.dependencies.is_empty())
    }

    /// Nodes that list `id` as a direct dependency.
    pub fn dependents_of<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a NodeDef> {
        self.nodes
            .iter()
            .filter(move |node| node.dependencies.iter().any(|dep| dep == id))
    }

    /// Node ids transitively downstream of any id in `sources`.
    pub fn downstream_of(&self, sources: &HashSet<String>) -> HashSet<String> {
        let mut reached: HashSet<String> = HashSet::new();
        let mut frontier: VecDeque<&str> = sources.iter().map(String::as_str).collect();
        while let Some(current) = frontier.pop_front() {
            for dependent in self.dependents_of(current) {
                if reached.insert(dependent.id.clone()) {
                    frontier.push_back(&dependent.id);
                }
            }
        }
        reached
    }

    /// Reject empty graphs, duplicate ids, unknown dependencies, and cycles.
    pub fn validate(&self) -> Result<(), SpecValidationError> {
        if self.nodes.is_empty() {
            return Err(SpecValidationError("workflow has no nodes".to_string()));
        }

        let mut ids: HashSet<&str> = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(SpecValidationError(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        for node in &self.nodes {
            for dep in &node.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(SpecValidationError(format!(
                        "node '{}' depends on unknown node '{}'",
                        node.id, dep
                    )));
                }
            }
        }

        // Kahn's algorithm; anything left unprocessed sits on a cycle.
        let mut indegree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|node| (node.id.as_str(), node.dependencies.len()))
            .collect();
        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut processed = 0usize;

        while let Some(current) = queue.pop_front() {
            processed += 1;
            for dependent in self.dependents_of(current) {
                let degree = indegree
                    .get_mut(dependent.id.as_str())
                    .expect("dependent id validated above");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent.id.as_str());
                }
            }
        }

        if processed < self.nodes.len() {
            let mut cyclic: Vec<&str> = indegree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(id, _)| *id)
                .collect();
            cyclic.sort_unstable();
            return Err(SpecValidationError(format!(
                "dependency cycle involving nodes: {}",
                cyclic.join(", ")
            )));
        }

        Ok(())
    }
}
