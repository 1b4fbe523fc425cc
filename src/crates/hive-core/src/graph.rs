//! Graph specification: nodes, edges, validation, fan-out analysis.
//!
//! A [`GraphSpec`] is immutable after [`GraphSpec::compile`]: loading
//! validates the structure (entry exists, edge endpoints resolve, terminal
//! nodes have no outgoing edges, unique ids), sorts outgoing edges by
//! `(priority, id)` for deterministic selection, and precomputes fan-out
//! groups together with their convergence node (lowest common descendant by
//! BFS, ties broken by node-id order).

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

/// Node identifier, unique within a graph.
pub type NodeId = String;

/// The six node implementation variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    LlmGenerate,
    LlmToolUse,
    Function,
    Router,
    ClientInput,
    SubGraph,
}

fn default_max_visits() -> u32 {
    10
}

/// Declarative node description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub input_keys: Vec<String>,
    pub output_keys: Vec<String>,
    /// Tool names advertised to `llm_tool_use` nodes; filters the registry.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Named callable for `function` nodes; defaults to the node id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// Visit cap enforced by the executor before each entry.
    #[serde(default = "default_max_visits")]
    pub max_node_visits: u32,
    /// Loop continuation condition, evaluated over the node's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_condition: Option<String>,
    /// Whether LLM deltas from this node also stream as client output.
    #[serde(default)]
    pub client_facing: bool,
    /// Length limit driving the corrective shorten re-prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_chars: Option<usize>,
    /// Embedded graph for `sub_graph` nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_graph: Option<Box<GraphSpec>>,
}

impl NodeSpec {
    /// Minimal spec used by builders and tests.
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            node_type,
            input_keys: Vec::new(),
            output_keys: Vec::new(),
            tools: Vec::new(),
            system_prompt: None,
            function: None,
            max_node_visits: default_max_visits(),
            loop_condition: None,
            client_facing: false,
            max_output_chars: None,
            sub_graph: None,
        }
    }

    pub fn with_io(mut self, inputs: &[&str], outputs: &[&str]) -> Self {
        self.input_keys = inputs.iter().map(|s| s.to_string()).collect();
        self.output_keys = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_visits(mut self, max: u32) -> Self {
        self.max_node_visits = max;
        self
    }

    /// Callable name this node resolves at runtime.
    pub fn function_name(&self) -> &str {
        self.function.as_deref().unwrap_or(&self.id)
    }
}

/// Edge transition condition.
///
/// `on_success` / `on_failure` are short-hands over the last node's status;
/// everything else is an expression in the condition sublanguage evaluated
/// over the source node's namespace (unresolved names are false, never an
/// error).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EdgeCondition {
    Always,
    OnSuccess,
    OnFailure,
    Expr(String),
}

impl From<String> for EdgeCondition {
    fn from(s: String) -> Self {
        match s.trim() {
            "always" | "" => Self::Always,
            "on_success" => Self::OnSuccess,
            "on_failure" => Self::OnFailure,
            _ => Self::Expr(s),
        }
    }
}

impl From<EdgeCondition> for String {
    fn from(c: EdgeCondition) -> Self {
        match c {
            EdgeCondition::Always => "always".to_string(),
            EdgeCondition::OnSuccess => "on_success".to_string(),
            EdgeCondition::OnFailure => "on_failure".to_string(),
            EdgeCondition::Expr(s) => s,
        }
    }
}

fn default_priority() -> i32 {
    100
}

/// Directed, conditional connection between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
    pub condition: EdgeCondition,
    /// Lower number = evaluated earlier; ties broken by edge id.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Member of its source's parallel fan-out set.
    #[serde(default)]
    pub parallel: bool,
}

impl EdgeSpec {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        condition: EdgeCondition,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition,
            priority: default_priority(),
            parallel: false,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }
}

/// A precomputed parallel fan-out group: the branch edges leaving one node
/// and the node on which all branches converge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOut {
    /// `(edge_id, branch_entry_node)` in deterministic edge order.
    pub branches: Vec<(String, NodeId)>,
    /// Lowest common descendant of every branch entry.
    pub join: NodeId,
}

/// Immutable-after-load graph description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    pub id: String,
    #[serde(default)]
    pub goal_id: String,
    #[serde(default)]
    pub version: String,
    pub entry_node: NodeId,
    pub terminal_nodes: Vec<NodeId>,
    /// Optional named entry points (name → node id).
    #[serde(default)]
    pub entry_points: HashMap<String, NodeId>,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,

    #[serde(skip)]
    node_index: HashMap<NodeId, usize>,
    /// Outgoing edge indexes per node, sorted by `(priority, id)`.
    #[serde(skip)]
    out_edges: HashMap<NodeId, Vec<usize>>,
    #[serde(skip)]
    fan_outs: HashMap<NodeId, FanOut>,
    #[serde(skip)]
    terminals: HashSet<NodeId>,
}

impl GraphSpec {
    /// Parse and compile a graph from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut spec: GraphSpec = serde_json::from_str(json)?;
        spec.compile()?;
        Ok(spec)
    }

    /// Parse and compile a graph from a JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let mut spec: GraphSpec = serde_json::from_value(value)?;
        spec.compile()?;
        Ok(spec)
    }

    /// Load, parse, and compile a graph from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Validate the structure and build the lookup indexes.
    ///
    /// Must run before execution; [`from_json`](Self::from_json) and
    /// friends call it for you. Embedded sub-graphs compile recursively.
    pub fn compile(&mut self) -> Result<()> {
        self.node_index.clear();
        self.out_edges.clear();
        self.fan_outs.clear();
        self.terminals = self.terminal_nodes.iter().cloned().collect();

        for (idx, node) in self.nodes.iter().enumerate() {
            if self.node_index.insert(node.id.clone(), idx).is_some() {
                return Err(CoreError::InvalidGraph(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        if !self.node_index.contains_key(&self.entry_node) {
            return Err(CoreError::InvalidGraph(format!(
                "entry node '{}' does not exist",
                self.entry_node
            )));
        }
        for terminal in &self.terminal_nodes {
            if !self.node_index.contains_key(terminal) {
                return Err(CoreError::InvalidGraph(format!(
                    "terminal node '{terminal}' does not exist"
                )));
            }
        }
        for (name, target) in &self.entry_points {
            if !self.node_index.contains_key(target) {
                return Err(CoreError::InvalidGraph(format!(
                    "entry point '{name}' targets unknown node '{target}'"
                )));
            }
        }

        let mut edge_ids = HashSet::new();
        for (idx, edge) in self.edges.iter().enumerate() {
            if !edge_ids.insert(edge.id.clone()) {
                return Err(CoreError::InvalidGraph(format!(
                    "duplicate edge id '{}'",
                    edge.id
                )));
            }
            if !self.node_index.contains_key(&edge.source) {
                return Err(CoreError::InvalidGraph(format!(
                    "edge '{}' source '{}' does not exist",
                    edge.id, edge.source
                )));
            }
            if !self.node_index.contains_key(&edge.target) {
                return Err(CoreError::InvalidGraph(format!(
                    "edge '{}' target '{}' does not exist",
                    edge.id, edge.target
                )));
            }
            if self.terminals.contains(&edge.source) {
                return Err(CoreError::InvalidGraph(format!(
                    "edge '{}' leaves terminal node '{}'",
                    edge.id, edge.source
                )));
            }
            self.out_edges.entry(edge.source.clone()).or_default().push(idx);
        }

        for indexes in self.out_edges.values_mut() {
            indexes.sort_by(|&a, &b| {
                let ea = &self.edges[a];
                let eb = &self.edges[b];
                ea.priority.cmp(&eb.priority).then_with(|| ea.id.cmp(&eb.id))
            });
        }

        self.compute_fan_outs()?;

        for node in &mut self.nodes {
            if let Some(sub) = node.sub_graph.as_mut() {
                sub.compile().map_err(|e| {
                    CoreError::InvalidGraph(format!("sub-graph of node '{}': {e}", node.id))
                })?;
            }
        }

        Ok(())
    }

    /// Identify parallel fan-out groups and their convergence node.
    ///
    /// A single parallel edge degrades to a sequential edge (no group). Two
    /// or more require a common descendant; the join is the candidate with
    /// the smallest maximum BFS distance from the branch entries, node id
    /// breaking ties.
    fn compute_fan_outs(&mut self) -> Result<()> {
        let sources: Vec<NodeId> = self.out_edges.keys().cloned().collect();
        for source in sources {
            let parallel: Vec<usize> = self.out_edges[&source]
                .iter()
                .copied()
                .filter(|&i| self.edges[i].parallel)
                .collect();
            if parallel.len() < 2 {
                continue;
            }

            let branches: Vec<(String, NodeId)> = parallel
                .iter()
                .map(|&i| (self.edges[i].id.clone(), self.edges[i].target.clone()))
                .collect();

            let distances: Vec<HashMap<NodeId, u32>> = branches
                .iter()
                .map(|(_, entry)| self.bfs_distances(entry))
                .collect();

            let mut candidates: Vec<(u32, NodeId)> = Vec::new();
            for (node, d0) in &distances[0] {
                let mut max_dist = *d0;
                let mut shared = true;
                for dist in &distances[1..] {
                    match dist.get(node) {
                        Some(d) => max_dist = max_dist.max(*d),
                        None => {
                            shared = false;
                            break;
                        }
                    }
                }
                if shared {
                    candidates.push((max_dist, node.clone()));
                }
            }
            candidates.sort();

            let Some((_, join)) = candidates.into_iter().next() else {
                return Err(CoreError::InvalidGraph(format!(
                    "parallel fan-out from '{source}' has no convergence node"
                )));
            };
            self.fan_outs.insert(source, FanOut { branches, join });
        }
        Ok(())
    }

    /// BFS distances from `start` (inclusive, distance 0).
    fn bfs_distances(&self, start: &NodeId) -> HashMap<NodeId, u32> {
        let mut dist = HashMap::new();
        let mut queue = VecDeque::new();
        dist.insert(start.clone(), 0);
        queue.push_back(start.clone());
        while let Some(node) = queue.pop_front() {
            let d = dist[&node];
            for edge in self.outgoing(&node) {
                if !dist.contains_key(&edge.target) {
                    dist.insert(edge.target.clone(), d + 1);
                    queue.push_back(edge.target.clone());
                }
            }
        }
        dist
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.node_index.get(id).map(|&i| &self.nodes[i])
    }

    /// Outgoing edges of `id` in evaluation order.
    pub fn outgoing(&self, id: &str) -> impl Iterator<Item = &EdgeSpec> {
        self.out_edges
            .get(id)
            .into_iter()
            .flatten()
            .map(|&i| &self.edges[i])
    }

    pub fn is_terminal(&self, id: &str) -> bool {
        self.terminals.contains(id)
    }

    pub fn fan_out(&self, id: &str) -> Option<&FanOut> {
        self.fan_outs.get(id)
    }

    /// Resolve a named entry point, falling back to the default entry.
    pub fn entry_for(&self, entry_point: Option<&str>) -> Result<&NodeId> {
        match entry_point {
            None => Ok(&self.entry_node),
            Some(name) => self.entry_points.get(name).ok_or_else(|| {
                CoreError::InvalidGraph(format!("unknown entry point '{name}'"))
            }),
        }
    }
}
