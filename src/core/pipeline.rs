//! Pipeline graph model
//!
//! A pipeline is an ordered list of nodes plus the directed connections
//! between them. Editing operations keep each node's `dependencies` in step
//! with the connection list; the graph is allowed to be temporarily invalid
//! (cycles, orphans) while it is being edited; `compute_stages` and the
//! validator decide whether it can run.

use crate::core::error::{PipelineError, Result};
use crate::core::node::{Node, NodeType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use uuid::Uuid;

/// Default global pipeline timeout in seconds
pub const DEFAULT_PIPELINE_TIMEOUT_SECS: i64 = 3600;

/// Event that may start a pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Manual,
    Push,
    PullRequest,
    Schedule,
    Webhook,
}

/// Pipeline-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub repository: Option<String>,

    #[serde(default)]
    pub triggers: Vec<TriggerType>,

    /// Variables visible to every node
    #[serde(default)]
    pub environment_variables: HashMap<String, String>,

    /// Names of secrets resolved by the host environment
    #[serde(default)]
    pub secrets: Vec<String>,

    #[serde(default)]
    pub notifications: HashMap<String, Value>,

    #[serde(default = "default_pipeline_timeout")]
    pub timeout: i64,
}

fn default_pipeline_timeout() -> i64 {
    DEFAULT_PIPELINE_TIMEOUT_SECS
}

/// Directed edge: `to` depends on `from`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    pub to: String,
}

/// A pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub config: PipelineConfig,

    #[serde(default)]
    pub nodes: Vec<Node>,

    #[serde(default)]
    pub connections: Vec<Connection>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Incremented on every mutation
    #[serde(default = "initial_version")]
    pub version: u64,
}

fn initial_version() -> u64 {
    1
}

impl Pipeline {
    /// Create an empty pipeline with a fresh id
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            config: PipelineConfig {
                id: Uuid::new_v4().to_string(),
                name: name.into(),
                description: description.into(),
                repository: None,
                triggers: vec![TriggerType::Manual],
                environment_variables: HashMap::new(),
                secrets: Vec::new(),
                notifications: HashMap::new(),
                timeout: DEFAULT_PIPELINE_TIMEOUT_SECS,
            },
            nodes: Vec::new(),
            connections: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Parse a pipeline document
    ///
    /// Documents may describe edges through `connections`, through node
    /// `dependencies`, or both; the two are merged so that each node's
    /// dependency list mirrors its incoming connections.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut pipeline: Pipeline = serde_json::from_str(json)?;
        pipeline.reconcile_edges();
        Ok(pipeline)
    }

    /// Load a pipeline document from disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PipelineError::Io(format!("failed to read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json(&content)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.node(id).is_some()
    }

    /// Ids of nodes that depend directly on `id`
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.connections
            .iter()
            .filter(|c| c.from == id)
            .map(|c| c.to.as_str())
            .collect()
    }

    /// Count of outgoing connections from `id`
    pub fn out_degree(&self, id: &str) -> usize {
        self.connections.iter().filter(|c| c.from == id).count()
    }

    pub fn source_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Source)
            .collect()
    }

    /// Append a node and return its id
    ///
    /// Dependencies are derived from connections, so any preset on the
    /// node are discarded.
    pub fn add_node(&mut self, mut node: Node) -> Result<String> {
        if self.contains(&node.id) {
            return Err(PipelineError::Structural(format!(
                "node '{}' already exists",
                node.id
            )));
        }
        node.dependencies.clear();
        let id = node.id.clone();
        self.nodes.push(node);
        self.touch();
        Ok(id)
    }

    /// Remove a node together with every connection and dependency that
    /// references it. Returns false when the node does not exist.
    pub fn remove_node(&mut self, id: &str) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| n.id != id);
        if self.nodes.len() == before {
            return false;
        }

        self.connections.retain(|c| c.from != id && c.to != id);
        for node in &mut self.nodes {
            node.dependencies.retain(|d| d != id);
        }
        self.touch();
        true
    }

    /// Apply an edit to a node's settings
    ///
    /// Id and dependencies are owned by the graph and are restored after
    /// the closure runs.
    pub fn update_node<F>(&mut self, id: &str, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Node),
    {
        let node = self
            .nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| PipelineError::Structural(format!("unknown node '{}'", id)))?;

        let original_id = node.id.clone();
        let original_deps = node.dependencies.clone();
        edit(node);
        node.id = original_id;
        node.dependencies = original_deps;
        self.touch();
        Ok(())
    }

    /// Add an edge `from -> to`
    pub fn connect(&mut self, from: &str, to: &str) -> Result<()> {
        for id in [from, to] {
            if !self.contains(id) {
                return Err(PipelineError::Structural(format!(
                    "cannot connect {} -> {}: unknown node '{}'",
                    from, to, id
                )));
            }
        }
        if self.connections.iter().any(|c| c.from == from && c.to == to) {
            return Err(PipelineError::Structural(format!(
                "connection {} -> {} already exists",
                from, to
            )));
        }

        self.connections.push(Connection {
            from: from.to_string(),
            to: to.to_string(),
        });
        if let Some(target) = self.nodes.iter_mut().find(|n| n.id == to) {
            if !target.dependencies.iter().any(|d| d == from) {
                target.dependencies.push(from.to_string());
            }
        }
        self.touch();
        Ok(())
    }

    /// Remove the edge `from -> to`. Returns false when it does not exist.
    pub fn disconnect(&mut self, from: &str, to: &str) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| !(c.from == from && c.to == to));
        if self.connections.len() == before {
            return false;
        }

        if let Some(target) = self.nodes.iter_mut().find(|n| n.id == to) {
            target.dependencies.retain(|d| d != from);
        }
        self.touch();
        true
    }

    /// Deep copy under a new name with fresh ids everywhere
    pub fn clone_as(&self, new_name: impl Into<String>) -> Pipeline {
        let id_map: HashMap<&str, String> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), Uuid::new_v4().to_string()))
            .collect();
        let remap = |id: &str| id_map.get(id).cloned().unwrap_or_else(|| id.to_string());

        let nodes = self
            .nodes
            .iter()
            .map(|n| {
                let mut copy = n.clone();
                copy.id = remap(&n.id);
                copy.dependencies = n.dependencies.iter().map(|d| remap(d)).collect();
                copy
            })
            .collect();

        let connections = self
            .connections
            .iter()
            .map(|c| Connection {
                from: remap(&c.from),
                to: remap(&c.to),
            })
            .collect();

        let now = Utc::now();
        let mut config = self.config.clone();
        config.id = Uuid::new_v4().to_string();
        config.name = new_name.into();
        config.description = format!("Copy of {}", self.config.name);

        Pipeline {
            config,
            nodes,
            connections,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Connections whose endpoints are not both present
    pub fn dangling_connections(&self) -> Vec<&Connection> {
        self.connections
            .iter()
            .filter(|c| !self.contains(&c.from) || !self.contains(&c.to))
            .collect()
    }

    /// Node ids that appear more than once
    pub fn duplicate_node_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) && !duplicates.contains(&node.id) {
                duplicates.push(node.id.clone());
            }
        }
        duplicates
    }

    /// Level the graph into stages with Kahn's algorithm
    ///
    /// Each stage holds the nodes whose dependencies all lie in earlier
    /// stages, in pipeline order. A cycle leaves nodes unstaged and is
    /// reported as a structural error naming them.
    pub fn compute_stages(&self) -> Result<Vec<Vec<String>>> {
        if let Some(id) = self.duplicate_node_ids().first() {
            return Err(PipelineError::Structural(format!(
                "duplicate node id '{}'",
                id
            )));
        }
        if let Some(conn) = self.dangling_connections().first() {
            return Err(PipelineError::Structural(format!(
                "connection {} -> {} references a missing node",
                conn.from, conn.to
            )));
        }

        let order: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        let adjacency = self.adjacency();
        for targets in adjacency.values() {
            for to in targets {
                if let Some(d) = in_degree.get_mut(to) {
                    *d += 1;
                }
            }
        }

        let mut stages: Vec<Vec<String>> = Vec::new();
        let mut current: Vec<&str> = self
            .nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        let mut placed = 0;

        while !current.is_empty() {
            current.sort_by_key(|id| order.get(id).copied().unwrap_or(usize::MAX));
            let mut next = Vec::new();
            for id in &current {
                for to in adjacency.get(id).into_iter().flatten() {
                    if let Some(d) = in_degree.get_mut(to) {
                        *d -= 1;
                        if *d == 0 {
                            next.push(*to);
                        }
                    }
                }
            }
            placed += current.len();
            stages.push(current.iter().map(|s| s.to_string()).collect());
            current = next;
        }

        if placed < self.nodes.len() {
            let residual: Vec<&str> = self
                .nodes
                .iter()
                .map(|n| n.id.as_str())
                .filter(|id| in_degree.get(id).is_some_and(|d| *d > 0))
                .collect();
            return Err(PipelineError::Structural(format!(
                "cycle detected; unstaged nodes: {}",
                residual.join(", ")
            )));
        }

        Ok(stages)
    }

    /// Depth-first search for a back edge
    pub fn has_cycle(&self) -> bool {
        let adjacency = self.adjacency();
        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();

        self.nodes.iter().any(|node| {
            !visited.contains(node.id.as_str())
                && Self::dfs_cycle(&node.id, &adjacency, &mut visited, &mut recursion_stack)
        })
    }

    fn dfs_cycle<'a>(
        id: &'a str,
        adjacency: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        recursion_stack: &mut HashSet<&'a str>,
    ) -> bool {
        visited.insert(id);
        recursion_stack.insert(id);

        for next in adjacency.get(id).into_iter().flatten() {
            if recursion_stack.contains(next) {
                return true;
            }
            if !visited.contains(next) && Self::dfs_cycle(next, adjacency, visited, recursion_stack)
            {
                return true;
            }
        }

        recursion_stack.remove(id);
        false
    }

    /// Nodes unreachable (ignoring direction) from any Source node, or from
    /// the first node when there is no Source
    pub fn find_disconnected_nodes(&self) -> Vec<String> {
        if self.nodes.is_empty() {
            return Vec::new();
        }

        let mut neighbours: HashMap<&str, Vec<&str>> = HashMap::new();
        for conn in &self.connections {
            neighbours.entry(conn.from.as_str()).or_default().push(conn.to.as_str());
            neighbours.entry(conn.to.as_str()).or_default().push(conn.from.as_str());
        }

        let mut starts: Vec<&str> = self.source_nodes().iter().map(|n| n.id.as_str()).collect();
        if starts.is_empty() {
            starts.push(self.nodes[0].id.as_str());
        }

        let mut reached: HashSet<&str> = starts.iter().copied().collect();
        let mut queue: VecDeque<&str> = starts.into_iter().collect();
        while let Some(id) = queue.pop_front() {
            for next in neighbours.get(id).into_iter().flatten() {
                if reached.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        self.nodes
            .iter()
            .filter(|n| !reached.contains(n.id.as_str()))
            .map(|n| n.id.clone())
            .collect()
    }

    /// Outgoing edges per node, duplicates collapsed, in connection order
    fn adjacency(&self) -> HashMap<&str, Vec<&str>> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut seen = HashSet::new();
        for conn in &self.connections {
            if seen.insert((conn.from.as_str(), conn.to.as_str())) {
                adjacency
                    .entry(conn.from.as_str())
                    .or_default()
                    .push(conn.to.as_str());
            }
        }
        adjacency
    }

    fn reconcile_edges(&mut self) {
        let mut edges: Vec<Connection> = Vec::new();
        for conn in self.connections.drain(..) {
            if !edges.contains(&conn) {
                edges.push(conn);
            }
        }
        for node in &self.nodes {
            for dep in &node.dependencies {
                let conn = Connection {
                    from: dep.clone(),
                    to: node.id.clone(),
                };
                if !edges.contains(&conn) {
                    edges.push(conn);
                }
            }
        }
        for node in &mut self.nodes {
            node.dependencies = edges
                .iter()
                .filter(|c| c.to == node.id)
                .map(|c| c.from.clone())
                .collect();
        }
        self.connections = edges;
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}
