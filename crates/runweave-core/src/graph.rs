use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunweaveError};
use crate::traits::GraphSource;
use crate::types::NodeId;

/// Marker separating the handle prefix from the consumed input key.
pub const INPUT_HANDLE_MARKER: &str = "-input-";

/// What a graph node does.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// A remote model call.
    Model,
    /// Supplies a list of values to iterate over.
    Iterator {
        #[serde(default)]
        values: Vec<serde_json::Value>,
    },
    /// Forwards its single input unchanged.
    Router,
    Export,
    #[default]
    #[serde(other)]
    Other,
}

/// Model attached to a node, with its per-run price if known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub price: Option<f64>,
}

/// A node of the generation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: NodeId,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<ModelInfo>,
}

impl GraphNode {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            name: None,
            model: None,
        }
    }

    pub fn model(id: impl Into<NodeId>, model_name: impl Into<String>, price: Option<f64>) -> Self {
        Self {
            model: Some(ModelInfo {
                name: model_name.into(),
                price,
            }),
            ..Self::new(id, NodeKind::Model)
        }
    }

    pub fn iterator(id: impl Into<NodeId>, values: Vec<serde_json::Value>) -> Self {
        Self::new(id, NodeKind::Iterator { values })
    }

    pub fn router(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Router)
    }

    pub fn is_router(&self) -> bool {
        matches!(self.kind, NodeKind::Router)
    }

    pub fn is_iterator(&self) -> bool {
        matches!(self.kind, NodeKind::Iterator { .. })
    }

    pub fn is_model(&self) -> bool {
        matches!(self.kind, NodeKind::Model)
    }

    /// Values of an iterator node; empty for every other kind.
    pub fn iterator_values(&self) -> &[serde_json::Value] {
        match &self.kind {
            NodeKind::Iterator { values } => values,
            _ => &[],
        }
    }
}

/// A directed connection between two node handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default)]
    pub source_handle: Option<String>,
    #[serde(default)]
    pub target_handle: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
        }
    }

    /// Edge into the `key` input of `target`, using the `<target>-input-<key>` handle naming.
    pub fn into_input(source: impl Into<NodeId>, target: impl Into<NodeId>, key: &str) -> Self {
        let target = target.into();
        let handle = format!("{}{}{}", target, INPUT_HANDLE_MARKER, key);
        Self {
            target_handle: Some(handle),
            ..Self::new(source, target)
        }
    }

    /// Input key encoded in the target handle, if any.
    pub fn input_key(&self) -> Option<&str> {
        self.target_handle
            .as_deref()?
            .split(INPUT_HANDLE_MARKER)
            .nth(1)
            .filter(|key| !key.is_empty())
    }
}

/// In-memory graph snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticGraph {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl StaticGraph {
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    /// Load a graph from a JSON file with `nodes` and `edges` arrays.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RunweaveError::Graph(format!("{}: {}", path.display(), e)))?;
        let graph: Self = serde_json::from_str(&content)?;
        tracing::debug!(
            path = %path.display(),
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            "Graph loaded"
        );
        Ok(graph)
    }

    pub fn node(&self, id: &NodeId) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }
}

impl GraphSource for StaticGraph {
    fn list_nodes(&self) -> Vec<GraphNode> {
        self.nodes.clone()
    }

    fn list_edges(&self) -> Vec<Edge> {
        self.edges.clone()
    }
}
