use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::graph::{Edge, GraphNode};
use crate::types::{BatchId, NodeId};

/// Iterator values injected into one input of a node being run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IteratorInput {
    pub node_id: NodeId,
    pub input_key: String,
    pub iterator_id: NodeId,
    pub values: Vec<serde_json::Value>,
}

/// Everything the execution service needs to create a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub node_ids: Vec<NodeId>,
    #[serde(default)]
    pub iterator_inputs: Vec<IteratorInput>,
    /// Number of recipe runs the cross product expands to.
    pub combinations: u64,
}

/// Remote execution service: creates and cancels batches.
pub trait RunSubmitter: Send + Sync + 'static {
    /// Submit a run. `Ok(None)` means the service declined without an error.
    fn submit_run(&self, request: RunRequest) -> BoxFuture<'_, Result<Option<BatchId>>>;

    /// Ask the service to stop every recipe run of a batch.
    fn cancel_batch(&self, batch_id: &BatchId) -> BoxFuture<'_, Result<()>>;
}

/// Projects the cost of running nodes over a number of combinations.
pub trait CostEstimator: Send + Sync + 'static {
    fn estimate_cost(&self, nodes: &[GraphNode], combinations: u64) -> BoxFuture<'_, Result<f64>>;
}

/// Read access to the graph being edited.
pub trait GraphSource: Send + Sync + 'static {
    fn list_nodes(&self) -> Vec<GraphNode>;

    fn list_edges(&self) -> Vec<Edge>;

    fn node(&self, id: &NodeId) -> Option<GraphNode> {
        self.list_nodes().into_iter().find(|n| &n.id == id)
    }
}

/// Key/value persistence that survives restarts.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    fn set(&self, key: &str, value: serde_json::Value) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}
