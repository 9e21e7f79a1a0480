//! Mocks and fixtures shared by the Runweave crates' tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use futures::future::BoxFuture;
use serde_json::json;

use runweave_core::error::{Result, RunweaveError};
use runweave_core::graph::{Edge, GraphNode, StaticGraph};
use runweave_core::traits::{CostEstimator, RunRequest, RunSubmitter};
use runweave_core::types::{BatchId, RunEvent, RunStatus};

enum SubmitBehavior {
    Return(BatchId),
    Decline,
    Fail(String),
}

/// Execution service double. Records every request it receives.
pub struct MockSubmitter {
    behavior: SubmitBehavior,
    fail_cancel: bool,
    requests: Mutex<Vec<RunRequest>>,
    cancels: AtomicUsize,
}

impl MockSubmitter {
    fn with(behavior: SubmitBehavior) -> Self {
        Self {
            behavior,
            fail_cancel: false,
            requests: Mutex::new(Vec::new()),
            cancels: AtomicUsize::new(0),
        }
    }

    /// Every submission succeeds with `batch_id`.
    pub fn returning(batch_id: &str) -> Self {
        Self::with(SubmitBehavior::Return(batch_id.into()))
    }

    /// Submissions resolve without a batch id.
    pub fn declining() -> Self {
        Self::with(SubmitBehavior::Decline)
    }

    pub fn failing(message: &str) -> Self {
        Self::with(SubmitBehavior::Fail(message.to_string()))
    }

    pub fn failing_cancel(mut self) -> Self {
        self.fail_cancel = true;
        self
    }

    pub fn requests(&self) -> Vec<RunRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl RunSubmitter for MockSubmitter {
    fn submit_run(&self, request: RunRequest) -> BoxFuture<'_, Result<Option<BatchId>>> {
        Box::pin(async move {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request);
            match &self.behavior {
                SubmitBehavior::Return(id) => Ok(Some(id.clone())),
                SubmitBehavior::Decline => Ok(None),
                SubmitBehavior::Fail(message) => Err(RunweaveError::Submission(message.clone())),
            }
        })
    }

    fn cancel_batch(&self, batch_id: &BatchId) -> BoxFuture<'_, Result<()>> {
        let batch_id = batch_id.clone();
        Box::pin(async move {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            if self.fail_cancel {
                Err(RunweaveError::Cancel {
                    batch_id: batch_id.to_string(),
                    message: "service refused".into(),
                })
            } else {
                Ok(())
            }
        })
    }
}

/// Cost estimator double returning a fixed cost or a fixed error.
pub struct MockCostEstimator {
    cost: std::result::Result<f64, String>,
    calls: AtomicUsize,
    last_combinations: Mutex<Option<u64>>,
}

impl MockCostEstimator {
    pub fn fixed(cost: f64) -> Self {
        Self {
            cost: Ok(cost),
            calls: AtomicUsize::new(0),
            last_combinations: Mutex::new(None),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            cost: Err(message.to_string()),
            calls: AtomicUsize::new(0),
            last_combinations: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_combinations(&self) -> Option<u64> {
        *self
            .last_combinations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl CostEstimator for MockCostEstimator {
    fn estimate_cost(&self, _nodes: &[GraphNode], combinations: u64) -> BoxFuture<'_, Result<f64>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self
                .last_combinations
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(combinations);
            self.cost
                .clone()
                .map_err(RunweaveError::CostEstimate)
        })
    }
}

/// Node `a` fed by iterator `i1` (3 values, through router `r1`) on its
/// `prompt` input and by iterator `i2` (2 values) on `seed`. Node `b`
/// consumes `a`'s output.
pub fn scenario_graph() -> StaticGraph {
    StaticGraph::new(
        vec![
            GraphNode::iterator("i1", vec![json!("cat"), json!("dog"), json!("fox")]),
            GraphNode::iterator("i2", vec![json!(1), json!(2)]),
            GraphNode::router("r1"),
            GraphNode::model("a", "flux", Some(4.0)),
            GraphNode::model("b", "upscale", Some(1.0)),
        ],
        vec![
            Edge::new("i1", "r1"),
            Edge::into_input("r1", "a", "prompt"),
            Edge::into_input("i2", "a", "seed"),
            Edge::into_input("a", "b", "image"),
        ],
    )
}

/// A node run's full life: PENDING, RUNNING, then `terminal`.
pub fn lifecycle(
    batch: &str,
    recipe: &str,
    node_run: &str,
    node: &str,
    terminal: RunStatus,
) -> Vec<RunEvent> {
    vec![
        RunEvent::new(batch, recipe, node_run, node, RunStatus::Pending),
        RunEvent::new(batch, recipe, node_run, node, RunStatus::Running).with_progress(50),
        RunEvent::new(batch, recipe, node_run, node, terminal),
    ]
}

/// Write `content` to a temp `runweave.toml`; keep the guard alive while the
/// path is in use.
pub fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("runweave.toml");
    std::fs::write(&path, content).expect("write config");
    (dir, path)
}
