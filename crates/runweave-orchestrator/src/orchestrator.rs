use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, info, warn};

use runweave_core::error::{Result, RunweaveError};
use runweave_core::event::{EventBus, NodeEventBus, Subscription};
use runweave_core::graph::GraphNode;
use runweave_core::traits::{CostEstimator, GraphSource, RunRequest, RunSubmitter};
use runweave_core::types::{BatchId, NodeId, OrchestratorEvent, RunEvent, RunUpdate};

use crate::resolver::{
    combination_count, iterator_inputs, resolve_preceding_iterators, IteratorBinding,
};
use crate::store::RunStateStore;

/// Drives submissions and cancellations, and fans applied lifecycle events
/// out to node subscribers and the broadcast bus.
pub struct RunOrchestrator {
    store: Arc<RunStateStore>,
    node_bus: NodeEventBus,
    event_bus: Arc<EventBus>,
    submitter: Arc<dyn RunSubmitter>,
    estimator: Arc<dyn CostEstimator>,
    graph: Arc<dyn GraphSource>,
    initializing: Mutex<HashSet<NodeId>>,
}

/// Clears a node's initializing flag when submission ends, however it ends.
struct InitializingGuard<'a> {
    set: &'a Mutex<HashSet<NodeId>>,
    node_id: NodeId,
}

impl Drop for InitializingGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.node_id);
    }
}

impl RunOrchestrator {
    pub fn new(
        submitter: Arc<dyn RunSubmitter>,
        estimator: Arc<dyn CostEstimator>,
        graph: Arc<dyn GraphSource>,
    ) -> Self {
        Self {
            store: Arc::new(RunStateStore::new()),
            node_bus: NodeEventBus::new(),
            event_bus: Arc::new(EventBus::default()),
            submitter,
            estimator,
            graph,
            initializing: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn store(&self) -> &Arc<RunStateStore> {
        &self.store
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn graph(&self) -> &Arc<dyn GraphSource> {
        &self.graph
    }

    /// Iterators feeding `node_id` in the current graph.
    pub fn preceding_iterators(&self, node_id: &NodeId) -> Option<Vec<IteratorBinding>> {
        resolve_preceding_iterators(node_id, &self.graph.list_nodes(), &self.graph.list_edges())
    }

    /// Build the submission request for running `node_id`.
    pub fn plan(&self, node_id: &NodeId) -> Result<RunRequest> {
        if self.graph.node(node_id).is_none() {
            return Err(RunweaveError::NodeNotFound(node_id.to_string()));
        }
        let bindings = self.preceding_iterators(node_id).unwrap_or_default();
        Ok(RunRequest {
            node_ids: vec![node_id.clone()],
            iterator_inputs: iterator_inputs(&bindings),
            combinations: combination_count(&bindings),
        })
    }

    /// True while a submission for `node_id` is awaiting its batch id.
    pub fn is_initializing(&self, node_id: &NodeId) -> bool {
        self.initializing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(node_id)
    }

    /// Submit a run of `node_id` over every iterator combination.
    pub async fn run_node(&self, node_id: &NodeId) -> Result<BatchId> {
        let request = self.plan(node_id)?;
        let combinations = request.combinations;

        self.initializing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id.clone());
        let _guard = InitializingGuard {
            set: &self.initializing,
            node_id: node_id.clone(),
        };

        let node_ids = request.node_ids.clone();
        let outcome = match self.submitter.submit_run(request).await {
            Ok(Some(batch_id)) => Ok(batch_id),
            Ok(None) => Err(RunweaveError::NoBatch),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(batch_id) => {
                self.store.register_batch(batch_id.clone(), node_ids.clone());
                info!(batch_id = %batch_id, node_id = %node_id, combinations, "Batch submitted");
                self.event_bus.publish(OrchestratorEvent::BatchSubmitted {
                    batch_id: batch_id.clone(),
                    node_ids,
                    combinations,
                });
                Ok(batch_id)
            }
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "Run submission failed");
                self.event_bus.publish(OrchestratorEvent::SubmissionFailed {
                    node_ids,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Apply a lifecycle event and notify subscribers of the affected node.
    ///
    /// Returns the resulting update, or `None` if the event was discarded.
    pub fn apply_event(&self, event: &RunEvent) -> Option<RunUpdate> {
        let Some(applied) = self.store.apply(event) else {
            debug!(
                batch_id = %event.batch_id,
                node_run_id = %event.node_run_id,
                status = %event.status,
                "Lifecycle event discarded"
            );
            return None;
        };

        self.publish_update(&applied.update);
        if let Some(status) = applied.settled {
            info!(batch_id = %event.batch_id, ?status, "Batch settled");
            self.event_bus.publish(OrchestratorEvent::BatchSettled {
                batch_id: event.batch_id.clone(),
                status,
            });
        }
        Some(applied.update)
    }

    fn publish_update(&self, update: &RunUpdate) {
        self.event_bus.publish(OrchestratorEvent::NodeRunUpdated {
            batch_id: update.batch_id.clone(),
            node_id: update.node_run.node_id.clone(),
            node_run_id: update.node_run.id.clone(),
            status: update.node_run.status,
        });
        self.node_bus.publish(update);
    }

    /// Stop every recipe run of a batch.
    ///
    /// Returns `Ok(false)` when there was nothing to stop. A failed remote
    /// cancel leaves local state untouched.
    pub async fn stop_batch(&self, batch_id: &BatchId) -> Result<bool> {
        let Some(batch) = self.store.batch(batch_id) else {
            warn!(batch_id = %batch_id, "Stop requested for unknown batch");
            return Ok(false);
        };
        if !batch.is_active() {
            debug!(batch_id = %batch_id, "Stop requested for settled batch");
            return Ok(false);
        }

        if let Err(e) = self.submitter.cancel_batch(batch_id).await {
            error!(batch_id = %batch_id, error = %e, "Batch cancel failed");
            return Err(RunweaveError::Cancel {
                batch_id: batch_id.to_string(),
                message: e.to_string(),
            });
        }

        let updates = self.store.cancel_batch_locally(batch_id).unwrap_or_default();
        info!(batch_id = %batch_id, node_runs = updates.len(), "Batch canceled");
        for update in &updates {
            self.publish_update(update);
        }
        self.event_bus.publish(OrchestratorEvent::BatchCanceled {
            batch_id: batch_id.clone(),
        });
        if let Some(batch) = self.store.batch(batch_id) {
            self.event_bus.publish(OrchestratorEvent::BatchSettled {
                batch_id: batch_id.clone(),
                status: batch.status(),
            });
        }
        Ok(true)
    }

    /// Projected cost of running `nodes` over `combinations`.
    pub async fn batch_cost(&self, nodes: &[GraphNode], combinations: u64) -> Result<f64> {
        self.estimator.estimate_cost(nodes, combinations).await
    }

    /// Register `callback` for updates about `node_id`.
    ///
    /// Node runs of this node in still-active batches are replayed to the
    /// callback right away, so a subscriber mounted mid-run catches up.
    pub fn subscribe<F>(&self, node_id: NodeId, callback: F) -> Subscription
    where
        F: Fn(&RunUpdate) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let registered = callback.clone();
        let subscription = self
            .node_bus
            .subscribe(node_id.clone(), move |update| registered(update));

        for batch in self.store.running_batches_for_node(&node_id) {
            for recipe_run in &batch.recipe_runs {
                for node_run in recipe_run.node_runs.iter().filter(|nr| nr.node_id == node_id) {
                    callback(&RunUpdate {
                        batch_id: batch.id.clone(),
                        recipe_run: recipe_run.clone(),
                        node_run: node_run.clone(),
                    });
                }
            }
        }
        subscription
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use runweave_core::types::{BatchStatus, RunStatus};
    use runweave_test_utils::{scenario_graph, MockCostEstimator, MockSubmitter};

    fn orchestrator(submitter: Arc<MockSubmitter>) -> RunOrchestrator {
        RunOrchestrator::new(
            submitter,
            Arc::new(MockCostEstimator::fixed(12.5)),
            Arc::new(scenario_graph()),
        )
    }

    #[tokio::test]
    async fn run_node_submits_cross_product() {
        let submitter = Arc::new(MockSubmitter::returning("b1"));
        let orch = orchestrator(submitter.clone());
        let mut rx = orch.event_bus().subscribe();

        let batch_id = orch.run_node(&"a".into()).await.unwrap();
        assert_eq!(batch_id, BatchId::from("b1"));
        assert!(!orch.is_initializing(&"a".into()));

        let requests = submitter.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].combinations, 6);
        assert_eq!(requests[0].iterator_inputs.len(), 2);
        assert!(orch.store().batch(&batch_id).is_some());

        match rx.recv().await.unwrap() {
            OrchestratorEvent::BatchSubmitted { combinations, .. } => assert_eq!(combinations, 6),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_batch_id_is_an_error() {
        let submitter = Arc::new(MockSubmitter::declining());
        let orch = orchestrator(submitter);
        let err = orch.run_node(&"a".into()).await.unwrap_err();
        assert!(matches!(err, RunweaveError::NoBatch));
        assert!(orch.store().batches().is_empty());
        assert!(!orch.is_initializing(&"a".into()));
    }

    #[tokio::test]
    async fn unknown_node_is_rejected_before_submission() {
        let submitter = Arc::new(MockSubmitter::returning("b1"));
        let orch = orchestrator(submitter.clone());
        let err = orch.run_node(&"ghost".into()).await.unwrap_err();
        assert!(matches!(err, RunweaveError::NodeNotFound(_)));
        assert!(submitter.requests().is_empty());
    }

    #[tokio::test]
    async fn stop_batch_cancels_locally_after_remote() {
        let submitter = Arc::new(MockSubmitter::returning("b1"));
        let orch = orchestrator(submitter.clone());
        orch.apply_event(&RunEvent::new("b1", "r1", "n1", "a", RunStatus::Running));

        assert!(orch.stop_batch(&"b1".into()).await.unwrap());
        assert_eq!(submitter.cancel_count(), 1);
        let batch = orch.store().batch(&"b1".into()).unwrap();
        assert_eq!(batch.status(), BatchStatus::Canceled);

        // Settled now: a second stop is a no-op and does not reach the service.
        assert!(!orch.stop_batch(&"b1".into()).await.unwrap());
        assert!(!orch.stop_batch(&"unknown".into()).await.unwrap());
        assert_eq!(submitter.cancel_count(), 1);
    }

    #[tokio::test]
    async fn failed_remote_cancel_leaves_state() {
        let submitter = Arc::new(MockSubmitter::returning("b1").failing_cancel());
        let orch = orchestrator(submitter);
        orch.apply_event(&RunEvent::new("b1", "r1", "n1", "a", RunStatus::Running));

        let err = orch.stop_batch(&"b1".into()).await.unwrap_err();
        assert!(matches!(err, RunweaveError::Cancel { .. }));
        let batch = orch.store().batch(&"b1".into()).unwrap();
        assert!(batch.is_active());
    }

    #[test]
    fn subscribe_replays_active_node_runs() {
        let orch = orchestrator(Arc::new(MockSubmitter::returning("b1")));
        orch.store().register_batch("b0".into(), vec!["a".into()]);
        orch.apply_event(&RunEvent::new("b1", "r1", "n1", "a", RunStatus::Running));
        orch.apply_event(&RunEvent::new("b1", "r2", "n2", "a", RunStatus::Pending));
        orch.apply_event(&RunEvent::new("b1", "r2", "n3", "b", RunStatus::Pending));
        orch.apply_event(&RunEvent::new("b0", "r0", "n0", "a", RunStatus::Completed));

        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let sub = orch.subscribe("a".into(), move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        orch.apply_event(&RunEvent::new("b1", "r1", "n1", "a", RunStatus::Completed));
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        drop(sub);
        orch.apply_event(&RunEvent::new("b1", "r2", "n2", "a", RunStatus::Completed));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn settling_is_broadcast_once() {
        let orch = orchestrator(Arc::new(MockSubmitter::returning("b1")));
        orch.store().register_batch("b1".into(), vec!["a".into()]);
        let mut rx = orch.event_bus().subscribe();
        orch.apply_event(&RunEvent::new("b1", "r1", "n1", "a", RunStatus::Running));
        orch.apply_event(&RunEvent::new("b1", "r1", "n1", "a", RunStatus::Completed));
        orch.apply_event(&RunEvent::new("b1", "r1", "n1", "a", RunStatus::Completed));

        let mut settled = 0;
        while let Ok(event) = rx.try_recv() {
            if let OrchestratorEvent::BatchSettled { status, .. } = event {
                assert_eq!(status, BatchStatus::Completed);
                settled += 1;
            }
        }
        assert_eq!(settled, 1);
    }

    #[tokio::test]
    async fn batch_cost_delegates() {
        let orch = orchestrator(Arc::new(MockSubmitter::returning("b1")));
        let node = orch.graph().node(&"a".into()).unwrap();
        assert_eq!(orch.batch_cost(&[node], 6).await.unwrap(), 12.5);
    }
}
