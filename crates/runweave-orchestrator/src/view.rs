//! Per-node run view.
//!
//! Mounting a [`NodeRunView`] subscribes it to its node's updates; dropping
//! it unsubscribes. The view owns only derived state: the dedupe ledger, the
//! display status, the ordered result sequence and the last error.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, warn};

use runweave_core::event::Subscription;
use runweave_core::types::{Batch, BatchId, NodeId, ResultItem, RunStatus, RunUpdate};

use crate::orchestrator::RunOrchestrator;
use crate::reducer::{reduce, Effect, Ledger};
use crate::sequencer::insertion_index;

/// Simplified state of a node's run button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonStatus {
    Initial,
    Initializing,
    Pending,
    Running,
}

#[derive(Debug, Default)]
struct ViewState {
    ledger: Ledger,
    status: Option<RunStatus>,
    results: Vec<ResultItem>,
    error: Option<String>,
}

impl ViewState {
    fn on_update(&mut self, node_id: &NodeId, update: &RunUpdate) {
        let reduction = reduce(&mut self.ledger, node_id, update);
        if let Some(status) = reduction.display {
            self.status = Some(status);
        }
        for effect in reduction.effects {
            match effect {
                Effect::Success {
                    node_run,
                    recipe_run,
                } => {
                    if node_run.result.is_empty() {
                        continue;
                    }
                    let index = insertion_index(
                        &self.results,
                        &recipe_run.batch_id,
                        recipe_run.run_index_in_batch,
                        recipe_run.input_index,
                    );
                    let items = node_run.result.into_iter().map(|payload| ResultItem {
                        batch_id: recipe_run.batch_id.clone(),
                        order: recipe_run.run_index_in_batch,
                        secondary_order: recipe_run.input_index,
                        payload,
                        input: node_run.input.clone(),
                    });
                    self.results.splice(index..index, items);
                }
                Effect::Error { node_run_id, message } => {
                    debug!(node_id = %node_id, node_run_id = %node_run_id, "Node run failed");
                    self.error = Some(message);
                }
            }
        }
    }
}

/// Live run state of one graph node.
pub struct NodeRunView {
    node_id: NodeId,
    orchestrator: Arc<RunOrchestrator>,
    state: Arc<Mutex<ViewState>>,
    _subscription: Subscription,
}

impl NodeRunView {
    pub fn mount(orchestrator: Arc<RunOrchestrator>, node_id: NodeId) -> Self {
        let state = Arc::new(Mutex::new(ViewState::default()));
        let handler_state = state.clone();
        let handler_node = node_id.clone();
        let subscription = orchestrator.subscribe(node_id.clone(), move |update| {
            handler_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .on_update(&handler_node, update);
        });
        Self {
            node_id,
            orchestrator,
            state,
            _subscription: subscription,
        }
    }

    fn state(&self) -> MutexGuard<'_, ViewState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn status(&self) -> Option<RunStatus> {
        self.state().status
    }

    pub fn results(&self) -> Vec<ResultItem> {
        self.state().results.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.state().error.clone()
    }

    pub fn button_status(&self) -> ButtonStatus {
        if self.orchestrator.is_initializing(&self.node_id) {
            return ButtonStatus::Initializing;
        }
        match self.status() {
            Some(RunStatus::Pending) => ButtonStatus::Pending,
            Some(RunStatus::Running) => ButtonStatus::Running,
            _ => ButtonStatus::Initial,
        }
    }

    /// Human progress: `"40%"` for a single node run, `"2 / 6"` across
    /// several, `None` when nothing is active.
    pub fn progress(&self) -> Option<String> {
        let batches = self
            .orchestrator
            .store()
            .active_batches_with_active_node(&self.node_id);
        match batches.as_slice() {
            [] => None,
            [batch] => {
                let runs: Vec<_> = batch.node_runs_for(&self.node_id).collect();
                match runs.as_slice() {
                    [] => None,
                    [only] => Some(format!("{}%", only.progress.unwrap_or(0))),
                    many => {
                        let completed = many
                            .iter()
                            .filter(|nr| nr.status == RunStatus::Completed)
                            .count();
                        Some(format!("{} / {}", completed, many.len()))
                    }
                }
            }
            _ => {
                warn!(
                    node_id = %self.node_id,
                    batches = batches.len(),
                    "Active node appears in multiple batches"
                );
                None
            }
        }
    }

    /// Whether the node's active batch also runs other nodes.
    pub fn multi_node_batch(&self) -> bool {
        let batches = self
            .orchestrator
            .store()
            .active_batches_with_active_node(&self.node_id);
        match batches.as_slice() {
            [] => false,
            [batch] => batch.node_runs().any(|nr| nr.node_id != self.node_id),
            _ => {
                warn!(
                    node_id = %self.node_id,
                    batches = batches.len(),
                    "Active node appears in multiple batches"
                );
                true
            }
        }
    }

    /// Submit a run of this node. Failures become state: the view returns to
    /// idle and the error message is kept.
    pub async fn run(&self) -> Option<BatchId> {
        {
            let mut state = self.state();
            state.status = Some(RunStatus::Pending);
            state.error = None;
        }
        match self.orchestrator.run_node(&self.node_id).await {
            Ok(batch_id) => Some(batch_id),
            Err(e) => {
                let mut state = self.state();
                state.status = None;
                state.error = Some(e.to_string());
                None
            }
        }
    }

    /// Stop this node's batch if the node is active and no other node depends
    /// on it. Returns whether a batch was stopped.
    pub async fn cancel(&self) -> bool {
        if !self.status().is_some_and(RunStatus::is_active) {
            return false;
        }
        let batches = self.orchestrator.store().batches_for_node(&self.node_id);
        let Some(batch_id) = cancellable_batch(&batches, &self.node_id) else {
            debug!(node_id = %self.node_id, "No batch can be stopped from this node");
            return false;
        };

        match self.orchestrator.stop_batch(&batch_id).await {
            Ok(true) => {
                let batch = self.orchestrator.store().batch(&batch_id);
                let mut state = self.state();
                state.status = Some(RunStatus::Canceled);
                if let Some(batch) = batch {
                    state.ledger.mark_canceled(&batch, &self.node_id);
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                self.state().error = Some(e.to_string());
                false
            }
        }
    }

    /// Projected cost of running this node `runs` times; `-1` if the node no
    /// longer exists.
    pub async fn calculate_cost(&self, runs: u64) -> runweave_core::Result<f64> {
        let Some(node) = self.orchestrator.graph().node(&self.node_id) else {
            return Ok(-1.0);
        };
        self.orchestrator.batch_cost(&[node], runs).await
    }

    pub fn clear_error(&self) {
        self.state().error = None;
    }
}

/// First batch that may be stopped on behalf of `node_id`.
///
/// `node_id` must itself have a pending or running node run in the batch,
/// and at least one of its non-canceled recipe runs must consist solely of
/// `node_id`'s runs.
pub fn cancellable_batch(batches: &[Batch], node_id: &NodeId) -> Option<BatchId> {
    batches
        .iter()
        .filter(|batch| batch.has_active_node_run(node_id))
        .find(|batch| {
            batch
                .recipe_runs
                .iter()
                .any(|r| r.status != RunStatus::Canceled && r.only_runs_node(node_id))
        })
        .map(|batch| batch.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use runweave_core::types::{NodeRun, RecipeRun};
    use runweave_core::RunEvent;
    use runweave_test_utils::{scenario_graph, MockCostEstimator, MockSubmitter};
    use serde_json::json;

    fn orchestrator() -> Arc<RunOrchestrator> {
        Arc::new(RunOrchestrator::new(
            Arc::new(MockSubmitter::returning("b1")),
            Arc::new(MockCostEstimator::fixed(3.0)),
            Arc::new(scenario_graph()),
        ))
    }

    fn recipe(id: &str, runs: &[(&str, &str, RunStatus)]) -> RecipeRun {
        let mut r = RecipeRun::new(id.into(), "b1".into(), 0);
        r.node_runs = runs
            .iter()
            .map(|(nr, node, s)| NodeRun::new((*nr).into(), (*node).into(), *s))
            .collect();
        r
    }

    #[test]
    fn cancel_rule_isolates_nodes() {
        let mut batch = Batch::new("b1".into(), vec![]);
        batch.recipe_runs = vec![
            recipe(
                "r1",
                &[("n1", "a", RunStatus::Running), ("n2", "b", RunStatus::Running)],
            ),
            recipe("r2", &[("n3", "a", RunStatus::Running)]),
        ];
        let batches = vec![batch];
        assert_eq!(
            cancellable_batch(&batches, &"a".into()),
            Some(BatchId::from("b1"))
        );
        assert_eq!(cancellable_batch(&batches, &"b".into()), None);
    }

    #[test]
    fn settled_batch_is_not_cancellable() {
        let mut batch = Batch::new("b1".into(), vec![]);
        batch.recipe_runs = vec![recipe("r1", &[("n1", "a", RunStatus::Completed)])];
        assert_eq!(cancellable_batch(&[batch], &"a".into()), None);
    }

    #[test]
    fn finished_node_does_not_stop_batch_kept_alive_by_others() {
        let mut old = Batch::new("b-old".into(), vec![]);
        old.recipe_runs = vec![
            recipe("r1", &[("n1", "a", RunStatus::Completed)]),
            recipe("r2", &[("n2", "c", RunStatus::Running)]),
        ];
        let mut new = Batch::new("b-new".into(), vec![]);
        new.recipe_runs = vec![recipe("r3", &[("n3", "a", RunStatus::Running)])];

        let batches = vec![old, new];
        assert_eq!(
            cancellable_batch(&batches, &"a".into()),
            Some(BatchId::from("b-new"))
        );
        assert_eq!(
            cancellable_batch(&batches, &"c".into()),
            Some(BatchId::from("b-old"))
        );
    }

    #[test]
    fn results_are_placed_in_order() {
        let orch = orchestrator();
        let view = NodeRunView::mount(orch.clone(), "a".into());

        for (recipe, node_run, index) in [("r2", "n2", 2), ("r0", "n0", 0), ("r1", "n1", 1)] {
            orch.apply_event(
                &RunEvent::new("b1", recipe, node_run, "a", RunStatus::Completed)
                    .with_run_index(index, None)
                    .with_result(vec![json!(format!("img-{index}"))]),
            );
        }
        let payloads: Vec<_> = view.results().into_iter().map(|r| r.payload).collect();
        assert_eq!(payloads, vec![json!("img-0"), json!("img-1"), json!("img-2")]);
        assert_eq!(view.status(), Some(RunStatus::Completed));
    }

    #[test]
    fn progress_text() {
        let orch = orchestrator();
        let view = NodeRunView::mount(orch.clone(), "a".into());
        assert_eq!(view.progress(), None);

        orch.apply_event(&RunEvent::new("b1", "r1", "n1", "a", RunStatus::Running).with_progress(40));
        assert_eq!(view.progress().as_deref(), Some("40%"));
        assert_eq!(view.button_status(), ButtonStatus::Running);
        assert!(!view.multi_node_batch());

        orch.apply_event(&RunEvent::new("b1", "r2", "n2", "a", RunStatus::Completed));
        orch.apply_event(&RunEvent::new("b1", "r3", "n3", "b", RunStatus::Pending));
        assert_eq!(view.progress().as_deref(), Some("1 / 2"));
        assert!(view.multi_node_batch());
    }

    #[test]
    fn failure_surfaces_error_once() {
        let orch = orchestrator();
        let view = NodeRunView::mount(orch.clone(), "a".into());
        orch.apply_event(&RunEvent::new("b1", "r1", "n1", "a", RunStatus::Running));
        orch.apply_event(
            &RunEvent::new("b1", "r1", "n1", "a", RunStatus::Failed)
                .with_error(json!({"code": "NSFW"})),
        );
        assert_eq!(view.error().as_deref(), Some("{\"code\":\"NSFW\"}"));
        assert_eq!(view.status(), Some(RunStatus::Failed));
        assert_eq!(view.button_status(), ButtonStatus::Initial);

        view.clear_error();
        orch.apply_event(&RunEvent::new("b1", "r1", "n1", "a", RunStatus::Failed));
        assert_eq!(view.error(), None);
    }

    #[tokio::test]
    async fn run_failure_returns_to_idle() {
        let orch = Arc::new(RunOrchestrator::new(
            Arc::new(MockSubmitter::failing("service unavailable")),
            Arc::new(MockCostEstimator::fixed(3.0)),
            Arc::new(scenario_graph()),
        ));
        let view = NodeRunView::mount(orch, "a".into());
        assert_eq!(view.run().await, None);
        assert_eq!(view.status(), None);
        assert_eq!(view.button_status(), ButtonStatus::Initial);
        assert!(view.error().unwrap().contains("service unavailable"));
    }

    #[tokio::test]
    async fn run_success_sets_pending() {
        let orch = orchestrator();
        let view = NodeRunView::mount(orch, "a".into());
        assert_eq!(view.run().await, Some(BatchId::from("b1")));
        assert_eq!(view.button_status(), ButtonStatus::Pending);
        assert_eq!(view.error(), None);
    }

    #[tokio::test]
    async fn cancel_requires_active_status() {
        let orch = orchestrator();
        let view = NodeRunView::mount(orch, "a".into());
        assert!(!view.cancel().await);
    }

    #[tokio::test]
    async fn calculate_cost_for_missing_node() {
        let orch = orchestrator();
        let view = NodeRunView::mount(orch.clone(), "a".into());
        assert_eq!(view.calculate_cost(6).await.unwrap(), 3.0);

        let ghost = NodeRunView::mount(orch, "ghost".into());
        assert_eq!(ghost.calculate_cost(1).await.unwrap(), -1.0);
    }

    #[test]
    fn mid_run_mount_catches_up() {
        let orch = orchestrator();
        orch.apply_event(&RunEvent::new("b1", "r1", "n1", "a", RunStatus::Running).with_progress(10));
        let view = NodeRunView::mount(orch.clone(), "a".into());
        assert_eq!(view.status(), Some(RunStatus::Running));

        drop(view);
        assert!(orch
            .apply_event(&RunEvent::new("b1", "r1", "n1", "a", RunStatus::Completed))
            .is_some());
    }
}
