//! Per-node status reduction.
//!
//! Folds the stream of [`RunUpdate`]s for one node into a single display
//! status plus the side effects (result placement, error surfacing) that a
//! transition triggers. A ledger of the last snapshot acted upon per node run
//! makes replayed and duplicated updates harmless.

use std::collections::HashMap;

use tracing::debug;

use runweave_core::types::{Batch, NodeId, NodeRun, NodeRunId, RecipeRun, RunStatus, RunUpdate};

/// Last snapshot acted upon, per node run.
#[derive(Debug, Default, Clone)]
pub struct Ledger {
    entries: HashMap<NodeRunId, NodeRun>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &NodeRunId) -> Option<&NodeRun> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn record(&mut self, node_run: &NodeRun, status: RunStatus) {
        let mut snapshot = node_run.clone();
        snapshot.status = status;
        self.entries.insert(snapshot.id.clone(), snapshot);
    }

    /// Mark every node run of `node_id` in `batch` canceled so that late
    /// updates for them are discarded.
    pub fn mark_canceled(&mut self, batch: &Batch, node_id: &NodeId) {
        for node_run in batch.node_runs_for(node_id) {
            self.record(node_run, RunStatus::Canceled);
        }
    }
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Place the node run's results into the node's result sequence.
    Success {
        node_run: NodeRun,
        recipe_run: RecipeRun,
    },
    /// Surface an error message for the node.
    Error {
        node_run_id: NodeRunId,
        message: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reduction {
    /// New display status, `None` when it stays as it was.
    pub display: Option<RunStatus>,
    pub effects: Vec<Effect>,
}

impl Reduction {
    fn display(status: RunStatus) -> Self {
        Self {
            display: Some(status),
            effects: Vec::new(),
        }
    }

    fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn is_noop(&self) -> bool {
        self.display.is_none() && self.effects.is_empty()
    }
}

/// Reduce one update into the display status of `node_id`.
pub fn reduce(ledger: &mut Ledger, node_id: &NodeId, update: &RunUpdate) -> Reduction {
    let node_run = &update.node_run;
    if &node_run.node_id != node_id {
        return Reduction::default();
    }

    let prior = ledger.get(&node_run.id).map(|nr| nr.status);
    if let Some(prior) = prior.filter(|s| s.is_terminal()) {
        debug!(
            node_run_id = %node_run.id,
            prior = %prior,
            incoming = %node_run.status,
            "Ignoring update for settled node run"
        );
        return Reduction::default();
    }
    // From here on the prior record is absent or still active, so
    // terminal transitions fire their effects exactly once.
    if update.recipe_run.status == RunStatus::Canceled {
        ledger.record(node_run, RunStatus::Canceled);
        return Reduction::display(RunStatus::Canceled);
    }

    if update.recipe_run.status == RunStatus::Failed {
        ledger.record(node_run, RunStatus::Failed);
        return Reduction::display(RunStatus::Failed).with_effect(Effect::Error {
            node_run_id: node_run.id.clone(),
            message: error_message(node_run.error.as_ref()),
        });
    }

    match node_run.status {
        RunStatus::Pending => match prior {
            None => {
                ledger.record(node_run, RunStatus::Pending);
                Reduction::display(RunStatus::Pending)
            }
            Some(RunStatus::Pending) => Reduction::display(RunStatus::Pending),
            Some(_) => Reduction::default(),
        },
        RunStatus::Running => {
            if matches!(prior, None | Some(RunStatus::Pending)) {
                ledger.record(node_run, RunStatus::Running);
            }
            Reduction::display(RunStatus::Running)
        }
        RunStatus::Failed => {
            ledger.record(node_run, RunStatus::Failed);
            Reduction::display(RunStatus::Failed).with_effect(Effect::Error {
                node_run_id: node_run.id.clone(),
                message: error_message(node_run.error.as_ref()),
            })
        }
        RunStatus::Completed => {
            ledger.record(node_run, RunStatus::Completed);
            Reduction::display(RunStatus::Completed).with_effect(Effect::Success {
                node_run: node_run.clone(),
                recipe_run: update.recipe_run.clone(),
            })
        }
        RunStatus::Canceled => {
            ledger.record(node_run, RunStatus::Canceled);
            Reduction::display(RunStatus::Canceled)
        }
    }
}

/// Human-readable message for an error payload of unknown shape.
pub fn error_message(error: Option<&serde_json::Value>) -> String {
    match error {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "Unknown error".to_string(),
    }
}
