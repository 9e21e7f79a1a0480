//! Run state store: the single owner of every Batch, RecipeRun and NodeRun.
//!
//! Mutated only through [`RunStateStore::register_batch`],
//! [`RunStateStore::apply`], [`RunStateStore::cancel_batch_locally`] and the
//! task-list clearing helpers. Each mutation runs inside one write-lock
//! critical section, so readers never see a half-applied event.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::debug;

use runweave_core::types::{
    Batch, BatchId, BatchStatus, NodeId, NodeRun, RecipeRun, RunEvent, RunStatus, RunUpdate,
};

/// Result of applying one lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub update: RunUpdate,
    /// Set when this event left the batch with no active recipe run.
    pub settled: Option<BatchStatus>,
}

#[derive(Default)]
struct StoreInner {
    /// Submission order.
    batches: Vec<Batch>,
    index: HashMap<BatchId, usize>,
}

impl StoreInner {
    fn batch_mut_or_insert(&mut self, batch_id: &BatchId) -> &mut Batch {
        let idx = match self.index.get(batch_id) {
            Some(&idx) => idx,
            None => {
                self.batches.push(Batch::new(batch_id.clone(), Vec::new()));
                let idx = self.batches.len() - 1;
                self.index.insert(batch_id.clone(), idx);
                idx
            }
        };
        &mut self.batches[idx]
    }

    fn batch_mut(&mut self, batch_id: &BatchId) -> Option<&mut Batch> {
        let idx = *self.index.get(batch_id)?;
        self.batches.get_mut(idx)
    }
}

/// In-memory model of in-flight and historical executions.
#[derive(Default)]
pub struct RunStateStore {
    inner: RwLock<StoreInner>,
}

impl RunStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a freshly submitted batch. Returns false if it was already known.
    pub fn register_batch(&self, batch_id: BatchId, node_ids: Vec<NodeId>) -> bool {
        let mut inner = self.write();
        if let Some(batch) = inner.batch_mut(&batch_id) {
            if batch.node_ids.is_empty() {
                batch.node_ids = node_ids;
            }
            return false;
        }
        inner.batches.push(Batch::new(batch_id.clone(), node_ids));
        let idx = inner.batches.len() - 1;
        inner.index.insert(batch_id, idx);
        true
    }

    /// Apply one lifecycle event.
    ///
    /// Unknown batches, recipe runs and node runs are created on first sight.
    /// Returns `None` when the event was discarded: the node run is already
    /// terminal, the event would move it backwards, or its recipe run was
    /// canceled.
    pub fn apply(&self, event: &RunEvent) -> Option<Applied> {
        let mut inner = self.write();
        let batch = inner.batch_mut_or_insert(&event.batch_id);
        let batch_id = batch.id.clone();
        let node_ids = batch.node_ids.clone();
        let was_active = batch.is_active();

        let mut recipe_created = false;
        let rpos = match batch
            .recipe_runs
            .iter()
            .position(|r| r.id == event.recipe_run_id)
        {
            Some(pos) => pos,
            None => {
                let index = event
                    .run_index_in_batch
                    .unwrap_or_else(|| next_run_index(batch));
                let mut recipe =
                    RecipeRun::new(event.recipe_run_id.clone(), batch_id.clone(), index);
                recipe.input_index = event.input_index;
                batch.recipe_runs.push(recipe);
                recipe_created = true;
                batch.recipe_runs.len() - 1
            }
        };
        let recipe = &mut batch.recipe_runs[rpos];

        let npos = recipe.node_runs.iter().position(|nr| nr.id == event.node_run_id);
        if recipe.status == RunStatus::Canceled && event.status != RunStatus::Canceled {
            debug!(
                batch_id = %event.batch_id,
                node_run_id = %event.node_run_id,
                "Discarding event for canceled recipe run"
            );
            return None;
        }

        let npos = match npos {
            Some(pos) => {
                let current = recipe.node_runs[pos].status;
                if !current.can_transition_to(event.status) {
                    debug!(
                        node_run_id = %event.node_run_id,
                        from = %current,
                        to = %event.status,
                        "Discarding stale node run event"
                    );
                    return None;
                }
                pos
            }
            None => {
                recipe.node_runs.push(NodeRun::new(
                    event.node_run_id.clone(),
                    event.node_id.clone(),
                    RunStatus::Pending,
                ));
                recipe.node_runs.len() - 1
            }
        };

        {
            let node_run = &mut recipe.node_runs[npos];
            node_run.status = event.status;
            if let Some(progress) = event.progress {
                node_run.progress = Some(progress.min(100));
            }
            if let Some(result) = &event.result {
                node_run.result = result.clone();
            }
            if let Some(error) = &event.error {
                node_run.error = Some(error.clone());
            }
            if let Some(input) = &event.input {
                node_run.input = Some(input.clone());
            }
        }

        match event.recipe_status {
            Some(status) if recipe.status.can_transition_to(status) => recipe.status = status,
            Some(_) => {}
            None if !recipe.status.is_terminal() => {
                if recipe.node_runs.iter().any(|nr| nr.status == RunStatus::Failed) {
                    recipe.status = RunStatus::Failed;
                } else if is_recipe_complete(recipe, &node_ids) {
                    recipe.status = RunStatus::Completed;
                }
            }
            None => {}
        }
        if recipe.status.is_terminal() && recipe.ended_at.is_none() {
            recipe.ended_at = Some(Utc::now());
        }

        let update = RunUpdate {
            batch_id,
            recipe_run: recipe.clone(),
            node_run: recipe.node_runs[npos].clone(),
        };
        let settled = (!batch.is_active() && (was_active || recipe_created)).then(|| batch.status());
        Some(Applied { update, settled })
    }

    /// Mark every non-terminal recipe run and node run of a batch canceled.
    ///
    /// Returns one update per node run that changed, or `None` if the batch
    /// is unknown.
    pub fn cancel_batch_locally(&self, batch_id: &BatchId) -> Option<Vec<RunUpdate>> {
        let mut inner = self.write();
        let batch = inner.batch_mut(batch_id)?;
        let now = Utc::now();

        let mut changed = Vec::new();
        for (ri, recipe) in batch.recipe_runs.iter_mut().enumerate() {
            if !recipe.status.is_terminal() {
                recipe.status = RunStatus::Canceled;
                recipe.ended_at = Some(now);
            }
            for (ni, node_run) in recipe.node_runs.iter_mut().enumerate() {
                if !node_run.status.is_terminal() {
                    node_run.status = RunStatus::Canceled;
                    changed.push((ri, ni));
                }
            }
        }

        Some(
            changed
                .into_iter()
                .map(|(ri, ni)| RunUpdate {
                    batch_id: batch.id.clone(),
                    recipe_run: batch.recipe_runs[ri].clone(),
                    node_run: batch.recipe_runs[ri].node_runs[ni].clone(),
                })
                .collect(),
        )
    }

    /// All batches in submission order.
    pub fn batches(&self) -> Vec<Batch> {
        self.read().batches.clone()
    }

    /// Batches not hidden from the task list.
    pub fn visible_batches(&self) -> Vec<Batch> {
        self.read()
            .batches
            .iter()
            .filter(|b| !b.cleared)
            .cloned()
            .collect()
    }

    pub fn batch(&self, batch_id: &BatchId) -> Option<Batch> {
        let inner = self.read();
        inner
            .index
            .get(batch_id)
            .and_then(|&idx| inner.batches.get(idx))
            .cloned()
    }

    /// Batches with at least one node run of `node_id`, in any state.
    pub fn batches_for_node(&self, node_id: &NodeId) -> Vec<Batch> {
        self.read()
            .batches
            .iter()
            .filter(|b| b.contains_node(node_id))
            .cloned()
            .collect()
    }

    /// Active batches that contain `node_id`.
    pub fn running_batches_for_node(&self, node_id: &NodeId) -> Vec<Batch> {
        self.read()
            .batches
            .iter()
            .filter(|b| b.is_active() && b.contains_node(node_id))
            .cloned()
            .collect()
    }

    /// Active batches in which `node_id` itself is still pending or running.
    pub fn active_batches_with_active_node(&self, node_id: &NodeId) -> Vec<Batch> {
        self.read()
            .batches
            .iter()
            .filter(|b| b.is_active() && b.has_active_node_run(node_id))
            .cloned()
            .collect()
    }

    pub fn is_node_in_running_batch(&self, node_id: &NodeId) -> bool {
        self.read()
            .batches
            .iter()
            .any(|b| b.is_active() && b.contains_node(node_id))
    }

    /// Node runs of `node_id` across the given batches.
    pub fn node_runs_in_batches(&self, node_id: &NodeId, batch_ids: &[BatchId]) -> Vec<NodeRun> {
        let inner = self.read();
        batch_ids
            .iter()
            .filter_map(|id| inner.index.get(id).and_then(|&idx| inner.batches.get(idx)))
            .flat_map(|b| b.node_runs_for(node_id).cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Hide a batch from the task list. Returns false if unknown.
    pub fn clear_batch(&self, batch_id: &BatchId) -> bool {
        match self.write().batch_mut(batch_id) {
            Some(batch) => {
                batch.cleared = true;
                true
            }
            None => false,
        }
    }

    /// Hide every batch that is no longer running.
    pub fn clear_all_batches(&self) {
        for batch in self.write().batches.iter_mut() {
            batch.cleared = !batch.is_active();
        }
    }
}

/// A recipe run is complete once every submitted node has reported a node
/// run and all of its node runs completed. Batches seen only through events
/// have no node list and wait for an explicit recipe status.
fn is_recipe_complete(recipe: &RecipeRun, node_ids: &[NodeId]) -> bool {
    !node_ids.is_empty()
        && node_ids
            .iter()
            .all(|id| recipe.node_runs.iter().any(|nr| &nr.node_id == id))
        && recipe
            .node_runs
            .iter()
            .all(|nr| nr.status == RunStatus::Completed)
}

fn next_run_index(batch: &Batch) -> u32 {
    batch
        .recipe_runs
        .iter()
        .map(|r| r.run_index_in_batch + 1)
        .max()
        .unwrap_or(0)
}
