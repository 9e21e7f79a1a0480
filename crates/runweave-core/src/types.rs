use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Graph node identifier, stable for the lifetime of the graph.
    NodeId
);
string_id!(
    /// Identifies one "run" action.
    BatchId
);
string_id!(
    /// One iterator combination inside a batch.
    RecipeRunId
);
string_id!(
    /// One node's execution inside a recipe run. Globally unique.
    NodeRunId
);

/// Lifecycle status shared by recipe runs and node runs.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    /// Completed, failed and canceled never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Position in the monotone order PENDING < RUNNING < terminal.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Canceled => 2,
        }
    }

    /// Whether moving from `self` to `next` respects monotonicity.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        };
        write!(f, "{}", s)
    }
}

/// Status of a whole batch, derived from its recipe runs.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Running,
    Completed,
    Failed,
    Canceled,
}

/// One node's execution within one recipe run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRun {
    pub id: NodeRunId,
    pub node_id: NodeId,
    pub status: RunStatus,
    /// Percentage, 0-100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default)]
    pub result: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    /// Concrete input values this run was executed with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
}

impl NodeRun {
    pub fn new(id: NodeRunId, node_id: NodeId, status: RunStatus) -> Self {
        Self {
            id,
            node_id,
            status,
            progress: None,
            result: Vec::new(),
            error: None,
            input: None,
        }
    }
}

/// One concrete combination of iterator values executed within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeRun {
    pub id: RecipeRunId,
    pub batch_id: BatchId,
    /// Stable ordinal assigned at submission, unique within the batch.
    pub run_index_in_batch: u32,
    /// Secondary ordinal for combinations producing several physical inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_index: Option<u32>,
    pub status: RunStatus,
    #[serde(default)]
    pub node_runs: Vec<NodeRun>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl RecipeRun {
    pub fn new(id: RecipeRunId, batch_id: BatchId, run_index_in_batch: u32) -> Self {
        Self {
            id,
            batch_id,
            run_index_in_batch,
            input_index: None,
            status: RunStatus::Running,
            node_runs: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn node_run(&self, id: &NodeRunId) -> Option<&NodeRun> {
        self.node_runs.iter().find(|nr| &nr.id == id)
    }

    /// True when every node run in this recipe run belongs to `node_id`.
    pub fn only_runs_node(&self, node_id: &NodeId) -> bool {
        self.node_runs.iter().all(|nr| &nr.node_id == node_id)
    }

    pub fn has_active_node_run(&self) -> bool {
        self.node_runs.iter().any(|nr| nr.status.is_active())
    }
}

/// One user-triggered run action with all the recipe runs it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    /// Nodes that were asked to run.
    #[serde(default)]
    pub node_ids: Vec<NodeId>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub recipe_runs: Vec<RecipeRun>,
    /// Hidden from the task list; the batch itself is never deleted.
    #[serde(default)]
    pub cleared: bool,
}

impl Batch {
    pub fn new(id: BatchId, node_ids: Vec<NodeId>) -> Self {
        Self {
            id,
            node_ids,
            submitted_at: Utc::now(),
            recipe_runs: Vec::new(),
            cleared: false,
        }
    }

    pub fn is_any_run(&self, status: RunStatus) -> bool {
        self.recipe_runs.iter().any(|r| r.status == status)
    }

    /// A batch is active while any recipe run is still pending or running.
    pub fn is_active(&self) -> bool {
        self.recipe_runs.iter().any(|r| r.status.is_active())
    }

    pub fn status(&self) -> BatchStatus {
        if self.is_any_run(RunStatus::Failed) {
            BatchStatus::Failed
        } else if self.is_any_run(RunStatus::Canceled) {
            BatchStatus::Canceled
        } else if self.is_active() {
            BatchStatus::Running
        } else {
            BatchStatus::Completed
        }
    }

    pub fn contains_node(&self, node_id: &NodeId) -> bool {
        self.node_runs().any(|nr| &nr.node_id == node_id)
    }

    pub fn has_active_node_run(&self, node_id: &NodeId) -> bool {
        self.node_runs()
            .any(|nr| &nr.node_id == node_id && nr.status.is_active())
    }

    pub fn node_runs(&self) -> impl Iterator<Item = &NodeRun> {
        self.recipe_runs.iter().flat_map(|r| r.node_runs.iter())
    }

    pub fn node_runs_for<'a>(&'a self, node_id: &'a NodeId) -> impl Iterator<Item = &'a NodeRun> {
        self.node_runs().filter(move |nr| &nr.node_id == node_id)
    }

    /// Number of node runs in `status`, optionally restricted to one node.
    pub fn count_of(&self, status: RunStatus, node: Option<&NodeId>) -> usize {
        self.node_runs()
            .filter(|nr| nr.status == status && node.map_or(true, |n| &nr.node_id == n))
            .count()
    }

    pub fn total_node_runs(&self, node: Option<&NodeId>) -> usize {
        self.node_runs()
            .filter(|nr| node.map_or(true, |n| &nr.node_id == n))
            .count()
    }

    pub fn recipe_run(&self, id: &RecipeRunId) -> Option<&RecipeRun> {
        self.recipe_runs.iter().find(|r| &r.id == id)
    }
}

/// A lifecycle update pushed by the execution service for one node run.
///
/// Records referenced here that the store has not seen yet are created on
/// first sight, so no explicit "created" event is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub batch_id: BatchId,
    pub recipe_run_id: RecipeRunId,
    pub node_run_id: NodeRunId,
    pub node_id: NodeId,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_index_in_batch: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
}

impl RunEvent {
    pub fn new(
        batch_id: impl Into<BatchId>,
        recipe_run_id: impl Into<RecipeRunId>,
        node_run_id: impl Into<NodeRunId>,
        node_id: impl Into<NodeId>,
        status: RunStatus,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            recipe_run_id: recipe_run_id.into(),
            node_run_id: node_run_id.into(),
            node_id: node_id.into(),
            status,
            recipe_status: None,
            run_index_in_batch: None,
            input_index: None,
            progress: None,
            result: None,
            error: None,
            input: None,
        }
    }

    pub fn with_recipe_status(mut self, status: RunStatus) -> Self {
        self.recipe_status = Some(status);
        self
    }

    pub fn with_run_index(mut self, run_index_in_batch: u32, input_index: Option<u32>) -> Self {
        self.run_index_in_batch = Some(run_index_in_batch);
        self.input_index = input_index;
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_result(mut self, result: Vec<serde_json::Value>) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: serde_json::Value) -> Self {
        self.error = Some(error);
        self
    }
}

/// Snapshot handed to node subscribers after an event was applied.
#[derive(Debug, Clone, PartialEq)]
pub struct RunUpdate {
    pub batch_id: BatchId,
    pub recipe_run: RecipeRun,
    pub node_run: NodeRun,
}

/// One produced artifact placed in a node's result sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultItem {
    pub batch_id: BatchId,
    /// `run_index_in_batch` of the producing recipe run.
    pub order: u32,
    /// `input_index` of the producing recipe run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_order: Option<u32>,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
}

/// A blocking cost confirmation the host has to show before running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CostWarning {
    /// The model alone is priced at or above the threshold.
    PricyModel { model_name: String, price: f64 },
    /// The projected cost of all combinations is at or above the threshold.
    ExpensiveRun {
        model_name: String,
        cost: f64,
        combinations: u64,
        iterator_values: usize,
    },
}

/// Orchestration events broadcast to observers such as the run logger.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    BatchSubmitted {
        batch_id: BatchId,
        node_ids: Vec<NodeId>,
        combinations: u64,
    },
    SubmissionFailed {
        node_ids: Vec<NodeId>,
        error: String,
    },
    NodeRunUpdated {
        batch_id: BatchId,
        node_id: NodeId,
        node_run_id: NodeRunId,
        status: RunStatus,
    },
    BatchCanceled {
        batch_id: BatchId,
    },
    BatchSettled {
        batch_id: BatchId,
        status: BatchStatus,
    },
    CostWarningRaised {
        warning: CostWarning,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe(index: u32, runs: Vec<(&str, &str, RunStatus)>, status: RunStatus) -> RecipeRun {
        let mut r = RecipeRun::new(format!("r{}", index).into(), "b1".into(), index);
        r.status = status;
        r.node_runs = runs
            .into_iter()
            .map(|(id, node, s)| NodeRun::new(id.into(), node.into(), s))
            .collect();
        r
    }

    #[test]
    fn terminal_statuses_never_transition() {
        for s in [RunStatus::Completed, RunStatus::Failed, RunStatus::Canceled] {
            assert!(s.is_terminal());
            assert!(!s.can_transition_to(RunStatus::Running));
            assert!(!s.can_transition_to(RunStatus::Completed));
        }
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
    }

    #[test]
    fn status_serializes_uppercase() {
        let json = serde_json::to_string(&RunStatus::Canceled).unwrap();
        assert_eq!(json, "\"CANCELED\"");
        let parsed: RunStatus = serde_json::from_str("\"RUNNING\"").unwrap();
        assert_eq!(parsed, RunStatus::Running);
    }

    #[test]
    fn batch_status_precedence() {
        let mut batch = Batch::new("b1".into(), vec![]);
        batch.recipe_runs = vec![
            recipe(0, vec![("n1", "a", RunStatus::Running)], RunStatus::Running),
            recipe(1, vec![("n2", "a", RunStatus::Canceled)], RunStatus::Canceled),
        ];
        assert_eq!(batch.status(), BatchStatus::Canceled);

        batch.recipe_runs[0].status = RunStatus::Failed;
        assert_eq!(batch.status(), BatchStatus::Failed);

        let mut running = Batch::new("b2".into(), vec![]);
        running.recipe_runs = vec![recipe(0, vec![], RunStatus::Running)];
        assert_eq!(running.status(), BatchStatus::Running);

        let empty = Batch::new("b3".into(), vec![]);
        assert_eq!(empty.status(), BatchStatus::Completed);
    }

    #[test]
    fn batch_counters() {
        let mut batch = Batch::new("b1".into(), vec![]);
        batch.recipe_runs = vec![
            recipe(
                0,
                vec![("n1", "a", RunStatus::Completed), ("n2", "b", RunStatus::Running)],
                RunStatus::Running,
            ),
            recipe(1, vec![("n3", "a", RunStatus::Running)], RunStatus::Running),
        ];
        let a = NodeId::from("a");
        assert_eq!(batch.count_of(RunStatus::Completed, Some(&a)), 1);
        assert_eq!(batch.count_of(RunStatus::Running, None), 2);
        assert_eq!(batch.total_node_runs(Some(&a)), 2);
        assert_eq!(batch.total_node_runs(None), 3);
        assert!(batch.has_active_node_run(&a));
        assert!(batch.contains_node(&NodeId::from("b")));
        assert!(!batch.contains_node(&NodeId::from("c")));
    }

    #[test]
    fn event_roundtrip_skips_empty_fields() {
        let event = RunEvent::new("b1", "r1", "n1", "node-a", RunStatus::Running).with_progress(40);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"progress\":40"));
        assert!(!json.contains("error"));
        let parsed: RunEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
