pub mod gate;
pub mod orchestrator;
pub mod reducer;
pub mod resolver;
pub mod run_log;
pub mod sequencer;
pub mod store;
pub mod view;

pub use gate::{has_enough_credits, CostGate, GateOutcome, GateRequest, WarningPreferences, WarningStage};
pub use orchestrator::RunOrchestrator;
pub use reducer::{reduce, Effect, Ledger, Reduction};
pub use resolver::{
    combination_count, plan_recipe_runs, resolve_preceding_iterators, IteratorBinding,
    PlannedRecipeRun,
};
pub use run_log::RunLogger;
pub use sequencer::{insert_ordered, insertion_index};
pub use store::{Applied, RunStateStore};
pub use view::{ButtonStatus, NodeRunView};
