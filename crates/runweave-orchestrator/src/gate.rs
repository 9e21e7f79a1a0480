use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use runweave_core::error::Result;
use runweave_core::event::EventBus;
use runweave_core::graph::GraphNode;
use runweave_core::traits::{CostEstimator, KeyValueStore};
use runweave_core::types::{CostWarning, OrchestratorEvent};

use crate::resolver::{combination_count, total_iterator_values, IteratorBinding};

/// Default price/cost at or above which a confirmation is required.
pub const DEFAULT_WARNING_THRESHOLD: f64 = 100.0;

const ALLOW_PRICY_MODEL_KEY: &str = "allowRunPricyModel";
const ALLOW_EXPENSIVE_RUN_KEY: &str = "allowRunExpensiveRun";

/// Persisted "don't ask again" flags.
pub struct WarningPreferences {
    store: Arc<dyn KeyValueStore>,
}

impl WarningPreferences {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Whether the pricy-model warning was dismissed for this exact model.
    pub fn pricy_model_allowed(&self, model_name: &str) -> bool {
        match self.store.get(ALLOW_PRICY_MODEL_KEY) {
            Ok(value) => value
                .as_ref()
                .and_then(|v| v.get(model_name))
                .and_then(Value::as_bool)
                .unwrap_or(false),
            Err(e) => {
                warn!(error = %e, "Failed to read pricy model preferences");
                false
            }
        }
    }

    pub fn expensive_runs_allowed(&self) -> bool {
        match self.store.get(ALLOW_EXPENSIVE_RUN_KEY) {
            Ok(value) => value.as_ref().and_then(Value::as_bool).unwrap_or(false),
            Err(e) => {
                warn!(error = %e, "Failed to read expensive run preference");
                false
            }
        }
    }

    pub fn set_pricy_model_allowed(&self, model_name: &str, allow: bool) -> Result<()> {
        let mut map = match self.store.get(ALLOW_PRICY_MODEL_KEY)? {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        map.insert(model_name.to_string(), Value::Bool(allow));
        self.store.set(ALLOW_PRICY_MODEL_KEY, Value::Object(map))
    }

    pub fn set_expensive_runs_allowed(&self, allow: bool) -> Result<()> {
        self.store.set(ALLOW_EXPENSIVE_RUN_KEY, json!(allow))
    }

    /// Forget every dismissal.
    pub fn reset(&self) -> Result<()> {
        self.store.remove(ALLOW_PRICY_MODEL_KEY)?;
        self.store.remove(ALLOW_EXPENSIVE_RUN_KEY)
    }

    /// Current flags as one JSON object.
    pub fn snapshot(&self) -> Result<Value> {
        Ok(json!({
            ALLOW_PRICY_MODEL_KEY: self.store.get(ALLOW_PRICY_MODEL_KEY)?.unwrap_or_else(|| json!({})),
            ALLOW_EXPENSIVE_RUN_KEY: self.store.get(ALLOW_EXPENSIVE_RUN_KEY)?.unwrap_or(Value::Bool(false)),
        }))
    }
}

/// What the gate needs to know about a pending run.
#[derive(Debug, Clone)]
pub struct GateRequest {
    pub node: GraphNode,
    pub model_name: String,
    pub model_price: Option<f64>,
    pub combinations: u64,
    /// Sum of values over the preceding iterators.
    pub iterator_values: usize,
}

impl GateRequest {
    pub fn for_node(node: &GraphNode, bindings: Option<&[IteratorBinding]>) -> Self {
        let bindings = bindings.unwrap_or(&[]);
        let (model_name, model_price) = match &node.model {
            Some(model) => (model.name.clone(), model.price),
            None => (node.id.to_string(), None),
        };
        Self {
            node: node.clone(),
            model_name,
            model_price,
            combinations: combination_count(bindings),
            iterator_values: total_iterator_values(bindings),
        }
    }
}

/// One step of the warning pipeline.
pub trait WarningStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// A warning blocks the run; `None` passes through to the next stage.
    fn check<'a>(&'a self, request: &'a GateRequest) -> BoxFuture<'a, Option<CostWarning>>;
}

/// Warns when the model alone is priced at or above the threshold.
pub struct PricyModelStage {
    threshold: f64,
    prefs: Arc<WarningPreferences>,
}

impl PricyModelStage {
    pub fn new(threshold: f64, prefs: Arc<WarningPreferences>) -> Self {
        Self { threshold, prefs }
    }
}

impl WarningStage for PricyModelStage {
    fn name(&self) -> &'static str {
        "pricy_model"
    }

    fn check<'a>(&'a self, request: &'a GateRequest) -> BoxFuture<'a, Option<CostWarning>> {
        Box::pin(async move {
            let price = request.model_price.filter(|p| *p > 0.0)?;
            if price < self.threshold || self.prefs.pricy_model_allowed(&request.model_name) {
                return None;
            }
            Some(CostWarning::PricyModel {
                model_name: request.model_name.clone(),
                price,
            })
        })
    }
}

/// Warns when the projected cost of every combination reaches the threshold.
pub struct ExpensiveRunStage {
    threshold: f64,
    prefs: Arc<WarningPreferences>,
    estimator: Arc<dyn CostEstimator>,
}

impl ExpensiveRunStage {
    pub fn new(
        threshold: f64,
        prefs: Arc<WarningPreferences>,
        estimator: Arc<dyn CostEstimator>,
    ) -> Self {
        Self {
            threshold,
            prefs,
            estimator,
        }
    }
}

impl WarningStage for ExpensiveRunStage {
    fn name(&self) -> &'static str {
        "expensive_run"
    }

    fn check<'a>(&'a self, request: &'a GateRequest) -> BoxFuture<'a, Option<CostWarning>> {
        Box::pin(async move {
            let cost = match self
                .estimator
                .estimate_cost(std::slice::from_ref(&request.node), request.combinations)
                .await
            {
                Ok(cost) => cost,
                Err(e) => {
                    warn!(node_id = %request.node.id, error = %e, "Cost estimate unavailable, skipping warning");
                    return None;
                }
            };
            if cost <= 0.0 || cost < self.threshold || self.prefs.expensive_runs_allowed() {
                return None;
            }
            Some(CostWarning::ExpensiveRun {
                model_name: request.model_name.clone(),
                cost,
                combinations: request.combinations,
                iterator_values: request.iterator_values,
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Proceed,
    Blocked(CostWarning),
}

/// Short-circuiting pipeline of warning stages evaluated in order.
pub struct CostGate {
    stages: Vec<Box<dyn WarningStage>>,
    prefs: Arc<WarningPreferences>,
    event_bus: Option<Arc<EventBus>>,
}

impl CostGate {
    /// The standard pipeline: pricy model, then expensive run.
    pub fn new(
        threshold: f64,
        store: Arc<dyn KeyValueStore>,
        estimator: Arc<dyn CostEstimator>,
    ) -> Self {
        let prefs = Arc::new(WarningPreferences::new(store));
        let stages: Vec<Box<dyn WarningStage>> = vec![
            Box::new(PricyModelStage::new(threshold, prefs.clone())),
            Box::new(ExpensiveRunStage::new(threshold, prefs.clone(), estimator)),
        ];
        Self::with_stages(stages, prefs)
    }

    /// A custom pipeline. `prefs` should be the preferences the stages read,
    /// so remembered choices reach them.
    pub fn with_stages(stages: Vec<Box<dyn WarningStage>>, prefs: Arc<WarningPreferences>) -> Self {
        Self {
            stages,
            prefs,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn preferences(&self) -> &WarningPreferences {
        &self.prefs
    }

    /// Run the stages in order; the first warning stops the pipeline.
    pub async fn evaluate(&self, request: &GateRequest) -> GateOutcome {
        for stage in &self.stages {
            if let Some(warning) = stage.check(request).await {
                info!(stage = stage.name(), model = %request.model_name, "Run blocked by cost warning");
                if let Some(bus) = &self.event_bus {
                    bus.publish(OrchestratorEvent::CostWarningRaised {
                        warning: warning.clone(),
                    });
                }
                return GateOutcome::Blocked(warning);
            }
            debug!(stage = stage.name(), "Cost warning stage passed");
        }
        GateOutcome::Proceed
    }

    pub async fn before_run(&self, request: &GateRequest) -> bool {
        self.evaluate(request).await == GateOutcome::Proceed
    }

    /// Persist the user's choice for the pricy-model warning of `model_name`.
    pub fn remember_model_choice(&self, model_name: &str, allow: bool) -> Result<()> {
        self.prefs.set_pricy_model_allowed(model_name, allow)
    }

    pub fn remember_expensive_runs(&self, allow: bool) -> Result<()> {
        self.prefs.set_expensive_runs_allowed(allow)
    }
}

/// Whether `credits` cover the run: against the projected cost when one is
/// known, otherwise against the model's price.
pub fn has_enough_credits(credits: Option<f64>, cost: Option<f64>, model_price: Option<f64>) -> bool {
    let Some(credits) = credits else {
        return true;
    };
    match cost.filter(|c| *c > 0.0) {
        Some(cost) => credits >= cost,
        None => model_price.map_or(true, |price| credits >= price),
    }
}
