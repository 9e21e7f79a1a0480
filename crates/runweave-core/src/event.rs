use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::types::{NodeId, OrchestratorEvent, RunUpdate};

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: OrchestratorEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

type NodeCallback = Arc<dyn Fn(&RunUpdate) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    next_id: u64,
    by_node: HashMap<NodeId, Vec<(u64, NodeCallback)>>,
}

/// Per-node publish/subscribe channel for run updates.
///
/// Callbacks run synchronously on the publishing thread. The handler table is
/// never locked while a callback executes, so a callback may subscribe or
/// unsubscribe without deadlocking.
#[derive(Clone, Default)]
pub struct NodeEventBus {
    handlers: Arc<Mutex<Handlers>>,
}

impl NodeEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for updates about `node_id`.
    ///
    /// The callback stays registered until the returned handle is dropped or
    /// passed to [`Subscription::unsubscribe`].
    pub fn subscribe<F>(&self, node_id: NodeId, callback: F) -> Subscription
    where
        F: Fn(&RunUpdate) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        handlers.next_id += 1;
        let id = handlers.next_id;
        handlers
            .by_node
            .entry(node_id.clone())
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription {
            id,
            node_id,
            handlers: Some(Arc::downgrade(&self.handlers)),
        }
    }

    /// Deliver `update` to every subscriber of its node.
    pub fn publish(&self, update: &RunUpdate) {
        let callbacks: Vec<NodeCallback> = {
            let handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
            handlers
                .by_node
                .get(&update.node_run.node_id)
                .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default()
        };
        for callback in callbacks {
            callback(update);
        }
    }

    pub fn subscriber_count(&self, node_id: &NodeId) -> usize {
        let handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        handlers.by_node.get(node_id).map_or(0, Vec::len)
    }
}

/// Handle returned by [`NodeEventBus::subscribe`].
pub struct Subscription {
    id: u64,
    node_id: NodeId,
    handlers: Option<Weak<Mutex<Handlers>>>,
}

impl Subscription {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        let Some(handlers) = self.handlers.take().and_then(|w| w.upgrade()) else {
            return;
        };
        let mut handlers = handlers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = handlers.by_node.get_mut(&self.node_id) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                handlers.by_node.remove(&self.node_id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("node_id", &self.node_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeRun, RecipeRun, RunStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn update_for(node: &str) -> RunUpdate {
        RunUpdate {
            batch_id: "b1".into(),
            recipe_run: RecipeRun::new("r1".into(), "b1".into(), 0),
            node_run: NodeRun::new("nr1".into(), node.into(), RunStatus::Running),
        }
    }

    #[test]
    fn publish_reaches_only_matching_node() {
        let bus = NodeEventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _sub = bus.subscribe("a".into(), move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&update_for("a"));
        bus.publish(&update_for("b"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_and_drop_remove_handler() {
        let bus = NodeEventBus::new();
        let node = NodeId::from("a");
        let first = bus.subscribe(node.clone(), |_| {});
        let second = bus.subscribe(node.clone(), |_| {});
        assert_eq!(bus.subscriber_count(&node), 2);

        first.unsubscribe();
        assert_eq!(bus.subscriber_count(&node), 1);

        drop(second);
        assert_eq!(bus.subscriber_count(&node), 0);
    }

    #[test]
    fn callback_may_subscribe_during_publish() {
        let bus = NodeEventBus::new();
        let inner_bus = bus.clone();
        let held = Arc::new(Mutex::new(Vec::new()));
        let held2 = held.clone();
        let _sub = bus.subscribe("a".into(), move |_| {
            let sub = inner_bus.subscribe("b".into(), |_| {});
            held2.lock().unwrap().push(sub);
        });

        bus.publish(&update_for("a"));
        assert_eq!(bus.subscriber_count(&NodeId::from("b")), 1);
    }

    #[test]
    fn handle_outliving_bus_is_harmless() {
        let bus = NodeEventBus::new();
        let sub = bus.subscribe("a".into(), |_| {});
        drop(bus);
        sub.unsubscribe();
    }

    #[tokio::test]
    async fn broadcast_bus_delivers_to_all() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.publish(OrchestratorEvent::BatchCanceled {
            batch_id: "b1".into(),
        });
        assert!(matches!(
            rx1.recv().await.unwrap(),
            OrchestratorEvent::BatchCanceled { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            OrchestratorEvent::BatchCanceled { .. }
        ));
    }
}
