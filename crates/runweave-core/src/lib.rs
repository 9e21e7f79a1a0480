pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod kv;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, RunweaveError};
pub use event::{EventBus, NodeEventBus, Subscription};
pub use graph::{Edge, GraphNode, NodeKind, StaticGraph};
pub use kv::MemoryKvStore;
pub use types::*;
