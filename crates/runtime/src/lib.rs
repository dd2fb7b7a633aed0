//! Korda runtime: work queue, per-type controllers and the dynamic controller manager.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use korda_core::{KordaResult, ObjectKey};
use korda_graph::Graph;

mod config;
pub mod controller;
pub mod manager;
pub mod queue;

pub use config::{env_flag, env_or, RuntimeConfig};
pub use controller::{child_filter, owner_of, Controller, LifecycleState};
pub use manager::{DynamicControllerManager, Registration};
pub use queue::{Backoff, WorkQueue};

/// What a worker does with a key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    RequeueAfter(Duration),
}

/// One pass for one object. Retryable errors are requeued with backoff;
/// terminal ones are logged and dropped until the next event.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, key: &ObjectKey) -> KordaResult<Outcome>;
}

/// Builds the reconciler a controller uses for every instance of one graph.
pub trait ReconcilerFactory: Send + Sync {
    fn reconciler(&self, graph: Arc<Graph>) -> Arc<dyn Reconciler>;
}
