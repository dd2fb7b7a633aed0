//! Registry of active per-type controllers.

use std::sync::{Arc, Mutex, PoisonError};

use korda_core::{Gvk, KordaError, KordaResult};
use korda_graph::Graph;
use korda_store::ResourceStore;
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::controller::{Controller, LifecycleState};
use crate::{ReconcilerFactory, RuntimeConfig};

/// A compiled graph bound to the controller serving its type.
pub struct Registration {
    pub graph: Arc<Graph>,
    pub controller: Arc<Controller>,
}

pub struct DynamicControllerManager {
    store: Arc<dyn ResourceStore>,
    factory: Arc<dyn ReconcilerFactory>,
    config: RuntimeConfig,
    registry: Mutex<FxHashMap<Gvk, Arc<Registration>>>,
}

impl DynamicControllerManager {
    pub fn new(store: Arc<dyn ResourceStore>, factory: Arc<dyn ReconcilerFactory>, config: RuntimeConfig) -> Self {
        Self { store, factory, config, registry: Mutex::new(FxHashMap::default()) }
    }

    pub fn config(&self) -> &RuntimeConfig { &self.config }

    fn lookup(&self, gvk: &Gvk) -> Option<Arc<Registration>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner).get(gvk).cloned()
    }

    pub fn state(&self, gvk: &Gvk) -> Option<LifecycleState> { self.lookup(gvk).map(|r| r.controller.state()) }

    pub fn graph(&self, gvk: &Gvk) -> Option<Arc<Graph>> { self.lookup(gvk).map(|r| Arc::clone(&r.graph)) }

    pub fn registered(&self) -> Vec<Gvk> {
        let mut out: Vec<Gvk> = self.registry.lock().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        out.sort();
        out
    }

    /// Serve `graph.gvk` with a controller for this graph. An identical graph
    /// is a no-op; a different one starts a new controller, waits until it is
    /// Running, swaps it in and then stops the old one.
    pub async fn register(&self, graph: Arc<Graph>) -> KordaResult<()> {
        let gvk = graph.gvk.clone();
        let previous = self.lookup(&gvk);
        if let Some(prev) = &previous {
            if prev.graph.same_as(&graph) {
                debug!(gvk = %gvk, "graph unchanged; registration kept");
                return Ok(());
            }
        }

        let reconciler = self.factory.reconciler(Arc::clone(&graph));
        let controller = Controller::start(gvk.clone(), graph.child_gvks().into_iter().collect(), Arc::clone(&self.store), reconciler, &self.config);
        let ready = tokio::time::timeout(self.config.start_timeout, controller.running()).await;
        if !matches!(ready, Ok(true)) {
            let _ = controller.stop(self.config.drain_timeout).await;
            warn!(gvk = %gvk, timeout = ?self.config.start_timeout, "controller did not reach Running");
            return Err(KordaError::Transient(format!("controller for {} did not reach Running", gvk)));
        }

        let next = Arc::new(Registration { graph, controller });
        self.registry.lock().unwrap_or_else(PoisonError::into_inner).insert(gvk.clone(), next);

        match previous {
            Some(prev) => {
                counter!("controller_swaps", 1u64);
                info!(gvk = %gvk, "controller swapped to new graph");
                if let Err(e) = prev.controller.stop(self.config.drain_timeout).await {
                    warn!(gvk = %gvk, error = %e, "previous controller drained with errors");
                }
            }
            None => info!(gvk = %gvk, "controller registered"),
        }
        Ok(())
    }

    /// Tear down the controller for `gvk`. Teardown always completes; a drain
    /// timeout is still returned to the caller.
    pub async fn unregister(&self, gvk: &Gvk) -> KordaResult<()> {
        let removed = self.registry.lock().unwrap_or_else(PoisonError::into_inner).remove(gvk);
        let Some(reg) = removed else {
            debug!(gvk = %gvk, "nothing registered");
            return Ok(());
        };
        let res = reg.controller.stop(self.config.drain_timeout).await;
        info!(gvk = %gvk, "controller unregistered");
        res
    }

    /// Stop every controller.
    pub async fn shutdown(&self) {
        let all: Vec<Arc<Registration>> =
            self.registry.lock().unwrap_or_else(PoisonError::into_inner).drain().map(|(_, r)| r).collect();
        for reg in all {
            if let Err(e) = reg.controller.stop(self.config.drain_timeout).await {
                warn!(gvk = %reg.controller.gvk(), error = %e, "shutdown drain");
            }
        }
    }
}
