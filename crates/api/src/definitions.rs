//! Controller for `ResourceGraphDefinition` objects.

use std::sync::Arc;

use async_trait::async_trait;
use korda_core::{meta, Definition, KordaError, KordaResult, ObjectKey, FINALIZER};
use korda_graph::Graph;
use korda_runtime::{Controller, Outcome, Reconciler, RuntimeConfig};
use korda_store::ResourceStore;
use metrics::counter;
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

use crate::{definition_gvk, Engine};

/// Compiles stored definitions and keeps their types served.
pub struct DefinitionReconciler {
    engine: Arc<Engine>,
}

impl DefinitionReconciler {
    pub fn new(engine: Arc<Engine>) -> Self { Self { engine } }

    fn store(&self) -> &Arc<dyn ResourceStore> { self.engine.store() }

    async fn ensure_finalizer(&self, obj: Json) -> KordaResult<Json> {
        let mut finalizers = meta::finalizers(&obj);
        if finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(obj);
        }
        finalizers.push(FINALIZER.to_string());
        let mut next = obj.clone();
        meta::set_finalizers(&mut next, &finalizers);
        let rv = meta::resource_version(&obj).unwrap_or_default().to_string();
        let updated = self.store().update(&definition_gvk(), &next, &rv).await?;
        counter!("store_writes", 1u64);
        Ok(updated)
    }

    async fn release(&self, obj: &Json) -> KordaResult<()> {
        let remaining: Vec<String> = meta::finalizers(obj).into_iter().filter(|f| f != FINALIZER).collect();
        let mut next = obj.clone();
        meta::set_finalizers(&mut next, &remaining);
        let rv = meta::resource_version(obj).unwrap_or_default().to_string();
        self.store().update(&definition_gvk(), &next, &rv).await?;
        counter!("store_writes", 1u64);
        Ok(())
    }

    async fn write_status(&self, obj: &Json, status: Json) -> KordaResult<()> {
        if obj.get("status") == Some(&status) {
            return Ok(());
        }
        let mut next = obj.clone();
        next["status"] = status;
        self.store().update_status(&definition_gvk(), &next).await?;
        counter!("store_writes", 1u64);
        Ok(())
    }
}

#[async_trait]
impl Reconciler for DefinitionReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> KordaResult<Outcome> {
        let gvk = definition_gvk();
        let Some(obj) = self.store().get(&gvk, key).await? else {
            self.engine.remove_definition(&key.name).await?;
            return Ok(Outcome::Done);
        };
        if meta::is_deleting(&obj) {
            if meta::finalizers(&obj).iter().any(|f| f == FINALIZER) {
                self.engine.remove_definition(&key.name).await?;
                self.release(&obj).await?;
                info!(definition = %key.name, "definition removed");
            }
            return Ok(Outcome::Done);
        }

        let obj = self.ensure_finalizer(obj).await?;
        let generation = meta::generation(&obj).unwrap_or(0);
        let compiled = match Definition::from_value(obj.clone()) {
            Ok(def) => self.engine.apply_definition(&def).await,
            Err(e) => Err(KordaError::InvalidDefinition(format!("{:#}", e))),
        };
        let status = match compiled {
            Ok(graph) => active_status(&graph, generation),
            Err(e) if e.is_retryable() => {
                debug!(definition = %key.name, error = %e, "definition not served yet");
                return Err(e);
            }
            Err(e) => {
                warn!(definition = %key.name, error = %e, "definition rejected");
                self.engine.remove_definition(&key.name).await?;
                inactive_status(&e, generation)
            }
        };
        self.write_status(&obj, status).await?;
        Ok(Outcome::Done)
    }
}

/// Status of a compiled, served definition.
pub fn active_status(graph: &Graph, generation: i64) -> Json {
    let resources: Vec<Json> = graph
        .forward()
        .map(|n| json!({ "id": n.id, "dependencies": n.dependencies.iter().collect::<Vec<_>>() }))
        .collect();
    json!({
        "state": "Active",
        "observedGeneration": generation,
        "topologicalOrder": graph.order(),
        "resources": resources,
        "conditions": [{
            "type": "Ready",
            "status": "True",
            "reason": "Compiled",
            "message": format!("serving {}", graph.gvk),
        }]
    })
}

/// Status of a definition that failed to compile or register.
pub fn inactive_status(err: &KordaError, generation: i64) -> Json {
    json!({
        "state": "Inactive",
        "observedGeneration": generation,
        "conditions": [{
            "type": "Ready",
            "status": "False",
            "reason": err.reason(),
            "message": err.to_string(),
        }]
    })
}

/// Watch definitions and keep the engine in step with them.
pub fn start_definition_controller(engine: Arc<Engine>, cfg: &RuntimeConfig) -> Arc<Controller> {
    let store = Arc::clone(engine.store());
    Controller::start(definition_gvk(), Vec::new(), store, Arc::new(DefinitionReconciler::new(engine)), cfg)
}
