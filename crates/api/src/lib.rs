//! Korda engine façade.
//!
//! [`Engine`] ties the pieces together: it compiles definitions, registers the
//! derived types, and hands compiled graphs to the dynamic controller manager.
//! Frontends (the CLI, the definition controller) only talk to this crate.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use korda_core::{Definition, Gvk, KordaError, KordaResult, DEFINITION_API_VERSION, DEFINITION_KIND};
use korda_expr::{Builtin, Evaluator};
use korda_graph::{Builder, Graph};
use korda_instance::InstanceFactory;
use korda_runtime::{DynamicControllerManager, LifecycleState, RuntimeConfig};
use korda_schema::{DerivedSchema, PrinterCol};
use korda_store::{ResourceStore, TypeRegistrar};
use serde_json::json;
use tracing::{info, warn};

pub mod definitions;
pub mod load;

pub use definitions::{active_status, inactive_status, start_definition_controller, DefinitionReconciler};
pub use load::{parse_definition, read_definition, Limits};

/// Type of the definition documents themselves.
pub fn definition_gvk() -> Gvk { Gvk::from_api_version(DEFINITION_API_VERSION, DEFINITION_KIND) }

/// Cluster-scoped schema for `ResourceGraphDefinition`; the body is validated by the builder.
pub fn definition_schema() -> DerivedSchema {
    let open = json!({ "type": "object", "x-kubernetes-preserve-unknown-fields": true });
    DerivedSchema {
        gvk: definition_gvk(),
        spec: open.clone(),
        status: open,
        printer_cols: vec![
            PrinterCol { name: "Kind".into(), json_path: ".spec.schema.kind".into(), type_: "string".into() },
            PrinterCol { name: "State".into(), json_path: ".status.state".into(), type_: "string".into() },
            PrinterCol { name: "Age".into(), json_path: ".metadata.creationTimestamp".into(), type_: "date".into() },
        ],
        namespaced: false,
    }
}

/// Dry-run report for `create --dry-run`: validates `def` and, when a stored
/// version exists, lists what would change.
pub fn preview_report(def: &Definition, existing: Option<&Definition>) -> KordaResult<String> {
    let diffs = korda_graph::preview(def, existing)?;
    if existing.is_none() {
        return Ok(format!("Would create new ResourceGraphDefinition: {}", def.name));
    }
    Ok(format!("Would update ResourceGraphDefinition: {}\n{}", def.name, korda_delta::render_report(&diffs).trim_end()))
}

pub struct Engine {
    store: Arc<dyn ResourceStore>,
    registrar: Arc<dyn TypeRegistrar>,
    evaluator: Arc<dyn Evaluator>,
    manager: DynamicControllerManager,
    config: RuntimeConfig,
    /// Compiled graphs by definition name.
    graphs: ArcSwap<BTreeMap<String, Arc<Graph>>>,
}

impl Engine {
    pub fn new(store: Arc<dyn ResourceStore>, registrar: Arc<dyn TypeRegistrar>, config: RuntimeConfig) -> Self {
        Self::with_evaluator(store, registrar, Arc::new(Builtin), config)
    }

    pub fn with_evaluator(
        store: Arc<dyn ResourceStore>,
        registrar: Arc<dyn TypeRegistrar>,
        evaluator: Arc<dyn Evaluator>,
        config: RuntimeConfig,
    ) -> Self {
        let factory = Arc::new(InstanceFactory::with_evaluator(Arc::clone(&store), Arc::clone(&evaluator)));
        let manager = DynamicControllerManager::new(Arc::clone(&store), factory, config.clone());
        Self { store, registrar, evaluator, manager, config, graphs: ArcSwap::from_pointee(BTreeMap::new()) }
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> { &self.store }

    pub fn config(&self) -> &RuntimeConfig { &self.config }

    pub fn manager(&self) -> &DynamicControllerManager { &self.manager }

    pub fn graph(&self, name: &str) -> Option<Arc<Graph>> { self.graphs.load().get(name).cloned() }

    pub fn graphs(&self) -> Vec<Arc<Graph>> { self.graphs.load().values().cloned().collect() }

    pub fn state(&self, gvk: &Gvk) -> Option<LifecycleState> { self.manager.state(gvk) }

    pub fn compile(&self, def: &Definition) -> KordaResult<Graph> { Builder::new(self.evaluator.as_ref()).build(def) }

    /// Compile `def` and serve its type. Nothing is registered when compilation fails.
    pub async fn apply_definition(&self, def: &Definition) -> KordaResult<Arc<Graph>> {
        let graph = Arc::new(self.compile(def)?);
        let owner = self
            .graphs
            .load()
            .iter()
            .find(|(name, g)| **name != def.name && g.gvk == graph.gvk)
            .map(|(name, _)| name.clone());
        if let Some(owner) = owner {
            return Err(KordaError::InvalidDefinition(format!("{} is already served by definition {:?}", graph.gvk, owner)));
        }
        if let Some(prev) = self.graph(&def.name) {
            if prev.gvk != graph.gvk {
                info!(definition = %def.name, from = %prev.gvk, to = %graph.gvk, "definition changed its type");
                self.on_definition_removed(&prev.gvk).await?;
            }
        }
        self.on_definition_ready(Arc::clone(&graph)).await?;
        let name = def.name.clone();
        let stored = Arc::clone(&graph);
        self.graphs.rcu(move |current| {
            let mut next = BTreeMap::clone(current);
            next.insert(name.clone(), Arc::clone(&stored));
            next
        });
        Ok(graph)
    }

    /// Register the graph's type and (re)start its controller.
    pub async fn on_definition_ready(&self, graph: Arc<Graph>) -> KordaResult<()> {
        self.registrar.register(&graph.schema).await?;
        self.manager.register(graph).await
    }

    /// Stop serving `gvk`. A drain timeout is logged and teardown continues;
    /// the type itself is only removed when CRD deletion is allowed.
    pub async fn on_definition_removed(&self, gvk: &Gvk) -> KordaResult<()> {
        if let Err(e) = self.manager.unregister(gvk).await {
            warn!(gvk = %gvk, error = %e, "controller teardown");
        }
        if self.config.allow_crd_deletion {
            self.registrar.unregister(gvk).await?;
        } else {
            info!(gvk = %gvk, "type left registered; CRD deletion is disabled");
        }
        Ok(())
    }

    /// Forget the definition called `name`, stopping its controller.
    pub async fn remove_definition(&self, name: &str) -> KordaResult<()> {
        let Some(graph) = self.graph(name) else { return Ok(()) };
        self.on_definition_removed(&graph.gvk).await?;
        self.graphs.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            next.remove(name);
            next
        });
        Ok(())
    }

    /// Register the `ResourceGraphDefinition` type itself.
    pub async fn install_definition_type(&self) -> KordaResult<Gvk> { Ok(self.registrar.register(&definition_schema()).await?) }

    pub async fn shutdown(&self) { self.manager.shutdown().await; }
}

#[cfg(test)]
mod tests {
    use super::*;
    use korda_store::{MemoryRegistrar, MemoryStore};

    fn engine(allow_crd_deletion: bool) -> (MemoryStore, MemoryRegistrar, Engine) {
        let store = MemoryStore::new();
        let registrar = MemoryRegistrar::new(store.clone());
        let cfg = RuntimeConfig { allow_crd_deletion, resync: std::time::Duration::ZERO, ..RuntimeConfig::default() };
        let engine = Engine::new(Arc::new(store.clone()), Arc::new(registrar.clone()), cfg);
        (store, registrar, engine)
    }

    fn def(name: &str, kind: &str) -> Definition {
        Definition::from_value(json!({
            "kind": "ResourceGraphDefinition",
            "metadata": { "name": name },
            "spec": {
                "schema": { "apiVersion": "v1alpha1", "kind": kind, "spec": { "name": "string" } },
                "resources": [{ "id": "config", "template": { "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "${schema.spec.name}" } } }]
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn serves_and_removes_definitions() {
        let (store, registrar, engine) = engine(true);
        let graph = engine.apply_definition(&def("web", "Web")).await.unwrap();
        assert_eq!(engine.state(&graph.gvk), Some(LifecycleState::Running));
        assert_eq!(registrar.registered(), vec![graph.gvk.clone()]);
        assert!(store.has_schema(&graph.gvk));

        engine.remove_definition("web").await.unwrap();
        assert_eq!(engine.state(&graph.gvk), None);
        assert!(engine.graph("web").is_none());
        assert!(registrar.registered().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn keeps_types_unless_deletion_is_allowed() {
        let (_, registrar, engine) = engine(false);
        let graph = engine.apply_definition(&def("web", "Web")).await.unwrap();
        engine.remove_definition("web").await.unwrap();
        assert_eq!(engine.state(&graph.gvk), None);
        assert_eq!(registrar.registered(), vec![graph.gvk.clone()]);
    }

    #[tokio::test]
    async fn one_definition_per_type() {
        let (_, _, engine) = engine(true);
        engine.apply_definition(&def("web", "Web")).await.unwrap();
        let err = engine.apply_definition(&def("other", "Web")).await.unwrap_err();
        assert!(matches!(err, KordaError::InvalidDefinition(m) if m.contains("already served")));

        let moved = engine.apply_definition(&def("web", "Site")).await.unwrap();
        assert_eq!(moved.gvk.kind, "Site");
        assert_eq!(engine.manager().registered(), vec![moved.gvk.clone()]);
        engine.shutdown().await;
    }

    #[test]
    fn preview_reports_create_and_update() {
        let web = def("web", "Web");
        assert_eq!(preview_report(&web, None).unwrap(), "Would create new ResourceGraphDefinition: web");
        let same = preview_report(&web, Some(&web)).unwrap();
        assert!(same.starts_with("Would update ResourceGraphDefinition: web\n"));
        assert!(same.ends_with("No differences found"));
        let changed = preview_report(&def("web", "Site"), Some(&web)).unwrap();
        assert!(changed.contains("Delta comparison results:"));
        assert!(changed.contains("spec.schema.kind"));
    }

    #[test]
    fn definition_type_is_cluster_scoped() {
        let crd = definition_schema().crd().unwrap();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.metadata.name.as_deref(), Some("resourcegraphdefinitions.korda.dev"));
    }
}
