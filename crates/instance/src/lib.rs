//! Korda instance reconciler.
//!
//! One pass walks the compiled graph for one instance: forward order to
//! create and update children, reverse order to tear them down once the
//! instance is being deleted. Passes are level-triggered: anything not ready
//! yet is reported as retryable and picked up again by the work queue.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use korda_core::{labels, meta, Gvk, KordaError, KordaResult, ObjectKey, FINALIZER};
use korda_delta::{Comparator, Diff};
use korda_expr::{Builtin, Evaluator, MapContext, SCHEMA_ROOT};
use korda_graph::{Graph, Node};
use korda_runtime::{Outcome, Reconciler, ReconcilerFactory};
use korda_store::{ResourceStore, StoreError, WatchFilter};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

/// Optimistic-concurrency retries per resource within one pass.
const CONFLICT_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Pending,
    Progressing,
    Ready,
    Failed,
    Deleting,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Progressing => "Progressing",
            Self::Ready => "Ready",
            Self::Failed => "Failed",
            Self::Deleting => "Deleting",
        }
    }

    /// Phase recorded on an instance; `Pending` before the first pass.
    pub fn of(instance: &Json) -> Phase {
        match instance.pointer("/status/phase").and_then(Json::as_str) {
            Some("Progressing") => Self::Progressing,
            Some("Ready") => Self::Ready,
            Some("Failed") => Self::Failed,
            Some("Deleting") => Self::Deleting,
            _ => Self::Pending,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// What the last pass knows about one (instance, template) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedResource {
    pub id: String,
    pub key: ObjectKey,
    pub desired: Json,
    pub observed: Option<Json>,
    pub last_delta: Vec<Diff>,
    pub ready: bool,
}

#[derive(Default)]
struct Tracking {
    records: FxHashMap<ObjectKey, BTreeMap<String, MaterializedResource>>,
    /// Instances that failed terminally, by the generation that failed.
    failed: FxHashMap<ObjectKey, i64>,
}

/// Applies one compiled graph to instances of its type.
pub struct InstanceReconciler {
    graph: Arc<Graph>,
    store: Arc<dyn ResourceStore>,
    evaluator: Arc<dyn Evaluator>,
    tracking: Mutex<Tracking>,
}

/// Outcome of the forward walk before status is written.
struct Walk {
    resources: Vec<(String, bool)>,
    blocked: Option<KordaError>,
    ctx: MapContext,
}

impl InstanceReconciler {
    pub fn new(graph: Arc<Graph>, store: Arc<dyn ResourceStore>, evaluator: Arc<dyn Evaluator>) -> Self {
        Self { graph, store, evaluator, tracking: Mutex::new(Tracking::default()) }
    }

    pub fn graph(&self) -> &Arc<Graph> { &self.graph }

    fn tracking(&self) -> std::sync::MutexGuard<'_, Tracking> { self.tracking.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Records of the last pass for `key`, in forward order.
    pub fn materialized(&self, key: &ObjectKey) -> Vec<MaterializedResource> {
        let tracking = self.tracking();
        let Some(records) = tracking.records.get(key) else { return Vec::new() };
        self.graph.forward().filter_map(|n| records.get(&n.id).cloned()).collect()
    }

    fn record(&self, key: &ObjectKey, rec: MaterializedResource) {
        self.tracking().records.entry(key.clone()).or_default().insert(rec.id.clone(), rec);
    }

    fn untrack(&self, key: &ObjectKey) {
        let mut t = self.tracking();
        t.records.remove(key);
        t.failed.remove(key);
    }

    /// One pass for the instance behind `key`.
    pub async fn reconcile_instance(&self, key: &ObjectKey) -> KordaResult<Outcome> {
        let gvk = &self.graph.gvk;
        let Some(instance) = self.store.get(gvk, key).await? else {
            debug!(gvk = %gvk, key = %key, "instance gone");
            self.untrack(key);
            return Ok(Outcome::Done);
        };
        if meta::is_deleting(&instance) {
            return self.finalize(key, instance).await;
        }

        let generation = meta::generation(&instance).unwrap_or(0);
        if self.tracking().failed.get(key) == Some(&generation) {
            debug!(key = %key, generation, "instance failed at this generation; waiting for a change");
            return Ok(Outcome::Done);
        }
        self.tracking().failed.remove(key);

        let instance = self.ensure_finalizer(instance).await?;
        match self.walk(key, &instance).await {
            Ok(walk) => self.conclude(key, &instance, walk).await,
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                warn!(gvk = %gvk, key = %key, error = %e, "instance failed");
                self.prune(&instance).await?;
                let resources = self.materialized(key).into_iter().map(|r| (r.id, r.ready)).collect::<Vec<_>>();
                let status = status_block(Phase::Failed, Some(e.reason()), Some(e.to_string()), generation, &self.entries(&resources));
                self.write_status(&instance, status).await?;
                self.tracking().failed.insert(key.clone(), generation);
                Err(e)
            }
        }
    }

    async fn ensure_finalizer(&self, instance: Json) -> KordaResult<Json> {
        let mut finalizers = meta::finalizers(&instance);
        if finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(instance);
        }
        finalizers.push(FINALIZER.to_string());
        let mut next = instance.clone();
        meta::set_finalizers(&mut next, &finalizers);
        let rv = meta::resource_version(&instance).unwrap_or_default().to_string();
        let updated = self.store.update(&self.graph.gvk, &next, &rv).await?;
        counter!("store_writes", 1u64);
        Ok(updated)
    }

    /// Forward walk: resolve, apply and check readiness of each template until
    /// one is blocked on a dependency.
    async fn walk(&self, key: &ObjectKey, instance: &Json) -> KordaResult<Walk> {
        let mut view = instance.clone();
        view["spec"] = self.graph.schema.apply_defaults(instance.get("spec").unwrap_or(&Json::Null));
        let mut ctx = MapContext::default().with(SCHEMA_ROOT, view);
        for node in self.graph.nodes() {
            ctx.mark_unavailable(node.id.clone());
        }

        let mut ready: BTreeMap<&str, bool> = BTreeMap::new();
        let mut resources = Vec::with_capacity(self.graph.nodes().len());
        let mut blocked = None;
        for node in self.graph.forward() {
            if let Some(dep) = node.dependencies.iter().find(|d| !ready.get(d.as_str()).copied().unwrap_or(false)) {
                blocked = Some(KordaError::DependencyNotReady {
                    resource: node.id.clone(),
                    dependency: dep.clone(),
                    detail: format!("{} is not ready", dep),
                });
                break;
            }
            let mut desired = match korda_expr::resolve(&node.template, &ctx, self.evaluator.as_ref()) {
                Ok(v) => v,
                Err(e) if e.error.is_pending() => {
                    blocked = Some(KordaError::DependencyNotReady {
                        resource: node.id.clone(),
                        dependency: e.error.pending_root().unwrap_or_default().to_string(),
                        detail: e.to_string(),
                    });
                    break;
                }
                Err(e) => {
                    return Err(KordaError::InvalidExpression {
                        resource: node.id.clone(),
                        field: e.path.to_string(),
                        reason: e.error.to_string(),
                    })
                }
            };
            self.decorate(&mut desired, node, instance);
            let (observed, delta) = self.apply(node, &desired).await?;
            ctx.insert(node.id.clone(), observed.clone());
            let is_ready = self.is_ready(node, &ctx)?;
            ready.insert(node.id.as_str(), is_ready);
            resources.push((node.id.clone(), is_ready));
            let child_key = ObjectKey::of(&observed).unwrap_or_else(|| ObjectKey::new(None, node.id.clone()));
            self.record(
                key,
                MaterializedResource { id: node.id.clone(), key: child_key, desired, observed: Some(observed), last_delta: delta, ready: is_ready },
            );
        }
        Ok(Walk { resources, blocked, ctx })
    }

    /// Ownership labels, owner reference and namespace.
    fn decorate(&self, desired: &mut Json, node: &Node, instance: &Json) {
        let inst_ns = meta::namespace(instance);
        let inst_name = meta::name(instance).unwrap_or_default();
        if desired.get("metadata").map_or(true, |m| !m.is_object()) {
            desired["metadata"] = json!({});
        }
        let Some(m) = meta::metadata_mut(desired) else { return };
        let has_namespace = m.get("namespace").and_then(Json::as_str).is_some();
        if let (false, Some(ns)) = (has_namespace, inst_ns) {
            m.insert("namespace".into(), Json::String(ns.to_string()));
        }
        let same_namespace = m.get("namespace").and_then(Json::as_str) == inst_ns;
        let lbls = m.entry("labels").or_insert_with(|| json!({}));
        if let Some(lbls) = lbls.as_object_mut() {
            lbls.insert(labels::OWNED.into(), json!("true"));
            lbls.insert(labels::INSTANCE_KIND.into(), json!(self.graph.gvk.kind));
            lbls.insert(labels::INSTANCE_NAMESPACE.into(), json!(inst_ns.unwrap_or_default()));
            lbls.insert(labels::INSTANCE_NAME.into(), json!(inst_name));
            lbls.insert(labels::RESOURCE_ID.into(), json!(node.id));
        }
        if let (true, Some(uid)) = (same_namespace, meta::uid(instance)) {
            m.insert(
                "ownerReferences".into(),
                json!([{
                    "apiVersion": self.graph.gvk.api_version(),
                    "kind": self.graph.gvk.kind,
                    "name": inst_name,
                    "uid": uid,
                    "controller": true,
                    "blockOwnerDeletion": true
                }]),
            );
        }
    }

    /// Create, update or leave alone. Updates carry the observed resource
    /// version; on conflict the object is re-read and compared again.
    async fn apply(&self, node: &Node, desired: &Json) -> KordaResult<(Json, Vec<Diff>)> {
        let key = ObjectKey::of(desired)
            .ok_or_else(|| KordaError::Failed(format!("resource {:?} resolved without metadata.name", node.id)))?;
        let comparator = Comparator::new().ignore_observed_extras();
        for attempt in 0..CONFLICT_RETRIES {
            match self.store.get(&node.gvk, &key).await? {
                None => match self.store.create(&node.gvk, desired).await {
                    Ok(created) => {
                        counter!("store_writes", 1u64);
                        info!(resource = %node.id, gvk = %node.gvk, key = %key, "created");
                        let delta = comparator.compare(desired, &Json::Object(Default::default()));
                        return Ok((created, delta));
                    }
                    Err(StoreError::Conflict(msg)) => debug!(resource = %node.id, attempt, %msg, "create raced; re-reading"),
                    Err(e) => return Err(e.into()),
                },
                Some(observed) => {
                    if meta::is_deleting(&observed) {
                        return Err(KordaError::Transient(format!("{} {} is terminating", node.gvk.kind, key)));
                    }
                    let delta = comparator.compare(desired, &observed);
                    if delta.is_empty() {
                        return Ok((observed, delta));
                    }
                    let rv = meta::resource_version(&observed).unwrap_or_default().to_string();
                    let mut merged = observed.clone();
                    overlay(&mut merged, desired);
                    match self.store.update(&node.gvk, &merged, &rv).await {
                        Ok(updated) => {
                            counter!("store_writes", 1u64);
                            info!(resource = %node.id, gvk = %node.gvk, key = %key, changes = delta.len(), "updated");
                            return Ok((updated, delta));
                        }
                        Err(StoreError::Conflict(msg)) => debug!(resource = %node.id, attempt, %msg, "update conflict; re-reading"),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Err(KordaError::Transient(format!("{} {} kept conflicting after {} attempts", node.gvk.kind, key, CONFLICT_RETRIES)))
    }

    fn is_ready(&self, node: &Node, ctx: &MapContext) -> KordaResult<bool> {
        for cond in &node.ready_when {
            match korda_expr::evaluate_condition(&cond.template, ctx, self.evaluator.as_ref()) {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(e) if e.is_pending() => return Ok(false),
                Err(e) => {
                    return Err(KordaError::InvalidExpression {
                        resource: node.id.clone(),
                        field: cond.path.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(true)
    }

    async fn conclude(&self, key: &ObjectKey, instance: &Json, walk: Walk) -> KordaResult<Outcome> {
        let generation = meta::generation(instance).unwrap_or(0);
        let all_ready = walk.blocked.is_none()
            && walk.resources.len() == self.graph.nodes().len()
            && walk.resources.iter().all(|(_, r)| *r);
        let ready_ids: Vec<&str> = walk.resources.iter().filter(|(_, r)| *r).map(|(id, _)| id.as_str()).collect();
        let mut resources: Vec<(String, bool)> = walk.resources.clone();
        for node in self.graph.forward().skip(walk.resources.len()) {
            resources.push((node.id.clone(), false));
        }

        let waiting = walk.blocked.clone().or_else(|| {
            walk.resources.iter().find(|(_, r)| !*r).map(|(id, _)| KordaError::DependencyNotReady {
                resource: key.to_string(),
                dependency: id.clone(),
                detail: "readiness conditions not met".into(),
            })
        });
        let entries = self.entries(&resources);
        let mut status = match &waiting {
            None if all_ready => status_block(Phase::Ready, None, None, generation, &entries),
            Some(e) => status_block(Phase::Progressing, Some(e.reason()), Some(e.to_string()), generation, &entries),
            None => status_block(Phase::Progressing, None, None, generation, &entries),
        };
        for output in &self.graph.outputs {
            if !output.dependencies.iter().all(|d| ready_ids.contains(&d.as_str())) {
                continue;
            }
            match korda_expr::render(&output.field.template, &walk.ctx, self.evaluator.as_ref()) {
                Ok(v) => {
                    output.path().set(&mut status, v);
                }
                Err(e) => debug!(key = %key, output = %output.path(), error = %e, "status output skipped"),
            }
        }
        self.prune(instance).await?;
        self.write_status(instance, status).await?;

        match waiting {
            None => {
                debug!(gvk = %self.graph.gvk, key = %key, "instance ready");
                Ok(Outcome::Done)
            }
            Some(e) => Err(e),
        }
    }

    /// `status.resources` entries. Each carries its template's type so a later
    /// graph without that template can still find the children to prune.
    fn entries(&self, resources: &[(String, bool)]) -> Vec<Json> {
        resources
            .iter()
            .map(|(id, ready)| match self.graph.node(id) {
                Some(n) => json!({ "id": id, "apiVersion": n.gvk.api_version(), "kind": n.gvk.kind, "ready": ready }),
                None => json!({ "id": id, "ready": ready }),
            })
            .collect()
    }

    fn owned_by(&self, instance: &Json, id: &str) -> WatchFilter {
        WatchFilter::all()
            .label(labels::INSTANCE_KIND, self.graph.gvk.kind.clone())
            .label(labels::INSTANCE_NAME, meta::name(instance).unwrap_or_default())
            .label(labels::INSTANCE_NAMESPACE, meta::namespace(instance).unwrap_or_default())
            .label(labels::RESOURCE_ID, id)
    }

    /// Delete children recorded by an earlier pass whose template the current
    /// graph no longer has, or now declares with a different type.
    async fn prune(&self, instance: &Json) -> KordaResult<()> {
        let Some(recorded) = instance.pointer("/status/resources").and_then(Json::as_array) else { return Ok(()) };
        for entry in recorded.iter().rev() {
            let field = move |k: &str| entry.get(k).and_then(Json::as_str);
            let (Some(id), Some(api_version), Some(kind)) = (field("id"), field("apiVersion"), field("kind")) else { continue };
            let gvk = Gvk::from_api_version(api_version, kind);
            if self.graph.node(id).is_some_and(|n| n.gvk == gvk) {
                continue;
            }
            let children = match self.store.list(&gvk, &self.owned_by(instance, id)).await {
                Ok(c) => c,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            for child in children.iter().filter(|c| !meta::is_deleting(c)) {
                let Some(child_key) = ObjectKey::of(child) else { continue };
                match self.store.delete(&gvk, &child_key).await {
                    Ok(()) => {
                        counter!("store_writes", 1u64);
                        info!(resource = id, gvk = %gvk, key = %child_key, "pruned");
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Replace `.status` unless it already holds exactly `status`.
    async fn write_status(&self, instance: &Json, status: Json) -> KordaResult<()> {
        if instance.get("status") == Some(&status) {
            return Ok(());
        }
        let mut next = instance.clone();
        next["status"] = status;
        self.store.update_status(&self.graph.gvk, &next).await?;
        counter!("store_writes", 1u64);
        Ok(())
    }

    /// Deletion: children go in reverse order, one at a time. The finalizer is
    /// released only once every child is gone.
    async fn finalize(&self, key: &ObjectKey, instance: Json) -> KordaResult<Outcome> {
        if !meta::finalizers(&instance).iter().any(|f| f == FINALIZER) {
            self.untrack(key);
            return Ok(Outcome::Done);
        }
        let generation = meta::generation(&instance).unwrap_or(0);
        let previous: Vec<Json> = instance.pointer("/status/resources").and_then(Json::as_array).cloned().unwrap_or_default();
        self.prune(&instance).await?;

        for node in self.graph.reverse() {
            let children = self.store.list(&node.gvk, &self.owned_by(&instance, &node.id)).await?;
            for child in &children {
                let Some(child_key) = ObjectKey::of(child) else { continue };
                if !meta::is_deleting(child) {
                    match self.store.delete(&node.gvk, &child_key).await {
                        Ok(()) => {
                            counter!("store_writes", 1u64);
                            info!(resource = %node.id, gvk = %node.gvk, key = %child_key, "deleted");
                        }
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                if self.store.get(&node.gvk, &child_key).await?.is_some() {
                    let err = KordaError::DeletionBlocked { resource: node.id.clone(), key: child_key.to_string() };
                    let status = status_block(Phase::Deleting, Some(err.reason()), Some(err.to_string()), generation, &previous);
                    self.write_status(&instance, status).await?;
                    return Err(err);
                }
            }
            if let Some(records) = self.tracking().records.get_mut(key) {
                records.remove(&node.id);
            }
        }

        let remaining: Vec<String> = meta::finalizers(&instance).into_iter().filter(|f| f != FINALIZER).collect();
        let mut next = instance.clone();
        meta::set_finalizers(&mut next, &remaining);
        let rv = meta::resource_version(&instance).unwrap_or_default().to_string();
        self.store.update(&self.graph.gvk, &next, &rv).await?;
        counter!("store_writes", 1u64);
        self.untrack(key);
        info!(gvk = %self.graph.gvk, key = %key, "instance finalized");
        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Reconciler for InstanceReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> KordaResult<Outcome> { self.reconcile_instance(key).await }
}

/// Hands every new graph a fresh [`InstanceReconciler`].
pub struct InstanceFactory {
    store: Arc<dyn ResourceStore>,
    evaluator: Arc<dyn Evaluator>,
}

impl InstanceFactory {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self { Self::with_evaluator(store, Arc::new(Builtin)) }

    pub fn with_evaluator(store: Arc<dyn ResourceStore>, evaluator: Arc<dyn Evaluator>) -> Self { Self { store, evaluator } }
}

impl ReconcilerFactory for InstanceFactory {
    fn reconciler(&self, graph: Arc<Graph>) -> Arc<dyn Reconciler> {
        Arc::new(InstanceReconciler::new(graph, Arc::clone(&self.store), Arc::clone(&self.evaluator)))
    }
}

fn status_block(phase: Phase, reason: Option<&str>, message: Option<String>, generation: i64, resources: &[Json]) -> Json {
    let mut status = json!({
        "phase": phase.as_str(),
        "observedGeneration": generation,
        "resources": resources,
    });
    if let Some(r) = reason {
        status["reason"] = json!(r);
    }
    if let Some(m) = message {
        status["message"] = json!(m);
    }
    status
}

/// Deep-merge `desired` into `base`: objects merge by key, everything else is replaced.
fn overlay(base: &mut Json, desired: &Json) {
    match (base, desired) {
        (Json::Object(b), Json::Object(d)) => {
            for (k, v) in d {
                match b.get_mut(k) {
                    Some(slot) => overlay(slot, v),
                    None => {
                        b.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (slot, v) => *slot = v.clone(),
    }
}
