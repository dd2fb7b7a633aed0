use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use korda_core::{labels, Definition, Gvk, KordaError, KordaResult, ObjectKey};
use korda_graph::Graph;
use korda_runtime::{DynamicControllerManager, LifecycleState, Outcome, Reconciler, ReconcilerFactory, RuntimeConfig};
use korda_store::{MemoryStore, ResourceStore};
use serde_json::{json, Value as Json};

type Calls = Arc<Mutex<Vec<(u64, ObjectKey)>>>;

struct Recording {
    fingerprint: u64,
    calls: Calls,
    delay: Duration,
    fail_first: Arc<Mutex<u32>>,
    panic_first: Arc<Mutex<u32>>,
}

#[async_trait]
impl Reconciler for Recording {
    async fn reconcile(&self, key: &ObjectKey) -> KordaResult<Outcome> {
        tokio::time::sleep(self.delay).await;
        self.calls.lock().unwrap().push((self.fingerprint, key.clone()));
        {
            let mut left = self.panic_first.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                drop(left);
                panic!("reconciler bug for {}", key);
            }
        }
        let mut left = self.fail_first.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(KordaError::DependencyNotReady { resource: "b".into(), dependency: "a".into(), detail: "not yet".into() });
        }
        Ok(Outcome::Done)
    }
}

#[derive(Clone, Default)]
struct Factory {
    calls: Calls,
    delay: Duration,
    fail_first: Arc<Mutex<u32>>,
    panic_first: Arc<Mutex<u32>>,
}

impl ReconcilerFactory for Factory {
    fn reconciler(&self, graph: Arc<Graph>) -> Arc<dyn Reconciler> {
        Arc::new(Recording {
            fingerprint: graph.fingerprint(),
            calls: Arc::clone(&self.calls),
            delay: self.delay,
            fail_first: Arc::clone(&self.fail_first),
            panic_first: Arc::clone(&self.panic_first),
        })
    }
}

impl Factory {
    fn seen(&self, fingerprint: u64) -> Vec<ObjectKey> {
        self.calls.lock().unwrap().iter().filter(|(f, _)| *f == fingerprint).map(|(_, k)| k.clone()).collect()
    }
}

fn graph(data_value: &str) -> Arc<Graph> {
    let def = Definition::from_value(json!({
        "kind": "ResourceGraphDefinition",
        "metadata": { "name": "webapp" },
        "spec": {
            "schema": { "apiVersion": "v1alpha1", "kind": "WebApp", "spec": { "name": "string" } },
            "resources": [{
                "id": "config",
                "template": {
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": { "name": "${schema.spec.name}" },
                    "data": { "value": data_value }
                }
            }]
        }
    }))
    .unwrap();
    Arc::new(korda_graph::build(&def).unwrap())
}

fn webapp() -> Gvk { Gvk::new("korda.dev", "v1alpha1", "WebApp") }

fn instance(name: &str) -> Json {
    json!({ "apiVersion": "korda.dev/v1alpha1", "kind": "WebApp", "metadata": { "name": name, "namespace": "default" }, "spec": { "name": name } })
}

fn config() -> RuntimeConfig {
    RuntimeConfig {
        workers: 2,
        drain_timeout: Duration::from_millis(500),
        resync: Duration::ZERO,
        start_timeout: Duration::from_secs(2),
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
        ..RuntimeConfig::default()
    }
}

async fn eventually(what: &str, f: impl Fn() -> bool) {
    for _ in 0..200 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn register_reconciles_listing_and_later_events() {
    let store = MemoryStore::new();
    store.create(&webapp(), &instance("a")).await.unwrap();
    store.create(&webapp(), &instance("b")).await.unwrap();
    let factory = Factory::default();
    let mgr = DynamicControllerManager::new(Arc::new(store.clone()), Arc::new(factory.clone()), config());

    let g = graph("v1");
    mgr.register(Arc::clone(&g)).await.unwrap();
    assert_eq!(mgr.state(&webapp()), Some(LifecycleState::Running));
    eventually("initial listing", || factory.seen(g.fingerprint()).len() >= 2).await;

    store.create(&webapp(), &instance("c")).await.unwrap();
    eventually("new instance", || factory.seen(g.fingerprint()).contains(&ObjectKey::namespaced("default", "c"))).await;
    mgr.shutdown().await;
}

#[tokio::test]
async fn identical_graph_is_a_noop() {
    let store = MemoryStore::new();
    let factory = Factory::default();
    let mgr = DynamicControllerManager::new(Arc::new(store), Arc::new(factory), config());
    let g = graph("v1");
    mgr.register(Arc::clone(&g)).await.unwrap();
    let first = mgr.graph(&webapp()).unwrap();
    mgr.register(graph("v1")).await.unwrap();
    assert!(Arc::ptr_eq(&first, &mgr.graph(&webapp()).unwrap()));
    assert_eq!(mgr.registered(), vec![webapp()]);
    mgr.shutdown().await;
}

#[tokio::test]
async fn changed_graph_swaps_and_reconciles_every_instance() {
    let store = MemoryStore::new();
    for n in ["a", "b", "c"] {
        store.create(&webapp(), &instance(n)).await.unwrap();
    }
    let factory = Factory::default();
    let mgr = DynamicControllerManager::new(Arc::new(store.clone()), Arc::new(factory.clone()), config());
    let v1 = graph("v1");
    let v2 = graph("v2");
    assert_ne!(v1.fingerprint(), v2.fingerprint());

    mgr.register(Arc::clone(&v1)).await.unwrap();
    eventually("v1 listing", || factory.seen(v1.fingerprint()).len() >= 3).await;
    mgr.register(Arc::clone(&v2)).await.unwrap();
    assert!(mgr.graph(&webapp()).unwrap().same_as(&v2));

    eventually("v2 listing", || {
        let seen = factory.seen(v2.fingerprint());
        ["a", "b", "c"].iter().all(|n| seen.contains(&ObjectKey::namespaced("default", n)))
    })
    .await;

    let before = factory.seen(v1.fingerprint()).len();
    store.create(&webapp(), &instance("d")).await.unwrap();
    eventually("event after swap", || factory.seen(v2.fingerprint()).contains(&ObjectKey::namespaced("default", "d"))).await;
    assert_eq!(factory.seen(v1.fingerprint()).len(), before, "old controller must be stopped");
    mgr.shutdown().await;
}

#[tokio::test]
async fn child_events_map_back_to_the_owning_instance() {
    let store = MemoryStore::new();
    let factory = Factory::default();
    let mgr = DynamicControllerManager::new(Arc::new(store.clone()), Arc::new(factory.clone()), config());
    let g = graph("v1");
    mgr.register(Arc::clone(&g)).await.unwrap();

    let child = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": "web",
            "namespace": "default",
            "labels": {
                labels::INSTANCE_KIND: "WebApp",
                labels::INSTANCE_NAME: "web",
                labels::INSTANCE_NAMESPACE: "default"
            }
        }
    });
    let stray = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "stray", "namespace": "default" } });
    store.create(&Gvk::new("", "v1", "ConfigMap"), &stray).await.unwrap();
    store.create(&Gvk::new("", "v1", "ConfigMap"), &child).await.unwrap();
    eventually("child event", || factory.seen(g.fingerprint()).contains(&ObjectKey::namespaced("default", "web"))).await;
    assert!(!factory.seen(g.fingerprint()).iter().any(|k| k.name == "stray"));
    mgr.shutdown().await;
}

#[tokio::test]
async fn retryable_errors_are_retried() {
    let store = MemoryStore::new();
    store.create(&webapp(), &instance("a")).await.unwrap();
    let factory = Factory { fail_first: Arc::new(Mutex::new(2)), ..Factory::default() };
    let mgr = DynamicControllerManager::new(Arc::new(store), Arc::new(factory.clone()), config());
    let g = graph("v1");
    mgr.register(Arc::clone(&g)).await.unwrap();
    eventually("two retries", || factory.seen(g.fingerprint()).len() >= 3).await;
    mgr.shutdown().await;
}

#[tokio::test]
async fn panicking_pass_is_retried_and_worker_survives() {
    let store = MemoryStore::new();
    store.create(&webapp(), &instance("a")).await.unwrap();
    let factory = Factory { panic_first: Arc::new(Mutex::new(1)), ..Factory::default() };
    let cfg = RuntimeConfig { workers: 1, ..config() };
    let mgr = DynamicControllerManager::new(Arc::new(store.clone()), Arc::new(factory.clone()), cfg);
    let g = graph("v1");
    mgr.register(Arc::clone(&g)).await.unwrap();
    let a = ObjectKey::namespaced("default", "a");
    eventually("retry after panic", || factory.seen(g.fingerprint()).iter().filter(|k| **k == a).count() >= 2).await;

    store.create(&webapp(), &instance("b")).await.unwrap();
    eventually("single worker still serving", || factory.seen(g.fingerprint()).contains(&ObjectKey::namespaced("default", "b"))).await;
    assert_eq!(mgr.state(&webapp()), Some(LifecycleState::Running));
    mgr.shutdown().await;
}

#[tokio::test]
async fn unregister_drains_and_reports_timeouts() {
    let store = MemoryStore::new();
    store.create(&webapp(), &instance("a")).await.unwrap();
    let factory = Factory::default();
    let mgr = DynamicControllerManager::new(Arc::new(store.clone()), Arc::new(factory), config());
    mgr.register(graph("v1")).await.unwrap();
    mgr.unregister(&webapp()).await.unwrap();
    assert_eq!(mgr.state(&webapp()), None);
    assert!(mgr.registered().is_empty());
    mgr.unregister(&webapp()).await.unwrap();

    let slow = Factory { delay: Duration::from_secs(5), ..Factory::default() };
    let mgr = DynamicControllerManager::new(Arc::new(store), Arc::new(slow), config());
    mgr.register(graph("v1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = mgr.unregister(&webapp()).await.unwrap_err();
    assert!(matches!(err, KordaError::DrainTimeout { .. }));
    assert_eq!(mgr.state(&webapp()), None);
}
