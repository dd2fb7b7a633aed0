use std::sync::Arc;
use std::time::Duration;

use korda_api::{definition_gvk, start_definition_controller, Engine};
use korda_core::{meta, Gvk, ObjectKey};
use korda_runtime::RuntimeConfig;
use korda_store::{MemoryRegistrar, MemoryStore, ResourceStore};
use serde_json::{json, Value as Json};

fn webapp() -> Gvk { Gvk::new("korda.dev", "v1alpha1", "WebApp") }
fn config_map() -> Gvk { Gvk::new("", "v1", "ConfigMap") }

fn definition(name: &str, value: &str) -> Json {
    json!({
        "apiVersion": "korda.dev/v1alpha1",
        "kind": "ResourceGraphDefinition",
        "metadata": { "name": name },
        "spec": {
            "schema": { "apiVersion": "v1alpha1", "kind": "WebApp", "spec": { "name": "string" } },
            "resources": [{
                "id": "config",
                "template": {
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": { "name": "${schema.spec.name}-config" },
                    "data": { "value": value }
                }
            }]
        }
    })
}

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
        backoff_max: Duration::from_millis(50),
        allow_crd_deletion: true,
        ..RuntimeConfig::default()
    }
}

async fn eventually(what: &str, f: impl Fn() -> bool) {
    for _ in 0..300 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn find(store: &MemoryStore, gvk: &Gvk, name: &str) -> Option<Json> {
    store.objects(gvk).into_iter().find(|o| meta::name(o) == Some(name))
}

fn definition_state(store: &MemoryStore, name: &str) -> Option<String> {
    find(store, &definition_gvk(), name).and_then(|d| d.pointer("/status/state").and_then(Json::as_str).map(str::to_string))
}

fn config_value(store: &MemoryStore, name: &str) -> Option<String> {
    find(store, &config_map(), name).and_then(|c| c.pointer("/data/value").and_then(Json::as_str).map(str::to_string))
}

async fn setup() -> (MemoryStore, MemoryRegistrar, Arc<Engine>) {
    let store = MemoryStore::new();
    let registrar = MemoryRegistrar::new(store.clone());
    let engine = Arc::new(Engine::new(Arc::new(store.clone()), Arc::new(registrar.clone()), config()));
    engine.install_definition_type().await.unwrap();
    (store, registrar, engine)
}

#[tokio::test]
async fn definitions_drive_instances_through_updates_and_deletion() {
    let (store, registrar, engine) = setup().await;
    let controller = start_definition_controller(Arc::clone(&engine), &config());
    assert!(controller.running().await);

    store.create(&definition_gvk(), &definition("webapp", "v1")).await.unwrap();
    eventually("definition active", || definition_state(&store, "webapp").as_deref() == Some("Active")).await;
    let def = find(&store, &definition_gvk(), "webapp").unwrap();
    assert_eq!(def["status"]["topologicalOrder"], json!(["config"]));
    assert_eq!(def["status"]["conditions"][0]["status"], "True");
    assert!(registrar.registered().contains(&webapp()));

    store.create(&webapp(), &instance("web")).await.unwrap();
    eventually("child created", || config_value(&store, "web-config").as_deref() == Some("v1")).await;
    eventually("instance ready", || {
        find(&store, &webapp(), "web").and_then(|i| i.pointer("/status/phase").cloned()) == Some(json!("Ready"))
    })
    .await;

    let mut def = find(&store, &definition_gvk(), "webapp").unwrap();
    def["spec"] = definition("webapp", "v2")["spec"].clone();
    let rv = meta::resource_version(&def).unwrap().to_string();
    store.update(&definition_gvk(), &def, &rv).await.unwrap();
    eventually("instance reconciled under the new graph", || config_value(&store, "web-config").as_deref() == Some("v2")).await;

    store.delete(&definition_gvk(), &ObjectKey::new(None, "webapp")).await.unwrap();
    eventually("definition released", || find(&store, &definition_gvk(), "webapp").is_none()).await;
    eventually("controller stopped", || engine.state(&webapp()).is_none()).await;
    assert!(!registrar.registered().contains(&webapp()));

    controller.stop(Duration::from_millis(500)).await.unwrap();
    engine.shutdown().await;
}

#[tokio::test]
async fn rejected_definitions_are_marked_inactive() {
    let (store, _, engine) = setup().await;
    let controller = start_definition_controller(Arc::clone(&engine), &config());
    assert!(controller.running().await);

    let cyclic = json!({
        "apiVersion": "korda.dev/v1alpha1",
        "kind": "ResourceGraphDefinition",
        "metadata": { "name": "loop" },
        "spec": {
            "schema": { "apiVersion": "v1alpha1", "kind": "Loop", "spec": { "name": "string" } },
            "resources": [
                { "id": "a", "template": { "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "${b.metadata.name}" } } },
                { "id": "b", "template": { "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "${a.metadata.name}" } } }
            ]
        }
    });
    store.create(&definition_gvk(), &cyclic).await.unwrap();
    eventually("definition inactive", || definition_state(&store, "loop").as_deref() == Some("Inactive")).await;

    let def = find(&store, &definition_gvk(), "loop").unwrap();
    let condition = &def["status"]["conditions"][0];
    assert_eq!(condition["status"], "False");
    assert_eq!(condition["reason"], "CyclicDependency");
    assert!(engine.graph("loop").is_none());
    assert!(engine.manager().registered().is_empty());

    controller.stop(Duration::from_millis(500)).await.unwrap();
    engine.shutdown().await;
}
