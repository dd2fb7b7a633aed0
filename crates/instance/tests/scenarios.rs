use std::sync::Arc;

use korda_core::{labels, meta, Definition, Gvk, KordaError, ObjectKey, FINALIZER};
use korda_expr::Builtin;
use korda_graph::Graph;
use korda_instance::{InstanceReconciler, Phase};
use korda_runtime::Outcome;
use korda_store::{MemoryStore, ResourceStore};
use serde_json::{json, Value as Json};

fn webapp() -> Gvk { Gvk::new("korda.dev", "v1alpha1", "WebApp") }
fn database() -> Gvk { Gvk::new("example.dev", "v1", "Database") }
fn app() -> Gvk { Gvk::new("example.dev", "v1", "App") }

fn graph() -> Arc<Graph> { graph_from(definition()) }

fn graph_from(def: Json) -> Arc<Graph> { Arc::new(korda_graph::build(&Definition::from_value(def).unwrap()).unwrap()) }

fn definition() -> Json {
    json!({
        "kind": "ResourceGraphDefinition",
        "metadata": { "name": "webapp" },
        "spec": {
            "schema": {
                "apiVersion": "v1alpha1",
                "kind": "WebApp",
                "spec": { "name": "string | required=true", "replicas": "integer | default=2" },
                "status": { "endpoint": "${db.status.endpoint}", "url": "http://${app.metadata.name}" }
            },
            "resources": [
                {
                    "id": "db",
                    "template": {
                        "apiVersion": "example.dev/v1",
                        "kind": "Database",
                        "metadata": { "name": "${schema.spec.name}-db" },
                        "spec": { "size": "small" }
                    },
                    "readyWhen": ["${db.status.ready == true}"]
                },
                {
                    "id": "app",
                    "template": {
                        "apiVersion": "example.dev/v1",
                        "kind": "App",
                        "metadata": { "name": "${schema.spec.name}-app" },
                        "spec": { "database": "${db.status.endpoint}", "replicas": "${schema.spec.replicas}" }
                    }
                }
            ]
        }
    })
}

/// The same definition after `app` was dropped from it.
fn without_app() -> Arc<Graph> {
    let mut def = definition();
    def["spec"]["resources"].as_array_mut().unwrap().truncate(1);
    def["spec"]["schema"]["status"] = json!({ "endpoint": "${db.status.endpoint}" });
    graph_from(def)
}

fn key() -> ObjectKey { ObjectKey::namespaced("default", "web") }
fn db_key() -> ObjectKey { ObjectKey::namespaced("default", "web-db") }
fn app_key() -> ObjectKey { ObjectKey::namespaced("default", "web-app") }

async fn setup() -> (MemoryStore, InstanceReconciler) {
    let store = MemoryStore::new();
    store
        .create(&webapp(), &json!({
            "apiVersion": "korda.dev/v1alpha1",
            "kind": "WebApp",
            "metadata": { "name": "web", "namespace": "default" },
            "spec": { "name": "web" }
        }))
        .await
        .unwrap();
    let rec = InstanceReconciler::new(graph(), Arc::new(store.clone()), Arc::new(Builtin));
    (store, rec)
}

async fn instance(store: &MemoryStore) -> Json { store.get(&webapp(), &key()).await.unwrap().unwrap() }

async fn mark_db_ready(store: &MemoryStore) {
    let mut db = store.get(&database(), &db_key()).await.unwrap().unwrap();
    db["status"] = json!({ "ready": true, "endpoint": "db.default:5432" });
    store.update_status(&database(), &db).await.unwrap();
}

#[tokio::test]
async fn waits_for_dependency_then_becomes_ready() {
    let (store, rec) = setup().await;

    let err = rec.reconcile_instance(&key()).await.unwrap_err();
    assert!(matches!(&err, KordaError::DependencyNotReady { resource, dependency, .. } if resource == "app" && dependency == "db"));
    assert_eq!(store.writes(&database()), 1);
    assert_eq!(store.writes(&app()), 0);
    let inst = instance(&store).await;
    assert_eq!(Phase::of(&inst), Phase::Progressing);
    assert_eq!(inst["status"]["reason"], "DependencyNotReady");
    assert!(inst["status"].get("endpoint").is_none(), "outputs of unready resources are omitted");
    assert!(meta::finalizers(&inst).contains(&FINALIZER.to_string()));

    mark_db_ready(&store).await;
    assert_eq!(rec.reconcile_instance(&key()).await.unwrap(), Outcome::Done);
    let created = store.get(&app(), &app_key()).await.unwrap().unwrap();
    assert_eq!(created["spec"], json!({ "database": "db.default:5432", "replicas": 2 }));
    let inst = instance(&store).await;
    assert_eq!(inst["status"]["phase"], "Ready");
    assert!(inst["status"].get("reason").is_none());
    assert_eq!(inst["status"]["endpoint"], "db.default:5432");
    assert_eq!(inst["status"]["url"], "http://web-app");
    assert_eq!(inst["status"]["observedGeneration"], 1);
    assert_eq!(
        inst["status"]["resources"],
        json!([
            { "id": "db", "apiVersion": "example.dev/v1", "kind": "Database", "ready": true },
            { "id": "app", "apiVersion": "example.dev/v1", "kind": "App", "ready": true }
        ])
    );
    let records = rec.materialized(&key());
    assert_eq!(records.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["db", "app"]);
    assert!(records.iter().all(|r| r.ready));
}

#[tokio::test]
async fn second_pass_without_changes_writes_nothing() {
    let (store, rec) = setup().await;
    let _ = rec.reconcile_instance(&key()).await;
    mark_db_ready(&store).await;
    rec.reconcile_instance(&key()).await.unwrap();

    let writes = store.total_writes();
    let status = instance(&store).await["status"].clone();
    rec.reconcile_instance(&key()).await.unwrap();
    assert_eq!(store.total_writes(), writes);
    assert_eq!(instance(&store).await["status"], status);
    assert!(rec.materialized(&key()).iter().all(|r| r.last_delta.is_empty()));
}

#[tokio::test]
async fn children_carry_ownership() {
    let (store, rec) = setup().await;
    let _ = rec.reconcile_instance(&key()).await;
    let db = store.get(&database(), &db_key()).await.unwrap().unwrap();
    let inst = instance(&store).await;
    assert_eq!(meta::label(&db, labels::OWNED), Some("true"));
    assert_eq!(meta::label(&db, labels::INSTANCE_KIND), Some("WebApp"));
    assert_eq!(meta::label(&db, labels::INSTANCE_NAME), Some("web"));
    assert_eq!(meta::label(&db, labels::INSTANCE_NAMESPACE), Some("default"));
    assert_eq!(meta::label(&db, labels::RESOURCE_ID), Some("db"));
    assert_eq!(db["metadata"]["ownerReferences"][0]["uid"], inst["metadata"]["uid"]);
    assert_eq!(db["metadata"]["ownerReferences"][0]["kind"], "WebApp");
}

#[tokio::test]
async fn drift_is_corrected_with_a_version_precondition() {
    let (store, rec) = setup().await;
    let _ = rec.reconcile_instance(&key()).await;
    mark_db_ready(&store).await;
    rec.reconcile_instance(&key()).await.unwrap();

    let mut drifted = store.get(&app(), &app_key()).await.unwrap().unwrap();
    drifted["spec"]["replicas"] = json!(9);
    let rv = meta::resource_version(&drifted).unwrap().to_string();
    store.update(&app(), &drifted, &rv).await.unwrap();
    store.conflict_once(&app(), &app_key());

    rec.reconcile_instance(&key()).await.unwrap();
    let fixed = store.get(&app(), &app_key()).await.unwrap().unwrap();
    assert_eq!(fixed["spec"]["replicas"], 2);
    let app_record = rec.materialized(&key()).into_iter().find(|r| r.id == "app").unwrap();
    assert_eq!(app_record.last_delta.len(), 1);
    assert_eq!(app_record.last_delta[0].path.to_string(), "spec.replicas");
}

#[tokio::test]
async fn rejected_writes_fail_until_the_generation_changes() {
    let (store, rec) = setup().await;
    store.reject_writes(&database(), "spec.size: unsupported value");

    let err = rec.reconcile_instance(&key()).await.unwrap_err();
    assert!(!err.is_retryable());
    let inst = instance(&store).await;
    assert_eq!(inst["status"]["phase"], "Failed");
    assert_eq!(inst["status"]["message"], "spec.size: unsupported value");

    store.accept_writes(&database());
    let writes = store.total_writes();
    assert_eq!(rec.reconcile_instance(&key()).await.unwrap(), Outcome::Done);
    assert_eq!(store.total_writes(), writes, "a failed generation is not retried");

    let mut inst = instance(&store).await;
    inst["spec"]["replicas"] = json!(3);
    let rv = meta::resource_version(&inst).unwrap().to_string();
    store.update(&webapp(), &inst, &rv).await.unwrap();
    let err = rec.reconcile_instance(&key()).await.unwrap_err();
    assert!(matches!(err, KordaError::DependencyNotReady { .. }));
    assert_eq!(instance(&store).await["status"]["phase"], "Progressing");
}

#[tokio::test]
async fn deletion_runs_in_reverse_and_waits_for_blocked_children() {
    let (store, rec) = setup().await;
    let _ = rec.reconcile_instance(&key()).await;
    mark_db_ready(&store).await;
    rec.reconcile_instance(&key()).await.unwrap();

    store.hold_deletion(&database(), &db_key());
    store.delete(&webapp(), &key()).await.unwrap();

    let err = rec.reconcile_instance(&key()).await.unwrap_err();
    assert!(matches!(&err, KordaError::DeletionBlocked { resource, .. } if resource == "db"));
    assert!(err.is_retryable());
    assert!(store.get(&app(), &app_key()).await.unwrap().is_none(), "app goes before db");
    let db = store.get(&database(), &db_key()).await.unwrap().unwrap();
    assert!(meta::is_deleting(&db));
    let inst = instance(&store).await;
    assert_eq!(inst["status"]["phase"], "Deleting");
    assert_eq!(inst["status"]["reason"], "DeletionBlocked");

    assert!(rec.reconcile_instance(&key()).await.is_err());
    store.release(&database(), &db_key());
    assert_eq!(rec.reconcile_instance(&key()).await.unwrap(), Outcome::Done);
    assert!(store.get(&webapp(), &key()).await.unwrap().is_none());
    assert!(store.get(&database(), &db_key()).await.unwrap().is_none());
    assert!(rec.materialized(&key()).is_empty());
}

#[tokio::test]
async fn missing_instance_is_a_noop() {
    let store = MemoryStore::new();
    let rec = InstanceReconciler::new(graph(), Arc::new(store.clone()), Arc::new(Builtin));
    assert_eq!(rec.reconcile_instance(&key()).await.unwrap(), Outcome::Done);
    assert_eq!(store.total_writes(), 0);
}

#[tokio::test]
async fn unset_optional_schema_field_fails_the_instance() {
    let mut def = definition();
    def["spec"]["schema"]["spec"]["suffix"] = json!("string");
    def["spec"]["resources"][0]["template"]["metadata"]["name"] = json!("${schema.spec.name}-${schema.spec.suffix}");
    let store = MemoryStore::new();
    store
        .create(&webapp(), &json!({
            "apiVersion": "korda.dev/v1alpha1",
            "kind": "WebApp",
            "metadata": { "name": "web", "namespace": "default" },
            "spec": { "name": "web" }
        }))
        .await
        .unwrap();
    let rec = InstanceReconciler::new(graph_from(def), Arc::new(store.clone()), Arc::new(Builtin));

    let err = rec.reconcile_instance(&key()).await.unwrap_err();
    assert!(matches!(&err, KordaError::InvalidExpression { resource, field, .. } if resource == "db" && field == "metadata.name"), "{:?}", err);
    assert!(!err.is_retryable());
    let inst = instance(&store).await;
    assert_eq!(inst["status"]["phase"], "Failed");
    assert_eq!(inst["status"]["reason"], "InvalidExpression");
    assert_eq!(store.writes(&database()), 0);
}

#[tokio::test]
async fn dropped_template_children_are_pruned() {
    let (store, rec) = setup().await;
    let _ = rec.reconcile_instance(&key()).await;
    mark_db_ready(&store).await;
    rec.reconcile_instance(&key()).await.unwrap();
    assert!(store.get(&app(), &app_key()).await.unwrap().is_some());

    let next = InstanceReconciler::new(without_app(), Arc::new(store.clone()), Arc::new(Builtin));
    assert_eq!(next.reconcile_instance(&key()).await.unwrap(), Outcome::Done);
    assert!(store.get(&app(), &app_key()).await.unwrap().is_none());
    assert!(store.get(&database(), &db_key()).await.unwrap().is_some());
    let inst = instance(&store).await;
    assert_eq!(inst["status"]["phase"], "Ready");
    assert_eq!(inst["status"]["resources"], json!([{ "id": "db", "apiVersion": "example.dev/v1", "kind": "Database", "ready": true }]));

    let writes = store.total_writes();
    next.reconcile_instance(&key()).await.unwrap();
    assert_eq!(store.total_writes(), writes);
}

#[tokio::test]
async fn deletion_also_removes_children_of_dropped_templates() {
    let (store, rec) = setup().await;
    let _ = rec.reconcile_instance(&key()).await;
    mark_db_ready(&store).await;
    rec.reconcile_instance(&key()).await.unwrap();

    store.delete(&webapp(), &key()).await.unwrap();
    let next = InstanceReconciler::new(without_app(), Arc::new(store.clone()), Arc::new(Builtin));
    assert_eq!(next.reconcile_instance(&key()).await.unwrap(), Outcome::Done);
    assert!(store.get(&app(), &app_key()).await.unwrap().is_none());
    assert!(store.get(&database(), &db_key()).await.unwrap().is_none());
    assert!(store.get(&webapp(), &key()).await.unwrap().is_none());
}
