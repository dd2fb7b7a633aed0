//! Korda kubehub: the resource store and CRD registrar backed by a live cluster.

#![forbid(unsafe_code)]

use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use korda_core::{Gvk, ObjectKey, WatchEvent};
use korda_schema::DerivedSchema;
use korda_store::{ResourceStore, StoreError, StoreResult, TypeRegistrar, WatchFilter, WatchStream};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::{debug, info};

/// Field manager used for server-side apply of CRDs.
pub const FIELD_MANAGER: &str = "korda";

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from the current context")
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.remove("managedFields");
    }
}

fn to_json(obj: &DynamicObject) -> StoreResult<Json> {
    let mut raw = serde_json::to_value(obj).map_err(|e| StoreError::Transient(format!("serializing object: {}", e)))?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

fn from_json(obj: &Json) -> StoreResult<DynamicObject> {
    serde_json::from_value(obj.clone()).map_err(|e| StoreError::Invalid(format!("object is not a valid resource: {}", e)))
}

fn map_kube_err(e: kube::Error, what: impl std::fmt::Display) -> StoreError {
    match &e {
        kube::Error::Api(ae) => match ae.code {
            404 => StoreError::NotFound(what.to_string()),
            409 => StoreError::Conflict(ae.message.clone()),
            400 | 422 => StoreError::Invalid(ae.message.clone()),
            _ => StoreError::Transient(e.to_string()),
        },
        _ => StoreError::Transient(e.to_string()),
    }
}

fn name_of(obj: &Json) -> StoreResult<ObjectKey> {
    ObjectKey::of(obj).ok_or_else(|| StoreError::Invalid("metadata.name is required".into()))
}

/// [`ResourceStore`] over `Api<DynamicObject>`, with pinned discovery per type.
pub struct KubeStore {
    client: Client,
    resources: Mutex<FxHashMap<Gvk, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client, resources: Mutex::new(FxHashMap::default()) } }

    pub async fn try_default() -> Result<Self> { Ok(Self::new(get_kube_client().await?)) }

    pub fn client(&self) -> Client { self.client.clone() }

    async fn resolve(&self, gvk: &Gvk) -> StoreResult<(ApiResource, bool)> {
        if let Some(hit) = self.resources.lock().unwrap_or_else(PoisonError::into_inner).get(gvk).cloned() {
            return Ok(hit);
        }
        let kgvk = GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
        // freshly registered types are not served right away
        let (ar, caps) = discovery::pinned_kind(&self.client, &kgvk)
            .await
            .map_err(|e| StoreError::Transient(format!("discovering {}: {}", gvk, e)))?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %gvk, plural = %ar.plural, namespaced, "resolved api resource");
        self.resources.lock().unwrap_or_else(PoisonError::into_inner).insert(gvk.clone(), (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }

    async fn api(&self, gvk: &Gvk, namespace: Option<&str>) -> StoreResult<Api<DynamicObject>> {
        let (ar, namespaced) = self.resolve(gvk).await?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> StoreResult<Option<Json>> {
        let api = self.api(gvk, key.namespace.as_deref()).await?;
        match api.get_opt(&key.name).await.map_err(|e| map_kube_err(e, key))? {
            Some(o) => to_json(&o).map(Some),
            None => Ok(None),
        }
    }

    async fn list(&self, gvk: &Gvk, filter: &WatchFilter) -> StoreResult<Vec<Json>> {
        let api = self.api(gvk, filter.namespace.as_deref()).await?;
        let mut lp = ListParams::default();
        if let Some(sel) = filter.selector() {
            lp = lp.labels(&sel);
        }
        let list = api.list(&lp).await.map_err(|e| map_kube_err(e, gvk))?;
        list.items.iter().map(to_json).collect()
    }

    async fn create(&self, gvk: &Gvk, obj: &Json) -> StoreResult<Json> {
        let key = name_of(obj)?;
        let api = self.api(gvk, key.namespace.as_deref()).await?;
        let created = api.create(&PostParams::default(), &from_json(obj)?).await.map_err(|e| map_kube_err(e, &key))?;
        to_json(&created)
    }

    async fn update(&self, gvk: &Gvk, obj: &Json, resource_version: &str) -> StoreResult<Json> {
        let key = name_of(obj)?;
        let api = self.api(gvk, key.namespace.as_deref()).await?;
        let mut dobj = from_json(obj)?;
        dobj.metadata.resource_version = Some(resource_version.to_string());
        let replaced = api.replace(&key.name, &PostParams::default(), &dobj).await.map_err(|e| map_kube_err(e, &key))?;
        to_json(&replaced)
    }

    async fn update_status(&self, gvk: &Gvk, obj: &Json) -> StoreResult<Json> {
        let key = name_of(obj)?;
        let api = self.api(gvk, key.namespace.as_deref()).await?;
        let body = serde_json::to_vec(obj).map_err(|e| StoreError::Invalid(e.to_string()))?;
        let replaced = api.replace_status(&key.name, &PostParams::default(), body).await.map_err(|e| map_kube_err(e, &key))?;
        to_json(&replaced)
    }

    async fn delete(&self, gvk: &Gvk, key: &ObjectKey) -> StoreResult<()> {
        let api = self.api(gvk, key.namespace.as_deref()).await?;
        api.delete(&key.name, &DeleteParams::background()).await.map_err(|e| map_kube_err(e, key))?;
        Ok(())
    }

    async fn watch(&self, gvk: &Gvk, filter: &WatchFilter) -> StoreResult<WatchStream> {
        let api = self.api(gvk, filter.namespace.as_deref()).await?;
        let mut cfg = watcher::Config::default();
        if let Some(sel) = filter.selector() {
            cfg = cfg.labels(&sel);
        }
        info!(gvk = %gvk, ns = ?filter.namespace, "watcher started");
        let stream = watcher::watcher(api, cfg)
            .default_backoff()
            .map_err(|e| StoreError::Transient(format!("watch: {}", e)))
            .and_then(|ev| async move {
                Ok(match ev {
                    Event::Applied(o) => WatchEvent::Applied(to_json(&o)?),
                    Event::Deleted(o) => WatchEvent::Deleted(to_json(&o)?),
                    Event::Restarted(list) => {
                        debug!(count = list.len(), "watch restart");
                        WatchEvent::Restarted(list.iter().map(to_json).collect::<StoreResult<Vec<_>>>()?)
                    }
                })
            });
        Ok(stream.boxed())
    }
}

/// Registers derived schemas as CRDs with server-side apply.
pub struct KubeRegistrar {
    client: Client,
}

impl KubeRegistrar {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait]
impl TypeRegistrar for KubeRegistrar {
    async fn register(&self, schema: &DerivedSchema) -> StoreResult<Gvk> {
        let crd = schema.crd().map_err(|e| StoreError::Invalid(e.to_string()))?;
        let name = korda_schema::crd_name(&schema.gvk);
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&name, &pp, &Patch::Apply(&crd)).await.map_err(|e| map_kube_err(e, &name))?;
        info!(crd = %name, "custom resource definition applied");
        Ok(schema.gvk.clone())
    }

    async fn unregister(&self, gvk: &Gvk) -> StoreResult<()> {
        let name = korda_schema::crd_name(gvk);
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(crd = %name, "custom resource definition deleted");
                Ok(())
            }
            Err(e) => match map_kube_err(e, &name) {
                StoreError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}
