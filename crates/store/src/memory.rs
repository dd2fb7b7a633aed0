//! In-memory resource store and registrar.
//!
//! Behaves like a small API server: resource versions, generations that move on
//! spec changes, a status subresource, finalizers, owner-reference cascade and
//! schema validation for registered types. Test hooks can hold objects in a
//! terminating state, reject writes or inject a single conflict.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use korda_core::{meta, Gvk, ObjectKey, WatchEvent};
use korda_schema::DerivedSchema;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::broadcast;
use tracing::trace;

use crate::{ResourceStore, StoreError, StoreResult, TypeRegistrar, WatchFilter, WatchStream};

type Slot = (Gvk, ObjectKey);

#[derive(Debug, Clone)]
struct Change {
    gvk: Gvk,
    event: WatchEvent,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Slot, Json>,
    revision: u64,
    writes: FxHashMap<Gvk, u64>,
    schemas: BTreeMap<Gvk, DerivedSchema>,
    held: BTreeSet<Slot>,
    rejections: FxHashMap<Gvk, String>,
    conflicts: BTreeSet<Slot>,
}

impl Inner {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn count_write(&mut self, gvk: &Gvk) { *self.writes.entry(gvk.clone()).or_default() += 1; }

    fn check_writable(&self, gvk: &Gvk, obj: &Json) -> StoreResult<()> {
        if let Some(msg) = self.rejections.get(gvk) {
            return Err(StoreError::Invalid(msg.clone()));
        }
        if let Some(schema) = self.schemas.get(gvk) {
            let issues = korda_schema::validate(&schema.openapi(), obj);
            if !issues.is_empty() {
                let name = meta::name(obj).unwrap_or_default();
                return Err(StoreError::Invalid(format!("{} {:?} is invalid: {}", gvk.kind, name, issues.join("; "))));
            }
        }
        Ok(())
    }

    /// Drop an object for good, cascading to objects it owns.
    fn remove(&mut self, slot: &Slot, tx: &broadcast::Sender<Change>) {
        let Some(obj) = self.objects.remove(slot) else { return };
        self.held.remove(slot);
        let uid = meta::uid(&obj).map(str::to_string);
        let _ = tx.send(Change { gvk: slot.0.clone(), event: WatchEvent::Deleted(obj) });
        let Some(uid) = uid else { return };
        let owned: Vec<Slot> = self
            .objects
            .iter()
            .filter(|(_, o)| owner_uids(o).any(|u| u == uid))
            .map(|(s, _)| s.clone())
            .collect();
        for child in owned {
            self.begin_delete(&child, tx);
        }
    }

    /// Mark for deletion; removes immediately when nothing holds the object.
    fn begin_delete(&mut self, slot: &Slot, tx: &broadcast::Sender<Change>) {
        let held = self.held.contains(slot);
        let Some(obj) = self.objects.get(slot) else { return };
        let (free, deleting) = (meta::finalizers(obj).is_empty() && !held, meta::is_deleting(obj));
        if free {
            self.remove(slot, tx);
            return;
        }
        if deleting { return; }
        let rv = self.next_revision();
        let Some(obj) = self.objects.get_mut(slot) else { return };
        if let Some(m) = meta::metadata_mut(obj) {
            m.insert("deletionTimestamp".into(), Json::String(now()));
            m.insert("resourceVersion".into(), Json::String(rv));
        }
        let _ = tx.send(Change { gvk: slot.0.clone(), event: WatchEvent::Applied(obj.clone()) });
    }

    fn snapshot(&self, gvk: &Gvk, filter: &WatchFilter) -> Vec<Json> {
        self.objects.iter().filter(|((g, _), o)| g == gvk && filter.matches(o)).map(|(_, o)| o.clone()).collect()
    }
}

fn owner_uids(obj: &Json) -> impl Iterator<Item = &str> {
    obj.pointer("/metadata/ownerReferences")
        .and_then(Json::as_array)
        .into_iter()
        .flatten()
        .filter_map(|r| r.get("uid").and_then(Json::as_str))
}

fn now() -> String { chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true) }

/// Everything but metadata and status; a change here moves `generation`.
fn spec_part(obj: &Json) -> Json {
    let mut o = obj.clone();
    if let Some(m) = o.as_object_mut() {
        m.remove("metadata");
        m.remove("status");
    }
    o
}

fn key_of(obj: &Json) -> StoreResult<ObjectKey> {
    ObjectKey::of(obj).ok_or_else(|| StoreError::Invalid("metadata.name is required".into()))
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    tx: broadcast::Sender<Change>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { inner: Arc::new(Mutex::new(Inner::default())), tx }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Successful mutating calls against `gvk` so far.
    pub fn writes(&self, gvk: &Gvk) -> u64 { self.lock().writes.get(gvk).copied().unwrap_or(0) }

    pub fn total_writes(&self) -> u64 { self.lock().writes.values().sum() }

    pub fn objects(&self, gvk: &Gvk) -> Vec<Json> { self.lock().snapshot(gvk, &WatchFilter::all()) }

    /// Keep the object terminating after a delete until [`MemoryStore::release`].
    pub fn hold_deletion(&self, gvk: &Gvk, key: &ObjectKey) { self.lock().held.insert((gvk.clone(), key.clone())); }

    pub fn release(&self, gvk: &Gvk, key: &ObjectKey) {
        let slot = (gvk.clone(), key.clone());
        let mut inner = self.lock();
        inner.held.remove(&slot);
        let finished = inner.objects.get(&slot).map(|o| meta::is_deleting(o) && meta::finalizers(o).is_empty()).unwrap_or(false);
        if finished {
            inner.remove(&slot, &self.tx);
        }
    }

    /// Reject every create/update of `gvk` as invalid.
    pub fn reject_writes(&self, gvk: &Gvk, message: impl Into<String>) { self.lock().rejections.insert(gvk.clone(), message.into()); }

    pub fn accept_writes(&self, gvk: &Gvk) { self.lock().rejections.remove(gvk); }

    /// The next update of this object fails with a conflict, as if another writer got there first.
    pub fn conflict_once(&self, gvk: &Gvk, key: &ObjectKey) { self.lock().conflicts.insert((gvk.clone(), key.clone())); }

    pub fn install_schema(&self, schema: DerivedSchema) { self.lock().schemas.insert(schema.gvk.clone(), schema); }

    pub fn remove_schema(&self, gvk: &Gvk) { self.lock().schemas.remove(gvk); }

    pub fn has_schema(&self, gvk: &Gvk) -> bool { self.lock().schemas.contains_key(gvk) }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> StoreResult<Option<Json>> {
        Ok(self.lock().objects.get(&(gvk.clone(), key.clone())).cloned())
    }

    async fn list(&self, gvk: &Gvk, filter: &WatchFilter) -> StoreResult<Vec<Json>> { Ok(self.lock().snapshot(gvk, filter)) }

    async fn create(&self, gvk: &Gvk, obj: &Json) -> StoreResult<Json> {
        let key = key_of(obj)?;
        let slot = (gvk.clone(), key.clone());
        let mut inner = self.lock();
        if inner.objects.contains_key(&slot) {
            return Err(StoreError::Conflict(format!("{} {} already exists", gvk.kind, key)));
        }
        inner.check_writable(gvk, obj)?;
        let mut stored = obj.clone();
        let rv = inner.next_revision();
        if let Some(m) = meta::metadata_mut(&mut stored) {
            m.insert("uid".into(), Json::String(uuid::Uuid::new_v4().to_string()));
            m.insert("creationTimestamp".into(), Json::String(now()));
            m.insert("resourceVersion".into(), Json::String(rv));
            m.insert("generation".into(), Json::from(1));
            m.remove("deletionTimestamp");
        }
        inner.objects.insert(slot, stored.clone());
        inner.count_write(gvk);
        trace!(gvk = %gvk, key = %key, "memory store create");
        let _ = self.tx.send(Change { gvk: gvk.clone(), event: WatchEvent::Applied(stored.clone()) });
        Ok(stored)
    }

    async fn update(&self, gvk: &Gvk, obj: &Json, resource_version: &str) -> StoreResult<Json> {
        let key = key_of(obj)?;
        let slot = (gvk.clone(), key.clone());
        let mut inner = self.lock();
        let Some(current) = inner.objects.get(&slot).cloned() else {
            return Err(StoreError::NotFound(format!("{} {}", gvk.kind, key)));
        };
        if inner.conflicts.remove(&slot) {
            let rv = inner.next_revision();
            if let Some(m) = inner.objects.get_mut(&slot).and_then(meta::metadata_mut) {
                m.insert("resourceVersion".into(), Json::String(rv));
            }
            return Err(StoreError::Conflict(format!("{} {} was modified concurrently", gvk.kind, key)));
        }
        if meta::resource_version(&current) != Some(resource_version) {
            return Err(StoreError::Conflict(format!(
                "{} {}: resourceVersion {} is stale",
                gvk.kind, key, resource_version
            )));
        }
        inner.check_writable(gvk, obj)?;
        let mut next = obj.clone();
        let generation = meta::generation(&current).unwrap_or(1);
        let generation = if spec_part(&current) != spec_part(obj) { generation + 1 } else { generation };
        let rv = inner.next_revision();
        if let Some(status) = current.get("status") {
            next["status"] = status.clone();
        } else if let Some(m) = next.as_object_mut() {
            m.remove("status");
        }
        if let Some(m) = meta::metadata_mut(&mut next) {
            for k in ["uid", "creationTimestamp", "deletionTimestamp"] {
                match current.pointer(&format!("/metadata/{}", k)) {
                    Some(v) => m.insert(k.into(), v.clone()),
                    None => m.remove(k),
                };
            }
            m.insert("generation".into(), Json::from(generation));
            m.insert("resourceVersion".into(), Json::String(rv));
        }
        inner.count_write(gvk);
        if meta::is_deleting(&next) && meta::finalizers(&next).is_empty() && !inner.held.contains(&slot) {
            inner.objects.insert(slot.clone(), next.clone());
            inner.remove(&slot, &self.tx);
            return Ok(next);
        }
        inner.objects.insert(slot, next.clone());
        let _ = self.tx.send(Change { gvk: gvk.clone(), event: WatchEvent::Applied(next.clone()) });
        Ok(next)
    }

    async fn update_status(&self, gvk: &Gvk, obj: &Json) -> StoreResult<Json> {
        let key = key_of(obj)?;
        let slot = (gvk.clone(), key.clone());
        let mut inner = self.lock();
        let Some(mut next) = inner.objects.get(&slot).cloned() else {
            return Err(StoreError::NotFound(format!("{} {}", gvk.kind, key)));
        };
        if let Some(rv) = meta::resource_version(obj) {
            if meta::resource_version(&next) != Some(rv) {
                return Err(StoreError::Conflict(format!("{} {}: resourceVersion {} is stale", gvk.kind, key, rv)));
            }
        }
        next["status"] = obj.get("status").cloned().unwrap_or(Json::Null);
        let rv = inner.next_revision();
        if let Some(m) = meta::metadata_mut(&mut next) {
            m.insert("resourceVersion".into(), Json::String(rv));
        }
        inner.objects.insert(slot, next.clone());
        inner.count_write(gvk);
        let _ = self.tx.send(Change { gvk: gvk.clone(), event: WatchEvent::Applied(next.clone()) });
        Ok(next)
    }

    async fn delete(&self, gvk: &Gvk, key: &ObjectKey) -> StoreResult<()> {
        let slot = (gvk.clone(), key.clone());
        let mut inner = self.lock();
        let Some(current) = inner.objects.get(&slot) else {
            return Err(StoreError::NotFound(format!("{} {}", gvk.kind, key)));
        };
        if meta::is_deleting(current) { return Ok(()); }
        inner.count_write(gvk);
        inner.begin_delete(&slot, &self.tx);
        Ok(())
    }

    async fn watch(&self, gvk: &Gvk, filter: &WatchFilter) -> StoreResult<WatchStream> {
        let (initial, rx) = {
            let inner = self.lock();
            (inner.snapshot(gvk, filter), self.tx.subscribe())
        };
        let state = (rx, self.clone(), gvk.clone(), filter.clone());
        let rest = futures::stream::unfold(state, |(mut rx, store, gvk, filter)| async move {
            loop {
                match rx.recv().await {
                    Ok(change) => {
                        if change.gvk != gvk { continue; }
                        let relevant = match &change.event {
                            WatchEvent::Applied(o) | WatchEvent::Deleted(o) => filter.matches(o),
                            WatchEvent::Restarted(_) => false,
                        };
                        if relevant {
                            return Some((Ok::<_, StoreError>(change.event), (rx, store, gvk, filter)));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let items = store.lock().snapshot(&gvk, &filter);
                        return Some((Ok(WatchEvent::Restarted(items)), (rx, store, gvk, filter)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        let first = futures::stream::once(async move { Ok::<_, StoreError>(WatchEvent::Restarted(initial)) });
        Ok(first.chain(rest).boxed())
    }
}

/// Registrar that installs derived schemas into a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryRegistrar {
    store: MemoryStore,
    registered: Arc<Mutex<BTreeSet<Gvk>>>,
}

impl MemoryRegistrar {
    pub fn new(store: MemoryStore) -> Self { Self { store, registered: Arc::default() } }

    pub fn registered(&self) -> Vec<Gvk> {
        self.registered.lock().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect()
    }
}

#[async_trait]
impl TypeRegistrar for MemoryRegistrar {
    async fn register(&self, schema: &DerivedSchema) -> StoreResult<Gvk> {
        self.store.install_schema(schema.clone());
        self.registered.lock().unwrap_or_else(PoisonError::into_inner).insert(schema.gvk.clone());
        Ok(schema.gvk.clone())
    }

    async fn unregister(&self, gvk: &Gvk) -> StoreResult<()> {
        self.store.remove_schema(gvk);
        self.registered.lock().unwrap_or_else(PoisonError::into_inner).remove(gvk);
        Ok(())
    }
}
