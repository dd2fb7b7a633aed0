//! Korda store: the resource-store and type-registrar seams, plus in-memory implementations.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use korda_core::{meta, Gvk, KordaError, ObjectKey, WatchEvent};
use korda_schema::DerivedSchema;
use serde_json::Value as Json;

pub mod memory;

pub use memory::{MemoryRegistrar, MemoryStore};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// The store rejected the object itself (schema violation, bad field).
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, Self::Conflict(_)) }
}

impl From<StoreError> for KordaError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Invalid(msg) => KordaError::Failed(msg),
            other => KordaError::Transient(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Change stream for one type. The first item is always `Restarted` with the
/// initial listing.
pub type WatchStream = BoxStream<'static, StoreResult<WatchEvent>>;

/// Namespace and label-equality selection for lists and watches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchFilter {
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl WatchFilter {
    pub fn all() -> Self { Self::default() }

    pub fn in_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, obj: &Json) -> bool {
        if let Some(ns) = &self.namespace {
            if meta::namespace(obj) != Some(ns.as_str()) { return false; }
        }
        self.labels.iter().all(|(k, v)| meta::label(obj, k) == Some(v.as_str()))
    }

    /// `k=v,k2=v2`, the label selector syntax of the API server.
    pub fn selector(&self) -> Option<String> {
        if self.labels.is_empty() { return None; }
        Some(self.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(","))
    }
}

/// Create/get/update/delete/watch over raw objects. Every call is safe to retry.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, gvk: &Gvk, key: &ObjectKey) -> StoreResult<Option<Json>>;
    async fn list(&self, gvk: &Gvk, filter: &WatchFilter) -> StoreResult<Vec<Json>>;
    async fn create(&self, gvk: &Gvk, obj: &Json) -> StoreResult<Json>;
    /// Replace the object unless its stored resource version differs from `resource_version`.
    async fn update(&self, gvk: &Gvk, obj: &Json, resource_version: &str) -> StoreResult<Json>;
    /// Replace only `.status`.
    async fn update_status(&self, gvk: &Gvk, obj: &Json) -> StoreResult<Json>;
    /// Request deletion. `NotFound` when the object is already gone.
    async fn delete(&self, gvk: &Gvk, key: &ObjectKey) -> StoreResult<()>;
    async fn watch(&self, gvk: &Gvk, filter: &WatchFilter) -> StoreResult<WatchStream>;
}

/// Turns a derived schema into a served type.
#[async_trait]
pub trait TypeRegistrar: Send + Sync {
    async fn register(&self, schema: &DerivedSchema) -> StoreResult<Gvk>;
    async fn unregister(&self, gvk: &Gvk) -> StoreResult<()>;
}
