//! Korda core types: identifiers, definitions, field paths and the error taxonomy.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod definition;
pub mod path;

pub use definition::{CompositeDecl, Definition, DefinitionSpec, ResourceTemplate, DEFINITION_API_VERSION, DEFINITION_KIND};
pub use path::{FieldPath, Segment};

/// Group used for composite types whose definition omits one.
pub const DEFAULT_GROUP: &str = "korda.dev";
pub const FINALIZER: &str = "korda.dev/finalizer";

/// Ownership labels stamped on every materialized resource.
pub mod labels {
    pub const OWNED: &str = "korda.dev/owned";
    pub const INSTANCE_KIND: &str = "korda.dev/instance-kind";
    pub const INSTANCE_NAMESPACE: &str = "korda.dev/instance-namespace";
    pub const INSTANCE_NAME: &str = "korda.dev/instance-name";
    pub const RESOURCE_ID: &str = "korda.dev/resource-id";
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Split an `apiVersion` (`group/version` or bare `version`) into a GVK.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        Self { group, version, kind: kind.to_string() }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// `v1/Kind` or `group/v1/Kind`.
    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn parse_key(key: &str) -> Result<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] => Ok(Self::new("", *version, *kind)),
            [group, version, kind] => Ok(Self::new(*group, *version, *kind)),
            _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
        }
    }

    /// Lower-case plural used for the REST resource name.
    pub fn plural(&self) -> String {
        let lower = self.kind.to_ascii_lowercase();
        if lower.ends_with('s') || lower.ends_with('x') || lower.ends_with("ch") || lower.ends_with("sh") {
            format!("{}es", lower)
        } else if lower.ends_with('y') && !lower.ends_with("ey") && !lower.ends_with("ay") {
            format!("{}ies", &lower[..lower.len() - 1])
        } else {
            format!("{}s", lower)
        }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.key()) }
}

/// Identity of one object inside a type: optional namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.into() }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self { Self::new(Some(namespace), name) }

    pub fn of(obj: &Json) -> Option<Self> {
        let name = meta::name(obj)?;
        Some(Self::new(meta::namespace(obj), name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Change notifications produced by a store watch.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(Json),
    Deleted(Json),
    /// Full relist; the first one marks the end of the initial listing.
    Restarted(Vec<Json>),
}

/// Accessors for the `metadata` block of raw objects.
pub mod meta {
    use serde_json::Value as Json;

    fn field<'a>(obj: &'a Json, key: &str) -> Option<&'a Json> { obj.get("metadata")?.get(key) }

    pub fn name(obj: &Json) -> Option<&str> { field(obj, "name")?.as_str() }
    pub fn namespace(obj: &Json) -> Option<&str> { field(obj, "namespace")?.as_str() }
    pub fn uid(obj: &Json) -> Option<&str> { field(obj, "uid")?.as_str() }
    pub fn resource_version(obj: &Json) -> Option<&str> { field(obj, "resourceVersion")?.as_str() }
    pub fn generation(obj: &Json) -> Option<i64> { field(obj, "generation")?.as_i64() }
    pub fn label<'a>(obj: &'a Json, key: &str) -> Option<&'a str> { field(obj, "labels")?.get(key)?.as_str() }

    pub fn is_deleting(obj: &Json) -> bool {
        field(obj, "deletionTimestamp").map(|v| !v.is_null()).unwrap_or(false)
    }

    pub fn finalizers(obj: &Json) -> Vec<String> {
        field(obj, "finalizers")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|s| s.as_str().map(|s| s.to_string())).collect())
            .unwrap_or_default()
    }

    /// Mutable `metadata` object, created when missing.
    pub fn metadata_mut(obj: &mut Json) -> Option<&mut serde_json::Map<String, Json>> {
        let map = obj.as_object_mut()?;
        map.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new())).as_object_mut()
    }

    pub fn set_finalizers(obj: &mut Json, finalizers: &[String]) {
        if let Some(m) = metadata_mut(obj) {
            if finalizers.is_empty() {
                m.remove("finalizers");
            } else {
                m.insert("finalizers".into(), Json::from(finalizers.to_vec()));
            }
        }
    }
}

/// Error taxonomy shared by the builder, the controllers and the reconciler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KordaError {
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),
    #[error("invalid expression in {resource} at {field}: {reason}")]
    InvalidExpression { resource: String, field: String, reason: String },
    #[error("duplicate resource name {0:?}")]
    DuplicateName(String),
    #[error("cyclic dependency: {}", .path.join(" -> "))]
    CyclicDependency { path: Vec<String> },
    #[error("resource {resource:?} is waiting on {dependency:?}: {detail}")]
    DependencyNotReady { resource: String, dependency: String, detail: String },
    #[error("deletion of {resource:?} ({key}) is blocked: object still terminating")]
    DeletionBlocked { resource: String, key: String },
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("{0}")]
    Failed(String),
    #[error("drain of {gvk} timed out after {timeout:?}")]
    DrainTimeout { gvk: String, timeout: Duration },
}

impl KordaError {
    /// Errors the work queue retries with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DependencyNotReady { .. } | Self::DeletionBlocked { .. } | Self::Transient(_))
    }

    /// Short machine-readable reason, used in status blocks.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidDefinition(_) => "InvalidDefinition",
            Self::InvalidExpression { .. } => "InvalidExpression",
            Self::DuplicateName(_) => "DuplicateName",
            Self::CyclicDependency { .. } => "CyclicDependency",
            Self::DependencyNotReady { .. } => "DependencyNotReady",
            Self::DeletionBlocked { .. } => "DeletionBlocked",
            Self::Transient(_) => "StoreError",
            Self::Failed(_) => "Failed",
            Self::DrainTimeout { .. } => "DrainTimeout",
        }
    }
}

pub type KordaResult<T> = std::result::Result<T, KordaError>;
