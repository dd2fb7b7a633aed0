//! Resource-graph definition documents.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{Gvk, DEFAULT_GROUP};

pub const DEFINITION_API_VERSION: &str = "korda.dev/v1alpha1";
pub const DEFINITION_KIND: &str = "ResourceGraphDefinition";

/// One named underlying resource of a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    pub id: String,
    pub template: Json,
    /// Expressions that must all evaluate to `true` on the observed object.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ready_when: Vec<String>,
}

impl ResourceTemplate {
    pub fn gvk(&self) -> Option<Gvk> {
        let api_version = self.template.get("apiVersion")?.as_str()?;
        let kind = self.template.get("kind")?.as_str()?;
        Some(Gvk::from_api_version(api_version, kind))
    }
}

/// Declared schema of the composite type: simple-schema spec plus status outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeDecl {
    /// Version of the composite type (e.g. `v1alpha1`).
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub spec: Json,
    #[serde(default)]
    pub status: Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionSpec {
    pub schema: CompositeDecl,
    #[serde(default)]
    pub resources: Vec<ResourceTemplate>,
}

#[derive(Debug, Deserialize)]
struct DefinitionMeta {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DefinitionDoc {
    #[serde(default)]
    kind: Option<String>,
    metadata: DefinitionMeta,
    spec: DefinitionSpec,
}

/// A parsed definition. `raw` keeps the full document for previews.
#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    pub name: String,
    pub spec: DefinitionSpec,
    pub raw: Json,
}

impl Definition {
    pub fn from_value(raw: Json) -> Result<Self> {
        let doc: DefinitionDoc = serde_json::from_value(raw.clone()).context("parsing ResourceGraphDefinition")?;
        if let Some(kind) = doc.kind.as_deref() {
            if kind != DEFINITION_KIND {
                return Err(anyhow!("expected kind {}, got {}", DEFINITION_KIND, kind));
            }
        }
        if doc.metadata.name.is_empty() {
            return Err(anyhow!("definition missing metadata.name"));
        }
        Ok(Self { name: doc.metadata.name, spec: doc.spec, raw })
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let val: serde_yaml::Value = serde_yaml::from_str(yaml).context("parsing YAML")?;
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        Self::from_value(json)
    }

    /// The composite type this definition exposes.
    pub fn gvk(&self) -> Gvk {
        let schema = &self.spec.schema;
        Gvk {
            group: schema.group.clone().unwrap_or_else(|| DEFAULT_GROUP.to_string()),
            version: schema.api_version.clone(),
            kind: schema.kind.clone(),
        }
    }

    pub fn resource(&self, id: &str) -> Option<&ResourceTemplate> {
        self.spec.resources.iter().find(|r| r.id == id)
    }
}
