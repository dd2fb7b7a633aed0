//! Reading definition documents with size and complexity guards.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use korda_core::Definition;
use serde_json::Value as Json;

/// Upper bounds applied before a document is parsed into a [`Definition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for Limits {
    fn default() -> Self { Self { max_bytes: 1024 * 1024, max_nodes: 100_000 } }
}

impl Limits {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_bytes: korda_runtime::env_or("KORDA_MAX_YAML_BYTES", d.max_bytes),
            max_nodes: korda_runtime::env_or("KORDA_MAX_YAML_NODES", d.max_nodes),
        }
    }
}

fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, seen: &mut usize, max: usize) {
        if *seen >= max { return; }
        *seen += 1;
        match v {
            Json::Object(map) => map.values().for_each(|c| walk(c, seen, max)),
            Json::Array(items) => items.iter().for_each(|c| walk(c, seen, max)),
            _ => {}
        }
    }
    let mut seen = 0usize;
    walk(v, &mut seen, max);
    seen >= max
}

/// Parse a YAML (or JSON) document into a raw value, enforcing `limits`.
pub fn parse_document(text: &str, limits: Limits) -> Result<Json> {
    if text.len() > limits.max_bytes {
        return Err(anyhow!("document too large (>{} bytes)", limits.max_bytes));
    }
    let yaml: serde_yaml::Value = serde_yaml::from_str(text).context("parsing YAML")?;
    let json = serde_json::to_value(yaml).context("converting YAML to JSON")?;
    if node_budget_exceeded(&json, limits.max_nodes) {
        return Err(anyhow!("document too complex (>{} nodes)", limits.max_nodes));
    }
    if json.get("kind").is_none() {
        return Err(anyhow!("missing kind"));
    }
    Ok(json)
}

pub fn parse_definition(text: &str, limits: Limits) -> Result<Definition> { Definition::from_value(parse_document(text, limits)?) }

/// Read and parse a definition file.
pub fn read_definition(path: &Path, limits: Limits) -> Result<Definition> {
    let len = std::fs::metadata(path).with_context(|| format!("reading {}", path.display()))?.len();
    if len as usize > limits.max_bytes {
        return Err(anyhow!("{} is too large (>{} bytes)", path.display(), limits.max_bytes));
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_definition(&text, limits).with_context(|| format!("loading {}", path.display()))
}
