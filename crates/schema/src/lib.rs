//! Korda schema: derive the composite type's OpenAPI schema from simple-schema
//! declarations, apply defaults, validate objects and render the CRD.

#![forbid(unsafe_code)]

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiextv1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use jsonschema::{Draft, JSONSchema};
use korda_core::{FieldPath, Gvk, KordaError, KordaResult, Segment};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};

/// Status keys written by the reconciler itself; declared outputs may not use them.
pub const RESERVED_STATUS_FIELDS: &[&str] = &["phase", "reason", "message", "observedGeneration", "resources"];

/// How a declared status output is typed in the derived schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputKind {
    /// Whole-expression output; keeps whatever type the expression yields.
    Typed,
    /// Interpolated text.
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterCol {
    pub name: String,
    pub json_path: String,
    pub type_: String,
}

/// OpenAPI schema derived for one composite type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedSchema {
    pub gvk: Gvk,
    /// Schema of `.spec`.
    pub spec: Json,
    /// Schema of `.status`, including the reconciler's own fields.
    pub status: Json,
    pub printer_cols: Vec<PrinterCol>,
    /// Instances live in a namespace; false renders a cluster-scoped CRD.
    #[serde(default = "namespaced_default")]
    pub namespaced: bool,
}

fn namespaced_default() -> bool { true }

fn invalid(msg: impl Into<String>) -> KordaError { KordaError::InvalidDefinition(msg.into()) }

/// Parse one simple-schema leaf, e.g. `integer | default=2 required=true`.
/// Returns the property schema and whether the field is required.
pub fn parse_field(decl: &str) -> KordaResult<(Json, bool)> {
    let (ty, markers) = match decl.split_once('|') {
        Some((t, m)) => (t.trim(), m.trim()),
        None => (decl.trim(), ""),
    };
    let mut schema = type_schema(ty)?;
    let mut required = false;
    for (key, value) in split_markers(markers)? {
        match key.as_str() {
            "default" => {
                let v = parse_default(&schema, &value).ok_or_else(|| invalid(format!("default {:?} does not match type {}", value, ty)))?;
                schema["default"] = v;
            }
            "required" => {
                required = value.parse::<bool>().map_err(|_| invalid(format!("required expects true/false, got {:?}", value)))?;
            }
            "description" => schema["description"] = Json::String(value),
            other => return Err(invalid(format!("unknown marker {:?} in {:?}", other, decl))),
        }
    }
    Ok((schema, required))
}

fn type_schema(ty: &str) -> KordaResult<Json> {
    if let Some(inner) = ty.strip_prefix("[]") {
        return Ok(json!({ "type": "array", "items": type_schema(inner)? }));
    }
    if let Some(rest) = ty.strip_prefix("map[") {
        let (key, value) = rest.split_once(']').ok_or_else(|| invalid(format!("malformed map type {:?}", ty)))?;
        if key != "string" { return Err(invalid(format!("map keys must be string, got {:?}", key))); }
        return Ok(json!({ "type": "object", "additionalProperties": type_schema(value)? }));
    }
    match ty {
        "string" | "integer" | "number" | "boolean" => Ok(json!({ "type": ty })),
        "object" => Ok(json!({ "type": "object", "x-kubernetes-preserve-unknown-fields": true })),
        other => Err(invalid(format!("unknown type {:?}", other))),
    }
}

/// `key=value` pairs separated by whitespace; values may be double-quoted.
fn split_markers(s: &str) -> KordaResult<Vec<(String, String)>> {
    let mut out = Vec::new();
    let mut chars = s.chars().peekable();
    loop {
        while chars.peek().map(|c| c.is_whitespace()).unwrap_or(false) { chars.next(); }
        if chars.peek().is_none() { return Ok(out); }
        let key: String = std::iter::from_fn(|| chars.next_if(|c| *c != '=' && !c.is_whitespace())).collect();
        if chars.next() != Some('=') { return Err(invalid(format!("marker {:?} has no value", key))); }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => value.extend(chars.next()),
                    '"' => {
                        closed = true;
                        break;
                    }
                    c => value.push(c),
                }
            }
            if !closed { return Err(invalid(format!("unterminated quote in marker {:?}", key))); }
        } else {
            value.extend(std::iter::from_fn(|| chars.next_if(|c| !c.is_whitespace())));
        }
        out.push((key, value));
    }
}

fn parse_default(schema: &Json, raw: &str) -> Option<Json> {
    match schema.get("type")?.as_str()? {
        "string" => Some(Json::String(raw.to_string())),
        "integer" => raw.parse::<i64>().ok().map(Json::from),
        "number" => raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64).map(Json::Number),
        "boolean" => raw.parse::<bool>().ok().map(Json::Bool),
        _ => serde_json::from_str(raw).ok(),
    }
}

/// Turn a declared spec tree (nested maps with simple-schema leaves) into an object schema.
pub fn spec_schema(decl: &Json) -> KordaResult<Json> { spec_schema_at(decl, &FieldPath::root().child("spec")) }

fn spec_schema_at(decl: &Json, at: &FieldPath) -> KordaResult<Json> {
    match decl {
        Json::Null => Ok(json!({ "type": "object" })),
        Json::Object(fields) => {
            let mut props = Map::new();
            let mut required = Vec::new();
            for (name, v) in fields {
                let here = at.child(name);
                let (prop, req) = match v {
                    Json::String(s) => parse_field(s).map_err(|e| match e {
                        KordaError::InvalidDefinition(m) => invalid(format!("{}: {}", here, m)),
                        other => other,
                    })?,
                    Json::Object(_) => (spec_schema_at(v, &here)?, false),
                    other => return Err(invalid(format!("{}: expected a type string or a map, got {}", here, other))),
                };
                if req { required.push(Json::String(name.clone())); }
                props.insert(name.clone(), prop);
            }
            let mut schema = json!({ "type": "object", "properties": props });
            if !required.is_empty() { schema["required"] = Json::Array(required); }
            Ok(schema)
        }
        other => Err(invalid(format!("{} must be a map, got {}", at, other))),
    }
}

/// Status schema: reconciler fields plus one property per declared output.
pub fn status_schema(outputs: &[(FieldPath, OutputKind)]) -> KordaResult<Json> {
    let mut root = json!({
        "type": "object",
        "properties": {
            "phase": { "type": "string" },
            "reason": { "type": "string" },
            "message": { "type": "string" },
            "observedGeneration": { "type": "integer" },
            "resources": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "string" },
                        "apiVersion": { "type": "string" },
                        "kind": { "type": "string" },
                        "ready": { "type": "boolean" }
                    }
                }
            }
        }
    });
    for (path, kind) in outputs {
        let mut keys = Vec::with_capacity(path.len());
        for seg in path.segments() {
            match seg {
                Segment::Field(k) => keys.push(k.as_str()),
                Segment::Index(_) => return Err(invalid(format!("status output {} may not index into a list", path))),
            }
        }
        let Some((leaf, parents)) = keys.split_last() else { continue };
        if let Some(top) = keys.first().filter(|k| RESERVED_STATUS_FIELDS.contains(k)) {
            return Err(invalid(format!("status.{} is reserved", top)));
        }
        let conflict = || invalid(format!("status output {} conflicts with another output", path));
        let mut cur = &mut root;
        for k in parents {
            let props = ensure_props(cur).ok_or_else(conflict)?;
            cur = props.entry(k.to_string()).or_insert_with(|| json!({ "type": "object", "properties": {} }));
            if cur.get("type").and_then(Json::as_str) != Some("object") { return Err(conflict()); }
        }
        let leaf_schema = match kind {
            OutputKind::Typed => json!({ "x-kubernetes-preserve-unknown-fields": true }),
            OutputKind::Text => json!({ "type": "string" }),
        };
        let props = ensure_props(cur).ok_or_else(conflict)?;
        if props.contains_key(*leaf) { return Err(conflict()); }
        props.insert(leaf.to_string(), leaf_schema);
    }
    Ok(root)
}

fn ensure_props(schema: &mut Json) -> Option<&mut Map<String, Json>> {
    let props = schema.as_object_mut()?.entry("properties").or_insert_with(|| json!({}));
    props.as_object_mut()
}

impl DerivedSchema {
    pub fn derive(gvk: Gvk, spec_decl: &Json, outputs: &[(FieldPath, OutputKind)]) -> KordaResult<Self> {
        Ok(Self {
            gvk,
            spec: spec_schema(spec_decl)?,
            status: status_schema(outputs)?,
            printer_cols: vec![
                PrinterCol { name: "Phase".into(), json_path: ".status.phase".into(), type_: "string".into() },
                PrinterCol { name: "Reason".into(), json_path: ".status.reason".into(), type_: "string".into() },
                PrinterCol { name: "Age".into(), json_path: ".metadata.creationTimestamp".into(), type_: "date".into() },
            ],
            namespaced: true,
        })
    }

    /// Full object schema for instances of the type.
    pub fn openapi(&self) -> Json {
        json!({
            "type": "object",
            "properties": {
                "apiVersion": { "type": "string" },
                "kind": { "type": "string" },
                "metadata": { "type": "object" },
                "spec": self.spec,
                "status": self.status,
            }
        })
    }

    /// `spec` with declared defaults filled in.
    pub fn apply_defaults(&self, spec: &Json) -> Json {
        let mut out = if spec.is_null() { json!({}) } else { spec.clone() };
        fill_defaults(&self.spec, &mut out);
        out
    }

    /// Render the CustomResourceDefinition exposing this type.
    pub fn crd(&self) -> KordaResult<apiextv1::CustomResourceDefinition> {
        let props: apiextv1::JSONSchemaProps =
            serde_json::from_value(self.openapi()).map_err(|e| invalid(format!("derived schema is not valid OpenAPI: {}", e)))?;
        let plural = self.gvk.plural();
        let columns = self
            .printer_cols
            .iter()
            .map(|c| apiextv1::CustomResourceColumnDefinition {
                name: c.name.clone(),
                json_path: c.json_path.clone(),
                type_: c.type_.clone(),
                ..Default::default()
            })
            .collect();
        Ok(apiextv1::CustomResourceDefinition {
            metadata: ObjectMeta { name: Some(crd_name(&self.gvk)), ..Default::default() },
            spec: apiextv1::CustomResourceDefinitionSpec {
                group: self.gvk.group.clone(),
                names: apiextv1::CustomResourceDefinitionNames {
                    kind: self.gvk.kind.clone(),
                    list_kind: Some(format!("{}List", self.gvk.kind)),
                    plural,
                    singular: Some(self.gvk.kind.to_ascii_lowercase()),
                    ..Default::default()
                },
                scope: (if self.namespaced { "Namespaced" } else { "Cluster" }).to_string(),
                versions: vec![apiextv1::CustomResourceDefinitionVersion {
                    name: self.gvk.version.clone(),
                    served: true,
                    storage: true,
                    schema: Some(apiextv1::CustomResourceValidation { open_api_v3_schema: Some(props) }),
                    subresources: Some(apiextv1::CustomResourceSubresources {
                        status: Some(apiextv1::CustomResourceSubresourceStatus(json!({}))),
                        ..Default::default()
                    }),
                    additional_printer_columns: Some(columns),
                    ..Default::default()
                }],
                ..Default::default()
            },
            status: None,
        })
    }
}

/// `<plural>.<group>`, the name the API server requires for a CRD.
pub fn crd_name(gvk: &Gvk) -> String { format!("{}.{}", gvk.plural(), gvk.group) }

fn fill_defaults(schema: &Json, value: &mut Json) {
    let (Some(props), Some(obj)) = (schema.get("properties").and_then(Json::as_object), value.as_object_mut()) else { return };
    for (name, prop) in props {
        match obj.get_mut(name) {
            Some(child) => fill_defaults(prop, child),
            None => {
                if let Some(d) = prop.get("default") {
                    obj.insert(name.clone(), d.clone());
                } else if has_nested_defaults(prop) {
                    let mut child = json!({});
                    fill_defaults(prop, &mut child);
                    obj.insert(name.clone(), child);
                }
            }
        }
    }
}

fn has_nested_defaults(schema: &Json) -> bool {
    schema
        .get("properties")
        .and_then(Json::as_object)
        .map(|props| props.values().any(|p| p.get("default").is_some() || has_nested_defaults(p)))
        .unwrap_or(false)
}

/// Validate `value` against an object schema. Objects that declare
/// properties reject unknown keys unless they preserve unknown fields.
/// Returns one message per violation, keyed by path.
pub fn validate(schema: &Json, value: &Json) -> Vec<String> {
    let strict = strict(schema);
    let compiled = match JSONSchema::options().with_draft(Draft::Draft7).compile(&strict) {
        Ok(c) => c,
        Err(e) => return vec![format!("<schema>: {}", e)],
    };
    let issues = match compiled.validate(value) {
        Ok(()) => Vec::new(),
        Err(errors) => errors.map(|e| format!("{}: {}", field_path(&e.instance_path.to_string()), e)).collect(),
    };
    issues
}

fn strict(schema: &Json) -> Json {
    let Json::Object(obj) = schema else { return schema.clone() };
    let mut out: Map<String, Json> = obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    if let Some(Json::Object(props)) = obj.get("properties") {
        out.insert("properties".into(), Json::Object(props.iter().map(|(k, v)| (k.clone(), strict(v))).collect()));
        let open = obj.get("x-kubernetes-preserve-unknown-fields").and_then(Json::as_bool) == Some(true);
        if !open && !obj.contains_key("additionalProperties") {
            out.insert("additionalProperties".into(), Json::Bool(false));
        }
    }
    for key in ["items", "additionalProperties"] {
        if let Some(sub @ Json::Object(_)) = obj.get(key) {
            out.insert(key.into(), strict(sub));
        }
    }
    Json::Object(out)
}

fn field_path(pointer: &str) -> String {
    let mut path = FieldPath::root();
    for raw in pointer.split('/').skip(1) {
        let seg = raw.replace("~1", "/").replace("~0", "~");
        path = match seg.parse::<usize>() {
            Ok(i) => path.index(i),
            Err(_) => path.child(&seg),
        };
    }
    if path.is_empty() { "<root>".to_string() } else { path.to_string() }
}
