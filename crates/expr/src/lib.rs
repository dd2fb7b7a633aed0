//! Korda expressions: the evaluator seam, reference analysis and template resolution.
//!
//! The engine only needs two things from an expression language: which
//! identifiers an expression reads and what it evaluates to in a context.
//! [`Evaluator`] is that seam; [`Builtin`] is the small language shipped here.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use korda_core::{FieldPath, KordaError, KordaResult, Segment};
use serde_json::Value as Json;

pub mod lang;
pub mod template;

pub use template::{Piece, Template};

/// Root identifier naming the instance itself.
pub const SCHEMA_ROOT: &str = "schema";

/// One read performed by an expression: root identifier plus the static field path below it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    pub root: String,
    pub path: FieldPath,
}

/// Result of looking up a root identifier.
#[derive(Debug, Clone, Copy)]
pub enum Lookup<'a> {
    Value(&'a Json),
    /// Known name whose state is not observed yet.
    NotAvailable,
    Unknown,
}

pub trait Context {
    fn lookup(&self, root: &str) -> Lookup<'_>;
}

/// Context backed by a map; `None` entries are known but not available.
#[derive(Debug, Clone, Default)]
pub struct MapContext {
    entries: BTreeMap<String, Option<Json>>,
}

impl MapContext {
    pub fn with(mut self, root: impl Into<String>, value: Json) -> Self {
        self.insert(root, value);
        self
    }

    pub fn unavailable(mut self, root: impl Into<String>) -> Self {
        self.mark_unavailable(root);
        self
    }

    pub fn insert(&mut self, root: impl Into<String>, value: Json) { self.entries.insert(root.into(), Some(value)); }
    pub fn mark_unavailable(&mut self, root: impl Into<String>) { self.entries.insert(root.into(), None); }
}

impl Context for MapContext {
    fn lookup(&self, root: &str) -> Lookup<'_> {
        match self.entries.get(root) {
            Some(Some(v)) => Lookup::Value(v),
            Some(None) => Lookup::NotAvailable,
            None => Lookup::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("{0:?} is not available yet")]
    NotAvailable(String),
    #[error("{0} is not present yet")]
    MissingField(String),
    #[error("unknown identifier {0:?}")]
    UnknownIdentifier(String),
    #[error("unknown function {0:?}")]
    UnknownFunction(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl EvalError {
    /// Evaluation could succeed later once more state is observed. The instance
    /// is always observed, so a field missing below `schema` never resolves.
    pub fn is_pending(&self) -> bool {
        match self {
            Self::NotAvailable(_) => true,
            Self::MissingField(_) => self.pending_root() != Some(SCHEMA_ROOT),
            _ => false,
        }
    }

    /// Root identifier the pending lookup was waiting on, when known.
    pub fn pending_root(&self) -> Option<&str> {
        match self {
            Self::NotAvailable(root) => Some(root),
            Self::MissingField(path) => path.split(['.', '[']).next(),
            _ => None,
        }
    }
}

pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expression: &str, ctx: &dyn Context) -> Result<Json, EvalError>;
    fn extract_references(&self, expression: &str) -> Result<BTreeSet<Reference>, EvalError>;
}

/// The embedded language in [`lang`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Builtin;

impl Evaluator for Builtin {
    fn evaluate(&self, expression: &str, ctx: &dyn Context) -> Result<Json, EvalError> {
        Ok(lang::parse(expression)?.eval(ctx)?.into_owned())
    }

    fn extract_references(&self, expression: &str) -> Result<BTreeSet<Reference>, EvalError> {
        let mut out = BTreeSet::new();
        lang::parse(expression)?.references(&mut out);
        Ok(out)
    }
}

/// One expression-bearing string inside a tree.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldExpr {
    pub path: FieldPath,
    pub template: Template,
    pub references: BTreeSet<Reference>,
}

impl FieldExpr {
    pub fn roots(&self) -> impl Iterator<Item = &str> { self.references.iter().map(|r| r.root.as_str()) }
}

/// Validates references against the names declared in one definition.
pub struct Analyzer<'a> {
    evaluator: &'a dyn Evaluator,
    declared: BTreeSet<String>,
    spec_schema: Option<Json>,
}

impl<'a> Analyzer<'a> {
    pub fn new<I, S>(evaluator: &'a dyn Evaluator, declared: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { evaluator, declared: declared.into_iter().map(Into::into).collect(), spec_schema: None }
    }

    /// Check `schema.spec.*` references against the instance's spec schema.
    pub fn with_spec_schema(mut self, schema: Json) -> Self {
        self.spec_schema = Some(schema);
        self
    }

    /// First segment of a `schema.spec` reference the spec schema does not
    /// declare. Open maps and untyped subtrees accept anything below them.
    fn undeclared(&self, path: &FieldPath) -> Option<FieldPath> {
        let mut cur = self.spec_schema.as_ref()?;
        let [Segment::Field(top), rest @ ..] = path.segments() else { return None };
        if top != "spec" {
            return None;
        }
        let mut at = FieldPath::root().child("spec");
        for seg in rest {
            match seg {
                Segment::Field(k) => {
                    at.push_field(k.as_str());
                    let props = cur.get("properties").and_then(Json::as_object);
                    cur = match (props.and_then(|p| p.get(k)), cur.get("additionalProperties")) {
                        (Some(s), _) => s,
                        (None, Some(s)) if s.is_object() => s,
                        (None, _) if props.is_some() => return Some(at),
                        (None, _) => return None,
                    };
                }
                Segment::Index(i) => {
                    at.push_index(*i);
                    cur = cur.get("items")?;
                }
            }
        }
        None
    }

    /// Every expression field inside `value`, with its references. `owner` is the
    /// template being analyzed; `None` for the composite's status outputs.
    pub fn analyze(&self, owner: Option<&str>, value: &Json) -> KordaResult<Vec<FieldExpr>> {
        let resource = owner.unwrap_or("status");
        let mut out = Vec::new();
        collect(self.evaluator, value, &FieldPath::root(), &mut out).map_err(|(path, reason)| invalid(resource, &path, reason))?;
        for field in &out {
            for r in &field.references {
                if r.root == SCHEMA_ROOT {
                    if let Some(at) = self.undeclared(&r.path) {
                        return Err(invalid(resource, &field.path, format!("schema.{} is not declared in the instance schema", at)));
                    }
                    continue;
                }
                if Some(r.root.as_str()) == owner {
                    return Err(invalid(resource, &field.path, format!("self-reference to {:?}", r.root)));
                }
                if !self.declared.contains(&r.root) {
                    return Err(invalid(resource, &field.path, format!("reference to undeclared resource {:?}", r.root)));
                }
            }
        }
        Ok(out)
    }

    /// A readiness condition: one whole `${...}` expression over the owner only.
    pub fn analyze_condition(&self, owner: &str, index: usize, condition: &str) -> KordaResult<FieldExpr> {
        let path = FieldPath::root().child("readyWhen").index(index);
        let template = Template::parse(condition)
            .map_err(|e| invalid(owner, &path, e))?
            .filter(|t| t.standalone().is_some())
            .ok_or_else(|| invalid(owner, &path, "condition must be a single ${...} expression".to_string()))?;
        let mut references = BTreeSet::new();
        for src in template.expressions() {
            references.extend(self.evaluator.extract_references(src).map_err(|e| invalid(owner, &path, e.to_string()))?);
        }
        if let Some(other) = references.iter().find(|r| r.root != owner) {
            return Err(invalid(owner, &path, format!("readiness may only reference {:?}, found {:?}", owner, other.root)));
        }
        Ok(FieldExpr { path, template, references })
    }
}

fn invalid(resource: &str, path: &FieldPath, reason: String) -> KordaError {
    let field = if path.is_empty() { "<root>".to_string() } else { path.to_string() };
    KordaError::InvalidExpression { resource: resource.to_string(), field, reason }
}

fn collect(
    evaluator: &dyn Evaluator,
    value: &Json,
    path: &FieldPath,
    out: &mut Vec<FieldExpr>,
) -> Result<(), (FieldPath, String)> {
    match value {
        Json::String(s) => {
            let Some(template) = Template::parse(s).map_err(|e| (path.clone(), e))? else { return Ok(()) };
            let mut references = BTreeSet::new();
            for src in template.expressions() {
                let refs = evaluator.extract_references(src).map_err(|e| (path.clone(), e.to_string()))?;
                references.extend(refs);
            }
            out.push(FieldExpr { path: path.clone(), template, references });
        }
        Json::Object(map) => {
            for (k, v) in map {
                collect(evaluator, v, &path.child(k), out)?;
            }
        }
        Json::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                collect(evaluator, v, &path.index(i), out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Root identifiers other than `schema` read by a set of fields.
pub fn dependencies(fields: &[FieldExpr]) -> BTreeSet<String> {
    fields.iter().flat_map(|f| f.roots()).filter(|r| *r != SCHEMA_ROOT).map(str::to_string).collect()
}

/// Evaluate one parsed template: whole expressions keep their type, mixed text interpolates.
pub fn render(template: &Template, ctx: &dyn Context, evaluator: &dyn Evaluator) -> Result<Json, EvalError> {
    if let Some(src) = template.standalone() {
        return evaluator.evaluate(src, ctx);
    }
    let mut out = String::new();
    for piece in template.pieces() {
        match piece {
            Piece::Text(t) => out.push_str(t),
            Piece::Expr(src) => out.push_str(&lang::stringify(&evaluator.evaluate(src, ctx)?)),
        }
    }
    Ok(Json::String(out))
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{path}: {error}")]
pub struct ResolveError {
    pub path: FieldPath,
    pub error: EvalError,
}

/// Copy `value` with every expression string replaced by its value.
pub fn resolve(value: &Json, ctx: &dyn Context, evaluator: &dyn Evaluator) -> Result<Json, ResolveError> {
    resolve_at(value, &FieldPath::root(), ctx, evaluator)
}

fn resolve_at(value: &Json, path: &FieldPath, ctx: &dyn Context, evaluator: &dyn Evaluator) -> Result<Json, ResolveError> {
    let fail = |error| ResolveError { path: path.clone(), error };
    match value {
        Json::String(s) => match Template::parse(s).map_err(|e| fail(EvalError::Parse(e)))? {
            Some(t) => render(&t, ctx, evaluator).map_err(fail),
            None => Ok(value.clone()),
        },
        Json::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_at(v, &path.child(k), ctx, evaluator)?);
            }
            Ok(Json::Object(out))
        }
        Json::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| resolve_at(v, &path.index(i), ctx, evaluator))
            .collect::<Result<Vec<_>, _>>()
            .map(Json::Array),
        _ => Ok(value.clone()),
    }
}

/// A readiness condition; anything but boolean `true` is not ready.
pub fn evaluate_condition(condition: &Template, ctx: &dyn Context, evaluator: &dyn Evaluator) -> Result<bool, EvalError> {
    match render(condition, ctx, evaluator)? {
        Json::Bool(b) => Ok(b),
        other => Err(EvalError::Type(format!("readiness condition returned {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roots(fields: &[FieldExpr]) -> Vec<String> { dependencies(fields).into_iter().collect() }

    #[test]
    fn analyzes_nested_references() {
        let analyzer = Analyzer::new(&Builtin, ["db", "svc", "app"]);
        let template = json!({
            "metadata": { "name": "${schema.spec.name}-app" },
            "spec": {
                "env": [ { "name": "DB", "value": "${db.status.endpoint}" } ],
                "port": "${svc.spec.ports[0].port}",
                "replicas": 2
            }
        });
        let fields = analyzer.analyze(Some("app"), &template).unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(roots(&fields), vec!["db", "svc"]);
        let env = fields.iter().find(|f| f.path.to_string() == "spec.env[0].value").unwrap();
        assert_eq!(env.references.iter().next().unwrap().path.to_string(), "status.endpoint");
    }

    #[test]
    fn literals_have_no_references() {
        let analyzer = Analyzer::new(&Builtin, ["db"]);
        assert!(analyzer.analyze(Some("db"), &json!({ "a": [1, "x", { "b": null }] })).unwrap().is_empty());
    }

    #[test]
    fn rejects_undeclared_and_self_references() {
        let analyzer = Analyzer::new(&Builtin, ["db", "app"]);
        let e = analyzer.analyze(Some("app"), &json!({ "x": "${cache.status.host}" })).unwrap_err();
        assert!(matches!(&e, KordaError::InvalidExpression { resource, field, .. } if resource == "app" && field == "x"), "e={}", e);

        let e = analyzer.analyze(Some("app"), &json!({ "x": "${app.metadata.name}" })).unwrap_err();
        assert!(e.to_string().contains("self-reference"), "e={}", e);

        let e = analyzer.analyze(Some("app"), &json!({ "x": "${db.status.}" })).unwrap_err();
        assert!(matches!(e, KordaError::InvalidExpression { .. }));
    }

    #[test]
    fn readiness_conditions_reference_only_their_owner() {
        let analyzer = Analyzer::new(&Builtin, ["db", "app"]);
        assert!(analyzer.analyze_condition("db", 0, "${db.status.ready == true}").is_ok());
        assert!(analyzer.analyze_condition("db", 0, "${app.status.ready}").is_err());
        assert!(analyzer.analyze_condition("db", 1, "ready ${db.status.ready}").is_err());
    }

    #[test]
    fn resolves_typed_and_interpolated_fields() {
        let ctx = MapContext::default()
            .with("schema", json!({ "spec": { "name": "web", "replicas": 3 } }))
            .with("db", json!({ "status": { "endpoint": "db:5432" } }));
        let out = resolve(
            &json!({
                "name": "${schema.spec.name}-app",
                "replicas": "${schema.spec.replicas}",
                "url": "postgres://${db.status.endpoint}/app",
                "fixed": true
            }),
            &ctx,
            &Builtin,
        )
        .unwrap();
        assert_eq!(out, json!({ "name": "web-app", "replicas": 3, "url": "postgres://db:5432/app", "fixed": true }));
    }

    #[test]
    fn unresolved_lookups_are_pending() {
        let ctx = MapContext::default().with("schema", json!({ "spec": {} })).unavailable("db").with("svc", json!({ "spec": {} }));
        let e = resolve(&json!({ "a": { "b": "${db.status.endpoint}" } }), &ctx, &Builtin).unwrap_err();
        assert_eq!(e.path.to_string(), "a.b");
        assert!(e.error.is_pending());
        assert_eq!(e.error.pending_root(), Some("db"));

        let e = resolve(&json!("${svc.status.ip}"), &ctx, &Builtin).unwrap_err();
        assert!(e.error.is_pending());
        assert_eq!(e.error.pending_root(), Some("svc"));

        let e = resolve(&json!("${schema.spec.x + 1}"), &ctx, &Builtin).unwrap_err();
        assert!(!e.error.is_pending(), "the instance is always observed");
        assert_eq!(e.error.pending_root(), Some("schema"));
    }

    #[test]
    fn schema_references_must_be_declared() {
        let spec = json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "ports": { "type": "array", "items": { "type": "object", "properties": { "port": { "type": "integer" } } } },
                "labels": { "type": "object", "additionalProperties": { "type": "string" } },
                "extra": { "x-kubernetes-preserve-unknown-fields": true }
            }
        });
        let analyzer = Analyzer::new(&Builtin, ["db"]).with_spec_schema(spec);
        let ok = json!({
            "a": "${schema.spec.name}",
            "b": "${schema.spec.ports[0].port}",
            "c": "${schema.spec.labels.team}",
            "d": "${schema.spec.extra.anything.below}",
            "e": "${schema.metadata.name}"
        });
        assert!(analyzer.analyze(Some("db"), &ok).is_ok());
        let typo = analyzer.analyze(Some("db"), &json!({ "x": { "y": "${schema.spec.nmae}" } })).unwrap_err();
        assert!(matches!(&typo, KordaError::InvalidExpression { field, reason, .. }
            if field == "x.y" && reason.contains("schema.spec.nmae")));
        assert!(analyzer.analyze(Some("db"), &json!("${schema.spec.ports[0].host}")).is_err());
        assert!(Analyzer::new(&Builtin, ["db"]).analyze(Some("db"), &json!("${schema.spec.nmae}")).is_ok());
    }

    #[test]
    fn conditions_must_be_boolean() {
        let ctx = MapContext::default().with("db", json!({ "status": { "ready": true, "n": 1 } }));
        let ready = Template::parse("${db.status.ready}").unwrap().unwrap();
        assert!(evaluate_condition(&ready, &ctx, &Builtin).unwrap());
        let numeric = Template::parse("${db.status.n}").unwrap().unwrap();
        assert!(evaluate_condition(&numeric, &ctx, &Builtin).is_err());
    }
}
