//! Korda graph: compile a resource-graph definition into an ordered, immutable plan.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use korda_core::{Definition, FieldPath, Gvk, KordaError, KordaResult};
use korda_delta::Diff;
use korda_expr::{Analyzer, Builtin, Evaluator, FieldExpr};
use korda_schema::{spec_schema, DerivedSchema, OutputKind};
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHasher;
use serde_json::Value as Json;
use tracing::debug;

static BUILTIN: Builtin = Builtin;

/// Root identifier reserved for the instance.
const RESERVED_IDS: &[&str] = &[korda_expr::SCHEMA_ROOT];

/// One compiled resource template.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub gvk: Gvk,
    pub template: Json,
    /// Expression fields of the template body.
    pub fields: Vec<FieldExpr>,
    pub ready_when: Vec<FieldExpr>,
    pub dependencies: BTreeSet<String>,
}

/// A declared status output of the composite type.
#[derive(Debug, Clone)]
pub struct Output {
    pub field: FieldExpr,
    pub dependencies: BTreeSet<String>,
}

impl Output {
    pub fn path(&self) -> &FieldPath { &self.field.path }
}

/// Result of builder steps 1 to 4: validated nodes in a topological order.
#[derive(Debug, Clone)]
pub struct Plan {
    nodes: Vec<Node>,
    order: Vec<usize>,
}

impl Plan {
    /// Ids in forward (evaluation) order.
    pub fn order(&self) -> Vec<&str> { self.order.iter().map(|i| self.nodes[*i].id.as_str()).collect() }

    pub fn adjacency(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.nodes.iter().map(|n| (n.id.clone(), n.dependencies.clone())).collect()
    }
}

/// Compiled definition. Immutable; rebuild to change it.
#[derive(Debug, Clone)]
pub struct Graph {
    pub name: String,
    pub gvk: Gvk,
    pub schema: DerivedSchema,
    pub outputs: Vec<Output>,
    pub definition: Definition,
    nodes: Vec<Node>,
    order: Vec<usize>,
    fingerprint: u64,
}

impl Graph {
    /// Nodes in forward order: every dependency precedes its dependents.
    pub fn forward(&self) -> impl DoubleEndedIterator<Item = &Node> + '_ { self.order.iter().map(|i| &self.nodes[*i]) }

    /// Nodes in deletion order (reverse of forward).
    pub fn reverse(&self) -> impl Iterator<Item = &Node> + '_ { self.forward().rev() }

    pub fn order(&self) -> Vec<&str> { self.forward().map(|n| n.id.as_str()).collect() }

    pub fn node(&self, id: &str) -> Option<&Node> { self.nodes.iter().find(|n| n.id == id) }

    /// Declaration order.
    pub fn nodes(&self) -> &[Node] { &self.nodes }

    pub fn adjacency(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.nodes.iter().map(|n| (n.id.clone(), n.dependencies.clone())).collect()
    }

    /// Types used by the templates; controllers watch these for readiness changes.
    pub fn child_gvks(&self) -> BTreeSet<Gvk> { self.nodes.iter().map(|n| n.gvk.clone()).collect() }

    /// Stable hash of the definition spec; equal fingerprints mean equal graphs.
    pub fn fingerprint(&self) -> u64 { self.fingerprint }

    pub fn same_as(&self, other: &Graph) -> bool { self.gvk == other.gvk && self.fingerprint == other.fingerprint }
}

static ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-zA-Z0-9]*$").expect("valid resource id pattern"));

pub struct Builder<'e> {
    evaluator: &'e dyn Evaluator,
}

impl Default for Builder<'static> {
    fn default() -> Self { Self::new(&BUILTIN) }
}

impl<'e> Builder<'e> {
    pub fn new(evaluator: &'e dyn Evaluator) -> Self { Self { evaluator } }

    /// Compile a definition. Never returns a partial graph.
    pub fn build(&self, def: &Definition) -> KordaResult<Graph> {
        let plan = self.plan(def)?;
        let ids: Vec<&str> = plan.nodes.iter().map(|n| n.id.as_str()).collect();
        let analyzer = Analyzer::new(self.evaluator, ids).with_spec_schema(spec_schema(&def.spec.schema.spec)?);
        let outputs = self.outputs(&analyzer, &def.spec.schema.status)?;
        let kinds: Vec<(FieldPath, OutputKind)> = outputs
            .iter()
            .map(|o| {
                let kind = if o.field.template.standalone().is_some() { OutputKind::Typed } else { OutputKind::Text };
                (o.field.path.clone(), kind)
            })
            .collect();
        let gvk = def.gvk();
        if gvk.kind.is_empty() || gvk.version.is_empty() {
            return Err(KordaError::InvalidDefinition("schema.apiVersion and schema.kind are required".into()));
        }
        let schema = DerivedSchema::derive(gvk.clone(), &def.spec.schema.spec, &kinds)?;
        counter!("graph_builds", 1u64);
        debug!(definition = %def.name, gvk = %gvk, order = ?plan.order(), "graph built");
        Ok(Graph {
            name: def.name.clone(),
            gvk,
            schema,
            outputs,
            fingerprint: fingerprint(&def.raw["spec"]),
            definition: def.clone(),
            nodes: plan.nodes,
            order: plan.order,
        })
    }

    /// Steps 1 to 4: names, references, cycles and ordering.
    pub fn plan(&self, def: &Definition) -> KordaResult<Plan> {
        let mut seen = BTreeSet::new();
        for r in &def.spec.resources {
            if !ID_RE.is_match(&r.id) || RESERVED_IDS.contains(&r.id.as_str()) {
                return Err(KordaError::InvalidDefinition(format!(
                    "resource id {:?} must be lowerCamelCase and not reserved",
                    r.id
                )));
            }
            if !seen.insert(r.id.as_str()) {
                return Err(KordaError::DuplicateName(r.id.clone()));
            }
        }

        let analyzer = Analyzer::new(self.evaluator, seen.iter().copied()).with_spec_schema(spec_schema(&def.spec.schema.spec)?);
        let mut nodes = Vec::with_capacity(def.spec.resources.len());
        for r in &def.spec.resources {
            let gvk = r
                .gvk()
                .ok_or_else(|| KordaError::InvalidDefinition(format!("resource {:?} needs a literal apiVersion and kind", r.id)))?;
            if r.template.pointer("/metadata/name").is_none() {
                return Err(KordaError::InvalidDefinition(format!("resource {:?} has no metadata.name", r.id)));
            }
            let fields = analyzer.analyze(Some(&r.id), &r.template)?;
            if let Some(f) = fields.iter().find(|f| is_type_field(&f.path)) {
                return Err(KordaError::InvalidExpression {
                    resource: r.id.clone(),
                    field: f.path.to_string(),
                    reason: "apiVersion and kind must be literals".into(),
                });
            }
            let ready_when = r
                .ready_when
                .iter()
                .enumerate()
                .map(|(i, c)| analyzer.analyze_condition(&r.id, i, c))
                .collect::<KordaResult<Vec<_>>>()?;
            let dependencies = korda_expr::dependencies(&fields);
            nodes.push(Node { id: r.id.clone(), gvk, template: r.template.clone(), fields, ready_when, dependencies });
        }

        let index: BTreeMap<&str, usize> = nodes.iter().enumerate().map(|(i, n)| (n.id.as_str(), i)).collect();
        let edges: Vec<Vec<usize>> = nodes
            .iter()
            .map(|n| {
                let mut deps: Vec<usize> = n.dependencies.iter().filter_map(|d| index.get(d.as_str()).copied()).collect();
                deps.sort_unstable();
                deps
            })
            .collect();
        if let Some(cycle) = find_cycle(&edges) {
            return Err(KordaError::CyclicDependency { path: cycle.into_iter().map(|i| nodes[i].id.clone()).collect() });
        }
        let order = topological_order(&edges);
        Ok(Plan { nodes, order })
    }

    fn outputs(&self, analyzer: &Analyzer<'_>, status: &Json) -> KordaResult<Vec<Output>> {
        let fields = analyzer.analyze(None, status)?;
        let mut leaves = Vec::new();
        collect_leaves(status, &FieldPath::root(), &mut leaves);
        if let Some(literal) = leaves.iter().find(|p| !fields.iter().any(|f| &f.path == *p)) {
            return Err(KordaError::InvalidDefinition(format!("status.{} must be an expression", literal)));
        }
        Ok(fields
            .into_iter()
            .map(|field| {
                let dependencies = korda_expr::dependencies(std::slice::from_ref(&field));
                Output { field, dependencies }
            })
            .collect())
    }
}

fn is_type_field(path: &FieldPath) -> bool {
    matches!(path.segments(), [korda_core::Segment::Field(k)] if k == "apiVersion" || k == "kind")
}

fn collect_leaves(v: &Json, path: &FieldPath, out: &mut Vec<FieldPath>) {
    match v {
        Json::Object(m) => m.iter().for_each(|(k, c)| collect_leaves(c, &path.child(k), out)),
        Json::Array(a) => a.iter().enumerate().for_each(|(i, c)| collect_leaves(c, &path.index(i), out)),
        Json::Null => {}
        _ => out.push(path.clone()),
    }
}

fn fingerprint(spec: &Json) -> u64 {
    let mut h = FxHasher::default();
    // serde_json maps are sorted, so the rendering is canonical
    spec.to_string().hash(&mut h);
    h.finish()
}

/// Depth-first search with white/gray/black coloring along dependency edges.
/// Returns the cycle as a closed path (`a -> b -> a`).
fn find_cycle(edges: &[Vec<usize>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }
    fn visit(n: usize, edges: &[Vec<usize>], color: &mut [Color], stack: &mut Vec<usize>) -> Option<Vec<usize>> {
        color[n] = Color::Gray;
        stack.push(n);
        for &d in &edges[n] {
            match color[d] {
                Color::Gray => {
                    let start = stack.iter().position(|s| *s == d).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(d);
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(c) = visit(d, edges, color, stack) { return Some(c); }
                }
                Color::Black => {}
            }
        }
        stack.pop();
        color[n] = Color::Black;
        None
    }
    let mut color = vec![Color::White; edges.len()];
    let mut stack = Vec::new();
    for n in 0..edges.len() {
        if color[n] == Color::White {
            if let Some(c) = visit(n, edges, &mut color, &mut stack) { return Some(c); }
        }
    }
    None
}

/// Kahn's algorithm; among ready nodes the earliest declared goes first.
fn topological_order(edges: &[Vec<usize>]) -> Vec<usize> {
    let mut indegree: Vec<usize> = edges.iter().map(Vec::len).collect();
    let mut dependents = vec![Vec::new(); edges.len()];
    for (n, deps) in edges.iter().enumerate() {
        for &d in deps { dependents[d].push(n); }
    }
    let mut ready: BTreeSet<usize> = (0..edges.len()).filter(|n| indegree[*n] == 0).collect();
    let mut order = Vec::with_capacity(edges.len());
    while let Some(n) = ready.pop_first() {
        order.push(n);
        for &m in &dependents[n] {
            indegree[m] -= 1;
            if indegree[m] == 0 { ready.insert(m); }
        }
    }
    order
}

/// Build with the embedded expression language.
pub fn build(def: &Definition) -> KordaResult<Graph> { Builder::default().build(def) }

/// Dry-run preview: validates `def` (steps 1 to 4) and compares it with the
/// definition currently stored under the same name. Nothing is registered.
pub fn preview(def: &Definition, existing: Option<&Definition>) -> KordaResult<Vec<Diff>> {
    Builder::default().plan(def)?;
    let empty = Json::Object(serde_json::Map::new());
    let observed = existing.map(|e| &e.raw).unwrap_or(&empty);
    Ok(korda_delta::compare(&def.raw, observed))
}
