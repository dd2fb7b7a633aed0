//! Korda delta: structural diffs between a desired and an observed object.
//!
//! Maps are walked by key in sorted order (desired keys first, then keys only the
//! observed side has), sequences by index. Callers decide which paths are
//! system-managed through an exclusion predicate.

#![forbid(unsafe_code)]

use std::fmt::Write as _;

use korda_core::FieldPath;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// One field-level difference. `None` means the field is absent on that side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub path: FieldPath,
    pub observed: Option<Json>,
    pub desired: Option<Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl std::fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} added, {} changed, {} removed", self.adds, self.updates, self.removes)
    }
}

/// Metadata written by the API server rather than by the author of an object.
const SERVER_METADATA: &[&str] = &[
    "managedFields",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "uid",
    "selfLink",
    "finalizers",
];

/// Default exclusion: top-level `status` and server-populated metadata.
pub fn is_system_managed(path: &FieldPath) -> bool {
    use korda_core::Segment;
    match path.segments() {
        [Segment::Field(top)] if top == "status" => true,
        [Segment::Field(top), Segment::Field(key), ..] if top == "metadata" => SERVER_METADATA.contains(&key.as_str()),
        _ => false,
    }
}

type Exclude<'a> = Box<dyn Fn(&FieldPath) -> bool + Send + Sync + 'a>;

pub struct Comparator<'a> {
    exclude: Exclude<'a>,
    report_removed: bool,
}

impl Default for Comparator<'_> {
    fn default() -> Self { Self { exclude: Box::new(is_system_managed), report_removed: true } }
}

impl<'a> Comparator<'a> {
    pub fn new() -> Self { Self::default() }

    /// Replace the exclusion predicate. Excluded paths (and everything below them)
    /// are skipped on both sides.
    pub fn excluding(mut self, pred: impl Fn(&FieldPath) -> bool + Send + Sync + 'a) -> Self {
        self.exclude = Box::new(pred);
        self
    }

    /// Do not report map keys that only the observed side carries. Used for drift
    /// detection, where the server fills in defaults the template never set.
    /// Surplus sequence elements are still reported.
    pub fn ignore_observed_extras(mut self) -> Self {
        self.report_removed = false;
        self
    }

    pub fn compare(&self, desired: &Json, observed: &Json) -> Vec<Diff> {
        let mut out = Vec::new();
        self.walk(desired, observed, &FieldPath::root(), &mut out);
        out
    }

    fn walk(&self, desired: &Json, observed: &Json, path: &FieldPath, out: &mut Vec<Diff>) {
        match (desired, observed) {
            (Json::Object(d), Json::Object(o)) => {
                let mut keys: Vec<&String> = d.keys().collect();
                keys.sort();
                for k in keys {
                    let child = path.child(k);
                    if (self.exclude)(&child) { continue; }
                    let dv = &d[k.as_str()];
                    match o.get(k) {
                        Some(ov) => self.walk(dv, ov, &child, out),
                        None if dv.is_null() => {}
                        None => out.push(Diff { path: child, observed: None, desired: Some(dv.clone()) }),
                    }
                }
                if self.report_removed {
                    let mut removed: Vec<&String> = o.keys().filter(|k| !d.contains_key(k.as_str())).collect();
                    removed.sort();
                    for k in removed {
                        let child = path.child(k);
                        let ov = &o[k.as_str()];
                        if ov.is_null() || (self.exclude)(&child) { continue; }
                        out.push(Diff { path: child, observed: Some(ov.clone()), desired: None });
                    }
                }
            }
            (Json::Array(d), Json::Array(o)) => {
                for i in 0..d.len().max(o.len()) {
                    let child = path.index(i);
                    match (d.get(i), o.get(i)) {
                        (Some(dv), Some(ov)) => self.walk(dv, ov, &child, out),
                        (Some(dv), None) => out.push(Diff { path: child, observed: None, desired: Some(dv.clone()) }),
                        (None, Some(ov)) => out.push(Diff { path: child, observed: Some(ov.clone()), desired: None }),
                        (None, None) => {}
                    }
                }
            }
            (d, o) => {
                if !scalar_eq(d, o) {
                    out.push(Diff { path: path.clone(), observed: Some(o.clone()), desired: Some(d.clone()) });
                }
            }
        }
    }
}

/// `1` and `1.0` are the same value once they went through an API server.
fn scalar_eq(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Compare with the default exclusions, reporting removed keys.
pub fn compare(desired: &Json, observed: &Json) -> Vec<Diff> {
    Comparator::default().compare(desired, observed)
}

pub fn summarize(diffs: &[Diff]) -> DiffSummary {
    let mut s = DiffSummary::default();
    for d in diffs {
        match (&d.observed, &d.desired) {
            (None, Some(_)) => s.adds += 1,
            (Some(_), None) => s.removes += 1,
            _ => s.updates += 1,
        }
    }
    s
}

pub fn render_value(v: &Option<Json>) -> String {
    match v {
        Some(v) => serde_json::to_string(v).unwrap_or_else(|_| "<unprintable>".to_string()),
        None => "<none>".to_string(),
    }
}

/// Numbered preview blocks, one per diff, in comparator order.
pub fn render(diffs: &[Diff]) -> String {
    let mut out = String::new();
    for (i, d) in diffs.iter().enumerate() {
        let _ = writeln!(out, "{}. Path: {}", i + 1, d.path);
        let _ = writeln!(out, "   - Old: {}", render_value(&d.observed));
        let _ = writeln!(out, "   + New: {}", render_value(&d.desired));
        out.push('\n');
    }
    out
}

/// Full preview report as printed by `create --dry-run`.
pub fn render_report(diffs: &[Diff]) -> String {
    let mut out = String::from("Delta comparison results:\n");
    if diffs.is_empty() {
        out.push_str("No differences found\n");
    } else {
        out.push_str(&render(diffs));
        let _ = writeln!(out, "Summary: {}", summarize(diffs));
    }
    out
}
