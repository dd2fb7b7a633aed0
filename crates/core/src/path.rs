//! Field paths over JSON trees, rendered as `spec.ports[0].name`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::SmallVec;

/// Serialized untagged: keys as strings, indices as numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segment {
    Field(String),
    Index(usize),
}

/// A path from the root of a JSON tree to one of its nodes. Serializes as its
/// segment list so keys containing dots or brackets survive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPath {
    segments: SmallVec<[Segment; 6]>,
}

impl FieldPath {
    pub fn root() -> Self { Self::default() }

    /// Parse `a.b[0].c` (an optional leading `.` is accepted). Keys are limited to
    /// alphanumerics, `_` and `-`; any segment may carry several `[index]` suffixes.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.strip_prefix('.').unwrap_or(s);
        let mut out = Self::root();
        if s.is_empty() { return Some(out); }
        for seg in s.split('.') {
            if seg.is_empty() { return None; }
            let (key, mut rest) = match seg.find('[') {
                Some(i) => (&seg[..i], &seg[i..]),
                None => (seg, ""),
            };
            if key.is_empty() {
                // only the very first segment may start with an index
                if !out.is_empty() || rest.is_empty() { return None; }
            } else {
                if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') { return None; }
                out.push_field(key);
            }
            while !rest.is_empty() {
                if !rest.starts_with('[') { return None; }
                let close = rest.find(']')?;
                let digits = &rest[1..close];
                if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) { return None; }
                out.push_index(digits.parse().ok()?);
                rest = &rest[close + 1..];
            }
        }
        Some(out)
    }

    pub fn push_field(&mut self, key: impl Into<String>) { self.segments.push(Segment::Field(key.into())); }
    pub fn push_index(&mut self, idx: usize) { self.segments.push(Segment::Index(idx)); }

    pub fn child(&self, key: &str) -> Self {
        let mut p = self.clone();
        p.push_field(key);
        p
    }

    pub fn index(&self, idx: usize) -> Self {
        let mut p = self.clone();
        p.push_index(idx);
        p
    }

    pub fn segments(&self) -> &[Segment] { &self.segments }
    pub fn is_empty(&self) -> bool { self.segments.is_empty() }
    pub fn len(&self) -> usize { self.segments.len() }

    /// Resolve this path inside `root`.
    pub fn get<'a>(&self, root: &'a Json) -> Option<&'a Json> {
        let mut cur = root;
        for seg in self.segments.iter() {
            cur = match (seg, cur) {
                (Segment::Field(k), Json::Object(map)) => map.get(k)?,
                (Segment::Index(i), Json::Array(arr)) => arr.get(*i)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    /// Write `value` at this path, creating intermediate objects. Array slots must
    /// already exist. Returns false when a non-container value is in the way.
    pub fn set(&self, root: &mut Json, value: Json) -> bool {
        let Some((last, parents)) = self.segments.split_last() else {
            *root = value;
            return true;
        };
        let mut cur = root;
        for seg in parents {
            cur = match seg {
                Segment::Field(k) => {
                    if cur.is_null() { *cur = Json::Object(serde_json::Map::new()); }
                    match cur.as_object_mut() {
                        Some(map) => map.entry(k.clone()).or_insert(Json::Null),
                        None => return false,
                    }
                }
                Segment::Index(i) => match cur.as_array_mut() {
                    Some(arr) if *i < arr.len() => &mut arr[*i],
                    _ => return false,
                },
            };
        }
        match last {
            Segment::Field(k) => {
                if cur.is_null() { *cur = Json::Object(serde_json::Map::new()); }
                match cur.as_object_mut() {
                    Some(map) => { map.insert(k.clone(), value); true }
                    None => false,
                }
            }
            Segment::Index(i) => match cur.as_array_mut() {
                Some(arr) if *i < arr.len() => { arr[*i] = value; true }
                _ => false,
            },
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for seg in self.segments.iter() {
            match seg {
                Segment::Field(k) => {
                    if !first { f.write_str(".")?; }
                    f.write_str(k)?;
                }
                Segment::Index(i) => write!(f, "[{}]", i)?,
            }
            first = false;
        }
        Ok(())
    }
}
