//! The embedded expression language: lexer, parser and tree-walking evaluator.
//!
//! Grammar, lowest precedence first:
//! `c ? a : b`, `||`, `&&`, `== !=`, `< <= > >=`, `+ -`, `* / %`, unary `! -`,
//! postfix `.field` / `[index]`, then literals, identifiers, calls, `( )` and `[ ]` lists.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;

use korda_core::FieldPath;
use serde_json::Value as Json;

use crate::{Context, EvalError, Lookup, Reference};

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Lit(Json),
    Ident(String),
    Op(&'static str),
}

const TWO_CHAR_OPS: &[&str] = &["==", "!=", "<=", ">=", "&&", "||"];
const ONE_CHAR_OPS: &[&str] = &[".", "[", "]", "(", ")", ",", "?", ":", "!", "-", "+", "*", "/", "%", "<", ">"];

fn lex(src: &str) -> Result<Vec<Tok>, EvalError> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    'outer: while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() { i += 1; }
            let mut float = false;
            if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                float = true;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() { i += 1; }
            }
            let text: String = chars[start..i].iter().collect();
            let lit = if float {
                let f: f64 = text.parse().map_err(|_| EvalError::Parse(format!("bad number {}", text)))?;
                serde_json::Number::from_f64(f).map(Json::Number).ok_or_else(|| EvalError::Parse(format!("bad number {}", text)))?
            } else {
                let n: i64 = text.parse().map_err(|_| EvalError::Parse(format!("number out of range {}", text)))?;
                Json::from(n)
            };
            out.push(Tok::Lit(lit));
            continue;
        }
        if c == '"' || c == '\'' {
            let quote = c;
            let mut s = String::new();
            i += 1;
            while i < chars.len() {
                match chars[i] {
                    '\\' if i + 1 < chars.len() => {
                        s.push(match chars[i + 1] {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                        i += 2;
                    }
                    ch if ch == quote => {
                        i += 1;
                        out.push(Tok::Lit(Json::String(s)));
                        continue 'outer;
                    }
                    ch => {
                        s.push(ch);
                        i += 1;
                    }
                }
            }
            return Err(EvalError::Parse("unterminated string literal".into()));
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') { i += 1; }
            let word: String = chars[start..i].iter().collect();
            out.push(match word.as_str() {
                "true" => Tok::Lit(Json::Bool(true)),
                "false" => Tok::Lit(Json::Bool(false)),
                "null" => Tok::Lit(Json::Null),
                _ => Tok::Ident(word),
            });
            continue;
        }
        if i + 1 < chars.len() {
            let pair: String = chars[i..i + 2].iter().collect();
            if let Some(op) = TWO_CHAR_OPS.iter().find(|op| **op == pair) {
                out.push(Tok::Op(*op));
                i += 2;
                continue;
            }
        }
        let single = c.to_string();
        match ONE_CHAR_OPS.iter().find(|op| **op == single) {
            Some(op) => {
                out.push(Tok::Op(*op));
                i += 1;
            }
            None => return Err(EvalError::Parse(format!("unexpected character {:?}", c))),
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Json),
    List(Vec<Expr>),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(&'static str, Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek_op(&self) -> Option<&'static str> {
        match self.toks.get(self.pos) {
            Some(Tok::Op(op)) => Some(op),
            _ => None,
        }
    }

    fn eat(&mut self, op: &str) -> bool {
        if self.peek_op() == Some(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, op: &str) -> Result<(), EvalError> {
        if self.eat(op) { Ok(()) } else { Err(EvalError::Parse(format!("expected {:?}", op))) }
    }

    fn ternary(&mut self) -> Result<Expr, EvalError> {
        let cond = self.binary(0)?;
        if self.eat("?") {
            let a = self.ternary()?;
            self.expect(":")?;
            let b = self.ternary()?;
            return Ok(Expr::Ternary(Box::new(cond), Box::new(a), Box::new(b)));
        }
        Ok(cond)
    }

    fn binary(&mut self, level: usize) -> Result<Expr, EvalError> {
        const LEVELS: &[&[&str]] = &[&["||"], &["&&"], &["==", "!="], &["<", "<=", ">", ">="], &["+", "-"], &["*", "/", "%"]];
        if level == LEVELS.len() { return self.unary(); }
        let mut lhs = self.binary(level + 1)?;
        while let Some(op) = self.peek_op().filter(|op| LEVELS[level].contains(op)) {
            self.pos += 1;
            let rhs = self.binary(level + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        for op in ["!", "-"] {
            if self.eat(op) {
                let inner = self.unary()?;
                return Ok(Expr::Unary(if op == "!" { "!" } else { "-" }, Box::new(inner)));
            }
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, EvalError> {
        let mut e = self.primary()?;
        loop {
            if self.eat(".") {
                match self.toks.get(self.pos).cloned() {
                    Some(Tok::Ident(f)) => {
                        self.pos += 1;
                        e = Expr::Member(Box::new(e), f);
                    }
                    _ => return Err(EvalError::Parse("expected field name after '.'".into())),
                }
            } else if self.eat("[") {
                let idx = self.ternary()?;
                self.expect("]")?;
                e = Expr::Index(Box::new(e), Box::new(idx));
            } else {
                return Ok(e);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, EvalError> {
        let tok = self.toks.get(self.pos).cloned().ok_or_else(|| EvalError::Parse("unexpected end of expression".into()))?;
        self.pos += 1;
        match tok {
            Tok::Lit(v) => Ok(Expr::Literal(v)),
            Tok::Ident(name) => {
                if self.eat("(") {
                    let args = self.list(")")?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Tok::Op("(") => {
                let e = self.ternary()?;
                self.expect(")")?;
                Ok(e)
            }
            Tok::Op("[") => Ok(Expr::List(self.list("]")?)),
            Tok::Op(op) => Err(EvalError::Parse(format!("unexpected {:?}", op))),
        }
    }

    fn list(&mut self, close: &str) -> Result<Vec<Expr>, EvalError> {
        let mut items = Vec::new();
        if self.eat(close) { return Ok(items); }
        loop {
            items.push(self.ternary()?);
            if self.eat(close) { return Ok(items); }
            self.expect(",")?;
        }
    }
}

pub fn parse(src: &str) -> Result<Expr, EvalError> {
    let toks = lex(src)?;
    if toks.is_empty() { return Err(EvalError::Parse("empty expression".into())); }
    let mut p = Parser { toks, pos: 0 };
    let e = p.ternary()?;
    if p.pos != p.toks.len() {
        return Err(EvalError::Parse(format!("unexpected trailing input in {:?}", src)));
    }
    Ok(e)
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::List(items) => {
                f.write_str("[")?;
                for (i, it) in items.iter().enumerate() {
                    if i > 0 { f.write_str(", ")?; }
                    write!(f, "{}", it)?;
                }
                f.write_str("]")
            }
            Expr::Ident(n) => f.write_str(n),
            Expr::Member(e, field) => write!(f, "{}.{}", e, field),
            Expr::Index(e, i) => write!(f, "{}[{}]", e, i),
            Expr::Unary(op, e) => write!(f, "{}{}", op, e),
            Expr::Binary(op, a, b) => write!(f, "({} {} {})", a, op, b),
            Expr::Ternary(c, a, b) => write!(f, "({} ? {} : {})", c, a, b),
            Expr::Call(name, args) => {
                write!(f, "{}(", name)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 { f.write_str(", ")?; }
                    write!(f, "{}", a)?;
                }
                f.write_str(")")
            }
        }
    }
}

impl Expr {
    /// Root identifier plus static accessor chain, when this is a plain path.
    fn static_chain(&self) -> Option<(String, FieldPath)> {
        match self {
            Expr::Ident(n) => Some((n.clone(), FieldPath::root())),
            Expr::Member(e, field) => e.static_chain().map(|(r, p)| (r, p.child(field))),
            Expr::Index(e, idx) => {
                let (r, p) = e.static_chain()?;
                match idx.as_ref() {
                    Expr::Literal(Json::Number(n)) => Some((r, p.index(n.as_u64()? as usize))),
                    Expr::Literal(Json::String(s)) => Some((r, p.child(s))),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    pub fn references(&self, out: &mut BTreeSet<Reference>) {
        if let Some((root, path)) = self.static_chain() {
            out.insert(Reference { root, path });
            return;
        }
        match self {
            Expr::Literal(_) | Expr::Ident(_) => {}
            Expr::List(items) | Expr::Call(_, items) => items.iter().for_each(|e| e.references(out)),
            Expr::Member(e, _) | Expr::Unary(_, e) => e.references(out),
            Expr::Index(e, i) => {
                e.references(out);
                i.references(out);
            }
            Expr::Binary(_, a, b) => {
                a.references(out);
                b.references(out);
            }
            Expr::Ternary(c, a, b) => {
                c.references(out);
                a.references(out);
                b.references(out);
            }
        }
    }

    pub fn eval<'c>(&self, ctx: &'c dyn Context) -> Result<Cow<'c, Json>, EvalError> {
        match self {
            Expr::Literal(v) => Ok(Cow::Owned(v.clone())),
            Expr::List(items) => {
                let vals = items.iter().map(|e| e.eval(ctx).map(Cow::into_owned)).collect::<Result<Vec<_>, _>>()?;
                Ok(Cow::Owned(Json::Array(vals)))
            }
            Expr::Ident(name) => match ctx.lookup(name) {
                Lookup::Value(v) => Ok(Cow::Borrowed(v)),
                Lookup::NotAvailable => Err(EvalError::NotAvailable(name.clone())),
                Lookup::Unknown => Err(EvalError::UnknownIdentifier(name.clone())),
            },
            Expr::Member(e, field) => {
                let base = e.eval(ctx)?;
                let missing = || EvalError::MissingField(self.to_string());
                match base {
                    Cow::Borrowed(Json::Object(m)) => m.get(field).map(Cow::Borrowed).ok_or_else(missing),
                    Cow::Owned(Json::Object(mut m)) => m.remove(field).map(Cow::Owned).ok_or_else(missing),
                    Cow::Borrowed(Json::Null) | Cow::Owned(Json::Null) => Err(missing()),
                    other => Err(EvalError::Type(format!("cannot access .{} on {}", field, type_name(&other)))),
                }
            }
            Expr::Index(e, idx) => {
                let base = e.eval(ctx)?;
                let idx = idx.eval(ctx)?;
                let missing = || EvalError::MissingField(self.to_string());
                match (base, idx.as_ref()) {
                    (Cow::Borrowed(Json::Array(a)), Json::Number(n)) => {
                        let i = n.as_u64().ok_or_else(|| EvalError::Type(format!("bad index {}", n)))? as usize;
                        a.get(i).map(Cow::Borrowed).ok_or_else(missing)
                    }
                    (Cow::Owned(Json::Array(mut a)), Json::Number(n)) => {
                        let i = n.as_u64().ok_or_else(|| EvalError::Type(format!("bad index {}", n)))? as usize;
                        if i < a.len() { Ok(Cow::Owned(a.swap_remove(i))) } else { Err(missing()) }
                    }
                    (Cow::Borrowed(Json::Object(m)), Json::String(k)) => m.get(k).map(Cow::Borrowed).ok_or_else(missing),
                    (Cow::Owned(Json::Object(mut m)), Json::String(k)) => m.remove(k).map(Cow::Owned).ok_or_else(missing),
                    (Cow::Borrowed(Json::Null) | Cow::Owned(Json::Null), _) => Err(missing()),
                    (b, i) => Err(EvalError::Type(format!("cannot index {} with {}", type_name(&b), type_name(i)))),
                }
            }
            Expr::Unary(op, e) => {
                let v = e.eval(ctx)?;
                match (*op, v.as_ref()) {
                    ("!", Json::Bool(b)) => Ok(Cow::Owned(Json::Bool(!b))),
                    ("-", Json::Number(n)) => Ok(Cow::Owned(match n.as_i64().and_then(i64::checked_neg) {
                        Some(i) => Json::from(i),
                        None => number(-n.as_f64().unwrap_or_default())?,
                    })),
                    (op, v) => Err(EvalError::Type(format!("cannot apply {} to {}", op, type_name(v)))),
                }
            }
            Expr::Binary(op, a, b) => binary(op, a, b, ctx).map(Cow::Owned),
            Expr::Ternary(c, a, b) => match c.eval(ctx)?.as_ref() {
                Json::Bool(true) => a.eval(ctx),
                Json::Bool(false) => b.eval(ctx),
                other => Err(EvalError::Type(format!("condition must be bool, got {}", type_name(other)))),
            },
            Expr::Call(name, args) => call(name, args, ctx).map(Cow::Owned),
        }
    }
}

fn type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "list",
        Json::Object(_) => "map",
    }
}

fn number(f: f64) -> Result<Json, EvalError> {
    serde_json::Number::from_f64(f).map(Json::Number).ok_or_else(|| EvalError::Type("non-finite number".into()))
}

/// Equality with numeric normalization (`1 == 1.0`).
pub(crate) fn json_eq(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => x.as_f64() == y.as_f64(),
        (Json::Array(x), Json::Array(y)) => x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_eq(a, b)),
        (Json::Object(x), Json::Object(y)) => x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).map(|w| json_eq(v, w)).unwrap_or(false)),
        _ => a == b,
    }
}

fn binary(op: &str, a: &Expr, b: &Expr, ctx: &dyn Context) -> Result<Json, EvalError> {
    if op == "&&" || op == "||" {
        let lhs = match a.eval(ctx)?.as_ref() {
            Json::Bool(v) => *v,
            other => return Err(EvalError::Type(format!("{} expects bool, got {}", op, type_name(other)))),
        };
        if (op == "&&" && !lhs) || (op == "||" && lhs) { return Ok(Json::Bool(lhs)); }
        return match b.eval(ctx)?.as_ref() {
            Json::Bool(v) => Ok(Json::Bool(*v)),
            other => Err(EvalError::Type(format!("{} expects bool, got {}", op, type_name(other)))),
        };
    }
    let lhs = a.eval(ctx)?;
    let rhs = b.eval(ctx)?;
    let (l, r) = (lhs.as_ref(), rhs.as_ref());
    match op {
        "==" => return Ok(Json::Bool(json_eq(l, r))),
        "!=" => return Ok(Json::Bool(!json_eq(l, r))),
        _ => {}
    }
    match (l, r) {
        (Json::Number(x), Json::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                let checked = match op {
                    "/" | "%" if y == 0 => return Err(EvalError::Type("division by zero".into())),
                    "+" => x.checked_add(y),
                    "-" => x.checked_sub(y),
                    "*" => x.checked_mul(y),
                    "/" => x.checked_div(y),
                    "%" => x.checked_rem(y),
                    _ => None,
                };
                if let Some(v) = checked {
                    return Ok(Json::from(v));
                }
                if matches!(op, "+" | "-" | "*" | "/" | "%") {
                    return Err(EvalError::Type(format!("integer overflow in {} {} {}", x, op, y)));
                }
            }
            let (x, y) = (x.as_f64().unwrap_or_default(), y.as_f64().unwrap_or_default());
            match op {
                "+" => number(x + y),
                "-" => number(x - y),
                "*" => number(x * y),
                "/" | "%" if y == 0.0 => Err(EvalError::Type("division by zero".into())),
                "/" => number(x / y),
                "%" => number(x % y),
                "<" => Ok(Json::Bool(x < y)),
                "<=" => Ok(Json::Bool(x <= y)),
                ">" => Ok(Json::Bool(x > y)),
                ">=" => Ok(Json::Bool(x >= y)),
                _ => Err(EvalError::Type(format!("unsupported operator {}", op))),
            }
        }
        (Json::String(x), Json::String(y)) => match op {
            "+" => Ok(Json::String(format!("{}{}", x, y))),
            "<" => Ok(Json::Bool(x < y)),
            "<=" => Ok(Json::Bool(x <= y)),
            ">" => Ok(Json::Bool(x > y)),
            ">=" => Ok(Json::Bool(x >= y)),
            _ => Err(EvalError::Type(format!("cannot apply {} to strings", op))),
        },
        (Json::Array(x), Json::Array(y)) if op == "+" => Ok(Json::Array(x.iter().chain(y.iter()).cloned().collect())),
        (l, r) => Err(EvalError::Type(format!("cannot apply {} to {} and {}", op, type_name(l), type_name(r)))),
    }
}

fn call(name: &str, args: &[Expr], ctx: &dyn Context) -> Result<Json, EvalError> {
    let arity = |n: usize| {
        if args.len() == n { Ok(()) } else { Err(EvalError::Type(format!("{}() takes {} argument(s)", name, n))) }
    };
    match name {
        "has" => {
            arity(1)?;
            match args[0].eval(ctx) {
                Ok(v) => Ok(Json::Bool(!v.is_null())),
                Err(EvalError::MissingField(_)) => Ok(Json::Bool(false)),
                Err(e) => Err(e),
            }
        }
        "size" => {
            arity(1)?;
            let v = args[0].eval(ctx)?;
            let n = match v.as_ref() {
                Json::String(s) => s.chars().count(),
                Json::Array(a) => a.len(),
                Json::Object(m) => m.len(),
                other => return Err(EvalError::Type(format!("size() of {}", type_name(other)))),
            };
            Ok(Json::from(n as u64))
        }
        "string" => {
            arity(1)?;
            Ok(Json::String(stringify(args[0].eval(ctx)?.as_ref())))
        }
        _ => Err(EvalError::UnknownFunction(name.to_string())),
    }
}

/// Text form used for interpolation: strings verbatim, `null` empty, others as JSON.
pub fn stringify(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}
