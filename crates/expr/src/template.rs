//! `${...}` segment scanning inside string field values.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece {
    Text(String),
    Expr(String),
}

/// A string field split into literal text and embedded expressions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pieces: Vec<Piece>,
}

impl Template {
    /// `Ok(None)` when the string carries no `${`.
    pub fn parse(s: &str) -> Result<Option<Self>, String> {
        if !s.contains("${") { return Ok(None); }
        let mut pieces = Vec::new();
        let mut text = String::new();
        let mut rest = s;
        while let Some(start) = rest.find("${") {
            text.push_str(&rest[..start]);
            let body = &rest[start + 2..];
            let end = closing_brace(body).ok_or_else(|| format!("unterminated expression in {:?}", s))?;
            let src = body[..end].trim();
            if src.is_empty() { return Err(format!("empty expression in {:?}", s)); }
            if !text.is_empty() { pieces.push(Piece::Text(std::mem::take(&mut text))); }
            pieces.push(Piece::Expr(src.to_string()));
            rest = &body[end + 1..];
        }
        text.push_str(rest);
        if !text.is_empty() { pieces.push(Piece::Text(text)); }
        Ok(Some(Self { pieces }))
    }

    pub fn pieces(&self) -> &[Piece] { &self.pieces }

    pub fn expressions(&self) -> impl Iterator<Item = &str> {
        self.pieces.iter().filter_map(|p| match p {
            Piece::Expr(e) => Some(e.as_str()),
            Piece::Text(_) => None,
        })
    }

    /// The sole expression when the whole string is one `${...}`; such fields
    /// keep the expression's value type instead of being interpolated.
    pub fn standalone(&self) -> Option<&str> {
        match self.pieces.as_slice() {
            [Piece::Expr(e)] => Some(e),
            _ => None,
        }
    }
}

/// Byte offset of the `}` closing an expression body, skipping nested braces
/// and quoted strings.
fn closing_brace(body: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '{' => depth += 1,
            '}' if depth == 0 => return Some(i),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_strings_have_no_template() {
        assert_eq!(Template::parse("hello").unwrap(), None);
        assert_eq!(Template::parse("$notanexpr {x}").unwrap(), None);
    }

    #[test]
    fn splits_text_and_expressions() {
        let t = Template::parse("http://${svc.metadata.name}:${schema.spec.port}/").unwrap().unwrap();
        assert_eq!(
            t.pieces(),
            &[
                Piece::Text("http://".into()),
                Piece::Expr("svc.metadata.name".into()),
                Piece::Text(":".into()),
                Piece::Expr("schema.spec.port".into()),
                Piece::Text("/".into()),
            ]
        );
        assert_eq!(t.standalone(), None);
        assert_eq!(Template::parse("${ schema.spec.replicas }").unwrap().unwrap().standalone(), Some("schema.spec.replicas"));
    }

    #[test]
    fn braces_inside_strings_do_not_close() {
        let t = Template::parse("${'}' + x}").unwrap().unwrap();
        assert_eq!(t.standalone(), Some("'}' + x"));
    }

    #[test]
    fn malformed_segments_are_rejected() {
        assert!(Template::parse("${schema.spec").is_err());
        assert!(Template::parse("a ${ } b").is_err());
    }
}
