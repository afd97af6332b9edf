//! N-Quads line parsing.
//!
//! `<subject> <predicate> <object> [<label>] .` where the object is an
//! iri, a blank node, or a quoted literal with an optional `@lang` tag or
//! `^^<type-iri>` suffix. Blank nodes keep their `_:name` spelling and
//! flow through uid assignment like any other xid.

use crate::error::{Result, TernError};
use crate::model::{NQuad, TypedValue};

struct Scanner<'a> {
    line: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(line: &'a str) -> Self {
        Scanner {
            line,
            bytes: line.as_bytes(),
            pos: 0,
        }
    }

    fn err(&self, msg: &str) -> TernError {
        TernError::SchemaViolation(format!("{msg} in line {:?}", self.line))
    }

    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && (self.bytes[self.pos] as char).is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }

    /// `<...>` with the brackets stripped.
    fn iri(&mut self) -> Result<String> {
        if self.bump() != Some(b'<') {
            return Err(self.err("expected '<'"));
        }
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b'>' {
                let iri = &self.line[start..self.pos];
                self.pos += 1;
                if iri.is_empty() {
                    return Err(self.err("empty iri"));
                }
                return Ok(iri.to_string());
            }
            self.pos += 1;
        }
        Err(self.err("unterminated iri"))
    }

    /// `_:name`, kept verbatim as the xid.
    fn blank(&mut self) -> Result<String> {
        let start = self.pos;
        self.pos += 2; // "_:"
        while let Some(b) = self.peek() {
            if (b as char).is_whitespace() {
                break;
            }
            self.pos += 1;
        }
        if self.pos - start <= 2 {
            return Err(self.err("empty blank node label"));
        }
        Ok(self.line[start..self.pos].to_string())
    }

    /// An iri or blank node, used for subjects, uid objects, and labels.
    fn node(&mut self) -> Result<String> {
        match self.peek() {
            Some(b'<') => self.iri(),
            Some(b'_') => self.blank(),
            _ => Err(self.err("expected iri or blank node")),
        }
    }

    fn quoted(&mut self) -> Result<String> {
        if self.bump() != Some(b'"') {
            return Err(self.err("expected '\"'"));
        }
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(b'"') => return Ok(out),
                Some(b'\\') => match self.bump() {
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    Some(b'n') => out.push('\n'),
                    Some(b't') => out.push('\t'),
                    Some(b'r') => out.push('\r'),
                    _ => return Err(self.err("bad escape")),
                },
                Some(_) => {
                    // Multi-byte characters pass through untouched; back
                    // up to copy the whole char.
                    let ch_start = self.pos - 1;
                    while !self.line.is_char_boundary(self.pos) {
                        self.pos += 1;
                    }
                    out.push_str(&self.line[ch_start..self.pos]);
                }
                None => return Err(self.err("unterminated literal")),
            }
        }
    }

    fn lang_tag(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if (b as char).is_alphanumeric() || b == b'-' {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.line[start..self.pos].to_string()
    }
}

/// Maps a datatype iri to a typed value, coercing the lexical form.
fn typed_literal(text: String, type_iri: &str, scanner: &Scanner<'_>) -> Result<TypedValue> {
    let local = type_iri
        .rsplit(|c| c == '#' || c == '/')
        .next()
        .unwrap_or(type_iri);
    match local {
        "int" | "integer" | "long" => text
            .parse::<i64>()
            .map(TypedValue::Int)
            .map_err(|_| scanner.err("literal is not an integer")),
        "float" | "double" | "decimal" => text
            .parse::<f64>()
            .map(TypedValue::Float)
            .map_err(|_| scanner.err("literal is not a float")),
        "boolean" => match text.as_str() {
            "true" | "1" => Ok(TypedValue::Bool(true)),
            "false" | "0" => Ok(TypedValue::Bool(false)),
            _ => Err(scanner.err("literal is not a boolean")),
        },
        "dateTime" | "date" => {
            // Kept verbatim; a loose shape check catches obvious junk.
            if text.len() < 4 || !text.as_bytes()[..4].iter().all(u8::is_ascii_digit) {
                return Err(scanner.err("literal is not a datetime"));
            }
            Ok(TypedValue::DateTime(text))
        }
        "geoJSON" | "wktLiteral" => Ok(TypedValue::Geo(text)),
        _ => Ok(TypedValue::Str(text)),
    }
}

/// Parses one N-Quads line. Empty lines and `#` comments yield `None`.
pub fn parse(line: &str) -> Result<Option<NQuad>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let mut s = Scanner::new(trimmed);
    let mut nq = NQuad::default();

    s.skip_ws();
    nq.subject = s.node()?;
    s.skip_ws();
    nq.predicate = s.iri()?;
    s.skip_ws();

    match s.peek() {
        Some(b'<') | Some(b'_') => {
            nq.object_id = s.node()?;
        }
        Some(b'"') => {
            let text = s.quoted()?;
            match s.peek() {
                Some(b'@') => {
                    s.bump();
                    nq.lang = s.lang_tag();
                    nq.object_value = Some(TypedValue::Str(text));
                }
                Some(b'^') => {
                    s.bump();
                    if s.bump() != Some(b'^') {
                        return Err(s.err("expected '^^'"));
                    }
                    let type_iri = s.iri()?;
                    nq.object_value = Some(typed_literal(text, &type_iri, &s)?);
                }
                _ => {
                    nq.object_value = Some(TypedValue::Str(text));
                }
            }
        }
        _ => return Err(s.err("expected object")),
    }

    s.skip_ws();
    if matches!(s.peek(), Some(b'<') | Some(b'_')) {
        nq.label = s.node()?;
        s.skip_ws();
    }
    if s.bump() != Some(b'.') {
        return Err(s.err("expected terminating '.'"));
    }
    s.skip_ws();
    if s.peek().is_some() {
        return Err(s.err("trailing garbage"));
    }
    Ok(Some(nq))
}
