//! Input graphs and RDF terms
//!
//! Graphs arrive as N-Triples/N-Quads text, as a compact JSON graph, or as
//! already-built triples. Everything is lowered to [`Triple`] values before
//! canonicalization.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// `rdf:type`, emitted for `@type` keys in JSON graphs
pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";

const XSD_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
const XSD_DOUBLE: &str = "http://www.w3.org/2001/XMLSchema#double";
const XSD_BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";

/// A single RDF term
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Term {
    Iri(String),
    Blank(String),
    Literal {
        value: String,
        datatype: Option<String>,
        language: Option<String>,
    },
}

impl Term {
    pub fn iri(value: impl Into<String>) -> Self {
        Self::Iri(value.into())
    }

    pub fn blank(label: impl Into<String>) -> Self {
        Self::Blank(label.into())
    }

    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal {
            value: value.into(),
            datatype: None,
            language: None,
        }
    }

    pub fn typed_literal(value: impl Into<String>, datatype: impl Into<String>) -> Self {
        Self::Literal {
            value: value.into(),
            datatype: Some(datatype.into()),
            language: None,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Iri(iri) => validate_iri(iri),
            Self::Blank(label) => {
                if label.is_empty()
                    || !label
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
                {
                    return Err(Error::MalformedGraph(format!(
                        "invalid blank node label '{}'",
                        label
                    )));
                }
                Ok(())
            }
            Self::Literal {
                datatype, language, ..
            } => {
                if let Some(datatype) = datatype {
                    validate_iri(datatype)?;
                }
                if let Some(language) = language {
                    if language.is_empty()
                        || !language.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                    {
                        return Err(Error::MalformedGraph(format!(
                            "invalid language tag '{}'",
                            language
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    /// N-Quads rendering of this term
    pub fn to_nquads(&self) -> String {
        match self {
            Self::Iri(iri) => format!("<{}>", iri),
            Self::Blank(label) => format!("_:{}", label),
            Self::Literal {
                value,
                datatype,
                language,
            } => {
                let escaped = escape_literal(value);
                match (language, datatype) {
                    (Some(lang), _) => format!("\"{}\"@{}", escaped, lang),
                    (None, Some(dt)) => format!("\"{}\"^^<{}>", escaped, dt),
                    (None, None) => format!("\"{}\"", escaped),
                }
            }
        }
    }
}

/// A subject-predicate-object statement with an optional graph name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Triple {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<Term>,
}

impl Triple {
    pub fn new(subject: Term, predicate: Term, object: Term) -> Self {
        Self {
            subject,
            predicate,
            object,
            graph: None,
        }
    }

    pub fn in_graph(mut self, graph: Term) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Check the positional constraints of RDF terms
    pub fn validate(&self) -> Result<()> {
        if matches!(self.subject, Term::Literal { .. }) {
            return Err(Error::MalformedGraph("subject cannot be a literal".to_string()));
        }
        if !matches!(self.predicate, Term::Iri(_)) {
            return Err(Error::MalformedGraph("predicate must be an IRI".to_string()));
        }
        if let Some(graph) = &self.graph {
            if matches!(graph, Term::Literal { .. }) {
                return Err(Error::MalformedGraph("graph name cannot be a literal".to_string()));
            }
            graph.validate()?;
        }
        self.subject.validate()?;
        self.predicate.validate()?;
        self.object.validate()
    }

    /// One canonical N-Quads line, without trailing newline
    pub fn to_nquad(&self) -> String {
        match &self.graph {
            Some(graph) => format!(
                "{} {} {} {} .",
                self.subject.to_nquads(),
                self.predicate.to_nquads(),
                self.object.to_nquads(),
                graph.to_nquads()
            ),
            None => format!(
                "{} {} {} .",
                self.subject.to_nquads(),
                self.predicate.to_nquads(),
                self.object.to_nquads()
            ),
        }
    }
}

/// Input graph accepted by the normalizer
#[derive(Debug, Clone, PartialEq)]
pub enum Graph {
    /// N-Triples or N-Quads text, one statement per line
    NQuads(String),
    /// Compact JSON graph (`@graph` array of nodes with absolute IRI keys)
    Json(Value),
    /// Triples built by the caller
    Triples(Vec<Triple>),
}

/// Triples plus the graph-level context, if one was declared
#[derive(Debug, Clone, Default)]
pub struct ParsedGraph {
    pub triples: Vec<Triple>,
    pub context: Option<String>,
}

impl Graph {
    /// Lower the input into triples
    pub fn parse(&self) -> Result<ParsedGraph> {
        match self {
            Self::NQuads(text) => Ok(ParsedGraph {
                triples: parse_nquads(text)?,
                context: None,
            }),
            Self::Json(value) => JsonFlattener::default().flatten(value),
            Self::Triples(triples) => {
                for triple in triples {
                    triple.validate()?;
                }
                Ok(ParsedGraph {
                    triples: triples.clone(),
                    context: None,
                })
            }
        }
    }
}

impl From<Vec<Triple>> for Graph {
    fn from(triples: Vec<Triple>) -> Self {
        Self::Triples(triples)
    }
}

impl From<Value> for Graph {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

fn validate_iri(iri: &str) -> Result<()> {
    let forbidden = |c: char| c.is_whitespace() || matches!(c, '<' | '>' | '"' | '{' | '}' | '|' | '^' | '`' | '\\');
    if iri.is_empty() || !iri.contains(':') || iri.chars().any(forbidden) {
        return Err(Error::MalformedGraph(format!("invalid IRI '{}'", iri)));
    }
    Ok(())
}

fn escape_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

/// Parse N-Triples / N-Quads text
pub fn parse_nquads(text: &str) -> Result<Vec<Triple>> {
    let mut triples = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let triple = LineParser::new(line)
            .parse_statement()
            .map_err(|reason| Error::MalformedGraph(format!("line {}: {}", index + 1, reason)))?;
        triple.validate()?;
        triples.push(triple);
    }

    Ok(triples)
}

struct LineParser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> LineParser<'a> {
    fn new(line: &'a str) -> Self {
        Self {
            chars: line.chars().peekable(),
        }
    }

    fn parse_statement(&mut self) -> std::result::Result<Triple, String> {
        let subject = self.term()?.ok_or("missing subject")?;
        let predicate = self.term()?.ok_or("missing predicate")?;
        let object = self.term()?.ok_or("missing object")?;
        let graph = self.term()?;

        self.skip_whitespace();
        if self.chars.next() != Some('.') {
            return Err("statement must end with '.'".to_string());
        }
        self.skip_whitespace();
        match self.chars.peek() {
            None | Some('#') => {}
            Some(c) => return Err(format!("unexpected '{}' after end of statement", c)),
        }

        Ok(Triple {
            subject,
            predicate,
            object,
            graph,
        })
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.chars.peek(), Some(c) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn term(&mut self) -> std::result::Result<Option<Term>, String> {
        self.skip_whitespace();
        match self.chars.peek() {
            Some('<') => {
                self.chars.next();
                Ok(Some(Term::Iri(self.iri_body()?)))
            }
            Some('_') => {
                self.chars.next();
                if self.chars.next() != Some(':') {
                    return Err("blank node must start with '_:'".to_string());
                }
                let label = self.take_while(|c| !c.is_whitespace());
                let label = label.trim_end_matches('.').to_string();
                Ok(Some(Term::Blank(label)))
            }
            Some('"') => {
                self.chars.next();
                let value = self.literal_body()?;
                match self.chars.peek() {
                    Some('@') => {
                        self.chars.next();
                        let language = self.take_while(|c| c.is_ascii_alphanumeric() || c == '-');
                        Ok(Some(Term::Literal {
                            value,
                            datatype: None,
                            language: Some(language),
                        }))
                    }
                    Some('^') => {
                        self.chars.next();
                        if self.chars.next() != Some('^') || self.chars.next() != Some('<') {
                            return Err("datatype must be written as ^^<iri>".to_string());
                        }
                        Ok(Some(Term::Literal {
                            value,
                            datatype: Some(self.iri_body()?),
                            language: None,
                        }))
                    }
                    _ => Ok(Some(Term::literal(value))),
                }
            }
            _ => Ok(None),
        }
    }

    fn iri_body(&mut self) -> std::result::Result<String, String> {
        let mut iri = String::new();
        loop {
            match self.chars.next() {
                Some('>') => return Ok(iri),
                Some('\\') => match self.chars.next() {
                    Some('u') => iri.push(self.code_point(4)?),
                    Some('U') => iri.push(self.code_point(8)?),
                    Some(other) => return Err(format!("unsupported escape '\\{}' in IRI", other)),
                    None => return Err("unterminated escape".to_string()),
                },
                Some(c) => iri.push(c),
                None => return Err("unterminated IRI".to_string()),
            }
        }
    }

    fn literal_body(&mut self) -> std::result::Result<String, String> {
        let mut value = String::new();
        loop {
            match self.chars.next() {
                Some('"') => return Ok(value),
                Some('\\') => match self.chars.next() {
                    Some('n') => value.push('\n'),
                    Some('r') => value.push('\r'),
                    Some('t') => value.push('\t'),
                    Some('b') => value.push('\u{8}'),
                    Some('f') => value.push('\u{c}'),
                    Some('"') => value.push('"'),
                    Some('\'') => value.push('\''),
                    Some('\\') => value.push('\\'),
                    Some('u') => value.push(self.code_point(4)?),
                    Some('U') => value.push(self.code_point(8)?),
                    Some(other) => return Err(format!("unsupported escape '\\{}'", other)),
                    None => return Err("unterminated escape".to_string()),
                },
                Some(c) => value.push(c),
                None => return Err("unterminated literal".to_string()),
            }
        }
    }

    /// Decode the hex digits of a `\u` or `\U` escape
    fn code_point(&mut self, digits: usize) -> std::result::Result<char, String> {
        let hex: String = (0..digits).filter_map(|_| self.chars.next()).collect();
        if hex.len() != digits || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("escape needs {} hex digits, got '{}'", digits, hex));
        }
        let value = u32::from_str_radix(&hex, 16).map_err(|e| e.to_string())?;
        char::from_u32(value).ok_or_else(|| format!("'{}' is not a Unicode scalar value", hex))
    }

    fn take_while(&mut self, keep: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(&c) = self.chars.peek() {
            if !keep(c) {
                break;
            }
            out.push(c);
            self.chars.next();
        }
        out
    }
}

/// Flattens a compact JSON graph into triples, labelling anonymous nodes in
/// traversal order (`_:b0`, `_:b1`, ...)
#[derive(Default)]
struct JsonFlattener {
    triples: Vec<Triple>,
    next_blank: usize,
}

impl JsonFlattener {
    fn flatten(mut self, value: &Value) -> Result<ParsedGraph> {
        let mut context = None;

        let nodes: Vec<&Value> = match value {
            Value::Object(map) => {
                context = map.get("@context").map(|c| match c {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
                match map.get("@graph") {
                    Some(Value::Array(items)) => items.iter().collect(),
                    Some(_) => {
                        return Err(Error::MalformedGraph("@graph must be an array".to_string()));
                    }
                    None => vec![value],
                }
            }
            Value::Array(items) => items.iter().collect(),
            _ => {
                return Err(Error::MalformedGraph(
                    "JSON graph must be an object or an array of nodes".to_string(),
                ));
            }
        };

        for node in nodes {
            self.node(node)?;
        }

        Ok(ParsedGraph {
            triples: self.triples,
            context,
        })
    }

    fn fresh_blank(&mut self) -> Term {
        let term = Term::Blank(format!("b{}", self.next_blank));
        self.next_blank += 1;
        term
    }

    fn node(&mut self, value: &Value) -> Result<Term> {
        let map = value
            .as_object()
            .ok_or_else(|| Error::MalformedGraph(format!("expected a node object, got {}", value)))?;

        let subject = match map.get("@id") {
            Some(Value::String(id)) => id_term(id)?,
            Some(other) => {
                return Err(Error::MalformedGraph(format!("@id must be a string, got {}", other)));
            }
            None => self.fresh_blank(),
        };

        for (key, entry) in map {
            match key.as_str() {
                "@id" | "@context" => {}
                "@type" => {
                    let types: Vec<&Value> = match entry {
                        Value::Array(items) => items.iter().collect(),
                        other => vec![other],
                    };
                    for ty in types {
                        let ty = ty.as_str().ok_or_else(|| {
                            Error::MalformedGraph(format!("@type must be a string, got {}", ty))
                        })?;
                        let triple = Triple::new(subject.clone(), Term::iri(RDF_TYPE), id_term(ty)?);
                        triple.validate()?;
                        self.triples.push(triple);
                    }
                }
                k if k.starts_with('@') => {
                    return Err(Error::MalformedGraph(format!("unsupported keyword '{}'", k)));
                }
                predicate => {
                    let predicate = Term::iri(predicate);
                    let values: Vec<&Value> = match entry {
                        Value::Array(items) => items.iter().collect(),
                        other => vec![other],
                    };
                    for object in values {
                        if let Some(object) = self.object(object)? {
                            let triple = Triple::new(subject.clone(), predicate.clone(), object);
                            triple.validate()?;
                            self.triples.push(triple);
                        }
                    }
                }
            }
        }

        Ok(subject)
    }

    fn object(&mut self, value: &Value) -> Result<Option<Term>> {
        Ok(Some(match value {
            Value::Null => return Ok(None),
            Value::String(s) => Term::literal(s.clone()),
            Value::Bool(b) => Term::typed_literal(b.to_string(), XSD_BOOLEAN),
            Value::Number(n) if n.is_i64() || n.is_u64() => Term::typed_literal(n.to_string(), XSD_INTEGER),
            Value::Number(n) => Term::typed_literal(n.to_string(), XSD_DOUBLE),
            Value::Array(_) => {
                return Err(Error::MalformedGraph("nested arrays are not supported".to_string()));
            }
            Value::Object(map) => {
                if let Some(literal) = map.get("@value") {
                    let value = match literal {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    Term::Literal {
                        value,
                        datatype: map.get("@type").and_then(Value::as_str).map(str::to_string),
                        language: map.get("@language").and_then(Value::as_str).map(str::to_string),
                    }
                } else if map.len() == 1 && map.contains_key("@id") {
                    match map.get("@id") {
                        Some(Value::String(id)) => id_term(id)?,
                        _ => return Err(Error::MalformedGraph("@id must be a string".to_string())),
                    }
                } else {
                    self.node(value)?
                }
            }
        }))
    }
}

fn id_term(id: &str) -> Result<Term> {
    match id.strip_prefix("_:") {
        Some(label) => Ok(Term::blank(label)),
        None => {
            validate_iri(id)?;
            Ok(Term::iri(id))
        }
    }
}
