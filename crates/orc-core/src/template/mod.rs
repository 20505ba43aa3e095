//! Template engine: compile a template string once, render it
//! many times against different variable scopes.
//!
//! Syntax: `{{ path[.path]* [| filter[:arg]]* }}`, `{{#if expr}}...{{/if}}`,
//! `{{#each path}}...{{/each}}`.

mod cache;
mod filters;

pub use cache::{CacheStats, TemplateCache};
pub use filters::{parse_filter_chain, Filter};

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::vars::{resolve_dotted, stringify};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unbalanced braces: unterminated '{{{{' starting at byte offset {offset}")]
    UnbalancedBraces { offset: usize },

    #[error("empty variable name in '{{{{}}}}'")]
    EmptyVariableName,

    #[error("unclosed {{{{#{kind}}}}} block")]
    UnclosedBlock { kind: &'static str },

    #[error("unexpected {{{{/{kind}}}}} with no matching open block")]
    UnexpectedClose { kind: &'static str },
}

// ---------------------------------------------------------------------------
// Compiled representation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    If,
    Each,
}

impl BlockKind {
    fn label(self) -> &'static str {
        match self {
            BlockKind::If => "if",
            BlockKind::Each => "each",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    Variable {
        path: String,
        filters: Vec<Filter>,
        /// Exact source text of the `{{...}}` tag, re-emitted verbatim when
        /// resolution fails with no `default` filter applied.
        raw: String,
    },
    Block {
        kind: BlockKind,
        expr: String,
        body: Vec<Segment>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledTemplate {
    pub source: String,
    pub segments: Vec<Segment>,
}

impl CompiledTemplate {
    pub fn render(&self, scope: &Value) -> String {
        render_segments(&self.segments, scope)
    }
}

/// Compile a template string into an ordered segment sequence, validating
/// brace balance and block nesting at compile time.
pub fn compile(source: &str) -> Result<CompiledTemplate, TemplateError> {
    let tokens = tokenize(source)?;
    let segments = parse_sequence(&mut tokens.into_iter().collect(), None)?;
    Ok(CompiledTemplate {
        source: source.to_string(),
        segments,
    })
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

enum Token {
    Literal(String),
    Var {
        path: String,
        filters: Vec<Filter>,
        raw: String,
    },
    OpenIf(String),
    CloseIf,
    OpenEach(String),
    CloseEach,
}

fn tokenize(source: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut rest = source;
    let mut consumed = 0usize;

    loop {
        match rest.find("{{") {
            None => {
                if !rest.is_empty() {
                    tokens.push(Token::Literal(rest.to_string()));
                }
                break;
            }
            Some(open_idx) => {
                if open_idx > 0 {
                    tokens.push(Token::Literal(rest[..open_idx].to_string()));
                }
                let after_open = &rest[open_idx + 2..];
                let close_idx = after_open.find("}}").ok_or(TemplateError::UnbalancedBraces {
                    offset: consumed + open_idx,
                })?;
                let inner_raw = &after_open[..close_idx];
                let inner = inner_raw.trim();

                if let Some(rest_expr) = inner.strip_prefix("#if") {
                    let expr = rest_expr.trim().to_string();
                    if expr.is_empty() {
                        return Err(TemplateError::EmptyVariableName);
                    }
                    tokens.push(Token::OpenIf(expr));
                } else if inner == "/if" {
                    tokens.push(Token::CloseIf);
                } else if let Some(rest_expr) = inner.strip_prefix("#each") {
                    let expr = rest_expr.trim().to_string();
                    if expr.is_empty() {
                        return Err(TemplateError::EmptyVariableName);
                    }
                    tokens.push(Token::OpenEach(expr));
                } else if inner == "/each" {
                    tokens.push(Token::CloseEach);
                } else {
                    let mut parts = inner.splitn(2, '|');
                    let path = parts.next().unwrap_or("").trim().to_string();
                    if path.is_empty() {
                        return Err(TemplateError::EmptyVariableName);
                    }
                    let filters = parts.next().map(parse_filter_chain).unwrap_or_default();
                    tokens.push(Token::Var {
                        path,
                        filters,
                        raw: format!("{{{{{inner_raw}}}}}"),
                    });
                }

                consumed += open_idx + 2 + close_idx + 2;
                rest = &after_open[close_idx + 2..];
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Tree builder
// ---------------------------------------------------------------------------

fn parse_sequence(
    tokens: &mut VecDeque<Token>,
    expected_close: Option<BlockKind>,
) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();

    loop {
        match tokens.pop_front() {
            None => {
                return match expected_close {
                    Some(kind) => Err(TemplateError::UnclosedBlock { kind: kind.label() }),
                    None => Ok(segments),
                };
            }
            Some(Token::Literal(s)) => segments.push(Segment::Literal(s)),
            Some(Token::Var { path, filters, raw }) => {
                segments.push(Segment::Variable { path, filters, raw })
            }
            Some(Token::OpenIf(expr)) => {
                let body = parse_sequence(tokens, Some(BlockKind::If))?;
                segments.push(Segment::Block {
                    kind: BlockKind::If,
                    expr,
                    body,
                });
            }
            Some(Token::OpenEach(expr)) => {
                let body = parse_sequence(tokens, Some(BlockKind::Each))?;
                segments.push(Segment::Block {
                    kind: BlockKind::Each,
                    expr,
                    body,
                });
            }
            Some(Token::CloseIf) => {
                if expected_close == Some(BlockKind::If) {
                    return Ok(segments);
                }
                return Err(TemplateError::UnexpectedClose { kind: "if" });
            }
            Some(Token::CloseEach) => {
                if expected_close == Some(BlockKind::Each) {
                    return Ok(segments);
                }
                return Err(TemplateError::UnexpectedClose { kind: "each" });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Truthiness rule: `false`, `0`, `0.0`, empty string, empty
/// container, or absent are falsy; everything else is truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(m) => !m.is_empty(),
    }
}

fn render_segments(segments: &[Segment], scope: &Value) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(s) => out.push_str(s),
            Segment::Variable { path, filters, raw } => {
                let resolved = resolve_dotted(scope, path).cloned();
                let has_default = filters.iter().any(|f| f.name == "default");
                let mut current = resolved;
                for f in filters {
                    current = f.apply(current);
                }
                match current {
                    Some(v) => out.push_str(&stringify(&v)),
                    None if has_default => {}
                    None => out.push_str(raw),
                }
            }
            Segment::Block {
                kind: BlockKind::If,
                expr,
                body,
            } => {
                let truthy_val = resolve_dotted(scope, expr).map(truthy).unwrap_or(false);
                if truthy_val {
                    out.push_str(&render_segments(body, scope));
                }
            }
            Segment::Block {
                kind: BlockKind::Each,
                expr,
                body,
            } => {
                if let Some(items) = resolve_dotted(scope, expr) {
                    match items {
                        Value::Array(arr) => {
                            for item in arr {
                                let child = child_scope(scope, item);
                                out.push_str(&render_segments(body, &child));
                            }
                        }
                        Value::Object(map) => {
                            for (_k, item) in map {
                                let child = child_scope(scope, item);
                                out.push_str(&render_segments(body, &child));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
    out
}

/// Build the scope visible inside a `{{#each}}` body: `this` is bound to
/// the current element, and if the element is itself a mapping its keys
/// are directly addressable alongside the outer scope.
fn child_scope(outer: &Value, item: &Value) -> Value {
    let mut map = match outer {
        Value::Object(m) => m.clone(),
        _ => serde_json::Map::new(),
    };
    map.insert("this".to_string(), item.clone());
    if let Value::Object(item_map) = item {
        for (k, v) in item_map {
            map.insert(k.clone(), v.clone());
        }
    }
    Value::Object(map)
}

// ---------------------------------------------------------------------------
// Engine: compile cache + render
// ---------------------------------------------------------------------------

/// Compiles templates once and renders them many times, backed by a bounded
/// LRU cache keyed on the template source string.
pub struct TemplateEngine {
    cache: TemplateCache,
}

impl TemplateEngine {
    pub fn new(max_entries: usize) -> Self {
        Self {
            cache: TemplateCache::new(max_entries),
        }
    }

    /// Compile (or fetch from cache) a template, then render it against
    /// `scope`.
    pub fn render_string(&self, source: &str, scope: &Value) -> Result<String, TemplateError> {
        let compiled = self.compile(source)?;
        Ok(compiled.render(scope))
    }

    pub fn compile(&self, source: &str) -> Result<Arc<CompiledTemplate>, TemplateError> {
        if let Some(hit) = self.cache.get(source) {
            return Ok(hit);
        }
        let compiled = Arc::new(compile(source)?);
        self.cache.insert(source.to_string(), compiled.clone());
        Ok(compiled)
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}
