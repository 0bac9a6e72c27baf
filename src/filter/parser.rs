//! Predicate parsing for filter expressions.
//!
//! A filter is a chain of `<property> <op> <value>` predicates joined by
//! case-insensitive `and`/`or`. The logical operator is attached to the
//! predicate before it, which is also the order the chain is evaluated in.

use crate::error::{CoreError, Result};
use std::fmt;

/// Logical connective following a predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    fn from_word(word: &str) -> Option<Self> {
        if word.eq_ignore_ascii_case("and") {
            Some(LogicalOp::And)
        } else if word.eq_ignore_ascii_case("or") {
            Some(LogicalOp::Or)
        } else {
            None
        }
    }
}

/// Comparison operator of one predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    StartsWith,
    EndsWith,
}

impl CompareOp {
    /// Operators that order their operands.
    pub fn is_ordering(self) -> bool {
        matches!(self, CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le)
    }

    /// Operators that work on text only.
    pub fn is_text(self) -> bool {
        matches!(
            self,
            CompareOp::Contains | CompareOp::StartsWith | CompareOp::EndsWith
        )
    }

    /// Operator as written in filter source.
    pub fn as_str(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Contains => "contains",
            CompareOp::StartsWith => "startswith",
            CompareOp::EndsWith => "endswith",
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Right-hand side of a predicate, as written.
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Null,
    /// Numeric literal with its source text.
    Number { value: f64, raw: String },
    /// Quote-delimited string, already unwrapped.
    Quoted(String),
    /// Unquoted token that is neither a number nor `null`.
    Bare(String),
}

impl Literal {
    fn parse(text: &str) -> Option<Self> {
        let first = text.chars().next()?;
        if first == '\'' || first == '"' {
            if text.len() >= 2 && text.ends_with(first) {
                let inner = &text[1..text.len() - 1];
                if !inner.contains(first) {
                    return Some(Literal::Quoted(inner.to_string()));
                }
            }
            return None;
        }
        if text.chars().any(char::is_whitespace) {
            return None;
        }
        if text.eq_ignore_ascii_case("null") {
            return Some(Literal::Null);
        }
        match text.parse::<f64>() {
            Ok(value) if value.is_finite() => Some(Literal::Number {
                value,
                raw: text.to_string(),
            }),
            _ => Some(Literal::Bare(text.to_string())),
        }
    }

    /// The literal's text with any quotes removed.
    pub fn text(&self) -> &str {
        match self {
            Literal::Null => "null",
            Literal::Number { raw, .. } => raw,
            Literal::Quoted(s) | Literal::Bare(s) => s,
        }
    }
}

/// One parsed `<property> <op> <value>` predicate.
#[derive(Clone, Debug, PartialEq)]
pub struct Predicate {
    pub property: String,
    pub op: CompareOp,
    pub literal: Literal,
    /// Source text, used in compile errors.
    pub text: String,
    /// Connective to the next predicate; `None` on the last one.
    pub next: Option<LogicalOp>,
}

/// Parse a filter expression into its predicate chain.
///
/// An empty (or whitespace-only) expression yields no predicates.
pub fn parse(source: &str) -> Result<Vec<Predicate>> {
    let words = split_words(source)?;
    let mut predicates = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for word in &words {
        match LogicalOp::from_word(word) {
            Some(op) => {
                if current.is_empty() {
                    let reason = if predicates.is_empty() {
                        "filter cannot start with a logical operator"
                    } else {
                        "logical operator without a predicate before it"
                    };
                    return Err(CoreError::compile(source.trim(), reason));
                }
                let mut predicate = parse_predicate(&current.join(" "))?;
                predicate.next = Some(op);
                predicates.push(predicate);
                current.clear();
            }
            None => current.push(word),
        }
    }

    if current.is_empty() {
        if !predicates.is_empty() {
            return Err(CoreError::compile(
                source.trim(),
                "filter cannot end with a logical operator",
            ));
        }
        return Ok(predicates);
    }

    predicates.push(parse_predicate(&current.join(" "))?);
    Ok(predicates)
}

/// Split on whitespace outside of quotes.
fn split_words(source: &str) -> Result<Vec<&str>> {
    let mut words = Vec::new();
    let mut start: Option<usize> = None;
    let mut quote: Option<char> = None;

    for (i, c) in source.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                words.push(&source[s..i]);
            }
            continue;
        }
        if start.is_none() {
            start = Some(i);
        }
        if c == '\'' || c == '"' {
            quote = Some(c);
        }
    }

    if quote.is_some() {
        return Err(CoreError::compile(source.trim(), "unterminated string literal"));
    }
    if let Some(s) = start {
        words.push(&source[s..]);
    }
    Ok(words)
}

fn parse_predicate(text: &str) -> Result<Predicate> {
    let text = text.trim();
    let err = |reason: &str| CoreError::compile(text, reason);

    let prop_end = text
        .find(|c: char| c.is_whitespace() || matches!(c, '=' | '!' | '<' | '>'))
        .unwrap_or(text.len());
    let property = &text[..prop_end];
    if property.is_empty() {
        return Err(err("missing property name"));
    }
    if !property
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-' | '$'))
    {
        return Err(err("invalid property name"));
    }

    let rest = text[prop_end..].trim_start();
    let (op, rest) = parse_operator(rest).ok_or_else(|| err("unsupported operator"))?;

    let value = rest.trim();
    if value.is_empty() {
        return Err(err("missing value"));
    }
    let literal = Literal::parse(value).ok_or_else(|| err("malformed value"))?;

    Ok(Predicate {
        property: property.to_string(),
        op,
        literal,
        text: text.to_string(),
        next: None,
    })
}

fn parse_operator(text: &str) -> Option<(CompareOp, &str)> {
    const SYMBOLS: [(&str, CompareOp); 6] = [
        ("!=", CompareOp::Ne),
        (">=", CompareOp::Ge),
        ("<=", CompareOp::Le),
        ("=", CompareOp::Eq),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
    ];
    for (symbol, op) in SYMBOLS {
        if let Some(rest) = text.strip_prefix(symbol) {
            return Some((op, rest));
        }
    }

    let word_end = text
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(text.len());
    let (word, rest) = text.split_at(word_end);
    if !rest.is_empty() && !rest.starts_with(|c: char| c.is_whitespace() || c == '\'' || c == '"') {
        return None;
    }
    let op = match word.to_ascii_lowercase().as_str() {
        "contains" => CompareOp::Contains,
        "startswith" => CompareOp::StartsWith,
        "endswith" => CompareOp::EndsWith,
        _ => return None,
    };
    Some((op, rest))
}
