//! Document-mode filter compilation and the shared chain fold.

use super::document::Document;
use super::parser::{self, CompareOp, Literal, LogicalOp, Predicate};
use crate::error::{CoreError, Result};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// A compiled predicate over `T`.
pub type PredicateFn<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Fold compiled predicates left to right.
///
/// The connective recorded on each predicate joins the accumulated result with
/// the predicate after it, so `a or b and c` is `(a or b) and c`. No predicates
/// means match everything.
pub(crate) fn chain<T: ?Sized + 'static>(
    predicates: Vec<(PredicateFn<T>, Option<LogicalOp>)>,
) -> PredicateFn<T> {
    let mut iter = predicates.into_iter();
    let Some((first, mut pending)) = iter.next() else {
        return Arc::new(|_: &T| true);
    };

    let mut acc = first;
    for (next, op) in iter {
        let left = acc;
        let joined: PredicateFn<T> = match pending.unwrap_or(LogicalOp::And) {
            LogicalOp::And => Arc::new(move |v: &T| left(v) && next(v)),
            LogicalOp::Or => Arc::new(move |v: &T| left(v) || next(v)),
        };
        acc = joined;
        pending = op;
    }
    acc
}

/// Outcome of an ordering comparison under `op`.
pub(crate) fn ordering_matches(op: CompareOp, ordering: Option<Ordering>) -> bool {
    match (op, ordering) {
        (CompareOp::Eq, Some(o)) => o == Ordering::Equal,
        (CompareOp::Ne, Some(o)) => o != Ordering::Equal,
        (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
        (CompareOp::Ge, Some(o)) => o != Ordering::Less,
        (CompareOp::Lt, Some(o)) => o == Ordering::Less,
        (CompareOp::Le, Some(o)) => o != Ordering::Greater,
        _ => false,
    }
}

pub(crate) fn text_matches(op: CompareOp, value: &str, literal: &str) -> bool {
    match op {
        CompareOp::Contains => value.contains(literal),
        CompareOp::StartsWith => value.starts_with(literal),
        CompareOp::EndsWith => value.ends_with(literal),
        _ => ordering_matches(op, Some(value.cmp(literal))),
    }
}

/// A filter compiled for document-mode evaluation.
#[derive(Clone)]
pub struct CompiledFilter {
    predicate: PredicateFn<Document>,
    predicate_count: usize,
}

impl CompiledFilter {
    /// Compile a filter expression against semi-structured documents.
    pub fn compile(source: &str) -> Result<Self> {
        let predicates = parser::parse(source)?;
        let predicate_count = predicates.len();

        let compiled = predicates
            .iter()
            .map(|p| Ok((compile_predicate(p)?, p.next)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            predicate: chain(compiled),
            predicate_count,
        })
    }

    /// Evaluate the compiled chain against `document`.
    pub fn matches(&self, document: &Document) -> bool {
        (self.predicate)(document)
    }

    /// Number of predicates in the chain; zero matches everything.
    pub fn predicate_count(&self) -> usize {
        self.predicate_count
    }
}

impl fmt::Debug for CompiledFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFilter")
            .field("predicate_count", &self.predicate_count)
            .finish()
    }
}

fn compile_predicate(p: &Predicate) -> Result<PredicateFn<Document>> {
    let property = p.property.clone();
    let op = p.op;

    match &p.literal {
        Literal::Null => match op {
            CompareOp::Eq => Ok(Arc::new(move |doc: &Document| {
                doc.lookup(&property).map_or(true, Document::is_null)
            })),
            CompareOp::Ne => Ok(Arc::new(move |doc: &Document| {
                doc.lookup(&property).map_or(false, |v| !v.is_null())
            })),
            _ => Err(CoreError::compile(
                &p.text,
                format!("operator `{}` cannot compare against null", op),
            )),
        },

        Literal::Number { value, .. } if !op.is_text() => {
            let literal = *value;
            Ok(Arc::new(move |doc: &Document| {
                let number = doc
                    .lookup(&property)
                    .and_then(Document::to_text)
                    .and_then(|text| text.trim().parse::<f64>().ok());
                match number {
                    Some(n) => ordering_matches(op, n.partial_cmp(&literal)),
                    None => false,
                }
            }))
        }

        Literal::Bare(word) if !is_bool_word(word) => Err(CoreError::compile(
            &p.text,
            "string literals must be quoted",
        )),

        Literal::Bare(word) => {
            if !matches!(op, CompareOp::Eq | CompareOp::Ne) {
                return Err(CoreError::compile(
                    &p.text,
                    format!("operator `{}` is not supported for booleans", op),
                ));
            }
            let expected = word.to_ascii_lowercase();
            Ok(Arc::new(move |doc: &Document| {
                match doc.lookup(&property).and_then(Document::to_text) {
                    Some(text) => (text.eq_ignore_ascii_case(&expected)) == (op == CompareOp::Eq),
                    None => false,
                }
            }))
        }

        // Quoted strings, and numbers under text operators.
        literal => {
            let expected = literal.text().to_string();
            Ok(Arc::new(move |doc: &Document| {
                match doc.lookup(&property).and_then(Document::to_text) {
                    Some(text) => text_matches(op, &text, &expected),
                    None => false,
                }
            }))
        }
    }
}

fn is_bool_word(word: &str) -> bool {
    word.eq_ignore_ascii_case("true") || word.eq_ignore_ascii_case("false")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        Document::from(value)
    }

    #[test]
    fn test_null_checks_and_equality() {
        let filter = CompiledFilter::compile("id != null and value != null and id = 10").unwrap();
        assert_eq!(filter.predicate_count(), 3);
        assert!(filter.matches(&doc(json!({"id": 10, "value": 52}))));
        assert!(!filter.matches(&doc(json!({"id": 20, "value": 52}))));
        assert!(!filter.matches(&doc(json!({"id": 10}))));
        assert!(!filter.matches(&doc(json!({"id": 10, "value": null}))));

        let other = CompiledFilter::compile("id = 20").unwrap();
        assert!(!other.matches(&doc(json!({"id": 10, "value": 52}))));
        assert!(other.matches(&doc(json!({"id": 20, "value": 52}))));
    }

    #[test]
    fn test_numeric_comparisons_parse_text_form() {
        let filter = CompiledFilter::compile("price >= 9.5").unwrap();
        assert!(filter.matches(&doc(json!({"price": 9.5}))));
        assert!(filter.matches(&doc(json!({"price": "12"}))));
        assert!(!filter.matches(&doc(json!({"price": 3}))));
        assert!(!filter.matches(&doc(json!({"price": "cheap"}))));
        assert!(!filter.matches(&doc(json!({}))));
    }

    #[test]
    fn test_string_operators() {
        let doc = doc(json!({"name": "sensor-north-7"}));
        let cases = [
            ("name = 'sensor-north-7'", true),
            ("name != 'sensor-north-7'", false),
            ("name contains 'north'", true),
            ("name startswith \"sensor\"", true),
            ("name ENDSWITH '-7'", true),
            ("name endswith 7", true),
            ("name > 'a'", true),
            ("name < 'a'", false),
        ];
        for (source, expected) in cases {
            let filter = CompiledFilter::compile(source).unwrap();
            assert_eq!(filter.matches(&doc), expected, "{}", source);
        }
    }

    #[test]
    fn test_null_equality() {
        let filter = CompiledFilter::compile("deleted = null").unwrap();
        assert!(filter.matches(&doc(json!({}))));
        assert!(filter.matches(&doc(json!({"deleted": null}))));
        assert!(!filter.matches(&doc(json!({"deleted": "yes"}))));
    }

    #[test]
    fn test_bool_words() {
        let filter = CompiledFilter::compile("active = true").unwrap();
        assert!(filter.matches(&doc(json!({"active": true}))));
        assert!(!filter.matches(&doc(json!({"active": false}))));
        assert!(CompiledFilter::compile("active > true").is_err());
    }

    #[test]
    fn test_unquoted_strings_rejected() {
        let err = CompiledFilter::compile("name = north").unwrap_err();
        assert!(matches!(err, CoreError::Compile { ref predicate, .. } if predicate == "name = north"));
    }

    #[test]
    fn test_null_with_ordering_rejected() {
        assert!(CompiledFilter::compile("id > null").is_err());
    }

    #[test]
    fn test_left_to_right_fold_without_precedence() {
        // (a or b) and c, not a or (b and c)
        let filter = CompiledFilter::compile("a = 1 or b = 1 and c = 1").unwrap();
        assert!(!filter.matches(&doc(json!({"a": 1, "b": 0, "c": 0}))));
        assert!(filter.matches(&doc(json!({"a": 1, "b": 0, "c": 1}))));
        assert!(filter.matches(&doc(json!({"a": 0, "b": 1, "c": 1}))));

        // (a and b) or c
        let filter = CompiledFilter::compile("a = 1 and b = 1 or c = 1").unwrap();
        assert!(filter.matches(&doc(json!({"a": 0, "b": 0, "c": 1}))));
        assert!(!filter.matches(&doc(json!({"a": 1, "b": 0, "c": 0}))));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = CompiledFilter::compile("").unwrap();
        assert_eq!(filter.predicate_count(), 0);
        assert!(filter.matches(&doc(json!({"anything": 1}))));
    }

    #[test]
    fn test_nested_properties() {
        let filter = CompiledFilter::compile("order.total > 100").unwrap();
        assert!(filter.matches(&doc(json!({"order": {"total": 150}}))));
        assert!(!filter.matches(&doc(json!({"order": {"total": 50}}))));
    }
}
