//! Typed-mode filters over records with a fixed set of named fields.
//!
//! Fields are registered on a [`Schema`] with an accessor closure, so a filter
//! resolves its properties and converts its literals once at compile time.

use super::compile::{chain, ordering_matches, text_matches, PredicateFn};
use super::parser::{self, CompareOp, Literal, Predicate};
use crate::error::{CoreError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Declared type of a schema field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    Int,
    Float,
    Text,
    DateTime,
}

impl FieldType {
    /// What a `null` literal compares against for this type.
    fn null_value(self) -> FieldValue {
        match self {
            FieldType::Bool => FieldValue::Bool(false),
            FieldType::Int => FieldValue::Int(0),
            FieldType::Float => FieldValue::Float(0.0),
            FieldType::Text | FieldType::DateTime => FieldValue::Null,
        }
    }
}

/// A field value produced by an accessor.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    DateTime(DateTime<Utc>),
}

impl FieldValue {
    fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Null, FieldValue::Null) => Some(Ordering::Equal),
            (FieldValue::Bool(a), FieldValue::Bool(b)) => Some(a.cmp(b)),
            (FieldValue::Int(a), FieldValue::Int(b)) => Some(a.cmp(b)),
            (FieldValue::Float(a), FieldValue::Float(b)) => a.partial_cmp(b),
            (FieldValue::Int(a), FieldValue::Float(b)) => (*a as f64).partial_cmp(b),
            (FieldValue::Float(a), FieldValue::Int(b)) => a.partial_cmp(&(*b as f64)),
            (FieldValue::Text(a), FieldValue::Text(b)) => Some(a.as_str().cmp(b.as_str())),
            (FieldValue::DateTime(a), FieldValue::DateTime(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        FieldValue::DateTime(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(FieldValue::Null, Into::into)
    }
}

type Accessor<T> = Arc<dyn Fn(&T) -> FieldValue + Send + Sync>;

struct Field<T> {
    ty: FieldType,
    accessor: Accessor<T>,
}

/// Named, typed fields of a record type.
pub struct Schema<T> {
    fields: HashMap<String, Field<T>>,
}

impl<T: 'static> Schema<T> {
    /// Schema with no fields.
    pub fn new() -> Self {
        Self {
            fields: HashMap::new(),
        }
    }

    /// Register a field with its accessor.
    pub fn field<F>(mut self, name: impl Into<String>, ty: FieldType, accessor: F) -> Self
    where
        F: Fn(&T) -> FieldValue + Send + Sync + 'static,
    {
        self.fields.insert(
            name.into(),
            Field {
                ty,
                accessor: Arc::new(accessor),
            },
        );
        self
    }

    /// Type of the field called `name`.
    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields.get(name).map(|f| f.ty)
    }

    /// Compile a filter expression against this schema.
    pub fn compile(&self, source: &str) -> Result<TypedFilter<T>> {
        let predicates = parser::parse(source)?;
        let compiled = predicates
            .iter()
            .map(|p| Ok((self.compile_predicate(p)?, p.next)))
            .collect::<Result<Vec<_>>>()?;

        Ok(TypedFilter {
            predicate: chain(compiled),
        })
    }

    fn compile_predicate(&self, p: &Predicate) -> Result<PredicateFn<T>> {
        let field = self
            .fields
            .get(&p.property)
            .ok_or_else(|| CoreError::compile(&p.text, format!("unknown property `{}`", p.property)))?;

        check_operator(field.ty, p)?;
        let literal = convert_literal(field.ty, p)?;
        let accessor = Arc::clone(&field.accessor);
        let op = p.op;

        if op.is_text() {
            let FieldValue::Text(expected) = literal else {
                return Err(CoreError::compile(&p.text, "text operator needs a text value"));
            };
            return Ok(Arc::new(move |record: &T| match accessor(record) {
                FieldValue::Text(value) => text_matches(op, &value, &expected),
                _ => false,
            }));
        }

        Ok(Arc::new(move |record: &T| {
            match (op, accessor(record).compare(&literal)) {
                // null against a value is simply unequal
                (CompareOp::Ne, None) => true,
                (_, ordering) => ordering_matches(op, ordering),
            }
        }))
    }
}

impl<T: 'static> Default for Schema<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A filter compiled against a [`Schema`].
pub struct TypedFilter<T> {
    predicate: PredicateFn<T>,
}

impl<T> TypedFilter<T> {
    /// Evaluate the compiled chain against `record`.
    pub fn matches(&self, record: &T) -> bool {
        (self.predicate)(record)
    }
}

impl<T> Clone for TypedFilter<T> {
    fn clone(&self) -> Self {
        Self {
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl<T> fmt::Debug for TypedFilter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TypedFilter")
    }
}

fn check_operator(ty: FieldType, p: &Predicate) -> Result<()> {
    let supported = match ty {
        FieldType::Bool => matches!(p.op, CompareOp::Eq | CompareOp::Ne),
        FieldType::Text => true,
        FieldType::Int | FieldType::Float | FieldType::DateTime => !p.op.is_text(),
    };
    if supported {
        Ok(())
    } else {
        Err(CoreError::compile(
            &p.text,
            format!("operator `{}` is not supported for {:?} fields", p.op, ty),
        ))
    }
}

fn convert_literal(ty: FieldType, p: &Predicate) -> Result<FieldValue> {
    if p.literal == Literal::Null {
        return Ok(ty.null_value());
    }

    let text = p.literal.text().trim();
    let fail = || {
        CoreError::compile(
            &p.text,
            format!("cannot convert `{}` to {:?}", text, ty),
        )
    };

    match ty {
        FieldType::Bool => {
            if text.eq_ignore_ascii_case("true") {
                Ok(FieldValue::Bool(true))
            } else if text.eq_ignore_ascii_case("false") {
                Ok(FieldValue::Bool(false))
            } else {
                Err(fail())
            }
        }
        FieldType::Int => text.parse::<i64>().map(FieldValue::Int).map_err(|_| fail()),
        FieldType::Float => text
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(FieldValue::Float)
            .ok_or_else(fail),
        FieldType::Text => Ok(FieldValue::Text(p.literal.text().to_string())),
        FieldType::DateTime => parse_datetime(text).map(FieldValue::DateTime).ok_or_else(fail),
    }
}

/// Parse a datetime literal, unwrapping `#...#` delimiters.
fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    let text = text
        .strip_prefix('#')
        .and_then(|t| t.strip_suffix('#'))
        .unwrap_or(text)
        .trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Reading {
        id: i64,
        value: f64,
        label: Option<String>,
        active: bool,
        taken: DateTime<Utc>,
    }

    fn schema() -> Schema<Reading> {
        Schema::new()
            .field("id", FieldType::Int, |r: &Reading| r.id.into())
            .field("value", FieldType::Float, |r: &Reading| r.value.into())
            .field("label", FieldType::Text, |r: &Reading| r.label.clone().into())
            .field("active", FieldType::Bool, |r: &Reading| r.active.into())
            .field("taken", FieldType::DateTime, |r: &Reading| r.taken.into())
    }

    fn reading(id: i64) -> Reading {
        Reading {
            id,
            value: 52.0,
            label: Some("north-gate".into()),
            active: true,
            taken: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_typed_round_trip() {
        let filter = schema().compile("id = 10 and value >= 50").unwrap();
        assert!(filter.matches(&reading(10)));
        assert!(!filter.matches(&reading(20)));
    }

    #[test]
    fn test_null_compares_to_field_default() {
        let schema = schema();
        let label_null = schema.compile("label = null").unwrap();
        let label_set = schema.compile("label != null").unwrap();
        let mut r = reading(1);
        assert!(!label_null.matches(&r));
        assert!(label_set.matches(&r));
        r.label = None;
        assert!(label_null.matches(&r));
        assert!(!label_set.matches(&r));

        let id_default = schema.compile("id = null").unwrap();
        assert!(id_default.matches(&reading(0)));
        assert!(!id_default.matches(&reading(3)));
    }

    #[test]
    fn test_text_and_bool_fields() {
        let schema = schema();
        assert!(schema.compile("label startswith 'north'").unwrap().matches(&reading(1)));
        assert!(schema.compile("label = north-gate").unwrap().matches(&reading(1)));
        assert!(schema.compile("active = TRUE").unwrap().matches(&reading(1)));
        assert!(!schema.compile("active != true").unwrap().matches(&reading(1)));
    }

    #[test]
    fn test_datetime_literals() {
        let schema = schema();
        let r = reading(1);
        assert!(schema.compile("taken > #2024-01-01#").unwrap().matches(&r));
        assert!(schema.compile("taken = '2024-03-01 12:00:00'").unwrap().matches(&r));
        assert!(schema.compile("taken <= \"2024-03-01T12:00:00Z\"").unwrap().matches(&r));
        assert!(!schema.compile("taken < 2024-02-01").unwrap().matches(&r));
    }

    #[test]
    fn test_compile_errors() {
        let schema = schema();
        let err = schema.compile("missing = 1").unwrap_err();
        assert!(matches!(err, CoreError::Compile { ref reason, .. } if reason.contains("unknown property")));

        assert!(matches!(schema.compile("id = 'ten'"), Err(CoreError::Compile { .. })));
        assert!(matches!(schema.compile("id contains 1"), Err(CoreError::Compile { .. })));
        assert!(matches!(schema.compile("active > false"), Err(CoreError::Compile { .. })));
        assert!(matches!(schema.compile("taken = 'yesterday'"), Err(CoreError::Compile { .. })));
    }

    #[test]
    fn test_empty_filter_matches() {
        assert!(schema().compile("").unwrap().matches(&reading(99)));
    }
}
