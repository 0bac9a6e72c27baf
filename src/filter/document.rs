//! Semi-structured document model used for message filtering.

use std::collections::BTreeMap;

/// A JSON-like value that filter predicates are evaluated against.
#[derive(Clone, Debug, PartialEq)]
pub enum Document {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<Document>),
    Object(BTreeMap<String, Document>),
}

impl Document {
    /// Parse a message body. Only JSON objects count as structured bodies.
    pub fn parse_object(body: &str) -> Option<Document> {
        match serde_json::from_str::<serde_json::Value>(body) {
            Ok(value @ serde_json::Value::Object(_)) => Some(Document::from(value)),
            _ => None,
        }
    }

    /// Look up a property. An exact key wins; otherwise dots walk nested objects.
    pub fn lookup(&self, path: &str) -> Option<&Document> {
        let Document::Object(map) = self else {
            return None;
        };
        if let Some(value) = map.get(path) {
            return Some(value);
        }
        if !path.contains('.') {
            return None;
        }

        let mut current = self;
        for segment in path.split('.') {
            match current {
                Document::Object(map) => current = map.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Document::Null)
    }

    /// Text form used by comparisons. `None` for null.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Document::Null => None,
            Document::Bool(b) => Some(b.to_string()),
            Document::Integer(i) => Some(i.to_string()),
            Document::Float(f) => Some(format_float(*f)),
            Document::String(s) => Some(s.clone()),
            Document::Array(_) | Document::Object(_) => Some(self.to_json().to_string()),
        }
    }

    /// Convert back to a `serde_json` value.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Document::Null => Value::Null,
            Document::Bool(b) => Value::Bool(*b),
            Document::Integer(i) => Value::from(*i),
            Document::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Document::String(s) => Value::String(s.clone()),
            Document::Array(items) => Value::Array(items.iter().map(Document::to_json).collect()),
            Document::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

fn format_float(f: f64) -> String {
    serde_json::Number::from_f64(f)
        .map(|n| n.to_string())
        .unwrap_or_else(|| f.to_string())
}

impl From<serde_json::Value> for Document {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Document::Null,
            Value::Bool(b) => Document::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Document::Integer(i),
                None => Document::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Document::String(s),
            Value::Array(items) => Document::Array(items.into_iter().map(Document::from).collect()),
            Value::Object(map) => Document::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Document::from(v)))
                    .collect(),
            ),
        }
    }
}
