//! Filter expression compiler.
//!
//! Filters are small boolean predicate chains such as
//! `id != null and value != null and id = 10`. They compile once, at
//! registration time, into pure functions that are safe to evaluate
//! repeatedly and concurrently:
//! - document mode ([`CompiledFilter`]) evaluates against message bodies
//! - typed mode ([`Schema`] / [`TypedFilter`]) evaluates against records with
//!   named fields
//!
//! Predicates are folded strictly left to right; `and` does not bind tighter
//! than `or`.

mod cache;
mod compile;
mod document;
mod parser;
mod typed;

pub use cache::FilterCache;
pub use compile::{CompiledFilter, PredicateFn};
pub use document::Document;
pub use parser::{parse, CompareOp, Literal, LogicalOp, Predicate};
pub use typed::{FieldType, FieldValue, Schema, TypedFilter};

use crate::error::Result;
use std::sync::Arc;

/// The compiled filters of one subscription.
///
/// An empty set means "always deliver"; otherwise a document is delivered if
/// any one filter matches.
#[derive(Clone, Debug, Default)]
pub struct FilterSet {
    filters: Vec<Arc<CompiledFilter>>,
}

impl FilterSet {
    /// Compile every source, failing on the first malformed one.
    pub fn compile<S: AsRef<str>>(sources: &[S]) -> Result<Self> {
        let filters = sources
            .iter()
            .map(|s| CompiledFilter::compile(s.as_ref()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { filters })
    }

    /// Like [`FilterSet::compile`], reusing filters from `cache`.
    pub fn compile_cached<S: AsRef<str>>(sources: &[S], cache: &FilterCache) -> Result<Self> {
        let filters = sources
            .iter()
            .map(|s| cache.get_or_compile(s.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { filters })
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether at least one filter matches.
    pub fn matches_any(&self, document: &Document) -> bool {
        self.filters.iter().any(|f| f.matches(document))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_any_filter_matches() {
        let set = FilterSet::compile(&["id = 10", "id = 30"]).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.matches_any(&Document::from(json!({"id": 30}))));
        assert!(!set.matches_any(&Document::from(json!({"id": 20}))));
    }

    #[test]
    fn test_first_bad_filter_fails_set() {
        let err = FilterSet::compile(&["id = 10", "id ~ 3"]).unwrap_err();
        assert!(err.to_string().contains("id ~ 3"));
    }

    #[test]
    fn test_cached_compile_shares_filters() {
        let cache = FilterCache::new(8);
        FilterSet::compile_cached(&["id = 1"], &cache).unwrap();
        FilterSet::compile_cached(&["id = 1", "id = 2"], &cache).unwrap();
        assert_eq!(cache.len(), 2);
    }
}
