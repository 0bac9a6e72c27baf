//! Subscription records.

use crate::filter::{Document, FilterSet};
use crate::types::EntityId;
use serde::{Deserialize, Serialize};

/// An observer registered on an observable, with its compiled filters.
#[derive(Clone, Debug)]
pub struct Subscription {
    pub observer: EntityId,
    /// Filter sources as registered.
    pub raw_filters: Vec<String>,
    /// Compiled form of `raw_filters`; empty means "always deliver".
    pub filters: FilterSet,
}

impl Subscription {
    pub fn has_filters(&self) -> bool {
        !self.filters.is_empty()
    }

    /// Whether a filtered subscription accepts `document`. Subscriptions
    /// without filters never match here; they opt into unconditional delivery.
    pub fn accepts(&self, document: &Document) -> bool {
        self.has_filters() && self.filters.matches_any(document)
    }
}

/// Observer table entry as persisted by the observable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ObserverRecord {
    pub observer: EntityId,
    pub filters: Vec<String>,
}

/// Observer-side record of one observable this instance subscribed to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservedTopic {
    pub topic: String,
    pub observable: EntityId,
    pub filters: Vec<String>,
}
