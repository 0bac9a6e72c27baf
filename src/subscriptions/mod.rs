//! Subscription tables held by each endpoint.
//!
//! As an observable, an endpoint keeps one observer table per topic it
//! publishes on: `observer URI → {observer, filters}`. As an observer, it
//! keeps a mirror of the observables it subscribed to, used to unsubscribe
//! everywhere at once.
//!
//! Filters are compiled when an observer registers; a malformed filter is
//! rejected at that point and never reaches notify.

mod store;
mod types;

pub use store::SubscriptionStore;
pub use types::{ObservedTopic, Subscription};
