//! Persistent subscription tables of one endpoint.

use super::types::{ObservedTopic, ObserverRecord, Subscription};
use crate::error::{CoreError, Result};
use crate::filter::{FilterCache, FilterSet};
use crate::retry::RetryPolicy;
use crate::store::{self, compound_key, key_prefix, TransactionalStore};
use crate::types::{validate_topic, EntityId};
use std::sync::Arc;
use tracing::{debug, info};

/// Topics this endpoint is observable for. Key: topic.
const OBSERVABLE_TOPICS: &str = "observable_topics";
/// Observers per topic. Key: `topic, observer URI`.
const OBSERVERS: &str = "observers";
/// Observables this endpoint subscribed to. Key: `topic, observable URI`.
const OBSERVED: &str = "observed";

/// Observable-side observer tables and the observer-side mirror table.
///
/// Every observer entry is its own key, so registrations of different
/// observers on one topic commit independently.
pub struct SubscriptionStore {
    store: Arc<dyn TransactionalStore>,
    cache: Arc<FilterCache>,
    retry: RetryPolicy,
}

impl SubscriptionStore {
    pub fn new(store: Arc<dyn TransactionalStore>, cache: Arc<FilterCache>, retry: RetryPolicy) -> Self {
        Self {
            store,
            cache,
            retry,
        }
    }

    // --- Observable side ---

    /// Create the empty observer table for `topic`.
    pub async fn create_topic(&self, topic: &str) -> Result<()> {
        validate_topic(topic)?;
        self.retry
            .run("create_topic", move || async move {
                let mut tx = self.store.begin().await?;
                if tx.get(OBSERVABLE_TOPICS, topic).await?.is_some() {
                    return Err(CoreError::AlreadyRegistered {
                        topic: topic.to_string(),
                    });
                }
                tx.put(OBSERVABLE_TOPICS, topic, Vec::new()).await?;
                tx.commit().await
            })
            .await
    }

    /// Drop the observer table for `topic` with every entry in it. Returns the
    /// number of observers removed.
    pub async fn delete_topic(&self, topic: &str) -> Result<usize> {
        validate_topic(topic)?;
        let removed = self
            .retry
            .run("delete_topic", move || async move {
                let mut tx = self.store.begin().await?;
                let entries = tx.scan_prefix(OBSERVERS, &key_prefix(topic)).await?;
                for (key, _) in &entries {
                    tx.delete(OBSERVERS, key).await?;
                }
                tx.delete(OBSERVABLE_TOPICS, topic).await?;
                tx.commit().await?;
                Ok(entries.len())
            })
            .await?;
        debug!(topic = %topic, removed, "observer table deleted");
        Ok(removed)
    }

    /// Whether this endpoint is observable for `topic`.
    pub async fn is_observable(&self, topic: &str) -> Result<bool> {
        validate_topic(topic)?;
        let mut tx = self.store.begin().await?;
        Ok(tx.get(OBSERVABLE_TOPICS, topic).await?.is_some())
    }

    /// Every topic this endpoint is observable for, in key order.
    pub async fn observable_topics(&self) -> Result<Vec<String>> {
        let mut tx = self.store.begin().await?;
        Ok(tx
            .scan_prefix(OBSERVABLE_TOPICS, "")
            .await?
            .into_iter()
            .map(|(topic, _)| topic)
            .collect())
    }

    /// Insert or replace the entry of `observer` under `topic`.
    ///
    /// Filters are compiled first, so a malformed filter changes nothing.
    /// Fails with [`CoreError::NotFound`] if this endpoint is not observable
    /// for `topic`.
    pub async fn add_observer(
        &self,
        topic: &str,
        observer: &EntityId,
        filters: Vec<String>,
    ) -> Result<Subscription> {
        validate_topic(topic)?;
        let compiled = FilterSet::compile_cached(&filters, &self.cache)?;
        let value = &store::encode(&ObserverRecord {
            observer: observer.clone(),
            filters: filters.clone(),
        })?;

        self.retry
            .run("add_observer", move || async move {
                let mut tx = self.store.begin().await?;
                if tx.get(OBSERVABLE_TOPICS, topic).await?.is_none() {
                    return Err(not_observable(topic));
                }
                tx.put(
                    OBSERVERS,
                    &compound_key(&[topic, observer.entity_uri()]),
                    value.clone(),
                )
                .await?;
                tx.commit().await
            })
            .await?;

        info!(topic = %topic, observer = %observer, filters = filters.len(), "observer registered");
        Ok(Subscription {
            observer: observer.clone(),
            raw_filters: filters,
            filters: compiled,
        })
    }

    /// Remove the entry of `observer` under `topic`. Returns whether it existed.
    pub async fn remove_observer(&self, topic: &str, observer: &EntityId) -> Result<bool> {
        validate_topic(topic)?;
        let removed = self
            .retry
            .run("remove_observer", move || async move {
                let mut tx = self.store.begin().await?;
                let removed = tx
                    .delete(OBSERVERS, &compound_key(&[topic, observer.entity_uri()]))
                    .await?;
                tx.commit().await?;
                Ok(removed)
            })
            .await?;
        if removed {
            info!(topic = %topic, observer = %observer, "observer unregistered");
        }
        Ok(removed)
    }

    /// Observers of `topic`, or `None` if this endpoint is not observable for it.
    pub async fn observers(&self, topic: &str) -> Result<Option<Vec<Subscription>>> {
        validate_topic(topic)?;
        let mut tx = self.store.begin().await?;
        if tx.get(OBSERVABLE_TOPICS, topic).await?.is_none() {
            return Ok(None);
        }

        let mut subscriptions = Vec::new();
        for (_, bytes) in tx.scan_prefix(OBSERVERS, &key_prefix(topic)).await? {
            let record: ObserverRecord = store::decode(&bytes)?;
            subscriptions.push(Subscription {
                filters: FilterSet::compile_cached(&record.filters, &self.cache)?,
                observer: record.observer,
                raw_filters: record.filters,
            });
        }
        Ok(Some(subscriptions))
    }

    // --- Observer side ---

    /// Remember that this endpoint subscribed to `observable` on `topic`.
    pub async fn add_observed(
        &self,
        topic: &str,
        observable: &EntityId,
        filters: Vec<String>,
    ) -> Result<()> {
        validate_topic(topic)?;
        let value = &store::encode(&ObservedTopic {
            topic: topic.to_string(),
            observable: observable.clone(),
            filters,
        })?;
        self.retry
            .run("add_observed", move || async move {
                let mut tx = self.store.begin().await?;
                tx.put(
                    OBSERVED,
                    &compound_key(&[topic, observable.entity_uri()]),
                    value.clone(),
                )
                .await?;
                tx.commit().await
            })
            .await
    }

    /// Forget the subscription to `observable` under `topic`. Returns whether it existed.
    pub async fn remove_observed(&self, topic: &str, observable: &EntityId) -> Result<bool> {
        validate_topic(topic)?;
        self.retry
            .run("remove_observed", move || async move {
                let mut tx = self.store.begin().await?;
                let removed = tx
                    .delete(OBSERVED, &compound_key(&[topic, observable.entity_uri()]))
                    .await?;
                tx.commit().await?;
                Ok(removed)
            })
            .await
    }

    /// Every observable this endpoint subscribed to, ordered by topic.
    pub async fn observed(&self) -> Result<Vec<ObservedTopic>> {
        self.scan_observed("").await
    }

    /// Mirror entries under `topic`.
    pub async fn observed_for(&self, topic: &str) -> Result<Vec<ObservedTopic>> {
        validate_topic(topic)?;
        self.scan_observed(&key_prefix(topic)).await
    }

    async fn scan_observed(&self, prefix: &str) -> Result<Vec<ObservedTopic>> {
        let mut tx = self.store.begin().await?;
        tx.scan_prefix(OBSERVED, prefix)
            .await?
            .into_iter()
            .map(|(_, bytes)| store::decode(&bytes))
            .collect()
    }
}

fn not_observable(topic: &str) -> CoreError {
    CoreError::NotFound(format!("not registered as observable for topic {}", topic))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Document;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn subscriptions() -> SubscriptionStore {
        SubscriptionStore::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FilterCache::new(16)),
            RetryPolicy::new(5, Duration::ZERO),
        )
    }

    fn subscriptions_over(store: &MemoryStore) -> SubscriptionStore {
        SubscriptionStore::new(
            Arc::new(store.clone()),
            Arc::new(FilterCache::new(16)),
            RetryPolicy::new(5, Duration::ZERO),
        )
    }

    fn watcher(key: &str) -> EntityId {
        EntityId::actor("fabric:/app/Watchers", key).unwrap()
    }

    #[tokio::test]
    async fn test_create_topic_twice_fails() {
        let subs = subscriptions();
        subs.create_topic("prices").await.unwrap();
        assert!(matches!(
            subs.create_topic("prices").await,
            Err(CoreError::AlreadyRegistered { .. })
        ));
        assert_eq!(subs.observable_topics().await.unwrap(), vec!["prices"]);
    }

    #[tokio::test]
    async fn test_observer_added_during_teardown_does_not_survive() {
        let store = MemoryStore::new();
        let subs = subscriptions_over(&store);
        subs.create_topic("prices").await.unwrap();
        subs.add_observer("prices", &watcher("a"), vec![]).await.unwrap();

        // Teardown transaction that has scanned the table but not committed.
        let mut teardown = store.begin().await.unwrap();
        let entries = teardown
            .scan_prefix(OBSERVERS, &key_prefix("prices"))
            .await
            .unwrap();
        for (key, _) in &entries {
            teardown.delete(OBSERVERS, key).await.unwrap();
        }
        teardown.delete(OBSERVABLE_TOPICS, "prices").await.unwrap();

        subs.add_observer("prices", &watcher("late"), vec![])
            .await
            .unwrap();
        assert!(teardown.commit().await.unwrap_err().is_transient());

        assert_eq!(subs.delete_topic("prices").await.unwrap(), 2);
        subs.create_topic("prices").await.unwrap();
        assert!(subs.observers("prices").await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_observer_after_teardown_is_not_found() {
        let store = MemoryStore::new();
        let subs = subscriptions_over(&store);
        subs.create_topic("prices").await.unwrap();

        // Registration transaction that has seen the topic but not committed.
        let mut late = store.begin().await.unwrap();
        assert!(late.get(OBSERVABLE_TOPICS, "prices").await.unwrap().is_some());
        late.put(
            OBSERVERS,
            &compound_key(&["prices", watcher("late").entity_uri()]),
            Vec::new(),
        )
        .await
        .unwrap();

        subs.delete_topic("prices").await.unwrap();
        assert!(late.commit().await.unwrap_err().is_transient());
        assert!(subs.observers("prices").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_observer_requires_topic() {
        let subs = subscriptions();
        let err = subs
            .add_observer("prices", &watcher("a"), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_bad_filter_leaves_table_unchanged() {
        let subs = subscriptions();
        subs.create_topic("prices").await.unwrap();
        let err = subs
            .add_observer("prices", &watcher("a"), vec!["and id = 1".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Compile { .. }));
        assert!(subs.observers("prices").await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reregistration_replaces_filters() {
        let subs = subscriptions();
        subs.create_topic("prices").await.unwrap();
        subs.add_observer("prices", &watcher("a"), vec!["id = 10".into()])
            .await
            .unwrap();
        subs.add_observer("prices", &watcher("a"), vec!["id = 20".into()])
            .await
            .unwrap();

        let observers = subs.observers("prices").await.unwrap().unwrap();
        assert_eq!(observers.len(), 1);
        assert_eq!(observers[0].raw_filters, vec!["id = 20"]);
        assert!(observers[0].accepts(&Document::from(json!({"id": 20}))));
        assert!(!observers[0].accepts(&Document::from(json!({"id": 10}))));
    }

    #[tokio::test]
    async fn test_remove_observer_is_noop_when_absent() {
        let subs = subscriptions();
        subs.create_topic("prices").await.unwrap();
        subs.add_observer("prices", &watcher("a"), vec![]).await.unwrap();

        assert!(subs.remove_observer("prices", &watcher("a")).await.unwrap());
        assert!(!subs.remove_observer("prices", &watcher("a")).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_topic_removes_everything() {
        let subs = subscriptions();
        subs.create_topic("prices").await.unwrap();
        subs.create_topic("weather").await.unwrap();
        subs.add_observer("prices", &watcher("a"), vec![]).await.unwrap();
        subs.add_observer("prices", &watcher("b"), vec![]).await.unwrap();
        subs.add_observer("weather", &watcher("a"), vec![]).await.unwrap();

        assert_eq!(subs.delete_topic("prices").await.unwrap(), 2);
        assert!(subs.observers("prices").await.unwrap().is_none());
        assert_eq!(subs.observers("weather").await.unwrap().unwrap().len(), 1);
        assert_eq!(subs.observable_topics().await.unwrap(), vec!["weather"]);
    }

    #[tokio::test]
    async fn test_observed_mirror() {
        let subs = subscriptions();
        let feed = EntityId::service("fabric:/app/Feed", Some(1)).unwrap();
        subs.add_observed("prices", &feed, vec!["id = 1".into()])
            .await
            .unwrap();
        subs.add_observed("weather", &feed, vec![]).await.unwrap();

        assert_eq!(subs.observed().await.unwrap().len(), 2);
        let prices = subs.observed_for("prices").await.unwrap();
        assert_eq!(prices.len(), 1);
        assert_eq!(prices[0].observable, feed);

        assert!(subs.remove_observed("prices", &feed).await.unwrap());
        assert!(subs.observed_for("prices").await.unwrap().is_empty());
    }
}
