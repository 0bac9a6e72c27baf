//! A hosted observable/observer instance.
//!
//! [`Endpoint`] ties together the instance's identity, its subscription
//! tables, the registry and mailbox clients, the dispatcher and the local
//! event hub. It plays both roles at once: it can publish on topics and
//! subscribe to other observables.
//!
//! Outbound operations are the methods below; inbound requests from peers are
//! served through its [`RequestHandler`](crate::transport::RequestHandler)
//! impl.

mod inbound;

use crate::config::CoreConfig;
use crate::dispatch::{select_targets, DeliveryReport, Dispatcher, FirstInGroup, Notice, RelaySelector};
use crate::error::{CoreError, Result, TargetFailure};
use crate::events::EventHub;
use crate::filter::FilterCache;
use crate::mailbox::MailboxClient;
use crate::partition::PartitionResolver;
use crate::registry::RegistryClient;
use crate::retry::RetryPolicy;
use crate::store::TransactionalStore;
use crate::subscriptions::{ObservedTopic, SubscriptionStore};
use crate::transport::{InstanceAddressing, RemoteHandle, Transport};
use crate::types::{validate_topic, EntityId, Message};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

struct Inner {
    addressing: Arc<dyn InstanceAddressing>,
    /// Resolved once, then fixed for the instance lifetime.
    identity: OnceCell<EntityId>,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    subscriptions: SubscriptionStore,
    registry: RegistryClient,
    mailbox: MailboxClient,
    dispatcher: Dispatcher,
    events: EventHub,
}

/// Cheap-to-clone handle to one hosted instance.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Endpoint {
    /// Endpoint that picks the first member of each node group as relay.
    pub fn new(
        addressing: Arc<dyn InstanceAddressing>,
        store: Arc<dyn TransactionalStore>,
        config: &CoreConfig,
    ) -> Result<Self> {
        Self::with_relay_selector(addressing, store, config, Arc::new(FirstInGroup))
    }

    /// Endpoint choosing relays with `selector` instead of the first in each group.
    pub fn with_relay_selector(
        addressing: Arc<dyn InstanceAddressing>,
        store: Arc<dyn TransactionalStore>,
        config: &CoreConfig,
        selector: Arc<dyn RelaySelector>,
    ) -> Result<Self> {
        config.validate()?;
        let resolver = PartitionResolver::new(config.default_partition_count)?;
        let retry = RetryPolicy::from_config(config);
        let transport = addressing.transport();
        let mailbox = MailboxClient::new(resolver, Arc::clone(&transport), retry);

        let inner = Inner {
            identity: OnceCell::new(),
            subscriptions: SubscriptionStore::new(
                store,
                Arc::new(FilterCache::new(config.filter_cache_size)),
                retry,
            ),
            registry: RegistryClient::new(resolver, Arc::clone(&transport), retry),
            dispatcher: Dispatcher::new(Arc::clone(&transport), mailbox.clone(), retry, selector),
            mailbox,
            events: EventHub::new(config.event_buffer_size),
            transport,
            retry,
            addressing,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Local events raised by this endpoint.
    pub fn events(&self) -> &EventHub {
        &self.inner.events
    }

    /// Identity of this instance, retried while the host is still activating
    /// it. Fails with [`CoreError::Timeout`] once retries run out.
    pub async fn get_entity_id(&self) -> Result<EntityId> {
        let inner = &self.inner;
        inner
            .identity
            .get_or_try_init(|| async move {
                inner
                    .retry
                    .run("get_entity_id", move || inner.addressing.identity())
                    .await
                    .map_err(|e| match e {
                        CoreError::TimeoutExhausted { attempts, last, .. } => CoreError::Timeout(
                            format!("entity id unavailable after {} attempts: {}", attempts, last),
                        ),
                        other => other,
                    })
            })
            .await
            .cloned()
    }

    fn remote(&self, target: &EntityId) -> RemoteHandle {
        RemoteHandle::new(
            target.clone(),
            Arc::clone(&self.inner.transport),
            self.inner.retry,
        )
    }

    // --- Observable side ---

    /// Publish on `topic`: register in the directory and create the local
    /// observer table. Fails with [`CoreError::AlreadyRegistered`] if this
    /// endpoint already publishes on `topic`.
    pub async fn register_observable(&self, topic: &str) -> Result<()> {
        validate_topic(topic)?;
        let id = self.get_entity_id().await?;
        if self.inner.subscriptions.is_observable(topic).await? {
            return Err(CoreError::AlreadyRegistered {
                topic: topic.to_string(),
            });
        }

        self.inner.registry.register_observable(topic, &id).await?;
        self.inner.subscriptions.create_topic(topic).await?;
        info!(topic = %topic, observable = %id, "registered as observable");
        Ok(())
    }

    /// Stop publishing on `topic`: leave the directory, tell every current
    /// observer, then drop the observer table.
    pub async fn unregister_observable(&self, topic: &str, use_proxy: bool) -> Result<DeliveryReport> {
        validate_topic(topic)?;
        let id = self.get_entity_id().await?;
        let observers = self.observer_table(topic).await?;

        self.inner.registry.unregister_observable(topic, &id).await?;

        let targets = observers.into_iter().map(|s| s.observer).collect();
        let report = self
            .inner
            .dispatcher
            .dispatch(topic, &id, &Notice::Unregistered, targets, use_proxy)
            .await;

        self.inner.subscriptions.delete_topic(topic).await?;
        info!(topic = %topic, observable = %id, "unregistered as observable");
        report.into_result()
    }

    /// Unregister from every topic this endpoint publishes on, concurrently.
    pub async fn clear_all(&self, use_proxy: bool) -> Result<()> {
        let topics = self.inner.subscriptions.observable_topics().await?;
        let outcomes = join_all(
            topics
                .iter()
                .map(|topic| self.unregister_observable(topic, use_proxy)),
        )
        .await;

        collect_failures(topics.iter().map(String::as_str).zip(outcomes))
    }

    /// Deliver `message` to the observers of `topic` whose filters accept it.
    pub async fn notify_observers(
        &self,
        topic: &str,
        message: Message,
        use_proxy: bool,
    ) -> Result<DeliveryReport> {
        validate_topic(topic)?;
        let id = self.get_entity_id().await?;
        let observers = self.observer_table(topic).await?;

        let targets = select_targets(&observers, &message);
        debug!(topic = %topic, observers = observers.len(), selected = targets.len(), "notify");
        if targets.is_empty() {
            return Ok(DeliveryReport::default());
        }

        self.inner
            .dispatcher
            .dispatch(topic, &id, &Notice::Message(message), targets, use_proxy)
            .await
            .into_result()
    }

    async fn observer_table(&self, topic: &str) -> Result<Vec<crate::subscriptions::Subscription>> {
        self.inner
            .subscriptions
            .observers(topic)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("not registered as observable for topic {}", topic)))
    }

    // --- Observer side ---

    /// Subscribe to `observable` on `topic`. An empty `filters` list receives
    /// every message; otherwise a message is received if any filter accepts it.
    pub async fn register_observer(
        &self,
        topic: &str,
        filters: Vec<String>,
        observable: &EntityId,
    ) -> Result<()> {
        validate_topic(topic)?;
        let id = self.get_entity_id().await?;
        self.remote(observable)
            .register_observer(topic, filters.clone(), id)
            .await?;
        self.inner
            .subscriptions
            .add_observed(topic, observable, filters)
            .await
    }

    /// Unsubscribe from `topic` on `observable` and forget the mirror entry.
    pub async fn unregister_observer(&self, topic: &str, observable: &EntityId) -> Result<()> {
        validate_topic(topic)?;
        let id = self.get_entity_id().await?;
        self.remote(observable).unregister_observer(topic, id).await?;
        self.inner
            .subscriptions
            .remove_observed(topic, observable)
            .await?;
        Ok(())
    }

    /// Unsubscribe from every observable, concurrently.
    pub async fn clear_subscriptions(&self) -> Result<()> {
        let observed = self.inner.subscriptions.observed().await?;
        let outcomes = join_all(
            observed
                .iter()
                .map(|o| self.unregister_observer(&o.topic, &o.observable)),
        )
        .await;

        collect_failures(
            observed
                .iter()
                .map(|o| o.observable.entity_uri())
                .zip(outcomes),
        )
    }

    /// Observables this endpoint is subscribed to.
    pub async fn subscriptions(&self) -> Result<Vec<ObservedTopic>> {
        self.inner.subscriptions.observed().await
    }

    /// Drain this endpoint's mailbox.
    pub async fn read_mailbox(&self) -> Result<Vec<Message>> {
        let id = self.get_entity_id().await?;
        self.inner.mailbox.read(id.entity_uri()).await
    }

    // --- Directory ---

    /// Look up observables of `topic` in the registry.
    pub async fn query_observables(
        &self,
        topic: &str,
        filter: Option<&str>,
    ) -> Result<Option<Vec<EntityId>>> {
        self.inner.registry.query_observables(topic, filter).await
    }
}

/// Fold labelled outcomes into one `CoreError::Delivery`, flattening nested
/// delivery aggregates.
fn collect_failures<'a, T>(outcomes: impl Iterator<Item = (&'a str, Result<T>)>) -> Result<()> {
    let mut failures = Vec::new();
    for (label, outcome) in outcomes {
        match outcome {
            Ok(_) => {}
            Err(CoreError::Delivery(nested)) => failures.extend(nested),
            Err(e) => failures.push(TargetFailure::new(label, e)),
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(CoreError::Delivery(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::LocalTransport;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Identity that is unavailable for the first `pending` lookups.
    struct Activating {
        pending: Mutex<u32>,
        lookups: Mutex<u32>,
        transport: Arc<dyn Transport>,
    }

    #[async_trait]
    impl InstanceAddressing for Activating {
        async fn identity(&self) -> Result<EntityId> {
            *self.lookups.lock() += 1;
            let mut pending = self.pending.lock();
            if *pending > 0 {
                *pending -= 1;
                return Err(CoreError::Transient("still activating".into()));
            }
            EntityId::actor("fabric:/app/Watchers", "w1")
        }

        fn transport(&self) -> Arc<dyn Transport> {
            Arc::clone(&self.transport)
        }
    }

    fn endpoint(pending: u32, attempts: u32) -> (Endpoint, Arc<Activating>) {
        let addressing = Arc::new(Activating {
            pending: Mutex::new(pending),
            lookups: Mutex::new(0),
            transport: Arc::new(LocalTransport::new()),
        });
        let config = CoreConfig {
            max_retry_count: attempts,
            backoff_delay: Duration::ZERO,
            ..CoreConfig::default()
        };
        let endpoint = Endpoint::new(
            Arc::clone(&addressing) as Arc<dyn InstanceAddressing>,
            Arc::new(MemoryStore::new()),
            &config,
        )
        .unwrap();
        (endpoint, addressing)
    }

    #[tokio::test]
    async fn test_entity_id_retried_then_cached() {
        let (endpoint, addressing) = endpoint(2, 5);
        let id = endpoint.get_entity_id().await.unwrap();
        assert_eq!(id.entity_uri(), "fabric:/app/Watchers/w1");

        endpoint.get_entity_id().await.unwrap();
        assert_eq!(*addressing.lookups.lock(), 3);
    }

    #[tokio::test]
    async fn test_entity_id_timeout() {
        let (endpoint, _) = endpoint(10, 3);
        assert!(matches!(
            endpoint.get_entity_id().await,
            Err(CoreError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_notify_unknown_topic_not_found() {
        let (endpoint, _) = endpoint(0, 1);
        assert!(matches!(
            endpoint
                .notify_observers("prices", Message::new("x"), false)
                .await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_collect_failures_flattens() {
        let outcomes: Vec<(&str, Result<()>)> = vec![
            ("a", Ok(())),
            (
                "b",
                Err(CoreError::Delivery(vec![TargetFailure::new("x", "down")])),
            ),
            ("c", Err(CoreError::Remote("gone".into()))),
        ];
        match collect_failures(outcomes.into_iter()) {
            Err(CoreError::Delivery(failures)) => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].target, "x");
                assert_eq!(failures[1].target, "c");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
