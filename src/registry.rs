//! Partitioned topic directory: `topic → {observable EntityId}`.
//!
//! Each topic lives on the partition chosen by [`PartitionResolver`]. Inside a
//! partition every `(topic, entity)` pair is its own store key, so concurrent
//! registrations of different entities on one topic never overwrite each other.

use crate::error::{CoreError, Result};
use crate::partition::PartitionResolver;
use crate::retry::RetryPolicy;
use crate::store::{self, compound_key, key_prefix, TransactionalStore};
use crate::transport::{RemoteHandle, RequestHandler, Transport};
use crate::types::{validate_topic, EntityId};
use crate::wire::{Request, Response};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Service address of registry partitions.
pub const REGISTRY_SERVICE: &str = "observatory://registry";

const ENTRIES: &str = "registry";
const TOPICS: &str = "registry_topics";

/// Identity of registry partition `index`.
pub fn partition_id(index: u32) -> Result<EntityId> {
    EntityId::service(REGISTRY_SERVICE, Some(i64::from(index)))
}

/// One registry partition.
pub struct RegistryPartition {
    index: u32,
    store: Arc<dyn TransactionalStore>,
    retry: RetryPolicy,
}

impl RegistryPartition {
    /// Registry partition `index` persisting entries in `store`.
    pub fn new(index: u32, store: Arc<dyn TransactionalStore>, retry: RetryPolicy) -> Self {
        Self { index, store, retry }
    }

    /// 1-based index of this partition.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Add `id` under `topic`. Registering twice leaves one entry.
    pub async fn register(&self, topic: &str, id: &EntityId) -> Result<()> {
        validate_topic(topic)?;
        let value = &store::encode(id)?;
        self.retry
            .run("registry_register", move || async move {
                let mut tx = self.store.begin().await?;
                tx.put(TOPICS, topic, Vec::new()).await?;
                tx.put(ENTRIES, &compound_key(&[topic, id.entity_uri()]), value.clone())
                    .await?;
                tx.commit().await
            })
            .await?;
        info!(partition = self.index, topic = %topic, observable = %id, "observable registered");
        Ok(())
    }

    /// Remove `id` from `topic`. Absent entries are not an error.
    pub async fn unregister(&self, topic: &str, id: &EntityId) -> Result<()> {
        validate_topic(topic)?;
        let removed = self
            .retry
            .run("registry_unregister", move || async move {
                let mut tx = self.store.begin().await?;
                let removed = tx
                    .delete(ENTRIES, &compound_key(&[topic, id.entity_uri()]))
                    .await?;
                tx.commit().await?;
                Ok(removed)
            })
            .await?;
        if removed {
            info!(partition = self.index, topic = %topic, observable = %id, "observable unregistered");
        }
        Ok(())
    }

    /// Observables of `topic`, optionally only the one whose entity URI equals
    /// `filter`. `None` when the topic was never registered here.
    pub async fn query(&self, topic: &str, filter: Option<&str>) -> Result<Option<Vec<EntityId>>> {
        validate_topic(topic)?;
        self.retry
            .run("registry_query", move || async move {
                let mut tx = self.store.begin().await?;
                if tx.get(TOPICS, topic).await?.is_none() {
                    return Ok(None);
                }
                let mut found = Vec::new();
                for (key, bytes) in tx.scan_prefix(ENTRIES, &key_prefix(topic)).await? {
                    if filter.map_or(true, |uri| store::key_suffix(&key) == uri) {
                        found.push(store::decode::<EntityId>(&bytes)?);
                    }
                }
                Ok(Some(found))
            })
            .await
    }
}

#[async_trait]
impl RequestHandler for RegistryPartition {
    async fn handle(&self, request: Request) -> Result<Response> {
        match request {
            Request::RegisterObservableInDirectory { topic, id } => {
                self.register(&topic, &id).await?;
                Ok(Response::Ack)
            }
            Request::UnregisterObservableInDirectory { topic, id } => {
                self.unregister(&topic, &id).await?;
                Ok(Response::Ack)
            }
            Request::QueryObservables { topic, filter } => Ok(Response::Observables {
                observables: self.query(&topic, filter.as_deref()).await?,
            }),
            other => Err(CoreError::Remote(format!(
                "registry partition cannot handle {}",
                other.name()
            ))),
        }
    }
}

/// Client that routes each topic to its registry partition.
#[derive(Clone)]
pub struct RegistryClient {
    resolver: PartitionResolver,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl RegistryClient {
    /// Client resolving each topic to its registry partition.
    pub fn new(resolver: PartitionResolver, transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            resolver,
            transport,
            retry,
        }
    }

    fn handle_for(&self, topic: &str) -> Result<RemoteHandle> {
        validate_topic(topic)?;
        let index = self.resolver.resolve(topic);
        debug!(topic = %topic, partition = index, "routing to registry partition");
        Ok(RemoteHandle::new(
            partition_id(index)?,
            Arc::clone(&self.transport),
            self.retry,
        ))
    }

    /// Add `id` to the observables of `topic`. Idempotent.
    pub async fn register_observable(&self, topic: &str, id: &EntityId) -> Result<()> {
        self.handle_for(topic)?
            .call(Request::RegisterObservableInDirectory {
                topic: topic.to_string(),
                id: id.clone(),
            })
            .await?
            .into_ack()
    }

    /// Remove `id` from the observables of `topic`. Idempotent.
    pub async fn unregister_observable(&self, topic: &str, id: &EntityId) -> Result<()> {
        self.handle_for(topic)?
            .call(Request::UnregisterObservableInDirectory {
                topic: topic.to_string(),
                id: id.clone(),
            })
            .await?
            .into_ack()
    }

    /// Observables of `topic`, optionally narrowed to one exact entity URI.
    pub async fn query_observables(
        &self,
        topic: &str,
        filter: Option<&str>,
    ) -> Result<Option<Vec<EntityId>>> {
        self.handle_for(topic)?
            .call(Request::QueryObservables {
                topic: topic.to_string(),
                filter: filter.map(str::to_string),
            })
            .await?
            .into_observables()
    }
}
