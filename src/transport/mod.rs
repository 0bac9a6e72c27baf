//! Address-based RPC substrate.
//!
//! The core never talks to a hosting runtime directly. It sends
//! [`Request`]s to [`EntityId`]s through a [`Transport`], and each hosted
//! entity answers through a [`RequestHandler`].

mod local;

pub use local::LocalTransport;

use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::types::{EntityId, Message};
use crate::wire::{Request, Response};
use async_trait::async_trait;
use std::sync::Arc;

/// Delivers a request to the instance addressed by `target`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, target: &EntityId, request: Request) -> Result<Response>;
}

/// Server side of a hosted entity or partition.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Result<Response>;
}

/// What a hosted instance knows about itself and how it reaches others.
#[async_trait]
pub trait InstanceAddressing: Send + Sync {
    /// Identity of the current instance. May fail transiently while the
    /// hosting runtime is still activating it.
    async fn identity(&self) -> Result<EntityId>;

    fn transport(&self) -> Arc<dyn Transport>;
}

/// Addressing with a fixed, always-available identity.
pub struct StaticAddressing {
    id: EntityId,
    transport: Arc<dyn Transport>,
}

impl StaticAddressing {
    /// Addressing with a fixed identity.
    pub fn new(id: EntityId, transport: Arc<dyn Transport>) -> Self {
        Self { id, transport }
    }
}

#[async_trait]
impl InstanceAddressing for StaticAddressing {
    async fn identity(&self) -> Result<EntityId> {
        Ok(self.id.clone())
    }

    fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }
}

/// Typed client for one remote entity. Every call is retried per `retry`.
#[derive(Clone)]
pub struct RemoteHandle {
    target: EntityId,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl RemoteHandle {
    /// Handle calling `target` over `transport`, retrying transient failures.
    pub fn new(target: EntityId, transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            target,
            transport,
            retry,
        }
    }

    /// Entity this handle calls.
    pub fn target(&self) -> &EntityId {
        &self.target
    }

    /// Send `request`, retrying transient failures.
    pub async fn call(&self, request: Request) -> Result<Response> {
        let transport = &self.transport;
        let target = &self.target;
        let request = &request;
        self.retry
            .run(request.name(), move || transport.send(target, request.clone()))
            .await
    }

    /// Ask the observable to add `observer` under `topic`.
    pub async fn register_observer(
        &self,
        topic: &str,
        filters: Vec<String>,
        observer: EntityId,
    ) -> Result<()> {
        self.call(Request::RegisterObserver {
            topic: topic.to_string(),
            filters,
            observer,
        })
        .await?
        .into_ack()
    }

    /// Ask the observable to drop `observer` under `topic`.
    pub async fn unregister_observer(&self, topic: &str, observer: EntityId) -> Result<()> {
        self.call(Request::UnregisterObserver {
            topic: topic.to_string(),
            observer,
        })
        .await?
        .into_ack()
    }

    /// Deliver a message, with the peers to relay it to if any.
    pub async fn notify_observer(
        &self,
        topic: &str,
        message: Message,
        observable: EntityId,
        remainder: Option<Vec<EntityId>>,
    ) -> Result<()> {
        self.call(Request::NotifyObserver {
            topic: topic.to_string(),
            message,
            observable,
            remainder,
        })
        .await?
        .into_ack()
    }

    /// Tell an observer the observable stopped publishing on `topic`.
    pub async fn unregister_observable_notice(
        &self,
        topic: &str,
        observable: EntityId,
        remainder: Option<Vec<EntityId>>,
    ) -> Result<()> {
        self.call(Request::UnregisterObservableNotice {
            topic: topic.to_string(),
            observable,
            remainder,
        })
        .await?
        .into_ack()
    }

    /// Ask the target for its identity.
    pub async fn get_entity_id(&self) -> Result<EntityId> {
        self.call(Request::GetEntityId).await?.into_entity()
    }
}
