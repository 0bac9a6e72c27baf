//! Requests an endpoint serves for its peers.

use super::Endpoint;
use crate::dispatch::Notice;
use crate::error::{CoreError, Result};
use crate::events::ObserverEvent;
use crate::transport::RequestHandler;
use crate::types::{validate_topic, EntityId, Message};
use crate::wire::{Request, Response};
use async_trait::async_trait;
use tracing::{debug, warn};

impl Endpoint {
    /// Accept `observer` into the observer table of `topic`.
    pub async fn accept_observer(
        &self,
        topic: &str,
        filters: Vec<String>,
        observer: EntityId,
    ) -> Result<()> {
        self.inner
            .subscriptions
            .add_observer(topic, &observer, filters.clone())
            .await?;
        self.raise(ObserverEvent::ObserverRegistered {
            topic: topic.to_string(),
            observer,
            filters,
        })
        .await;
        Ok(())
    }

    /// Drop `observer` from the observer table of `topic`, if present.
    pub async fn release_observer(&self, topic: &str, observer: EntityId) -> Result<()> {
        if self
            .inner
            .subscriptions
            .remove_observer(topic, &observer)
            .await?
        {
            self.raise(ObserverEvent::ObserverUnregistered {
                topic: topic.to_string(),
                observer,
            })
            .await;
        }
        Ok(())
    }

    /// Receive a message from `observable`, forwarding it to `remainder` when
    /// this endpoint was picked as relay.
    pub async fn notify_observer(
        &self,
        topic: &str,
        message: Message,
        observable: EntityId,
        remainder: Option<Vec<EntityId>>,
    ) -> Result<()> {
        validate_topic(topic)?;
        let notice = Notice::Message(message.clone());
        let forward = self.forward(topic, &observable, &notice, remainder);
        let raise = self.raise(ObserverEvent::MessageReceived {
            topic: topic.to_string(),
            message,
            observable: observable.clone(),
        });
        futures::join!(forward, raise);
        Ok(())
    }

    /// `observable` stopped publishing on `topic`. Forget the subscription,
    /// then forward the notice to `remainder`.
    ///
    /// Nothing is forwarded when the local removal fails, so the sender can
    /// re-plan the remainder without it receiving the notice twice.
    pub async fn unregister_observable_notice(
        &self,
        topic: &str,
        observable: EntityId,
        remainder: Option<Vec<EntityId>>,
    ) -> Result<()> {
        validate_topic(topic)?;
        self.inner
            .subscriptions
            .remove_observed(topic, &observable)
            .await?;
        self.forward(topic, &observable, &Notice::Unregistered, remainder)
            .await;
        self.raise(ObserverEvent::ObservableUnregistered {
            topic: topic.to_string(),
            observable,
        })
        .await;
        Ok(())
    }

    /// Relay `notice` to the rest of this node's group. Failures stay here:
    /// the sender already got its copy through, and exhausted targets have
    /// been mailboxed by the dispatcher.
    async fn forward(
        &self,
        topic: &str,
        observable: &EntityId,
        notice: &Notice,
        remainder: Option<Vec<EntityId>>,
    ) {
        let Some(rest) = remainder.filter(|r| !r.is_empty()) else {
            return;
        };
        debug!(topic = %topic, remaining = rest.len(), "relaying");
        let report = self
            .inner
            .dispatcher
            .dispatch(topic, observable, notice, rest, true)
            .await;
        if !report.is_clean() {
            warn!(topic = %topic, failed = report.failures.len(), "relay forwarding incomplete");
        }
    }

    /// Emit a local event. Handler failures are logged, never sent back to
    /// the peer that caused the event.
    async fn raise(&self, event: ObserverEvent) {
        if let Err(e) = self.inner.events.emit(event).await {
            warn!(error = %e, "event handler failed");
        }
    }
}

#[async_trait]
impl RequestHandler for Endpoint {
    async fn handle(&self, request: Request) -> Result<Response> {
        match request {
            Request::RegisterObserver {
                topic,
                filters,
                observer,
            } => self.accept_observer(&topic, filters, observer).await?,
            Request::UnregisterObserver { topic, observer } => {
                self.release_observer(&topic, observer).await?
            }
            Request::NotifyObserver {
                topic,
                message,
                observable,
                remainder,
            } => {
                self.notify_observer(&topic, message, observable, remainder)
                    .await?
            }
            Request::UnregisterObservableNotice {
                topic,
                observable,
                remainder,
            } => {
                self.unregister_observable_notice(&topic, observable, remainder)
                    .await?
            }
            Request::GetEntityId => {
                return Ok(Response::Entity {
                    id: self.get_entity_id().await?,
                })
            }
            other => {
                return Err(CoreError::Remote(format!(
                    "endpoint cannot handle {}",
                    other.name()
                )))
            }
        }
        Ok(Response::Ack)
    }
}
