//! Local events raised by an endpoint.
//!
//! Two ways to listen:
//! - async handler callbacks, all invoked concurrently for every event and
//!   joined before `emit` returns; their failures come back as one
//!   [`CoreError::Delivery`] aggregate
//! - channel subscribers with a bounded buffer, dropped when they fall behind

use crate::error::{CoreError, Result, TargetFailure};
use crate::types::{EntityId, Message};
use crossbeam_channel::{bounded, Receiver, Sender};
use futures::future::{join_all, BoxFuture};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Something that happened on an endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverEvent {
    // --- Observable side ---
    ObserverRegistered {
        topic: String,
        observer: EntityId,
        filters: Vec<String>,
    },
    ObserverUnregistered {
        topic: String,
        observer: EntityId,
    },

    // --- Observer side ---
    MessageReceived {
        topic: String,
        message: Message,
        observable: EntityId,
    },
    ObservableUnregistered {
        topic: String,
        observable: EntityId,
    },

    // --- Lifecycle ---
    /// Sent to a channel subscriber as it is removed.
    Dropped { reason: DropReason },
}

impl ObserverEvent {
    /// Topic the event belongs to, if any.
    pub fn topic(&self) -> Option<&str> {
        match self {
            ObserverEvent::ObserverRegistered { topic, .. }
            | ObserverEvent::ObserverUnregistered { topic, .. }
            | ObserverEvent::MessageReceived { topic, .. }
            | ObserverEvent::ObservableUnregistered { topic, .. } => Some(topic),
            ObserverEvent::Dropped { .. } => None,
        }
    }
}

/// Why a channel subscriber was removed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Buffer overflowed (slow consumer).
    BufferOverflow,
    Unsubscribed,
}

/// Which events a channel subscriber wants.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    /// None = every topic.
    pub topics: Option<Vec<String>>,
}

impl EventFilter {
    /// Accept every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Accept events on the given topics only.
    pub fn topics(topics: Vec<String>) -> Self {
        Self {
            topics: Some(topics),
        }
    }

    fn matches(&self, event: &ObserverEvent) -> bool {
        match (&self.topics, event.topic()) {
            (None, _) => true,
            (Some(topics), Some(topic)) => topics.iter().any(|t| t == topic),
            (Some(_), None) => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

/// Boxed async event callback.
pub type EventHandler = Arc<dyn Fn(ObserverEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Receiving end of a channel subscription.
pub struct EventHandle {
    pub id: SubscriberId,
    pub receiver: Receiver<ObserverEvent>,
}

impl EventHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> std::result::Result<ObserverEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> std::result::Result<ObserverEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<ObserverEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything currently buffered.
    pub fn drain(&self) -> Vec<ObserverEvent> {
        self.receiver.try_iter().collect()
    }
}

struct Subscriber {
    filter: EventFilter,
    sender: Sender<ObserverEvent>,
}

impl Subscriber {
    /// False if the buffer is full or the receiver is gone.
    fn try_send(&self, event: ObserverEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }
}

/// Fan-out of endpoint events to handlers and channel subscribers.
pub struct EventHub {
    handlers: RwLock<Vec<(HandlerId, EventHandler)>>,
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    buffer_size: usize,
}

impl EventHub {
    /// Hub whose subscribers buffer up to `buffer_size` events.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    // --- Handlers ---

    /// Register an async callback run for every event.
    pub fn add_handler<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: Fn(ObserverEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = HandlerId(self.next_id());
        let boxed: EventHandler = Arc::new(move |event| Box::pin(handler(event)));
        self.handlers.write().push((id, boxed));
        id
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    // --- Channel subscribers ---

    /// Subscribe with the default buffer size.
    pub fn subscribe(&self, filter: EventFilter) -> EventHandle {
        self.subscribe_with_buffer(filter, self.buffer_size)
    }

    /// Subscribe with a buffer of `buffer_size` events.
    pub fn subscribe_with_buffer(&self, filter: EventFilter, buffer_size: usize) -> EventHandle {
        let id = SubscriberId(self.next_id());
        let (sender, receiver) = bounded(buffer_size.max(1));
        self.subscribers
            .write()
            .insert(id, Subscriber { filter, sender });
        EventHandle { id, receiver }
    }

    /// Drop a subscriber; it receives a final `Dropped` event.
    pub fn unsubscribe(&self, id: SubscriberId) {
        if let Some(sub) = self.subscribers.write().remove(&id) {
            let _ = sub.sender.try_send(ObserverEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    // --- Emitting ---

    /// Deliver `event` to every channel subscriber, then run every handler
    /// concurrently and wait for all of them.
    pub async fn emit(&self, event: ObserverEvent) -> Result<()> {
        self.broadcast(&event);

        let handlers: Vec<(HandlerId, EventHandler)> = self.handlers.read().clone();
        if handlers.is_empty() {
            return Ok(());
        }

        let outcomes = join_all(handlers.into_iter().map(|(id, handler)| {
            let running = handler(event.clone());
            async move { (id, running.await) }
        }))
        .await;

        let failures: Vec<TargetFailure> = outcomes
            .into_iter()
            .filter_map(|(id, outcome)| {
                outcome
                    .err()
                    .map(|e| TargetFailure::new(format!("handler-{}", id.0), e))
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            warn!(failed = failures.len(), "event handlers failed");
            Err(CoreError::Delivery(failures))
        }
    }

    fn broadcast(&self, event: &ObserverEvent) {
        let mut overflowed = Vec::new();
        {
            let subs = self.subscribers.read();
            for (id, sub) in subs.iter() {
                if sub.filter.matches(event) && !sub.try_send(event.clone()) {
                    overflowed.push(*id);
                }
            }
        }

        if !overflowed.is_empty() {
            let mut subs = self.subscribers.write();
            for id in overflowed {
                if let Some(sub) = subs.remove(&id) {
                    debug!(subscriber = id.0, "dropping slow event subscriber");
                    let _ = sub.sender.try_send(ObserverEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1000)
    }
}
