//! Fan-out of notifications from an observable to its observers.
//!
//! A fan-out runs in three steps:
//! 1. [`select_targets`] picks the delivery set from the observer table
//! 2. [`plan`] turns it into remote calls, direct or through relays
//! 3. [`Dispatcher`] issues every call concurrently with retry, falling back
//!    to the recipient's mailbox when retries run out
//!
//! Targets are independent: one failing never stops the others, and all
//! outcomes are joined into a [`DeliveryReport`].

mod relay;

pub use relay::{plan, Delivery, FirstInGroup, RelaySelector, SeededRandom};

use crate::error::{CoreError, Result, TargetFailure};
use crate::filter::Document;
use crate::mailbox::MailboxClient;
use crate::retry::RetryPolicy;
use crate::subscriptions::Subscription;
use crate::transport::{RemoteHandle, Transport};
use crate::types::{EntityId, Message};
use crate::wire::Request;
use futures::future::{join_all, BoxFuture, FutureExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Observers that should receive `message`.
///
/// Filters are opt-in: when the body is a JSON object and at least one
/// observer has filters, only filtered observers with a matching filter are
/// selected. Otherwise every observer is.
pub fn select_targets(observers: &[Subscription], message: &Message) -> Vec<EntityId> {
    if observers.iter().any(Subscription::has_filters) {
        if let Some(document) = Document::parse_object(&message.body) {
            return observers
                .iter()
                .filter(|s| s.accepts(&document))
                .map(|s| s.observer.clone())
                .collect();
        }
    }
    observers.iter().map(|s| s.observer.clone()).collect()
}

/// What a fan-out carries.
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    Message(Message),
    /// The sending observable stopped publishing on the topic.
    Unregistered,
}

impl Notice {
    fn request(&self, topic: &str, sender: &EntityId, remainder: Option<Vec<EntityId>>) -> Request {
        match self {
            Notice::Message(message) => Request::NotifyObserver {
                topic: topic.to_string(),
                message: message.clone(),
                observable: sender.clone(),
                remainder,
            },
            Notice::Unregistered => Request::UnregisterObservableNotice {
                topic: topic.to_string(),
                observable: sender.clone(),
                remainder,
            },
        }
    }
}

/// Outcome of one fan-out.
///
/// Only first-hop targets are listed; a relay accounts for its own remainder.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeliveryReport {
    pub delivered: Vec<EntityId>,
    /// Targets whose retries ran out and whose copy went to their mailbox.
    pub mailboxed: Vec<EntityId>,
    pub failures: Vec<TargetFailure>,
}

impl DeliveryReport {
    /// Append the outcomes of `other`.
    pub fn merge(&mut self, other: DeliveryReport) {
        self.delivered.extend(other.delivered);
        self.mailboxed.extend(other.mailboxed);
        self.failures.extend(other.failures);
    }

    /// True when no target failed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Err(CoreError::Delivery)` listing every failure, if there were any.
    pub fn into_result(self) -> Result<DeliveryReport> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(CoreError::Delivery(self.failures))
        }
    }
}

/// Issues the remote calls of a fan-out.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    mailbox: MailboxClient,
    retry: RetryPolicy,
    selector: Arc<dyn RelaySelector>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        mailbox: MailboxClient,
        retry: RetryPolicy,
        selector: Arc<dyn RelaySelector>,
    ) -> Self {
        Self {
            transport,
            mailbox,
            retry,
            selector,
        }
    }

    /// Deliver `notice` from `sender` to every target and wait for all of them.
    pub async fn dispatch(
        &self,
        topic: &str,
        sender: &EntityId,
        notice: &Notice,
        targets: Vec<EntityId>,
        use_proxy: bool,
    ) -> DeliveryReport {
        self.dispatch_boxed(topic, sender, notice, targets, use_proxy)
            .await
    }

    fn dispatch_boxed<'a>(
        &'a self,
        topic: &'a str,
        sender: &'a EntityId,
        notice: &'a Notice,
        targets: Vec<EntityId>,
        use_proxy: bool,
    ) -> BoxFuture<'a, DeliveryReport> {
        async move {
            let deliveries = plan(targets, use_proxy, self.selector.as_ref());
            debug!(topic = %topic, calls = deliveries.len(), use_proxy, "dispatching");

            let outcomes = join_all(
                deliveries
                    .into_iter()
                    .map(|delivery| self.deliver(topic, sender, notice, delivery)),
            )
            .await;

            let mut report = DeliveryReport::default();
            for outcome in outcomes {
                report.merge(outcome);
            }
            report
        }
        .boxed()
    }

    async fn deliver(
        &self,
        topic: &str,
        sender: &EntityId,
        notice: &Notice,
        delivery: Delivery,
    ) -> DeliveryReport {
        let Delivery { target, remainder } = delivery;
        let mut report = DeliveryReport::default();

        let handle = RemoteHandle::new(target.clone(), Arc::clone(&self.transport), self.retry);
        let request = notice.request(topic, sender, remainder.clone());

        match handle.call(request).await.and_then(|r| r.into_ack()) {
            Ok(()) => {
                report.delivered.push(target);
                return report;
            }
            Err(exhausted @ CoreError::TimeoutExhausted { .. }) => {
                self.fall_back(topic, notice, target, exhausted, &mut report)
                    .await;
            }
            Err(e) => {
                warn!(topic = %topic, target = %target, error = %e, "delivery failed");
                report
                    .failures
                    .push(TargetFailure::new(target.entity_uri(), e));
            }
        }

        if let Some(rest) = remainder.filter(|r| !r.is_empty()) {
            info!(topic = %topic, remaining = rest.len(), "relay unavailable, re-planning its group");
            let rerouted = self.dispatch_boxed(topic, sender, notice, rest, true).await;
            report.merge(rerouted);
        }
        report
    }

    /// Park a copy in the target's mailbox after live delivery ran out of retries.
    async fn fall_back(
        &self,
        topic: &str,
        notice: &Notice,
        target: EntityId,
        exhausted: CoreError,
        report: &mut DeliveryReport,
    ) {
        let Notice::Message(message) = notice else {
            warn!(topic = %topic, target = %target, "unregister notice undeliverable");
            report
                .failures
                .push(TargetFailure::new(target.entity_uri(), exhausted));
            return;
        };

        match self
            .mailbox
            .write(target.entity_uri(), vec![message.clone()])
            .await
        {
            Ok(()) => {
                info!(topic = %topic, target = %target, "retries exhausted, message mailboxed");
                report.mailboxed.push(target);
            }
            Err(e) => {
                warn!(topic = %topic, target = %target, error = %e, "mailbox fallback failed");
                report
                    .failures
                    .push(TargetFailure::new(target.entity_uri(), e));
            }
        }
    }
}
