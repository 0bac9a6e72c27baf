//! Bounded per-recipient store-and-forward queues.
//!
//! Messages land here when live delivery is exhausted, and observers may poll
//! their own queue. Writes are all-or-nothing against the capacity; reads
//! drain the queue.

use crate::error::{CoreError, Result};
use crate::partition::PartitionResolver;
use crate::retry::RetryPolicy;
use crate::store::{self, TransactionalStore};
use crate::transport::{RemoteHandle, RequestHandler, Transport};
use crate::types::{EntityId, Message};
use crate::wire::{Request, Response};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Service address of mailbox partitions.
pub const MAILBOX_SERVICE: &str = "observatory://mailbox";

const QUEUES: &str = "mailbox";

/// Identity of mailbox partition `index`.
pub fn partition_id(index: u32) -> Result<EntityId> {
    EntityId::service(MAILBOX_SERVICE, Some(i64::from(index)))
}

fn validate_recipient(recipient: &str) -> Result<()> {
    if recipient.trim().is_empty() {
        return Err(CoreError::Validation("mailbox recipient is empty".into()));
    }
    Ok(())
}

/// One mailbox partition.
pub struct MailboxPartition {
    index: u32,
    store: Arc<dyn TransactionalStore>,
    capacity: usize,
    retry: RetryPolicy,
}

impl MailboxPartition {
    /// Mailbox partition `index` holding at most `capacity` messages per recipient.
    pub fn new(
        index: u32,
        store: Arc<dyn TransactionalStore>,
        capacity: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            index,
            store,
            capacity,
            retry,
        }
    }

    /// Maximum queued messages per recipient.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `messages` to the queue of `recipient`.
    ///
    /// Fails with [`CoreError::Capacity`] and writes nothing if the queue would
    /// grow past capacity.
    pub async fn write(&self, recipient: &str, messages: &[Message]) -> Result<()> {
        validate_recipient(recipient)?;
        if messages.is_empty() {
            return Ok(());
        }
        let capacity = self.capacity;

        self.retry
            .run("mailbox_write", move || async move {
                let mut tx = self.store.begin().await?;
                let mut queue: Vec<Message> = match tx.get(QUEUES, recipient).await? {
                    Some(bytes) => store::decode(&bytes)?,
                    None => Vec::new(),
                };

                if queue.len() + messages.len() > capacity {
                    warn!(
                        partition = self.index,
                        recipient = %recipient,
                        existing = queue.len(),
                        incoming = messages.len(),
                        "mailbox full, batch rejected"
                    );
                    return Err(CoreError::Capacity {
                        recipient: recipient.to_string(),
                        capacity,
                        existing: queue.len(),
                        incoming: messages.len(),
                    });
                }

                queue.extend_from_slice(messages);
                tx.put(QUEUES, recipient, store::encode(&queue)?).await?;
                tx.commit().await
            })
            .await?;

        debug!(partition = self.index, recipient = %recipient, count = messages.len(), "mailbox write");
        Ok(())
    }

    /// Take every queued message for `recipient`, leaving the queue empty.
    pub async fn read(&self, recipient: &str) -> Result<Vec<Message>> {
        validate_recipient(recipient)?;
        let messages = self
            .retry
            .run("mailbox_read", move || async move {
                let mut tx = self.store.begin().await?;
                let Some(bytes) = tx.get(QUEUES, recipient).await? else {
                    return Ok(Vec::new());
                };
                let queue: Vec<Message> = store::decode(&bytes)?;
                tx.delete(QUEUES, recipient).await?;
                tx.commit().await?;
                Ok(queue)
            })
            .await?;

        if !messages.is_empty() {
            debug!(partition = self.index, recipient = %recipient, count = messages.len(), "mailbox drained");
        }
        Ok(messages)
    }
}

#[async_trait]
impl RequestHandler for MailboxPartition {
    async fn handle(&self, request: Request) -> Result<Response> {
        match request {
            Request::WriteMailbox {
                recipient,
                messages,
            } => {
                self.write(&recipient, &messages).await?;
                Ok(Response::Ack)
            }
            Request::ReadMailbox { recipient } => Ok(Response::Messages {
                messages: self.read(&recipient).await?,
            }),
            other => Err(CoreError::Remote(format!(
                "mailbox partition cannot handle {}",
                other.name()
            ))),
        }
    }
}

/// Client that routes each recipient URI to its mailbox partition.
#[derive(Clone)]
pub struct MailboxClient {
    resolver: PartitionResolver,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl MailboxClient {
    /// Client resolving each recipient to its mailbox partition.
    pub fn new(resolver: PartitionResolver, transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            resolver,
            transport,
            retry,
        }
    }

    fn handle_for(&self, recipient: &str) -> Result<RemoteHandle> {
        validate_recipient(recipient)?;
        Ok(RemoteHandle::new(
            partition_id(self.resolver.resolve(recipient))?,
            Arc::clone(&self.transport),
            self.retry,
        ))
    }

    /// Append `messages` to the queue of `recipient`, all or nothing.
    pub async fn write(&self, recipient: &str, messages: Vec<Message>) -> Result<()> {
        self.handle_for(recipient)?
            .call(Request::WriteMailbox {
                recipient: recipient.to_string(),
                messages,
            })
            .await?
            .into_ack()
    }

    /// Drain and return the queue of `recipient`.
    pub async fn read(&self, recipient: &str) -> Result<Vec<Message>> {
        self.handle_for(recipient)?
            .call(Request::ReadMailbox {
                recipient: recipient.to_string(),
            })
            .await?
            .into_messages()
    }
}
