//! # Observatory
//!
//! A distributed publish/subscribe core. Observables publish topic-scoped
//! messages; observers subscribe with optional filter expressions and receive
//! only what their filters accept.
//!
//! ## Core Concepts
//!
//! - **Endpoint**: a hosted instance acting as observable, observer, or both
//! - **Registry**: partitioned directory of which observables publish a topic
//! - **Filters**: `id != null and id = 10` style predicates compiled once at
//!   registration
//! - **Relays**: colocated observers share one remote call per node
//! - **Mailbox**: bounded store-and-forward queue for exhausted deliveries
//!
//! ## Example
//!
//! ```ignore
//! use observatory::{CoreConfig, EntityId, LocalCluster, Message};
//!
//! let cluster = LocalCluster::new(CoreConfig::default())?;
//! let feed = cluster.spawn(EntityId::service("fabric:/app/Feed", Some(1))?)?;
//! let watcher = cluster.spawn(EntityId::actor("fabric:/app/Watchers", "w1")?)?;
//!
//! feed.register_observable("prices").await?;
//! watcher
//!     .register_observer("prices", vec!["id = 10".into()], &feed.get_entity_id().await?)
//!     .await?;
//!
//! feed.notify_observers("prices", Message::new(r#"{"id":10}"#), true).await?;
//! ```

pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod filter;
pub mod mailbox;
pub mod partition;
pub mod registry;
pub mod retry;
pub mod store;
pub mod subscriptions;
pub mod transport;
pub mod types;
pub mod wire;

// Re-exports
pub use cluster::LocalCluster;
pub use config::CoreConfig;
pub use dispatch::{DeliveryReport, FirstInGroup, RelaySelector, SeededRandom};
pub use endpoint::Endpoint;
pub use error::{CoreError, Result, TargetFailure};
pub use events::{EventFilter, EventHandle, EventHub, ObserverEvent};
pub use filter::{CompiledFilter, Document, FilterCache, FilterSet, Schema, TypedFilter};
pub use mailbox::{MailboxClient, MailboxPartition};
pub use partition::PartitionResolver;
pub use registry::{RegistryClient, RegistryPartition};
pub use retry::RetryPolicy;
pub use store::{FileStore, MemoryStore, Transaction, TransactionalStore};
pub use subscriptions::{ObservedTopic, Subscription, SubscriptionStore};
pub use transport::{InstanceAddressing, LocalTransport, RemoteHandle, RequestHandler, Transport};
pub use types::*;
