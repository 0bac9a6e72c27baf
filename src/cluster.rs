//! In-process deployment: registry and mailbox partitions plus endpoints, all
//! wired onto one [`LocalTransport`].

use crate::config::CoreConfig;
use crate::dispatch::RelaySelector;
use crate::endpoint::Endpoint;
use crate::error::{CoreError, Result};
use crate::mailbox::{self, MailboxClient, MailboxPartition};
use crate::partition::PartitionResolver;
use crate::registry::{self, RegistryClient, RegistryPartition};
use crate::retry::RetryPolicy;
use crate::store::{MemoryStore, TransactionalStore};
use crate::transport::{LocalTransport, StaticAddressing, Transport};
use crate::types::EntityId;
use std::sync::Arc;
use tracing::info;

/// Everything needed to run observables and observers in one process.
pub struct LocalCluster {
    config: CoreConfig,
    resolver: PartitionResolver,
    transport: Arc<LocalTransport>,
    registries: Vec<Arc<RegistryPartition>>,
    mailboxes: Vec<Arc<MailboxPartition>>,
}

impl LocalCluster {
    /// Cluster whose partitions keep their state in memory.
    pub fn new(config: CoreConfig) -> Result<Self> {
        let count = config.default_partition_count as usize;
        let stores = (0..count)
            .map(|_| Arc::new(MemoryStore::new()) as Arc<dyn TransactionalStore>)
            .collect();
        Self::with_mailbox_stores(config, stores)
    }

    /// Cluster whose mailbox partitions use the given stores, one per
    /// partition in index order. Registry partitions stay in memory.
    pub fn with_mailbox_stores(
        config: CoreConfig,
        mailbox_stores: Vec<Arc<dyn TransactionalStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let resolver = PartitionResolver::new(config.default_partition_count)?;
        if mailbox_stores.len() != resolver.partition_count() as usize {
            return Err(CoreError::Validation(format!(
                "expected {} mailbox stores, got {}",
                resolver.partition_count(),
                mailbox_stores.len()
            )));
        }

        let retry = RetryPolicy::from_config(&config);
        let transport = Arc::new(LocalTransport::new());

        let mut registries = Vec::new();
        let mut mailboxes = Vec::new();
        for (index, mailbox_store) in resolver.partitions().zip(mailbox_stores) {
            let partition = Arc::new(RegistryPartition::new(
                index,
                Arc::new(MemoryStore::new()),
                retry,
            ));
            transport.bind(&registry::partition_id(index)?, partition.clone());
            registries.push(partition);

            let partition = Arc::new(MailboxPartition::new(
                index,
                mailbox_store,
                config.mailbox_capacity,
                retry,
            ));
            transport.bind(&mailbox::partition_id(index)?, partition.clone());
            mailboxes.push(partition);
        }

        info!(partitions = resolver.partition_count(), "local cluster started");
        Ok(Self {
            config,
            resolver,
            transport,
            registries,
            mailboxes,
        })
    }

    /// Configuration every endpoint in this cluster is built with.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The shared in-process transport, for binding handlers and injecting faults.
    pub fn transport(&self) -> Arc<LocalTransport> {
        Arc::clone(&self.transport)
    }

    /// Registry partition by 1-based index.
    pub fn registry_partition(&self, index: u32) -> Option<&Arc<RegistryPartition>> {
        self.registries.get((index as usize).checked_sub(1)?)
    }

    /// Mailbox partition by 1-based index.
    pub fn mailbox_partition(&self, index: u32) -> Option<&Arc<MailboxPartition>> {
        self.mailboxes.get((index as usize).checked_sub(1)?)
    }

    /// Client routing registry calls to the partition owning each topic.
    pub fn registry_client(&self) -> RegistryClient {
        RegistryClient::new(
            self.resolver,
            self.transport.clone() as Arc<dyn Transport>,
            RetryPolicy::from_config(&self.config),
        )
    }

    /// Client routing mailbox calls to the partition owning each recipient.
    pub fn mailbox_client(&self) -> MailboxClient {
        MailboxClient::new(
            self.resolver,
            self.transport.clone() as Arc<dyn Transport>,
            RetryPolicy::from_config(&self.config),
        )
    }

    /// Host a new endpoint under `id` with in-memory state.
    pub fn spawn(&self, id: EntityId) -> Result<Endpoint> {
        self.spawn_with(id, Arc::new(MemoryStore::new()), None)
    }

    /// Host a new endpoint under `id` with the given store and relay policy.
    pub fn spawn_with(
        &self,
        id: EntityId,
        store: Arc<dyn TransactionalStore>,
        selector: Option<Arc<dyn RelaySelector>>,
    ) -> Result<Endpoint> {
        let addressing = Arc::new(StaticAddressing::new(
            id.clone(),
            self.transport.clone() as Arc<dyn Transport>,
        ));
        let endpoint = match selector {
            Some(selector) => Endpoint::with_relay_selector(addressing, store, &self.config, selector)?,
            None => Endpoint::new(addressing, store, &self.config)?,
        };
        self.transport.bind(&id, Arc::new(endpoint.clone()));
        Ok(endpoint)
    }
}
