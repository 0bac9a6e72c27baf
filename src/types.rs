//! Core types: entity identity, addressing and messages.

use crate::error::{CoreError, Result};
use crate::store::KEY_SEPARATOR;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Locality tag used when the hosting node cannot be determined.
pub const UNKNOWN_NODE: &str = "UNKNOWN";

/// What kind of addressable instance an [`EntityId`] names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Keyed, actor-like instance. Always carries an actor key.
    Actor,
    /// Service partition. Carries a partition key unless singleton.
    Service,
}

/// Identity of one addressable observable or observer instance.
///
/// Equality and hashing use [`EntityId::entity_uri`] only, so two ids that
/// differ only by `node` are the same entity.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "EntityRecord", into = "EntityRecord")]
pub struct EntityId {
    kind: EntityKind,
    actor_key: Option<String>,
    partition_key: Option<i64>,
    service_address: String,
    node: String,
    entity_uri: String,
}

impl EntityId {
    /// Identity of an actor-like instance.
    pub fn actor(service_address: impl Into<String>, actor_key: impl Into<String>) -> Result<Self> {
        Self::build(
            EntityKind::Actor,
            Some(actor_key.into()),
            None,
            service_address.into(),
            None,
        )
    }

    /// Identity of a service partition. `None` means the singleton/default partition.
    pub fn service(service_address: impl Into<String>, partition_key: Option<i64>) -> Result<Self> {
        Self::build(
            EntityKind::Service,
            None,
            partition_key,
            service_address.into(),
            None,
        )
    }

    /// Return a copy tagged with the given execution node.
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        let node = node.into();
        self.node = if node.trim().is_empty() {
            UNKNOWN_NODE.to_string()
        } else {
            node
        };
        self
    }

    fn build(
        kind: EntityKind,
        actor_key: Option<String>,
        partition_key: Option<i64>,
        service_address: String,
        node: Option<String>,
    ) -> Result<Self> {
        let service_address = service_address.trim().to_string();
        if service_address.is_empty() {
            return Err(CoreError::Validation("entity service address is empty".into()));
        }

        let (actor_key, partition_key) = match kind {
            EntityKind::Actor => {
                let key = actor_key
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| CoreError::Validation("actor entity requires an actor key".into()))?;
                if partition_key.is_some() {
                    return Err(CoreError::Validation(
                        "actor entity cannot carry a partition key".into(),
                    ));
                }
                (Some(key), None)
            }
            EntityKind::Service => {
                if actor_key.is_some() {
                    return Err(CoreError::Validation(
                        "service entity cannot carry an actor key".into(),
                    ));
                }
                (None, partition_key)
            }
        };

        let base = service_address.trim_end_matches('/');
        let entity_uri = match (&actor_key, partition_key) {
            (Some(key), _) => format!("{}/{}", base, key),
            (None, Some(partition)) => format!("{}/{}", base, partition),
            (None, None) => service_address.clone(),
        };

        let node = node
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_NODE.to_string());

        Ok(Self {
            kind,
            actor_key,
            partition_key,
            service_address,
            node,
            entity_uri,
        })
    }

    /// Whether this is an actor or a service partition.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Actor key, present for actors only.
    pub fn actor_key(&self) -> Option<&str> {
        self.actor_key.as_deref()
    }

    /// Partition key of a partitioned service.
    pub fn partition_key(&self) -> Option<i64> {
        self.partition_key
    }

    /// Service address without the actor or partition part.
    pub fn service_address(&self) -> &str {
        &self.service_address
    }

    /// Execution-locality tag, [`UNKNOWN_NODE`] when unavailable.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Unique routing and dedup key.
    pub fn entity_uri(&self) -> &str {
        &self.entity_uri
    }

    /// Compact wire form (drops the node tag).
    pub fn to_short(&self) -> ShortEntityId {
        ShortEntityId {
            kind: self.kind,
            actor_key: self.actor_key.clone(),
            partition_key: self.partition_key,
            service_address: self.service_address.clone(),
        }
    }
}

impl PartialEq for EntityId {
    fn eq(&self, other: &Self) -> bool {
        self.entity_uri == other.entity_uri
    }
}

impl Eq for EntityId {}

impl Hash for EntityId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity_uri.hash(state);
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({} @ {})", self.entity_uri, self.node)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entity_uri)
    }
}

/// Transport record behind `EntityId`'s serde impls.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct EntityRecord {
    kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    actor_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    partition_key: Option<i64>,
    service_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    node: Option<String>,
}

impl TryFrom<EntityRecord> for EntityId {
    type Error = CoreError;

    fn try_from(record: EntityRecord) -> Result<Self> {
        EntityId::build(
            record.kind,
            record.actor_key,
            record.partition_key,
            record.service_address,
            record.node,
        )
    }
}

impl From<EntityId> for EntityRecord {
    fn from(id: EntityId) -> Self {
        EntityRecord {
            kind: id.kind,
            actor_key: id.actor_key,
            partition_key: id.partition_key,
            service_address: id.service_address,
            node: Some(id.node),
        }
    }
}

/// Compact wire form of an [`EntityId`], identical minus the node tag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortEntityId {
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<i64>,
    pub service_address: String,
}

impl ShortEntityId {
    /// Rebuild a transient identity. The node is unknown on this side of the wire.
    pub fn to_entity_id(&self) -> Result<EntityId> {
        EntityId::build(
            self.kind,
            self.actor_key.clone(),
            self.partition_key,
            self.service_address.clone(),
            None,
        )
    }
}

impl From<&EntityId> for ShortEntityId {
    fn from(id: &EntityId) -> Self {
        id.to_short()
    }
}

impl TryFrom<ShortEntityId> for EntityId {
    type Error = CoreError;

    fn try_from(short: ShortEntityId) -> Result<Self> {
        short.to_entity_id()
    }
}

/// A published message. The body is parsed as JSON only for filtering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub body: String,
}

impl Message {
    /// Message with the given body.
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }

    /// Message with a JSON-encoded body.
    pub fn json(payload: &impl Serialize) -> Result<Self> {
        Ok(Self {
            body: serde_json::to_string(payload)?,
        })
    }
}

impl From<&str> for Message {
    fn from(body: &str) -> Self {
        Message::new(body)
    }
}

impl From<String> for Message {
    fn from(body: String) -> Self {
        Message::new(body)
    }
}

/// Reject empty or whitespace-only topics, and topics containing the
/// compound-key separator.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.trim().is_empty() {
        return Err(CoreError::Validation("topic is empty".into()));
    }
    if topic.contains(KEY_SEPARATOR) {
        return Err(CoreError::Validation(format!(
            "topic {:?} contains the reserved separator U+001F",
            topic
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_uri_joins_key() {
        let id = EntityId::actor("fabric:/app/Sensors/", "sensor-7").unwrap();
        assert_eq!(id.entity_uri(), "fabric:/app/Sensors/sensor-7");
        assert_eq!(id.kind(), EntityKind::Actor);
        assert_eq!(id.node(), UNKNOWN_NODE);
    }

    #[test]
    fn test_service_uri_with_and_without_partition() {
        let partitioned = EntityId::service("fabric:/app/Feed", Some(-4)).unwrap();
        assert_eq!(partitioned.entity_uri(), "fabric:/app/Feed/-4");

        let singleton = EntityId::service("fabric:/app/Feed", None).unwrap();
        assert_eq!(singleton.entity_uri(), "fabric:/app/Feed");
    }

    #[test]
    fn test_actor_requires_key() {
        assert!(matches!(
            EntityId::actor("fabric:/app/Sensors", ""),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            EntityId::service("  ", None),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn test_equality_ignores_node() {
        let a = EntityId::actor("fabric:/app/Sensors", "1").unwrap().with_node("n1");
        let b = EntityId::actor("fabric:/app/Sensors", "1").unwrap().with_node("n2");
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_short_form_drops_node() {
        let id = EntityId::actor("fabric:/app/Sensors", "1").unwrap().with_node("node-3");
        let short = id.to_short();
        let json = serde_json::to_value(&short).unwrap();
        assert!(json.get("node").is_none());

        let back = short.to_entity_id().unwrap();
        assert_eq!(back, id);
        assert_eq!(back.node(), UNKNOWN_NODE);
    }

    #[test]
    fn test_serde_keeps_node_and_validates() {
        let id = EntityId::service("fabric:/app/Feed", Some(2)).unwrap().with_node("node-1");
        let json = serde_json::to_string(&id).unwrap();
        let back: EntityId = serde_json::from_str(&json).unwrap();
        assert_eq!(back.node(), "node-1");
        assert_eq!(back.partition_key(), Some(2));

        let bad = r#"{"kind":"actor","service_address":"fabric:/app/Sensors"}"#;
        assert!(serde_json::from_str::<EntityId>(bad).is_err());
    }

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("prices").is_ok());
        assert!(validate_topic("   ").is_err());
        assert!(matches!(
            validate_topic("a\u{1f}b"),
            Err(CoreError::Validation(_))
        ));
    }
}
