//! Request/response envelopes and their checksummed frame encoding.
//!
//! Frame layout: `len (u32 LE) | MessagePack body | crc32 (u32 LE)`.

use crate::error::{CoreError, Result};
use crate::types::{EntityId, Message};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Every operation a hosted entity or partition can be asked to perform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    // --- Observable-facing ---
    RegisterObserver {
        topic: String,
        filters: Vec<String>,
        observer: EntityId,
    },
    UnregisterObserver {
        topic: String,
        observer: EntityId,
    },

    // --- Peer relay ---
    NotifyObserver {
        topic: String,
        message: Message,
        observable: EntityId,
        remainder: Option<Vec<EntityId>>,
    },
    UnregisterObservableNotice {
        topic: String,
        observable: EntityId,
        remainder: Option<Vec<EntityId>>,
    },

    // --- Directory ---
    RegisterObservableInDirectory {
        topic: String,
        id: EntityId,
    },
    UnregisterObservableInDirectory {
        topic: String,
        id: EntityId,
    },
    QueryObservables {
        topic: String,
        filter: Option<String>,
    },

    // --- Mailbox ---
    WriteMailbox {
        recipient: String,
        messages: Vec<Message>,
    },
    ReadMailbox {
        recipient: String,
    },

    // --- Identity ---
    GetEntityId,
}

impl Request {
    /// Short operation name for logs and retry diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Request::RegisterObserver { .. } => "register_observer",
            Request::UnregisterObserver { .. } => "unregister_observer",
            Request::NotifyObserver { .. } => "notify_observer",
            Request::UnregisterObservableNotice { .. } => "unregister_observable_notice",
            Request::RegisterObservableInDirectory { .. } => "register_observable_in_directory",
            Request::UnregisterObservableInDirectory { .. } => {
                "unregister_observable_in_directory"
            }
            Request::QueryObservables { .. } => "query_observables",
            Request::WriteMailbox { .. } => "write_mailbox",
            Request::ReadMailbox { .. } => "read_mailbox",
            Request::GetEntityId => "get_entity_id",
        }
    }
}

/// Successful reply to a [`Request`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ack,
    /// `None` when the topic has no directory entry.
    Observables { observables: Option<Vec<EntityId>> },
    Messages { messages: Vec<Message> },
    Entity { id: EntityId },
}

impl Response {
    /// Unwrap an `Observables` response.
    pub fn into_observables(self) -> Result<Option<Vec<EntityId>>> {
        match self {
            Response::Observables { observables } => Ok(observables),
            other => Err(unexpected("observables", &other)),
        }
    }

    /// Unwrap a `Messages` response.
    pub fn into_messages(self) -> Result<Vec<Message>> {
        match self {
            Response::Messages { messages } => Ok(messages),
            other => Err(unexpected("messages", &other)),
        }
    }

    /// Unwrap an `Entity` response.
    pub fn into_entity(self) -> Result<EntityId> {
        match self {
            Response::Entity { id } => Ok(id),
            other => Err(unexpected("entity", &other)),
        }
    }

    /// Check for an `Ack` response.
    pub fn into_ack(self) -> Result<()> {
        match self {
            Response::Ack => Ok(()),
            other => Err(unexpected("ack", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &Response) -> CoreError {
    CoreError::Remote(format!("expected {} response, got {:?}", expected, got))
}

/// Encode a value into a checksummed frame.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec_named(value)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(CoreError::Serialization(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }

    let mut frame = Vec::with_capacity(body.len() + 8);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(frame)
}

/// Decode a frame produced by [`encode_frame`].
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    if frame.len() < 8 {
        return Err(CoreError::Corruption("frame too short".into()));
    }
    let (len_bytes, rest) = frame.split_at(4);
    let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;

    if len > MAX_FRAME_LEN {
        return Err(CoreError::Corruption("frame too large".into()));
    }
    if rest.len() != len + 4 {
        return Err(CoreError::Corruption(format!(
            "frame length mismatch: header says {}, have {}",
            len,
            rest.len().saturating_sub(4)
        )));
    }

    let (body, checksum_bytes) = rest.split_at(len);
    let stored = u32::from_le_bytes([
        checksum_bytes[0],
        checksum_bytes[1],
        checksum_bytes[2],
        checksum_bytes[3],
    ]);
    if stored != crc32fast::hash(body) {
        return Err(CoreError::Corruption("frame checksum mismatch".into()));
    }

    Ok(rmp_serde::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observer(key: &str) -> EntityId {
        EntityId::actor("fabric:/app/Watchers", key)
            .unwrap()
            .with_node("node-2")
    }

    #[test]
    fn test_notify_frame_keeps_remainder_and_nodes() {
        let request = Request::NotifyObserver {
            topic: "prices".into(),
            message: Message::new(r#"{"id":10}"#),
            observable: EntityId::service("fabric:/app/Feed", Some(1)).unwrap(),
            remainder: Some(vec![observer("a"), observer("b")]),
        };

        let frame = encode_frame(&request).unwrap();
        let back: Request = decode_frame(&frame).unwrap();
        assert_eq!(back, request);

        if let Request::NotifyObserver { remainder, .. } = back {
            let remainder = remainder.unwrap();
            assert!(remainder.iter().all(|id| id.node() == "node-2"));
        }
    }

    #[test]
    fn test_corrupted_frame_rejected() {
        let frame = encode_frame(&Request::GetEntityId).unwrap();

        let mut flipped = frame.clone();
        flipped[5] ^= 0x01;
        assert!(matches!(
            decode_frame::<Request>(&flipped),
            Err(CoreError::Corruption(_))
        ));

        assert!(matches!(
            decode_frame::<Request>(&frame[..frame.len() - 1]),
            Err(CoreError::Corruption(_))
        ));
        assert!(matches!(decode_frame::<Request>(&[1, 2]), Err(CoreError::Corruption(_))));
    }

    #[test]
    fn test_response_accessors() {
        assert!(Response::Ack.into_ack().is_ok());
        assert!(matches!(
            Response::Ack.into_messages(),
            Err(CoreError::Remote(_))
        ));
        let messages = Response::Messages {
            messages: vec![Message::new("x")],
        }
        .into_messages()
        .unwrap();
        assert_eq!(messages.len(), 1);
    }
}
