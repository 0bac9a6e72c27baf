//! Transactional keyed storage.
//!
//! State owned by registry partitions, mailbox partitions and endpoints lives
//! behind [`TransactionalStore`]: `(collection, key) → bytes` with
//! read-modify-commit transactions. Conflicts are detected per key, so two
//! transactions touching different keys of the same topic never collide.
//!
//! - [`MemoryStore`]: optimistic in-memory store
//! - [`FileStore`]: memory store persisted to a checksummed snapshot file

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Separator between the parts of a compound key.
pub const KEY_SEPARATOR: char = '\u{1f}';

/// Source of transactions over a keyed store.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// One read-modify-commit scope. Dropping without commit discards writes.
#[async_trait]
pub trait Transaction: Send {
    async fn get(&mut self, collection: &str, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&mut self, collection: &str, key: &str, value: Vec<u8>) -> Result<()>;

    /// Returns whether the key existed.
    async fn delete(&mut self, collection: &str, key: &str) -> Result<bool>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn scan_prefix(
        &mut self,
        collection: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>>;

    /// Commit atomically. A concurrent change to any key read by this
    /// transaction fails the commit with a transient error.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Encode a stored value as MessagePack.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Decode a stored value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Join key parts with [`KEY_SEPARATOR`].
pub fn compound_key(parts: &[&str]) -> String {
    let mut key = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(part);
    }
    key
}

/// Prefix selecting every compound key that starts with `part`.
pub fn key_prefix(part: &str) -> String {
    let mut prefix = String::with_capacity(part.len() + 1);
    prefix.push_str(part);
    prefix.push(KEY_SEPARATOR);
    prefix
}

/// Everything after the first separator of a compound key. Topics never
/// contain the separator, so this is the entity part of a `topic, uri` key.
pub fn key_suffix(key: &str) -> &str {
    key.split_once(KEY_SEPARATOR).map_or(key, |(_, rest)| rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compound_keys() {
        let key = compound_key(&["prices", "fabric:/app/a/1"]);
        assert!(key.starts_with(&key_prefix("prices")));
        assert!(!key.starts_with(&key_prefix("price")));
        assert_eq!(key_suffix(&key), "fabric:/app/a/1");
    }

    #[test]
    fn test_encode_decode() {
        let bytes = encode(&vec!["a".to_string(), "b".to_string()]).unwrap();
        let back: Vec<String> = decode(&bytes).unwrap();
        assert_eq!(back, vec!["a", "b"]);
    }
}
