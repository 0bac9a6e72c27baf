//! Deterministic hash routing of keys onto partitions.
//!
//! Partition indexes are 1-based. The mapping is stable across process
//! restarts but not across changes of the partition count.

use crate::error::{CoreError, Result};

/// Seed for the routing hash. Changing it reshuffles every topic.
const ROUTING_SEED: u32 = 0x0b5e_7a70;

/// Map `key` to a partition index in `[1, partition_count]`.
pub fn resolve(key: &str, partition_count: u32) -> Result<u32> {
    if partition_count == 0 {
        return Err(CoreError::Validation("partition count must be at least 1".into()));
    }
    Ok(routing_hash(key.as_bytes()) % partition_count + 1)
}

/// Seeded 32-bit CRC of the key bytes.
fn routing_hash(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(ROUTING_SEED);
    hasher.update(bytes);
    hasher.finalize()
}

/// Resolver bound to the current partition count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionResolver {
    partition_count: u32,
}

impl PartitionResolver {
    /// Resolver over `partition_count` partitions. Zero is a validation error.
    pub fn new(partition_count: u32) -> Result<Self> {
        if partition_count == 0 {
            return Err(CoreError::Validation("partition count must be at least 1".into()));
        }
        Ok(Self { partition_count })
    }

    /// Number of partitions keys are spread over.
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Partition index in `[1, partition_count]` for `key`.
    pub fn resolve(&self, key: &str) -> u32 {
        routing_hash(key.as_bytes()) % self.partition_count + 1
    }

    /// Every partition index, in order.
    pub fn partitions(&self) -> impl Iterator<Item = u32> {
        1..=self.partition_count
    }
}

impl Default for PartitionResolver {
    fn default() -> Self {
        Self { partition_count: 3 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_resolve_is_deterministic() {
        let first = resolve("prices/eu", 3).unwrap();
        for _ in 0..10 {
            assert_eq!(resolve("prices/eu", 3).unwrap(), first);
        }
        assert_eq!(PartitionResolver::new(3).unwrap().resolve("prices/eu"), first);
    }

    #[test]
    fn test_all_partitions_used() {
        let mut counts = [0usize; 3];
        for i in 0..1000 {
            let p = resolve(&format!("topic-{}", i), 3).unwrap();
            counts[(p - 1) as usize] += 1;
        }
        assert!(counts.iter().all(|&c| c > 0), "counts: {:?}", counts);
    }

    #[test]
    fn test_zero_partitions_rejected() {
        assert!(matches!(resolve("t", 0), Err(CoreError::Validation(_))));
        assert!(PartitionResolver::new(0).is_err());
    }

    #[test]
    fn test_single_partition() {
        assert_eq!(resolve("", 1).unwrap(), 1);
        assert_eq!(resolve("anything", 1).unwrap(), 1);
    }

    proptest! {
        #[test]
        fn prop_resolve_in_range(key in ".*", count in 1u32..64) {
            let p = resolve(&key, count).unwrap();
            prop_assert!(p >= 1 && p <= count);
            prop_assert_eq!(p, resolve(&key, count).unwrap());
        }
    }
}
