//! Consistent hash ring.

use tracing::debug;

use crate::error::{Result, ShardlimitError};

/// Default number of virtual positions per shard.
pub const DEFAULT_REPLICAS: usize = 128;
/// Upper bound on virtual positions per shard.
pub const MAX_REPLICAS: usize = 4096;

/// A named shard and its handle.
#[derive(Debug, Clone)]
pub struct ShardNode<T> {
    /// Stable identifier; ring positions are derived from it.
    pub id: String,
    pub handle: T,
}

impl<T> ShardNode<T> {
    pub fn new(id: impl Into<String>, handle: T) -> Self {
        Self {
            id: id.into(),
            handle,
        }
    }
}

/// Immutable hash ring mapping keys to shards.
///
/// Each shard occupies `replicas` positions, hashed from `"{id}#{i}"`. A key
/// belongs to the first position clockwise from its own hash. Two
/// positions that collide are both kept; whichever sorts first wins.
#[derive(Debug, Clone)]
pub struct HashRing<T> {
    replicas: usize,
    /// (position hash, index into `nodes`), sorted by hash
    positions: Vec<(u32, usize)>,
    nodes: Vec<ShardNode<T>>,
}

impl<T> HashRing<T> {
    /// Build a ring. `replicas == 0` selects [`DEFAULT_REPLICAS`].
    pub fn new(nodes: Vec<ShardNode<T>>, replicas: usize) -> Result<Self> {
        if nodes.is_empty() {
            return Err(ShardlimitError::Config("no shards provided".to_string()));
        }
        let replicas = if replicas == 0 {
            DEFAULT_REPLICAS
        } else {
            replicas
        };
        if replicas > MAX_REPLICAS {
            return Err(ShardlimitError::Config(format!(
                "{replicas} replicas per shard exceeds the limit of {MAX_REPLICAS}"
            )));
        }

        let total = nodes.len().checked_mul(replicas).ok_or_else(|| {
            ShardlimitError::Config(format!(
                "{} shards with {} replicas overflow the ring",
                nodes.len(),
                replicas
            ))
        })?;
        let mut positions = Vec::with_capacity(total);
        for (index, node) in nodes.iter().enumerate() {
            if node.id.is_empty() {
                return Err(ShardlimitError::Config(format!(
                    "shard at position {index} has an empty id"
                )));
            }
            for i in 0..replicas {
                positions.push((hash_key(&format!("{}#{}", node.id, i)), index));
            }
        }
        positions.sort_unstable();

        debug!(
            shards = nodes.len(),
            replicas = replicas,
            positions = positions.len(),
            "Built hash ring"
        );

        Ok(Self {
            replicas,
            positions,
            nodes,
        })
    }

    /// The shard responsible for `key`.
    pub fn pick(&self, key: &str) -> Result<&ShardNode<T>> {
        if self.positions.is_empty() {
            return Err(ShardlimitError::Routing("hash ring is empty".to_string()));
        }

        let hash = hash_key(key);
        let mut idx = self.positions.partition_point(|&(h, _)| h < hash);
        if idx == self.positions.len() {
            idx = 0;
        }

        let (_, node_index) = self.positions[idx];
        self.nodes.get(node_index).ok_or_else(|| {
            ShardlimitError::Routing(format!("no shard for ring position {idx}"))
        })
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Number of physical shards.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[ShardNode<T>] {
        &self.nodes
    }
}

/// CRC32 (IEEE) of the key bytes.
pub fn hash_key(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(ids: &[&str], replicas: usize) -> HashRing<String> {
        let nodes = ids
            .iter()
            .map(|id| ShardNode::new(*id, id.to_string()))
            .collect();
        HashRing::new(nodes, replicas).unwrap()
    }

    #[test]
    fn test_hash_is_crc32_ieee() {
        // standard CRC-32 check value
        assert_eq!(hash_key("123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_empty_shard_set_rejected() {
        let err = HashRing::<String>::new(Vec::new(), 16).unwrap_err();
        assert!(matches!(err, ShardlimitError::Config(_)));
    }

    #[test]
    fn test_empty_shard_id_rejected() {
        let nodes = vec![ShardNode::new("a", 1), ShardNode::new("", 2)];
        let err = HashRing::new(nodes, 16).unwrap_err();
        assert!(matches!(err, ShardlimitError::Config(_)));
    }

    #[test]
    fn test_oversized_replica_count_rejected() {
        let nodes = vec![ShardNode::new("a", 1), ShardNode::new("b", 2)];
        let err = HashRing::new(nodes, usize::MAX).unwrap_err();
        assert!(matches!(err, ShardlimitError::Config(_)));

        let nodes = vec![ShardNode::new("a", 1)];
        assert!(HashRing::new(nodes, MAX_REPLICAS + 1).is_err());
    }

    #[test]
    fn test_replica_limit_is_inclusive() {
        let ring = ring(&["a"], MAX_REPLICAS);
        assert_eq!(ring.positions.len(), MAX_REPLICAS);
    }

    #[test]
    fn test_zero_replicas_uses_default() {
        let ring = ring(&["a", "b"], 0);
        assert_eq!(ring.replicas(), DEFAULT_REPLICAS);
        assert_eq!(ring.positions.len(), 2 * DEFAULT_REPLICAS);
    }

    #[test]
    fn test_positions_are_sorted() {
        let ring = ring(&["a", "b", "c"], 64);
        assert!(ring.positions.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn test_lookup_walks_clockwise() {
        let ring = ring(&["a", "b", "c"], 8);
        let key = "alice:/resource";
        let hash = hash_key(key);

        let expected = ring
            .positions
            .iter()
            .find(|(h, _)| *h >= hash)
            .unwrap_or(&ring.positions[0])
            .1;

        assert_eq!(ring.pick(key).unwrap().id, ring.nodes[expected].id);
    }

    #[test]
    fn test_lookup_wraps_past_last_position() {
        let ring = ring(&["a", "b"], 4);
        let (_, first_node) = ring.positions[0];
        let last_hash = ring.positions.last().unwrap().0;

        // find a key hashing beyond every position
        let key = (0..1_000_000)
            .map(|i| format!("k{i}"))
            .find(|k| hash_key(k) > last_hash)
            .expect("some key hashes past the last position");

        assert_eq!(ring.pick(&key).unwrap().id, ring.nodes[first_node].id);
    }

    #[test]
    fn test_single_shard_takes_everything() {
        let ring = ring(&["only"], 16);
        for i in 0..100 {
            assert_eq!(ring.pick(&format!("key-{i}")).unwrap().id, "only");
        }
    }
}
