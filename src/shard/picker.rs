//! Shard selection for the distributed limiter.

use crate::error::{Result, ShardlimitError};

use super::ring::{HashRing, ShardNode};

/// Chooses the shard that owns a key.
///
/// A single shard needs no ring; every key maps to it.
#[derive(Debug, Clone)]
pub enum ShardPicker<T> {
    Static(ShardNode<T>),
    Ring(HashRing<T>),
}

impl<T> ShardPicker<T> {
    /// Static picker for one shard, ring for more.
    pub fn from_nodes(mut nodes: Vec<ShardNode<T>>, replicas: usize) -> Result<Self> {
        if nodes.len() == 1 {
            let node = nodes.remove(0);
            if node.id.is_empty() {
                return Err(ShardlimitError::Config(
                    "shard at position 0 has an empty id".to_string(),
                ));
            }
            return Ok(ShardPicker::Static(node));
        }
        HashRing::new(nodes, replicas).map(ShardPicker::Ring)
    }

    /// The shard responsible for `key`.
    pub fn pick(&self, key: &str) -> Result<&ShardNode<T>> {
        match self {
            ShardPicker::Static(node) => Ok(node),
            ShardPicker::Ring(ring) => ring.pick(key),
        }
    }

    /// Number of physical shards.
    pub fn shard_count(&self) -> usize {
        match self {
            ShardPicker::Static(_) => 1,
            ShardPicker::Ring(ring) => ring.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shard_builds_static_picker() {
        let picker = ShardPicker::from_nodes(vec![ShardNode::new("redis-0", 0u8)], 128).unwrap();
        assert!(matches!(picker, ShardPicker::Static(_)));
        assert_eq!(picker.pick("anything").unwrap().id, "redis-0");
        assert_eq!(picker.shard_count(), 1);
    }

    #[test]
    fn test_many_shards_build_ring() {
        let nodes = vec![ShardNode::new("a", 0u8), ShardNode::new("b", 1u8)];
        let picker = ShardPicker::from_nodes(nodes, 32).unwrap();
        assert!(matches!(picker, ShardPicker::Ring(_)));
        assert_eq!(picker.shard_count(), 2);
    }

    #[test]
    fn test_no_shards_rejected() {
        let err = ShardPicker::<u8>::from_nodes(Vec::new(), 32).unwrap_err();
        assert!(matches!(err, ShardlimitError::Config(_)));
    }
}
