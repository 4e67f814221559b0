use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity of a fleet member, `"<host>:<port>"`.
pub type NodeId = String;

/// Dense mapping of node identity to shard index over `[0, N)`.
///
/// Built only by [`allocate`], so every node that sees the same member set
/// computes the same table:
/// - identities are sorted lexicographically before enumeration
/// - duplicates collapse to a single entry
/// - the value set is exactly `0..len()`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardAssignment {
    shards: BTreeMap<NodeId, u32>,
}

impl ShardAssignment {
    /// An empty table, the state observed while a rebalance is underway.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Shard index assigned to `node`, if it took part in the last rebalance.
    pub fn shard_of(&self, node: &str) -> Option<u32> {
        self.shards.get(node).copied()
    }

    /// The node holding shard 0.
    pub fn leader(&self) -> Option<&str> {
        self.shards.keys().next().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Entries in shard order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.shards.iter().map(|(node, shard)| (node.as_str(), *shard))
    }
}

/// Compute the shard table for a member set.
///
/// The input order is irrelevant; the membership collaborator makes no
/// promise that two nodes read members in the same order.
pub fn allocate<S: AsRef<str>>(members: &[S]) -> ShardAssignment {
    let mut sorted: Vec<&str> = members.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let shards = sorted
        .into_iter()
        .enumerate()
        .map(|(index, node)| (node.to_string(), index as u32))
        .collect();

    ShardAssignment { shards }
}
