/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The fixed, pre-configured table of nodes taking part in consensus.

use std::collections::HashMap;

use crate::types::basic::{two_thirds, NodeId, ProposerIndex};

/// Maps each node's network identity to its [`ProposerIndex`]. The node listed first gets index 1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSet {
    nodes: Vec<NodeId>,
    indices: HashMap<NodeId, ProposerIndex>,
}

impl PeerSet {
    /// Build a peer set from nodes in proposer-index order. Repeated node ids are kept only once.
    pub fn new(nodes: impl IntoIterator<Item = NodeId>) -> PeerSet {
        let mut peer_set = PeerSet {
            nodes: Vec::new(),
            indices: HashMap::new(),
        };
        for node in nodes {
            if !peer_set.indices.contains_key(&node) {
                peer_set.nodes.push(node);
                let index = ProposerIndex::new(peer_set.nodes.len() as u64);
                peer_set.indices.insert(node, index);
            }
        }
        peer_set
    }

    /// N, the number of nodes.
    pub fn len(&self) -> u64 {
        self.nodes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.indices.contains_key(node)
    }

    pub fn index_of(&self, node: &NodeId) -> Option<ProposerIndex> {
        self.indices.get(node).copied()
    }

    pub fn node_of(&self, index: ProposerIndex) -> Option<NodeId> {
        if index.int() == 0 {
            return None;
        }
        self.nodes.get(index.int() as usize - 1).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProposerIndex, NodeId)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (ProposerIndex::new(i as u64 + 1), *node))
    }

    /// All nodes other than `me`.
    pub fn others(&self, me: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().copied().filter(move |node| *node != me)
    }

    /// The largest number of faulty nodes the set tolerates, `(N - 1) / 3`.
    pub fn max_faulty(&self) -> u64 {
        self.len().saturating_sub(1) / 3
    }

    pub fn is_quorum(&self, count: u64) -> bool {
        two_thirds(count, self.len())
    }
}
