//! Tests of quorum arithmetic, the peer set, the proposal store and the committed block cache.

use schain_consensus::{
    chain::CommittedBlockCache,
    proposals::ProposalStore,
    types::{
        basic::*,
        block::{BlockProposal, CommittedBlock},
        peers::PeerSet,
        transaction::Transaction,
    },
};

const SCHAIN_ID: SchainId = SchainId::new(7);

fn proposal(height: u64, proposer: u64, payload: &[u8]) -> BlockProposal {
    BlockProposal::new(
        SCHAIN_ID,
        BlockHeight::new(height),
        ProposerIndex::new(proposer),
        vec![Transaction::new(payload.to_vec())],
        Timestamp::now(),
    )
}

#[test]
fn two_thirds_quorum_test() {
    assert!(two_thirds(3, 4));
    assert!(!two_thirds(2, 4));
    assert!(two_thirds(1, 1));
    assert!(!two_thirds(4, 7));
    assert!(two_thirds(5, 7));
    assert!(!two_thirds(0, 1));
}

#[test]
fn peer_set_assigns_proposer_indices_from_one_test() {
    let peers = PeerSet::new([NodeId::new(10), NodeId::new(20), NodeId::new(10), NodeId::new(30)]);

    assert_eq!(peers.len(), 3);
    assert_eq!(peers.index_of(&NodeId::new(10)), Some(ProposerIndex::new(1)));
    assert_eq!(peers.index_of(&NodeId::new(30)), Some(ProposerIndex::new(3)));
    assert_eq!(peers.node_of(ProposerIndex::new(2)), Some(NodeId::new(20)));
    assert_eq!(peers.node_of(ProposerIndex::new(0)), None);
    assert_eq!(peers.node_of(ProposerIndex::new(4)), None);
    assert_eq!(
        peers.others(NodeId::new(20)).collect::<Vec<_>>(),
        vec![NodeId::new(10), NodeId::new(30)]
    );
    assert_eq!(PeerSet::new((1..=4).map(NodeId::new)).max_faulty(), 1);
    assert_eq!(PeerSet::new((1..=7).map(NodeId::new)).max_faulty(), 2);
}

#[test]
fn add_proposal_reports_the_quorum_crossing_once_test() {
    let store = ProposalStore::new(4);
    assert!(!store.add_proposal(proposal(1, 1, b"a")));
    assert!(!store.add_proposal(proposal(1, 2, b"b")));
    assert!(!store.has_two_thirds(BlockHeight::new(1)));
    assert!(store.add_proposal(proposal(1, 3, b"c")));
    assert!(store.has_two_thirds(BlockHeight::new(1)));
    assert!(!store.add_proposal(proposal(1, 4, b"d")));
    assert_eq!(store.count(BlockHeight::new(1)), 4);
}

#[test]
fn second_proposal_from_same_proposer_is_ignored_test() {
    let store = ProposalStore::new(4);
    let first = proposal(1, 2, b"first");
    store.add_proposal(first.clone());

    assert!(!store.add_proposal(proposal(1, 2, b"second")));
    assert_eq!(store.count(BlockHeight::new(1)), 1);
    assert_eq!(
        store.get_proposal(BlockHeight::new(1), ProposerIndex::new(2)),
        Some(first)
    );
}

#[test]
fn vote_vector_and_cleanup_test() {
    let store = ProposalStore::new(4);
    store.add_proposal(proposal(1, 2, b"a"));
    store.add_proposal(proposal(1, 4, b"b"));
    store.add_proposal(proposal(2, 1, b"c"));

    assert_eq!(
        store.get_vote_vector(BlockHeight::new(1)),
        vec![false, true, false, true]
    );
    assert_eq!(store.get_vote_vector(BlockHeight::new(5)), vec![false; 4]);

    store.clean_old(BlockHeight::new(2));
    assert_eq!(store.count(BlockHeight::new(1)), 0);
    assert!(store.has_proposal(BlockHeight::new(2), ProposerIndex::new(1)));
}

#[test]
fn block_cache_keeps_the_newest_blocks_test() {
    let cache = CommittedBlockCache::new(10);
    assert_eq!(cache.range(), None);
    for height in 1..=15 {
        cache.insert(CommittedBlock::new(proposal(height, 1, &[height as u8])));
    }

    assert_eq!(cache.len(), 10);
    assert_eq!(cache.range(), Some((BlockHeight::new(6), BlockHeight::new(15))));
    assert!(cache.get(BlockHeight::new(5)).is_none());
    assert_eq!(
        cache.get(BlockHeight::new(15)).map(|block| block.height()),
        Some(BlockHeight::new(15))
    );
}

#[test]
fn empty_block_is_deterministic_test() {
    let previous = Timestamp::new(PROTOCOL_EPOCH.millis() + 500);
    let a = CommittedBlock::empty(SCHAIN_ID, BlockHeight::new(3), previous);
    let b = CommittedBlock::empty(SCHAIN_ID, BlockHeight::new(3), previous);

    assert_eq!(a, b);
    assert!(a.is_empty_block());
    assert_eq!(a.timestamp(), Timestamp::new(previous.millis() + 1));
    assert_eq!(
        CommittedBlock::empty(SCHAIN_ID, BlockHeight::new(1), Timestamp::new(0)).timestamp(),
        Timestamp::new(PROTOCOL_EPOCH.millis() + 1)
    );
}
