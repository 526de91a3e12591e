//! Tests of the height sequencer, driven directly without any threads.

use std::{
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
    time::Duration,
};

use borsh::BorshSerialize;
use schain_consensus::{
    binary_consensus::{block_consensus::HeightDecision, coin::HashCoin, messages::Outbound},
    chain::{ChainConfiguration, ChainState},
    errors::{ChainError, InvariantViolation, RejectReason},
    events::Event,
    storage::block_key,
    transactions::{TransactionStore, TransactionStoreConfiguration},
    types::{
        basic::*,
        block::{BlockProposal, CommittedBlock},
        transaction::Transaction,
    },
};

mod common;

use common::{app::RecordingApp, mem_store::MemStore, node::peer_set};

const SCHAIN_ID: SchainId = SchainId::new(7);
const ME: NodeId = NodeId::new(1);

struct Fixture {
    chain: ChainState<MemStore, RecordingApp>,
    app: RecordingApp,
    events: Receiver<Event>,
}

fn fixture(store: MemStore) -> Fixture {
    let app = RecordingApp::new();
    let (event_publisher, events) = mpsc::channel();
    let transactions = Arc::new(TransactionStore::new(TransactionStoreConfiguration {
        max_transactions_per_block: 1000,
        committed_transactions_history: 1000,
        empty_block_interval: Duration::ZERO,
        known_transactions_retention: 16,
    }));
    let chain = ChainState::new(
        ChainConfiguration {
            schain_id: SCHAIN_ID,
            node_id: ME,
            proposer_index: ProposerIndex::new(1),
            peers: peer_set(4),
            committed_block_storage_size: 10,
            deferred_message_capacity: 1000,
            retransmit_interval: Duration::ZERO,
        },
        transactions,
        store,
        Arc::new(app.clone()),
        Arc::new(HashCoin::new(SCHAIN_ID)),
        Some(event_publisher),
    );
    Fixture { chain, app, events }
}

fn proposal(height: u64, proposer: u64, payloads: &[&[u8]], timestamp: Timestamp) -> BlockProposal {
    BlockProposal::new(
        SCHAIN_ID,
        BlockHeight::new(height),
        ProposerIndex::new(proposer),
        payloads.iter().map(|payload| Transaction::new(payload.to_vec())).collect(),
        timestamp,
    )
}

// Committed blocks for heights `from..=to`, with old but increasing timestamps.
fn committed_blocks(from: u64, to: u64) -> Vec<CommittedBlock> {
    (from..=to)
        .map(|h| {
            let payload = format!("tx at {}", h).into_bytes();
            CommittedBlock::new(proposal(
                h,
                2,
                &[&payload],
                Timestamp::new(PROTOCOL_EPOCH.millis() + 1000 * h),
            ))
        })
        .collect()
}

fn rejection(result: Result<impl std::fmt::Debug, ChainError>) -> RejectReason {
    match result {
        Err(ChainError::Rejected(reason)) => reason,
        other => panic!("expected a rejection, got {:?}", other),
    }
}

#[test]
fn quorum_of_proposals_starts_consensus_test() {
    let f = fixture(MemStore::new());
    let effects = f.chain.bootstrap().unwrap();
    assert_eq!(effects.proposals.len(), 1);
    assert_eq!(effects.proposals[0].height(), BlockHeight::new(1));
    assert_eq!(f.chain.proposals().count(BlockHeight::new(1)), 1);

    let effects = f
        .chain
        .on_proposal_arrived(NodeId::new(2), proposal(1, 2, &[b"a"], Timestamp::now()))
        .unwrap();
    assert!(effects.is_empty());
    assert!(!f.chain.is_consensus_started(BlockHeight::new(1)));

    let effects = f
        .chain
        .on_proposal_arrived(NodeId::new(3), proposal(1, 3, &[], Timestamp::now()))
        .unwrap();
    assert!(f.chain.is_consensus_started(BlockHeight::new(1)));
    assert!(!effects.outbound.is_empty());
    assert!(f.chain.router().has_instance(BlockHeight::new(1)));
}

#[test]
fn proposals_with_bad_headers_are_rejected_test() {
    let f = fixture(MemStore::new());
    f.chain.bootstrap().unwrap();
    let now = Timestamp::now();

    let wrong_chain = BlockProposal::new(
        SchainId::new(8),
        BlockHeight::new(1),
        ProposerIndex::new(2),
        Vec::new(),
        now,
    );
    assert_eq!(
        rejection(f.chain.on_proposal_arrived(NodeId::new(2), wrong_chain)),
        RejectReason::WrongSchain(SchainId::new(8))
    );
    assert_eq!(
        rejection(f.chain.on_proposal_arrived(NodeId::new(2), proposal(1, 9, &[], now))),
        RejectReason::UnknownProposer(ProposerIndex::new(9))
    );
    assert!(matches!(
        rejection(f.chain.on_proposal_arrived(NodeId::new(2), proposal(0, 2, &[], now))),
        RejectReason::TooLate { .. }
    ));
    assert!(matches!(
        rejection(f.chain.on_proposal_arrived(NodeId::new(2), proposal(1, 2, &[], PROTOCOL_EPOCH))),
        RejectReason::BeforeEpoch { .. }
    ));
    let far_future = now + Duration::from_secs(10);
    assert!(matches!(
        rejection(f.chain.on_proposal_arrived(NodeId::new(2), proposal(1, 2, &[], far_future))),
        RejectReason::TimestampInFuture { .. }
    ));
    assert_eq!(f.chain.proposals().count(BlockHeight::new(1)), 1);
}

#[test]
fn proposal_not_later_than_committed_block_is_rejected_test() {
    let f = fixture(MemStore::new());
    f.chain.bootstrap().unwrap();
    let committed_at = Timestamp::now();
    let block = CommittedBlock::new(proposal(1, 2, &[b"a"], committed_at));
    f.chain.on_catchup_blocks_arrived(vec![block]).unwrap();

    assert!(matches!(
        rejection(f.chain.on_proposal_arrived(NodeId::new(3), proposal(2, 3, &[], committed_at))),
        RejectReason::StaleTimestamp { .. }
    ));
}

#[test]
fn catchup_commits_in_order_and_cache_falls_through_to_store_test() {
    let f = fixture(MemStore::new());
    f.chain.bootstrap().unwrap();
    let blocks = committed_blocks(1, 12);

    let effects = f.chain.on_catchup_blocks_arrived(blocks.clone()).unwrap();

    assert_eq!(f.chain.committed_height(), BlockHeight::new(12));
    assert_eq!(effects.proposals.len(), 1);
    assert_eq!(effects.proposals[0].height(), BlockHeight::new(13));
    let heights: Vec<u64> = f.app.blocks().iter().map(|block| block.height.int()).collect();
    assert_eq!(heights, (1..=12).collect::<Vec<u64>>());

    assert_eq!(f.chain.cache().len(), 10);
    assert_eq!(
        f.chain.cache().range(),
        Some((BlockHeight::new(3), BlockHeight::new(12)))
    );
    assert!(f.chain.cache().get(BlockHeight::new(1)).is_none());
    assert_eq!(f.chain.get_block(BlockHeight::new(1)).unwrap(), Some(blocks[0].clone()));
    assert_eq!(f.chain.get_block(BlockHeight::new(12)).unwrap(), Some(blocks[11].clone()));
    assert_eq!(f.chain.get_block(BlockHeight::new(13)).unwrap(), None);
}

#[test]
fn committing_a_height_twice_is_a_no_op_test() {
    let f = fixture(MemStore::new());
    f.chain.bootstrap().unwrap();
    let blocks = committed_blocks(1, 3);

    f.chain.on_catchup_blocks_arrived(blocks.clone()).unwrap();
    let effects = f.chain.on_catchup_blocks_arrived(blocks).unwrap();
    f.chain
        .on_consensus_decided(HeightDecision {
            height: BlockHeight::new(2),
            winner: None,
        })
        .unwrap();

    assert!(effects.is_empty());
    assert_eq!(f.chain.committed_height(), BlockHeight::new(3));
    assert_eq!(f.app.blocks().len(), 3);
    let commit_events = f
        .events
        .try_iter()
        .filter(|event| matches!(event, Event::CommitBlock(_)))
        .count();
    assert_eq!(commit_events, 3);
}

#[test]
fn catchup_stops_at_gaps_and_bad_blocks_test() {
    let f = fixture(MemStore::new());
    f.chain.bootstrap().unwrap();

    let effects = f.chain.on_catchup_blocks_arrived(committed_blocks(2, 4)).unwrap();
    assert!(effects.is_empty());
    assert_eq!(f.chain.committed_height(), BlockHeight::new(0));

    let foreign = CommittedBlock::new(BlockProposal::new(
        SchainId::new(8),
        BlockHeight::new(1),
        ProposerIndex::new(2),
        Vec::new(),
        Timestamp::new(PROTOCOL_EPOCH.millis() + 1000),
    ));
    assert_eq!(
        rejection(f.chain.on_catchup_blocks_arrived(vec![foreign])),
        RejectReason::InvalidBlock(BlockHeight::new(1))
    );
    assert_eq!(f.chain.committed_height(), BlockHeight::new(0));
}

#[test]
fn decision_for_missing_proposal_waits_for_it_test() {
    let f = fixture(MemStore::new());
    f.chain.bootstrap().unwrap();
    let tx = Transaction::new(b"pending here".to_vec());
    assert!(f.chain.transactions().admit(tx.clone()));

    f.chain
        .on_consensus_decided(HeightDecision {
            height: BlockHeight::new(1),
            winner: Some(ProposerIndex::new(4)),
        })
        .unwrap();
    assert_eq!(f.chain.committed_height(), BlockHeight::new(0));

    let winner = proposal(1, 4, &[b"pending here"], Timestamp::now());
    let effects = f.chain.on_proposal_arrived(NodeId::new(4), winner.clone()).unwrap();

    assert_eq!(f.chain.committed_height(), BlockHeight::new(1));
    assert_eq!(
        f.chain.get_block(BlockHeight::new(1)).unwrap(),
        Some(CommittedBlock::new(winner))
    );
    assert_eq!(f.app.committed_payloads(), vec![b"pending here".to_vec()]);
    assert_eq!(f.chain.transactions().pending_count(), 0);
    assert!(f.chain.transactions().is_committed_full(&tx.hash()));
    assert_eq!(effects.proposals.len(), 1);
    assert_eq!(effects.proposals[0].height(), BlockHeight::new(2));
}

#[test]
fn next_height_proposals_not_later_than_new_block_are_discarded_test() {
    let f = fixture(MemStore::new());
    f.chain.bootstrap().unwrap();
    let early = Timestamp::now();
    f.chain
        .on_proposal_arrived(NodeId::new(2), proposal(2, 2, &[b"early"], early))
        .unwrap();
    f.chain
        .on_proposal_arrived(NodeId::new(3), proposal(2, 3, &[b"late"], early + Duration::from_millis(800)))
        .unwrap();
    assert_eq!(f.chain.proposals().count(BlockHeight::new(2)), 2);

    let block = CommittedBlock::new(proposal(1, 4, &[b"a"], early + Duration::from_millis(500)));
    f.chain.on_catchup_blocks_arrived(vec![block]).unwrap();

    assert!(!f.chain.proposals().has_proposal(BlockHeight::new(2), ProposerIndex::new(2)));
    assert!(f.chain.proposals().has_proposal(BlockHeight::new(2), ProposerIndex::new(3)));
    // Our own proposal for height 2, made after the commit.
    assert!(f.chain.proposals().has_proposal(BlockHeight::new(2), ProposerIndex::new(1)));
    assert_eq!(f.chain.proposals().count(BlockHeight::new(2)), 2);
}

#[test]
fn decided_proposal_with_stale_timestamp_commits_empty_block_test() {
    let f = fixture(MemStore::new());
    f.chain.bootstrap().unwrap();
    let early = Timestamp::now();
    let block = CommittedBlock::new(proposal(1, 4, &[b"a"], early + Duration::from_millis(500)));
    f.chain.on_catchup_blocks_arrived(vec![block.clone()]).unwrap();

    let stale = proposal(2, 2, &[b"stale"], early);
    assert!(matches!(
        rejection(f.chain.on_proposal_arrived(NodeId::new(2), stale.clone())),
        RejectReason::StaleTimestamp { .. }
    ));

    f.chain
        .on_consensus_decided(HeightDecision {
            height: BlockHeight::new(2),
            winner: Some(ProposerIndex::new(2)),
        })
        .unwrap();
    assert_eq!(f.chain.committed_height(), BlockHeight::new(1));
    assert!(f
        .chain
        .awaits_decided_proposal(BlockHeight::new(2), ProposerIndex::new(2)));

    let effects = f.chain.on_proposal_arrived(NodeId::new(2), stale).unwrap();

    assert_eq!(f.chain.committed_height(), BlockHeight::new(2));
    let committed = f.chain.get_block(BlockHeight::new(2)).unwrap().unwrap();
    assert!(committed.is_empty_block());
    assert_eq!(
        committed.timestamp(),
        Timestamp::new(block.timestamp().millis() + 1)
    );
    assert!(!f.app.committed_payloads().contains(&b"stale".to_vec()));
    assert_eq!(effects.proposals[0].height(), BlockHeight::new(3));
}

#[test]
fn tick_resends_running_consensus_messages_test() {
    let f = fixture(MemStore::new());
    f.chain.bootstrap().unwrap();
    let now = Timestamp::now();
    f.chain
        .on_proposal_arrived(NodeId::new(2), proposal(1, 2, &[], now))
        .unwrap();
    f.chain
        .on_proposal_arrived(NodeId::new(3), proposal(1, 3, &[], now))
        .unwrap();
    assert!(f.chain.is_consensus_started(BlockHeight::new(1)));

    // With a zero interval, every tick is due.
    let effects = f.chain.tick().unwrap();
    assert!(!effects.outbound.is_empty());
    assert!(effects.outbound.iter().all(|out| match out {
        Outbound::Broadcast(msg) => msg.height == BlockHeight::new(1),
        Outbound::SendTo(..) => false,
    }));
}

#[test]
fn all_proposers_rejected_commits_empty_block_test() {
    let f = fixture(MemStore::new());
    f.chain.bootstrap().unwrap();

    f.chain
        .on_consensus_decided(HeightDecision {
            height: BlockHeight::new(1),
            winner: None,
        })
        .unwrap();

    let block = f.chain.get_block(BlockHeight::new(1)).unwrap().unwrap();
    assert!(block.is_empty_block());
    assert!(block.transactions().is_empty());
    assert_eq!(block.timestamp(), Timestamp::new(PROTOCOL_EPOCH.millis() + 1));
    assert_eq!(f.app.blocks()[0].timestamp, block.timestamp());
}

#[test]
fn decision_out_of_order_is_fatal_test() {
    let f = fixture(MemStore::new());
    f.chain.bootstrap().unwrap();

    let err = f
        .chain
        .on_consensus_decided(HeightDecision {
            height: BlockHeight::new(3),
            winner: None,
        })
        .unwrap_err();

    assert!(err.is_fatal());
    assert!(matches!(
        err,
        ChainError::Invariant(InvariantViolation::DecisionOutOfOrder { .. })
    ));
}

#[test]
fn bootstrap_restores_committed_chain_test() {
    let store = MemStore::new();
    let blocks = committed_blocks(1, 12);
    {
        let f = fixture(store.clone());
        f.chain.bootstrap().unwrap();
        f.chain.on_catchup_blocks_arrived(blocks.clone()).unwrap();
    }

    let f = fixture(store);
    let effects = f.chain.bootstrap().unwrap();

    assert_eq!(f.chain.committed_height(), BlockHeight::new(12));
    assert_eq!(f.chain.committed_timestamp(), blocks[11].timestamp());
    assert_eq!(f.chain.cache().len(), 10);
    assert_eq!(effects.proposals[0].height(), BlockHeight::new(13));
    assert_eq!(f.chain.get_block(BlockHeight::new(2)).unwrap(), Some(blocks[1].clone()));
    // Restoring does not replay blocks into the application.
    assert!(f.app.blocks().is_empty());
    // Committed transactions of every restored block are remembered, so they cannot be admitted
    // again.
    for block in &blocks[2..] {
        assert!(!f.chain.transactions().admit(block.transactions()[0].clone()));
    }
}

#[test]
fn bootstrap_detects_corrupted_store_test() {
    let store = MemStore::new();
    let blocks = committed_blocks(1, 12);
    {
        let f = fixture(store.clone());
        f.chain.bootstrap().unwrap();
        f.chain.on_catchup_blocks_arrived(blocks.clone()).unwrap();
    }
    store.put(
        &block_key(ME, BlockHeight::new(12)),
        &blocks[2].try_to_vec().unwrap(),
    );

    let f = fixture(store);
    let err = f.chain.bootstrap().unwrap_err();

    assert!(err.is_fatal());
    assert!(matches!(
        err,
        ChainError::Invariant(InvariantViolation::CorruptedStoredBlock(height)) if height == BlockHeight::new(12)
    ));
}
