//! Tests of message routing and deferral, with a handler that records what it is given.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use schain_consensus::{
    binary_consensus::messages::{BinaryConsensusMessage, BinaryMessageKind},
    router::{
        deferred::DeferredMessageQueue, ConsensusRouter, HandlerOutput, MessageHandler,
        RouteOutcome, MAX_ROUND_LEAD,
    },
    types::basic::{BlockHeight, NodeId, ProposerIndex, Round, SchainId},
};

struct RecordingHandler {
    height: BlockHeight,
    rounds: HashMap<ProposerIndex, Round>,
    decided: HashSet<ProposerIndex>,
    handled: Arc<Mutex<Vec<BinaryConsensusMessage>>>,
}

impl RecordingHandler {
    fn new(height: BlockHeight, handled: Arc<Mutex<Vec<BinaryConsensusMessage>>>) -> Self {
        RecordingHandler {
            height,
            rounds: (1..=4).map(|i| (ProposerIndex::new(i), Round::new(0))).collect(),
            decided: HashSet::new(),
            handled,
        }
    }
}

impl MessageHandler for RecordingHandler {
    fn height(&self) -> BlockHeight {
        self.height
    }

    fn round(&self, proposer: ProposerIndex) -> Option<Round> {
        self.rounds.get(&proposer).copied()
    }

    fn is_decided(&self, proposer: ProposerIndex) -> bool {
        self.decided.contains(&proposer)
    }

    fn handle(&mut self, msg: &BinaryConsensusMessage) -> HandlerOutput {
        self.handled.lock().unwrap().push(msg.clone());
        HandlerOutput::default()
    }
}

fn message(height: u64, proposer: u64, round: u64, sender: u64) -> BinaryConsensusMessage {
    BinaryConsensusMessage {
        schain_id: SchainId::new(7),
        height: BlockHeight::new(height),
        proposer_index: ProposerIndex::new(proposer),
        round: Round::new(round),
        kind: BinaryMessageKind::Bv,
        value: true,
        sender: NodeId::new(sender),
    }
}

#[test]
fn messages_for_settled_heights_are_dropped_test() {
    let router: ConsensusRouter<RecordingHandler> = ConsensusRouter::new(BlockHeight::new(5), 100, 4);
    assert!(matches!(router.route(message(5, 1, 0, 2)), RouteOutcome::Dropped));
    assert!(matches!(router.route(message(3, 1, 0, 2)), RouteOutcome::Dropped));
    assert_eq!(router.deferred_count(), 0);
}

#[test]
fn deferred_messages_are_replayed_in_arrival_order_test() {
    let handled = Arc::new(Mutex::new(Vec::new()));
    let router = ConsensusRouter::new(BlockHeight::new(0), 100, 4);

    let early = vec![message(1, 1, 0, 2), message(1, 2, 0, 3), message(1, 1, 1, 4)];
    for msg in &early {
        assert!(matches!(router.route(msg.clone()), RouteOutcome::Deferred));
    }
    assert_eq!(router.deferred_count_at(BlockHeight::new(1)), 3);

    let batch = router.start_consensus(RecordingHandler::new(BlockHeight::new(1), handled.clone()));

    assert_eq!(batch.processed, 3);
    assert_eq!(batch.deferred, 0);
    assert_eq!(*handled.lock().unwrap(), early);
    assert_eq!(router.deferred_count(), 0);
}

#[test]
fn rounds_more_than_one_ahead_are_deferred_test() {
    let handled = Arc::new(Mutex::new(Vec::new()));
    let router = ConsensusRouter::new(BlockHeight::new(0), 100, 4);
    router.start_consensus(RecordingHandler::new(BlockHeight::new(1), handled.clone()));

    assert!(matches!(router.route(message(1, 1, 1, 2)), RouteOutcome::Processed(_)));
    assert!(matches!(router.route(message(1, 1, 2, 2)), RouteOutcome::Deferred));
    assert!(matches!(router.route(message(2, 1, 0, 2)), RouteOutcome::Deferred));
    // No instance for proposer 9.
    assert!(matches!(router.route(message(1, 9, 0, 2)), RouteOutcome::Dropped));

    assert_eq!(handled.lock().unwrap().len(), 1);
    assert_eq!(router.deferred_count(), 2);
}

#[test]
fn decided_instances_receive_later_rounds_test() {
    let handled = Arc::new(Mutex::new(Vec::new()));
    let router = ConsensusRouter::new(BlockHeight::new(0), 100, 4);
    let mut handler = RecordingHandler::new(BlockHeight::new(1), handled.clone());
    handler.decided.insert(ProposerIndex::new(3));
    router.start_consensus(handler);

    assert!(matches!(router.route(message(1, 3, 7, 2)), RouteOutcome::Processed(_)));
    assert_eq!(handled.lock().unwrap().len(), 1);
}

#[test]
fn advancing_discards_settled_and_keeps_future_messages_test() {
    let handled = Arc::new(Mutex::new(Vec::new()));
    let router = ConsensusRouter::new(BlockHeight::new(0), 100, 4);
    router.route(message(2, 1, 0, 2));
    router.route(message(2, 2, 0, 2));
    router.route(message(3, 1, 0, 2));
    router.route(message(4, 1, 0, 2));
    assert_eq!(router.deferred_count(), 4);

    router.advance(BlockHeight::new(2));
    assert_eq!(router.committed(), BlockHeight::new(2));
    assert_eq!(router.deferred_count_at(BlockHeight::new(2)), 0);
    // Height 3 is next, but has no instance yet.
    assert_eq!(router.deferred_count_at(BlockHeight::new(3)), 1);
    assert_eq!(router.deferred_count_at(BlockHeight::new(4)), 1);

    let batch = router.start_consensus(RecordingHandler::new(BlockHeight::new(3), handled.clone()));
    assert_eq!(batch.processed, 1);
    assert_eq!(router.deferred_count(), 1);

    // A handler for a settled height is ignored.
    let batch = router.start_consensus(RecordingHandler::new(BlockHeight::new(2), handled));
    assert_eq!(batch.processed, 0);
    assert!(!router.has_instance(BlockHeight::new(2)));
}

#[test]
fn full_deferred_queue_evicts_highest_heights_test() {
    let sender = NodeId::new(2);
    let mut queue = DeferredMessageQueue::new(3, 1);
    assert!(queue.push(BlockHeight::new(5), sender, Round::new(0), "a"));
    assert!(queue.push(BlockHeight::new(6), sender, Round::new(0), "b"));
    assert!(queue.push(BlockHeight::new(7), sender, Round::new(0), "c"));

    // Lower than everything buffered: evicts the height 7 message.
    assert!(queue.push(BlockHeight::new(4), sender, Round::new(0), "d"));
    assert_eq!(queue.len_at(BlockHeight::new(7)), 0);

    // Not lower than the highest buffered height: dropped.
    assert!(!queue.push(BlockHeight::new(9), sender, Round::new(0), "e"));
    assert!(!queue.push(BlockHeight::new(6), sender, Round::new(0), "f"));
    assert_eq!(queue.len(), 3);

    assert_eq!(queue.drain_ready(BlockHeight::new(5)), vec!["d", "a"]);
    assert_eq!(queue.len(), 1);
}

#[test]
fn sender_at_its_share_evicts_its_own_furthest_round_test() {
    let (flooder, honest) = (NodeId::new(1), NodeId::new(2));
    // Two senders, so each may hold two of the four slots.
    let mut queue = DeferredMessageQueue::new(4, 2);
    assert!(queue.push(BlockHeight::new(2), flooder, Round::new(0), "f0"));
    assert!(queue.push(BlockHeight::new(2), flooder, Round::new(5), "f5"));
    assert!(queue.push(BlockHeight::new(2), honest, Round::new(9), "h9"));

    // An earlier round replaces the flooder's furthest message, never the honest one.
    assert!(queue.push(BlockHeight::new(2), flooder, Round::new(1), "f1"));
    assert!(!queue.push(BlockHeight::new(2), flooder, Round::new(3), "f3"));
    assert_eq!(queue.sender_len(flooder), 2);
    assert_eq!(queue.sender_len(honest), 1);

    assert!(queue.push(BlockHeight::new(2), honest, Round::new(0), "h0"));
    assert_eq!(
        queue.drain_ready(BlockHeight::new(2)),
        vec!["f0", "h9", "f1", "h0"]
    );
    assert!(queue.is_empty());
    assert_eq!(queue.sender_len(flooder), 0);
}

/// One peer sends the next height's messages for every round it can think of. It must neither crowd
/// out the messages honest peers send slightly ahead of us, nor fill the buffer with far rounds.
#[test]
fn flooding_peer_cannot_crowd_out_honest_deferred_messages_test() {
    let handled = Arc::new(Mutex::new(Vec::new()));
    let router = ConsensusRouter::new(BlockHeight::new(0), 8, 4);
    router.start_consensus(RecordingHandler::new(BlockHeight::new(1), handled));

    // Honest peers a round ahead, and a height ahead.
    assert!(matches!(router.route(message(1, 1, 2, 3)), RouteOutcome::Deferred));
    assert!(matches!(router.route(message(2, 1, 0, 4)), RouteOutcome::Deferred));

    let kept = (0..100)
        .filter(|round| matches!(router.route(message(2, 1, *round, 2)), RouteOutcome::Deferred))
        .count();
    assert_eq!(kept, 2);
    assert_eq!(router.deferred_count_from(NodeId::new(2)), 2);
    assert_eq!(router.deferred_count_from(NodeId::new(3)), 1);
    assert_eq!(router.deferred_count_from(NodeId::new(4)), 1);

    // Rounds too far ahead of the local round are not buffered at all.
    assert!(matches!(
        router.route(message(1, 2, MAX_ROUND_LEAD + 1, 3)),
        RouteOutcome::Dropped
    ));
    assert!(matches!(
        router.route(message(1, 2, MAX_ROUND_LEAD, 3)),
        RouteOutcome::Deferred
    ));
    assert_eq!(router.deferred_count(), 5);
}
