/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Events emitted by a running node, for user-defined handlers and for logging.
//!
//! An event is emitted after the action it describes has completed. Handlers are registered through
//! the `on_*` setters of [`NodeSpec`](crate::node::NodeSpec) and run on a dedicated event bus thread,
//! so a slow handler delays other handlers but never consensus itself.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::types::basic::*;

pub enum Event {
    // Events that change committed state.
    CommitBlock(CommitBlockEvent),
    // Proposal events.
    Propose(ProposeEvent),
    ReceiveProposal(ReceiveProposalEvent),
    // Binary consensus events.
    StartConsensus(StartConsensusEvent),
    Decide(DecideEvent),
    DeferMessage(DeferMessageEvent),
    // Catchup events.
    StartCatchup(StartCatchupEvent),
    EndCatchup(EndCatchupEvent),
    ReceiveCatchupRequest(ReceiveCatchupRequestEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The event bus only hangs up during shutdown.
            let _ = event_publisher.send(event);
        }
    }
}

/// A block was committed and handed to the application.
pub struct CommitBlockEvent {
    pub timestamp: SystemTime,
    pub height: BlockHeight,
    pub block: CryptoHash,
    pub proposer_index: ProposerIndex,
    pub transactions: usize,
}

/// This node built its proposal for `height` and queued it for pushing to every peer.
pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub height: BlockHeight,
    pub proposal: CryptoHash,
    pub transactions: usize,
}

/// A peer's proposal was reassembled and registered.
pub struct ReceiveProposalEvent {
    pub timestamp: SystemTime,
    pub origin: NodeId,
    pub height: BlockHeight,
    pub proposer_index: ProposerIndex,
    pub proposal: CryptoHash,
}

/// Binary consensus started for `height`, voting `votes[i]` for proposer `i + 1`.
pub struct StartConsensusEvent {
    pub timestamp: SystemTime,
    pub height: BlockHeight,
    pub votes: Vec<bool>,
}

/// Binary consensus decided `height`. `winner` is `None` if every proposer was voted out.
pub struct DecideEvent {
    pub timestamp: SystemTime,
    pub height: BlockHeight,
    pub winner: Option<ProposerIndex>,
}

/// A binary consensus message was buffered for later processing.
pub struct DeferMessageEvent {
    pub timestamp: SystemTime,
    pub origin: NodeId,
    pub height: BlockHeight,
    pub proposer_index: ProposerIndex,
    pub round: Round,
}

pub struct StartCatchupEvent {
    pub timestamp: SystemTime,
    pub peer: NodeId,
    pub from_height: BlockHeight,
}

pub struct EndCatchupEvent {
    pub timestamp: SystemTime,
    pub peer: NodeId,
    pub blocks_received: usize,
    pub committed_height: BlockHeight,
}

pub struct ReceiveCatchupRequestEvent {
    pub timestamp: SystemTime,
    pub peer: NodeId,
    pub from_height: BlockHeight,
}
