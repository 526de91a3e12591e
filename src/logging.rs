/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the node's
//! [configuration](crate::node::Configuration).
//!
//! The crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [ReceiveProposal](crate::events::ReceiveProposalEvent) is printed:
//!
//! ```text
//! ReceiveProposal, 1701329264, 3, 12, 2, fNGCJyk
//! ```
//!
//! In the snippet:
//! - The third value is the node id of the peer that pushed the proposal.
//! - The fourth value is the height of the proposal.
//! - The fifth value is the proposer index.
//! - The sixth value is the first seven characters of the Base64 encoding of the proposal's hash.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const COMMIT_BLOCK: &str = "CommitBlock";

pub const PROPOSE: &str = "Propose";
pub const RECEIVE_PROPOSAL: &str = "ReceiveProposal";

pub const START_CONSENSUS: &str = "StartConsensus";
pub const DECIDE: &str = "Decide";
pub const DEFER_MESSAGE: &str = "DeferMessage";

pub const START_CATCHUP: &str = "StartCatchup";
pub const END_CATCHUP: &str = "EndCatchup";
pub const RECEIVE_CATCHUP_REQUEST: &str = "ReceiveCatchupRequest";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for CommitBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_block_event: &CommitBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                COMMIT_BLOCK,
                secs_since_unix_epoch(commit_block_event.timestamp),
                commit_block_event.height,
                first_seven_base64_chars(&commit_block_event.block.bytes()),
                commit_block_event.proposer_index,
                commit_block_event.transactions
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |propose_event: &ProposeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PROPOSE,
                secs_since_unix_epoch(propose_event.timestamp),
                propose_event.height,
                first_seven_base64_chars(&propose_event.proposal.bytes()),
                propose_event.transactions
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveProposalEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_proposal_event: &ReceiveProposalEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_PROPOSAL,
                secs_since_unix_epoch(receive_proposal_event.timestamp),
                receive_proposal_event.origin,
                receive_proposal_event.height,
                receive_proposal_event.proposer_index,
                first_seven_base64_chars(&receive_proposal_event.proposal.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartConsensusEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_consensus_event: &StartConsensusEvent| {
            let votes: String = start_consensus_event
                .votes
                .iter()
                .map(|vote| if *vote { '1' } else { '0' })
                .collect();
            log::info!(
                "{}, {}, {}, {}",
                START_CONSENSUS,
                secs_since_unix_epoch(start_consensus_event.timestamp),
                start_consensus_event.height,
                votes
            )
        };
        Box::new(logger)
    }
}

impl Logger for DecideEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |decide_event: &DecideEvent| {
            // Proposer index 0 stands for the empty block.
            log::info!(
                "{}, {}, {}, {}",
                DECIDE,
                secs_since_unix_epoch(decide_event.timestamp),
                decide_event.height,
                decide_event.winner.map_or(0, |winner| winner.int())
            )
        };
        Box::new(logger)
    }
}

impl Logger for DeferMessageEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |defer_message_event: &DeferMessageEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                DEFER_MESSAGE,
                secs_since_unix_epoch(defer_message_event.timestamp),
                defer_message_event.origin,
                defer_message_event.height,
                defer_message_event.proposer_index,
                defer_message_event.round
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartCatchupEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_catchup_event: &StartCatchupEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_CATCHUP,
                secs_since_unix_epoch(start_catchup_event.timestamp),
                start_catchup_event.peer,
                start_catchup_event.from_height
            )
        };
        Box::new(logger)
    }
}

impl Logger for EndCatchupEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |end_catchup_event: &EndCatchupEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                END_CATCHUP,
                secs_since_unix_epoch(end_catchup_event.timestamp),
                end_catchup_event.peer,
                end_catchup_event.blocks_received,
                end_catchup_event.committed_height
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveCatchupRequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_catchup_request_event: &ReceiveCatchupRequestEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RECEIVE_CATCHUP_REQUEST,
                secs_since_unix_epoch(receive_catchup_request_event.timestamp),
                receive_catchup_request_event.peer,
                receive_catchup_request_event.from_height
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}
