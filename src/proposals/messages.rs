/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages of the proposal push protocol.
//!
//! A proposer pushes each of its proposals to every peer as a [`ProposalPush`] carrying only the
//! partial hashes of its transactions. The receiving server asks for the bodies it does not know with a
//! [`MissingTransactionsRequest`], which the proposer answers with a [`MissingTransactionsResponse`].
//! Any step can instead be answered with a [`ProposalResponse`] whose [`ConnectionStatus`] explains why
//! the exchange stopped.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::*;
use crate::types::block::BlockProposal;

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ProposalMessage {
    ProposalPush(ProposalPush),
    ProposalResponse(ProposalResponse),
    MissingTransactionsRequest(MissingTransactionsRequest),
    MissingTransactionsResponse(MissingTransactionsResponse),
}

impl ProposalMessage {
    pub fn schain_id(&self) -> SchainId {
        match self {
            ProposalMessage::ProposalPush(msg) => msg.schain_id,
            ProposalMessage::ProposalResponse(msg) => msg.schain_id,
            ProposalMessage::MissingTransactionsRequest(msg) => msg.schain_id,
            ProposalMessage::MissingTransactionsResponse(msg) => msg.schain_id,
        }
    }

    pub fn height(&self) -> BlockHeight {
        match self {
            ProposalMessage::ProposalPush(msg) => msg.height,
            ProposalMessage::ProposalResponse(msg) => msg.height,
            ProposalMessage::MissingTransactionsRequest(msg) => msg.height,
            ProposalMessage::MissingTransactionsResponse(msg) => msg.height,
        }
    }
}

/// Header of a pushed proposal.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ProposalPush {
    pub schain_id: SchainId,
    pub height: BlockHeight,
    pub proposer_index: ProposerIndex,
    pub node_id: NodeId,
    pub timestamp: Timestamp,
    pub hash: CryptoHash,
    pub partial_hashes: Vec<PartialHash>,
}

impl ProposalPush {
    pub fn new(proposal: &BlockProposal, node_id: NodeId) -> ProposalPush {
        ProposalPush {
            schain_id: proposal.schain_id(),
            height: proposal.height(),
            proposer_index: proposal.proposer_index(),
            node_id,
            timestamp: proposal.timestamp(),
            hash: proposal.hash(),
            partial_hashes: proposal
                .transactions()
                .iter()
                .map(|tx| tx.partial_hash())
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ProposalResponse {
    pub schain_id: SchainId,
    pub height: BlockHeight,
    pub status: ConnectionStatus,
}

/// Ask the proposer for the bodies at the given positions of its proposal.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MissingTransactionsRequest {
    pub schain_id: SchainId,
    pub height: BlockHeight,
    pub proposer_index: ProposerIndex,
    pub indices: Vec<u64>,
}

/// Bodies for a [`MissingTransactionsRequest`], in request order: `sizes[i]` is the length of the
/// i-th body within the concatenated `bodies`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MissingTransactionsResponse {
    pub schain_id: SchainId,
    pub height: BlockHeight,
    pub proposer_index: ProposerIndex,
    pub sizes: Vec<u64>,
    pub bodies: Vec<u8>,
}

/// Outcome of validating a request, carried in responses of both the proposal and the catchup
/// protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ConnectionStatus {
    Proceed,
    Disconnect(DisconnectReason),
    ServerError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum DisconnectReason {
    TooLateBlock,
    TimestampInFuture,
    TimestampEarlierThanCommitted,
    UnknownSchain,
    UnknownSourceIp,
    InvalidNodeId,
    InvalidSubchainIndex,
}
