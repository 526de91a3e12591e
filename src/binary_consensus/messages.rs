/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages exchanged within binary consensus instances.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::*;

/// Identifies one round of one binary consensus instance: the instance decides whether proposer
/// `proposer_index`'s block is a candidate for `height`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct ConsensusKey {
    pub height: BlockHeight,
    pub proposer_index: ProposerIndex,
    pub round: Round,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub enum BinaryMessageKind {
    /// Binary-value broadcast: a tentative belief about the round's bit.
    Bv,
    /// Auxiliary broadcast: "I observed this value enter my binding set".
    Aux,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BinaryConsensusMessage {
    pub schain_id: SchainId,
    pub height: BlockHeight,
    pub proposer_index: ProposerIndex,
    pub round: Round,
    pub kind: BinaryMessageKind,
    pub value: bool,
    pub sender: NodeId,
}

impl BinaryConsensusMessage {
    pub fn key(&self) -> ConsensusKey {
        ConsensusKey {
            height: self.height,
            proposer_index: self.proposer_index,
            round: self.round,
        }
    }
}

/// A message produced by a consensus instance, to be sent outside any lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Broadcast(BinaryConsensusMessage),
    SendTo(NodeId, BinaryConsensusMessage),
}
