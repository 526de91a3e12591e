/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for block proposals and committed blocks, and their associated methods.

use std::cmp::max;

use borsh::{BorshDeserialize, BorshSerialize};
use sha3::Digest;
pub use sha3::Sha3_256 as CryptoHasher;

use crate::types::basic::*;
use crate::types::transaction::Transaction;

/// A candidate block for one height, authored by one proposer.
///
/// The `hash` is computed once, at construction, over the schain id, the height, the number of
/// transactions, and the ordered list of transaction hashes. It is the identity of the proposal. The
/// timestamp is not part of it.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockProposal {
    schain_id: SchainId,
    height: BlockHeight,
    proposer_index: ProposerIndex,
    transactions: Vec<Transaction>,
    timestamp: Timestamp,
    hash: CryptoHash,
}

impl BlockProposal {
    pub fn new(
        schain_id: SchainId,
        height: BlockHeight,
        proposer_index: ProposerIndex,
        transactions: Vec<Transaction>,
        timestamp: Timestamp,
    ) -> BlockProposal {
        let hash = BlockProposal::hash_of(
            schain_id,
            height,
            transactions.iter().map(|tx| tx.hash()),
            transactions.len(),
        );
        BlockProposal {
            schain_id,
            height,
            proposer_index,
            transactions,
            timestamp,
            hash,
        }
    }

    /// Compute a proposal hash from its parts. `tx_hashes` must yield `tx_count` items.
    pub fn hash_of(
        schain_id: SchainId,
        height: BlockHeight,
        tx_hashes: impl Iterator<Item = CryptoHash>,
        tx_count: usize,
    ) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(schain_id.int().to_le_bytes());
        hasher.update(height.to_le_bytes());
        hasher.update((tx_count as u64).to_le_bytes());
        for tx_hash in tx_hashes {
            hasher.update(tx_hash.bytes());
        }
        CryptoHash::new(hasher.finalize().into())
    }

    pub fn schain_id(&self) -> SchainId {
        self.schain_id
    }

    pub fn height(&self) -> BlockHeight {
        self.height
    }

    pub fn proposer_index(&self) -> ProposerIndex {
        self.proposer_index
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn hash(&self) -> CryptoHash {
        self.hash
    }

    /// Checks that the stored hash matches the contents. Proposals received over the wire or read back
    /// from storage carry a hash that was computed by someone else.
    pub fn is_correct(&self) -> bool {
        self.hash
            == BlockProposal::hash_of(
                self.schain_id,
                self.height,
                self.transactions.iter().map(|tx| tx.hash()),
                self.transactions.len(),
            )
    }
}

/// The block agreed on for a height: the winning proposal, or an empty block if consensus rejected
/// every proposer.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CommittedBlock {
    proposal: BlockProposal,
}

impl CommittedBlock {
    pub fn new(proposal: BlockProposal) -> CommittedBlock {
        CommittedBlock { proposal }
    }

    /// The block committed when every proposer at `height` is voted out.
    ///
    /// Every node must produce the same empty block, so its timestamp is derived from the previous
    /// committed timestamp instead of the local clock.
    pub fn empty(
        schain_id: SchainId,
        height: BlockHeight,
        previous_timestamp: Timestamp,
    ) -> CommittedBlock {
        let timestamp = Timestamp::new(max(previous_timestamp, PROTOCOL_EPOCH).millis() + 1);
        CommittedBlock::new(BlockProposal::new(
            schain_id,
            height,
            ProposerIndex::new(0),
            Vec::new(),
            timestamp,
        ))
    }

    pub fn is_empty_block(&self) -> bool {
        self.proposal.proposer_index.int() == 0
    }

    pub fn proposal(&self) -> &BlockProposal {
        &self.proposal
    }

    pub fn height(&self) -> BlockHeight {
        self.proposal.height
    }

    pub fn hash(&self) -> CryptoHash {
        self.proposal.hash
    }

    pub fn timestamp(&self) -> Timestamp {
        self.proposal.timestamp
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.proposal.transactions
    }

    pub fn schain_id(&self) -> SchainId {
        self.proposal.schain_id
    }

    pub fn is_correct(&self) -> bool {
        self.proposal.is_correct()
    }
}
