/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Partial-hash reconciliation of proposed transaction bodies.
//!
//! The receiving side of a [`ProposalPush`] resolves each partial hash against the local
//! [`TransactionStore`], asks the proposer only for the positions it could not resolve, and reassembles
//! the proposal positionally once every body is in hand. Partial hashes are only a lookup shortcut: the
//! reassembled proposal's hash is recomputed from full hashes and must equal the announced one. If it
//! does not, some partial hash resolved to the wrong body, and every position is requested once more.

use crate::errors::ProtocolError;
use crate::proposals::messages::{
    MissingTransactionsRequest, MissingTransactionsResponse, ProposalPush,
};
use crate::transactions::store::TransactionStore;
use crate::types::block::BlockProposal;
use crate::types::transaction::Transaction;

/// In-progress reassembly of one pushed proposal.
#[derive(Debug)]
pub struct Reconciliation {
    header: ProposalPush,
    slots: Vec<Option<Transaction>>,
    requested: Vec<u64>,
    rerequested_all: bool,
}

/// What to do after feeding a [`Reconciliation`].
#[derive(Debug)]
pub enum ReconciliationStep {
    /// Send this request to the proposer and wait for the response.
    Request(MissingTransactionsRequest),
    /// Reassembly succeeded.
    Complete(BlockProposal),
}

impl Reconciliation {
    /// Resolve `header`'s partial hashes against `store`.
    ///
    /// Fails if any partial hash belongs to a committed transaction: a proposal reusing committed
    /// transactions is either for an old height or malicious.
    pub fn start(
        header: ProposalPush,
        store: &TransactionStore,
    ) -> Result<(Reconciliation, ReconciliationStep), ProtocolError> {
        let mut slots = Vec::with_capacity(header.partial_hashes.len());
        for partial_hash in &header.partial_hashes {
            if store.is_committed(partial_hash) {
                return Err(ProtocolError::CommittedTransactionInProposal {
                    height: header.height,
                    proposer: header.proposer_index,
                });
            }
            slots.push(store.lookup_known_by_partial_hash(partial_hash));
        }
        let mut reconciliation = Reconciliation {
            header,
            slots,
            requested: Vec::new(),
            rerequested_all: false,
        };
        let step = reconciliation.next_step()?;
        Ok((reconciliation, step))
    }

    pub fn header(&self) -> &ProposalPush {
        &self.header
    }

    /// Positions whose bodies are still unknown.
    pub fn missing(&self) -> Vec<u64> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i as u64)
            .collect()
    }

    /// Feed the proposer's answer to the outstanding request. Revealed bodies are admitted to `store`
    /// as *known*.
    pub fn accept_response(
        &mut self,
        response: MissingTransactionsResponse,
        store: &TransactionStore,
    ) -> Result<ReconciliationStep, ProtocolError> {
        let bodies = decode_bodies(&response.sizes, &response.bodies)?;
        if bodies.len() != self.requested.len() {
            return Err(ProtocolError::MissingCountMismatch {
                expected: self.requested.len(),
                actual: bodies.len(),
            });
        }
        let revealed: Vec<Transaction> = bodies.into_iter().map(Transaction::new).collect();
        for (index, tx) in self.requested.iter().zip(revealed.iter()) {
            self.slots[*index as usize] = Some(tx.clone());
        }
        store.admit_known_batch(revealed);
        self.requested.clear();
        self.next_step()
    }

    fn next_step(&mut self) -> Result<ReconciliationStep, ProtocolError> {
        let missing = self.missing();
        if !missing.is_empty() {
            return Ok(self.request(missing));
        }

        let transactions: Vec<Transaction> = self.slots.iter().flatten().cloned().collect();
        let proposal = BlockProposal::new(
            self.header.schain_id,
            self.header.height,
            self.header.proposer_index,
            transactions,
            self.header.timestamp,
        );
        if proposal.hash() == self.header.hash {
            return Ok(ReconciliationStep::Complete(proposal));
        }

        if self.rerequested_all {
            return Err(ProtocolError::ProposalHashMismatch {
                expected: self.header.hash,
                actual: proposal.hash(),
            });
        }
        log::debug!(
            "Partial hash collision while reassembling proposal at height {} from proposer {}, requesting every body.",
            self.header.height,
            self.header.proposer_index
        );
        self.rerequested_all = true;
        self.slots.iter_mut().for_each(|slot| *slot = None);
        let all = (0..self.slots.len() as u64).collect();
        Ok(self.request(all))
    }

    fn request(&mut self, indices: Vec<u64>) -> ReconciliationStep {
        self.requested = indices.clone();
        ReconciliationStep::Request(MissingTransactionsRequest {
            schain_id: self.header.schain_id,
            height: self.header.height,
            proposer_index: self.header.proposer_index,
            indices,
        })
    }
}

/// Proposer side: answer `request` from our own `proposal`, keeping request order.
pub fn missing_transactions_response(
    proposal: &BlockProposal,
    request: &MissingTransactionsRequest,
) -> Result<MissingTransactionsResponse, ProtocolError> {
    let transactions = proposal.transactions();
    let mut sizes = Vec::with_capacity(request.indices.len());
    let mut bodies = Vec::new();
    for index in &request.indices {
        let tx = transactions
            .get(*index as usize)
            .ok_or(ProtocolError::IndexOutOfRange {
                index: *index,
                len: transactions.len(),
            })?;
        sizes.push(tx.len() as u64);
        bodies.extend_from_slice(tx.data());
    }
    Ok(MissingTransactionsResponse {
        schain_id: proposal.schain_id(),
        height: proposal.height(),
        proposer_index: proposal.proposer_index(),
        sizes,
        bodies,
    })
}

/// Split concatenated `bodies` by `sizes`.
pub fn decode_bodies(sizes: &[u64], bodies: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let sizes_total = sizes
        .iter()
        .try_fold(0u64, |total, size| total.checked_add(*size))
        .unwrap_or(u64::MAX);
    if sizes_total != bodies.len() as u64 {
        return Err(ProtocolError::SizeListMismatch {
            sizes_total,
            body_len: bodies.len() as u64,
        });
    }
    let mut offset = 0;
    Ok(sizes
        .iter()
        .map(|size| {
            let body = bodies[offset..offset + *size as usize].to_vec();
            offset += *size as usize;
            body
        })
        .collect())
}
