/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The pending-transaction set.
//!
//! Transactions are held in three logical partitions that share one partial-hash lookup namespace:
//! - *Pending*: seen, not yet in a committed block. Candidates for our own proposals, in insertion
//!   order.
//! - *Known*: bodies revealed by peers during reconciliation. May overlap with pending. A known body
//!   that is neither pending nor committed within `known_transactions_retention` heights of being
//!   revealed is dropped: it belonged to proposals that lost.
//! - *Committed*: finalized, kept for a bounded history window so that replays and proposals that
//!   reuse committed transactions are caught. Disjoint from the other two.
//!
//! Bodies are owned by full hash. The partial-hash index points at full hashes, so a partial-hash
//! collision can only ever make a lookup return the wrong body, which reassembly then detects when it
//! recomputes the proposal hash from full hashes.

use std::cmp::max;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::types::basic::*;
use crate::types::block::{BlockProposal, CommittedBlock};
use crate::types::transaction::Transaction;

pub struct TransactionStore {
    config: TransactionStoreConfiguration,
    inner: Mutex<TransactionStoreInner>,
}

#[derive(Clone, Debug)]
pub struct TransactionStoreConfiguration {
    pub max_transactions_per_block: usize,
    pub committed_transactions_history: usize,
    pub empty_block_interval: Duration,
    pub known_transactions_retention: u64,
}

#[derive(Default)]
struct TransactionStoreInner {
    next_seq: u64,
    // Insertion sequence number → full hash, for deterministic proposal order.
    pending: BTreeMap<u64, CryptoHash>,
    pending_seq: HashMap<CryptoHash, u64>,
    // Full hash → committed height when the body was revealed.
    known: HashMap<CryptoHash, BlockHeight>,
    last_committed: BlockHeight,
    bodies: HashMap<CryptoHash, Transaction>,
    by_partial: HashMap<PartialHash, CryptoHash>,
    committed: HashSet<CryptoHash>,
    committed_partials: HashMap<PartialHash, u32>,
    committed_order: VecDeque<CryptoHash>,
}

impl TransactionStore {
    pub fn new(config: TransactionStoreConfiguration) -> TransactionStore {
        TransactionStore {
            config,
            inner: Mutex::new(TransactionStoreInner::default()),
        }
    }

    /// Insert `tx` into *pending*. Returns whether it was inserted: re-admitting a pending transaction
    /// and admitting a committed one are both silent no-ops.
    pub fn admit(&self, tx: Transaction) -> bool {
        let mut inner = self.lock();
        let hash = tx.hash();
        if inner.committed.contains(&hash) || inner.pending_seq.contains_key(&hash) {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.pending.insert(seq, hash);
        inner.pending_seq.insert(hash, seq);
        inner.index_body(tx);
        true
    }

    /// Insert `tx` into *known* without touching *pending*.
    pub fn admit_known(&self, tx: Transaction) {
        self.lock().admit_known(tx)
    }

    pub fn admit_known_batch(&self, txs: impl IntoIterator<Item = Transaction>) {
        let mut inner = self.lock();
        for tx in txs {
            inner.admit_known(tx)
        }
    }

    /// Look up a pending or known transaction by partial hash.
    pub fn lookup_known_by_partial_hash(&self, partial_hash: &PartialHash) -> Option<Transaction> {
        let inner = self.lock();
        inner
            .by_partial
            .get(partial_hash)
            .and_then(|hash| inner.bodies.get(hash))
            .cloned()
    }

    pub fn is_committed(&self, partial_hash: &PartialHash) -> bool {
        self.lock().committed_partials.contains_key(partial_hash)
    }

    pub fn is_committed_full(&self, hash: &CryptoHash) -> bool {
        self.lock().committed.contains(hash)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn known_count(&self) -> usize {
        self.lock().known.len()
    }

    pub fn committed_count(&self) -> usize {
        self.lock().committed.len()
    }

    /// Snapshot up to `max_transactions_per_block` pending transactions, in insertion order, into a
    /// proposal for `height`. The transactions stay pending: the proposal may lose.
    ///
    /// The timestamp is the local clock, bumped if necessary to be strictly later than
    /// `previous_timestamp`.
    pub fn build_proposal(
        &self,
        schain_id: SchainId,
        height: BlockHeight,
        proposer_index: ProposerIndex,
        previous_timestamp: Timestamp,
    ) -> BlockProposal {
        let transactions: Vec<Transaction> = {
            let inner = self.lock();
            inner
                .pending
                .values()
                .take(self.config.max_transactions_per_block)
                .filter_map(|hash| inner.bodies.get(hash).cloned())
                .collect()
        };
        let timestamp = max(
            Timestamp::now(),
            Timestamp::new(previous_timestamp.millis() + 1),
        );
        BlockProposal::new(schain_id, height, proposer_index, transactions, timestamp)
    }

    /// Whether a self-proposal should be made now: either something is pending, or the chain has been
    /// idle for the empty-block interval since `previous_timestamp`.
    pub fn ready_to_propose(&self, previous_timestamp: Timestamp) -> bool {
        if !self.lock().pending.is_empty() {
            return true;
        }
        Timestamp::now() >= previous_timestamp + self.config.empty_block_interval
    }

    /// Move every transaction of `block` into *committed*, then trim the committed history to the
    /// configured retention size, oldest first. Known bodies revealed more than
    /// `known_transactions_retention` heights ago are dropped too.
    pub fn clean_committed(&self, block: &CommittedBlock) {
        let mut inner = self.lock();
        inner.last_committed = inner.last_committed.max(block.height());
        for tx in block.transactions() {
            let hash = tx.hash();
            if let Some(seq) = inner.pending_seq.remove(&hash) {
                inner.pending.remove(&seq);
            }
            inner.known.remove(&hash);
            inner.forget_body(&hash);
            let partial = hash.partial();
            if inner.committed.insert(hash) {
                *inner.committed_partials.entry(partial).or_insert(0) += 1;
                inner.committed_order.push_back(hash);
            }
        }

        while inner.committed_order.len() > self.config.committed_transactions_history {
            let Some(evicted) = inner.committed_order.pop_front() else {
                break;
            };
            inner.committed.remove(&evicted);
            let partial = evicted.partial();
            if let Some(count) = inner.committed_partials.get_mut(&partial) {
                *count -= 1;
                if *count == 0 {
                    inner.committed_partials.remove(&partial);
                }
            }
        }

        let retention = self.config.known_transactions_retention;
        let last_committed = inner.last_committed;
        let expired: Vec<CryptoHash> = inner
            .known
            .iter()
            .filter(|(_, revealed)| revealed.int().saturating_add(retention) < last_committed.int())
            .map(|(hash, _)| *hash)
            .collect();
        for hash in expired {
            inner.known.remove(&hash);
            if !inner.pending_seq.contains_key(&hash) {
                inner.forget_body(&hash);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransactionStoreInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TransactionStoreInner {
    fn admit_known(&mut self, tx: Transaction) {
        let hash = tx.hash();
        if self.committed.contains(&hash) {
            return;
        }
        self.known.insert(hash, self.last_committed);
        self.index_body(tx);
    }

    fn forget_body(&mut self, hash: &CryptoHash) {
        self.bodies.remove(hash);
        let partial = hash.partial();
        if self.by_partial.get(&partial) == Some(hash) {
            self.by_partial.remove(&partial);
        }
    }

    fn index_body(&mut self, tx: Transaction) {
        let hash = tx.hash();
        self.by_partial.entry(hash.partial()).or_insert(hash);
        self.bodies.entry(hash).or_insert(tx);
    }
}
