/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-height registry of competing block proposals.
//!
//! Each proposer may register at most one proposal per height. The set of proposers heard from at a
//! height is what a node votes on in binary consensus: "has proposer i produced a proposal?", never
//! the proposal contents.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::types::basic::{two_thirds, BlockHeight, ProposerIndex, Timestamp};
use crate::types::block::BlockProposal;

pub struct ProposalStore {
    total_proposers: u64,
    inner: Mutex<BTreeMap<BlockHeight, BTreeMap<ProposerIndex, BlockProposal>>>,
}

impl ProposalStore {
    pub fn new(total_proposers: u64) -> ProposalStore {
        ProposalStore {
            total_proposers,
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register `proposal` under (height, proposer index).
    ///
    /// Returns `true` exactly when this registration is the one that makes the height reach the
    /// two-thirds quorum of distinct proposers. A second proposal from the same proposer at the same
    /// height is ignored: it neither replaces the first nor counts again.
    pub fn add_proposal(&self, proposal: BlockProposal) -> bool {
        let mut inner = self.lock();
        let at_height = inner.entry(proposal.height()).or_default();
        if at_height.contains_key(&proposal.proposer_index()) {
            return false;
        }
        let had_quorum = two_thirds(at_height.len() as u64, self.total_proposers);
        at_height.insert(proposal.proposer_index(), proposal);
        !had_quorum && two_thirds(at_height.len() as u64, self.total_proposers)
    }

    pub fn has_proposal(&self, height: BlockHeight, proposer_index: ProposerIndex) -> bool {
        self.lock()
            .get(&height)
            .is_some_and(|at_height| at_height.contains_key(&proposer_index))
    }

    pub fn has_two_thirds(&self, height: BlockHeight) -> bool {
        two_thirds(self.count(height), self.total_proposers)
    }

    /// Number of distinct proposers registered at `height`.
    pub fn count(&self, height: BlockHeight) -> u64 {
        self.lock()
            .get(&height)
            .map_or(0, |at_height| at_height.len() as u64)
    }

    pub fn get_proposal(
        &self,
        height: BlockHeight,
        proposer_index: ProposerIndex,
    ) -> Option<BlockProposal> {
        self.lock()
            .get(&height)
            .and_then(|at_height| at_height.get(&proposer_index))
            .cloned()
    }

    /// One entry per proposer: position `i` is `true` iff proposer `i + 1` has a proposal at `height`.
    pub fn get_vote_vector(&self, height: BlockHeight) -> Vec<bool> {
        let inner = self.lock();
        let at_height = inner.get(&height);
        (1..=self.total_proposers)
            .map(|i| at_height.is_some_and(|proposals| proposals.contains_key(&ProposerIndex::new(i))))
            .collect()
    }

    /// Drop the proposals at `height` whose timestamp is not later than `committed`, the timestamp of the
    /// block just below. Returns how many were dropped.
    pub fn discard_stale(&self, height: BlockHeight, committed: Timestamp) -> usize {
        let mut inner = self.lock();
        let Some(at_height) = inner.get_mut(&height) else {
            return 0;
        };
        let before = at_height.len();
        at_height.retain(|_, proposal| proposal.timestamp() > committed);
        before - at_height.len()
    }

    /// Drop every proposal strictly below `height`.
    pub fn clean_old(&self, height: BlockHeight) {
        let mut inner = self.lock();
        *inner = inner.split_off(&height);
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<BlockHeight, BTreeMap<ProposerIndex, BlockProposal>>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
