/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-chain height sequencer.
//!
//! [`ChainState`] decides when binary consensus starts for a height, applies commits, and chains each
//! commit into the proposal of the next height. Per height it moves through:
//!
//! ```text
//! AwaitingProposals(H) --quorum of proposals--> ConsensusRunning(H) --decision + commit--> AwaitingProposals(H+1)
//! ```
//!
//! ## Locking
//!
//! Every transition runs under one chain lock, which is the global serialization point: all commits
//! appear to every thread in a single total order. The transaction store, proposal store, block cache
//! and router each keep their own lock, always acquired after the chain lock and never held across a
//! call back into the chain.
//!
//! Operations never touch the network. They return [`Effects`] describing what should be sent, and the
//! caller sends it after the chain lock is released.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use crate::app::App;
use crate::binary_consensus::block_consensus::{BlockConsensus, HeightDecision};
use crate::binary_consensus::coin::CommonCoin;
use crate::binary_consensus::messages::Outbound;
use crate::chain::block_cache::CommittedBlockCache;
use crate::errors::{ChainError, InvariantViolation, RejectReason};
use crate::events::*;
use crate::proposals::store::ProposalStore;
use crate::router::{ConsensusRouter, RouteBatch};
use crate::storage::{self, BlockStore, StorageError};
use crate::transactions::store::TransactionStore;
use crate::types::basic::*;
use crate::types::block::{BlockProposal, CommittedBlock};
use crate::types::peers::PeerSet;

#[derive(Clone, Debug)]
pub struct ChainConfiguration {
    pub schain_id: SchainId,
    pub node_id: NodeId,
    pub proposer_index: ProposerIndex,
    pub peers: PeerSet,
    pub committed_block_storage_size: usize,
    pub deferred_message_capacity: usize,
    /// First delay before the running height's consensus messages are sent again. Doubles on every
    /// retransmission of the same height, up to [`MAX_RETRANSMIT_BACKOFF`] times this value.
    pub retransmit_interval: Duration,
}

pub const MAX_RETRANSMIT_BACKOFF: u32 = 8;

/// Lock-free view of the committed height and the timestamp of the block at that height, for threads
/// that only need to filter stale work.
#[derive(Clone)]
pub struct ChainHead {
    height: Arc<AtomicU64>,
    timestamp: Arc<AtomicU64>,
}

impl ChainHead {
    fn new() -> ChainHead {
        ChainHead {
            height: Arc::new(AtomicU64::new(0)),
            timestamp: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn height(&self) -> BlockHeight {
        BlockHeight::new(self.height.load(Ordering::SeqCst))
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp::new(self.timestamp.load(Ordering::SeqCst))
    }

    fn set(&self, height: BlockHeight, timestamp: Timestamp) {
        self.timestamp.store(timestamp.millis(), Ordering::SeqCst);
        self.height.store(height.int(), Ordering::SeqCst);
    }
}

/// Network work produced by a [`ChainState`] operation.
#[derive(Debug, Default)]
pub struct Effects {
    /// Our own proposals, to be pushed to every peer.
    pub proposals: Vec<BlockProposal>,
    pub outbound: Vec<Outbound>,
}

impl Effects {
    pub fn extend(&mut self, other: Effects) {
        self.proposals.extend(other.proposals);
        self.outbound.extend(other.outbound);
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty() && self.outbound.is_empty()
    }
}

pub struct ChainState<S: BlockStore, A: App> {
    config: ChainConfiguration,
    head: ChainHead,
    transactions: Arc<TransactionStore>,
    proposals: ProposalStore,
    cache: CommittedBlockCache,
    router: ConsensusRouter<BlockConsensus>,
    coin: Arc<dyn CommonCoin>,
    app: Arc<A>,
    store_reader: Mutex<S>,
    inner: Mutex<ChainInner<S>>,
}

struct ChainInner<S> {
    store: S,
    started: BTreeSet<BlockHeight>,
    proposed: BTreeSet<BlockHeight>,
    awaiting_own_proposal: Option<BlockHeight>,
    pending_decision: Option<(BlockHeight, ProposerIndex)>,
    retransmit: Option<RetransmitSchedule>,
    event_publisher: Option<Sender<Event>>,
}

struct RetransmitSchedule {
    height: BlockHeight,
    due: Instant,
    backoff: Duration,
}

impl<S: BlockStore, A: App> ChainState<S, A> {
    pub fn new(
        config: ChainConfiguration,
        transactions: Arc<TransactionStore>,
        store: S,
        app: Arc<A>,
        coin: Arc<dyn CommonCoin>,
        event_publisher: Option<Sender<Event>>,
    ) -> ChainState<S, A> {
        ChainState {
            proposals: ProposalStore::new(config.peers.len()),
            cache: CommittedBlockCache::new(config.committed_block_storage_size),
            router: ConsensusRouter::new(
                BlockHeight::new(0),
                config.deferred_message_capacity,
                config.peers.len(),
            ),
            head: ChainHead::new(),
            transactions,
            coin,
            app,
            store_reader: Mutex::new(store.clone()),
            inner: Mutex::new(ChainInner {
                store,
                started: BTreeSet::new(),
                proposed: BTreeSet::new(),
                awaiting_own_proposal: None,
                pending_decision: None,
                retransmit: None,
                event_publisher,
            }),
            config,
        }
    }

    /// Restore the committed height from storage, then propose the next height.
    pub fn bootstrap(&self) -> Result<Effects, ChainError> {
        let mut inner = self.lock();
        let me = self.config.node_id;
        if let Some(last) = inner.store.last_committed_height(me)? {
            let lowest = BlockHeight::new(
                (last.int() + 1).saturating_sub(self.config.committed_block_storage_size as u64),
            )
            .max(BlockHeight::new(1));
            let mut height = lowest;
            while height <= last {
                let block = inner
                    .store
                    .block(me, height)?
                    .filter(|block| block.is_correct() && block.height() == height)
                    .ok_or(InvariantViolation::CorruptedStoredBlock(height))?;
                self.transactions.clean_committed(&block);
                if height == last {
                    self.head.set(last, block.timestamp());
                }
                self.cache.insert(block);
                height += 1;
            }
            self.router.advance(last);
            log::info!("Restored committed height {} from storage.", last);
        }
        self.next_height_locked(&mut inner)
    }

    /// Register a peer's proposal. Starts consensus if this proposal completes the quorum for the next
    /// height, and commits it if consensus already chose it.
    ///
    /// A proposal consensus already chose is taken even if its timestamp went stale in the meantime;
    /// the decision then commits an empty block in its place.
    pub fn on_proposal_arrived(
        &self,
        origin: NodeId,
        proposal: BlockProposal,
    ) -> Result<Effects, ChainError> {
        let mut inner = self.lock();
        if let Err(reason) = self.validate_proposal(&proposal) {
            let decided =
                inner.pending_decision == Some((proposal.height(), proposal.proposer_index()));
            let stale = matches!(
                reason,
                RejectReason::StaleTimestamp { .. } | RejectReason::BeforeEpoch { .. }
            );
            if !(decided && stale && proposal.is_correct()) {
                return Err(reason.into());
            }
        }
        self.accept_proposal_locked(&mut inner, Some(origin), proposal)
    }

    /// Apply a height's decision: commit the winning block (or an empty block), then move on to the
    /// next height.
    pub fn on_consensus_decided(&self, decision: HeightDecision) -> Result<Effects, ChainError> {
        let mut inner = self.lock();
        self.decided_locked(&mut inner, decision)
    }

    /// Apply a batch of committed blocks fetched from a peer. Blocks at or below the committed height
    /// are skipped; the batch stops at the first gap. Proposes the next height once, after the batch.
    pub fn on_catchup_blocks_arrived(
        &self,
        blocks: Vec<CommittedBlock>,
    ) -> Result<Effects, ChainError> {
        let mut inner = self.lock();
        let mut effects = Effects::default();
        let mut applied = 0;
        let mut rejected = None;
        for block in blocks {
            let committed = self.head.height();
            if block.height() <= committed {
                continue;
            }
            if block.height() != committed + 1 {
                break;
            }
            if block.schain_id() != self.config.schain_id || !block.is_correct() {
                rejected = Some(RejectReason::InvalidBlock(block.height()));
                break;
            }
            match self.commit_locked(&mut inner, block) {
                Ok(committed_effects) => {
                    effects.extend(committed_effects);
                    applied += 1;
                }
                Err(ChainError::Rejected(reason)) => {
                    rejected = Some(reason);
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        if applied > 0 {
            effects.extend(self.next_height_locked(&mut inner)?);
        } else if let Some(reason) = rejected {
            return Err(reason.into());
        }
        Ok(effects)
    }

    /// Periodic work: retry a self-proposal that was held back, re-route deferred consensus messages
    /// that may have become processable after a round advance, and resend the running height's
    /// consensus messages when they are due.
    pub fn tick(&self) -> Result<Effects, ChainError> {
        let mut inner = self.lock();
        let mut effects = self.retry_own_proposal_locked(&mut inner)?;
        let batch = self.router.reroute();
        effects.extend(self.apply_route_batch_locked(&mut inner, batch)?);
        effects
            .outbound
            .extend(self.retransmit_locked(&mut inner, Instant::now()));
        Ok(effects)
    }

    /// Retry a self-proposal that was held back because nothing was pending.
    pub fn retry_own_proposal(&self) -> Result<Effects, ChainError> {
        let mut inner = self.lock();
        self.retry_own_proposal_locked(&mut inner)
    }

    /// The committed block at `height`, from the cache if it is recent, else from storage.
    pub fn get_block(&self, height: BlockHeight) -> Result<Option<CommittedBlock>, StorageError> {
        if let Some(block) = self.cache.get(height) {
            return Ok(Some(block));
        }
        self.store_reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .block(self.config.node_id, height)
    }

    pub fn config(&self) -> &ChainConfiguration {
        &self.config
    }

    pub fn head(&self) -> &ChainHead {
        &self.head
    }

    pub fn committed_height(&self) -> BlockHeight {
        self.head.height()
    }

    pub fn committed_timestamp(&self) -> Timestamp {
        self.head.timestamp()
    }

    pub fn transactions(&self) -> &Arc<TransactionStore> {
        &self.transactions
    }

    pub fn proposals(&self) -> &ProposalStore {
        &self.proposals
    }

    pub fn router(&self) -> &ConsensusRouter<BlockConsensus> {
        &self.router
    }

    pub fn cache(&self) -> &CommittedBlockCache {
        &self.cache
    }

    pub fn app(&self) -> &Arc<A> {
        &self.app
    }

    pub fn is_consensus_started(&self, height: BlockHeight) -> bool {
        self.lock().started.contains(&height)
    }

    /// Whether consensus chose `proposer`'s block at `height` but the block has not arrived yet.
    pub fn awaits_decided_proposal(&self, height: BlockHeight, proposer: ProposerIndex) -> bool {
        self.lock().pending_decision == Some((height, proposer))
    }

    fn validate_proposal(&self, proposal: &BlockProposal) -> Result<(), RejectReason> {
        if proposal.schain_id() != self.config.schain_id {
            return Err(RejectReason::WrongSchain(proposal.schain_id()));
        }
        if self.config.peers.node_of(proposal.proposer_index()).is_none() {
            return Err(RejectReason::UnknownProposer(proposal.proposer_index()));
        }
        let committed = self.head.height();
        if proposal.height() <= committed {
            return Err(RejectReason::TooLate {
                height: proposal.height(),
                committed,
            });
        }
        check_timestamp(proposal.timestamp(), self.head.timestamp())?;
        let now = Timestamp::now();
        if proposal.timestamp() > now + MAX_FUTURE_DRIFT {
            return Err(RejectReason::TimestampInFuture {
                timestamp: proposal.timestamp(),
                now,
            });
        }
        if !proposal.is_correct() {
            return Err(RejectReason::InvalidBlock(proposal.height()));
        }
        Ok(())
    }

    fn accept_proposal_locked(
        &self,
        inner: &mut ChainInner<S>,
        origin: Option<NodeId>,
        proposal: BlockProposal,
    ) -> Result<Effects, ChainError> {
        let height = proposal.height();
        let proposer_index = proposal.proposer_index();
        if self.proposals.has_proposal(height, proposer_index) {
            return Ok(Effects::default());
        }
        let hash = proposal.hash();
        let quorum_reached = self.proposals.add_proposal(proposal);
        if let Some(origin) = origin {
            log::debug!(
                "Registered proposal for height {} from proposer {} ({} of {}).",
                height,
                proposer_index,
                self.proposals.count(height),
                self.config.peers.len()
            );
            Event::publish(
                &inner.event_publisher,
                Event::ReceiveProposal(ReceiveProposalEvent {
                    timestamp: SystemTime::now(),
                    origin,
                    height,
                    proposer_index,
                    proposal: hash,
                }),
            );
        }

        if inner.pending_decision == Some((height, proposer_index)) {
            inner.pending_decision = None;
            log::info!(
                "Winning proposal for height {} from proposer {} arrived.",
                height,
                proposer_index
            );
            return self.commit_decided_locked(inner, height, Some(proposer_index));
        }
        if quorum_reached && height == self.head.height() + 1 {
            return self.start_consensus_locked(inner, height);
        }
        Ok(Effects::default())
    }

    fn start_consensus_locked(
        &self,
        inner: &mut ChainInner<S>,
        height: BlockHeight,
    ) -> Result<Effects, ChainError> {
        if !inner.started.insert(height) {
            return Ok(Effects::default());
        }
        let votes = self.proposals.get_vote_vector(height);
        log::debug!("Starting consensus for height {} with votes {:?}.", height, votes);
        inner.retransmit = Some(RetransmitSchedule {
            height,
            due: Instant::now() + self.config.retransmit_interval,
            backoff: self.config.retransmit_interval,
        });

        let mut consensus = BlockConsensus::new(
            self.config.schain_id,
            height,
            self.config.node_id,
            self.config.peers.len(),
            self.coin.clone(),
        );
        let mut batch = RouteBatch::default();
        batch.absorb(consensus.start(&votes));
        batch.extend(self.router.start_consensus(consensus));

        Event::publish(
            &inner.event_publisher,
            Event::StartConsensus(StartConsensusEvent {
                timestamp: SystemTime::now(),
                height,
                votes,
            }),
        );
        self.apply_route_batch_locked(inner, batch)
    }

    fn apply_route_batch_locked(
        &self,
        inner: &mut ChainInner<S>,
        batch: RouteBatch,
    ) -> Result<Effects, ChainError> {
        let mut effects = Effects {
            proposals: Vec::new(),
            outbound: batch.outbound,
        };
        for decision in batch.decisions {
            effects.extend(self.decided_locked(inner, decision)?);
        }
        Ok(effects)
    }

    fn decided_locked(
        &self,
        inner: &mut ChainInner<S>,
        decision: HeightDecision,
    ) -> Result<Effects, ChainError> {
        let committed = self.head.height();
        if decision.height <= committed {
            return Ok(Effects::default());
        }
        if decision.height != committed + 1 {
            return Err(InvariantViolation::DecisionOutOfOrder {
                decided: decision.height,
                expected: committed + 1,
            }
            .into());
        }
        log::info!(
            "Consensus decided height {}: {}.",
            decision.height,
            match decision.winner {
                Some(winner) => format!("proposer {}", winner),
                None => String::from("empty block"),
            }
        );
        Event::publish(
            &inner.event_publisher,
            Event::Decide(DecideEvent {
                timestamp: SystemTime::now(),
                height: decision.height,
                winner: decision.winner,
            }),
        );
        self.commit_decided_locked(inner, decision.height, decision.winner)
    }

    fn commit_decided_locked(
        &self,
        inner: &mut ChainInner<S>,
        height: BlockHeight,
        winner: Option<ProposerIndex>,
    ) -> Result<Effects, ChainError> {
        let block = match winner {
            None => CommittedBlock::empty(self.config.schain_id, height, self.head.timestamp()),
            Some(winner) => match self.proposals.get_proposal(height, winner) {
                Some(proposal) => {
                    if let Err(reason) = check_timestamp(proposal.timestamp(), self.head.timestamp()) {
                        log::warn!(
                            "Winning proposal for height {} from proposer {} cannot be committed ({}), committing an empty block.",
                            height,
                            winner,
                            reason
                        );
                        CommittedBlock::empty(self.config.schain_id, height, self.head.timestamp())
                    } else {
                        CommittedBlock::new(proposal)
                    }
                }
                None => {
                    log::info!(
                        "Height {} decided for proposer {}, whose proposal has not arrived yet.",
                        height,
                        winner
                    );
                    inner.pending_decision = Some((height, winner));
                    return Ok(Effects::default());
                }
            },
        };
        let mut effects = self.commit_locked(inner, block)?;
        effects.extend(self.next_height_locked(inner)?);
        Ok(effects)
    }

    // The single commit path, shared by consensus decisions and catchup.
    fn commit_locked(
        &self,
        inner: &mut ChainInner<S>,
        block: CommittedBlock,
    ) -> Result<Effects, ChainError> {
        let height = block.height();
        let committed = self.head.height();
        if height <= committed {
            if let Some(existing) = self.get_block(height)? {
                if existing.hash() != block.hash() {
                    return Err(InvariantViolation::ConflictingCommit {
                        height,
                        first: existing.hash(),
                        second: block.hash(),
                    }
                    .into());
                }
            }
            return Ok(Effects::default());
        }
        if height != committed + 1 {
            return Err(InvariantViolation::CommitOutOfOrder {
                height,
                expected: committed + 1,
            }
            .into());
        }
        check_timestamp(block.timestamp(), self.head.timestamp())?;

        storage::write_committed_block(&mut inner.store, self.config.node_id, &block)?;
        self.transactions.clean_committed(&block);
        self.cache.insert(block.clone());
        self.head.set(height, block.timestamp());

        inner.started = inner.started.split_off(&(height + 1));
        inner.proposed = inner.proposed.split_off(&(height + 1));
        if inner.awaiting_own_proposal.is_some_and(|awaiting| awaiting <= height) {
            inner.awaiting_own_proposal = None;
        }
        if inner
            .pending_decision
            .is_some_and(|(pending, _)| pending <= height)
        {
            inner.pending_decision = None;
        }
        self.proposals.clean_old(height);
        let stale = self.proposals.discard_stale(height + 1, block.timestamp());
        if stale > 0 {
            log::debug!(
                "Discarded {} proposals for height {} not later than the block just committed.",
                stale,
                height + 1
            );
        }

        self.app
            .create_block(block.transactions(), block.timestamp(), height);
        log::info!(
            "Committed height {} ({} transactions).",
            height,
            block.transactions().len()
        );
        Event::publish(
            &inner.event_publisher,
            Event::CommitBlock(CommitBlockEvent {
                timestamp: SystemTime::now(),
                height,
                block: block.hash(),
                proposer_index: block.proposal().proposer_index(),
                transactions: block.transactions().len(),
            }),
        );

        let batch = self.router.advance(height);
        self.apply_route_batch_locked(inner, batch)
    }

    // Propose the height after the committed one, and start consensus on it if its proposals already
    // reached quorum while we were behind.
    fn next_height_locked(&self, inner: &mut ChainInner<S>) -> Result<Effects, ChainError> {
        let next = self.head.height() + 1;
        let mut effects = self.propose_locked(inner, next)?;
        if self.proposals.has_two_thirds(next) {
            effects.extend(self.start_consensus_locked(inner, next)?);
        }
        Ok(effects)
    }

    fn retransmit_locked(&self, inner: &mut ChainInner<S>, now: Instant) -> Vec<Outbound> {
        let height = self.head.height() + 1;
        let Some(schedule) = inner.retransmit.as_mut() else {
            return Vec::new();
        };
        if schedule.height != height || now < schedule.due {
            return Vec::new();
        }
        schedule.backoff = (schedule.backoff * 2)
            .min(self.config.retransmit_interval * MAX_RETRANSMIT_BACKOFF);
        schedule.due = now + schedule.backoff;

        let outbound = self.router.retransmit(height);
        if !outbound.is_empty() {
            log::debug!(
                "Resending {} consensus messages for height {}.",
                outbound.len(),
                height
            );
        }
        outbound
    }

    fn retry_own_proposal_locked(&self, inner: &mut ChainInner<S>) -> Result<Effects, ChainError> {
        match inner.awaiting_own_proposal {
            Some(height) if height == self.head.height() + 1 => self.propose_locked(inner, height),
            _ => Ok(Effects::default()),
        }
    }

    fn propose_locked(
        &self,
        inner: &mut ChainInner<S>,
        height: BlockHeight,
    ) -> Result<Effects, ChainError> {
        if inner.proposed.contains(&height) || height != self.head.height() + 1 {
            return Ok(Effects::default());
        }
        let previous_timestamp = self.head.timestamp();
        if !self.transactions.ready_to_propose(previous_timestamp) {
            inner.awaiting_own_proposal = Some(height);
            return Ok(Effects::default());
        }

        let proposal = self.transactions.build_proposal(
            self.config.schain_id,
            height,
            self.config.proposer_index,
            previous_timestamp,
        );
        inner.proposed.insert(height);
        inner.awaiting_own_proposal = None;
        log::debug!(
            "Proposing {} transactions for height {}.",
            proposal.transactions().len(),
            height
        );
        Event::publish(
            &inner.event_publisher,
            Event::Propose(ProposeEvent {
                timestamp: SystemTime::now(),
                height,
                proposal: proposal.hash(),
                transactions: proposal.transactions().len(),
            }),
        );

        let mut effects = Effects {
            proposals: vec![proposal.clone()],
            outbound: Vec::new(),
        };
        effects.extend(self.accept_proposal_locked(inner, None, proposal)?);
        Ok(effects)
    }

    fn lock(&self) -> MutexGuard<'_, ChainInner<S>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn check_timestamp(timestamp: Timestamp, committed: Timestamp) -> Result<(), RejectReason> {
    if timestamp <= PROTOCOL_EPOCH {
        return Err(RejectReason::BeforeEpoch { timestamp });
    }
    if timestamp <= committed {
        return Err(RejectReason::StaleTimestamp {
            timestamp,
            committed,
        });
    }
    Ok(())
}
