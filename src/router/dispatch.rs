/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Dispatch of binary consensus messages to the instance they belong to.
//!
//! ## Routing policy
//!
//! Let `committed` be the local committed height. A message for height `H`, proposer `P`, round `R`
//! is:
//! 1. Dropped if `H <= committed`: the height is settled.
//! 2. Deferred if `H > committed + 1`, or if consensus for `H` has not started locally.
//! 3. Processed if `P`'s instance has already decided. A decided instance ignores the message except
//!    to help a peer in a later round catch up.
//! 4. Processed if `R <= localRound(H, P) + 1`.
//! 5. Dropped if `R` is more than [`MAX_ROUND_LEAD`] rounds ahead of `localRound(H, P)` (or of round 0
//!    if there is no instance yet). Honest peers retransmit, so the message comes back once this node
//!    is close enough to use it.
//! 6. Deferred otherwise.
//!
//! Deferred messages are re-routed whenever consensus starts for a height, whenever the committed
//! height advances, and on a timer (to follow round advances that happen without a height advance).

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::binary_consensus::block_consensus::HeightDecision;
use crate::binary_consensus::messages::{BinaryConsensusMessage, Outbound};
use crate::router::deferred::DeferredMessageQueue;
use crate::types::basic::{BlockHeight, NodeId, ProposerIndex, Round};

/// How many rounds ahead of the local round a message may be and still be deferred.
pub const MAX_ROUND_LEAD: u64 = 16;

/// Anything that can consume routed binary consensus messages for one height.
pub trait MessageHandler: Send {
    fn height(&self) -> BlockHeight;

    /// The round the instance for `proposer` is in, or `None` if there is no such instance.
    fn round(&self, proposer: ProposerIndex) -> Option<Round>;

    fn is_decided(&self, proposer: ProposerIndex) -> bool;

    fn handle(&mut self, msg: &BinaryConsensusMessage) -> HandlerOutput;

    /// Messages already sent that should be sent again, in case the network lost them.
    fn retransmit(&mut self) -> Vec<Outbound> {
        Vec::new()
    }
}

#[derive(Debug, Default)]
pub struct HandlerOutput {
    pub outbound: Vec<Outbound>,
    pub decision: Option<HeightDecision>,
}

#[derive(Debug)]
pub enum RouteOutcome {
    Processed(HandlerOutput),
    Deferred,
    Dropped,
}

/// Accumulated result of routing several messages.
#[derive(Debug, Default)]
pub struct RouteBatch {
    pub outbound: Vec<Outbound>,
    pub decisions: Vec<HeightDecision>,
    pub processed: usize,
    pub deferred: usize,
}

impl RouteBatch {
    pub fn absorb(&mut self, output: HandlerOutput) {
        self.outbound.extend(output.outbound);
        self.decisions.extend(output.decision);
    }

    pub fn extend(&mut self, other: RouteBatch) {
        self.outbound.extend(other.outbound);
        self.decisions.extend(other.decisions);
        self.processed += other.processed;
        self.deferred += other.deferred;
    }
}

pub struct ConsensusRouter<H: MessageHandler> {
    inner: Mutex<RouterInner<H>>,
}

struct RouterInner<H> {
    committed: BlockHeight,
    instances: BTreeMap<BlockHeight, H>,
    deferred: DeferredMessageQueue<BinaryConsensusMessage>,
}

impl<H: MessageHandler> ConsensusRouter<H> {
    /// A router that defers at most `deferred_capacity` messages, shared equally among `senders`.
    pub fn new(committed: BlockHeight, deferred_capacity: usize, senders: u64) -> ConsensusRouter<H> {
        ConsensusRouter {
            inner: Mutex::new(RouterInner {
                committed,
                instances: BTreeMap::new(),
                deferred: DeferredMessageQueue::new(deferred_capacity, senders),
            }),
        }
    }

    pub fn route(&self, msg: BinaryConsensusMessage) -> RouteOutcome {
        self.lock().route(msg)
    }

    /// Remove and return every deferred message for heights up to and including `current`.
    pub fn drain_ready_messages(&self, current: BlockHeight) -> Vec<BinaryConsensusMessage> {
        self.lock().deferred.drain_ready(current)
    }

    /// Install `handler` for its height, then re-route whatever was deferred. Installing a second
    /// handler for the same height, or one for a settled height, does nothing.
    pub fn start_consensus(&self, handler: H) -> RouteBatch {
        let mut inner = self.lock();
        let height = handler.height();
        if height <= inner.committed || inner.instances.contains_key(&height) {
            return RouteBatch::default();
        }
        inner.instances.insert(height, handler);
        inner.reroute_ready()
    }

    /// Record that `committed` is now committed: drop its instance and everything deferred for it or
    /// below, then re-route what is ready.
    pub fn advance(&self, committed: BlockHeight) -> RouteBatch {
        let mut inner = self.lock();
        if committed <= inner.committed {
            return RouteBatch::default();
        }
        inner.committed = committed;
        inner.instances = inner.instances.split_off(&(committed + 1));
        let expired = inner.deferred.remove_expired(committed);
        if expired > 0 {
            log::debug!("Dropped {} deferred messages for heights up to {}.", expired, committed);
        }
        inner.reroute_ready()
    }

    /// Re-route every deferred message that may have become processable.
    pub fn reroute(&self) -> RouteBatch {
        self.lock().reroute_ready()
    }

    /// Ask the instance for `height`, if any, for the messages it should send again.
    pub fn retransmit(&self, height: BlockHeight) -> Vec<Outbound> {
        self.lock()
            .instances
            .get_mut(&height)
            .map(|instance| instance.retransmit())
            .unwrap_or_default()
    }

    pub fn committed(&self) -> BlockHeight {
        self.lock().committed
    }

    pub fn has_instance(&self, height: BlockHeight) -> bool {
        self.lock().instances.contains_key(&height)
    }

    pub fn deferred_count(&self) -> usize {
        self.lock().deferred.len()
    }

    pub fn deferred_count_at(&self, height: BlockHeight) -> usize {
        self.lock().deferred.len_at(height)
    }

    pub fn deferred_count_from(&self, sender: NodeId) -> usize {
        self.lock().deferred.sender_len(sender)
    }

    fn lock(&self) -> MutexGuard<'_, RouterInner<H>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<H: MessageHandler> RouterInner<H> {
    fn route(&mut self, msg: BinaryConsensusMessage) -> RouteOutcome {
        let height = msg.height;
        if height <= self.committed {
            return RouteOutcome::Dropped;
        }
        let instance = if height == self.committed + 1 {
            self.instances.get_mut(&height)
        } else {
            None
        };
        let Some(instance) = instance else {
            return self.defer(msg, Round::new(0));
        };
        let Some(local_round) = instance.round(msg.proposer_index) else {
            return RouteOutcome::Dropped;
        };
        if instance.is_decided(msg.proposer_index) || msg.round <= local_round.next() {
            return RouteOutcome::Processed(instance.handle(&msg));
        }
        self.defer(msg, local_round)
    }

    fn defer(&mut self, msg: BinaryConsensusMessage, local_round: Round) -> RouteOutcome {
        if msg.round.int() > local_round.int().saturating_add(MAX_ROUND_LEAD) {
            return RouteOutcome::Dropped;
        }
        if self.deferred.push(msg.height, msg.sender, msg.round, msg) {
            RouteOutcome::Deferred
        } else {
            RouteOutcome::Dropped
        }
    }

    fn reroute_ready(&mut self) -> RouteBatch {
        let mut batch = RouteBatch::default();
        let ready = self.deferred.drain_ready(self.committed + 1);
        for msg in ready {
            match self.route(msg) {
                RouteOutcome::Processed(output) => {
                    batch.processed += 1;
                    batch.absorb(output);
                }
                RouteOutcome::Deferred => batch.deferred += 1,
                RouteOutcome::Dropped => (),
            }
        }
        batch
    }
}
