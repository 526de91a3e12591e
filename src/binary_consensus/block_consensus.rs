/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The set of binary consensus instances that together decide one height.
//!
//! One instance runs per proposer, each deciding "is this proposer's block a candidate?". The height's
//! winner is the lowest-indexed proposer whose instance decided 1, known as soon as every lower-indexed
//! instance has decided 0. If every instance decides 0, the height commits an empty block.

use std::sync::Arc;

use crate::binary_consensus::coin::CommonCoin;
use crate::binary_consensus::messages::{BinaryConsensusMessage, Outbound};
use crate::binary_consensus::round::BinaryConsensusRound;
use crate::router::dispatch::{HandlerOutput, MessageHandler};
use crate::types::basic::*;

/// The agreed outcome of a height: the winning proposer, or `None` for an empty block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeightDecision {
    pub height: BlockHeight,
    pub winner: Option<ProposerIndex>,
}

pub struct BlockConsensus {
    height: BlockHeight,
    instances: Vec<BinaryConsensusRound>,
    reported: bool,
}

impl BlockConsensus {
    pub fn new(
        schain_id: SchainId,
        height: BlockHeight,
        me: NodeId,
        total: u64,
        coin: Arc<dyn CommonCoin>,
    ) -> BlockConsensus {
        let instances = (1..=total)
            .map(|i| {
                BinaryConsensusRound::new(
                    schain_id,
                    height,
                    ProposerIndex::new(i),
                    me,
                    total,
                    coin.clone(),
                )
            })
            .collect();
        BlockConsensus {
            height,
            instances,
            reported: false,
        }
    }

    pub fn height(&self) -> BlockHeight {
        self.height
    }

    /// Start every instance, voting `votes[i]` in proposer `i + 1`'s instance. Missing entries vote 0.
    ///
    /// With a single node the height is decided here, without any message exchange.
    pub fn start(&mut self, votes: &[bool]) -> HandlerOutput {
        let outbound: Vec<Outbound> = self
            .instances
            .iter_mut()
            .enumerate()
            .flat_map(|(i, instance)| instance.start(votes.get(i).copied().unwrap_or(false)))
            .collect();
        HandlerOutput {
            outbound,
            decision: self.report_decision(),
        }
    }

    /// The height's outcome, once enough instances have decided.
    pub fn decision(&self) -> Option<HeightDecision> {
        for (i, instance) in self.instances.iter().enumerate() {
            match instance.decided() {
                None => return None,
                Some(true) => {
                    return Some(HeightDecision {
                        height: self.height,
                        winner: Some(ProposerIndex::new(i as u64 + 1)),
                    })
                }
                Some(false) => continue,
            }
        }
        Some(HeightDecision {
            height: self.height,
            winner: None,
        })
    }

    // The decision, the first time it is available.
    fn report_decision(&mut self) -> Option<HeightDecision> {
        if self.reported {
            return None;
        }
        let decision = self.decision();
        self.reported = decision.is_some();
        decision
    }

    fn instance(&self, proposer: ProposerIndex) -> Option<&BinaryConsensusRound> {
        (proposer.int() as usize)
            .checked_sub(1)
            .and_then(|i| self.instances.get(i))
    }
}

impl MessageHandler for BlockConsensus {
    fn height(&self) -> BlockHeight {
        self.height
    }

    fn round(&self, proposer: ProposerIndex) -> Option<Round> {
        self.instance(proposer).map(|instance| instance.round())
    }

    fn is_decided(&self, proposer: ProposerIndex) -> bool {
        self.instance(proposer)
            .is_some_and(|instance| instance.is_decided())
    }

    fn handle(&mut self, msg: &BinaryConsensusMessage) -> HandlerOutput {
        let Some(instance) = (msg.proposer_index.int() as usize)
            .checked_sub(1)
            .and_then(|i| self.instances.get_mut(i))
        else {
            return HandlerOutput::default();
        };
        let outbound = instance.handle(msg);
        HandlerOutput {
            outbound,
            decision: self.report_decision(),
        }
    }

    fn retransmit(&mut self) -> Vec<Outbound> {
        self.instances
            .iter_mut()
            .flat_map(|instance| instance.retransmit())
            .collect()
    }
}
