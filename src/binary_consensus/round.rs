/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A single instance of signature-free asynchronous binary Byzantine agreement.
//!
//! Each round `r` runs two broadcasts:
//! 1. BV-broadcast. A node broadcasts `BV(r, est)`. A value seen from `f + 1` distinct senders is
//!    echoed (at least one honest node sent it). A value seen from a two-thirds quorum enters the
//!    round's `bin_values`.
//! 2. AUX-broadcast. When the first value enters `bin_values`, the node broadcasts `AUX(r, v)`.
//!
//! Once a two-thirds quorum of AUX messages carry values within `bin_values`, the node tosses the
//! round's common coin `c`. If those AUX values are all `v`, the estimate becomes `v` and the instance
//! decides `v` when `v == c`. Otherwise the estimate becomes `c`. Undecided instances move to `r + 1`.
//!
//! Decisions are irrevocable. A decided instance stays in its deciding round and keeps helping: any
//! message from the deciding round or a later one is answered, once per sender and round, with `BV` and
//! `AUX` for the decided value.
//!
//! ## Losses
//!
//! Nothing here assumes reliable delivery. [`BinaryConsensusRound::retransmit`] returns the messages
//! already broadcast in the current round, for the caller to send again with backoff. A message from a
//! round this instance has already left is answered, once per sender and round until the next
//! retransmission, with what this instance sent in that round, so a peer that lost messages of an old
//! round can still finish it.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::binary_consensus::coin::CommonCoin;
use crate::binary_consensus::messages::*;
use crate::types::basic::*;

pub struct BinaryConsensusRound {
    schain_id: SchainId,
    height: BlockHeight,
    proposer_index: ProposerIndex,
    me: NodeId,
    total: u64,
    max_faulty: u64,
    coin: Arc<dyn CommonCoin>,
    started: bool,
    round: Round,
    estimate: bool,
    decision: Option<(bool, Round)>,
    tallies: BTreeMap<Round, RoundTally>,
    helped: HashSet<(NodeId, Round)>,
}

#[derive(Default)]
struct RoundTally {
    bv_from: [HashSet<NodeId>; 2],
    bv_sent: [bool; 2],
    bin_values: [bool; 2],
    aux_from: HashMap<NodeId, bool>,
    aux_sent: Option<bool>,
}

type Pending = VecDeque<(NodeId, Round, BinaryMessageKind, bool)>;

impl BinaryConsensusRound {
    pub fn new(
        schain_id: SchainId,
        height: BlockHeight,
        proposer_index: ProposerIndex,
        me: NodeId,
        total: u64,
        coin: Arc<dyn CommonCoin>,
    ) -> BinaryConsensusRound {
        BinaryConsensusRound {
            schain_id,
            height,
            proposer_index,
            me,
            total,
            max_faulty: total.saturating_sub(1) / 3,
            coin,
            started: false,
            round: Round::new(0),
            estimate: false,
            decision: None,
            tallies: BTreeMap::new(),
            helped: HashSet::new(),
        }
    }

    /// Enter round 0 with `estimate` as the initial vote. Only the first call has an effect.
    pub fn start(&mut self, estimate: bool) -> Vec<Outbound> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        self.estimate = estimate;
        let mut out = Vec::new();
        let mut pending = Pending::new();
        self.enter_round(&mut out, &mut pending);
        self.drain(out, pending)
    }

    /// Process a message from a peer. `msg` must belong to this instance.
    pub fn handle(&mut self, msg: &BinaryConsensusMessage) -> Vec<Outbound> {
        if msg.round < self.round {
            return self.replay_round(msg.sender, msg.round);
        }
        if let Some((value, _)) = self.decision {
            let mut out = Vec::new();
            if self.helped.insert((msg.sender, msg.round)) {
                out.push(Outbound::SendTo(
                    msg.sender,
                    self.message(msg.round, BinaryMessageKind::Bv, value),
                ));
                out.push(Outbound::SendTo(
                    msg.sender,
                    self.message(msg.round, BinaryMessageKind::Aux, value),
                ));
            }
            return out;
        }

        let mut pending = Pending::new();
        pending.push_back((msg.sender, msg.round, msg.kind, msg.value));
        self.drain(Vec::new(), pending)
    }

    /// What this instance broadcast in its current round (its deciding round, once decided), to be
    /// sent again. Also lets every peer be helped once more.
    pub fn retransmit(&mut self) -> Vec<Outbound> {
        self.helped.clear();
        if !self.started {
            return Vec::new();
        }
        self.sent_in(self.round)
            .into_iter()
            .map(Outbound::Broadcast)
            .collect()
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn decided(&self) -> Option<bool> {
        self.decision.map(|(value, _)| value)
    }

    pub fn is_decided(&self) -> bool {
        self.decision.is_some()
    }

    pub fn estimate(&self) -> bool {
        self.estimate
    }

    // Apply messages, including the ones this node sends itself, until none are left.
    fn drain(&mut self, mut out: Vec<Outbound>, mut pending: Pending) -> Vec<Outbound> {
        while let Some((sender, round, kind, value)) = pending.pop_front() {
            match kind {
                BinaryMessageKind::Bv => self.on_bv(sender, round, value, &mut out, &mut pending),
                BinaryMessageKind::Aux => self.on_aux(sender, round, value, &mut out, &mut pending),
            }
        }
        out
    }

    fn on_bv(
        &mut self,
        sender: NodeId,
        round: Round,
        value: bool,
        out: &mut Vec<Outbound>,
        pending: &mut Pending,
    ) {
        if round < self.round {
            return;
        }
        let v = value as usize;
        let total = self.total;
        let amplify_at = self.max_faulty + 1;
        let is_current = round == self.round && self.started;

        let tally = self.tallies.entry(round).or_default();
        if !tally.bv_from[v].insert(sender) {
            return;
        }
        let count = tally.bv_from[v].len() as u64;

        let echo = count >= amplify_at && !tally.bv_sent[v];
        if echo {
            tally.bv_sent[v] = true;
        }
        let mut send_aux = false;
        if two_thirds(count, total) && !tally.bin_values[v] {
            tally.bin_values[v] = true;
            if is_current && tally.aux_sent.is_none() {
                tally.aux_sent = Some(value);
                send_aux = true;
            }
        }

        if echo {
            self.broadcast(round, BinaryMessageKind::Bv, value, out, pending);
        }
        if send_aux {
            self.broadcast(round, BinaryMessageKind::Aux, value, out, pending);
        }
        self.try_progress(out, pending);
    }

    fn on_aux(
        &mut self,
        sender: NodeId,
        round: Round,
        value: bool,
        out: &mut Vec<Outbound>,
        pending: &mut Pending,
    ) {
        if round < self.round {
            return;
        }
        self.tallies
            .entry(round)
            .or_default()
            .aux_from
            .entry(sender)
            .or_insert(value);
        self.try_progress(out, pending);
    }

    fn try_progress(&mut self, out: &mut Vec<Outbound>, pending: &mut Pending) {
        while self.started && self.decision.is_none() {
            let Some(tally) = self.tallies.get(&self.round) else {
                return;
            };
            if tally.aux_sent.is_none() {
                return;
            }
            let mut seen = [false; 2];
            let supporting = tally
                .aux_from
                .values()
                .filter(|value| tally.bin_values[**value as usize])
                .inspect(|value| seen[**value as usize] = true)
                .count() as u64;
            if !two_thirds(supporting, self.total) {
                return;
            }

            let coin = self.coin.toss(&ConsensusKey {
                height: self.height,
                proposer_index: self.proposer_index,
                round: self.round,
            });
            if seen[0] != seen[1] {
                let value = seen[1];
                self.estimate = value;
                if value == coin {
                    self.decision = Some((value, self.round));
                    return;
                }
            } else {
                self.estimate = coin;
            }

            self.round = self.round.next();
            self.enter_round(out, pending);
        }
    }

    // Broadcast the estimate for the current round, and AUX too if a value already entered this
    // round's bin_values from messages that ran ahead.
    fn enter_round(&mut self, out: &mut Vec<Outbound>, pending: &mut Pending) {
        let round = self.round;
        let estimate = self.estimate;
        let tally = self.tallies.entry(round).or_default();

        let send_bv = !tally.bv_sent[estimate as usize];
        if send_bv {
            tally.bv_sent[estimate as usize] = true;
        }
        let aux_value = if tally.aux_sent.is_some() {
            None
        } else if tally.bin_values[estimate as usize] {
            Some(estimate)
        } else if tally.bin_values[!estimate as usize] {
            Some(!estimate)
        } else {
            None
        };
        if aux_value.is_some() {
            tally.aux_sent = aux_value;
        }

        if send_bv {
            self.broadcast(round, BinaryMessageKind::Bv, estimate, out, pending);
        }
        if let Some(value) = aux_value {
            self.broadcast(round, BinaryMessageKind::Aux, value, out, pending);
        }
    }

    // Answer `sender`, which is still in `round`, with what we sent in that round.
    fn replay_round(&mut self, sender: NodeId, round: Round) -> Vec<Outbound> {
        if sender == self.me || !self.helped.insert((sender, round)) {
            return Vec::new();
        }
        self.sent_in(round)
            .into_iter()
            .map(|msg| Outbound::SendTo(sender, msg))
            .collect()
    }

    fn sent_in(&self, round: Round) -> Vec<BinaryConsensusMessage> {
        let Some(tally) = self.tallies.get(&round) else {
            return Vec::new();
        };
        let mut sent: Vec<BinaryConsensusMessage> = [false, true]
            .into_iter()
            .filter(|value| tally.bv_sent[*value as usize])
            .map(|value| self.message(round, BinaryMessageKind::Bv, value))
            .collect();
        sent.extend(
            tally
                .aux_sent
                .map(|value| self.message(round, BinaryMessageKind::Aux, value)),
        );
        sent
    }

    fn broadcast(
        &self,
        round: Round,
        kind: BinaryMessageKind,
        value: bool,
        out: &mut Vec<Outbound>,
        pending: &mut Pending,
    ) {
        out.push(Outbound::Broadcast(self.message(round, kind, value)));
        pending.push_back((self.me, round, kind, value));
    }

    fn message(&self, round: Round, kind: BinaryMessageKind, value: bool) -> BinaryConsensusMessage {
        BinaryConsensusMessage {
            schain_id: self.schain_id,
            height: self.height,
            proposer_index: self.proposer_index,
            round,
            kind,
            value,
            sender: self.me,
        }
    }
}
