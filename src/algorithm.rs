/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The threads that drive binary consensus.
//!
//! Consensus advances on two threads:
//! 1. The *dispatch* thread receives [binary consensus messages](crate::binary_consensus::messages)
//!    from the poller and routes them through the chain's
//!    [`ConsensusRouter`](crate::router::ConsensusRouter). A message that completes a height's decision
//!    is followed by [`ChainState::on_consensus_decided`], which commits and proposes the next height.
//! 2. The *retry* thread wakes up every `deferred_retry_interval` and calls [`ChainState::tick`], which
//!    re-routes deferred messages and retries a self-proposal that was held back.
//!
//! Both only send after the chain lock is released, through an [`Effector`].

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crate::app::App;
use crate::binary_consensus::messages::{BinaryConsensusMessage, Outbound};
use crate::chain::{ChainState, Effects};
use crate::errors::{ChainError, ExitRequested};
use crate::events::{DeferMessageEvent, Event};
use crate::lifecycle::{ExitFlag, StartBarrier};
use crate::networking::network::PeerTransport;
use crate::networking::sending::SenderHandle;
use crate::proposals::pusher::ProposalQueues;
use crate::router::RouteOutcome;
use crate::storage::BlockStore;
use crate::types::basic::NodeId;

/// Carries out the [`Effects`] of chain operations: our proposals go to the push workers, consensus
/// messages straight to the transport.
#[derive(Clone)]
pub(crate) struct Effector<N: PeerTransport> {
    sender: SenderHandle<N>,
    proposal_queues: ProposalQueues,
    exit: ExitFlag,
}

impl<N: PeerTransport> Effector<N> {
    pub(crate) fn new(
        sender: SenderHandle<N>,
        proposal_queues: ProposalQueues,
        exit: ExitFlag,
    ) -> Effector<N> {
        Effector {
            sender,
            proposal_queues,
            exit,
        }
    }

    pub(crate) fn execute(&mut self, effects: Effects) {
        for proposal in &effects.proposals {
            self.proposal_queues.push(proposal);
        }
        self.sender.send_outbound(effects.outbound);
    }

    pub(crate) fn send_outbound(&mut self, outbound: Vec<Outbound>) {
        self.sender.send_outbound(outbound);
    }

    /// Execute the effects of a successful chain operation. A rejection is logged and ignored; a fatal
    /// error brings the node down.
    pub(crate) fn apply(
        &mut self,
        context: &str,
        result: Result<Effects, ChainError>,
    ) -> Result<(), ExitRequested> {
        match result {
            Ok(effects) => {
                self.execute(effects);
                Ok(())
            }
            Err(ChainError::ExitRequested(exit_requested)) => Err(exit_requested),
            Err(err) if err.is_fatal() => {
                self.exit.exit_on_fatal_error(context, &err);
                Err(ExitRequested)
            }
            Err(err) => {
                log::debug!("{}: {}.", context, err);
                Ok(())
            }
        }
    }
}

pub(crate) struct Dispatcher<N: PeerTransport, S: BlockStore, A: App> {
    chain: Arc<ChainState<S, A>>,
    consensus_messages: Receiver<(NodeId, BinaryConsensusMessage)>,
    effector: Effector<N>,
    event_publisher: Option<Sender<Event>>,
    poll_interval: Duration,
    start: StartBarrier,
    exit: ExitFlag,
}

impl<N: PeerTransport, S: BlockStore, A: App> Dispatcher<N, S, A> {
    pub(crate) fn new(
        chain: Arc<ChainState<S, A>>,
        consensus_messages: Receiver<(NodeId, BinaryConsensusMessage)>,
        effector: Effector<N>,
        event_publisher: Option<Sender<Event>>,
        poll_interval: Duration,
        start: StartBarrier,
        exit: ExitFlag,
    ) -> Self {
        Self {
            chain,
            consensus_messages,
            effector,
            event_publisher,
            poll_interval,
            start,
            exit,
        }
    }

    pub(crate) fn start(mut self) -> JoinHandle<()> {
        thread::spawn(move || {
            let _ = self.run();
        })
    }

    fn run(&mut self) -> Result<(), ExitRequested> {
        self.start.wait_for_start(&self.exit)?;
        loop {
            self.exit.check()?;
            match self.consensus_messages.recv_timeout(self.poll_interval) {
                Ok((origin, msg)) => self.on_consensus_message(origin, msg)?,
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return Err(ExitRequested),
            }
        }
    }

    fn on_consensus_message(
        &mut self,
        origin: NodeId,
        msg: BinaryConsensusMessage,
    ) -> Result<(), ExitRequested> {
        let (height, proposer_index, round) = (msg.height, msg.proposer_index, msg.round);
        match self.chain.router().route(msg) {
            RouteOutcome::Processed(output) => {
                self.effector.send_outbound(output.outbound);
                if let Some(decision) = output.decision {
                    let result = self.chain.on_consensus_decided(decision);
                    self.effector.apply("consensus dispatch", result)?;
                }
            }
            RouteOutcome::Deferred => Event::publish(
                &self.event_publisher,
                Event::DeferMessage(DeferMessageEvent {
                    timestamp: SystemTime::now(),
                    origin,
                    height,
                    proposer_index,
                    round,
                }),
            ),
            RouteOutcome::Dropped => (),
        }
        Ok(())
    }
}

/// Spawn the retry thread.
pub(crate) fn start_retry_thread<N: PeerTransport, S: BlockStore, A: App>(
    chain: Arc<ChainState<S, A>>,
    mut effector: Effector<N>,
    interval: Duration,
    start: StartBarrier,
    exit: ExitFlag,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut run = || -> Result<(), ExitRequested> {
            start.wait_for_start(&exit)?;
            loop {
                exit.sleep(interval)?;
                effector.apply("deferred retry", chain.tick())?;
            }
        };
        let _ = run();
    })
}
