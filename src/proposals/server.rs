/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Implements the [ProposalServer], the receiving side of the proposal push protocol.
//!
//! The server's responsibility is to:
//! 1. Validate every pushed [`ProposalPush`] header and answer invalid ones with a
//!    [`ProposalResponse`] whose status explains the rejection.
//! 2. Reassemble valid proposals from local transaction bodies, asking the proposer for the missing
//!    ones, and hand complete proposals to the [`ChainState`]. The proposer is then told the outcome
//!    with a [`ProposalResponse`], which ends its push.
//! 3. Answer peers' [`MissingTransactionsRequest`]s for our own proposals.
//! 4. Record the peers' answers to our own pushes in [`PushAcks`].
//!
//! One reassembly session is kept per (origin, height). Sessions for committed heights are dropped,
//! and so are sessions that made no progress for `session_timeout`; the proposer's next push then
//! starts a fresh one.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::algorithm::Effector;
use crate::app::App;
use crate::chain::ChainState;
use crate::errors::{ChainError, ExitRequested, RejectReason};
use crate::lifecycle::{ExitFlag, StartBarrier};
use crate::networking::network::PeerTransport;
use crate::networking::sending::SenderHandle;
use crate::proposals::pusher::PushAcks;
use crate::storage::BlockStore;
use crate::transactions::reconciliation::{
    missing_transactions_response, Reconciliation, ReconciliationStep,
};
use crate::types::basic::*;
use crate::types::peers::PeerSet;

use super::messages::*;

/// Immutable parameters that define the behaviour of the [ProposalServer].
pub(crate) struct ProposalServerConfiguration {
    pub(crate) schain_id: SchainId,
    pub(crate) me: NodeId,
    pub(crate) proposer_index: ProposerIndex,
    pub(crate) peers: PeerSet,
    pub(crate) poll_interval: Duration,
    pub(crate) session_timeout: Duration,
}

// A reassembly in progress, and when it last moved forward.
struct Session {
    reconciliation: Reconciliation,
    updated: Instant,
}

pub(crate) struct ProposalServer<N: PeerTransport, S: BlockStore, A: App> {
    config: ProposalServerConfiguration,
    chain: Arc<ChainState<S, A>>,
    receiver: Receiver<(NodeId, ProposalMessage)>,
    sender: SenderHandle<N>,
    effector: Effector<N>,
    acks: PushAcks,
    sessions: HashMap<(NodeId, BlockHeight), Session>,
    start: StartBarrier,
    exit: ExitFlag,
}

impl<N: PeerTransport, S: BlockStore, A: App> ProposalServer<N, S, A> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ProposalServerConfiguration,
        chain: Arc<ChainState<S, A>>,
        receiver: Receiver<(NodeId, ProposalMessage)>,
        sender: SenderHandle<N>,
        acks: PushAcks,
        effector: Effector<N>,
        start: StartBarrier,
        exit: ExitFlag,
    ) -> Self {
        Self {
            config,
            chain,
            receiver,
            sender,
            effector,
            acks,
            sessions: HashMap::new(),
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
            match self.receiver.recv_timeout(self.config.poll_interval) {
                Ok((origin, msg)) => self.on_message(origin, msg)?,
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return Err(ExitRequested),
            }
            let committed = self.chain.committed_height();
            let timeout = self.config.session_timeout;
            self.sessions.retain(|(_, height), session| {
                *height > committed && session.updated.elapsed() < timeout
            });
        }
    }

    fn on_message(&mut self, origin: NodeId, msg: ProposalMessage) -> Result<(), ExitRequested> {
        match msg {
            ProposalMessage::ProposalPush(header) => self.on_proposal_push(origin, header),
            ProposalMessage::MissingTransactionsRequest(request) => {
                self.on_missing_transactions_request(origin, request);
                Ok(())
            }
            ProposalMessage::MissingTransactionsResponse(response) => {
                self.on_missing_transactions_response(origin, response)
            }
            ProposalMessage::ProposalResponse(response) => {
                if response.schain_id == self.config.schain_id {
                    self.acks.record(origin, response.height, response.status);
                }
                Ok(())
            }
        }
    }

    fn on_proposal_push(&mut self, origin: NodeId, header: ProposalPush) -> Result<(), ExitRequested> {
        if let Err(reason) = self.check_header(origin, &header) {
            log::debug!(
                "Rejecting proposal for height {} from node {}: {:?}.",
                header.height,
                origin,
                reason
            );
            self.respond(origin, header.schain_id, header.height, ConnectionStatus::Disconnect(reason));
            return Ok(());
        }
        if self
            .chain
            .proposals()
            .has_proposal(header.height, header.proposer_index)
        {
            self.respond(origin, header.schain_id, header.height, ConnectionStatus::Proceed);
            return Ok(());
        }
        if self
            .sessions
            .get(&(origin, header.height))
            .is_some_and(|session| session.updated.elapsed() < self.config.session_timeout)
        {
            return Ok(());
        }

        let height = header.height;
        match Reconciliation::start(header, self.chain.transactions()) {
            Ok((session, step)) => self.advance(origin, height, session, step),
            Err(err) => {
                log::debug!("Dropping proposal for height {} from node {}: {}.", height, origin, err);
                Ok(())
            }
        }
    }

    // Header checks, in the order their statuses take precedence.
    fn check_header(&self, origin: NodeId, header: &ProposalPush) -> Result<(), DisconnectReason> {
        if header.schain_id != self.config.schain_id {
            return Err(DisconnectReason::UnknownSchain);
        }
        let Some(origin_index) = self.config.peers.index_of(&origin) else {
            return Err(DisconnectReason::UnknownSourceIp);
        };
        if header.node_id != origin {
            return Err(DisconnectReason::InvalidNodeId);
        }
        if header.proposer_index != origin_index {
            return Err(DisconnectReason::InvalidSubchainIndex);
        }
        if header.height <= self.chain.committed_height() {
            return Err(DisconnectReason::TooLateBlock);
        }
        if header.timestamp > Timestamp::now() + MAX_FUTURE_DRIFT {
            return Err(DisconnectReason::TimestampInFuture);
        }
        if header.timestamp <= self.chain.committed_timestamp()
            && !self
                .chain
                .awaits_decided_proposal(header.height, header.proposer_index)
        {
            return Err(DisconnectReason::TimestampEarlierThanCommitted);
        }
        Ok(())
    }

    fn on_missing_transactions_request(&mut self, origin: NodeId, request: MissingTransactionsRequest) {
        if request.schain_id != self.config.schain_id {
            self.respond(
                origin,
                request.schain_id,
                request.height,
                ConnectionStatus::Disconnect(DisconnectReason::UnknownSchain),
            );
            return;
        }
        let own = if request.proposer_index == self.config.proposer_index {
            self.chain
                .proposals()
                .get_proposal(request.height, self.config.proposer_index)
        } else {
            None
        };
        let response = own
            .ok_or(())
            .and_then(|proposal| {
                missing_transactions_response(&proposal, &request).map_err(|err| {
                    log::debug!("Bad missing-transactions request from node {}: {}.", origin, err);
                })
            });
        match response {
            Ok(response) => {
                if let Err(err) = self.sender.send(origin, response) {
                    log::debug!("Could not answer missing-transactions request: {}.", err);
                }
            }
            Err(()) => self.respond(
                origin,
                request.schain_id,
                request.height,
                ConnectionStatus::ServerError,
            ),
        }
    }

    fn on_missing_transactions_response(
        &mut self,
        origin: NodeId,
        response: MissingTransactionsResponse,
    ) -> Result<(), ExitRequested> {
        let height = response.height;
        let Some(Session {
            reconciliation: mut session,
            ..
        }) = self.sessions.remove(&(origin, height))
        else {
            return Ok(());
        };
        match session.accept_response(response, self.chain.transactions()) {
            Ok(step) => self.advance(origin, height, session, step),
            Err(err) => {
                log::debug!(
                    "Abandoning proposal for height {} from node {}: {}.",
                    height,
                    origin,
                    err
                );
                Ok(())
            }
        }
    }

    fn advance(
        &mut self,
        origin: NodeId,
        height: BlockHeight,
        session: Reconciliation,
        step: ReconciliationStep,
    ) -> Result<(), ExitRequested> {
        match step {
            ReconciliationStep::Request(request) => {
                log::debug!(
                    "Requesting {} transactions of proposal for height {} from node {}.",
                    request.indices.len(),
                    height,
                    origin
                );
                match self.sender.send(origin, request) {
                    Ok(()) => {
                        self.sessions.insert(
                            (origin, height),
                            Session {
                                reconciliation: session,
                                updated: Instant::now(),
                            },
                        );
                    }
                    Err(err) => log::debug!("Could not request missing transactions: {}.", err),
                }
                Ok(())
            }
            ReconciliationStep::Complete(proposal) => {
                let schain_id = proposal.schain_id();
                let result = self.chain.on_proposal_arrived(origin, proposal);
                self.respond(origin, schain_id, height, arrival_status(&result));
                self.effector.apply("proposal server", result)
            }
        }
    }

    fn respond(&mut self, origin: NodeId, schain_id: SchainId, height: BlockHeight, status: ConnectionStatus) {
        let response = ProposalResponse {
            schain_id,
            height,
            status,
        };
        if let Err(err) = self.sender.send(origin, response) {
            log::debug!("Could not send proposal response to node {}: {}.", origin, err);
        }
    }
}

// What the proposer is told once its proposal reached the chain.
fn arrival_status<T>(result: &Result<T, ChainError>) -> ConnectionStatus {
    let reason = match result {
        Ok(_) => return ConnectionStatus::Proceed,
        Err(ChainError::Rejected(reason)) => reason,
        Err(_) => return ConnectionStatus::ServerError,
    };
    match reason {
        RejectReason::WrongSchain(_) => ConnectionStatus::Disconnect(DisconnectReason::UnknownSchain),
        RejectReason::TooLate { .. } => ConnectionStatus::Disconnect(DisconnectReason::TooLateBlock),
        RejectReason::BeforeEpoch { .. } | RejectReason::StaleTimestamp { .. } => {
            ConnectionStatus::Disconnect(DisconnectReason::TimestampEarlierThanCommitted)
        }
        RejectReason::TimestampInFuture { .. } => {
            ConnectionStatus::Disconnect(DisconnectReason::TimestampInFuture)
        }
        RejectReason::UnknownProposer(_) => {
            ConnectionStatus::Disconnect(DisconnectReason::InvalidSubchainIndex)
        }
        RejectReason::InvalidBlock(_) => ConnectionStatus::ServerError,
    }
}
