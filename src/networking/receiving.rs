/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions and types for receiving messages from the [`PeerTransport`].

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::binary_consensus::messages::BinaryConsensusMessage;
use crate::catchup::messages::{CatchupMessage, CatchupRequest, CatchupResponse};
use crate::errors::ProtocolError;
use crate::lifecycle::ExitFlag;
use crate::proposals::messages::ProposalMessage;
use crate::types::basic::{NodeId, SchainId};
use crate::types::peers::PeerSet;

use super::messages::Message;
use super::network::PeerTransport;

/// Receiving ends for each kind of message, one per consuming thread.
pub(crate) struct Inboxes {
    pub(crate) proposal_messages: Receiver<(NodeId, ProposalMessage)>,
    pub(crate) consensus_messages: Receiver<(NodeId, BinaryConsensusMessage)>,
    pub(crate) catchup_requests: Receiver<(NodeId, CatchupRequest)>,
    pub(crate) catchup_responses: Receiver<(NodeId, CatchupResponse)>,
}

struct Outlets {
    proposal_messages: Sender<(NodeId, ProposalMessage)>,
    consensus_messages: Sender<(NodeId, BinaryConsensusMessage)>,
    catchup_requests: Sender<(NodeId, CatchupRequest)>,
    catchup_responses: Sender<(NodeId, CatchupResponse)>,
}

/// Spawn the poller thread, which polls the [`PeerTransport`] for messages and distributes them into
/// the returned [`Inboxes`].
///
/// Binary consensus messages and catchup responses are checked here: they are dropped unless they come
/// from a member of `peers`, carry our `schain_id`, and (for consensus messages) name their actual
/// origin as sender. Proposal messages and catchup requests are passed on unchecked, because their
/// servers answer invalid requests with a status code.
pub(crate) fn start_polling<N: PeerTransport>(
    mut transport: N,
    schain_id: SchainId,
    peers: PeerSet,
    read_timeout: Duration,
    exit: ExitFlag,
) -> (JoinHandle<()>, Inboxes) {
    let (proposal_tx, proposal_rx) = mpsc::channel();
    let (consensus_tx, consensus_rx) = mpsc::channel();
    let (catchup_request_tx, catchup_request_rx) = mpsc::channel();
    let (catchup_response_tx, catchup_response_rx) = mpsc::channel();
    let outlets = Outlets {
        proposal_messages: proposal_tx,
        consensus_messages: consensus_tx,
        catchup_requests: catchup_request_tx,
        catchup_responses: catchup_response_tx,
    };

    let poller = thread::spawn(move || {
        while !exit.is_exit_requested() {
            let Some((origin, msg)) = transport.recv(read_timeout) else {
                continue;
            };
            if let Err(err) = check(schain_id, &peers, origin, &msg) {
                log::debug!("Dropping message from node {}: {}.", origin, err);
                continue;
            }
            outlets.distribute(origin, msg);
        }
    });

    (
        poller,
        Inboxes {
            proposal_messages: proposal_rx,
            consensus_messages: consensus_rx,
            catchup_requests: catchup_request_rx,
            catchup_responses: catchup_response_rx,
        },
    )
}

fn check(
    schain_id: SchainId,
    peers: &PeerSet,
    origin: NodeId,
    msg: &Message,
) -> Result<(), ProtocolError> {
    match msg {
        Message::ProposalMessage(_) | Message::CatchupMessage(CatchupMessage::CatchupRequest(_)) => {
            return Ok(())
        }
        _ => (),
    }
    if msg.schain_id() != schain_id {
        return Err(ProtocolError::UnknownSchain(msg.schain_id()));
    }
    if !peers.contains(&origin) {
        return Err(ProtocolError::UnknownSender(origin));
    }
    if let Message::ConsensusMessage(consensus_msg) = msg {
        if consensus_msg.sender != origin {
            return Err(ProtocolError::SenderMismatch {
                claimed: consensus_msg.sender,
                origin,
            });
        }
    }
    Ok(())
}

impl Outlets {
    // A consumer only hangs up during shutdown, so send failures are ignored.
    fn distribute(&self, origin: NodeId, msg: Message) {
        match msg {
            Message::ProposalMessage(msg) => {
                let _ = self.proposal_messages.send((origin, msg));
            }
            Message::ConsensusMessage(msg) => {
                let _ = self.consensus_messages.send((origin, msg));
            }
            Message::CatchupMessage(CatchupMessage::CatchupRequest(msg)) => {
                let _ = self.catchup_requests.send((origin, msg));
            }
            Message::CatchupMessage(CatchupMessage::CatchupResponse(msg)) => {
                let _ = self.catchup_responses.send((origin, msg));
            }
        }
    }
}
