/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions and types for sending messages to the [`PeerTransport`].

use crate::binary_consensus::messages::Outbound;
use crate::errors::TransportError;
use crate::types::basic::NodeId;
use crate::types::peers::PeerSet;

use super::messages::Message;
use super::network::PeerTransport;

/// Handle for sending and broadcasting messages to the [`PeerTransport`].
///
/// It can be used to send or broadcast instances of any type that implement the [`Into<Message>`]
/// trait. Broadcasts go to every member of the peer set except this node.
#[derive(Clone)]
pub(crate) struct SenderHandle<N: PeerTransport> {
    transport: N,
    me: NodeId,
    peers: PeerSet,
}

impl<N: PeerTransport> SenderHandle<N> {
    pub(crate) fn new(transport: N, me: NodeId, peers: PeerSet) -> Self {
        Self {
            transport,
            me,
            peers,
        }
    }

    pub(crate) fn send<S: Into<Message>>(
        &mut self,
        peer: NodeId,
        msg: S,
    ) -> Result<(), TransportError> {
        self.transport.send(peer, msg.into())
    }

    /// Send `msg` to every peer, continuing past failures. Returns the failures.
    pub(crate) fn broadcast<S: Into<Message>>(&mut self, msg: S) -> Vec<TransportError> {
        let msg = msg.into();
        let others: Vec<NodeId> = self.peers.others(self.me).collect();
        others
            .into_iter()
            .filter_map(|peer| self.transport.send(peer, msg.clone()).err())
            .collect()
    }

    /// Send consensus output. Consensus messages are never retried: lost messages are made up for by
    /// the retransmissions of decided instances.
    pub(crate) fn send_outbound(&mut self, outbound: Vec<Outbound>) {
        for out in outbound {
            let failures = match out {
                Outbound::Broadcast(msg) => self.broadcast(msg),
                Outbound::SendTo(peer, msg) => self.send(peer, msg).err().into_iter().collect(),
            };
            for failure in failures {
                log::debug!("Consensus message not delivered: {}.", failure);
            }
        }
    }

    pub(crate) fn reachable(&mut self, peer: NodeId) -> bool {
        self.transport.reachable(peer)
    }

    pub(crate) fn shutdown(&mut self) {
        self.transport.shutdown()
    }
}
