use std::{
    collections::{HashMap, HashSet},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    time::Duration,
};

use schain_consensus::{
    errors::TransportError,
    networking::{
        messages::{decode_frame, encode_frame, Message},
        network::PeerTransport,
    },
    types::basic::NodeId,
};

/// A mock network stub which passes encoded frames from and to threads using channels.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    my_node_id: NodeId,
    all_peers: HashMap<NodeId, Sender<(NodeId, Vec<u8>)>>,
    inbox: Arc<Mutex<Receiver<(NodeId, Vec<u8>)>>>,
    isolated: Arc<Mutex<HashSet<NodeId>>>,
    deaf_to_proposals: Arc<Mutex<HashSet<NodeId>>>,
}

impl PeerTransport for NetworkStub {
    fn send(&mut self, peer: NodeId, message: Message) -> Result<(), TransportError> {
        if self.is_isolated(self.my_node_id) || self.is_isolated(peer) {
            return Err(TransportError::Disconnected(peer));
        }
        let Some(peer_inbox) = self.all_peers.get(&peer) else {
            return Err(TransportError::UnknownPeer(peer));
        };
        if matches!(message, Message::ProposalMessage(_))
            && self.deaf_to_proposals.lock().unwrap().contains(&peer)
        {
            // Lost in transit: the sender cannot tell.
            return Ok(());
        }
        let frame = encode_frame(&message).unwrap();
        peer_inbox
            .send((self.my_node_id, frame))
            .map_err(|_| TransportError::Disconnected(peer))
    }

    fn recv(&mut self, timeout: Duration) -> Option<(NodeId, Message)> {
        match self.inbox.lock().unwrap().recv_timeout(timeout) {
            Ok((origin, frame)) => Some((origin, decode_frame(&frame).unwrap())),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn reachable(&mut self, peer: NodeId) -> bool {
        self.all_peers.contains_key(&peer)
            && !self.is_isolated(self.my_node_id)
            && !self.is_isolated(peer)
    }
}

impl NetworkStub {
    fn is_isolated(&self, node: NodeId) -> bool {
        self.isolated.lock().unwrap().contains(&node)
    }
}

/// Cuts nodes off from, and reconnects them to, a mock network.
#[derive(Clone)]
pub(crate) struct NetworkControl {
    isolated: Arc<Mutex<HashSet<NodeId>>>,
    deaf_to_proposals: Arc<Mutex<HashSet<NodeId>>>,
}

impl NetworkControl {
    pub(crate) fn isolate(&self, node: NodeId) {
        self.isolated.lock().unwrap().insert(node);
    }

    pub(crate) fn reconnect(&self, node: NodeId) {
        self.isolated.lock().unwrap().remove(&node);
        self.deaf_to_proposals.lock().unwrap().remove(&node);
    }

    /// Silently lose every proposal protocol message sent to `node`, until it is reconnected.
    pub(crate) fn lose_proposal_messages_to(&self, node: NodeId) {
        self.deaf_to_proposals.lock().unwrap().insert(node);
    }
}

pub(crate) fn mock_network(
    peers: impl Iterator<Item = NodeId>,
) -> (NetworkControl, Vec<NetworkStub>) {
    let isolated = Arc::new(Mutex::new(HashSet::new()));
    let deaf_to_proposals = Arc::new(Mutex::new(HashSet::new()));
    let mut all_peers = HashMap::new();
    let peer_and_inboxes: Vec<(NodeId, Receiver<(NodeId, Vec<u8>)>)> = peers
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(peer, sender);

            (peer, receiver)
        })
        .collect();

    let stubs = peer_and_inboxes
        .into_iter()
        .map(|(my_node_id, inbox)| NetworkStub {
            my_node_id,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
            isolated: isolated.clone(),
            deaf_to_proposals: deaf_to_proposals.clone(),
        })
        .collect();

    (
        NetworkControl {
            isolated,
            deaf_to_proposals,
        },
        stubs,
    )
}
