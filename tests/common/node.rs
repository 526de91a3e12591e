use std::time::{Duration, Instant};

use schain_consensus::{
    events::{CommitBlockEvent, DecideEvent, ReceiveProposalEvent, StartCatchupEvent},
    health::HealthStatus,
    node::{Configuration, Node, NodeSpec},
    types::{
        basic::{BlockHeight, NodeId, SchainId},
        block::CommittedBlock,
        peers::PeerSet,
    },
};

use super::{
    app::{AppBlock, RecordingApp},
    logging::{first_seven_base64_chars, log_with_context},
    mem_store::MemStore,
    network::NetworkStub,
};

pub(crate) const SCHAIN_ID: SchainId = SchainId::new(7);

/// Things the nodes will have in common:
/// - Peer set.
/// - Configuration, apart from the node id.
///
/// Things that they will differ in:
/// - App instance.
/// - Network instance.
/// - BlockStore.
pub(crate) struct TestNode {
    node_id: NodeId,
    app: RecordingApp,
    store: MemStore,
    node: Node<NetworkStub, MemStore, RecordingApp>,
}

impl TestNode {
    pub(crate) fn new(node_id: NodeId, peers: PeerSet, network: NetworkStub) -> TestNode {
        TestNode::with_store(node_id, peers, network, MemStore::new())
    }

    pub(crate) fn with_store(
        node_id: NodeId,
        peers: PeerSet,
        network: NetworkStub,
        store: MemStore,
    ) -> TestNode {
        let app = RecordingApp::new();
        let configuration = Configuration::builder()
            .schain_id(SCHAIN_ID)
            .node_id(node_id)
            .peers(peers)
            .empty_block_interval(Duration::from_millis(200))
            .deferred_retry_interval(Duration::from_millis(20))
            .wait_after_network_error(Duration::from_millis(100))
            .proposal_ack_timeout(Duration::from_millis(300))
            .consensus_retransmit_interval(Duration::from_millis(200))
            .catchup_interval(Duration::from_millis(300))
            .catchup_response_timeout(Duration::from_millis(500))
            .peer_read_timeout(Duration::from_millis(20))
            .health_check_timeout(Duration::from_secs(10))
            .log_events(true)
            .build();

        let node = NodeSpec::builder()
            .app(app.clone())
            .transport(network)
            .block_store(store.clone())
            .configuration(configuration)
            .on_commit_block(commit_block_handler(node_id))
            .on_receive_proposal(receive_proposal_handler(node_id))
            .on_decide(decide_handler(node_id))
            .on_start_catchup(start_catchup_handler(node_id))
            .build()
            .start()
            .unwrap();

        TestNode {
            node_id,
            app,
            store,
            node,
        }
    }

    pub(crate) fn submit_transaction(&self, payload: Vec<u8>) {
        self.app.submit(payload);
    }

    pub(crate) fn committed_height(&self) -> BlockHeight {
        self.node.committed_height()
    }

    pub(crate) fn committed_payloads(&self) -> Vec<Vec<u8>> {
        self.app.committed_payloads()
    }

    pub(crate) fn app_blocks(&self) -> Vec<AppBlock> {
        self.app.blocks()
    }

    pub(crate) fn block(&self, height: BlockHeight) -> Option<CommittedBlock> {
        self.node.get_block(height).unwrap()
    }

    pub(crate) fn health(&self) -> HealthStatus {
        self.node.health()
    }

    pub(crate) fn store(&self) -> MemStore {
        self.store.clone()
    }

    pub(crate) fn node_id(&self) -> NodeId {
        self.node_id
    }
}

pub(crate) fn peer_set(n: u64) -> PeerSet {
    PeerSet::new((1..=n).map(NodeId::new))
}

/// Poll `condition` until it holds, panicking after `timeout`.
pub(crate) fn wait_until(timeout: Duration, what: &str, mut condition: impl FnMut() -> bool) {
    let started = Instant::now();
    while !condition() {
        if started.elapsed() > timeout {
            panic!("timed out after {:?} waiting until {}", timeout, what);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn commit_block_handler(node_id: NodeId) -> impl Fn(&CommitBlockEvent) + Send + 'static {
    move |commit_block_event| {
        log_with_context(
            Some(node_id),
            &format!(
                "Committed Block, height: {}, block hash: {}, transactions: {}",
                commit_block_event.height,
                first_seven_base64_chars(&commit_block_event.block.bytes()),
                commit_block_event.transactions
            ),
        );
    }
}

fn receive_proposal_handler(node_id: NodeId) -> impl Fn(&ReceiveProposalEvent) + Send + 'static {
    move |receive_proposal_event| {
        log_with_context(
            Some(node_id),
            &format!(
                "Received Proposal, origin: {}, height: {}, proposer: {}, hash: {}",
                receive_proposal_event.origin,
                receive_proposal_event.height,
                receive_proposal_event.proposer_index,
                first_seven_base64_chars(&receive_proposal_event.proposal.bytes())
            ),
        );
    }
}

fn decide_handler(node_id: NodeId) -> impl Fn(&DecideEvent) + Send + 'static {
    move |decide_event| {
        log_with_context(
            Some(node_id),
            &format!(
                "Decided, height: {}, winner: {:?}",
                decide_event.height, decide_event.winner
            ),
        );
    }
}

fn start_catchup_handler(node_id: NodeId) -> impl Fn(&StartCatchupEvent) + Send + 'static {
    move |start_catchup_event| {
        log_with_context(
            Some(node_id),
            &format!(
                "Catching up from node {}, from height {}",
                start_catchup_event.peer, start_catchup_event.from_height
            ),
        );
    }
}
