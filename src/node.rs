/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a consensus node.
//!
//! A node takes part in consensus for one schain, together with the fixed set of peers listed in its
//! [`Configuration`]. Every node proposes a block at every height; binary consensus then agrees on
//! which of the proposals is committed.
//!
//! ## Starting a node
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .schain_id(SchainId::new(1))
//!     .node_id(NodeId::new(1))
//!     .peers(PeerSet::new([NodeId::new(1), NodeId::new(2), NodeId::new(3), NodeId::new(4)]))
//!     .empty_block_interval(Duration::from_secs(1))
//!     .log_events(true)
//!     .build();
//!
//! let node =
//!     NodeSpec::builder()
//!     .app(app)
//!     .transport(transport)
//!     .block_store(block_store)
//!     .configuration(configuration)
//!     .on_commit_block(commit_handler)
//!     .build()
//!     .start()?;
//! ```
//!
//! ### Required setters
//!
//! - `.app(...)`
//! - `.transport(...)`
//! - `.block_store(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! - `.common_coin(...)`, to replace the default [`HashCoin`].
//! - One handler per event type in [crate::events]: `.on_commit_block(...)`, `.on_propose(...)`,
//!   `.on_receive_proposal(...)`, `.on_start_consensus(...)`, `.on_decide(...)`,
//!   `.on_defer_message(...)`, `.on_start_catchup(...)`, `.on_end_catchup(...)`,
//!   `.on_receive_catchup_request(...)`.
//!
//! ## Start-up
//!
//! [`NodeSpec::start`] spawns every thread at once, but workers wait until the node has bootstrapped.
//! A start-up thread first waits until a two-thirds quorum of nodes is reachable (giving up after
//! `health_check_timeout`), then restores the committed chain from the block store, proposes the next
//! height and releases the workers. The [`HealthStatus`] follows these steps.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::algorithm::{start_retry_thread, Dispatcher, Effector};
use crate::app::App;
use crate::binary_consensus::coin::{CommonCoin, HashCoin};
use crate::catchup::client::{CatchupClient, CatchupClientConfiguration};
use crate::catchup::server::{CatchupServer, CatchupServerConfiguration};
use crate::chain::{ChainConfiguration, ChainState};
use crate::event_bus::*;
use crate::events::*;
use crate::health::{wait_for_quorum, HealthCheckError, HealthMonitor, HealthStatus};
use crate::lifecycle::{ExitFlag, StartBarrier};
use crate::networking::network::PeerTransport;
use crate::networking::receiving::start_polling;
use crate::networking::sending::SenderHandle;
use crate::proposals::pusher::{start_push_workers, PushAcks, PushTimings};
use crate::proposals::server::{ProposalServer, ProposalServerConfiguration};
use crate::storage::{BlockStore, StorageError};
use crate::transactions::ext_queue::start_ext_queue_sync;
use crate::transactions::{TransactionStore, TransactionStoreConfiguration};
use crate::types::basic::*;
use crate::types::block::CommittedBlock;
use crate::types::peers::PeerSet;

const SUPERVISION_INTERVAL: Duration = Duration::from_millis(500);

/// Stores the user-defined parameters required to start a node.
///
/// Only the identity of the node and of its schain are required. Every tunable has a default.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.schain_id(...)`
    - `.node_id(...)`
    - `.peers(...)`

    Every other setter is optional.
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the identifier of the schain, carried in every message. Required."))]
    pub schain_id: SchainId,
    #[builder(setter(doc = "Set this node's network identity. It must be a member of `peers`. Required."))]
    pub node_id: NodeId,
    #[builder(setter(doc = "Set the fixed set of nodes taking part in consensus, in proposer index order. Required."))]
    pub peers: PeerSet,
    #[builder(default = 1000, setter(doc = "Set the largest number of transactions in a proposal. Defaults to 1000."))]
    pub max_transactions_per_block: usize,
    #[builder(default = 1_000_000, setter(doc = "Set how many committed transactions are remembered to reject replays. Defaults to 1 000 000."))]
    pub committed_transactions_history: usize,
    #[builder(default = 10, setter(doc = "Set how many recently committed blocks are cached in memory. Defaults to 10."))]
    pub committed_block_storage_size: usize,
    #[builder(default = Duration::from_secs(3), setter(doc = "Set how long to wait for transactions before proposing an empty block. Defaults to 3 s."))]
    pub empty_block_interval: Duration,
    #[builder(default = Duration::from_millis(100), setter(doc = "Set the period of the retry thread. Defaults to 100 ms."))]
    pub deferred_retry_interval: Duration,
    #[builder(default = 100_000, setter(doc = "Set the largest number of binary consensus messages kept for later processing. Defaults to 100 000."))]
    pub deferred_message_capacity: usize,
    #[builder(default = 64, setter(doc = "Set the length of each peer's queue of proposals waiting to be pushed. Defaults to 64."))]
    pub block_proposal_history_size: usize,
    #[builder(default = Duration::from_secs(1), setter(doc = "Set the wait before retrying a failed proposal push. Defaults to 1 s."))]
    pub wait_after_network_error: Duration,
    #[builder(default = Duration::from_secs(2), setter(doc = "Set how long a proposal push waits for the peer's answer before pushing again, and how long an unfinished reassembly is kept. Defaults to 2 s."))]
    pub proposal_ack_timeout: Duration,
    #[builder(default = Duration::from_secs(1), setter(doc = "Set the first delay before the running height's consensus messages are sent again. The delay doubles on every resend of the same height. Defaults to 1 s."))]
    pub consensus_retransmit_interval: Duration,
    #[builder(default = 16, setter(doc = "Set how many committed heights a transaction body seen only in proposals is kept for. Defaults to 16."))]
    pub known_transactions_retention: u64,
    #[builder(default = Duration::from_secs(2), setter(doc = "Set the period between catchup requests. Defaults to 2 s."))]
    pub catchup_interval: Duration,
    #[builder(default = Duration::from_secs(2), setter(doc = "Set how long to wait for a catchup response. Defaults to 2 s."))]
    pub catchup_response_timeout: Duration,
    #[builder(default = 100, setter(doc = "Set the largest number of blocks in a catchup response. Defaults to 100."))]
    pub max_catchup_download_blocks: u64,
    #[builder(default = 64 * 1024 * 1024, setter(doc = "Set the largest number of transaction bytes in a catchup response. Defaults to 64 MiB."))]
    pub max_catchup_download_bytes: u64,
    #[builder(default = Duration::from_millis(100), setter(doc = "Set the longest a thread blocks on a receive before checking for shutdown. Defaults to 100 ms."))]
    pub peer_read_timeout: Duration,
    #[builder(default = Duration::from_secs(600), setter(doc = "Set how long start-up waits for a quorum of reachable peers. Defaults to 600 s."))]
    pub health_check_timeout: Duration,
    #[builder(default, setter(strip_option, doc = "Set a file to mirror the health status into. Optional."))]
    pub health_check_file: Option<PathBuf>,
    #[builder(default = false, setter(doc = "Enable logging of every event as a CSV line? Defaults to false."))]
    pub log_events: bool,
}

/// Stores all necessary parameters and trait implementations required to run a [Node].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [NodeSpec]. On the builder call the following methods to construct a valid [NodeSpec].

    Required:
    - `.app(...)`
    - `.transport(...)`
    - `.block_store(...)`
    - `.configuration(...)`

    Optional:
    - `.common_coin(...)`
    - `.on_commit_block(...)`
    - `.on_propose(...)`
    - `.on_receive_proposal(...)`
    - `.on_start_consensus(...)`
    - `.on_decide(...)`
    - `.on_defer_message(...)`
    - `.on_start_catchup(...)`
    - `.on_end_catchup(...)`
    - `.on_receive_catchup_request(...)`
"))]
pub struct NodeSpec<N: PeerTransport, S: BlockStore, A: App> {
    // Required parameters
    #[builder(setter(doc = "Set the application that supplies transactions and receives committed blocks. Required."))]
    app: A,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. Required."))]
    transport: N,
    #[builder(setter(doc = "Set the key-value store committed blocks are persisted into. Required."))]
    block_store: S,
    #[builder(setter(doc = "Set the [configuration](Configuration). Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default, setter(transform = |coin: impl CommonCoin + 'static| Some(Arc::new(coin) as Arc<dyn CommonCoin>),
    doc = "Set the common coin of binary consensus. Every node of the schain must use the same coin. Defaults to [`HashCoin`]. Optional."))]
    common_coin: Option<Arc<dyn CommonCoin>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitBlockEvent>),
    doc = "Register a handler closure to be invoked after a block is committed. Optional."))]
    on_commit_block: Option<HandlerPtr<CommitBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProposeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProposeEvent>),
    doc = "Register a handler closure to be invoked after the node makes its proposal for a height. Optional."))]
    on_propose: Option<HandlerPtr<ProposeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveProposalEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveProposalEvent>),
    doc = "Register a handler closure to be invoked after a peer's proposal is reassembled and registered. Optional."))]
    on_receive_proposal: Option<HandlerPtr<ReceiveProposalEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartConsensusEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartConsensusEvent>),
    doc = "Register a handler closure to be invoked after binary consensus starts for a height. Optional."))]
    on_start_consensus: Option<HandlerPtr<StartConsensusEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&DecideEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<DecideEvent>),
    doc = "Register a handler closure to be invoked after binary consensus decides a height. Optional."))]
    on_decide: Option<HandlerPtr<DecideEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&DeferMessageEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<DeferMessageEvent>),
    doc = "Register a handler closure to be invoked after a consensus message is buffered for later processing. Optional."))]
    on_defer_message: Option<HandlerPtr<DeferMessageEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartCatchupEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartCatchupEvent>),
    doc = "Register a handler closure to be invoked before blocks downloaded from a peer are applied. Optional."))]
    on_start_catchup: Option<HandlerPtr<StartCatchupEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&EndCatchupEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<EndCatchupEvent>),
    doc = "Register a handler closure to be invoked after blocks downloaded from a peer are applied. Optional."))]
    on_end_catchup: Option<HandlerPtr<EndCatchupEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveCatchupRequestEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveCatchupRequestEvent>),
    doc = "Register a handler closure to be invoked after a peer asks for committed blocks. Optional."))]
    on_receive_catchup_request: Option<HandlerPtr<ReceiveCatchupRequestEvent>>,
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node {0} is not a member of the configured peer set")]
    NotInPeerSet(NodeId),
}

impl<N: PeerTransport, S: BlockStore, A: App> NodeSpec<N, S, A> {
    /// Starts all threads associated with running a node, and returns the handles to them in a [Node].
    pub fn start(self) -> Result<Node<N, S, A>, NodeError> {
        let config = self.configuration;
        let me = config.node_id;
        let proposer_index = config
            .peers
            .index_of(&me)
            .ok_or(NodeError::NotInPeerSet(me))?;

        let exit = ExitFlag::new();
        let start = StartBarrier::new();
        let health = HealthMonitor::new(config.health_check_file.clone());

        let event_handlers = EventHandlers::new(
            config.log_events,
            self.on_commit_block,
            self.on_propose,
            self.on_receive_proposal,
            self.on_start_consensus,
            self.on_decide,
            self.on_defer_message,
            self.on_start_catchup,
            self.on_end_catchup,
            self.on_receive_catchup_request,
        );
        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let transactions = Arc::new(TransactionStore::new(TransactionStoreConfiguration {
            max_transactions_per_block: config.max_transactions_per_block,
            committed_transactions_history: config.committed_transactions_history,
            empty_block_interval: config.empty_block_interval,
            known_transactions_retention: config.known_transactions_retention,
        }));
        let coin = self
            .common_coin
            .unwrap_or_else(|| Arc::new(HashCoin::new(config.schain_id)));
        let chain = Arc::new(ChainState::new(
            ChainConfiguration {
                schain_id: config.schain_id,
                node_id: me,
                proposer_index,
                peers: config.peers.clone(),
                committed_block_storage_size: config.committed_block_storage_size,
                deferred_message_capacity: config.deferred_message_capacity,
                retransmit_interval: config.consensus_retransmit_interval,
            },
            transactions,
            self.block_store,
            Arc::new(self.app),
            coin,
            event_publisher.clone(),
        ));

        let mut threads = Vec::new();
        let (poller, inboxes) = start_polling(
            self.transport.clone(),
            config.schain_id,
            config.peers.clone(),
            config.peer_read_timeout,
            exit.clone(),
        );
        threads.push(poller);

        let sender = SenderHandle::new(self.transport.clone(), me, config.peers.clone());
        let push_acks = PushAcks::new(&exit);
        let (proposal_queues, push_workers) = start_push_workers(
            sender.clone(),
            me,
            config.peers.iter().map(|(_, node)| node),
            chain.head().clone(),
            push_acks.clone(),
            PushTimings {
                history_size: config.block_proposal_history_size,
                wait_after_network_error: config.wait_after_network_error,
                ack_timeout: config.proposal_ack_timeout,
            },
            exit.clone(),
        );
        threads.extend(push_workers);
        let effector = Effector::new(sender.clone(), proposal_queues, exit.clone());

        threads.push(
            Dispatcher::new(
                chain.clone(),
                inboxes.consensus_messages,
                effector.clone(),
                event_publisher.clone(),
                config.peer_read_timeout,
                start.clone(),
                exit.clone(),
            )
            .start(),
        );
        threads.push(start_retry_thread(
            chain.clone(),
            effector.clone(),
            config.deferred_retry_interval,
            start.clone(),
            exit.clone(),
        ));
        threads.push(
            ProposalServer::new(
                ProposalServerConfiguration {
                    schain_id: config.schain_id,
                    me,
                    proposer_index,
                    peers: config.peers.clone(),
                    poll_interval: config.peer_read_timeout,
                    session_timeout: config.proposal_ack_timeout,
                },
                chain.clone(),
                inboxes.proposal_messages,
                sender.clone(),
                push_acks,
                effector.clone(),
                start.clone(),
                exit.clone(),
            )
            .start(),
        );
        threads.push(start_ext_queue_sync(
            chain.clone(),
            effector.clone(),
            config.max_transactions_per_block,
            config.deferred_retry_interval,
            start.clone(),
            exit.clone(),
        ));
        threads.push(
            CatchupServer::new(
                CatchupServerConfiguration {
                    schain_id: config.schain_id,
                    peers: config.peers.clone(),
                    max_blocks: config.max_catchup_download_blocks,
                    max_bytes: config.max_catchup_download_bytes,
                    poll_interval: config.peer_read_timeout,
                },
                chain.clone(),
                inboxes.catchup_requests,
                sender.clone(),
                event_publisher.clone(),
                start.clone(),
                exit.clone(),
            )
            .start(),
        );
        threads.push(
            CatchupClient::new(
                CatchupClientConfiguration {
                    schain_id: config.schain_id,
                    peers: config.peers.others(me).collect(),
                    interval: config.catchup_interval,
                    response_timeout: config.catchup_response_timeout,
                },
                chain.clone(),
                inboxes.catchup_responses,
                sender.clone(),
                effector.clone(),
                event_publisher,
                start.clone(),
                exit.clone(),
            )
            .start(),
        );
        if let Some(event_subscriber) = event_subscriber {
            threads.push(start_event_bus(event_handlers, event_subscriber, exit.clone()));
        }

        let startup = Startup {
            chain: chain.clone(),
            sender,
            effector,
            peers: config.peers.clone(),
            me,
            health_check_timeout: config.health_check_timeout,
            health: health.clone(),
            start,
            exit: exit.clone(),
        };
        threads.push(thread::spawn(move || startup.run()));

        Ok(Node {
            chain,
            health,
            exit,
            threads,
            transport: self.transport,
        })
    }
}

// Runs the start-up sequence, then supervises the node until it exits.
struct Startup<N: PeerTransport, S: BlockStore, A: App> {
    chain: Arc<ChainState<S, A>>,
    sender: SenderHandle<N>,
    effector: Effector<N>,
    peers: PeerSet,
    me: NodeId,
    health_check_timeout: Duration,
    health: HealthMonitor,
    start: StartBarrier,
    exit: ExitFlag,
}

impl<N: PeerTransport, S: BlockStore, A: App> Startup<N, S, A> {
    fn run(mut self) {
        self.health.set(HealthStatus::NotConnected);
        match wait_for_quorum(
            &mut self.sender,
            self.me,
            &self.peers,
            self.health_check_timeout,
            &self.exit,
        ) {
            Ok(()) => (),
            Err(HealthCheckError::ExitRequested(_)) => return,
            Err(err) => {
                self.health.set(HealthStatus::Failed);
                self.exit.exit_on_fatal_error("start-up health check", &err);
                return;
            }
        }
        self.health.set(HealthStatus::Connected);

        match self.chain.bootstrap() {
            Ok(effects) => self.effector.execute(effects),
            Err(err) => {
                self.health.set(HealthStatus::Failed);
                self.exit.exit_on_fatal_error("bootstrap", &err);
                return;
            }
        }
        log::info!(
            "Node {} running from committed height {}.",
            self.me,
            self.chain.committed_height()
        );
        self.start.signal_start();
        self.health.set(HealthStatus::Running);

        while self.exit.sleep(SUPERVISION_INTERVAL).is_ok() {}
        if self.exit.is_failed() {
            self.health.set(HealthStatus::Failed);
        }
    }
}

/// A handle to the background threads of a node. When this value is dropped, all background threads
/// are shut down and joined, then the transport is shut down.
pub struct Node<N: PeerTransport, S: BlockStore, A: App> {
    chain: Arc<ChainState<S, A>>,
    health: HealthMonitor,
    exit: ExitFlag,
    threads: Vec<JoinHandle<()>>,
    transport: N,
}

impl<N: PeerTransport, S: BlockStore, A: App> Node<N, S, A> {
    pub fn committed_height(&self) -> BlockHeight {
        self.chain.committed_height()
    }

    /// The committed block at `height`, if any.
    pub fn get_block(&self, height: BlockHeight) -> Result<Option<CommittedBlock>, StorageError> {
        self.chain.get_block(height)
    }

    pub fn health(&self) -> HealthStatus {
        if self.exit.is_failed() {
            HealthStatus::Failed
        } else {
            self.health.status()
        }
    }

    /// Whether the node stopped, because of [`shutdown`](Self::shutdown) or a fatal error.
    pub fn is_exited(&self) -> bool {
        self.exit.is_exit_requested()
    }

    /// Submit a transaction directly, bypassing [`App::pending_transactions`]. Returns whether it was
    /// new.
    pub fn submit_transaction(&self, payload: Vec<u8>) -> bool {
        self.chain
            .transactions()
            .admit(crate::types::transaction::Transaction::new(payload))
    }

    pub fn chain(&self) -> &ChainState<S, A> {
        &self.chain
    }

    /// Ask every thread to stop. Dropping the node does this too, and also waits for them.
    pub fn shutdown(&self) {
        self.exit.request_exit();
    }
}

impl<N: PeerTransport, S: BlockStore, A: App> Drop for Node<N, S, A> {
    fn drop(&mut self) {
        self.exit.request_exit();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                log::error!("A node thread panicked.");
            }
        }
        self.transport.shutdown();
    }
}
