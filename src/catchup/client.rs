/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The catchup client thread.
//!
//! Every `catchup_interval` the client asks one randomly chosen peer for the committed blocks above
//! its own committed height, waits up to `catchup_response_timeout` for the answer, and applies the
//! longest prefix of blocks that verify. Peers that are not ahead answer with an empty list, which
//! costs one round-trip and nothing else.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use rand::seq::SliceRandom;

use crate::algorithm::Effector;
use crate::app::App;
use crate::chain::ChainState;
use crate::errors::ExitRequested;
use crate::events::{EndCatchupEvent, Event, StartCatchupEvent};
use crate::lifecycle::{ExitFlag, StartBarrier};
use crate::networking::network::PeerTransport;
use crate::networking::sending::SenderHandle;
use crate::proposals::messages::ConnectionStatus;
use crate::storage::BlockStore;
use crate::types::basic::*;
use crate::types::block::CommittedBlock;

use super::messages::{CatchupRequest, CatchupResponse};

const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Immutable parameters that define the behaviour of the [CatchupClient].
pub(crate) struct CatchupClientConfiguration {
    pub(crate) schain_id: SchainId,
    pub(crate) peers: Vec<NodeId>,
    pub(crate) interval: Duration,
    pub(crate) response_timeout: Duration,
}

pub(crate) struct CatchupClient<N: PeerTransport, S: BlockStore, A: App> {
    config: CatchupClientConfiguration,
    chain: Arc<ChainState<S, A>>,
    responses: Receiver<(NodeId, CatchupResponse)>,
    sender: SenderHandle<N>,
    effector: Effector<N>,
    event_publisher: Option<Sender<Event>>,
    start: StartBarrier,
    exit: ExitFlag,
}

impl<N: PeerTransport, S: BlockStore, A: App> CatchupClient<N, S, A> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: CatchupClientConfiguration,
        chain: Arc<ChainState<S, A>>,
        responses: Receiver<(NodeId, CatchupResponse)>,
        sender: SenderHandle<N>,
        effector: Effector<N>,
        event_publisher: Option<Sender<Event>>,
        start: StartBarrier,
        exit: ExitFlag,
    ) -> Self {
        Self {
            config,
            chain,
            responses,
            sender,
            effector,
            event_publisher,
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
            self.exit.sleep(self.config.interval)?;
            let Some(peer) = self.config.peers.choose(&mut rand::thread_rng()).copied() else {
                continue;
            };
            self.catchup_from(peer)?;
        }
    }

    fn catchup_from(&mut self, peer: NodeId) -> Result<(), ExitRequested> {
        let from_height = self.chain.committed_height() + 1;
        let request = CatchupRequest {
            schain_id: self.config.schain_id,
            from_height,
        };
        if let Err(err) = self.sender.send(peer, request) {
            log::debug!("Could not send catchup request: {}.", err);
            return Ok(());
        }

        let Some(response) = self.wait_for_response(peer, from_height)? else {
            log::debug!("No catchup response from node {}.", peer);
            return Ok(());
        };
        if response.status != ConnectionStatus::Proceed {
            log::debug!("Node {} refused our catchup request: {:?}.", peer, response.status);
            return Ok(());
        }
        let blocks = self.verified_prefix(response.blocks);
        if blocks.is_empty() {
            return Ok(());
        }

        log::info!(
            "Catching up {} blocks from height {} from node {}.",
            blocks.len(),
            from_height,
            peer
        );
        Event::publish(
            &self.event_publisher,
            Event::StartCatchup(StartCatchupEvent {
                timestamp: SystemTime::now(),
                peer,
                from_height,
            }),
        );
        let blocks_received = blocks.len();
        let result = self.chain.on_catchup_blocks_arrived(blocks);
        self.effector.apply("catchup", result)?;
        Event::publish(
            &self.event_publisher,
            Event::EndCatchup(EndCatchupEvent {
                timestamp: SystemTime::now(),
                peer,
                blocks_received,
                committed_height: self.chain.committed_height(),
            }),
        );
        Ok(())
    }

    // Wait for the answer to the request just sent, discarding late answers to earlier requests.
    fn wait_for_response(
        &self,
        peer: NodeId,
        from_height: BlockHeight,
    ) -> Result<Option<CatchupResponse>, ExitRequested> {
        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            self.exit.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            match self.responses.recv_timeout((deadline - now).min(RESPONSE_POLL_INTERVAL)) {
                Ok((origin, response)) => {
                    if origin == peer && response.from_height == from_height {
                        return Ok(Some(response));
                    }
                }
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return Err(ExitRequested),
            }
        }
    }

    // The longest prefix of consecutive blocks of our schain that pass hash verification.
    fn verified_prefix(&self, blocks: Vec<CommittedBlock>) -> Vec<CommittedBlock> {
        let mut expected = None;
        blocks
            .into_iter()
            .take_while(|block| {
                let consecutive = expected.map_or(true, |height| block.height() == height);
                expected = Some(block.height() + 1);
                let valid =
                    consecutive && block.schain_id() == self.config.schain_id && block.is_correct();
                if !valid {
                    log::warn!("Discarding catchup blocks from height {} on: verification failed.", block.height());
                }
                valid
            })
            .collect()
    }
}
