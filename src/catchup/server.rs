/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Implements the [CatchupServer], which answers [`CatchupRequest`]s with committed blocks.
//!
//! A response carries consecutive blocks starting at the requested height, up to
//! `max_catchup_download_blocks` blocks and `max_catchup_download_bytes` bytes of transactions. The
//! first block is always included whatever its size, so that a large block never stalls a lagging
//! peer.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crate::app::App;
use crate::chain::ChainState;
use crate::errors::ExitRequested;
use crate::events::{Event, ReceiveCatchupRequestEvent};
use crate::lifecycle::{ExitFlag, StartBarrier};
use crate::networking::network::PeerTransport;
use crate::networking::sending::SenderHandle;
use crate::proposals::messages::{ConnectionStatus, DisconnectReason};
use crate::storage::{BlockStore, StorageError};
use crate::types::basic::*;
use crate::types::block::CommittedBlock;
use crate::types::peers::PeerSet;

use super::messages::{CatchupRequest, CatchupResponse};

/// Immutable parameters that define the behaviour of the [CatchupServer].
pub(crate) struct CatchupServerConfiguration {
    pub(crate) schain_id: SchainId,
    pub(crate) peers: PeerSet,
    pub(crate) max_blocks: u64,
    pub(crate) max_bytes: u64,
    pub(crate) poll_interval: Duration,
}

pub(crate) struct CatchupServer<N: PeerTransport, S: BlockStore, A: App> {
    config: CatchupServerConfiguration,
    chain: Arc<ChainState<S, A>>,
    receiver: Receiver<(NodeId, CatchupRequest)>,
    sender: SenderHandle<N>,
    event_publisher: Option<Sender<Event>>,
    start: StartBarrier,
    exit: ExitFlag,
}

impl<N: PeerTransport, S: BlockStore, A: App> CatchupServer<N, S, A> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: CatchupServerConfiguration,
        chain: Arc<ChainState<S, A>>,
        receiver: Receiver<(NodeId, CatchupRequest)>,
        sender: SenderHandle<N>,
        event_publisher: Option<Sender<Event>>,
        start: StartBarrier,
        exit: ExitFlag,
    ) -> Self {
        Self {
            config,
            chain,
            receiver,
            sender,
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
            self.exit.check()?;
            match self.receiver.recv_timeout(self.config.poll_interval) {
                Ok((origin, request)) => self.on_request(origin, request),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return Err(ExitRequested),
            }
        }
    }

    fn on_request(&mut self, origin: NodeId, request: CatchupRequest) {
        let (status, blocks) = if request.schain_id != self.config.schain_id {
            (ConnectionStatus::Disconnect(DisconnectReason::UnknownSchain), Vec::new())
        } else if !self.config.peers.contains(&origin) {
            (ConnectionStatus::Disconnect(DisconnectReason::UnknownSourceIp), Vec::new())
        } else {
            Event::publish(
                &self.event_publisher,
                Event::ReceiveCatchupRequest(ReceiveCatchupRequestEvent {
                    timestamp: SystemTime::now(),
                    peer: origin,
                    from_height: request.from_height,
                }),
            );
            match self.blocks_from(request.from_height) {
                Ok(blocks) => (ConnectionStatus::Proceed, blocks),
                Err(err) => {
                    log::warn!("Could not read committed blocks for a catchup request: {}.", err);
                    (ConnectionStatus::ServerError, Vec::new())
                }
            }
        };

        if !blocks.is_empty() {
            log::debug!(
                "Sending {} blocks from height {} to node {}.",
                blocks.len(),
                request.from_height,
                origin
            );
        }
        let response = CatchupResponse {
            schain_id: self.config.schain_id,
            from_height: request.from_height,
            status,
            blocks,
        };
        if let Err(err) = self.sender.send(origin, response) {
            log::debug!("Could not send catchup response to node {}: {}.", origin, err);
        }
    }

    fn blocks_from(&self, from_height: BlockHeight) -> Result<Vec<CommittedBlock>, StorageError> {
        let committed = self.chain.committed_height();
        let mut blocks = Vec::new();
        let mut bytes = 0u64;
        let mut height = from_height.max(BlockHeight::new(1));
        while height <= committed && (blocks.len() as u64) < self.config.max_blocks {
            let Some(block) = self.chain.get_block(height)? else {
                break;
            };
            let size: u64 = block.transactions().iter().map(|tx| tx.len() as u64).sum();
            if !blocks.is_empty() && bytes + size > self.config.max_bytes {
                break;
            }
            bytes += size;
            blocks.push(block);
            height += 1;
        }
        Ok(blocks)
    }
}
