/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Outbound side of the proposal push protocol.
//!
//! Each peer gets a dedicated worker thread and a bounded queue of our proposals still to be pushed to
//! it, so that one slow or unreachable peer never delays the others. A worker sends the
//! [`ProposalPush`] header; bodies are served by the [proposal server](super::server) when the peer
//! asks for them.
//!
//! A push is finished once the peer answers with a [`ProposalResponse`](super::messages::ProposalResponse)
//! of its own: `Proceed` when it registered the proposal, `Disconnect` when it never will. The server
//! records these answers in the shared [`PushAcks`]. Until one arrives the worker pushes the header
//! again, with a doubling backoff, and gives up once the proposal's height is committed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::chain::ChainHead;
use crate::errors::ExitRequested;
use crate::lifecycle::ExitFlag;
use crate::networking::network::PeerTransport;
use crate::networking::sending::SenderHandle;
use crate::proposals::messages::{ConnectionStatus, ProposalPush};
use crate::types::basic::{BlockHeight, NodeId};
use crate::types::block::BlockProposal;

/// Upper bound on the push backoff, as a multiple of `wait_after_network_error`.
pub const MAX_PUSH_BACKOFF: u32 = 8;

/// Answers of peers to our pushes, keyed by (peer, height). Filled by the proposal server, consumed
/// by the push workers.
#[derive(Clone)]
pub(crate) struct PushAcks {
    inner: Arc<(Mutex<HashMap<(NodeId, BlockHeight), ConnectionStatus>>, Condvar)>,
}

impl PushAcks {
    pub(crate) fn new(exit: &ExitFlag) -> PushAcks {
        let acks = PushAcks {
            inner: Arc::new((Mutex::new(HashMap::new()), Condvar::new())),
        };
        let waker = acks.clone();
        exit.register_waker(move || waker.wake());
        acks
    }

    pub(crate) fn record(&self, peer: NodeId, height: BlockHeight, status: ConnectionStatus) {
        self.lock().insert((peer, height), status);
        self.inner.1.notify_all();
    }

    /// Take `peer`'s answer for `height`, waiting up to `timeout` for it to arrive.
    pub(crate) fn wait(
        &self,
        peer: NodeId,
        height: BlockHeight,
        timeout: Duration,
        exit: &ExitFlag,
    ) -> Result<Option<ConnectionStatus>, ExitRequested> {
        let deadline = Instant::now() + timeout;
        let mut acks = self.lock();
        loop {
            exit.check()?;
            if let Some(status) = acks.remove(&(peer, height)) {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            acks = match self.inner.1.wait_timeout(acks, deadline - now) {
                Ok((acks, _)) => acks,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Forget answers for heights up to and including `committed`.
    pub(crate) fn clear_until(&self, committed: BlockHeight) {
        self.lock().retain(|(_, height), _| *height > committed);
    }

    fn wake(&self) {
        let _acks = self.lock();
        self.inner.1.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(NodeId, BlockHeight), ConnectionStatus>> {
        self.inner
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone, Copy)]
pub(crate) struct PushTimings {
    pub(crate) history_size: usize,
    pub(crate) wait_after_network_error: Duration,
    pub(crate) ack_timeout: Duration,
}

/// Enqueues proposals for every push worker. Cheap to clone.
#[derive(Clone)]
pub(crate) struct ProposalQueues {
    queues: Arc<HashMap<NodeId, PushQueue>>,
}

impl ProposalQueues {
    /// Queue `proposal` for every peer. A full queue drops its oldest proposal.
    pub(crate) fn push(&self, proposal: &BlockProposal) {
        for (peer, queue) in self.queues.iter() {
            if let Some(dropped) = queue.push(proposal.clone()) {
                log::debug!(
                    "Push queue for node {} is full, dropping proposal for height {}.",
                    peer,
                    dropped.height()
                );
            }
        }
    }

    pub(crate) fn len(&self, peer: NodeId) -> usize {
        self.queues.get(&peer).map_or(0, |queue| queue.lock().len())
    }
}

#[derive(Clone)]
struct PushQueue {
    capacity: usize,
    inner: Arc<(Mutex<VecDeque<BlockProposal>>, Condvar)>,
}

impl PushQueue {
    fn new(capacity: usize) -> PushQueue {
        PushQueue {
            capacity,
            inner: Arc::new((Mutex::new(VecDeque::new()), Condvar::new())),
        }
    }

    fn push(&self, proposal: BlockProposal) -> Option<BlockProposal> {
        let mut queue = self.lock();
        let dropped = if queue.len() >= self.capacity.max(1) {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(proposal);
        self.inner.1.notify_one();
        dropped
    }

    fn pop(&self, exit: &ExitFlag) -> Result<BlockProposal, ExitRequested> {
        let mut queue = self.lock();
        loop {
            exit.check()?;
            if let Some(proposal) = queue.pop_front() {
                return Ok(proposal);
            }
            queue = match self.inner.1.wait(queue) {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn wake(&self) {
        let _queue = self.lock();
        self.inner.1.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<BlockProposal>> {
        self.inner
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Spawn one push worker per peer other than `me`.
pub(crate) fn start_push_workers<N: PeerTransport>(
    sender: SenderHandle<N>,
    me: NodeId,
    peers: impl Iterator<Item = NodeId>,
    head: ChainHead,
    acks: PushAcks,
    timings: PushTimings,
    exit: ExitFlag,
) -> (ProposalQueues, Vec<JoinHandle<()>>) {
    let mut queues = HashMap::new();
    let mut workers = Vec::new();
    for peer in peers.filter(|peer| *peer != me) {
        let queue = PushQueue::new(timings.history_size);
        let waker = queue.clone();
        exit.register_waker(move || waker.wake());

        let worker = PushWorker {
            peer,
            me,
            queue: queue.clone(),
            sender: sender.clone(),
            head: head.clone(),
            acks: acks.clone(),
            timings,
            exit: exit.clone(),
        };
        workers.push(thread::spawn(move || worker.run()));
        queues.insert(peer, queue);
    }
    (
        ProposalQueues {
            queues: Arc::new(queues),
        },
        workers,
    )
}

struct PushWorker<N: PeerTransport> {
    peer: NodeId,
    me: NodeId,
    queue: PushQueue,
    sender: SenderHandle<N>,
    head: ChainHead,
    acks: PushAcks,
    timings: PushTimings,
    exit: ExitFlag,
}

impl<N: PeerTransport> PushWorker<N> {
    fn run(mut self) {
        while let Ok(proposal) = self.queue.pop(&self.exit) {
            if self.push(&proposal).is_err() {
                return;
            }
        }
    }

    // Push until the peer answers, or until the proposal's height is committed and pushing it is
    // pointless.
    fn push(&mut self, proposal: &BlockProposal) -> Result<(), ExitRequested> {
        let header = ProposalPush::new(proposal, self.me);
        let height = proposal.height();
        let first_backoff = self.timings.wait_after_network_error;
        let mut backoff = first_backoff;
        loop {
            let committed = self.head.height();
            self.acks.clear_until(committed);
            if height <= committed {
                return Ok(());
            }
            match self.sender.send(self.peer, header.clone()) {
                Ok(()) => {
                    log::debug!("Pushed proposal for height {} to node {}.", height, self.peer);
                    match self
                        .acks
                        .wait(self.peer, height, self.timings.ack_timeout, &self.exit)?
                    {
                        Some(ConnectionStatus::Proceed) => return Ok(()),
                        Some(ConnectionStatus::Disconnect(reason)) => {
                            log::debug!(
                                "Node {} refused our proposal for height {}: {:?}.",
                                self.peer,
                                height,
                                reason
                            );
                            return Ok(());
                        }
                        Some(ConnectionStatus::ServerError) => log::debug!(
                            "Node {} failed to register our proposal for height {}. Pushing again.",
                            self.peer,
                            height
                        ),
                        None => log::debug!(
                            "No answer from node {} to our proposal for height {}. Pushing again.",
                            self.peer,
                            height
                        ),
                    }
                }
                Err(err) => {
                    log::debug!("Pushing proposal for height {} failed: {}. Retrying.", height, err);
                }
            }
            self.exit.sleep(backoff)?;
            backoff = (backoff * 2).min(first_backoff * MAX_PUSH_BACKOFF);
        }
    }
}
