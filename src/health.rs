/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Node health reporting, and the start-up wait for a quorum of reachable peers.
//!
//! The status is readable through [`Node::health`](crate::node::Node::health) and, if a
//! `health_check_file` is configured, mirrored into that file as a single decimal number so that
//! external supervisors can poll it.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::errors::ExitRequested;
use crate::lifecycle::ExitFlag;
use crate::networking::network::PeerTransport;
use crate::networking::sending::SenderHandle;
use crate::types::basic::{two_thirds, NodeId};
use crate::types::peers::PeerSet;

const REACHABILITY_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Failed = 0,
    NotConnected = 1,
    Connected = 2,
    Running = 3,
}

impl HealthStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    fn from_code(code: u8) -> HealthStatus {
        match code {
            1 => HealthStatus::NotConnected,
            2 => HealthStatus::Connected,
            3 => HealthStatus::Running,
            _ => HealthStatus::Failed,
        }
    }
}

#[derive(Clone)]
pub struct HealthMonitor {
    status: Arc<AtomicU8>,
    file: Option<PathBuf>,
}

impl HealthMonitor {
    pub fn new(file: Option<PathBuf>) -> HealthMonitor {
        let monitor = HealthMonitor {
            status: Arc::new(AtomicU8::new(HealthStatus::NotConnected.code())),
            file,
        };
        monitor.set(HealthStatus::NotConnected);
        monitor
    }

    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_code(self.status.load(Ordering::SeqCst))
    }

    pub fn set(&self, status: HealthStatus) {
        self.status.store(status.code(), Ordering::SeqCst);
        if let Some(file) = &self.file {
            if let Err(err) = fs::write(file, status.code().to_string()) {
                log::warn!("Could not write health status to {}: {}.", file.display(), err);
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum HealthCheckError {
    #[error("only {reachable} of {total} nodes reachable after {waited:?}")]
    Timeout {
        reachable: u64,
        total: u64,
        waited: Duration,
    },
    #[error(transparent)]
    ExitRequested(#[from] ExitRequested),
}

/// Block until this node and the peers the transport reports reachable form a two-thirds quorum.
pub(crate) fn wait_for_quorum<N: PeerTransport>(
    sender: &mut SenderHandle<N>,
    me: NodeId,
    peers: &PeerSet,
    timeout: Duration,
    exit: &ExitFlag,
) -> Result<(), HealthCheckError> {
    let started = Instant::now();
    let others: Vec<NodeId> = peers.others(me).collect();
    loop {
        let reachable = others
            .iter()
            .filter(|peer| sender.reachable(**peer))
            .count() as u64
            + 1;
        if two_thirds(reachable, peers.len()) {
            log::info!("{} of {} nodes reachable.", reachable, peers.len());
            return Ok(());
        }
        if started.elapsed() >= timeout {
            return Err(HealthCheckError::Timeout {
                reachable,
                total: peers.len(),
                waited: started.elapsed(),
            });
        }
        exit.sleep(REACHABILITY_POLL_INTERVAL)?;
    }
}
