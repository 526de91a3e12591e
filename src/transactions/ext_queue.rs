/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The thread that moves new transactions from the application into the [`TransactionStore`].
//!
//! After each non-empty pull, the chain gets a chance to make the self-proposal it held back while
//! nothing was pending.
//!
//! [`TransactionStore`]: super::TransactionStore

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::algorithm::Effector;
use crate::app::App;
use crate::chain::ChainState;
use crate::errors::ExitRequested;
use crate::lifecycle::{ExitFlag, StartBarrier};
use crate::networking::network::PeerTransport;
use crate::storage::BlockStore;
use crate::types::transaction::Transaction;

pub(crate) fn start_ext_queue_sync<N: PeerTransport, S: BlockStore, A: App>(
    chain: Arc<ChainState<S, A>>,
    mut effector: Effector<N>,
    limit: usize,
    idle_wait: Duration,
    start: StartBarrier,
    exit: ExitFlag,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut run = || -> Result<(), ExitRequested> {
            start.wait_for_start(&exit)?;
            loop {
                exit.check()?;
                let payloads = chain.app().pending_transactions(limit);
                if payloads.is_empty() {
                    exit.sleep(idle_wait)?;
                    continue;
                }
                let pulled = payloads.len();
                let admitted = payloads
                    .into_iter()
                    .map(|payload| chain.transactions().admit(Transaction::new(payload)))
                    .filter(|admitted| *admitted)
                    .count();
                log::debug!(
                    "Admitted {} of {} transactions pulled from the application.",
                    admitted,
                    pulled
                );
                effector.apply("external queue sync", chain.retry_own_proposal())?;
            }
        };
        let _ = run();
    })
}
