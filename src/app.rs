/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The boundary between the consensus engine and the hosting application.
//!
//! The application feeds new transactions into consensus through [`App::pending_transactions`] and
//! receives every committed block, in height order and exactly once per height, through
//! [`App::create_block`]. Nothing else crosses the boundary.

use crate::types::basic::{BlockHeight, Timestamp};
use crate::types::transaction::Transaction;

pub trait App: Send + Sync + 'static {
    /// Pull up to `limit` new transaction payloads from the application.
    ///
    /// Called repeatedly from a dedicated thread. Implementations may block while nothing is available,
    /// but should return (possibly with an empty vector) within a few hundred milliseconds so that the
    /// thread notices node shutdown promptly.
    fn pending_transactions(&self, limit: usize) -> Vec<Vec<u8>>;

    /// Hand a committed block to the application. Called with the consensus lock held, so that blocks
    /// arrive strictly in height order. Should return quickly.
    fn create_block(&self, transactions: &[Transaction], timestamp: Timestamp, height: BlockHeight);
}
