/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Transactions: the pending set, reconciliation of pushed proposals against it, and the thread that
//! pulls new transactions from the application.

pub mod store;

pub mod reconciliation;

pub(crate) mod ext_queue;

pub use store::{TransactionStore, TransactionStoreConfiguration};
