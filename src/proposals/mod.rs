/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Block proposals: their per-height registry and the push protocol that spreads them.

pub mod messages;

pub mod store;

pub(crate) mod pusher;

pub(crate) mod server;

pub use store::ProposalStore;
