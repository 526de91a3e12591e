/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A leaderless Byzantine fault tolerant block-commitment engine for permissioned sidechains
//! ("schains").
//!
//! Every node of an schain proposes a block at every height. Proposals are pushed to peers in
//! compact form, as partial transaction hashes, and reassembled from each peer's pending
//! transactions. Once a two-thirds quorum of proposals is known, one binary Byzantine agreement
//! instance per proposer decides whether that proposal is available, and the lowest-indexed
//! proposer whose instance decided 1 wins the height. Nodes that fall behind download committed
//! blocks from their peers.
//!
//! The engine tolerates `f` faulty nodes out of `n >= 3f + 1`. Everything a library user needs
//! lives in [node]: build a [Configuration](node::Configuration), then a
//! [NodeSpec](node::NodeSpec) carrying an [App](app::App), a
//! [PeerTransport](networking::network::PeerTransport) and a [BlockStore](storage::BlockStore),
//! and call `start`.

pub mod types;

pub mod transactions;

pub mod proposals;

pub mod binary_consensus;

pub mod router;

pub mod chain;

pub mod catchup;

pub mod networking;

pub mod app;

pub mod storage;

pub mod node;

pub mod events;

pub mod errors;

pub mod health;

pub mod lifecycle;

pub(crate) mod algorithm;

pub(crate) mod event_bus;

pub(crate) mod logging;
