/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Catchup: bulk download of committed blocks by a node that has fallen behind its peers.
//!
//! The [client](client) periodically asks a random peer for the blocks above its committed height and
//! applies whatever comes back. The [server](server) answers such requests from the committed block
//! cache and storage. Catchup runs alongside consensus; a height committed through either path is
//! simply skipped by the other.

pub mod messages;

pub(crate) mod client;

pub(crate) mod server;
