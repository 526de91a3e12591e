/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

pub mod block_cache;

pub mod state;

pub use block_cache::CommittedBlockCache;
pub use state::{ChainConfiguration, ChainHead, ChainState, Effects};
