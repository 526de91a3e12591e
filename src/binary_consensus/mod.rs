/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Binary Byzantine agreement, the substrate on which heights are decided.
//!
//! [`round::BinaryConsensusRound`] is one agreement instance. [`block_consensus::BlockConsensus`]
//! groups one instance per proposer to decide a height.

pub mod block_consensus;

pub mod coin;

pub mod messages;

pub mod round;
