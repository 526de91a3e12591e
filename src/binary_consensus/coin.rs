/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The common coin consulted at the end of every binary consensus round.
//!
//! Safety never depends on the coin; liveness under adversarial scheduling does. Deployments that
//! have a threshold-signature randomness beacon can plug it in through [`CommonCoin`]. The default
//! [`HashCoin`] is deterministic: every node tosses the same bit for the same round.

use sha3::Digest;

use crate::binary_consensus::messages::ConsensusKey;
use crate::types::basic::SchainId;
use crate::types::block::CryptoHasher;

pub trait CommonCoin: Send + Sync {
    fn toss(&self, key: &ConsensusKey) -> bool;
}

/// Lowest bit of SHA3(schain id, height, proposer index, round).
#[derive(Clone, Copy, Debug)]
pub struct HashCoin {
    schain_id: SchainId,
}

impl HashCoin {
    pub fn new(schain_id: SchainId) -> HashCoin {
        HashCoin { schain_id }
    }
}

impl CommonCoin for HashCoin {
    fn toss(&self, key: &ConsensusKey) -> bool {
        let mut hasher = CryptoHasher::new();
        hasher.update(self.schain_id.int().to_le_bytes());
        hasher.update(key.height.to_le_bytes());
        hasher.update(key.proposer_index.int().to_le_bytes());
        hasher.update(key.round.int().to_le_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        digest[31] & 1 == 1
    }
}
