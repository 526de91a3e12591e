/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Sliding window over the most recently committed blocks.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::types::basic::BlockHeight;
use crate::types::block::CommittedBlock;

/// Keeps the `capacity` highest committed blocks. Once full, inserting evicts the lowest height. Blocks
/// outside the window are only retrievable from the [`BlockStore`](crate::storage::BlockStore).
pub struct CommittedBlockCache {
    capacity: usize,
    blocks: Mutex<BTreeMap<BlockHeight, CommittedBlock>>,
}

impl CommittedBlockCache {
    pub fn new(capacity: usize) -> CommittedBlockCache {
        CommittedBlockCache {
            capacity,
            blocks: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, block: CommittedBlock) {
        let mut blocks = self.lock();
        blocks.insert(block.height(), block);
        while blocks.len() > self.capacity {
            blocks.pop_first();
        }
    }

    pub fn get(&self, height: BlockHeight) -> Option<CommittedBlock> {
        self.lock().get(&height).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Lowest and highest cached heights.
    pub fn range(&self) -> Option<(BlockHeight, BlockHeight)> {
        let blocks = self.lock();
        Some((*blocks.keys().next()?, *blocks.keys().next_back()?))
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<BlockHeight, CommittedBlock>> {
        self.blocks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
