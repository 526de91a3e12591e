/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits for pluggable persistence of committed blocks.
//!
//! The library user provides a key-value store implementing [`BlockStore`]. The consensus engine only
//! ever writes two kinds of keys, both scoped to the writing node:
//! - `"<node id>:<height>"` → the borsh-serialized [`CommittedBlock`] at that height.
//! - `"<node id>:last"` → the borsh-serialized [`BlockHeight`] of the highest committed block.
//!
//! Committed-transaction history is not persisted; it lives only in the in-memory
//! [`TransactionStore`](crate::transactions::TransactionStore) retention window.

use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

use crate::types::basic::{BlockHeight, NodeId};
use crate::types::block::CommittedBlock;

pub trait BlockStore: BlockGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;

    fn write(&mut self, wb: Self::WriteBatch);
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

pub trait BlockGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    fn block(&self, node: NodeId, height: BlockHeight) -> Result<Option<CommittedBlock>, StorageError> {
        let key = block_key(node, height);
        match self.get(&key) {
            None => Ok(None),
            Some(bytes) => CommittedBlock::deserialize(&mut bytes.as_slice())
                .map(Some)
                .map_err(|source| StorageError::DeserializeValueError { key, source }),
        }
    }

    fn last_committed_height(&self, node: NodeId) -> Result<Option<BlockHeight>, StorageError> {
        let key = last_committed_key(node);
        match self.get(&key) {
            None => Ok(None),
            Some(bytes) => BlockHeight::deserialize(&mut bytes.as_slice())
                .map(Some)
                .map_err(|source| StorageError::DeserializeValueError { key, source }),
        }
    }
}

/// Write `block` and advance the last-committed record in one batch.
pub(crate) fn write_committed_block<S: BlockStore>(
    store: &mut S,
    node: NodeId,
    block: &CommittedBlock,
) -> Result<(), StorageError> {
    let mut wb = S::WriteBatch::new();
    let block_bytes = block
        .try_to_vec()
        .map_err(|source| StorageError::SerializeValueError { source })?;
    let height_bytes = block
        .height()
        .try_to_vec()
        .map_err(|source| StorageError::SerializeValueError { source })?;
    wb.set(&block_key(node, block.height()), &block_bytes);
    wb.set(&last_committed_key(node), &height_bytes);
    store.write(wb);
    Ok(())
}

pub fn block_key(node: NodeId, height: BlockHeight) -> Vec<u8> {
    format!("{}:{}", node, height).into_bytes()
}

pub fn last_committed_key(node: NodeId) -> Vec<u8> {
    format!("{}:last", node).into_bytes()
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("value under key {} could not be deserialized", String::from_utf8_lossy(.key))]
    DeserializeValueError {
        key: Vec<u8>,
        #[source]
        source: std::io::Error,
    },
    #[error("value could not be serialized")]
    SerializeValueError {
        #[source]
        source: std::io::Error,
    },
}
