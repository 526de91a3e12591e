/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the 'transaction' type: an opaque byte payload whose identity is its SHA3 hash.

use std::fmt::{self, Debug, Formatter};
use std::sync::OnceLock;

use borsh::{BorshDeserialize, BorshSerialize};
use sha3::Digest;

use crate::types::basic::{CryptoHash, PartialHash};
use crate::types::block::CryptoHasher;

#[derive(Clone, Default, BorshSerialize, BorshDeserialize)]
pub struct Transaction {
    data: Vec<u8>,
    #[borsh_skip]
    hash: OnceLock<CryptoHash>,
}

impl Transaction {
    pub fn new(data: Vec<u8>) -> Transaction {
        Transaction {
            data,
            hash: OnceLock::new(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The full hash of the payload, computed on first use.
    pub fn hash(&self) -> CryptoHash {
        *self.hash.get_or_init(|| {
            let mut hasher = CryptoHasher::new();
            hasher.update(&self.data);
            CryptoHash::new(hasher.finalize().into())
        })
    }

    pub fn partial_hash(&self) -> PartialHash {
        self.hash().partial()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Transaction {}

impl Debug for Transaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("len", &self.data.len())
            .field("hash", &self.hash())
            .finish()
    }
}

impl From<Vec<u8>> for Transaction {
    fn from(data: Vec<u8>) -> Self {
        Transaction::new(data)
    }
}
