//! A simple, volatile, in-memory implementation of [`BlockStore`].

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use schain_consensus::storage::{BlockGet, BlockStore, WriteBatch};

/// An in-memory implementation of [`BlockStore`]. Clones share the same map.
#[derive(Clone)]
pub(crate) struct MemStore(Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>);

impl MemStore {
    /// Create a new, empty `MemStore`.
    pub(crate) fn new() -> MemStore {
        MemStore(Arc::new(Mutex::new(HashMap::new())))
    }

    /// Overwrite a key directly, bypassing write batches.
    pub(crate) fn put(&self, key: &[u8], value: &[u8]) {
        self.0.lock().unwrap().insert(key.to_vec(), value.to_vec());
    }
}

impl BlockStore for MemStore {
    type WriteBatch = MemWriteBatch;

    fn write(&mut self, wb: Self::WriteBatch) {
        let mut map = self.0.lock().unwrap();
        for (key, value) in wb.insertions {
            map.insert(key, value);
        }
        for key in wb.deletions {
            map.remove(&key);
        }
    }
}

impl BlockGet for MemStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(key).cloned()
    }
}

// A simple implementation of [`WriteBatch`].
pub(crate) struct MemWriteBatch {
    insertions: HashMap<Vec<u8>, Vec<u8>>,
    deletions: HashSet<Vec<u8>>,
}

impl WriteBatch for MemWriteBatch {
    fn new() -> Self {
        MemWriteBatch {
            insertions: HashMap::new(),
            deletions: HashSet::new(),
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        let _ = self.deletions.remove(key);
        self.insertions.insert(key.to_vec(), value.to_vec());
    }

    fn delete(&mut self, key: &[u8]) {
        let _ = self.insertions.remove(key);
        self.deletions.insert(key.to_vec());
    }
}
