//! An application that records every committed block and feeds transactions from a shared queue.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use schain_consensus::{
    app::App,
    types::{
        basic::{BlockHeight, Timestamp},
        transaction::Transaction,
    },
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct AppBlock {
    pub(crate) height: BlockHeight,
    pub(crate) timestamp: Timestamp,
    pub(crate) transactions: Vec<Vec<u8>>,
}

#[derive(Clone)]
pub(crate) struct RecordingApp {
    tx_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    blocks: Arc<Mutex<Vec<AppBlock>>>,
}

impl RecordingApp {
    pub(crate) fn new() -> RecordingApp {
        RecordingApp {
            tx_queue: Arc::new(Mutex::new(VecDeque::new())),
            blocks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn submit(&self, payload: Vec<u8>) {
        self.tx_queue.lock().unwrap().push_back(payload);
    }

    pub(crate) fn blocks(&self) -> Vec<AppBlock> {
        self.blocks.lock().unwrap().clone()
    }

    /// Every committed payload, in commit order.
    pub(crate) fn committed_payloads(&self) -> Vec<Vec<u8>> {
        self.blocks
            .lock()
            .unwrap()
            .iter()
            .flat_map(|block| block.transactions.clone())
            .collect()
    }
}

impl App for RecordingApp {
    fn pending_transactions(&self, limit: usize) -> Vec<Vec<u8>> {
        let mut queue = self.tx_queue.lock().unwrap();
        let n = limit.min(queue.len());
        queue.drain(..n).collect()
    }

    fn create_block(&self, transactions: &[Transaction], timestamp: Timestamp, height: BlockHeight) {
        let mut blocks = self.blocks.lock().unwrap();
        if let Some(last) = blocks.last() {
            assert_eq!(last.height + 1, height, "blocks handed to the app out of order");
        }
        blocks.push(AppBlock {
            height,
            timestamp,
            transactions: transactions.iter().map(|tx| tx.data().to_vec()).collect(),
        });
    }
}
