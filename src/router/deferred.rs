/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Height-aware buffer for messages that arrived before the local node could process them.
//!
//! Messages are kept in one bucket per height, in arrival order. Draining releases whole buckets in
//! height order, so relative arrival order within a height survives any number of defer/release
//! cycles.
//!
//! ## Buffer management
//!
//! The buffer is bounded twice: by a total message count, and by an equal share of that count per
//! sender, so that one peer flooding the buffer can only ever displace its own messages.
//!
//! When a bound is hit, the message furthest ahead by (height, round) among the ones the bound
//! applies to is evicted to make space, unless the new message is itself at least that far ahead, in
//! which case the new message is dropped instead. Messages furthest ahead are the cheapest to lose:
//! the peers that sent them retransmit once this node has caught up.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::types::basic::{BlockHeight, NodeId, Round};

pub struct DeferredMessageQueue<T> {
    capacity: usize,
    sender_capacity: usize,
    len: usize,
    per_sender: HashMap<NodeId, usize>,
    buckets: BTreeMap<BlockHeight, VecDeque<Deferred<T>>>,
}

struct Deferred<T> {
    sender: NodeId,
    round: Round,
    msg: T,
}

impl<T> DeferredMessageQueue<T> {
    /// A buffer of at most `capacity` messages, of which each of the `senders` peers may hold an equal
    /// share.
    pub fn new(capacity: usize, senders: u64) -> DeferredMessageQueue<T> {
        DeferredMessageQueue {
            capacity,
            sender_capacity: (capacity / senders.max(1) as usize).max(1),
            len: 0,
            per_sender: HashMap::new(),
            buckets: BTreeMap::new(),
        }
    }

    /// Append `msg` to the bucket for `height`. Returns whether the message was kept.
    pub fn push(&mut self, height: BlockHeight, sender: NodeId, round: Round, msg: T) -> bool {
        if self.capacity == 0 {
            return false;
        }
        if self.sender_len(sender) >= self.sender_capacity
            && !self.evict_furthest(Some(sender), height, round)
        {
            return false;
        }
        if self.len >= self.capacity && !self.evict_furthest(None, height, round) {
            return false;
        }
        self.buckets
            .entry(height)
            .or_default()
            .push_back(Deferred { sender, round, msg });
        self.len += 1;
        *self.per_sender.entry(sender).or_insert(0) += 1;
        true
    }

    /// Remove and return every message for heights up to and including `current`, lowest height first,
    /// arrival order within a height.
    pub fn drain_ready(&mut self, current: BlockHeight) -> Vec<T> {
        let later = self.buckets.split_off(&(current + 1));
        let ready = std::mem::replace(&mut self.buckets, later);
        let mut drained = Vec::new();
        for entry in ready.into_values().flatten() {
            self.forget(entry.sender);
            drained.push(entry.msg);
        }
        drained
    }

    /// Discard every message for heights up to and including `height`.
    pub fn remove_expired(&mut self, height: BlockHeight) -> usize {
        self.drain_ready(height).len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len_at(&self, height: BlockHeight) -> usize {
        self.buckets.get(&height).map_or(0, |bucket| bucket.len())
    }

    pub fn sender_len(&self, sender: NodeId) -> usize {
        self.per_sender.get(&sender).copied().unwrap_or(0)
    }

    // Evict the message furthest ahead of (height, round), restricted to `sender`'s messages if given.
    // Among equally far messages, the latest arrival goes first. Returns whether anything was evicted.
    fn evict_furthest(&mut self, sender: Option<NodeId>, height: BlockHeight, round: Round) -> bool {
        let mut furthest: Option<(BlockHeight, Round, usize)> = None;
        for (bucket_height, bucket) in self.buckets.iter() {
            for (position, entry) in bucket.iter().enumerate() {
                if sender.is_some_and(|sender| sender != entry.sender) {
                    continue;
                }
                let rank = (*bucket_height, entry.round);
                if furthest.map_or(true, |(h, r, _)| rank >= (h, r)) {
                    furthest = Some((*bucket_height, entry.round, position));
                }
            }
        }

        let Some((evict_height, evict_round, position)) = furthest else {
            return false;
        };
        if (evict_height, evict_round) <= (height, round) {
            return false;
        }
        let Some(bucket) = self.buckets.get_mut(&evict_height) else {
            return false;
        };
        let Some(evicted) = bucket.remove(position) else {
            return false;
        };
        if bucket.is_empty() {
            self.buckets.remove(&evict_height);
        }
        self.forget(evicted.sender);
        true
    }

    fn forget(&mut self, sender: NodeId) {
        self.len -= 1;
        if let Some(count) = self.per_sender.get_mut(&sender) {
            *count -= 1;
            if *count == 0 {
                self.per_sender.remove(&sender);
            }
        }
    }
}
