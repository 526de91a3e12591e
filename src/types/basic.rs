/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! "Inert" types that are sent around and inspected by every component, but have no active behavior.
//! These follow the newtype pattern and the API for using them is defined in this module.
//!
//! This module also defines the [quorum predicate](two_thirds) that every component which counts
//! votes or proposals must use, so that all honest nodes agree on exactly when a quorum is reached.

use borsh::{BorshDeserialize, BorshSerialize};
use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, AddAssign, Sub},
    time::{Duration, SystemTime},
};

/// Number of leading bytes of a [`CryptoHash`] kept in a [`PartialHash`].
pub const PARTIAL_HASH_LEN: usize = 8;

/// Timestamps of committed and proposed blocks must be strictly later than this instant (milliseconds
/// since the Unix Epoch, mid-January 2019).
pub const PROTOCOL_EPOCH: Timestamp = Timestamp::new(1_547_640_000_000);

/// How far into the future (relative to the local clock) a proposal's timestamp may be.
pub const MAX_FUTURE_DRIFT: Duration = Duration::from_secs(1);

/// Returns whether `count` out of `total` reaches the two-thirds quorum, i.e., `3 * count >= 2 * total`.
///
/// Integer arithmetic only: every honest node must reach the same verdict for the same inputs.
pub const fn two_thirds(count: u64, total: u64) -> bool {
    3 * count >= 2 * total
}

/// Identifies the sidechain. Included in every message so that nodes never mistake messages for one
/// chain as messages for another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct SchainId(u64);

impl SchainId {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for SchainId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Network identity of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Position of a node within the fixed node set, from 1 to N. Distinct from [`NodeId`].
///
/// Index 0 is reserved for the proposer of an empty block, which no node authors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct ProposerIndex(u64);

impl ProposerIndex {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for ProposerIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A commit slot. Exactly one block is ever committed per height. Height 0 is the state before the
/// first block, so the first committed block has height 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct BlockHeight(u64);

impl BlockHeight {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl Display for BlockHeight {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for BlockHeight {
    type Output = BlockHeight;
    fn add(self, rhs: u64) -> Self::Output {
        BlockHeight::new(self.0 + rhs)
    }
}

impl AddAssign<u64> for BlockHeight {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs
    }
}

impl Sub<BlockHeight> for BlockHeight {
    type Output = u64;
    fn sub(self, rhs: BlockHeight) -> Self::Output {
        self.0 - rhs.0
    }
}

/// Round number within one binary consensus instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct Round(u64);

impl Round {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    pub const fn next(&self) -> Round {
        Round(self.0 + 1)
    }
}

impl Display for Round {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Milliseconds since the Unix Epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn new(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn millis(&self) -> u64 {
        self.0
    }

    /// Read the local wall clock. A clock set before the Unix Epoch reads as zero.
    pub fn now() -> Timestamp {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        Timestamp(millis)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;
    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A SHA3-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// The first [`PARTIAL_HASH_LEN`] bytes of this hash.
    pub fn partial(&self) -> PartialHash {
        let mut prefix = [0u8; PARTIAL_HASH_LEN];
        prefix.copy_from_slice(&self.0[..PARTIAL_HASH_LEN]);
        PartialHash(prefix)
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A truncated [`CryptoHash`], used as a compact lookup key when reconciling transaction bodies.
/// Distinct transactions may share a partial hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct PartialHash([u8; PARTIAL_HASH_LEN]);

impl PartialHash {
    pub const fn new(bytes: [u8; PARTIAL_HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; PARTIAL_HASH_LEN] {
        self.0
    }
}

impl Debug for PartialHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
