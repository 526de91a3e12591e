/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Error taxonomy of the consensus engine.
//!
//! Errors fall into four classes, each handled differently by the thread loops that observe them:
//! 1. [`ProtocolError`]: a peer sent something malformed or out of causal order. The exchange is
//!    aborted and the message dropped; the peer is told why through a status code where the exchange
//!    has a response.
//! 2. [`TransportError`]: always transient. Retried after a configured backoff.
//! 3. [`InvariantViolation`]: a consensus-safety-threatening bug. Triggers node-wide exit.
//! 4. [`ExitRequested`]: shutdown in progress. Unwinds loops quietly and is never converted into
//!    another kind.

use thiserror::Error;

use crate::storage::StorageError;
use crate::types::basic::{BlockHeight, CryptoHash, NodeId, ProposerIndex, SchainId, Timestamp};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic number {found:#x}")]
    BadMagicNumber { found: u64 },
    #[error("frame is {len} bytes, longer than the limit of {limit}")]
    FrameTooLarge { len: u64, limit: u64 },
    #[error("frame announces {announced} body bytes but carries {actual}")]
    TruncatedFrame { announced: u64, actual: u64 },
    #[error("could not decode message body")]
    UndecodableBody(#[source] std::io::Error),
    #[error("message for unknown schain {0}")]
    UnknownSchain(SchainId),
    #[error("message from unknown node {0}")]
    UnknownSender(NodeId),
    #[error("message claims sender {claimed} but arrived from {origin}")]
    SenderMismatch { claimed: NodeId, origin: NodeId },
    #[error("proposal at height {height} from proposer {proposer} contains a committed transaction")]
    CommittedTransactionInProposal {
        height: BlockHeight,
        proposer: ProposerIndex,
    },
    #[error("missing-transactions response carries {actual} entries, {expected} were requested")]
    MissingCountMismatch { expected: usize, actual: usize },
    #[error("missing-transactions response sizes add up to {sizes_total} bytes, body is {body_len}")]
    SizeListMismatch { sizes_total: u64, body_len: u64 },
    #[error("requested transaction index {index} is out of range for a proposal of {len}")]
    IndexOutOfRange { index: u64, len: usize },
    #[error("reassembled proposal hashes to {actual:?}, header announced {expected:?}")]
    ProposalHashMismatch {
        expected: CryptoHash,
        actual: CryptoHash,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("timed out talking to {0}")]
    Timeout(NodeId),
    #[error("connection to {0} is down")]
    Disconnected(NodeId),
    #[error("no route to unknown peer {0}")]
    UnknownPeer(NodeId),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("height {height} committed twice with different blocks ({first:?} and {second:?})")]
    ConflictingCommit {
        height: BlockHeight,
        first: CryptoHash,
        second: CryptoHash,
    },
    #[error("decision reached for height {decided} while the next height to commit is {expected}")]
    DecisionOutOfOrder {
        decided: BlockHeight,
        expected: BlockHeight,
    },
    #[error("commit of height {height} attempted while the next height to commit is {expected}")]
    CommitOutOfOrder {
        height: BlockHeight,
        expected: BlockHeight,
    },
    #[error("stored block at height {0} fails verification")]
    CorruptedStoredBlock(BlockHeight),
}

/// Why a [`ChainState`](crate::chain::ChainState) refused a proposal or block.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    #[error("schain id {0} is not ours")]
    WrongSchain(SchainId),
    #[error("height {height} is already committed (committed height {committed})")]
    TooLate {
        height: BlockHeight,
        committed: BlockHeight,
    },
    #[error("timestamp {timestamp} is not later than the protocol epoch")]
    BeforeEpoch { timestamp: Timestamp },
    #[error("timestamp {timestamp} is not later than the committed timestamp {committed}")]
    StaleTimestamp {
        timestamp: Timestamp,
        committed: Timestamp,
    },
    #[error("timestamp {timestamp} is too far in the future (local clock {now})")]
    TimestampInFuture { timestamp: Timestamp, now: Timestamp },
    #[error("proposer index {0} is not part of the peer set")]
    UnknownProposer(ProposerIndex),
    #[error("block at height {0} fails verification")]
    InvalidBlock(BlockHeight),
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rejected: {0}")]
    Rejected(#[from] RejectReason),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    ExitRequested(#[from] ExitRequested),
}

impl ChainError {
    /// Fatal errors must bring the node down. Everything else is a local decision for the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainError::Invariant(_) | ChainError::Storage(_))
    }
}

/// Raised by every wait once node shutdown has been requested.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("exit requested")]
pub struct ExitRequested;
