/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Exhaustive enumeration of every message a node sends, and its wire framing.
//!
//! ## Frame format
//!
//! ```text
//! MAGIC_NUMBER (u64 LE) || body length (u64 LE) || borsh-serialized Message
//! ```

use std::io;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::binary_consensus::messages::BinaryConsensusMessage;
use crate::catchup::messages::{CatchupMessage, CatchupRequest, CatchupResponse};
use crate::errors::ProtocolError;
use crate::proposals::messages::*;
use crate::types::basic::SchainId;

pub const MAGIC_NUMBER: u64 = 0x0001_396A_2205_0B30;

/// Largest accepted frame body, in bytes. Leaves room for a full catchup response.
pub const MAX_FRAME_SIZE: u64 = 128 * 1024 * 1024;

const HEADER_LEN: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Message {
    /// Handled by the proposal server.
    ProposalMessage(ProposalMessage),

    /// Handled by the consensus dispatch thread.
    ConsensusMessage(BinaryConsensusMessage),

    /// Requests go to the catchup server, responses to the catchup client.
    CatchupMessage(CatchupMessage),
}

impl Message {
    pub fn schain_id(&self) -> SchainId {
        match self {
            Message::ProposalMessage(msg) => msg.schain_id(),
            Message::ConsensusMessage(msg) => msg.schain_id,
            Message::CatchupMessage(msg) => msg.schain_id(),
        }
    }
}

impl From<ProposalMessage> for Message {
    fn from(value: ProposalMessage) -> Self {
        Message::ProposalMessage(value)
    }
}

impl From<ProposalPush> for Message {
    fn from(value: ProposalPush) -> Self {
        Message::ProposalMessage(ProposalMessage::ProposalPush(value))
    }
}

impl From<ProposalResponse> for Message {
    fn from(value: ProposalResponse) -> Self {
        Message::ProposalMessage(ProposalMessage::ProposalResponse(value))
    }
}

impl From<MissingTransactionsRequest> for Message {
    fn from(value: MissingTransactionsRequest) -> Self {
        Message::ProposalMessage(ProposalMessage::MissingTransactionsRequest(value))
    }
}

impl From<MissingTransactionsResponse> for Message {
    fn from(value: MissingTransactionsResponse) -> Self {
        Message::ProposalMessage(ProposalMessage::MissingTransactionsResponse(value))
    }
}

impl From<BinaryConsensusMessage> for Message {
    fn from(value: BinaryConsensusMessage) -> Self {
        Message::ConsensusMessage(value)
    }
}

impl From<CatchupRequest> for Message {
    fn from(value: CatchupRequest) -> Self {
        Message::CatchupMessage(CatchupMessage::CatchupRequest(value))
    }
}

impl From<CatchupResponse> for Message {
    fn from(value: CatchupResponse) -> Self {
        Message::CatchupMessage(CatchupMessage::CatchupResponse(value))
    }
}

pub fn encode_frame(message: &Message) -> io::Result<Vec<u8>> {
    let body = message.try_to_vec()?;
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&MAGIC_NUMBER.to_le_bytes());
    frame.extend_from_slice(&(body.len() as u64).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode_frame(frame: &[u8]) -> Result<Message, ProtocolError> {
    if frame.len() < HEADER_LEN {
        return Err(ProtocolError::TruncatedFrame {
            announced: HEADER_LEN as u64,
            actual: frame.len() as u64,
        });
    }
    let (magic, rest) = frame.split_at(8);
    let (len, body) = rest.split_at(8);
    let magic = u64::from_le_bytes(le_word(magic));
    if magic != MAGIC_NUMBER {
        return Err(ProtocolError::BadMagicNumber { found: magic });
    }
    let len = u64::from_le_bytes(le_word(len));
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            len,
            limit: MAX_FRAME_SIZE,
        });
    }
    if body.len() as u64 != len {
        return Err(ProtocolError::TruncatedFrame {
            announced: len,
            actual: body.len() as u64,
        });
    }
    Message::try_from_slice(body).map_err(ProtocolError::UndecodableBody)
}

fn le_word(bytes: &[u8]) -> [u8; 8] {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    word
}
