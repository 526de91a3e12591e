/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use borsh::{BorshDeserialize, BorshSerialize};

use crate::proposals::messages::ConnectionStatus;
use crate::types::basic::{BlockHeight, SchainId};
use crate::types::block::CommittedBlock;

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum CatchupMessage {
    CatchupRequest(CatchupRequest),
    CatchupResponse(CatchupResponse),
}

impl CatchupMessage {
    pub fn schain_id(&self) -> SchainId {
        match self {
            CatchupMessage::CatchupRequest(msg) => msg.schain_id,
            CatchupMessage::CatchupResponse(msg) => msg.schain_id,
        }
    }
}

/// Ask for the committed blocks starting at `from_height`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CatchupRequest {
    pub schain_id: SchainId,
    pub from_height: BlockHeight,
}

/// Consecutive committed blocks starting at `from_height`. Empty if the server has nothing newer, or
/// if `status` is not [`Proceed`](ConnectionStatus::Proceed).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CatchupResponse {
    pub schain_id: SchainId,
    pub from_height: BlockHeight,
    pub status: ConnectionStatus,
    pub blocks: Vec<CommittedBlock>,
}
