/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Routing of binary consensus messages, with deferral of messages that run ahead of local state.

pub mod deferred;

pub mod dispatch;

pub use dispatch::{
    ConsensusRouter, HandlerOutput, MessageHandler, RouteBatch, RouteOutcome, MAX_ROUND_LEAD,
};
