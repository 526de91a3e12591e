/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types shared by every component of the consensus engine.
//!
//! Types specific to one component, such as its wire messages, live in that component's module.

pub mod basic;

pub mod block;

pub mod peers;

pub mod transaction;
