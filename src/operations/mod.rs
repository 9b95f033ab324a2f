/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-slot PBFT state machine: one [`PersistentOperation`] per
//! `(view, sequence, request_hash)`, persisting every vote it receives so that a crashed
//! replica rehydrates byte-identical state, and so that view changes can be reconstructed from
//! storage alone.
//!
//! # Storage of operation records
//!
//! Operations live in the reserved [`OPERATIONS_UUID`] namespace, one record per field:
//!
//! ```text
//! <view>/<sequence>/<hash>/preprepare         the accepted pre-prepare envelope
//! <view>/<sequence>/<hash>/prepare/<sender>   one prepare envelope per sender
//! <view>/<sequence>/<hash>/commit/<sender>    one commit envelope per sender
//! <view>/<sequence>/<hash>/request            the client request envelope
//! <view>/<sequence>/<hash>/stage              the slot's current [`OperationStage`]
//! ```
//!
//! Envelopes and stages are borsh-serialized. Enumeration is by prefix scan over the
//! namespace; the range operations ([`PersistentOperation::prepared_operations_in_range`],
//! [`PersistentOperation::remove_range`]) parse the sequence back out of each key.

mod paths;

pub mod persistent;

pub use persistent::{OperationError, PersistentOperation};

use borsh::{BorshDeserialize, BorshSerialize};

/// The reserved storage namespace operation records live in.
pub const OPERATIONS_UUID: &str = "OPS";

/// How far a slot has progressed. Stages only ever advance:
/// `Prepare → Commit → Execute`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, BorshDeserialize, BorshSerialize,
)]
pub enum OperationStage {
    /// Collecting prepare votes. The initial stage of every slot.
    Prepare,

    /// A prepare quorum was reached; collecting commit votes.
    Commit,

    /// A commit quorum was reached; the request is (being) executed.
    Execute,
}
