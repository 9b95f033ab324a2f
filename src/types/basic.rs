/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store values, and do not have any major "active" behavior.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

/// Uuid of a database: the name of a tenant within the store. Each database owns a storage
/// namespace of the same name, and a permission record under the
/// [`PERMS`](crate::crud::PERMISSION_UUID) namespace.
pub type DbUuid = String;

/// Key of a record inside a database.
pub type DbKey = String;

/// Value of a record inside a database.
pub type DbValue = Vec<u8>;

/// Opaque cryptographic identity of a request originator (typically the Base64 encoding of a
/// public key). Caller ids are compared after trimming surrounding whitespace.
pub type CallerId = String;

/// Uuid of a swarm node.
pub type NodeUuid = String;

/// PBFT epoch number. Determines the primary.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ViewNumber(u64);

impl ViewNumber {
    /// Create a new `ViewNumber` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `ViewNumber`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Per-view monotonically increasing consensus slot number.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// Create a new `SequenceNumber` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `SequenceNumber`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Content hash of a client envelope. Part of the identity of an
/// [operation slot](crate::operations::PersistentOperation).
///
/// Produced as the Base64 encoding of a SHA-256 digest by
/// [`Envelope::request_hash`](crate::messages::Envelope::request_hash), but any string is a
/// valid hash as far as slot identity is concerned.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct RequestHash(String);

impl RequestHash {
    /// Create a new `RequestHash` wrapping `string`.
    pub fn new(string: String) -> Self {
        Self(string)
    }

    /// Get the inner string value of this `RequestHash`.
    pub fn str(&self) -> &str {
        &self.0
    }
}

impl Display for RequestHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<&str> for RequestHash {
    fn from(string: &str) -> Self {
        Self(string.to_string())
    }
}

/// Network identity of a peer in the swarm.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub uuid: NodeUuid,
}

impl PeerAddress {
    pub fn new(host: &str, port: u16, name: &str, uuid: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            name: name.to_string(),
            uuid: uuid.to_string(),
        }
    }
}
