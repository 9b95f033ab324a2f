/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Byzantine fault tolerant replicated key-value store core.
//!
//! A swarm of peers accepts client CRUD requests against named databases, orders them through
//! a PBFT consensus protocol, commits them to a durable per-database storage layer, and
//! replies with signed responses. This crate implements the replicated state machine layer of
//! such a swarm:
//!
//! 1. The [CRUD request processor](crate::crud::CrudService), which applies
//!    consensus-committed requests while enforcing per-database ownership and writer lists,
//!    byte quotas with [eviction](crate::crud::eviction) under space pressure, and
//!    [TTL expiry](crate::crud) reconciled by a background sweeper.
//! 2. The [persistent PBFT operation](crate::operations::PersistentOperation): the per-slot
//!    state machine that collects pre-prepare/prepare/commit votes, persists every envelope it
//!    receives, and rehydrates byte-identically after a crash so that view changes never lose
//!    or duplicate client requests.
//!
//! The pieces around this layer are pluggable: implement [`Storage`](crate::storage::Storage)
//! to choose a backing store (an in-memory implementation
//! [ships with the crate](crate::storage::mem_storage::MemStorage)),
//! [`Node`](crate::networking::Node) and [`Session`](crate::networking::Session) to choose a
//! transport, and [`Pbft`](crate::pbft::Pbft) to connect the consensus driver.

pub mod config;

pub mod crud;

pub(crate) mod logging;

pub mod messages;

pub mod networking;

pub mod operations;

pub mod pbft;

pub mod status;

pub mod storage;

pub mod subscriptions;

pub mod types;

// Re-exports
pub use crud::CrudService;
pub use operations::{OperationStage, PersistentOperation};
pub use storage::{Storage, StorageResult};
