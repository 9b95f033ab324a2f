/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](Pbft) for the PBFT driver that orders requests, and the
//! [peers beacon](PeersBeacon) quorum arithmetic is computed from.
//!
//! The driver itself (view tracking, primary election, message fan-out) is outside this crate.
//! The state machine layer interacts with it in two directions: committed requests flow *from*
//! the driver into the [CRUD service](crate::crud::CrudService), and the
//! [TTL sweeper](crate::crud) submits synthetic deletes *to* the driver so that expiry is
//! consensus-ordered like any other mutation.

use std::sync::Arc;

use crate::messages::Envelope;
use crate::networking::Session;
use crate::types::basic::{NodeUuid, PeerAddress};

/// Read access to the current peer list. PBFT quorum thresholds are a function of the peer
/// count, so every readiness check on an
/// [operation slot](crate::operations::PersistentOperation) takes a beacon.
pub trait PeersBeacon: Send + Sync {
    /// The current peers of the swarm, self included.
    fn current(&self) -> Vec<PeerAddress>;
}

/// The interface the state machine layer requires from the PBFT driver.
pub trait Pbft: Send + Sync {
    /// The beacon tracking this swarm's peer list.
    fn peers(&self) -> Arc<dyn PeersBeacon>;

    /// Uuid of this node.
    fn get_uuid(&self) -> NodeUuid;

    /// Submit a database message for ordering. Once the swarm commits it, the driver feeds it
    /// back into [`CrudService::handle_request`](crate::crud::CrudService::handle_request) on
    /// every replica.
    fn handle_database_message(&self, envelope: Envelope, session: Option<Arc<dyn Session>>);
}

/// The maximum number of faulty peers a swarm of `peer_count` nodes tolerates:
/// `floor(peer_count / 3)`. Progress requires votes from `2f + 1` peers.
pub fn max_faulty_peers(peer_count: usize) -> usize {
    peer_count / 3
}
