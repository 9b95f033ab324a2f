/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definitions](Node) for pluggable peer-to-peer networking, and for the
//! [client sessions](Session) responses travel back on.
//!
//! The transport is modular: implementations deliver [`Envelope`]s between peers identified by
//! their node uuid, and hand inbound envelopes to the handlers registered per
//! [payload kind](PayloadKind). Signing of outbound envelopes is the transport's concern; the
//! request handlers in this crate only decide *whether* a message is signed (everything except
//! quick read responses) and hand over the envelope.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use crate::messages::{Envelope, PayloadKind};

/// Callback invoked for every inbound envelope of a registered payload kind. The session is
/// `None` for envelopes that arrived peer-to-peer rather than on a client connection.
pub type MessageHandler = Box<dyn Fn(Envelope, Option<Arc<dyn Session>>) + Send + Sync>;

/// The interface the replicated state machine layer requires from the network transport.
pub trait Node: Send + Sync {
    /// Register `handler` to be invoked for every inbound envelope carrying a payload of
    /// `kind`. At most one handler per kind; later registrations replace earlier ones.
    fn register_for_message(&self, kind: PayloadKind, handler: MessageHandler);

    /// Sign `envelope` with this node's key and send it to the peer identified by `peer_uuid`.
    fn send_signed_message(&self, peer_uuid: &str, envelope: Envelope) -> Result<(), NodeError>;

    /// Send raw bytes to the peer identified by `peer_uuid`, without signing.
    fn send_message_str(&self, peer_uuid: &str, message: &[u8]) -> Result<(), NodeError>;
}

/// Error when trying to deliver a message to a peer.
#[derive(Debug)]
pub enum NodeError {
    /// No route to the peer (unknown uuid, or its connection is gone).
    PeerUnreachable { peer_uuid: String },

    /// The connection exists but the send failed.
    SendFailed { peer_uuid: String, reason: String },
}

impl Display for NodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::PeerUnreachable { peer_uuid } => {
                write!(f, "peer {} is unreachable", peer_uuid)
            }
            NodeError::SendFailed { peer_uuid, reason } => {
                write!(f, "sending to peer {} failed: {}", peer_uuid, reason)
            }
        }
    }
}

/// A client connection. Sessions are handed to the CRUD service alongside the request that
/// arrived on them, and are retained by the subscription manager for pushing updates.
///
/// A session may outlive its connection; [`is_open`](Session::is_open) reports whether sends
/// can still be expected to arrive. Sends on a closed session are silently dropped by the
/// transport.
pub trait Session: Send + Sync {
    /// A process-unique id, used to key subscription registrations.
    fn id(&self) -> u64;

    /// Sign `envelope` with this node's key and send it to the client.
    fn send_signed_message(&self, envelope: Envelope);

    /// Send raw bytes to the client, without signing.
    fn send_message(&self, message: Vec<u8>);

    /// Whether the underlying connection is still alive.
    fn is_open(&self) -> bool;
}
