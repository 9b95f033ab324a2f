/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the signed [`Envelope`] every message travels in, the
//! [PBFT vote message](PbftMsg) recorded by operation slots, and the [`Keypair`] used to sign
//! envelopes.
//!
//! The payloads an envelope can carry are serialized opaquely (as byte strings) so that an
//! envelope can be stored, forwarded, and hashed without the handling code having to understand
//! the payload. [Database messages](crate::crud::messages) and [`PbftMsg`]s are encoded with
//! borsh; the helpers on `Envelope` wrap and unwrap them.

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::crud::messages::{DatabaseMsg, DatabaseResponse};
use crate::status::StatusResponse;
use crate::types::basic::{NodeUuid, RequestHash, SequenceNumber, ViewNumber};

/// The kinds of payload an [`Envelope`] can carry. Used to key
/// [message handler registration](crate::networking::Node::register_for_message).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    DatabaseMsg,
    DatabaseResponse,
    Pbft,
    StatusRequest,
    StatusResponse,
}

/// A serialized message, tagged with its kind.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum Payload {
    DatabaseMsg(Vec<u8>),
    DatabaseResponse(Vec<u8>),
    Pbft(Vec<u8>),
    StatusRequest(Vec<u8>),
    StatusResponse(Vec<u8>),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::DatabaseMsg(_) => PayloadKind::DatabaseMsg,
            Payload::DatabaseResponse(_) => PayloadKind::DatabaseResponse,
            Payload::Pbft(_) => PayloadKind::Pbft,
            Payload::StatusRequest(_) => PayloadKind::StatusRequest,
            Payload::StatusResponse(_) => PayloadKind::StatusResponse,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Payload::DatabaseMsg(bytes) => bytes,
            Payload::DatabaseResponse(bytes) => bytes,
            Payload::Pbft(bytes) => bytes,
            Payload::StatusRequest(bytes) => bytes,
            Payload::StatusResponse(bytes) => bytes,
        }
    }
}

/// The unit of exchange between nodes, clients, and the consensus layer: a payload attributed
/// to a sender, optionally signed.
///
/// An empty `signature` marks an unsigned envelope (quick reads travel unsigned; everything
/// else is signed by the session or node layer before hitting the wire).
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Envelope {
    pub sender: NodeUuid,
    pub signature: Vec<u8>,
    pub payload: Payload,
}

impl Envelope {
    /// Create an unsigned envelope.
    pub fn unsigned(sender: &str, payload: Payload) -> Self {
        Self {
            sender: sender.to_string(),
            signature: Vec::new(),
            payload,
        }
    }

    /// Create an unsigned envelope carrying a serialized [`DatabaseMsg`].
    pub fn database_msg(sender: &str, msg: &DatabaseMsg) -> Self {
        Self::unsigned(sender, Payload::DatabaseMsg(msg.try_to_vec().unwrap()))
    }

    /// Create an unsigned envelope carrying a serialized [`DatabaseResponse`].
    pub fn database_response(sender: &str, response: &DatabaseResponse) -> Self {
        Self::unsigned(
            sender,
            Payload::DatabaseResponse(response.try_to_vec().unwrap()),
        )
    }

    /// Create an unsigned envelope carrying a serialized [`PbftMsg`].
    pub fn pbft(sender: &str, msg: &PbftMsg) -> Self {
        Self::unsigned(sender, Payload::Pbft(msg.try_to_vec().unwrap()))
    }

    /// Create an unsigned envelope carrying a serialized [`StatusResponse`].
    pub fn status_response(sender: &str, response: &StatusResponse) -> Self {
        Self::unsigned(
            sender,
            Payload::StatusResponse(response.try_to_vec().unwrap()),
        )
    }

    /// Decode the payload as a [`StatusResponse`].
    pub fn decode_status_response(&self) -> Result<StatusResponse, MessageError> {
        match &self.payload {
            Payload::StatusResponse(bytes) => {
                StatusResponse::deserialize(&mut &**bytes).map_err(MessageError::DeserializeError)
            }
            payload => Err(MessageError::UnexpectedPayload {
                expected: PayloadKind::StatusResponse,
                actual: payload.kind(),
            }),
        }
    }

    /// The bytes that are signed: the serialization of the sender and the payload. The
    /// signature field itself is excluded so that signing is idempotent.
    pub fn signing_bytes(&self) -> Vec<u8> {
        (&self.sender, &self.payload).try_to_vec().unwrap()
    }

    /// Sign this envelope in place with `keypair`.
    pub fn sign(&mut self, keypair: &Keypair) {
        self.signature = keypair.sign(&self.signing_bytes());
    }

    /// Whether the envelope carries a signature at all.
    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    /// Verify that `signature` is a signature created by `verifying_key` over
    /// [`signing_bytes`](Envelope::signing_bytes).
    pub fn is_correct(&self, verifying_key: &VerifyingKey) -> bool {
        match Signature::from_slice(&self.signature) {
            Ok(signature) => verifying_key.verify(&self.signing_bytes(), &signature).is_ok(),
            Err(_) => false,
        }
    }

    /// The content hash identifying this envelope in consensus: the Base64 encoding of the
    /// SHA-256 digest of [`signing_bytes`](Envelope::signing_bytes).
    pub fn request_hash(&self) -> RequestHash {
        use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

        let mut hasher = Sha256::new();
        hasher.update(self.signing_bytes());
        RequestHash::new(STANDARD_NO_PAD.encode(hasher.finalize()))
    }

    /// Decode the payload as a [`DatabaseMsg`].
    pub fn decode_database_msg(&self) -> Result<DatabaseMsg, MessageError> {
        match &self.payload {
            Payload::DatabaseMsg(bytes) => {
                DatabaseMsg::deserialize(&mut &**bytes).map_err(MessageError::DeserializeError)
            }
            payload => Err(MessageError::UnexpectedPayload {
                expected: PayloadKind::DatabaseMsg,
                actual: payload.kind(),
            }),
        }
    }

    /// Decode the payload as a [`DatabaseResponse`].
    pub fn decode_database_response(&self) -> Result<DatabaseResponse, MessageError> {
        match &self.payload {
            Payload::DatabaseResponse(bytes) => DatabaseResponse::deserialize(&mut &**bytes)
                .map_err(MessageError::DeserializeError),
            payload => Err(MessageError::UnexpectedPayload {
                expected: PayloadKind::DatabaseResponse,
                actual: payload.kind(),
            }),
        }
    }

    /// Decode the payload as a [`PbftMsg`].
    pub fn decode_pbft_msg(&self) -> Result<PbftMsg, MessageError> {
        match &self.payload {
            Payload::Pbft(bytes) => {
                PbftMsg::deserialize(&mut &**bytes).map_err(MessageError::DeserializeError)
            }
            payload => Err(MessageError::UnexpectedPayload {
                expected: PayloadKind::Pbft,
                actual: payload.kind(),
            }),
        }
    }
}

/// Error when trying to decode an [`Envelope`]'s payload as a concrete message type.
#[derive(Debug)]
pub enum MessageError {
    /// The payload is of a different kind than the decoder expected.
    UnexpectedPayload {
        expected: PayloadKind,
        actual: PayloadKind,
    },

    /// The payload is of the expected kind but its bytes do not deserialize.
    DeserializeError(std::io::Error),
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageError::UnexpectedPayload { expected, actual } => {
                write!(f, "expected a {:?} payload, found {:?}", expected, actual)
            }
            MessageError::DeserializeError(source) => {
                write!(f, "payload failed to deserialize: {}", source)
            }
        }
    }
}

/// The PBFT protocol message types. Of these, only `PrePrepare`, `Prepare`, and `Commit` are
/// votes that [operation slots](crate::operations::PersistentOperation) record; the rest are
/// consumed by the (external) PBFT driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum PbftMsgType {
    PrePrepare,
    Prepare,
    Commit,
    Checkpoint,
    ViewChange,
    NewView,
}

/// A PBFT protocol message: a vote by `sender` (carried on the envelope) about the request
/// identified by `request_hash` occupying the consensus slot `(view, sequence)`.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct PbftMsg {
    pub msg_type: PbftMsgType,
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub request_hash: RequestHash,
}

/// A wrapper around [`SigningKey`] which implements a convenience method for creating
/// signatures, used by node and session implementations to sign outgoing envelopes.
pub struct Keypair(SigningKey);

impl Keypair {
    pub fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    /// Convenience method for creating signatures over values or messages represented as byte
    /// slices.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.0.sign(message).to_bytes().to_vec()
    }

    pub fn public(&self) -> VerifyingKey {
        self.0.verifying_key()
    }
}
