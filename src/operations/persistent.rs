/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`PersistentOperation`] type: a handle on one consensus slot's records in storage.
//!
//! A `PersistentOperation` holds no state of its own beyond its identity: every mutation goes
//! straight to storage, and every query reads storage. Constructing a handle with the identity
//! of a slot that already has records "rehydrates" it: the new handle observes exactly the
//! state the old one left behind, which is what makes operations survive crashes and view
//! changes.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::crud::messages::DatabaseMsg;
use crate::messages::{Envelope, MessageError, PbftMsg, PbftMsgType};
use crate::pbft::{max_faulty_peers, PeersBeacon};
use crate::storage::{Storage, StorageResult};
use crate::types::basic::{NodeUuid, RequestHash, SequenceNumber, ViewNumber};

use super::paths;
use super::{OperationStage, OPERATIONS_UUID};

/// A per-slot PBFT state machine backed by storage. See the [module docs](super) for the
/// record layout.
pub struct PersistentOperation {
    view: ViewNumber,
    sequence: SequenceNumber,
    request_hash: RequestHash,
    prefix: String,
    storage: Arc<dyn Storage>,
}

impl PersistentOperation {
    /// Create a handle on the slot `(view, sequence, request_hash)`. If the slot has no
    /// records yet, its stage record is initialized to [`Prepare`](OperationStage::Prepare);
    /// otherwise the existing records are left untouched and the handle rehydrates them.
    pub fn new(
        view: ViewNumber,
        sequence: SequenceNumber,
        request_hash: RequestHash,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let prefix = paths::slot_prefix(view, sequence, &request_hash);

        let stage_key = paths::field_key(&prefix, paths::STAGE_FIELD);
        storage.create(
            OPERATIONS_UUID,
            &stage_key,
            &OperationStage::Prepare.try_to_vec().unwrap(),
        );

        Self {
            view,
            sequence,
            request_hash,
            prefix,
            storage,
        }
    }

    pub fn get_view(&self) -> ViewNumber {
        self.view
    }

    pub fn get_sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn get_request_hash(&self) -> &RequestHash {
        &self.request_hash
    }

    /// Record a pre-prepare, prepare, or commit envelope. Duplicate `(type, sender)` pairs
    /// overwrite (recording is idempotent for honest peers); a second pre-prepare from a
    /// different sender is ignored. Message types that are not votes are rejected.
    ///
    /// `msg` must carry this slot's view, sequence, and request hash; routing messages to
    /// slots is the PBFT driver's job.
    pub fn record_pbft_msg(&self, msg: &PbftMsg, envelope: &Envelope) -> Result<(), OperationError> {
        debug_assert_eq!(msg.view, self.view);
        debug_assert_eq!(msg.sequence, self.sequence);
        debug_assert_eq!(msg.request_hash, self.request_hash);

        let bytes = envelope.try_to_vec().unwrap();

        match msg.msg_type {
            PbftMsgType::PrePrepare => {
                let key = paths::field_key(&self.prefix, paths::PREPREPARE_FIELD);
                if self.storage.has(OPERATIONS_UUID, &key) {
                    log::debug!(
                        "ignoring preprepare from {} for already preprepared slot {}",
                        envelope.sender,
                        self.prefix
                    );
                    return Ok(());
                }
                self.storage.create(OPERATIONS_UUID, &key, &bytes);
            }
            PbftMsgType::Prepare => {
                self.upsert(
                    &paths::vote_key(&self.prefix, paths::PREPARE_FIELD, &envelope.sender),
                    &bytes,
                );
            }
            PbftMsgType::Commit => {
                self.upsert(
                    &paths::vote_key(&self.prefix, paths::COMMIT_FIELD, &envelope.sender),
                    &bytes,
                );
            }
            msg_type => return Err(OperationError::UnexpectedMessageType { msg_type }),
        }

        Ok(())
    }

    /// Record the client request envelope. Stored once; later calls are no-ops.
    pub fn record_request(&self, envelope: &Envelope) {
        let key = paths::field_key(&self.prefix, paths::REQUEST_FIELD);
        if self.storage.has(OPERATIONS_UUID, &key) {
            return;
        }
        self.storage
            .create(OPERATIONS_UUID, &key, &envelope.try_to_vec().unwrap());
    }

    /// Whether a client request envelope has been recorded.
    pub fn has_request(&self) -> bool {
        self.storage.has(
            OPERATIONS_UUID,
            &paths::field_key(&self.prefix, paths::REQUEST_FIELD),
        )
    }

    /// Whether a client request envelope has been recorded and carries a database message.
    pub fn has_db_request(&self) -> bool {
        self.get_database_msg().is_ok()
    }

    /// The recorded client request envelope.
    pub fn get_request(&self) -> Result<Envelope, OperationError> {
        self.read_envelope(&paths::field_key(&self.prefix, paths::REQUEST_FIELD))
    }

    /// The database message inside the recorded client request envelope.
    pub fn get_database_msg(&self) -> Result<DatabaseMsg, OperationError> {
        let key = paths::field_key(&self.prefix, paths::REQUEST_FIELD);
        self.get_request()?
            .decode_database_msg()
            .map_err(|source| OperationError::PayloadError { key, source })
    }

    /// The accepted pre-prepare envelope.
    pub fn get_preprepare(&self) -> Result<Envelope, OperationError> {
        self.read_envelope(&paths::field_key(&self.prefix, paths::PREPREPARE_FIELD))
    }

    /// The recorded prepare envelopes, by sender.
    pub fn get_prepares(&self) -> Result<BTreeMap<NodeUuid, Envelope>, OperationError> {
        self.votes(paths::PREPARE_FIELD)
    }

    /// The recorded commit envelopes, by sender.
    pub fn get_commits(&self) -> Result<BTreeMap<NodeUuid, Envelope>, OperationError> {
        self.votes(paths::COMMIT_FIELD)
    }

    /// Whether a pre-prepare has been accepted.
    pub fn is_preprepared(&self) -> bool {
        self.storage.has(
            OPERATIONS_UUID,
            &paths::field_key(&self.prefix, paths::PREPREPARE_FIELD),
        )
    }

    /// Whether this slot has collected a prepare quorum (`2f + 1` prepares, with `f` computed
    /// from `beacon`'s current peer count).
    pub fn is_ready_for_commit(&self, beacon: &dyn PeersBeacon) -> bool {
        self.count_votes(paths::PREPARE_FIELD) >= self.quorum(beacon)
            && self
                .get_stage()
                .map(|stage| stage >= OperationStage::Prepare)
                .unwrap_or(false)
    }

    /// Whether this slot has collected a commit quorum and already reached the
    /// [`Commit`](OperationStage::Commit) stage.
    pub fn is_ready_for_execute(&self, beacon: &dyn PeersBeacon) -> bool {
        self.count_votes(paths::COMMIT_FIELD) >= self.quorum(beacon)
            && self
                .get_stage()
                .map(|stage| stage >= OperationStage::Commit)
                .unwrap_or(false)
    }

    /// The slot's current stage.
    pub fn get_stage(&self) -> Result<OperationStage, OperationError> {
        let key = paths::field_key(&self.prefix, paths::STAGE_FIELD);
        let bytes = self
            .storage
            .read(OPERATIONS_UUID, &key)
            .ok_or(OperationError::ValueNotFound { key: key.clone() })?;
        OperationStage::deserialize(&mut &*bytes)
            .map_err(|source| OperationError::DeserializeValueError { key, source })
    }

    /// Advance the slot to `target`. Stages are strictly monotonic, and the vote quorum
    /// prerequisite for `target` is checked: advancing to
    /// [`Commit`](OperationStage::Commit) requires
    /// [`is_ready_for_commit`](PersistentOperation::is_ready_for_commit), advancing to
    /// [`Execute`](OperationStage::Execute) requires
    /// [`is_ready_for_execute`](PersistentOperation::is_ready_for_execute).
    pub fn advance_operation_stage(
        &self,
        target: OperationStage,
        beacon: &dyn PeersBeacon,
    ) -> Result<(), OperationError> {
        let current = self.get_stage()?;
        if target <= current {
            return Err(OperationError::StageNotMonotonic { current, target });
        }

        let ready = match target {
            OperationStage::Prepare => unreachable!("Prepare is never above the current stage"),
            OperationStage::Commit => self.is_ready_for_commit(beacon),
            OperationStage::Execute => self.is_ready_for_execute(beacon),
        };
        if !ready {
            return Err(OperationError::QuorumNotReached {
                target,
                quorum: self.quorum(beacon),
            });
        }

        let key = paths::field_key(&self.prefix, paths::STAGE_FIELD);
        match self
            .storage
            .update(OPERATIONS_UUID, &key, &target.try_to_vec().unwrap())
        {
            StorageResult::Ok => Ok(()),
            _ => Err(OperationError::ValueNotFound { key }),
        }
    }

    /// Every slot in `(lo, hi]` whose stage is [`Commit`](OperationStage::Commit) or later,
    /// ordered by sequence. This is what a view change works from: the set of operations the
    /// replica had proven prepared when the view ended.
    pub fn prepared_operations_in_range(
        storage: &dyn Storage,
        lo: SequenceNumber,
        hi: SequenceNumber,
    ) -> Vec<(ViewNumber, SequenceNumber, RequestHash)> {
        let mut slots = Vec::new();

        for key in storage.get_keys(OPERATIONS_UUID) {
            let Some((view, sequence, hash)) = paths::parse_stage_key(&key) else {
                continue;
            };
            if sequence <= lo || sequence > hi {
                continue;
            }

            let stage = storage
                .read(OPERATIONS_UUID, &key)
                .and_then(|bytes| OperationStage::deserialize(&mut &*bytes).ok());
            if matches!(stage, Some(stage) if stage >= OperationStage::Commit) {
                slots.push((view, sequence, hash));
            }
        }

        slots.sort_by_key(|(_, sequence, _)| *sequence);
        slots
    }

    /// Erase every record of every slot in `(lo, hi]`. Invoked when a checkpoint at `hi` is
    /// stabilized and the slots at or below it will never be needed again.
    pub fn remove_range(storage: &dyn Storage, lo: SequenceNumber, hi: SequenceNumber) {
        for key in storage.get_keys(OPERATIONS_UUID) {
            if let Some(sequence) = paths::parse_sequence(&key) {
                if sequence > lo.int() && sequence <= hi.int() {
                    storage.remove(OPERATIONS_UUID, &key);
                }
            }
        }
    }

    /// The reserved namespace operation records live in.
    pub fn get_uuid() -> &'static str {
        OPERATIONS_UUID
    }

    fn quorum(&self, beacon: &dyn PeersBeacon) -> usize {
        2 * max_faulty_peers(beacon.current().len()) + 1
    }

    fn upsert(&self, key: &str, value: &[u8]) {
        if self.storage.create(OPERATIONS_UUID, key, value) == StorageResult::Exists {
            self.storage.update(OPERATIONS_UUID, key, value);
        }
    }

    fn read_envelope(&self, key: &str) -> Result<Envelope, OperationError> {
        let bytes = self
            .storage
            .read(OPERATIONS_UUID, key)
            .ok_or(OperationError::ValueNotFound {
                key: key.to_string(),
            })?;
        Envelope::deserialize(&mut &*bytes).map_err(|source| {
            OperationError::DeserializeValueError {
                key: key.to_string(),
                source,
            }
        })
    }

    fn votes(&self, field: &str) -> Result<BTreeMap<NodeUuid, Envelope>, OperationError> {
        let vote_prefix = format!("{}/{}/", self.prefix, field);
        let mut votes = BTreeMap::new();

        for key in self.storage.get_keys(OPERATIONS_UUID) {
            if let Some(sender) = key.strip_prefix(&vote_prefix) {
                let envelope = self.read_envelope(&key)?;
                votes.insert(sender.to_string(), envelope);
            }
        }

        Ok(votes)
    }

    fn count_votes(&self, field: &str) -> usize {
        let vote_prefix = format!("{}/{}/", self.prefix, field);
        self.storage
            .get_keys(OPERATIONS_UUID)
            .iter()
            .filter(|key| key.starts_with(&vote_prefix))
            .count()
    }
}

/// Error when reading or advancing an operation slot.
#[derive(Debug)]
pub enum OperationError {
    /// A record that the slot's state implies should exist was not found.
    ValueNotFound { key: String },

    /// A record exists but its bytes do not deserialize into the expected type.
    DeserializeValueError { key: String, source: std::io::Error },

    /// A recorded envelope does not carry the payload the accessor expected.
    PayloadError { key: String, source: MessageError },

    /// The requested message type is not a vote that slots record.
    UnexpectedMessageType { msg_type: PbftMsgType },

    /// An attempt to move a slot to the stage it is already at, or an earlier one.
    StageNotMonotonic {
        current: OperationStage,
        target: OperationStage,
    },

    /// An attempt to advance a slot that has not collected the votes the target stage
    /// requires.
    QuorumNotReached {
        target: OperationStage,
        quorum: usize,
    },
}

impl Display for OperationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OperationError::ValueNotFound { key } => {
                write!(f, "operation record not found: {}", key)
            }
            OperationError::DeserializeValueError { key, source } => {
                write!(f, "operation record {} failed to deserialize: {}", key, source)
            }
            OperationError::PayloadError { key, source } => {
                write!(f, "operation record {} has an unexpected payload: {}", key, source)
            }
            OperationError::UnexpectedMessageType { msg_type } => {
                write!(f, "{:?} messages are not recorded by operations", msg_type)
            }
            OperationError::StageNotMonotonic { current, target } => {
                write!(f, "cannot advance from stage {:?} to {:?}", current, target)
            }
            OperationError::QuorumNotReached { target, quorum } => {
                write!(f, "cannot advance to {:?} without {} votes", target, quorum)
            }
        }
    }
}
