//! Tests for the persistent PBFT operation slot: crash rehydration, vote quorums, stage
//! monotonicity, and the range operations the checkpoint protocol relies on.

mod common;

use std::sync::Arc;

use common::mocks::{static_beacon_for_test_peers, StaticBeacon, TEST_PEER_UUIDS};
use log::LevelFilter;
use swarm_kv::crud::messages::{DatabaseHeader, DatabaseMsg, DatabaseMsgKind};
use swarm_kv::messages::{Envelope, PbftMsg, PbftMsgType};
use swarm_kv::operations::{OperationError, OperationStage, PersistentOperation};
use swarm_kv::storage::mem_storage::MemStorage;
use swarm_kv::storage::Storage;
use swarm_kv::types::basic::{RequestHash, SequenceNumber, ViewNumber};

const VIEW: u64 = 1;
const SEQUENCE: u64 = 2;
const REQUEST_HASH: &str = "a very hashy hash";

fn operation(view: u64, sequence: u64, hash: &str, storage: &Arc<MemStorage>) -> PersistentOperation {
    PersistentOperation::new(
        ViewNumber::new(view),
        SequenceNumber::new(sequence),
        RequestHash::from(hash),
        storage.clone() as Arc<dyn Storage>,
    )
}

fn vote_msg(op: &PersistentOperation, msg_type: PbftMsgType) -> PbftMsg {
    PbftMsg {
        msg_type,
        view: op.get_view(),
        sequence: op.get_sequence(),
        request_hash: op.get_request_hash().clone(),
    }
}

fn record_pbft_messages(from: usize, until: usize, msg_type: PbftMsgType, op: &PersistentOperation) {
    let msg = vote_msg(op, msg_type);

    for peer in &TEST_PEER_UUIDS[from..until] {
        op.record_pbft_msg(&msg, &Envelope::pbft(peer, &msg)).unwrap();
    }
}

fn record_request(op: &PersistentOperation, nonce: u64) {
    let mut header = DatabaseHeader::new("a db");
    header.nonce = nonce;
    let request = DatabaseMsg::new(header, DatabaseMsgKind::Keys);

    op.record_request(&Envelope::database_msg("a client", &request));
}

#[test]
fn remembers_state_after_rehydrate() {
    common::logging::setup_logger(LevelFilter::Error);

    let storage = Arc::new(MemStorage::new());
    let beacon = static_beacon_for_test_peers();

    let op = operation(VIEW, SEQUENCE, REQUEST_HASH, &storage);
    record_request(&op, 6);
    record_pbft_messages(0, 1, PbftMsgType::PrePrepare, &op);
    record_pbft_messages(0, 4, PbftMsgType::Prepare, &op);
    op.advance_operation_stage(OperationStage::Commit, &*beacon).unwrap();

    assert!(op.is_ready_for_commit(&*beacon));
    assert_eq!(op.get_stage().unwrap(), OperationStage::Commit);

    drop(op);
    let op2 = operation(VIEW, SEQUENCE, REQUEST_HASH, &storage);
    assert!(op2.is_ready_for_commit(&*beacon));
    assert_eq!(op2.get_stage().unwrap(), OperationStage::Commit);

    let op3 = operation(VIEW, SEQUENCE + 1, REQUEST_HASH, &storage);
    assert!(!op3.is_ready_for_commit(&*beacon));
    assert_eq!(op3.get_stage().unwrap(), OperationStage::Prepare);
}

#[test]
fn remembers_request_after_rehydrate() {
    let storage = Arc::new(MemStorage::new());

    let op = operation(VIEW, SEQUENCE, REQUEST_HASH, &storage);
    record_request(&op, 9999);
    assert!(op.has_request());
    assert!(op.has_db_request());
    assert_eq!(op.get_database_msg().unwrap().header.nonce, 9999);

    drop(op);
    let op2 = operation(VIEW, SEQUENCE, REQUEST_HASH, &storage);
    assert!(op2.has_db_request());
    assert_eq!(op2.get_database_msg().unwrap().header.nonce, 9999);

    let op3 = operation(VIEW + 1, SEQUENCE, REQUEST_HASH, &storage);
    assert!(!op3.has_db_request());
}

#[test]
fn continue_progressing_state_after_rehydrate() {
    let storage = Arc::new(MemStorage::new());
    let beacon = static_beacon_for_test_peers();

    let op = operation(VIEW, SEQUENCE, REQUEST_HASH, &storage);
    record_request(&op, 6);
    record_pbft_messages(0, 1, PbftMsgType::PrePrepare, &op);
    record_pbft_messages(0, 2, PbftMsgType::Prepare, &op);

    assert_eq!(op.get_stage().unwrap(), OperationStage::Prepare);
    assert!(op.is_preprepared());
    assert!(op.has_request());

    drop(op);
    let op2 = operation(VIEW, SEQUENCE, REQUEST_HASH, &storage);

    assert_eq!(op2.get_stage().unwrap(), OperationStage::Prepare);
    assert!(op2.is_preprepared());
    assert!(op2.has_request());

    record_pbft_messages(2, 4, PbftMsgType::Prepare, &op2);
    assert!(op2.is_ready_for_commit(&*beacon));
    op2.advance_operation_stage(OperationStage::Commit, &*beacon).unwrap();

    record_pbft_messages(0, 4, PbftMsgType::Commit, &op2);
    assert!(op2.is_ready_for_execute(&*beacon));
    op2.advance_operation_stage(OperationStage::Execute, &*beacon).unwrap();
}

#[test]
fn no_contamination_from_different_request() {
    let storage = Arc::new(MemStorage::new());
    let beacon = static_beacon_for_test_peers();

    let op2 = operation(VIEW, SEQUENCE, REQUEST_HASH, &storage);
    let op3 = operation(VIEW + 1, SEQUENCE, REQUEST_HASH, &storage);
    let op4 = operation(VIEW, SEQUENCE, &format!("{}xx", REQUEST_HASH), &storage);

    // op2 gets just a preprepare, op3 gets 2f prepares, op4 gets 2f+1 prepares
    for op in [&op2, &op3, &op4] {
        record_request(op, 6);
        record_pbft_messages(0, 1, PbftMsgType::PrePrepare, op);
    }

    record_pbft_messages(0, 2, PbftMsgType::Prepare, &op3);
    record_pbft_messages(0, 3, PbftMsgType::Prepare, &op4);

    op4.advance_operation_stage(OperationStage::Commit, &*beacon).unwrap();

    assert!(!op2.is_ready_for_commit(&*beacon));
    assert!(!op3.is_ready_for_commit(&*beacon));
    assert!(op4.is_ready_for_commit(&*beacon));
}

#[test]
fn remembers_messages_after_rehydrate() {
    let storage = Arc::new(MemStorage::new());
    let beacon = static_beacon_for_test_peers();

    let op = operation(VIEW, SEQUENCE, REQUEST_HASH, &storage);
    record_request(&op, 6);
    record_pbft_messages(0, 1, PbftMsgType::PrePrepare, &op);
    record_pbft_messages(0, 2, PbftMsgType::Prepare, &op);

    drop(op);
    let op2 = operation(VIEW, SEQUENCE, REQUEST_HASH, &storage);

    record_pbft_messages(2, 4, PbftMsgType::Prepare, &op2);
    op2.advance_operation_stage(OperationStage::Commit, &*beacon).unwrap();

    assert!(op2.is_ready_for_commit(&*beacon));
    assert_eq!(op2.get_preprepare().unwrap().sender, TEST_PEER_UUIDS[0]);
    assert_eq!(op2.get_prepares().unwrap().len(), 4);

    // Rehydrated envelopes are byte-identical to what was recorded.
    let msg = vote_msg(&op2, PbftMsgType::Prepare);
    assert_eq!(
        op2.get_prepares().unwrap().get("bob"),
        Some(&Envelope::pbft("bob", &msg))
    );
}

#[test]
fn duplicate_preprepare_from_another_sender_is_ignored() {
    let storage = Arc::new(MemStorage::new());

    let op = operation(VIEW, SEQUENCE, REQUEST_HASH, &storage);
    record_pbft_messages(0, 1, PbftMsgType::PrePrepare, &op);
    record_pbft_messages(1, 2, PbftMsgType::PrePrepare, &op);

    assert_eq!(op.get_preprepare().unwrap().sender, "alice");
}

#[test]
fn only_vote_messages_are_recorded() {
    let storage = Arc::new(MemStorage::new());

    let op = operation(VIEW, SEQUENCE, REQUEST_HASH, &storage);
    let msg = vote_msg(&op, PbftMsgType::ViewChange);

    assert!(matches!(
        op.record_pbft_msg(&msg, &Envelope::pbft("alice", &msg)),
        Err(OperationError::UnexpectedMessageType { .. })
    ));
}

#[test]
fn advancing_a_stage_twice_is_rejected() {
    let storage = Arc::new(MemStorage::new());
    let beacon = static_beacon_for_test_peers();

    let op = operation(VIEW, SEQUENCE, REQUEST_HASH, &storage);
    record_request(&op, 6);
    record_pbft_messages(0, 1, PbftMsgType::PrePrepare, &op);
    record_pbft_messages(0, 4, PbftMsgType::Prepare, &op);

    op.advance_operation_stage(OperationStage::Commit, &*beacon).unwrap();
    assert!(matches!(
        op.advance_operation_stage(OperationStage::Commit, &*beacon),
        Err(OperationError::StageNotMonotonic { .. })
    ));
}

#[test]
fn advancing_without_a_quorum_is_rejected() {
    let storage = Arc::new(MemStorage::new());
    let beacon = static_beacon_for_test_peers();

    let op = operation(VIEW, SEQUENCE, REQUEST_HASH, &storage);
    record_pbft_messages(0, 1, PbftMsgType::PrePrepare, &op);
    record_pbft_messages(0, 2, PbftMsgType::Prepare, &op);

    assert!(matches!(
        op.advance_operation_stage(OperationStage::Commit, &*beacon),
        Err(OperationError::QuorumNotReached { .. })
    ));
}

#[test]
fn quorum_counts_prepares_recorded_across_rehydrates() {
    let storage = Arc::new(MemStorage::new());
    let beacon = static_beacon_for_test_peers();

    // One preprepare and two prepares before the "crash"...
    let op = operation(1, 2, "H", &storage);
    record_pbft_messages(0, 1, PbftMsgType::PrePrepare, &op);
    record_pbft_messages(0, 2, PbftMsgType::Prepare, &op);
    drop(op);

    // ...two more prepares after: 4 >= 2 * floor(4 / 3) + 1 = 3.
    let op = operation(1, 2, "H", &storage);
    record_pbft_messages(2, 4, PbftMsgType::Prepare, &op);
    assert!(op.is_ready_for_commit(&*beacon));
}

#[test]
fn a_quorum_on_one_slot_does_not_prepare_another() {
    let storage = Arc::new(MemStorage::new());
    let beacon = static_beacon_for_test_peers();

    let first = operation(1, 2, "H", &storage);
    let second = operation(1, 2, "H2", &storage);
    record_pbft_messages(0, 4, PbftMsgType::Prepare, &second);

    assert!(second.is_ready_for_commit(&*beacon));
    assert!(!first.is_ready_for_commit(&*beacon));
}

#[test]
fn a_smaller_swarm_has_a_smaller_quorum() {
    let storage = Arc::new(MemStorage::new());
    let small_beacon = StaticBeacon::new(common::mocks::test_peer_list()[0..2].to_vec());

    // f = floor(2 / 3) = 0, so a single prepare is a quorum.
    let op = operation(VIEW, SEQUENCE, REQUEST_HASH, &storage);
    record_pbft_messages(0, 1, PbftMsgType::Prepare, &op);

    assert!(op.is_ready_for_commit(&*small_beacon));
}

#[test]
fn test_prepared_in_range() {
    let storage = Arc::new(MemStorage::new());
    let beacon = static_beacon_for_test_peers();

    for i in 0..100u64 {
        let op = operation(1, i, "some_hash", &storage);
        record_request(&op, 6);
        record_pbft_messages(0, 1, PbftMsgType::PrePrepare, &op);

        // record 1-4 prepares
        record_pbft_messages(0, (i % 4 + 1) as usize, PbftMsgType::Prepare, &op);
        if i % 4 + 1 > 2 {
            op.advance_operation_stage(OperationStage::Commit, &*beacon).unwrap();
        }
    }

    let prepared = PersistentOperation::prepared_operations_in_range(
        &*storage,
        SequenceNumber::new(0),
        SequenceNumber::new(100),
    );
    assert_eq!(prepared.len(), 50);

    // Ordered by sequence, and every entry had reached a prepare quorum.
    assert!(prepared.windows(2).all(|pair| pair[0].1 < pair[1].1));
    assert!(prepared.iter().all(|(_, sequence, _)| sequence.int() % 4 >= 2));
}

#[test]
fn test_remove_range() {
    let storage = Arc::new(MemStorage::new());

    // note - there's an extra operation in there from the fixture
    let _fixture = operation(VIEW, SEQUENCE, REQUEST_HASH, &storage);

    for i in 0..100u64 {
        let op = operation(1, i, "some_hash", &storage);
        record_request(&op, 6);
        record_pbft_messages(0, 1, PbftMsgType::PrePrepare, &op);
    }

    assert_eq!(storage.get_size(PersistentOperation::get_uuid()).0, 301);

    PersistentOperation::remove_range(
        &*storage,
        SequenceNumber::new(50),
        SequenceNumber::new(60),
    );
    assert_eq!(storage.get_size(PersistentOperation::get_uuid()).0, 271);

    PersistentOperation::remove_range(
        &*storage,
        SequenceNumber::new(0),
        SequenceNumber::new(10),
    );
    assert_eq!(storage.get_size(PersistentOperation::get_uuid()).0, 240);
}
