//! "Mock" (totally local) implementations of the swarm's pluggable ports: sessions that
//! collect what is sent on them, a node that signs and records outbound messages, and a PBFT
//! driver that records submitted database messages instead of ordering them.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use borsh::BorshDeserialize;
use ed25519_dalek::SigningKey;

use swarm_kv::config::CrudConfig;
use swarm_kv::crud::messages::{
    CreateDbRequest, CreateRequest, DatabaseHeader, DatabaseMsg, DatabaseMsgKind,
    DatabaseResponse, DeleteRequest, ExpireRequest, HasRequest, PersistRequest, ReadRequest,
    SubscribeRequest, TtlRequest, UnsubscribeRequest, UpdateRequest, WritersRequest,
};
use swarm_kv::crud::CrudService;
use swarm_kv::messages::{Envelope, Keypair, PayloadKind};
use swarm_kv::networking::{MessageHandler, Node, NodeError, Session};
use swarm_kv::pbft::{Pbft, PeersBeacon};
use swarm_kv::storage::mem_storage::MemStorage;
use swarm_kv::subscriptions::SubscriptionService;
use swarm_kv::types::basic::{NodeUuid, PeerAddress};

pub(crate) const TEST_PEER_UUIDS: [&str; 4] = ["alice", "bob", "cindy", "dave"];

pub(crate) fn test_peer_list() -> Vec<PeerAddress> {
    vec![
        PeerAddress::new("127.0.0.1", 8081, "name1", "alice"),
        PeerAddress::new("127.0.0.1", 8082, "name2", "bob"),
        PeerAddress::new("127.0.0.1", 8083, "name3", "cindy"),
        PeerAddress::new("127.0.0.1", 8084, "name4", "dave"),
    ]
}

/// A beacon whose peer list is fixed on construction.
pub(crate) struct StaticBeacon(Vec<PeerAddress>);

impl StaticBeacon {
    pub(crate) fn new(peers: Vec<PeerAddress>) -> Arc<StaticBeacon> {
        Arc::new(StaticBeacon(peers))
    }
}

impl PeersBeacon for StaticBeacon {
    fn current(&self) -> Vec<PeerAddress> {
        self.0.clone()
    }
}

pub(crate) fn static_beacon_for_test_peers() -> Arc<StaticBeacon> {
    StaticBeacon::new(test_peer_list())
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A session that collects everything sent on it.
pub(crate) struct MockSession {
    id: u64,
    open: AtomicBool,
    signed: Mutex<Vec<Envelope>>,
    unsigned: Mutex<Vec<Vec<u8>>>,
}

impl MockSession {
    pub(crate) fn new() -> Arc<MockSession> {
        Arc::new(MockSession {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            open: AtomicBool::new(true),
            signed: Mutex::new(Vec::new()),
            unsigned: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }

    /// Every envelope that arrived on the signed path, in arrival order.
    pub(crate) fn signed_envelopes(&self) -> Vec<Envelope> {
        self.signed.lock().unwrap().clone()
    }

    /// Every response that arrived on the signed path, in arrival order.
    pub(crate) fn signed_responses(&self) -> Vec<DatabaseResponse> {
        self.signed
            .lock()
            .unwrap()
            .iter()
            .map(|envelope| envelope.decode_database_response().unwrap())
            .collect()
    }

    pub(crate) fn last_signed_response(&self) -> DatabaseResponse {
        self.signed_responses()
            .pop()
            .expect("no signed response was sent on this session")
    }

    /// Every envelope that arrived on the raw (unsigned) path.
    pub(crate) fn unsigned_envelopes(&self) -> Vec<Envelope> {
        self.unsigned
            .lock()
            .unwrap()
            .iter()
            .map(|bytes| Envelope::deserialize(&mut &**bytes).unwrap())
            .collect()
    }

    pub(crate) fn signed_count(&self) -> usize {
        self.signed.lock().unwrap().len()
    }

    pub(crate) fn unsigned_count(&self) -> usize {
        self.unsigned.lock().unwrap().len()
    }
}

impl Session for MockSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn send_signed_message(&self, envelope: Envelope) {
        self.signed.lock().unwrap().push(envelope);
    }

    fn send_message(&self, message: Vec<u8>) {
        self.unsigned.lock().unwrap().push(message);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

/// A node that signs outbound messages with a fixed keypair and records them.
pub(crate) struct MockNode {
    keypair: Keypair,
    handlers: Mutex<HashMap<PayloadKind, MessageHandler>>,
    sent: Mutex<Vec<(NodeUuid, Envelope)>>,
}

impl MockNode {
    pub(crate) fn new() -> Arc<MockNode> {
        Arc::new(MockNode {
            keypair: Keypair::new(SigningKey::from_bytes(&[7u8; 32])),
            handlers: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub(crate) fn sent_messages(&self) -> Vec<(NodeUuid, Envelope)> {
        self.sent.lock().unwrap().clone()
    }

    /// Deliver an inbound envelope to the handler registered for its payload kind.
    pub(crate) fn deliver(&self, envelope: Envelope, session: Option<Arc<dyn Session>>) {
        let handlers = self.handlers.lock().unwrap();
        let handler = handlers
            .get(&envelope.payload.kind())
            .expect("no handler registered for this payload kind");
        handler(envelope, session);
    }
}

impl Node for MockNode {
    fn register_for_message(&self, kind: PayloadKind, handler: MessageHandler) {
        self.handlers.lock().unwrap().insert(kind, handler);
    }

    fn send_signed_message(&self, peer_uuid: &str, mut envelope: Envelope) -> Result<(), NodeError> {
        envelope.sign(&self.keypair);
        self.sent
            .lock()
            .unwrap()
            .push((peer_uuid.to_string(), envelope));
        Ok(())
    }

    fn send_message_str(&self, peer_uuid: &str, message: &[u8]) -> Result<(), NodeError> {
        let envelope = Envelope::deserialize(&mut &*message).map_err(|err| {
            NodeError::SendFailed {
                peer_uuid: peer_uuid.to_string(),
                reason: err.to_string(),
            }
        })?;
        self.sent
            .lock()
            .unwrap()
            .push((peer_uuid.to_string(), envelope));
        Ok(())
    }
}

/// A PBFT driver that records submitted database messages instead of ordering them. Tests
/// "commit" a submission by feeding it back into the CRUD service themselves.
pub(crate) struct MockPbft {
    uuid: NodeUuid,
    beacon: Arc<StaticBeacon>,
    submitted: Mutex<Vec<Envelope>>,
}

impl MockPbft {
    pub(crate) fn new(uuid: &str) -> Arc<MockPbft> {
        Arc::new(MockPbft {
            uuid: uuid.to_string(),
            beacon: static_beacon_for_test_peers(),
            submitted: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn take_submitted(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.submitted.lock().unwrap())
    }
}

impl Pbft for MockPbft {
    fn peers(&self) -> Arc<dyn PeersBeacon> {
        self.beacon.clone()
    }

    fn get_uuid(&self) -> NodeUuid {
        self.uuid.clone()
    }

    fn handle_database_message(&self, envelope: Envelope, _session: Option<Arc<dyn Session>>) {
        self.submitted.lock().unwrap().push(envelope);
    }
}

/// One replica's worth of wired-up CRUD machinery on mock ports.
pub(crate) struct TestSwarm {
    pub(crate) crud: Arc<CrudService>,
    pub(crate) storage: Arc<MemStorage>,
    pub(crate) pbft: Arc<MockPbft>,
    pub(crate) node: Arc<MockNode>,
    pub(crate) subscriptions: Arc<SubscriptionService>,
}

impl TestSwarm {
    /// A started CRUD service whose node uuid is `alice` (the first test peer), with the given
    /// swarm-wide storage cap.
    pub(crate) fn start(max_swarm_storage: u64) -> TestSwarm {
        Self::start_with_config(max_swarm_storage, CrudConfig::default())
    }

    pub(crate) fn start_with_config(max_swarm_storage: u64, config: CrudConfig) -> TestSwarm {
        let storage = Arc::new(MemStorage::new());
        let subscriptions = Arc::new(SubscriptionService::new());
        let node = MockNode::new();
        let pbft = MockPbft::new("alice");

        let crud = Arc::new(CrudService::new(
            storage.clone(),
            subscriptions.clone(),
            Some(node.clone()),
            config,
        ));
        crud.start(pbft.clone(), max_swarm_storage);

        TestSwarm {
            crud,
            storage,
            pbft,
            node,
            subscriptions,
        }
    }

    /// Run a request through the CRUD service on a fresh session and return the response that
    /// came back on the signed path.
    pub(crate) fn request(&self, caller_id: &str, msg: DatabaseMsg) -> DatabaseResponse {
        let session = MockSession::new();
        self.crud.handle_request(caller_id, &msg, Some(session.clone()));
        session.last_signed_response()
    }

    /// The wire name of the error a request produced, or `None` if it succeeded.
    pub(crate) fn request_error(&self, caller_id: &str, msg: DatabaseMsg) -> Option<String> {
        self.request(caller_id, msg).error.map(|error| error.message)
    }
}

// Request builders.

pub(crate) fn create_db_msg(db_uuid: &str, max_size: u64, eviction_policy: u16) -> DatabaseMsg {
    DatabaseMsg::new(
        DatabaseHeader::new(db_uuid),
        DatabaseMsgKind::CreateDb(CreateDbRequest {
            max_size,
            eviction_policy,
        }),
    )
}

pub(crate) fn update_db_msg(db_uuid: &str, max_size: u64, eviction_policy: u16) -> DatabaseMsg {
    DatabaseMsg::new(
        DatabaseHeader::new(db_uuid),
        DatabaseMsgKind::UpdateDb(CreateDbRequest {
            max_size,
            eviction_policy,
        }),
    )
}

pub(crate) fn delete_db_msg(db_uuid: &str) -> DatabaseMsg {
    DatabaseMsg::new(DatabaseHeader::new(db_uuid), DatabaseMsgKind::DeleteDb)
}

pub(crate) fn has_db_msg(db_uuid: &str) -> DatabaseMsg {
    DatabaseMsg::new(DatabaseHeader::new(db_uuid), DatabaseMsgKind::HasDb)
}

pub(crate) fn create_msg(db_uuid: &str, key: &str, value: &[u8], expire: u64) -> DatabaseMsg {
    DatabaseMsg::new(
        DatabaseHeader::new(db_uuid),
        DatabaseMsgKind::Create(CreateRequest {
            key: key.to_string(),
            value: value.to_vec(),
            expire,
        }),
    )
}

pub(crate) fn update_msg(db_uuid: &str, key: &str, value: &[u8], expire: u64) -> DatabaseMsg {
    DatabaseMsg::new(
        DatabaseHeader::new(db_uuid),
        DatabaseMsgKind::Update(UpdateRequest {
            key: key.to_string(),
            value: value.to_vec(),
            expire,
        }),
    )
}

pub(crate) fn read_msg(db_uuid: &str, key: &str) -> DatabaseMsg {
    DatabaseMsg::new(
        DatabaseHeader::new(db_uuid),
        DatabaseMsgKind::Read(ReadRequest {
            key: key.to_string(),
        }),
    )
}

pub(crate) fn quick_read_msg(db_uuid: &str, key: &str) -> DatabaseMsg {
    DatabaseMsg::new(
        DatabaseHeader::new(db_uuid),
        DatabaseMsgKind::QuickRead(ReadRequest {
            key: key.to_string(),
        }),
    )
}

pub(crate) fn delete_msg(db_uuid: &str, key: &str) -> DatabaseMsg {
    DatabaseMsg::new(
        DatabaseHeader::new(db_uuid),
        DatabaseMsgKind::Delete(DeleteRequest {
            key: key.to_string(),
        }),
    )
}

pub(crate) fn has_msg(db_uuid: &str, key: &str) -> DatabaseMsg {
    DatabaseMsg::new(
        DatabaseHeader::new(db_uuid),
        DatabaseMsgKind::Has(HasRequest {
            key: key.to_string(),
        }),
    )
}

pub(crate) fn keys_msg(db_uuid: &str) -> DatabaseMsg {
    DatabaseMsg::new(DatabaseHeader::new(db_uuid), DatabaseMsgKind::Keys)
}

pub(crate) fn size_msg(db_uuid: &str) -> DatabaseMsg {
    DatabaseMsg::new(DatabaseHeader::new(db_uuid), DatabaseMsgKind::Size)
}

pub(crate) fn writers_msg(db_uuid: &str) -> DatabaseMsg {
    DatabaseMsg::new(DatabaseHeader::new(db_uuid), DatabaseMsgKind::Writers)
}

pub(crate) fn add_writers_msg(db_uuid: &str, writers: &[&str]) -> DatabaseMsg {
    DatabaseMsg::new(
        DatabaseHeader::new(db_uuid),
        DatabaseMsgKind::AddWriters(WritersRequest {
            writers: writers.iter().map(|writer| writer.to_string()).collect(),
        }),
    )
}

pub(crate) fn remove_writers_msg(db_uuid: &str, writers: &[&str]) -> DatabaseMsg {
    DatabaseMsg::new(
        DatabaseHeader::new(db_uuid),
        DatabaseMsgKind::RemoveWriters(WritersRequest {
            writers: writers.iter().map(|writer| writer.to_string()).collect(),
        }),
    )
}

pub(crate) fn ttl_msg(db_uuid: &str, key: &str) -> DatabaseMsg {
    DatabaseMsg::new(
        DatabaseHeader::new(db_uuid),
        DatabaseMsgKind::Ttl(TtlRequest {
            key: key.to_string(),
        }),
    )
}

pub(crate) fn persist_msg(db_uuid: &str, key: &str) -> DatabaseMsg {
    DatabaseMsg::new(
        DatabaseHeader::new(db_uuid),
        DatabaseMsgKind::Persist(PersistRequest {
            key: key.to_string(),
        }),
    )
}

pub(crate) fn expire_msg(db_uuid: &str, key: &str, expire: u64) -> DatabaseMsg {
    DatabaseMsg::new(
        DatabaseHeader::new(db_uuid),
        DatabaseMsgKind::Expire(ExpireRequest {
            key: key.to_string(),
            expire,
        }),
    )
}

pub(crate) fn subscribe_msg(db_uuid: &str, key: &str, nonce: u64) -> DatabaseMsg {
    let mut header = DatabaseHeader::new(db_uuid);
    header.nonce = nonce;
    DatabaseMsg::new(
        header,
        DatabaseMsgKind::Subscribe(SubscribeRequest {
            key: key.to_string(),
        }),
    )
}

pub(crate) fn unsubscribe_msg(db_uuid: &str, key: &str, nonce: u64) -> DatabaseMsg {
    DatabaseMsg::new(
        DatabaseHeader::new(db_uuid),
        DatabaseMsgKind::Unsubscribe(UnsubscribeRequest {
            key: key.to_string(),
            nonce,
        }),
    )
}
