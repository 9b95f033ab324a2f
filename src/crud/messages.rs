/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Structured messages exchanged between clients and the [CRUD service](super::CrudService):
//! the [request union](DatabaseMsg) and the [response](DatabaseResponse) echoed back for every
//! request.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::{DbKey, DbUuid, DbValue, NodeUuid};

/// Request header carried by every [`DatabaseMsg`] and echoed verbatim into the response.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct DatabaseHeader {
    /// The database this request addresses.
    pub db_uuid: DbUuid,

    /// Client-chosen number correlating responses (and subscription updates) with requests.
    pub nonce: u64,

    /// Uuid of a peer that should receive a copy of the response, for clients not holding a
    /// direct session with the replica that executes the request.
    pub point_of_contact: NodeUuid,
}

impl DatabaseHeader {
    pub fn new(db_uuid: &str) -> Self {
        Self {
            db_uuid: db_uuid.to_string(),
            ..Self::default()
        }
    }
}

/// A client request against a named database.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct DatabaseMsg {
    pub header: DatabaseHeader,
    pub msg: DatabaseMsgKind,
}

impl DatabaseMsg {
    pub fn new(header: DatabaseHeader, msg: DatabaseMsgKind) -> Self {
        Self { header, msg }
    }

    /// Name of the request kind, for logging.
    pub fn msg_name(&self) -> &'static str {
        match &self.msg {
            DatabaseMsgKind::Create(_) => "create",
            DatabaseMsgKind::Read(_) => "read",
            DatabaseMsgKind::Update(_) => "update",
            DatabaseMsgKind::Delete(_) => "delete",
            DatabaseMsgKind::Has(_) => "has",
            DatabaseMsgKind::Keys => "keys",
            DatabaseMsgKind::Size => "size",
            DatabaseMsgKind::Subscribe(_) => "subscribe",
            DatabaseMsgKind::Unsubscribe(_) => "unsubscribe",
            DatabaseMsgKind::CreateDb(_) => "create_db",
            DatabaseMsgKind::UpdateDb(_) => "update_db",
            DatabaseMsgKind::DeleteDb => "delete_db",
            DatabaseMsgKind::HasDb => "has_db",
            DatabaseMsgKind::Writers => "writers",
            DatabaseMsgKind::AddWriters(_) => "add_writers",
            DatabaseMsgKind::RemoveWriters(_) => "remove_writers",
            DatabaseMsgKind::QuickRead(_) => "quick_read",
            DatabaseMsgKind::Ttl(_) => "ttl",
            DatabaseMsgKind::Persist(_) => "persist",
            DatabaseMsgKind::Expire(_) => "expire",
            DatabaseMsgKind::Nullmsg => "nullmsg",
        }
    }

    /// Whether this is a quick read, which bypasses consensus and travels unsigned.
    pub fn is_quick_read(&self) -> bool {
        matches!(self.msg, DatabaseMsgKind::QuickRead(_))
    }
}

/// The 21 request kinds. `Nullmsg` is the gap-filler the PBFT layer commits into sequence slots
/// vacated by a view change; it never reaches storage.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum DatabaseMsgKind {
    Create(CreateRequest),
    Read(ReadRequest),
    Update(UpdateRequest),
    Delete(DeleteRequest),
    Has(HasRequest),
    Keys,
    Size,
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    CreateDb(CreateDbRequest),
    UpdateDb(CreateDbRequest),
    DeleteDb,
    HasDb,
    Writers,
    AddWriters(WritersRequest),
    RemoveWriters(WritersRequest),
    QuickRead(ReadRequest),
    Ttl(TtlRequest),
    Persist(PersistRequest),
    Expire(ExpireRequest),
    Nullmsg,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct CreateRequest {
    pub key: DbKey,
    pub value: DbValue,
    /// Relative time-to-live in seconds; `0` means the record never expires.
    pub expire: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ReadRequest {
    pub key: DbKey,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct UpdateRequest {
    pub key: DbKey,
    pub value: DbValue,
    /// Relative time-to-live in seconds; `0` means the record never expires.
    pub expire: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct DeleteRequest {
    pub key: DbKey,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct HasRequest {
    pub key: DbKey,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SubscribeRequest {
    pub key: DbKey,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct UnsubscribeRequest {
    pub key: DbKey,
    /// The nonce the subscription was registered under.
    pub nonce: u64,
}

/// Payload of both `create_db` and `update_db`: `update_db` rewrites the size cap and the
/// eviction policy, leaving owner and writers untouched.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct CreateDbRequest {
    /// Byte budget of the database; `0` means unlimited (only allowed when the swarm-wide cap
    /// is also unlimited).
    pub max_size: u64,
    /// Numeric code of the [eviction policy](super::eviction::EvictionPolicy).
    pub eviction_policy: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct WritersRequest {
    pub writers: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct TtlRequest {
    pub key: DbKey,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct PersistRequest {
    pub key: DbKey,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ExpireRequest {
    pub key: DbKey,
    /// New relative time-to-live in seconds. `0` is rejected; use `persist` to remove a TTL.
    pub expire: u64,
}

/// Reply to a [`DatabaseMsg`]. The header is the request header echoed back; `error` is set
/// exactly when the request failed (except for quick reads, whose error travels inside the
/// [`QuickReadResponse`] payload).
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct DatabaseResponse {
    pub header: DatabaseHeader,
    pub response: Option<DatabaseResponseKind>,
    pub error: Option<DatabaseError>,
}

impl DatabaseResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kind(kind: DatabaseResponseKind) -> Self {
        Self {
            response: Some(kind),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct DatabaseError {
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum DatabaseResponseKind {
    Read(ReadResponse),
    QuickRead(QuickReadResponse),
    Keys(KeysResponse),
    Size(SizeResponse),
    Has(HasResponse),
    HasDb(HasDbResponse),
    Writers(WritersResponse),
    Ttl(TtlResponse),
    SubscriptionUpdate(SubscriptionUpdate),
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ReadResponse {
    pub key: DbKey,
    pub value: DbValue,
}

/// Unlike every other response kind, a quick read reports failure in its own `error` slot and
/// its envelope is sent unsigned.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct QuickReadResponse {
    pub key: DbKey,
    pub value: DbValue,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct KeysResponse {
    pub keys: Vec<DbKey>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SizeResponse {
    pub keys: u64,
    pub bytes: u64,
    /// Bytes left under the database's cap; only populated when a cap is set.
    pub remaining_bytes: u64,
    /// The database's cap; only populated when a cap is set.
    pub max_size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct HasResponse {
    pub key: DbKey,
    pub has: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct HasDbResponse {
    pub uuid: DbUuid,
    pub has: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct WritersResponse {
    pub owner: String,
    pub writers: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct TtlResponse {
    pub key: DbKey,
    /// Seconds remaining until expiry.
    pub ttl: u64,
}

/// Pushed to a subscriber when a write to the key it watches commits.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SubscriptionUpdate {
    pub key: DbKey,
    /// The committed value; `None` for deletions.
    pub value: Option<DbValue>,
    pub operation: SubscriptionOperation,
}

/// What happened to a subscribed key. Creations are reported as updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum SubscriptionOperation {
    Update,
    Delete,
}
