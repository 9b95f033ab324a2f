/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The CRUD request processor: the replicated state machine that every committed
//! [`DatabaseMsg`] is applied to.
//!
//! A [`CrudService`] sits between the (external) PBFT driver and [storage](crate::storage).
//! The driver feeds it committed requests in a total order that is identical across honest
//! replicas; the service applies them, enforcing the [permission model](permissions), byte
//! quotas, TTL expiry, and [eviction](eviction), and sends a signed response back on the
//! originating session.
//!
//! # Locking
//!
//! A single shared/exclusive lock linearises all state transitions: read handlers take it
//! shared, mutating handlers and the TTL sweeper take it exclusive. Handlers never yield while
//! holding the lock; session and node sends are bounded.
//!
//! # TTL expiry
//!
//! Records with a time-to-live own an entry in the [`TTL`](TTL_UUID) namespace. Reads treat
//! an expired record as pending deletion. The actual
//! deletion is performed by the sweeper, which runs every
//! [`ttl_tick`](crate::config::CrudConfig::ttl_tick) and submits a synthetic `delete` through
//! the PBFT driver, so that the mutation is consensus-ordered like any other; local state
//! never diverges from the swarm.

pub mod eviction;

pub mod messages;

pub mod permissions;

mod ttl;

use std::fmt::{self, Display, Formatter};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use borsh::BorshSerialize;

use crate::config::CrudConfig;
use crate::logging::short_id;
use crate::messages::Envelope;
use crate::networking::{Node, Session};
use crate::pbft::Pbft;
use crate::status::StatusProvider;
use crate::storage::{Storage, StorageResult};
use crate::subscriptions::SubscriptionManager;
use crate::types::basic::{CallerId, DbKey, DbUuid, NodeUuid};

use self::messages::{
    CreateDbRequest, CreateRequest, DatabaseError, DatabaseMsg, DatabaseMsgKind,
    DatabaseResponse, DatabaseResponseKind, DeleteRequest, ExpireRequest, HasResponse,
    HasDbResponse, KeysResponse, PersistRequest, QuickReadResponse, ReadResponse, SizeResponse,
    TtlRequest, TtlResponse, UpdateRequest, WritersRequest, WritersResponse,
};
use self::permissions::PermissionRecord;

/// The reserved storage namespace permission records live in.
pub const PERMISSION_UUID: &str = "PERMS";

/// The reserved storage namespace TTL entries live in.
pub const TTL_UUID: &str = "TTL";

struct StartedState {
    pbft: Arc<dyn Pbft>,
    max_swarm_storage: u64,
}

struct SweeperHandle {
    shutdown: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// The CRUD request processor. Shared as `Arc<CrudService>` between the PBFT driver, the
/// status server, and the TTL sweeper thread it owns.
pub struct CrudService {
    storage: Arc<dyn Storage>,
    subscription_manager: Arc<dyn SubscriptionManager>,
    node: Option<Arc<dyn Node>>,
    owner_public_key: Option<CallerId>,
    ttl_tick: Duration,
    crud_lock: RwLock<()>,
    started: OnceLock<StartedState>,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl CrudService {
    pub fn new(
        storage: Arc<dyn Storage>,
        subscription_manager: Arc<dyn SubscriptionManager>,
        node: Option<Arc<dyn Node>>,
        config: CrudConfig,
    ) -> Self {
        Self {
            storage,
            subscription_manager,
            node,
            owner_public_key: config.owner_public_key.filter(|key| !key.is_empty()),
            ttl_tick: config.ttl_tick,
            crud_lock: RwLock::new(()),
            started: OnceLock::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Wire up the PBFT driver and the swarm-wide storage cap, start the subscription
    /// manager, and start the TTL sweeper. Invoked at most once per instance; later calls are
    /// no-ops.
    pub fn start(self: &Arc<Self>, pbft: Arc<dyn Pbft>, max_swarm_storage: u64) {
        if self
            .started
            .set(StartedState {
                pbft,
                max_swarm_storage,
            })
            .is_err()
        {
            log::warn!("crud service already started");
            return;
        }

        self.subscription_manager.start();

        let weak = Arc::downgrade(self);
        let ttl_tick = self.ttl_tick;
        let (shutdown, shutdown_receiver) = mpsc::channel();

        let thread = thread::spawn(move || loop {
            match shutdown_receiver.recv_timeout(ttl_tick) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {
                    let Some(crud) = weak.upgrade() else { return };
                    if let Err(err) = crud.check_key_expiration() {
                        log::error!("ttl sweep failed: {}", err);
                    }
                }
            }
        });

        *self.sweeper.lock().unwrap() = Some(SweeperHandle { shutdown, thread });
    }

    /// Apply a request that the PBFT driver committed (or, for quick reads, that bypassed
    /// ordering). Runtime failures are reported to the client through the response envelope;
    /// fatal errors terminate the handler and are logged.
    pub fn handle_request(
        &self,
        caller_id: &str,
        request: &DatabaseMsg,
        session: Option<Arc<dyn Session>>,
    ) {
        log::debug!(
            "processing message: {} from {}",
            request.msg_name(),
            short_id(caller_id.as_bytes())
        );

        let result = match &request.msg {
            DatabaseMsgKind::Create(create) => {
                self.handle_create(caller_id, request, create, session)
            }
            DatabaseMsgKind::Read(read) => self.handle_read(request, &read.key, session),
            DatabaseMsgKind::QuickRead(read) => self.handle_read(request, &read.key, session),
            DatabaseMsgKind::Update(update) => {
                self.handle_update(caller_id, request, update, session)
            }
            DatabaseMsgKind::Delete(delete) => {
                self.handle_delete(caller_id, request, delete, session)
            }
            DatabaseMsgKind::Has(has) => self.handle_has(request, &has.key, session),
            DatabaseMsgKind::Keys => self.handle_keys(request, session),
            DatabaseMsgKind::Size => self.handle_size(request, session),
            DatabaseMsgKind::Subscribe(subscribe) => {
                self.handle_subscribe(request, &subscribe.key, session)
            }
            DatabaseMsgKind::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(request, &unsubscribe.key, unsubscribe.nonce, session)
            }
            DatabaseMsgKind::CreateDb(create_db) => {
                self.handle_create_db(caller_id, request, create_db, session)
            }
            DatabaseMsgKind::UpdateDb(update_db) => {
                self.handle_update_db(caller_id, request, update_db, session)
            }
            DatabaseMsgKind::DeleteDb => self.handle_delete_db(caller_id, request, session),
            DatabaseMsgKind::HasDb => self.handle_has_db(request, session),
            DatabaseMsgKind::Writers => self.handle_writers(request, session),
            DatabaseMsgKind::AddWriters(writers) => {
                self.handle_add_writers(caller_id, request, writers, session)
            }
            DatabaseMsgKind::RemoveWriters(writers) => {
                self.handle_remove_writers(caller_id, request, writers, session)
            }
            DatabaseMsgKind::Ttl(ttl_request) => self.handle_ttl(request, ttl_request, session),
            DatabaseMsgKind::Persist(persist) => {
                self.handle_persist(caller_id, request, persist, session)
            }
            DatabaseMsgKind::Expire(expire) => {
                self.handle_expire(caller_id, request, expire, session)
            }
            DatabaseMsgKind::Nullmsg => {
                log::error!("unknown request: {}", request.msg_name());
                Ok(())
            }
        };

        if let Err(err) = result {
            log::error!("failed to process {} request: {}", request.msg_name(), err);
        }
    }

    fn send_response(
        &self,
        request: &DatabaseMsg,
        result: StorageResult,
        mut response: DatabaseResponse,
        session: &Option<Arc<dyn Session>>,
    ) {
        response.header = request.header.clone();

        if result != StorageResult::Ok {
            // special response error case...
            if request.is_quick_read() {
                let mut quick_read = match response.response.take() {
                    Some(DatabaseResponseKind::QuickRead(quick_read)) => quick_read,
                    _ => QuickReadResponse::default(),
                };
                quick_read.error = result.wire_name().to_string();
                response.response = Some(DatabaseResponseKind::QuickRead(quick_read));
            } else {
                response.error = Some(DatabaseError {
                    message: result.wire_name().to_string(),
                });
            }
        }

        let envelope = Envelope::database_response(&self.node_uuid(), &response);

        match session {
            Some(session) => {
                // special response case that does not require signing...
                if request.is_quick_read() {
                    session.send_message(envelope.try_to_vec().unwrap());
                } else {
                    log::trace!("sending response via session");
                    session.send_signed_message(envelope.clone());
                }
            }
            None => log::warn!(
                "session not set - response for the {} operation not sent via session",
                request.msg_name()
            ),
        }

        if !response.header.point_of_contact.is_empty() {
            match &self.node {
                Some(node) => {
                    log::trace!(
                        "sending response via point of contact: {}",
                        response.header.point_of_contact
                    );
                    if let Err(err) =
                        node.send_signed_message(&response.header.point_of_contact, envelope)
                    {
                        log::error!("{}", err);
                    }
                }
                None => log::warn!(
                    "unable to send response for the {} operation to point of contact - node \
                     not set in crud module",
                    request.msg_name()
                ),
            }
        }
    }

    fn handle_create(
        &self,
        caller_id: &str,
        request: &DatabaseMsg,
        create: &CreateRequest,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), CrudError> {
        let mut result = StorageResult::DbNotFound;

        let _lock = self.crud_lock.write().unwrap();

        let db_uuid = &request.header.db_uuid;

        if let Some(perms) = self.get_database_permissions(db_uuid)? {
            if !self.is_caller_a_writer(caller_id, &perms) {
                result = StorageResult::AccessDenied;
            } else {
                // bail on key value pairs that are too large right away!
                if perms.max_size > 0
                    && (create.key.len() + create.value.len()) as u64 > perms.max_size
                {
                    self.send_response(
                        request,
                        StorageResult::ValueTooLarge,
                        DatabaseResponse::new(),
                        &session,
                    );
                    return Ok(());
                }

                if self.expired(db_uuid, &create.key)? {
                    self.send_response(
                        request,
                        StorageResult::DeletePending,
                        DatabaseResponse::new(),
                        &session,
                    );
                    return Ok(());
                }

                if self.operation_exceeds_available_space(request, &perms)? {
                    if !self.do_eviction(request, &perms) {
                        self.send_response(
                            request,
                            StorageResult::DbFull,
                            DatabaseResponse::new(),
                            &session,
                        );
                        return Ok(());
                    }
                }

                result = self.storage.create(db_uuid, &create.key, &create.value);

                if result == StorageResult::Ok {
                    self.update_expiration_entry(
                        &ttl::generate_expire_key(db_uuid, &create.key),
                        create.expire,
                    )?;

                    self.subscription_manager.inspect_commit(request);
                }
            }
        }

        self.send_response(request, result, DatabaseResponse::new(), &session);
        Ok(())
    }

    fn handle_read(
        &self,
        request: &DatabaseMsg,
        key: &str,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), CrudError> {
        let _lock = self.crud_lock.read().unwrap();

        let db_uuid = &request.header.db_uuid;

        if !self.storage.has(PERMISSION_UUID, db_uuid) {
            self.send_response(
                request,
                StorageResult::DbNotFound,
                DatabaseResponse::new(),
                &session,
            );
            return Ok(());
        }

        // expired?
        if self.expired(db_uuid, key)? {
            self.send_response(
                request,
                StorageResult::DeletePending,
                DatabaseResponse::new(),
                &session,
            );
            return Ok(());
        }

        let value = self.storage.read(db_uuid, key);

        let mut response = DatabaseResponse::new();

        if let Some(value) = &value {
            response.response = Some(if request.is_quick_read() {
                DatabaseResponseKind::QuickRead(QuickReadResponse {
                    key: key.to_string(),
                    value: value.clone(),
                    error: String::new(),
                })
            } else {
                DatabaseResponseKind::Read(ReadResponse {
                    key: key.to_string(),
                    value: value.clone(),
                })
            });
        }

        let result = if value.is_some() {
            StorageResult::Ok
        } else {
            StorageResult::NotFound
        };
        self.send_response(request, result, response, &session);
        Ok(())
    }

    fn handle_update(
        &self,
        caller_id: &str,
        request: &DatabaseMsg,
        update: &UpdateRequest,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), CrudError> {
        let mut result = StorageResult::DbNotFound;

        let _lock = self.crud_lock.write().unwrap();

        let db_uuid = &request.header.db_uuid;

        if let Some(perms) = self.get_database_permissions(db_uuid)? {
            if !self.is_caller_a_writer(caller_id, &perms) {
                result = StorageResult::AccessDenied;
            } else {
                // bail on key value pairs that are too large right away!
                if perms.max_size > 0
                    && (update.key.len() + update.value.len()) as u64 > perms.max_size
                {
                    self.send_response(
                        request,
                        StorageResult::ValueTooLarge,
                        DatabaseResponse::new(),
                        &session,
                    );
                    return Ok(());
                }

                // expired?
                if self.expired(db_uuid, &update.key)? {
                    self.send_response(
                        request,
                        StorageResult::DeletePending,
                        DatabaseResponse::new(),
                        &session,
                    );
                    return Ok(());
                }

                if self.operation_exceeds_available_space(request, &perms)? {
                    // let's try evicting some key/value pairs
                    if !self.do_eviction(request, &perms) {
                        self.send_response(
                            request,
                            StorageResult::DbFull,
                            DatabaseResponse::new(),
                            &session,
                        );
                        return Ok(());
                    }
                }

                result = self.storage.update(db_uuid, &update.key, &update.value);

                if result == StorageResult::Ok {
                    self.update_expiration_entry(
                        &ttl::generate_expire_key(db_uuid, &update.key),
                        update.expire,
                    )?;

                    self.subscription_manager.inspect_commit(request);
                }
            }
        }

        self.send_response(request, result, DatabaseResponse::new(), &session);
        Ok(())
    }

    fn handle_delete(
        &self,
        caller_id: &str,
        request: &DatabaseMsg,
        delete: &DeleteRequest,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), CrudError> {
        let mut result = StorageResult::DbNotFound;

        let _lock = self.crud_lock.write().unwrap();

        let db_uuid = &request.header.db_uuid;

        if let Some(perms) = self.get_database_permissions(db_uuid)? {
            if !self.is_caller_a_writer(caller_id, &perms) {
                result = StorageResult::AccessDenied;
            } else {
                result = self.storage.remove(db_uuid, &delete.key);

                if result == StorageResult::Ok {
                    self.subscription_manager.inspect_commit(request);

                    self.remove_expiration_entry(&ttl::generate_expire_key(
                        db_uuid,
                        &delete.key,
                    ));
                }
            }
        }

        self.send_response(request, result, DatabaseResponse::new(), &session);
        Ok(())
    }

    fn handle_ttl(
        &self,
        request: &DatabaseMsg,
        ttl_request: &TtlRequest,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), CrudError> {
        let _lock = self.crud_lock.read().unwrap();

        let db_uuid = &request.header.db_uuid;

        let mut has = self.storage.has(db_uuid, &ttl_request.key);

        // exists and expired?
        if has && self.expired(db_uuid, &ttl_request.key)? {
            self.send_response(
                request,
                StorageResult::DeletePending,
                DatabaseResponse::new(),
                &session,
            );
            return Ok(());
        }

        let mut response = DatabaseResponse::new();

        if has {
            match self.get_ttl(db_uuid, &ttl_request.key)? {
                Some(ttl) => {
                    response.response = Some(DatabaseResponseKind::Ttl(TtlResponse {
                        key: ttl_request.key.clone(),
                        ttl,
                    }));
                }
                None => {
                    // we don't have a ttl value for this key
                    has = false;
                }
            }
        }

        let result = if has {
            StorageResult::Ok
        } else {
            StorageResult::TtlNotFound
        };
        self.send_response(request, result, response, &session);
        Ok(())
    }

    fn handle_persist(
        &self,
        caller_id: &str,
        request: &DatabaseMsg,
        persist: &PersistRequest,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), CrudError> {
        let mut result = StorageResult::DbNotFound;

        let _lock = self.crud_lock.write().unwrap();

        let db_uuid = &request.header.db_uuid;

        if let Some(perms) = self.get_database_permissions(db_uuid)? {
            if !self.is_caller_a_writer(caller_id, &perms) {
                result = StorageResult::AccessDenied;
            } else {
                let generated_key = ttl::generate_expire_key(db_uuid, &persist.key);

                let has = self.storage.has(TTL_UUID, &generated_key);

                // expired?
                if has && self.expired(db_uuid, &persist.key)? {
                    self.send_response(
                        request,
                        StorageResult::DeletePending,
                        DatabaseResponse::new(),
                        &session,
                    );
                    return Ok(());
                }

                if has {
                    self.remove_expiration_entry(&generated_key);
                    result = StorageResult::Ok;
                } else {
                    result = StorageResult::TtlNotFound;
                }
            }
        }

        self.send_response(request, result, DatabaseResponse::new(), &session);
        Ok(())
    }

    fn handle_expire(
        &self,
        caller_id: &str,
        request: &DatabaseMsg,
        expire: &ExpireRequest,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), CrudError> {
        let mut result = StorageResult::DbNotFound;

        let _lock = self.crud_lock.write().unwrap();

        let db_uuid = &request.header.db_uuid;

        if let Some(perms) = self.get_database_permissions(db_uuid)? {
            if !self.is_caller_a_writer(caller_id, &perms) {
                result = StorageResult::AccessDenied;
            } else {
                let generated_key = ttl::generate_expire_key(db_uuid, &expire.key);

                let has = self.storage.has(TTL_UUID, &generated_key);

                // expired?
                if has && self.expired(db_uuid, &expire.key)? {
                    self.send_response(
                        request,
                        StorageResult::DeletePending,
                        DatabaseResponse::new(),
                        &session,
                    );
                    return Ok(());
                }

                // do not allow zero expires...
                if expire.expire == 0 {
                    result = StorageResult::InvalidArgument;
                } else if has {
                    // assume if ttl entry exists so does the db entry...
                    self.remove_expiration_entry(&generated_key);
                    self.update_expiration_entry(&generated_key, expire.expire)?;
                    result = StorageResult::Ok;
                } else if self.storage.has(db_uuid, &expire.key) {
                    self.update_expiration_entry(&generated_key, expire.expire)?;
                    result = StorageResult::Ok;
                } else {
                    result = StorageResult::NotFound;
                }
            }
        }

        self.send_response(request, result, DatabaseResponse::new(), &session);
        Ok(())
    }

    fn handle_has(
        &self,
        request: &DatabaseMsg,
        key: &str,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), CrudError> {
        let mut result = StorageResult::Ok;

        let _lock = self.crud_lock.read().unwrap();

        let db_uuid = &request.header.db_uuid;

        let mut has = false;

        if !self.expired(db_uuid, key)? {
            if self.storage.has(PERMISSION_UUID, db_uuid) {
                has = self.storage.has(db_uuid, key);
            } else {
                result = StorageResult::DbNotFound;
            }
        }

        let response = DatabaseResponse::with_kind(DatabaseResponseKind::Has(HasResponse {
            key: key.to_string(),
            has,
        }));

        self.send_response(request, result, response, &session);
        Ok(())
    }

    fn handle_keys(
        &self,
        request: &DatabaseMsg,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), CrudError> {
        let mut result = StorageResult::Ok;

        let _lock = self.crud_lock.read().unwrap();

        let db_uuid = &request.header.db_uuid;

        let mut response = DatabaseResponse::new();

        if self.storage.has(PERMISSION_UUID, db_uuid) {
            let mut keys: Vec<DbKey> = Vec::new();

            for key in self.storage.get_keys(db_uuid) {
                if !self.expired(db_uuid, &key)? {
                    keys.push(key);
                }
            }

            response.response = Some(DatabaseResponseKind::Keys(KeysResponse { keys }));
        } else {
            result = StorageResult::DbNotFound;
        }

        self.send_response(request, result, response, &session);
        Ok(())
    }

    fn handle_size(
        &self,
        request: &DatabaseMsg,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), CrudError> {
        let _lock = self.crud_lock.read().unwrap();

        let db_uuid = &request.header.db_uuid;

        let Some(perms) = self.get_database_permissions(db_uuid)? else {
            self.send_response(
                request,
                StorageResult::DbNotFound,
                DatabaseResponse::new(),
                &session,
            );
            return Ok(());
        };

        let (keys, bytes) = self.storage.get_size(db_uuid);

        let mut size = SizeResponse {
            keys,
            bytes,
            ..SizeResponse::default()
        };

        if perms.max_size > 0 {
            size.remaining_bytes = perms.max_size.saturating_sub(bytes);
            size.max_size = perms.max_size;
        }

        self.send_response(
            request,
            StorageResult::Ok,
            DatabaseResponse::with_kind(DatabaseResponseKind::Size(size)),
            &session,
        );
        Ok(())
    }

    fn handle_subscribe(
        &self,
        request: &DatabaseMsg,
        key: &str,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), CrudError> {
        let Some(session) = session else {
            // subscription manager will cleanup stale sessions...
            log::warn!("session no longer available. SUBSCRIBE not executed.");
            return Ok(());
        };

        let mut response = DatabaseResponse::new();

        self.subscription_manager.subscribe(
            &request.header.db_uuid,
            key,
            request.header.nonce,
            &mut response,
            session.clone(),
        );

        self.send_response(request, StorageResult::Ok, response, &Some(session));
        Ok(())
    }

    fn handle_unsubscribe(
        &self,
        request: &DatabaseMsg,
        key: &str,
        nonce: u64,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), CrudError> {
        let Some(session) = session else {
            // subscription manager will cleanup stale sessions...
            log::warn!("session no longer available. UNSUBSCRIBE not executed.");
            return Ok(());
        };

        let mut response = DatabaseResponse::new();

        self.subscription_manager.unsubscribe(
            &request.header.db_uuid,
            key,
            nonce,
            &mut response,
            session.clone(),
        );

        self.send_response(request, StorageResult::Ok, response, &Some(session));
        Ok(())
    }

    fn handle_create_db(
        &self,
        caller_id: &str,
        request: &DatabaseMsg,
        create_db: &CreateDbRequest,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), CrudError> {
        let mut result = StorageResult::Ok;

        let _lock = self.crud_lock.write().unwrap();

        let db_uuid = &request.header.db_uuid;

        if matches!(&self.owner_public_key, Some(owner) if owner.as_str() != caller_id) {
            result = StorageResult::AccessDenied;
        } else if self.storage.has(PERMISSION_UUID, db_uuid) {
            result = StorageResult::DbExists;
        } else {
            let perms = PermissionRecord::new(caller_id, create_db);

            // Check max_database_size and if requested database is set to unlimited!
            if create_db.max_size == 0 && self.max_swarm_storage() > 0 {
                log::debug!(
                    "attempting to create a database with no limits (max_swarm_storage = {})",
                    self.max_swarm_storage()
                );
                result = StorageResult::InvalidSize;
            } else if !self.operation_exceeds_available_space(request, &perms)? {
                log::debug!("created db perms: {}", perms.to_styled_string());
                result = self.storage.create(
                    PERMISSION_UUID,
                    db_uuid,
                    perms.to_styled_string().as_bytes(),
                );
            } else {
                result = StorageResult::DbFull;
            }
        }

        self.send_response(request, result, DatabaseResponse::new(), &session);
        Ok(())
    }

    fn handle_update_db(
        &self,
        caller_id: &str,
        request: &DatabaseMsg,
        update_db: &CreateDbRequest,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), CrudError> {
        let mut result = StorageResult::DbNotFound;

        let _lock = self.crud_lock.write().unwrap();

        let db_uuid = &request.header.db_uuid;

        if let Some(mut perms) = self.get_database_permissions(db_uuid)? {
            if !perms.is_owner(caller_id) {
                result = StorageResult::AccessDenied;
            } else if update_db.max_size == 0 && self.max_swarm_storage() > 0 {
                // Check max_database_size and if requested database is set to unlimited!
                log::debug!(
                    "attempting to update a database with no limits (max_swarm_storage = {})",
                    self.max_swarm_storage()
                );
                result = StorageResult::InvalidSize;
            } else {
                // only check if max size has grown...
                if update_db.max_size > perms.max_size {
                    let mut new_perms = perms.clone();
                    new_perms.max_size = update_db.max_size;

                    if self.operation_exceeds_available_space(request, &new_perms)? {
                        self.send_response(
                            request,
                            StorageResult::DbFull,
                            DatabaseResponse::new(),
                            &session,
                        );
                        return Ok(());
                    }
                }

                perms.apply_update(update_db);
                log::debug!("update db perms: {}", perms.to_styled_string());

                result = self.storage.update(
                    PERMISSION_UUID,
                    db_uuid,
                    perms.to_styled_string().as_bytes(),
                );
            }
        }

        self.send_response(request, result, DatabaseResponse::new(), &session);
        Ok(())
    }

    fn handle_delete_db(
        &self,
        caller_id: &str,
        request: &DatabaseMsg,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), CrudError> {
        let mut result = StorageResult::DbNotFound;

        let _lock = self.crud_lock.write().unwrap();

        let db_uuid = &request.header.db_uuid;

        let perms = self.get_database_permissions(db_uuid)?;

        if matches!(&self.owner_public_key, Some(owner) if owner.as_str() != caller_id) {
            result = StorageResult::AccessDenied;
        } else if let Some(perms) = perms {
            if !perms.is_owner(caller_id) {
                result = StorageResult::AccessDenied;
            } else {
                result = self.storage.remove(PERMISSION_UUID, db_uuid);

                self.storage.remove_namespace(db_uuid);

                self.flush_expiration_entries(db_uuid)?;
            }
        }

        self.send_response(request, result, DatabaseResponse::new(), &session);
        Ok(())
    }

    fn handle_has_db(
        &self,
        request: &DatabaseMsg,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), CrudError> {
        let _lock = self.crud_lock.read().unwrap();

        let db_uuid = &request.header.db_uuid;

        let response = DatabaseResponse::with_kind(DatabaseResponseKind::HasDb(HasDbResponse {
            uuid: db_uuid.clone(),
            has: self.storage.has(PERMISSION_UUID, db_uuid),
        }));

        self.send_response(request, StorageResult::Ok, response, &session);
        Ok(())
    }

    fn handle_writers(
        &self,
        request: &DatabaseMsg,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), CrudError> {
        let _lock = self.crud_lock.read().unwrap();

        match self.get_database_permissions(&request.header.db_uuid)? {
            Some(perms) => {
                let response =
                    DatabaseResponse::with_kind(DatabaseResponseKind::Writers(WritersResponse {
                        owner: perms.owner.clone(),
                        writers: perms.writers.clone(),
                    }));
                self.send_response(request, StorageResult::Ok, response, &session);
            }
            None => {
                self.send_response(
                    request,
                    StorageResult::NotFound,
                    DatabaseResponse::new(),
                    &session,
                );
            }
        }

        Ok(())
    }

    fn handle_add_writers(
        &self,
        caller_id: &str,
        request: &DatabaseMsg,
        writers: &WritersRequest,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), CrudError> {
        let mut result = StorageResult::DbNotFound;

        let _lock = self.crud_lock.write().unwrap();

        let db_uuid = &request.header.db_uuid;

        if let Some(mut perms) = self.get_database_permissions(db_uuid)? {
            if !perms.is_owner(caller_id) {
                result = StorageResult::AccessDenied;
            } else {
                perms.add_writers(&writers.writers);

                log::debug!("updating db perms: {}", perms.to_styled_string());

                result = self.storage.update(
                    PERMISSION_UUID,
                    db_uuid,
                    perms.to_styled_string().as_bytes(),
                );
                if result != StorageResult::Ok {
                    return Err(CrudError::PermissionsUpdateFailed {
                        uuid: db_uuid.clone(),
                        result,
                    });
                }
            }
        }

        self.send_response(request, result, DatabaseResponse::new(), &session);
        Ok(())
    }

    fn handle_remove_writers(
        &self,
        caller_id: &str,
        request: &DatabaseMsg,
        writers: &WritersRequest,
        session: Option<Arc<dyn Session>>,
    ) -> Result<(), CrudError> {
        let mut result = StorageResult::DbNotFound;

        let _lock = self.crud_lock.write().unwrap();

        let db_uuid = &request.header.db_uuid;

        if let Some(mut perms) = self.get_database_permissions(db_uuid)? {
            if !perms.is_owner(caller_id) {
                result = StorageResult::AccessDenied;
            } else {
                perms.remove_writers(&writers.writers);

                log::debug!("updating db perms: {}", perms.to_styled_string());

                result = self.storage.update(
                    PERMISSION_UUID,
                    db_uuid,
                    perms.to_styled_string().as_bytes(),
                );
                if result != StorageResult::Ok {
                    return Err(CrudError::PermissionsUpdateFailed {
                        uuid: db_uuid.clone(),
                        result,
                    });
                }
            }
        }

        self.send_response(request, result, DatabaseResponse::new(), &session);
        Ok(())
    }

    /// Materialize a snapshot of the store, for the PBFT checkpoint protocol.
    pub fn save_state(&self) -> bool {
        let _lock = self.crud_lock.write().unwrap();
        self.storage.create_snapshot()
    }

    /// The serialized snapshot created by the last [`save_state`](CrudService::save_state).
    pub fn get_saved_state(&self) -> Option<Vec<u8>> {
        let _lock = self.crud_lock.read().unwrap();
        self.storage.get_snapshot()
    }

    /// Replace the store with a snapshot received from a peer.
    pub fn load_state(&self, state: &[u8]) -> bool {
        let _lock = self.crud_lock.write().unwrap();
        self.storage.load_snapshot(state)
    }

    /// Run one TTL sweep now. The sweeper thread calls this every
    /// [`ttl_tick`](crate::config::CrudConfig::ttl_tick).
    ///
    /// Expired entries are not deleted locally: a synthetic `delete` is submitted through the
    /// PBFT driver so the deletion is consensus-ordered, and the TTL entry goes away when that
    /// delete commits. Entries whose underlying record is already gone are removed locally.
    pub fn check_key_expiration(&self) -> Result<(), CrudError> {
        let Some(state) = self.started.get() else {
            return Ok(());
        };

        let _lock = self.crud_lock.write().unwrap();

        let now = ttl::secs_since_unix_epoch();

        for generated_key in self.storage.get_keys(TTL_UUID) {
            let entry = self.storage.read(TTL_UUID, &generated_key).ok_or_else(|| {
                CrudError::TtlEntryUnreadable {
                    key: generated_key.clone(),
                }
            })?;

            let (uuid, key) = ttl::extract_uuid_key(&generated_key).map_err(|source| {
                CrudError::CorruptTtlKey {
                    key: generated_key.clone(),
                    source,
                }
            })?;

            let expiry = parse_expiry(&entry).ok_or_else(|| CrudError::CorruptTtlEntry {
                key: generated_key.clone(),
            })?;

            // has entry expired?
            if now >= expiry {
                log::debug!("removing expired ttl entry and key for: {}:{}", uuid, key);

                // Issue delete using pbft...
                let request = DatabaseMsg::new(
                    messages::DatabaseHeader::new(&uuid),
                    DatabaseMsgKind::Delete(DeleteRequest { key }),
                );

                state
                    .pbft
                    .handle_database_message(Envelope::database_msg(&state.pbft.get_uuid(), &request), None);
            } else if !self.storage.has(&uuid, &key) {
                // if key no longer exists, then remove the entry...
                log::debug!("removing stale ttl entry for: {}:{}", uuid, key);

                self.storage.remove(TTL_UUID, &generated_key);
            }
        }

        Ok(())
    }

    fn get_database_permissions(
        &self,
        db_uuid: &DbUuid,
    ) -> Result<Option<PermissionRecord>, CrudError> {
        // does the db exist?
        if !self.storage.has(PERMISSION_UUID, db_uuid) {
            return Ok(None);
        }

        let perms_data = self.storage.read(PERMISSION_UUID, db_uuid).ok_or_else(|| {
            CrudError::PermissionsUnreadable {
                uuid: db_uuid.clone(),
            }
        })?;

        let perms = PermissionRecord::from_json(&perms_data).map_err(|source| {
            CrudError::CorruptPermissions {
                uuid: db_uuid.clone(),
                source,
            }
        })?;

        Ok(Some(perms))
    }

    fn is_caller_a_writer(&self, caller_id: &str, perms: &PermissionRecord) -> bool {
        if perms.has_writer(caller_id) {
            return true;
        }

        // A node may be issuing an operation such as delete for key expiration...
        if let Some(state) = self.started.get() {
            let caller_id = caller_id.trim();
            if state
                .pbft
                .peers()
                .current()
                .iter()
                .any(|peer| peer.uuid == caller_id)
            {
                return true;
            }
        }

        perms.is_owner(caller_id)
    }

    fn operation_exceeds_available_space(
        &self,
        request: &DatabaseMsg,
        perms: &PermissionRecord,
    ) -> Result<bool, CrudError> {
        let max_size = perms.max_size;
        let db_uuid = &request.header.db_uuid;

        if matches!(
            request.msg,
            DatabaseMsgKind::CreateDb(_) | DatabaseMsgKind::UpdateDb(_)
        ) {
            let max_swarm_storage = self.max_swarm_storage();
            if max_swarm_storage == 0 {
                log::debug!("max storage zero, ignoring: {}", request.msg_name());
                return Ok(false);
            }

            let usage = self.get_swarm_storage_usage()?;

            return Ok(match request.msg {
                DatabaseMsgKind::CreateDb(_) => usage + max_size > max_swarm_storage,
                _ => {
                    let prev_max_size = self
                        .get_database_permissions(db_uuid)?
                        .map(|prev| prev.max_size)
                        .unwrap_or(0);
                    usage - prev_max_size + max_size > max_swarm_storage
                }
            });
        }

        // any max size set?
        if max_size > 0 {
            let (_, bytes) = self.storage.get_size(db_uuid);

            match &request.msg {
                DatabaseMsgKind::Create(create) => {
                    return Ok(
                        bytes + (create.key.len() + create.value.len()) as u64 > max_size
                    );
                }
                DatabaseMsgKind::Update(update) => {
                    if let Some(prev_kv_size) = self.storage.get_key_size(db_uuid, &update.key)
                    {
                        return Ok(bytes - prev_kv_size
                            + (update.key.len() + update.value.len()) as u64
                            > max_size);
                    }
                }
                _ => {}
            }
        }

        Ok(false)
    }

    fn get_swarm_storage_usage(&self) -> Result<u64, CrudError> {
        let mut usage = 0;

        for db_uuid in self.storage.get_keys(PERMISSION_UUID) {
            if let Some(perms_data) = self.storage.read(PERMISSION_UUID, &db_uuid) {
                let perms = PermissionRecord::from_json(&perms_data).map_err(|source| {
                    CrudError::CorruptPermissions {
                        uuid: db_uuid.clone(),
                        source,
                    }
                })?;

                usage += perms.max_size;
            }
        }

        Ok(usage)
    }

    fn do_eviction(&self, request: &DatabaseMsg, perms: &PermissionRecord) -> bool {
        let Some(policy) = perms.policy() else {
            return false;
        };

        let keys_to_evict = policy.keys_to_evict(&*self.storage, request, perms.max_size);
        if keys_to_evict.is_empty() {
            return false;
        }

        for key in &keys_to_evict {
            self.storage.remove(&request.header.db_uuid, key);
        }

        true
    }

    fn update_expiration_entry(
        &self,
        generated_key: &str,
        expire: u64,
    ) -> Result<(), CrudError> {
        if expire > 0 {
            // now + expire seconds...
            let expires = (ttl::secs_since_unix_epoch() + expire).to_string();

            if self
                .storage
                .create(TTL_UUID, generated_key, expires.as_bytes())
                == StorageResult::Ok
            {
                log::debug!("created ttl entry [{}] for: {}", expires, generated_key);
                return Ok(());
            }

            if self
                .storage
                .update(TTL_UUID, generated_key, expires.as_bytes())
                != StorageResult::Ok
            {
                return Err(CrudError::TtlUpdateFailed {
                    key: generated_key.to_string(),
                });
            }

            return Ok(());
        }

        log::debug!("removing old entry for: {}", generated_key);

        self.remove_expiration_entry(generated_key);
        Ok(())
    }

    fn remove_expiration_entry(&self, generated_key: &str) {
        self.storage.remove(TTL_UUID, generated_key);
    }

    fn expired(&self, db_uuid: &str, key: &str) -> Result<bool, CrudError> {
        let generated_key = ttl::generate_expire_key(db_uuid, key);

        match self.storage.read(TTL_UUID, &generated_key) {
            Some(entry) => {
                let expiry = parse_expiry(&entry).ok_or(CrudError::CorruptTtlEntry {
                    key: generated_key,
                })?;
                Ok(expiry <= ttl::secs_since_unix_epoch())
            }
            None => Ok(false),
        }
    }

    fn get_ttl(&self, db_uuid: &str, key: &str) -> Result<Option<u64>, CrudError> {
        let generated_key = ttl::generate_expire_key(db_uuid, key);

        match self.storage.read(TTL_UUID, &generated_key) {
            Some(entry) => {
                let expiry = parse_expiry(&entry).ok_or(CrudError::CorruptTtlEntry {
                    key: generated_key,
                })?;
                Ok(Some(expiry.saturating_sub(ttl::secs_since_unix_epoch())))
            }
            None => Ok(None),
        }
    }

    fn flush_expiration_entries(&self, db_uuid: &str) -> Result<(), CrudError> {
        for generated_key in self.storage.get_keys(TTL_UUID) {
            let (uuid, key) = ttl::extract_uuid_key(&generated_key).map_err(|source| {
                CrudError::CorruptTtlKey {
                    key: generated_key.clone(),
                    source,
                }
            })?;

            if uuid == db_uuid {
                self.storage.remove(TTL_UUID, &generated_key);

                log::debug!("removing ttl entry for: {}:{}", uuid, key);
            }
        }

        Ok(())
    }

    fn max_swarm_storage(&self) -> u64 {
        self.started
            .get()
            .map(|state| state.max_swarm_storage)
            .unwrap_or(0)
    }

    fn node_uuid(&self) -> NodeUuid {
        self.started
            .get()
            .map(|state| state.pbft.get_uuid())
            .unwrap_or_default()
    }
}

impl Drop for CrudService {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            let _ = handle.shutdown.send(());
            let _ = handle.thread.join();
        }
    }
}

impl StatusProvider for CrudService {
    fn get_name(&self) -> String {
        "crud".to_string()
    }

    fn get_status(&self) -> serde_json::Value {
        let _lock = self.crud_lock.read().unwrap();

        let usage = match self.get_swarm_storage_usage() {
            Ok(usage) => usage,
            Err(err) => {
                log::error!("{}", err);
                0
            }
        };

        serde_json::json!({
            "max_swarm_storage": self.max_swarm_storage(),
            "swarm_storage_usage": usage,
        })
    }
}

/// Parse the ASCII decimal absolute expiry a TTL entry stores.
fn parse_expiry(entry: &[u8]) -> Option<u64> {
    std::str::from_utf8(entry).ok()?.parse().ok()
}

/// Fatal errors of the CRUD layer: corruption of internal records, or storage refusing an
/// update on a path that just succeeded an existence check. These terminate the handler; the
/// affected response is never sent.
#[derive(Debug)]
pub enum CrudError {
    /// A permission record passed the existence check but could not be read back.
    PermissionsUnreadable { uuid: DbUuid },

    /// A permission record exists but is not valid JSON.
    CorruptPermissions {
        uuid: DbUuid,
        source: serde_json::Error,
    },

    /// Storage refused to update a permission record that exists.
    PermissionsUpdateFailed {
        uuid: DbUuid,
        result: StorageResult,
    },

    /// A TTL entry enumerated by a sweep could not be read back.
    TtlEntryUnreadable { key: String },

    /// A TTL entry's key is not the JSON this crate generates.
    CorruptTtlKey {
        key: String,
        source: serde_json::Error,
    },

    /// A TTL entry's value is not an ASCII decimal expiry.
    CorruptTtlEntry { key: String },

    /// Storage refused to write a TTL entry.
    TtlUpdateFailed { key: String },
}

impl Display for CrudError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CrudError::PermissionsUnreadable { uuid } => {
                write!(f, "failed to read database permission data for: {}", uuid)
            }
            CrudError::CorruptPermissions { uuid, source } => {
                write!(
                    f,
                    "failed to parse database json permission data for {}: {}",
                    uuid, source
                )
            }
            CrudError::PermissionsUpdateFailed { uuid, result } => {
                write!(
                    f,
                    "failed to update database permissions for {}: {}",
                    uuid, result
                )
            }
            CrudError::TtlEntryUnreadable { key } => {
                write!(f, "failed to read ttl value for: {}", key)
            }
            CrudError::CorruptTtlKey { key, source } => {
                write!(f, "failed to parse database json ttl data for {}: {}", key, source)
            }
            CrudError::CorruptTtlEntry { key } => {
                write!(f, "failed to parse ttl expiry for: {}", key)
            }
            CrudError::TtlUpdateFailed { key } => {
                write!(f, "failed to update ttl entry for: {}", key)
            }
        }
    }
}
