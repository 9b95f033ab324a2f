/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](SubscriptionManager) for the subscription registry the CRUD service
//! drives, and an in-process [implementation](SubscriptionService).
//!
//! Clients subscribe to a `(database, key)` pair over their session. Whenever a write to that
//! pair commits, every subscriber receives exactly one update per registered nonce. Stale
//! sessions are harvested lazily: a subscriber whose session has closed is dropped the next
//! time a commit would have notified it.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::crud::messages::{
    DatabaseHeader, DatabaseMsg, DatabaseMsgKind, DatabaseResponse, DatabaseResponseKind,
    SubscriptionOperation, SubscriptionUpdate,
};
use crate::messages::Envelope;
use crate::networking::Session;
use crate::types::basic::{DbKey, DbUuid, DbValue};

/// The interface the CRUD service requires from the subscription registry.
pub trait SubscriptionManager: Send + Sync {
    /// Called once when the CRUD service starts.
    fn start(&self);

    /// Register `session` for updates to `(db_uuid, key)` under `nonce`.
    fn subscribe(
        &self,
        db_uuid: &str,
        key: &str,
        nonce: u64,
        response: &mut DatabaseResponse,
        session: Arc<dyn Session>,
    );

    /// Remove the registration of `session` on `(db_uuid, key)` under `nonce`.
    fn unsubscribe(
        &self,
        db_uuid: &str,
        key: &str,
        nonce: u64,
        response: &mut DatabaseResponse,
        session: Arc<dyn Session>,
    );

    /// Called by the CRUD service for every committed mutation, after storage has been
    /// updated. Notifies the subscribers of the affected key.
    fn inspect_commit(&self, request: &DatabaseMsg);
}

struct Subscriber {
    session: Arc<dyn Session>,
    nonces: BTreeSet<u64>,
}

/// An in-process [`SubscriptionManager`] keyed by session id.
#[derive(Default)]
pub struct SubscriptionService {
    subscriptions: Mutex<HashMap<(DbUuid, DbKey), HashMap<u64, Subscriber>>>,
}

impl SubscriptionService {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, db_uuid: &str, key: &str, value: Option<DbValue>, operation: SubscriptionOperation) {
        let mut subscriptions = self.subscriptions.lock().unwrap();

        let Some(subscribers) = subscriptions.get_mut(&(db_uuid.to_string(), key.to_string()))
        else {
            return;
        };

        subscribers.retain(|session_id, subscriber| {
            if !subscriber.session.is_open() {
                log::debug!("harvesting stale session: {}", session_id);
                return false;
            }

            for nonce in &subscriber.nonces {
                let response = DatabaseResponse {
                    header: DatabaseHeader {
                        db_uuid: db_uuid.to_string(),
                        nonce: *nonce,
                        point_of_contact: String::new(),
                    },
                    response: Some(DatabaseResponseKind::SubscriptionUpdate(
                        SubscriptionUpdate {
                            key: key.to_string(),
                            value: value.clone(),
                            operation,
                        },
                    )),
                    error: None,
                };

                // The session layer stamps the sender and signs before the update hits the
                // wire.
                subscriber
                    .session
                    .send_signed_message(Envelope::database_response("", &response));
            }

            true
        });

        if subscribers.is_empty() {
            subscriptions.remove(&(db_uuid.to_string(), key.to_string()));
        }
    }
}

impl SubscriptionManager for SubscriptionService {
    fn start(&self) {
        log::debug!("subscription manager started");
    }

    fn subscribe(
        &self,
        db_uuid: &str,
        key: &str,
        nonce: u64,
        _response: &mut DatabaseResponse,
        session: Arc<dyn Session>,
    ) {
        let mut subscriptions = self.subscriptions.lock().unwrap();

        let subscriber = subscriptions
            .entry((db_uuid.to_string(), key.to_string()))
            .or_default()
            .entry(session.id())
            .or_insert_with(|| Subscriber {
                session: session.clone(),
                nonces: BTreeSet::new(),
            });

        subscriber.nonces.insert(nonce);

        log::debug!("session {} subscribed to {}:{}", session.id(), db_uuid, key);
    }

    fn unsubscribe(
        &self,
        db_uuid: &str,
        key: &str,
        nonce: u64,
        _response: &mut DatabaseResponse,
        session: Arc<dyn Session>,
    ) {
        let mut subscriptions = self.subscriptions.lock().unwrap();

        let pair = (db_uuid.to_string(), key.to_string());
        let mut removed = false;

        if let Some(subscribers) = subscriptions.get_mut(&pair) {
            if let Some(subscriber) = subscribers.get_mut(&session.id()) {
                removed = subscriber.nonces.remove(&nonce);
                if subscriber.nonces.is_empty() {
                    subscribers.remove(&session.id());
                }
            }
            if subscribers.is_empty() {
                subscriptions.remove(&pair);
            }
        }

        if !removed {
            log::warn!(
                "session {} was not subscribed to {}:{} under nonce {}",
                session.id(),
                db_uuid,
                key,
                nonce
            );
        }
    }

    fn inspect_commit(&self, request: &DatabaseMsg) {
        let db_uuid = &request.header.db_uuid;

        match &request.msg {
            DatabaseMsgKind::Create(create) => self.notify(
                db_uuid,
                &create.key,
                Some(create.value.clone()),
                SubscriptionOperation::Update,
            ),
            DatabaseMsgKind::Update(update) => self.notify(
                db_uuid,
                &update.key,
                Some(update.value.clone()),
                SubscriptionOperation::Update,
            ),
            DatabaseMsgKind::Delete(delete) => {
                self.notify(db_uuid, &delete.key, None, SubscriptionOperation::Delete)
            }
            _ => {}
        }
    }
}
