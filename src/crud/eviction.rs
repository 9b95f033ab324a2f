/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Eviction policies: given a database over its byte budget, propose a set of keys whose
//! removal admits the pending write.
//!
//! Policies are read-only on storage. The [CRUD service](super::CrudService) performs the
//! actual deletions, so the TTL side-table is reconciled on its usual path (entries of evicted
//! keys go stale and are reaped by the sweeper).

use std::collections::BTreeSet;

use rand::seq::SliceRandom;

use crate::storage::Storage;
use crate::types::basic::DbKey;

use super::messages::{DatabaseMsg, DatabaseMsgKind};
use super::ttl::generate_expire_key;
use super::TTL_UUID;

/// The closed set of eviction policies a database can be configured with. Stored in the
/// permission record as a numeric code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Never evict; writes into a full database fail with `db_full`.
    None,

    /// Evict uniformly random keys until the pending write fits.
    Random,

    /// Evict only keys that carry a TTL entry, earliest expiry first. Keys without a TTL are
    /// never chosen.
    VolatileTtl,
}

impl EvictionPolicy {
    /// The policy for a stored numeric code, or `None` if the code is unknown.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(EvictionPolicy::None),
            1 => Some(EvictionPolicy::Random),
            2 => Some(EvictionPolicy::VolatileTtl),
            _ => None,
        }
    }

    /// The numeric code this policy is stored as.
    pub fn code(&self) -> u16 {
        match self {
            EvictionPolicy::None => 0,
            EvictionPolicy::Random => 1,
            EvictionPolicy::VolatileTtl => 2,
        }
    }

    /// Propose keys to evict so that the write carried by `request` fits under `max_size`.
    ///
    /// Returns the empty set when this policy cannot free enough space (or when `request` is
    /// not a create/update); the caller then fails the request with `db_full`. The key named
    /// by the pending write itself is never proposed.
    pub fn keys_to_evict(
        &self,
        storage: &dyn Storage,
        request: &DatabaseMsg,
        max_size: u64,
    ) -> BTreeSet<DbKey> {
        let (pending_key, pending_size) = match &request.msg {
            DatabaseMsgKind::Create(create) => {
                (&create.key, (create.key.len() + create.value.len()) as u64)
            }
            DatabaseMsgKind::Update(update) => {
                (&update.key, (update.key.len() + update.value.len()) as u64)
            }
            _ => return BTreeSet::new(),
        };

        let db_uuid = &request.header.db_uuid;
        let (_, current_bytes) = storage.get_size(db_uuid);

        // An update releases the bytes of the pair it replaces.
        let replaced_bytes = match &request.msg {
            DatabaseMsgKind::Update(update) => {
                storage.get_key_size(db_uuid, &update.key).unwrap_or(0)
            }
            _ => 0,
        };

        let projected = current_bytes - replaced_bytes + pending_size;
        let needed = projected.saturating_sub(max_size);
        if needed == 0 {
            return BTreeSet::new();
        }

        let candidates: Vec<DbKey> = match self {
            EvictionPolicy::None => return BTreeSet::new(),
            EvictionPolicy::Random => {
                let mut keys: Vec<DbKey> = storage
                    .get_keys(db_uuid)
                    .into_iter()
                    .filter(|key| key != pending_key)
                    .collect();
                keys.shuffle(&mut rand::thread_rng());
                keys
            }
            EvictionPolicy::VolatileTtl => {
                let mut volatile: Vec<(u64, DbKey)> = storage
                    .get_keys(db_uuid)
                    .into_iter()
                    .filter(|key| key != pending_key)
                    .filter_map(|key| {
                        let entry = storage.read(TTL_UUID, &generate_expire_key(db_uuid, &key))?;
                        let expiry = String::from_utf8(entry).ok()?.parse::<u64>().ok()?;
                        Some((expiry, key))
                    })
                    .collect();
                // Sorting the (expiry, key) pairs yields earliest-expiry order with ties
                // broken lexicographically.
                volatile.sort();
                volatile.into_iter().map(|(_, key)| key).collect()
            }
        };

        let mut to_evict = BTreeSet::new();
        let mut freed = 0u64;

        for key in candidates {
            if freed >= needed {
                break;
            }
            if let Some(size) = storage.get_key_size(db_uuid, &key) {
                freed += size;
                to_evict.insert(key);
            }
        }

        if freed < needed {
            return BTreeSet::new();
        }

        to_evict
    }
}
