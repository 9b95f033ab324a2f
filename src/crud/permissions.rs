/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-database permission record: owner, writer list, byte budget, and eviction policy.
//!
//! Records are stored as styled JSON under the [`PERMS`](super::PERMISSION_UUID) namespace,
//! keyed by database uuid. The JSON field names and layout are part of the snapshot format
//! shared with older replicas and must not change.

use serde::{Deserialize, Serialize};

use crate::types::basic::CallerId;

use super::eviction::EvictionPolicy;
use super::messages::CreateDbRequest;

/// The permission record of one database.
///
/// The owner is fixed at creation and never appears in `writers`; writer mutation deduplicates
/// and keeps the list sorted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRecord {
    #[serde(rename = "OWNER")]
    pub owner: CallerId,

    #[serde(rename = "WRITERS")]
    pub writers: Vec<CallerId>,

    #[serde(rename = "MAX_SIZE")]
    pub max_size: u64,

    #[serde(rename = "EVICTION_POLICY")]
    pub eviction_policy: u16,
}

impl PermissionRecord {
    /// The record a fresh `create_db` produces: the (trimmed) caller becomes the owner, the
    /// writer list starts empty.
    pub fn new(caller_id: &str, request: &CreateDbRequest) -> Self {
        Self {
            owner: caller_id.trim().to_string(),
            writers: Vec::new(),
            max_size: request.max_size,
            eviction_policy: request.eviction_policy,
        }
    }

    /// Parse a stored record.
    pub fn from_json(json: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(json)
    }

    /// The styled JSON this record is stored as.
    pub fn to_styled_string(&self) -> String {
        serde_json::to_string_pretty(self).unwrap()
    }

    /// Whether the (trimmed) caller is the owner of this database.
    pub fn is_owner(&self, caller_id: &str) -> bool {
        self.owner == caller_id.trim()
    }

    /// Whether the (trimmed) caller appears in the writer list.
    pub fn has_writer(&self, caller_id: &str) -> bool {
        let caller_id = caller_id.trim();
        self.writers.iter().any(|writer| writer == caller_id)
    }

    /// The database's eviction policy, or `None` if the stored code is not a known policy.
    pub fn policy(&self) -> Option<EvictionPolicy> {
        EvictionPolicy::from_code(self.eviction_policy)
    }

    /// Apply an `update_db`: the size cap and the eviction policy are rewritten, owner and
    /// writers stay untouched.
    pub fn apply_update(&mut self, request: &CreateDbRequest) {
        self.max_size = request.max_size;
        self.eviction_policy = request.eviction_policy;
    }

    /// Add writers, deduplicating. The owner never enters the writer list.
    pub fn add_writers(&mut self, writers: &[CallerId]) {
        let mut current: std::collections::BTreeSet<CallerId> =
            self.writers.drain(..).collect();

        for writer in writers {
            if *writer != self.owner {
                current.insert(writer.clone());
            }
        }

        self.writers = current.into_iter().collect();
    }

    /// Remove writers. Unknown entries are ignored.
    pub fn remove_writers(&mut self, writers: &[CallerId]) {
        let mut current: std::collections::BTreeSet<CallerId> =
            self.writers.drain(..).collect();

        for writer in writers {
            current.remove(writer);
        }

        self.writers = current.into_iter().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> PermissionRecord {
        PermissionRecord::new(
            " alice ",
            &CreateDbRequest {
                max_size: 100,
                eviction_policy: EvictionPolicy::Random.code(),
            },
        )
    }

    #[test]
    fn owner_is_trimmed_and_never_a_writer() {
        let mut perms = record();
        assert_eq!(perms.owner, "alice");
        assert!(perms.is_owner("alice "));

        perms.add_writers(&[
            "bob".to_string(),
            "bob".to_string(),
            "alice".to_string(),
        ]);
        assert_eq!(perms.writers, vec!["bob".to_string()]);
        assert!(perms.has_writer("bob"));
        assert!(!perms.has_writer("alice"));
    }

    #[test]
    fn stored_json_uses_the_wire_field_names() {
        let perms = record();
        let json = perms.to_styled_string();
        for field in ["\"OWNER\"", "\"WRITERS\"", "\"MAX_SIZE\"", "\"EVICTION_POLICY\""] {
            assert!(json.contains(field), "missing {} in {}", field, json);
        }

        assert_eq!(PermissionRecord::from_json(json.as_bytes()).unwrap(), perms);
    }
}
