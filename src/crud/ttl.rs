/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Encoding of the TTL side-table.
//!
//! Each record with a time-to-live owns one entry in the [`TTL`](super::TTL_UUID) namespace.
//! The entry's key is the styled JSON of `{"uuid": <database>, "key": <record key>}` (this
//! exact form is part of the snapshot format), and its value is the absolute expiry as ASCII
//! decimal seconds since the Unix epoch.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::types::basic::{DbKey, DbUuid};

/// The `(database, key)` pair a TTL entry is about.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
struct ExpireKey {
    uuid: DbUuid,
    key: DbKey,
}

/// Build the TTL-namespace key for `(uuid, key)`.
pub(crate) fn generate_expire_key(uuid: &str, key: &str) -> String {
    let expire_key = ExpireKey {
        uuid: uuid.to_string(),
        key: key.to_string(),
    };
    serde_json::to_string_pretty(&expire_key).unwrap()
}

/// Recover `(uuid, key)` from a TTL-namespace key. Fails only on corrupt entries: the parser
/// accepts exactly what [`generate_expire_key`] produces.
pub(crate) fn extract_uuid_key(generated_key: &str) -> Result<(DbUuid, DbKey), serde_json::Error> {
    let expire_key: ExpireKey = serde_json::from_str(generated_key)?;
    Ok((expire_key.uuid, expire_key.key))
}

/// The current wall-clock time in seconds since the Unix epoch, the timebase every TTL entry
/// is expressed in.
pub(crate) fn secs_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("System clock is set before the Unix Epoch.")
        .as_secs()
}
