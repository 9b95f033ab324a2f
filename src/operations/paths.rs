/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Construction and parsing of the keys operation records are stored under, as laid out in the
//! [module docs](super).

use crate::types::basic::{RequestHash, SequenceNumber, ViewNumber};

pub(super) const PREPREPARE_FIELD: &str = "preprepare";
pub(super) const PREPARE_FIELD: &str = "prepare";
pub(super) const COMMIT_FIELD: &str = "commit";
pub(super) const REQUEST_FIELD: &str = "request";
pub(super) const STAGE_FIELD: &str = "stage";

/// The key prefix shared by every record of the slot `(view, sequence, request_hash)`.
pub(super) fn slot_prefix(
    view: ViewNumber,
    sequence: SequenceNumber,
    request_hash: &RequestHash,
) -> String {
    format!("{}/{}/{}", view, sequence, request_hash)
}

/// The key of a single-valued field (`preprepare`, `request`, `stage`).
pub(super) fn field_key(prefix: &str, field: &str) -> String {
    format!("{}/{}", prefix, field)
}

/// The key of a per-sender vote record (`prepare`, `commit`).
pub(super) fn vote_key(prefix: &str, field: &str, sender: &str) -> String {
    format!("{}/{}/{}", prefix, field, sender)
}

/// The sequence number embedded in any operation record key: its second `/`-separated
/// segment. `None` for keys this module did not produce.
pub(super) fn parse_sequence(key: &str) -> Option<u64> {
    key.split('/').nth(1)?.parse().ok()
}

/// Recover the full slot identity from a stage record key, i.e., a key of the form
/// `<view>/<sequence>/<hash>/stage`. `None` for every other key.
pub(super) fn parse_stage_key(key: &str) -> Option<(ViewNumber, SequenceNumber, RequestHash)> {
    let (view, rest) = key.split_once('/')?;
    let (sequence, rest) = rest.split_once('/')?;
    let hash = rest.strip_suffix(&format!("/{}", STAGE_FIELD))?;

    Some((
        ViewNumber::new(view.parse().ok()?),
        SequenceNumber::new(sequence.parse().ok()?),
        RequestHash::from(hash),
    ))
}
