use std::time::Duration;

use crate::types::basic::CallerId;

/// How often the TTL sweeper reconciles expiry entries with actual storage. Not too
/// aggressive.
pub const TTL_TICK: Duration = Duration::from_secs(5);

/// Configuration of the CRUD service, as produced by the operator's options loader.
#[derive(Clone)]
pub struct CrudConfig {
    /// When set, only this caller may create and delete databases.
    pub owner_public_key: Option<CallerId>,

    /// Interval between TTL sweeps. [`TTL_TICK`] unless the operator overrides it.
    pub ttl_tick: Duration,
}

impl Default for CrudConfig {
    fn default() -> Self {
        Self {
            owner_public_key: None,
            ttl_tick: TTL_TICK,
        }
    }
}
