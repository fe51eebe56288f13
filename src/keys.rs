//! Key schema for all state kept in the store.
//!
//! Every key lives under [`KEY_PREFIX`]. Deployments should keep the
//! prefix stable across upgrades, or drain all leases before changing it.

/// Root prefix of every key written by this crate.
pub const KEY_PREFIX: &str = "/rtils/";

const KEY_SYNC: &str = "/rtils/sync/";
const KEY_RANK: &str = "/rtils/rank/";

/// String key holding the current mutex owner: `/rtils/sync/mutex/<name>`.
pub(crate) fn mutex_key(name: &str) -> String {
    format!("{KEY_SYNC}mutex/{name}")
}

/// Sorted set mapping client-id to last-heartbeat unix seconds.
pub(crate) fn semaphore_ids_key(name: &str) -> String {
    format!("{KEY_SYNC}sema/{name}/ids/")
}

/// Sorted set mapping client-id to its admission ticket.
pub(crate) fn semaphore_owners_key(name: &str) -> String {
    format!("{KEY_SYNC}sema/{name}/owners/")
}

/// Monotonic integer key, the admission ticket source.
pub(crate) fn semaphore_counter_key(name: &str) -> String {
    format!("{KEY_SYNC}sema/{name}/counter")
}

/// Sorted set holding a rank's packed scores: `/rtils/rank/<name>/data/`.
pub(crate) fn rank_data_key(name: &str) -> String {
    format!("{KEY_RANK}{name}/data/")
}
