//! Store capability surface consumed by the coordination primitives.
//!
//! The primitives never talk to a concrete client; they depend on the
//! [`Store`] trait, which narrows the Redis command surface to what the
//! protocols actually use: strings with TTL, sorted sets, pipelined
//! batches, and optimistic `WATCH`-guarded writes.
//!
//! Absent values are typed (`Option::None`, [`GuardedOutcome::Missing`])
//! rather than errors, so every binding maps its own nil sentinel in one
//! place and callers never match on binding-specific error values.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use snafu::Snafu;

pub use self::memory::DeterministicStore;
pub use self::redis::RedisStore;

/// Errors from the store layer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// Network or client failure; never recovered locally.
    #[snafu(display("store transport failure: {message}"))]
    Transport {
        /// Message from the underlying client.
        message: String,
    },

    /// An optimistic transaction was aborted by a concurrent write.
    #[snafu(display("optimistic transaction on `{key}` aborted by a concurrent write"))]
    Contention {
        /// The watched key.
        key: String,
    },

    /// A pipeline answered with the wrong reply shape.
    #[snafu(display("store returned an unexpected reply for {operation}"))]
    UnexpectedReply {
        /// The command whose reply could not be interpreted.
        operation: &'static str,
    },
}

/// A sorted-set member together with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    /// Member value.
    pub member: String,
    /// Raw score as stored.
    pub score: f64,
}

/// One command in a pipelined batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCommand {
    /// `DEL key`.
    Del { key: String },
    /// `PEXPIRE key ttl`.
    Expire { key: String, ttl: Duration },
    /// `INCR key`.
    Incr { key: String },
    /// `ZADD key score member`.
    ZAdd { key: String, member: String, score: f64 },
    /// `ZREM key member`.
    ZRem { key: String, member: String },
    /// `ZRANK key member`.
    ZRank { key: String, member: String },
    /// `ZREMRANGEBYSCORE key -inf max`.
    ZRemRangeByScore { key: String, max: f64 },
    /// `ZINTERSTORE dest 2 k1 k2 WEIGHTS w1 w2 AGGREGATE MAX`.
    ZInterStoreMax {
        dest: String,
        keys: [String; 2],
        weights: [f64; 2],
    },
}

/// Reply to one pipelined command.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreReply {
    /// Integer reply (`INCR`, `ZREMRANGEBYSCORE`, `ZINTERSTORE`).
    Int(i64),
    /// Boolean reply (`DEL`, `EXPIRE`, `ZADD`, `ZREM`).
    Flag(bool),
    /// Rank reply; `None` when the member is absent.
    Rank(Option<u64>),
}

impl StoreReply {
    /// Integer value, if this is an integer reply.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            StoreReply::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Rank value, if this is a rank reply.
    pub fn as_rank(&self) -> Option<Option<u64>> {
        match self {
            StoreReply::Rank(rank) => Some(*rank),
            _ => None,
        }
    }
}

/// Write applied by [`Store::guarded_write`] when the watched value matches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GuardedWrite {
    /// Reset the key's TTL.
    Expire(Duration),
    /// Delete the key.
    Delete,
}

/// Outcome of an optimistic guarded write.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardedOutcome {
    /// The value matched and the write was committed.
    Applied,
    /// The key holds a different value; nothing was written.
    ValueMismatch {
        /// The value actually present.
        actual: String,
    },
    /// The key does not exist; nothing was written.
    Missing,
}

/// Narrow key-value store interface backing the coordination primitives.
///
/// Implementations must provide per-command atomicity and a transactional
/// pipeline variant; the optimistic [`guarded_write`](Store::guarded_write)
/// must abort with [`StoreError::Contention`] when the watched key is
/// modified concurrently.
#[async_trait]
pub trait Store: Send + Sync {
    /// `GET key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// `SET key value [PX ttl]`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// `SET key value PX ttl NX`; `true` when the key was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// `DEL key`; `true` when the key existed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// `ZADD key score member`; `true` when the member was newly added.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError>;

    /// `ZADD key XX score member`; `true` when the member existed and its
    /// score was refreshed, `false` when it is absent (`XX` wrote nothing).
    async fn zadd_xx(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError>;

    /// `ZREM key member`; `true` when the member was removed.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// `ZSCORE key member`.
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;

    /// `ZREVRANGE key start stop WITHSCORES`.
    async fn zrevrange_withscores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<ScoredMember>, StoreError>;

    /// Issue a batch of commands in one exchange. Replies are positional.
    async fn pipelined(&self, commands: Vec<StoreCommand>) -> Result<Vec<StoreReply>, StoreError>;

    /// Issue a batch atomically (`MULTI`/`EXEC`).
    async fn tx_pipelined(&self, commands: Vec<StoreCommand>) -> Result<Vec<StoreReply>, StoreError>;

    /// Optimistically apply `write` to `key` only while it holds `expected`:
    /// `WATCH key` / `GET` / compare / `MULTI` write `EXEC`.
    async fn guarded_write(
        &self,
        key: &str,
        expected: &str,
        write: GuardedWrite,
    ) -> Result<GuardedOutcome, StoreError>;
}
