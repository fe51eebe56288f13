//! Dynamic ranking on a single sorted set.
//!
//! Each member's score and snapshot id are packed into one zset score,
//! `score * max_snapshot_id + snapshot_id`, so the set orders by score
//! while the snapshot id of the latest write stays recoverable.

use std::sync::Arc;

use snafu::ResultExt as _;
use snafu::ensure;
use tracing::debug;

use crate::error::InvalidConfigSnafu;
use crate::error::Result;
use crate::error::StoreSnafu;
use crate::keys;
use crate::store::ScoredMember;
use crate::store::Store;

/// A dynamic leaderboard.
///
/// `max_snapshot_id` bounds the snapshot id space and must be a positive
/// multiple of 10; the effective score resolution shrinks by the same
/// factor.
pub struct Rank<S: Store + ?Sized> {
    store: Arc<S>,
    data_key: String,
    max_snapshot_id: i64,
}

impl<S: Store + ?Sized> Rank<S> {
    /// Create a rank handle for `name`.
    pub fn new(store: Arc<S>, name: impl Into<String>, max_snapshot_id: i64) -> Result<Self> {
        let name = name.into();
        ensure!(!name.is_empty(), InvalidConfigSnafu {
            reason: "rank name must not be empty",
        });
        ensure!(max_snapshot_id > 0, InvalidConfigSnafu {
            reason: "max_snapshot_id must be greater than 0",
        });
        ensure!(max_snapshot_id % 10 == 0, InvalidConfigSnafu {
            reason: "max_snapshot_id must be a multiple of 10",
        });

        Ok(Self {
            store,
            data_key: keys::rank_data_key(&name),
            max_snapshot_id,
        })
    }

    /// Set or update `key`'s score and snapshot id, overwriting any
    /// previous entry.
    pub async fn set(&self, key: &str, score: i64, snapshot_id: i64) -> Result<()> {
        ensure!(!key.is_empty(), InvalidConfigSnafu {
            reason: "rank key must not be empty",
        });
        ensure!(
            (0..self.max_snapshot_id).contains(&snapshot_id),
            InvalidConfigSnafu {
                reason: format!("snapshot id must be within 0..{}", self.max_snapshot_id),
            }
        );

        let packed = score * self.max_snapshot_id + snapshot_id;
        self.store
            .zadd(&self.data_key, key, packed as f64)
            .await
            .context(StoreSnafu)?;
        debug!(key = %self.data_key, member = %key, score, snapshot_id, "rank entry set");
        Ok(())
    }

    /// Delete `key` from the rank. Returns whether it was present.
    pub async fn del(&self, key: &str) -> Result<bool> {
        self.store.zrem(&self.data_key, key).await.context(StoreSnafu)
    }

    /// Top `limit` entries by descending packed score. Callers must not
    /// rely on the ordering of tied entries.
    pub async fn list(&self, limit: u64) -> Result<Vec<ScoredMember>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store
            .zrevrange_withscores(&self.data_key, 0, limit as i64 - 1)
            .await
            .context(StoreSnafu)
    }

    /// The snapshot id of the most recent `set` for `key`, or `None` when
    /// the key is not ranked.
    pub async fn get(&self, key: &str) -> Result<Option<i64>> {
        let packed = self.store.zscore(&self.data_key, key).await.context(StoreSnafu)?;
        Ok(packed.map(|packed| packed as i64 % self.max_snapshot_id))
    }
}
