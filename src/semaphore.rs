//! Distributed fair semaphore: up to N concurrent holders of a named lock.
//!
//! Admission order is fixed by a monotonic ticket counter, so a late
//! arrival can never leap a still-alive earlier one. Liveness is tracked
//! by per-client heartbeat stamps in a sorted set; holders whose stamp
//! ages past the TTL are swept out by the next acquire attempt of any
//! client. The acquire protocol runs as two pipelined exchanges, not one
//! atomic block: a rejected candidate may be visible to others briefly
//! and removes itself before returning.

use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use snafu::OptionExt as _;
use snafu::ResultExt as _;
use snafu::ensure;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::error::CanceledSnafu;
use crate::error::InvalidConfigSnafu;
use crate::error::Result;
use crate::error::StoreSnafu;
use crate::heartbeat;
use crate::heartbeat::Beat;
use crate::heartbeat::Refresher;
use crate::keys;
use crate::lease::LeaseContext;
use crate::store::Store;
use crate::store::StoreCommand;
use crate::store::StoreError;
use crate::store::StoreReply;
use crate::store::UnexpectedReplySnafu;

const DEFAULT_TTL: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_SPIN_INTERVAL: Duration = Duration::from_millis(100);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs()
}

/// Configuration for [`DistributedSemaphore`].
#[derive(Debug, Clone)]
pub struct SemaphoreConfig {
    /// Heartbeat age beyond which a holder counts as dead.
    pub ttl: Duration,
    /// How often the heartbeat refreshes this holder's stamp. Must stay
    /// below `ttl`.
    pub heartbeat_interval: Duration,
    /// Sleep between acquisition attempts when blocking.
    pub spin_interval: Duration,
    /// Whether `lock` spins until admitted or returns `None` immediately.
    pub blocking: bool,
    /// Holder identity. Defaults to a fresh UUID per primitive instance.
    pub client_id: Option<String>,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            spin_interval: DEFAULT_SPIN_INTERVAL,
            blocking: true,
            client_id: None,
        }
    }
}

impl SemaphoreConfig {
    /// Set the liveness TTL.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the spin interval for blocking acquisition.
    pub fn spin_interval(mut self, interval: Duration) -> Self {
        self.spin_interval = interval;
        self
    }

    /// Set whether `lock` blocks until admitted.
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Set an explicit client id instead of a generated one.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// A distributed fair semaphore.
///
/// Up to `limit` clients hold the lock concurrently; among candidates,
/// the ones with the smallest live admission tickets win. Each holder
/// gets a [`LeaseContext`] whose cancellation signals eviction or
/// release.
///
/// # Example
///
/// ```ignore
/// use rtils::{DistributedSemaphore, SemaphoreConfig};
///
/// let sema = DistributedSemaphore::new(store, "crawler", 4, SemaphoreConfig::default())?;
/// if let Some(lease) = sema.lock(&parent).await? {
///     // At most 4 clients run this concurrently.
///     sema.unlock().await?;
/// }
/// ```
pub struct DistributedSemaphore<S: Store + ?Sized> {
    store: Arc<S>,
    ids_key: String,
    owners_key: String,
    counter_key: String,
    client_id: String,
    limit: u64,
    config: SemaphoreConfig,
    held: tokio::sync::Mutex<Option<LeaseContext>>,
}

impl<S: Store + ?Sized + 'static> DistributedSemaphore<S> {
    /// Create a semaphore handle for `name` admitting up to `limit`
    /// concurrent holders.
    pub fn new(store: Arc<S>, name: impl Into<String>, limit: u64, config: SemaphoreConfig) -> Result<Self> {
        let name = name.into();
        ensure!(!name.is_empty(), InvalidConfigSnafu {
            reason: "lock name must not be empty",
        });
        ensure!(limit >= 1, InvalidConfigSnafu {
            reason: "semaphore limit must be at least 1",
        });
        if config.heartbeat_interval >= config.ttl {
            warn!(
                name = %name,
                "heartbeat interval is not below the TTL; holders may be evicted between refreshes"
            );
        }

        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Self {
            store,
            ids_key: keys::semaphore_ids_key(&name),
            owners_key: keys::semaphore_owners_key(&name),
            counter_key: keys::semaphore_counter_key(&name),
            client_id,
            limit,
            config,
            held: tokio::sync::Mutex::new(None),
        })
    }

    /// Acquire a slot.
    ///
    /// Returns `Some(lease)` when admitted, `None` when all slots are
    /// taken and the semaphore is non-blocking. A blocking acquire draws
    /// a fresh ticket every `spin_interval` and aborts with
    /// [`SyncError`](crate::SyncError)`::Canceled` when `parent` fires.
    pub async fn lock(&self, parent: &CancellationToken) -> Result<Option<LeaseContext>> {
        loop {
            if parent.is_cancelled() {
                return CanceledSnafu.fail();
            }

            if self.try_acquire().await? {
                let lease = self.install_lease(parent).await;
                return Ok(Some(lease));
            }

            if !self.config.blocking {
                return Ok(None);
            }
            tokio::select! {
                _ = parent.cancelled() => return CanceledSnafu.fail(),
                _ = tokio::time::sleep(self.config.spin_interval) => {}
            }
        }
    }

    /// Release this holder's slot.
    ///
    /// Removes the client from both membership sets and cancels the lease
    /// context. Calling it twice is harmless; the second removal is a
    /// no-op on the store.
    pub async fn unlock(&self) -> Result<()> {
        self.store
            .tx_pipelined(vec![
                StoreCommand::ZRem {
                    key: self.owners_key.clone(),
                    member: self.client_id.clone(),
                },
                StoreCommand::ZRem {
                    key: self.ids_key.clone(),
                    member: self.client_id.clone(),
                },
            ])
            .await
            .context(StoreSnafu)?;

        if let Some(lease) = self.held.lock().await.take() {
            lease.revoke();
        }
        debug!(key = %self.ids_key, "semaphore slot released");
        Ok(())
    }

    /// Run one round of the admission protocol.
    ///
    /// Round 1 sweeps dead clients and draws a ticket; round 2 publishes
    /// this client's candidacy and learns its rank. A rejected candidate
    /// removes itself before returning.
    async fn try_acquire(&self) -> Result<bool> {
        let now = now_unix_secs() as i64;
        let horizon = (now - self.config.ttl.as_secs() as i64) as f64;

        let sweep = self
            .store
            .pipelined(vec![
                StoreCommand::ZRemRangeByScore {
                    key: self.ids_key.clone(),
                    max: horizon,
                },
                StoreCommand::ZInterStoreMax {
                    dest: self.owners_key.clone(),
                    keys: [self.owners_key.clone(), self.ids_key.clone()],
                    weights: [1.0, 0.0],
                },
                StoreCommand::Incr {
                    key: self.counter_key.clone(),
                },
            ])
            .await
            .context(StoreSnafu)?;
        let ticket = sweep
            .last()
            .and_then(StoreReply::as_int)
            .context(UnexpectedReplySnafu { operation: "INCR" })
            .context(StoreSnafu)?;

        let candidacy = self
            .store
            .pipelined(vec![
                StoreCommand::ZAdd {
                    key: self.owners_key.clone(),
                    member: self.client_id.clone(),
                    score: ticket as f64,
                },
                StoreCommand::ZAdd {
                    key: self.ids_key.clone(),
                    member: self.client_id.clone(),
                    score: now as f64,
                },
                StoreCommand::ZRank {
                    key: self.owners_key.clone(),
                    member: self.client_id.clone(),
                },
            ])
            .await
            .context(StoreSnafu)?;
        let rank = candidacy
            .last()
            .and_then(StoreReply::as_rank)
            .context(UnexpectedReplySnafu { operation: "ZRANK" })
            .context(StoreSnafu)?;

        match rank {
            Some(rank) if rank + 1 <= self.limit => {
                debug!(key = %self.ids_key, ticket, rank, "semaphore slot acquired");
                Ok(true)
            }
            _ => {
                // Over the limit (or concurrently evicted between the two
                // exchanges): withdraw the candidacy.
                self.store
                    .pipelined(vec![
                        StoreCommand::ZRem {
                            key: self.owners_key.clone(),
                            member: self.client_id.clone(),
                        },
                        StoreCommand::ZRem {
                            key: self.ids_key.clone(),
                            member: self.client_id.clone(),
                        },
                    ])
                    .await
                    .context(StoreSnafu)?;
                debug!(key = %self.ids_key, ticket, rank = ?rank, "semaphore full, candidacy withdrawn");
                Ok(false)
            }
        }
    }

    /// Install a fresh lease context and start its heartbeat.
    async fn install_lease(&self, parent: &CancellationToken) -> LeaseContext {
        let lease = LeaseContext::child_of(parent);
        let mut held = self.held.lock().await;
        if let Some(stale) = held.replace(lease.clone()) {
            stale.revoke();
        }
        drop(held);

        heartbeat::spawn(
            SemaphoreRefresher {
                store: self.store.clone(),
                ids_key: self.ids_key.clone(),
                client_id: self.client_id.clone(),
            },
            self.config.heartbeat_interval,
            lease.clone(),
        );
        lease
    }
}

/// Refreshes this holder's heartbeat stamp. Admission order is fixed at
/// acquire time; the stamp only proves liveness.
struct SemaphoreRefresher<S: Store + ?Sized> {
    store: Arc<S>,
    ids_key: String,
    client_id: String,
}

#[async_trait]
impl<S: Store + ?Sized + 'static> Refresher for SemaphoreRefresher<S> {
    fn key(&self) -> &str {
        &self.ids_key
    }

    async fn refresh(&self) -> Result<Beat, StoreError> {
        let refreshed = self
            .store
            .zadd_xx(&self.ids_key, &self.client_id, now_unix_secs() as f64)
            .await?;
        if refreshed {
            Ok(Beat::Renewed)
        } else {
            warn!(key = %self.ids_key, "holder evicted from the semaphore");
            Ok(Beat::Lost)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::store::DeterministicStore;

    fn non_blocking() -> SemaphoreConfig {
        SemaphoreConfig::default().blocking(false)
    }

    #[tokio::test]
    async fn admission_respects_the_limit() {
        let store = DeterministicStore::new();
        let parent = CancellationToken::new();

        let first = DistributedSemaphore::new(store.clone(), "laisky", 2, non_blocking()).unwrap();
        let second = DistributedSemaphore::new(store.clone(), "laisky", 2, non_blocking()).unwrap();
        let third = DistributedSemaphore::new(store.clone(), "laisky", 2, non_blocking()).unwrap();

        assert!(first.lock(&parent).await.unwrap().is_some());
        assert!(second.lock(&parent).await.unwrap().is_some());
        assert!(third.lock(&parent).await.unwrap().is_none());

        second.unlock().await.unwrap();
        assert!(third.lock(&parent).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn tickets_are_assigned_in_arrival_order() {
        let store = DeterministicStore::new();
        let parent = CancellationToken::new();

        let first =
            DistributedSemaphore::new(store.clone(), "laisky", 2, non_blocking().client_id("a")).unwrap();
        let second =
            DistributedSemaphore::new(store.clone(), "laisky", 2, non_blocking().client_id("b")).unwrap();
        let third =
            DistributedSemaphore::new(store.clone(), "laisky", 2, non_blocking().client_id("c")).unwrap();

        assert!(first.lock(&parent).await.unwrap().is_some());
        assert!(second.lock(&parent).await.unwrap().is_some());
        assert!(third.lock(&parent).await.unwrap().is_none());

        let owners = keys::semaphore_owners_key("laisky");
        assert_eq!(store.zscore(&owners, "a").await.unwrap(), Some(1.0));
        assert_eq!(store.zscore(&owners, "b").await.unwrap(), Some(2.0));
        // The rejected candidate withdrew itself from both sets.
        assert_eq!(store.zscore(&owners, "c").await.unwrap(), None);
        assert_eq!(
            store.zscore(&keys::semaphore_ids_key("laisky"), "c").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn blocking_waiter_is_admitted_after_release() {
        let store = DeterministicStore::new();
        let parent = CancellationToken::new();

        let holder = DistributedSemaphore::new(store.clone(), "laisky", 1, non_blocking()).unwrap();
        assert!(holder.lock(&parent).await.unwrap().is_some());

        let waiter = DistributedSemaphore::new(
            store,
            "laisky",
            1,
            SemaphoreConfig::default().spin_interval(Duration::from_millis(10)),
        )
        .unwrap();

        let waiter_parent = parent.clone();
        let attempt = tokio::spawn(async move {
            let lease = waiter.lock(&waiter_parent).await;
            (waiter, lease)
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        holder.unlock().await.unwrap();

        let (waiter, lease) = tokio::time::timeout(Duration::from_secs(5), attempt)
            .await
            .expect("waiter should be admitted after the release")
            .expect("waiter task should not panic");
        assert!(lease.unwrap().is_some());
        waiter.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn dead_holder_is_swept_out() {
        let store = DeterministicStore::new();
        let parent = CancellationToken::new();

        // Heartbeat far above the TTL simulates a crashed holder.
        let crashed = DistributedSemaphore::new(
            store.clone(),
            "laisky",
            1,
            non_blocking()
                .ttl(Duration::from_secs(1))
                .heartbeat_interval(Duration::from_secs(60)),
        )
        .unwrap();
        assert!(crashed.lock(&parent).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(1500)).await;

        let successor = DistributedSemaphore::new(
            store,
            "laisky",
            1,
            non_blocking().ttl(Duration::from_secs(1)),
        )
        .unwrap();
        assert!(successor.lock(&parent).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn heartbeat_keeps_the_holder_live() {
        let store = DeterministicStore::new();
        let parent = CancellationToken::new();

        let holder = DistributedSemaphore::new(
            store.clone(),
            "laisky",
            1,
            non_blocking()
                .ttl(Duration::from_secs(2))
                .heartbeat_interval(Duration::from_millis(200)),
        )
        .unwrap();
        let lease = holder.lock(&parent).await.unwrap().expect("acquire succeeds");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(lease.is_held());

        let contender = DistributedSemaphore::new(
            store,
            "laisky",
            1,
            non_blocking().ttl(Duration::from_secs(2)),
        )
        .unwrap();
        assert!(contender.lock(&parent).await.unwrap().is_none());

        holder.unlock().await.unwrap();
        assert!(!lease.is_held());
    }

    #[tokio::test]
    async fn counter_is_strictly_monotonic_across_attempts() {
        let store = DeterministicStore::new();
        let parent = CancellationToken::new();
        let counter_key = keys::semaphore_counter_key("laisky");

        let read_counter = || {
            let store = store.clone();
            let key = counter_key.clone();
            async move {
                store
                    .get(&key)
                    .await
                    .unwrap()
                    .and_then(|value| value.parse::<i64>().ok())
                    .unwrap_or(0)
            }
        };

        let holder = DistributedSemaphore::new(store.clone(), "laisky", 1, non_blocking()).unwrap();
        let rejected = DistributedSemaphore::new(store.clone(), "laisky", 1, non_blocking()).unwrap();

        let mut last = read_counter().await;
        assert!(holder.lock(&parent).await.unwrap().is_some());
        let after_admit = read_counter().await;
        assert!(after_admit > last);
        last = after_admit;

        // Rejected attempts still consume tickets; the counter never
        // moves backwards.
        for _ in 0..3 {
            assert!(rejected.lock(&parent).await.unwrap().is_none());
            let current = read_counter().await;
            assert!(current > last);
            last = current;
        }
    }

    #[tokio::test]
    async fn unlock_is_idempotent() {
        let store = DeterministicStore::new();
        let parent = CancellationToken::new();

        let sema = DistributedSemaphore::new(store.clone(), "laisky", 1, non_blocking()).unwrap();
        assert!(sema.lock(&parent).await.unwrap().is_some());

        sema.unlock().await.unwrap();
        sema.unlock().await.unwrap();

        let next = DistributedSemaphore::new(store, "laisky", 1, non_blocking()).unwrap();
        assert!(next.lock(&parent).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn blocking_acquire_aborts_on_parent_cancellation() {
        let store = DeterministicStore::new();
        let parent = CancellationToken::new();

        let holder = DistributedSemaphore::new(store.clone(), "laisky", 1, non_blocking()).unwrap();
        assert!(holder.lock(&parent).await.unwrap().is_some());

        let waiter_parent = CancellationToken::new();
        let waiter = DistributedSemaphore::new(
            store,
            "laisky",
            1,
            SemaphoreConfig::default().spin_interval(Duration::from_millis(10)),
        )
        .unwrap();

        let waiter_token = waiter_parent.clone();
        let attempt = tokio::spawn(async move { waiter.lock(&waiter_token).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        waiter_parent.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), attempt)
            .await
            .expect("canceled acquire should return promptly")
            .expect("acquire task should not panic");
        assert!(matches!(result, Err(SyncError::Canceled)));
    }

    #[tokio::test]
    async fn invalid_construction_is_rejected() {
        let store = DeterministicStore::new();

        assert!(matches!(
            DistributedSemaphore::new(store.clone(), "", 2, non_blocking()),
            Err(SyncError::InvalidConfig { .. })
        ));
        assert!(matches!(
            DistributedSemaphore::new(store, "laisky", 0, non_blocking()),
            Err(SyncError::InvalidConfig { .. })
        ));
    }
}
