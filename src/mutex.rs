//! Distributed mutex: a single-holder lease on a named key.
//!
//! Acquisition is `SETNX` with a TTL; a background heartbeat re-asserts
//! the TTL inside an optimistic transaction for as long as the lease is
//! held. Release deletes the key only while it still holds this client's
//! id, so releasing a lock someone else took over is a logged no-op.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
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
use crate::error::SyncError;
use crate::heartbeat;
use crate::heartbeat::Beat;
use crate::heartbeat::Refresher;
use crate::keys;
use crate::lease::LeaseContext;
use crate::store::GuardedOutcome;
use crate::store::GuardedWrite;
use crate::store::Store;
use crate::store::StoreError;

const DEFAULT_TTL: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_SPIN_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for [`DistributedMutex`].
#[derive(Debug, Clone)]
pub struct MutexConfig {
    /// How long the store keeps the lease without a heartbeat.
    pub ttl: Duration,
    /// How often the heartbeat re-asserts the TTL. Must stay below `ttl`;
    /// about a third of it is a good ratio.
    pub heartbeat_interval: Duration,
    /// Sleep between acquisition attempts when blocking.
    pub spin_interval: Duration,
    /// Whether `lock` spins until acquired or returns `None` immediately.
    pub blocking: bool,
    /// Holder identity. Defaults to a fresh UUID per primitive instance;
    /// two holders share a lease only if they share this id.
    pub client_id: Option<String>,
}

impl Default for MutexConfig {
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

impl MutexConfig {
    /// Set the lease TTL.
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

    /// Set whether `lock` blocks until acquired.
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

/// A distributed mutex.
///
/// At most one client id owns the lock key at any store-consistent
/// instant. Acquisition hands out a [`LeaseContext`]; its cancellation is
/// the only signal of lease loss, so holders doing long work should watch
/// it rather than assume the lock outlives them.
///
/// An instance may be reused for acquire/release cycles, but sharing one
/// instance across tasks requires external serialization: each instance
/// tracks a single held lease.
///
/// # Example
///
/// ```ignore
/// use rtils::{DistributedMutex, MutexConfig};
///
/// let mutex = DistributedMutex::new(store, "ingest", MutexConfig::default())?;
/// if let Some(lease) = mutex.lock(&parent).await? {
///     // Critical section; bail out if `lease.is_held()` turns false.
///     mutex.unlock().await?;
/// }
/// ```
pub struct DistributedMutex<S: Store + ?Sized> {
    store: Arc<S>,
    key: String,
    client_id: String,
    config: MutexConfig,
    held: tokio::sync::Mutex<Option<LeaseContext>>,
}

impl<S: Store + ?Sized + 'static> DistributedMutex<S> {
    /// Create a mutex handle for `name`.
    ///
    /// Rejects empty names. The handle owns no store state until `lock`
    /// succeeds.
    pub fn new(store: Arc<S>, name: impl Into<String>, config: MutexConfig) -> Result<Self> {
        let name = name.into();
        ensure!(!name.is_empty(), InvalidConfigSnafu {
            reason: "lock name must not be empty",
        });
        if config.heartbeat_interval >= config.ttl {
            warn!(
                name = %name,
                "heartbeat interval is not below the TTL; the lease may expire between refreshes"
            );
        }

        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Self {
            store,
            key: keys::mutex_key(&name),
            client_id,
            config,
            held: tokio::sync::Mutex::new(None),
        })
    }

    /// Acquire the lock.
    ///
    /// Returns `Some(lease)` once acquired, or `None` when the lock is
    /// held elsewhere and the mutex is non-blocking. A blocking acquire
    /// retries every `spin_interval` and aborts with
    /// [`SyncError::Canceled`] when `parent` fires.
    ///
    /// Acquisition is reentrant by client id: if the key already holds
    /// this client's id, the call succeeds without a second heartbeat.
    pub async fn lock(&self, parent: &CancellationToken) -> Result<Option<LeaseContext>> {
        loop {
            if parent.is_cancelled() {
                return CanceledSnafu.fail();
            }

            let acquired = self
                .store
                .set_nx(&self.key, &self.client_id, self.config.ttl)
                .await
                .context(StoreSnafu)?;
            if acquired {
                debug!(key = %self.key, "lock acquired");
                return Ok(Some(self.install_lease(parent).await));
            }

            match self.store.get(&self.key).await.context(StoreSnafu)? {
                Some(holder) if holder == self.client_id => {
                    // The key already carries our id: a reentrant acquire.
                    let mut held = self.held.lock().await;
                    if let Some(lease) = held.as_ref() {
                        if lease.is_held() {
                            debug!(key = %self.key, "lock already held by this client");
                            return Ok(Some(lease.clone()));
                        }
                    }
                    drop(held);
                    return Ok(Some(self.install_lease(parent).await));
                }
                _ => {
                    if !self.config.blocking {
                        return Ok(None);
                    }
                    tokio::select! {
                        _ = parent.cancelled() => return CanceledSnafu.fail(),
                        _ = tokio::time::sleep(self.config.spin_interval) => {}
                    }
                }
            }
        }
    }

    /// Release the lock.
    ///
    /// Deletes the key only while it still holds this client's id and
    /// cancels the lease context. Releasing a lock that expired or was
    /// taken over is a logged no-op; release never fails for "not mine".
    pub async fn unlock(&self) -> Result<()> {
        match self
            .store
            .guarded_write(&self.key, &self.client_id, GuardedWrite::Delete)
            .await
        {
            Ok(GuardedOutcome::Applied) => {
                if let Some(lease) = self.held.lock().await.take() {
                    lease.revoke();
                }
                debug!(key = %self.key, "lock released");
                Ok(())
            }
            Ok(GuardedOutcome::ValueMismatch { actual }) => {
                warn!(key = %self.key, holder = %actual, "another client holds this lock");
                Ok(())
            }
            Ok(GuardedOutcome::Missing) => {
                warn!(key = %self.key, "lock no longer exists");
                Ok(())
            }
            Err(StoreError::Contention { .. }) => {
                warn!(key = %self.key, "lock changed hands during release");
                Ok(())
            }
            Err(source) => Err(SyncError::Store { source }),
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
            MutexRefresher {
                store: self.store.clone(),
                key: self.key.clone(),
                client_id: self.client_id.clone(),
                ttl: self.config.ttl,
            },
            self.config.heartbeat_interval,
            lease.clone(),
        );
        lease
    }
}

/// Re-asserts the mutex TTL while the key still holds our client id.
struct MutexRefresher<S: Store + ?Sized> {
    store: Arc<S>,
    key: String,
    client_id: String,
    ttl: Duration,
}

#[async_trait]
impl<S: Store + ?Sized + 'static> Refresher for MutexRefresher<S> {
    fn key(&self) -> &str {
        &self.key
    }

    async fn refresh(&self) -> Result<Beat, StoreError> {
        match self
            .store
            .guarded_write(&self.key, &self.client_id, GuardedWrite::Expire(self.ttl))
            .await?
        {
            GuardedOutcome::Applied => Ok(Beat::Renewed),
            GuardedOutcome::ValueMismatch { actual } => {
                warn!(key = %self.key, holder = %actual, "lock taken over by another client");
                Ok(Beat::Lost)
            }
            GuardedOutcome::Missing => {
                warn!(key = %self.key, "lock expired before refresh");
                Ok(Beat::Lost)
            }
        }
    }
}
