//! Heartbeat runner: one background task per acquired lease.
//!
//! The runner periodically re-asserts the lease against the store. It
//! terminates, revoking the lease context, on loss, on any store error,
//! or when the context is canceled elsewhere (unlock, parent).

use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::warn;

use crate::lease::LeaseContext;
use crate::store::StoreError;

/// Outcome of one refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Beat {
    /// The lease is still ours; keep going.
    Renewed,
    /// The lease is gone (expired, evicted, or taken over); stop.
    Lost,
}

/// A primitive-specific refresh action, invoked once per interval.
#[async_trait]
pub(crate) trait Refresher: Send + Sync + 'static {
    /// The store key being kept alive, for log context.
    fn key(&self) -> &str;

    /// Re-assert the lease once.
    async fn refresh(&self) -> Result<Beat, StoreError>;
}

/// Spawn the heartbeat task for `lease`.
///
/// The task ticks every `interval` (skipping missed ticks) until the
/// lease is lost or revoked, then revokes the context so the caller
/// observes the loss.
pub(crate) fn spawn<R: Refresher>(refresher: R, interval: Duration, lease: LeaseContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = lease.lost() => break,
                _ = ticker.tick() => {
                    match refresher.refresh().await {
                        Ok(Beat::Renewed) => {
                            debug!(key = %refresher.key(), "lease renewed");
                        }
                        Ok(Beat::Lost) => break,
                        Err(err) => {
                            warn!(key = %refresher.key(), error = %err, "lease refresh failed");
                            break;
                        }
                    }
                }
            }
        }

        lease.revoke();
        debug!(key = %refresher.key(), "heartbeat stopped");
    })
}
