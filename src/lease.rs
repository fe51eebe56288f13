//! Lease context: the cancelable token handed to a caller at acquire time.
//!
//! Cancellation of the context is equivalent to lease loss. The caller only
//! observes; cancellation authority belongs to whichever of {parent token,
//! unlock, heartbeat runner} fires first, and firing twice is harmless.

use tokio_util::sync::CancellationToken;

/// Observation handle for an acquired lease.
///
/// Produced by `lock()` on the mutex and semaphore primitives. The context
/// is canceled exactly once, when the lease is no longer held by this
/// client: explicit unlock, TTL expiry observed by the heartbeat runner,
/// foreign takeover, or cancellation of the parent token.
///
/// Cloning is shallow; all clones observe the same lease.
#[derive(Debug, Clone)]
pub struct LeaseContext {
    token: CancellationToken,
}

impl LeaseContext {
    /// Create a context as a child of the caller's token, so that parent
    /// cancellation propagates into lease loss.
    pub(crate) fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
        }
    }

    /// Non-blocking liveness probe: `true` while the lease is still held.
    pub fn is_held(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Wait until the lease is lost. Returns immediately if already lost.
    pub async fn lost(&self) {
        self.token.cancelled().await;
    }

    /// Mark the lease as lost. Idempotent.
    pub(crate) fn revoke(&self) {
        self.token.cancel();
    }
}
