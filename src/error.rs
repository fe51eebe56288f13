//! Error types for the coordination primitives.
//!
//! Transport and configuration failures surface to the caller. Lease loss
//! (takeover, eviction, expiry) does not: it is reported through the
//! [`LeaseContext`](crate::LeaseContext) handed out at acquire time.

use snafu::Snafu;

use crate::store::StoreError;

/// Result type for coordination operations.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Errors returned by the coordination primitives.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    /// The caller's parent token was canceled while acquiring.
    #[snafu(display("acquire canceled by caller"))]
    Canceled,

    /// The underlying store failed.
    #[snafu(display("store operation failed: {source}"))]
    Store {
        /// Error from the store binding.
        source: StoreError,
    },

    /// Invalid construction arguments.
    #[snafu(display("invalid configuration: {reason}"))]
    InvalidConfig {
        /// What was wrong.
        reason: String,
    },
}
