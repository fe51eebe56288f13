//! # rtils
//!
//! Distributed coordination primitives backed by a shared Redis-compatible
//! key-value store. Independent processes, each holding a connection to the
//! same logical store, coordinate access to named resources without shared
//! memory or leader election of their own:
//!
//! - [`DistributedMutex`] - single-holder lease with auto-refresh
//! - [`DistributedSemaphore`] - fair bounded concurrency, up to N holders
//! - [`Rank`] - dynamic leaderboard packing `(score, snapshot id)` into one
//!   sorted-set score
//!
//! Both lock primitives hand the caller a [`LeaseContext`]: a cancelable
//! token whose cancellation is equivalent to lease loss, whether through
//! explicit unlock, TTL expiry, eviction, or takeover by another client.
//! A background heartbeat task per acquired lease keeps it alive.
//!
//! The primitives are generic over the [`store::Store`] capability trait.
//! [`store::RedisStore`] is the production binding; [`store::DeterministicStore`]
//! is an in-memory implementation for tests and simulation.
//!
//! ## Mutex example
//!
//! ```ignore
//! use rtils::{DistributedMutex, MutexConfig};
//! use rtils::store::RedisStore;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let store = Arc::new(RedisStore::connect("redis://127.0.0.1/").await?);
//! let mutex = DistributedMutex::new(store, "reindex", MutexConfig::default())?;
//!
//! let parent = CancellationToken::new();
//! if let Some(lease) = mutex.lock(&parent).await? {
//!     // Exclusive critical section; watch `lease` for loss.
//!     assert!(lease.is_held());
//!     mutex.unlock().await?;
//! }
//! ```
//!
//! ## Semaphore example
//!
//! ```ignore
//! use rtils::{DistributedSemaphore, SemaphoreConfig};
//!
//! let sema = DistributedSemaphore::new(store, "crawler", 4, SemaphoreConfig::default())?;
//! if let Some(lease) = sema.lock(&parent).await? {
//!     // At most 4 clients run this concurrently.
//!     sema.unlock().await?;
//! }
//! ```

mod error;
mod heartbeat;
mod keys;
mod lease;
mod mutex;
mod rank;
mod semaphore;
pub mod store;

pub use error::Result;
pub use error::SyncError;
pub use keys::KEY_PREFIX;
pub use lease::LeaseContext;
pub use mutex::DistributedMutex;
pub use mutex::MutexConfig;
pub use rank::Rank;
pub use semaphore::DistributedSemaphore;
pub use semaphore::SemaphoreConfig;
