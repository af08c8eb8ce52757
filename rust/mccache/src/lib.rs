//! An in-process, eventually-consistent distributed cache for small clusters
//! on one local network.
//!
//! Each node embeds one [`McCache`] engine.  Application code mutates named
//! caches through typed [`CacheHandle`]s; the engine fragments each mutation
//! over UDP multicast, peers reassemble and apply it under a last-writer-wins
//! rule, and a per-fragment acknowledgement protocol with Fibonacci back-off
//! repairs whatever the network drops.  Convergence, not consensus: identical
//! keys observed on different nodes settle to the value with the greatest
//! timestamp.
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let node = mccache::McCache::from_env()?;
//! node.start().await?;
//! let cache = node.get_cache::<String, String>("sessions");
//! cache.set(&"user:42".to_string(), &"tok_9f31".to_string())?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

mod engine;
mod handle;
mod handler;
mod housekeeper;
mod listener;
mod net;
mod ops_log;
mod sender;
mod tables;

pub use engine::{EngineError, McCache};
pub use handle::CacheHandle;
pub use mccache_cache::{
    CacheError, CacheMetrics, ChangeCallback, ChangeEvent, ChangeKind,
};
pub use mccache_config::{ConfigError, McCacheConfig};
pub use mccache_wire::{Checksum, OpCode};

/// Name used when the application does not pick one.
pub const DEFAULT_NAMESPACE: &str = "mccache";

/// Relative retransmit delays, consumed head first.  Dropped packets come in
/// bursts on a congested segment; spreading the retries Fibonacci-style keeps
/// the repair traffic from piling onto the same burst.
pub(crate) const BACKOFF: [u64; 7] = [0, 1, 2, 3, 5, 8, 13];

/// The base seasoning period: the minimum wait before an outbound fragment is
/// considered lost.
pub(crate) const SEASON: Duration = Duration::from_millis(850);

/// Members silent this long are presumed gone even without a BYE.
pub(crate) const MEMBER_SILENCE: Duration = Duration::from_secs(60);

/// How long shutdown lets the sender drain the farewell traffic.
pub(crate) const SHUTDOWN_FLUSH: Duration = Duration::from_secs(3);
