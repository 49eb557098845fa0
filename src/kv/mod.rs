//! The consistent key/value store abstraction.
//!
//! All coordination state lives in a replicated hierarchical KV. To support
//! different stores we hide them behind the [`KvEngine`] trait; the record
//! layer in [`crate::db`] only ever talks to `dyn KvEngine`.
//!
//! Keys handed to an engine are relative to the store root (for example
//! `volumes/basic/test`); every engine prepends its configured keyspace
//! prefix on the wire and strips it again on the way out.

use core::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::common::error::{VolError, VolResult};

/// The etcd v3 implementation of `KvEngine`.
pub mod etcd_impl;

/// The consul implementation of `KvEngine`.
pub mod consul_impl;

/// The in-memory implementation of `KvEngine`, used by the test suite.
pub mod mem_impl;

/// A raw key/value pair, key relative to the store root.
pub type KvPair = (String, Vec<u8>);

/// One change observed by a watch. `value` is `None` for a deletion.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// Key relative to the store root.
    pub key: String,
    /// The new value, or `None` when the key was deleted.
    pub value: Option<Vec<u8>>,
}

/// Watch delivery channels: decoded events and stream-level errors.
pub type WatchChannels = (mpsc::Receiver<WatchEvent>, mpsc::Receiver<VolError>);

/// Capacity of the per-watch delivery channels.
pub(crate) const WATCH_CHANNEL_CAPACITY: usize = 64;

/// Sleep applied after a watch stream error before retrying, so a broken
/// store cannot spin the loop.
pub(crate) const WATCH_ERROR_THROTTLE: Duration = Duration::from_millis(100);

/// The engine contract over a consistent hierarchical KV.
#[async_trait]
pub trait KvEngine: Send + Sync + Debug {
    /// Read one key. Fails with `NotExists` when absent.
    async fn get(&self, key: &str) -> VolResult<Vec<u8>>;

    /// Write one key unconditionally (last writer wins).
    async fn set(&self, key: &str, value: &[u8]) -> VolResult<()>;

    /// Write one key only if it is absent. Fails with `Exists` when another
    /// actor won the race.
    async fn create(&self, key: &str, value: &[u8]) -> VolResult<()>;

    /// Delete one key. Fails with `NotExists` when absent.
    async fn delete(&self, key: &str) -> VolResult<()>;

    /// Enumerate every key under a prefix. An unknown prefix is an empty
    /// listing, not an error.
    async fn list(&self, prefix: &str) -> VolResult<Vec<KvPair>>;

    /// Create-if-absent with an attached TTL lease. Returns an opaque lease
    /// handle for [`KvEngine::refresh_lease`]. Fails with `Exists` when the
    /// key is already held.
    async fn acquire_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> VolResult<String>;

    /// Re-assert a lease obtained from [`KvEngine::acquire_ttl`].
    async fn refresh_lease(&self, lease: &str, ttl: Duration) -> VolResult<()>;

    /// Delete a key only when its current value matches `expected`. Fails
    /// with `NotExists` when absent and `LockFailed` on a mismatch.
    async fn compare_delete(&self, key: &str, expected: &[u8]) -> VolResult<()>;

    /// Watch a key (or a whole prefix when `recursive`). Events and errors
    /// are delivered on the returned channels until `token` is cancelled.
    /// Stream errors never terminate the watch.
    async fn watch(
        &self,
        key: &str,
        recursive: bool,
        token: CancellationToken,
    ) -> VolResult<WatchChannels>;

    /// Snapshot the entire keyspace under the configured prefix.
    async fn dump(&self) -> VolResult<Vec<KvPair>>;
}

/// Join the configured keyspace prefix onto a relative key.
pub(crate) fn join_prefix(prefix: &str, key: &str) -> String {
    if key.is_empty() {
        format!("/{prefix}")
    } else {
        format!("/{prefix}/{key}")
    }
}

/// Strip the configured keyspace prefix from an absolute key.
pub(crate) fn strip_prefix(prefix: &str, key: &str) -> String {
    key.trim_start_matches('/')
        .strip_prefix(prefix)
        .unwrap_or(key)
        .trim_start_matches('/')
        .to_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_prefix_round_trip() {
        let abs = join_prefix("volplugin", "volumes/basic/test");
        assert_eq!(abs, "/volplugin/volumes/basic/test");
        assert_eq!(strip_prefix("volplugin", &abs), "volumes/basic/test");
    }

    #[test]
    fn test_join_empty_key() {
        assert_eq!(join_prefix("volplugin", ""), "/volplugin");
    }
}
