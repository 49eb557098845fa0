//! Typed records over the KV store.
//!
//! Every persisted record implements [`Entity`]: it derives its own key,
//! validates itself before writes, and may hook into the set/get cycle
//! (revision history, nested-record loading). [`DbClient`] drives all I/O
//! through these hooks, and the lock protocol
//! ([`execute_with_multi_lock`], [`DbClient::acquire_and_refresh`]) builds
//! mutual exclusion out of create-if-absent keys.

use core::fmt::{Debug, Display};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::common::error::{Context, VolError, VolResult};
use crate::kv::{KvEngine, KvPair, WATCH_CHANNEL_CAPACITY};

pub mod global;
pub mod policy;
pub mod runtime;
pub mod snapshot;
pub mod use_lock;
pub mod volume;

pub use global::Global;
pub use policy::{BackendDrivers, CreateOptions, NamedPolicy, Policy, PolicyRevision};
pub use runtime::{RateLimitConfig, RuntimeOptions, SnapshotConfig};
pub use snapshot::SnapshotSignal;
pub use use_lock::{Use, UseKind};
pub use volume::{NamedVolume, Volume, VolumeRequest};

/// Base path for policies.
pub const ROOT_POLICY: &str = "policies";
/// Base path for policy revision history.
pub const ROOT_POLICY_REVISION: &str = "policyrevisions";
/// Base path for volumes.
pub const ROOT_VOLUME: &str = "volumes";
/// Base path for independently writable runtime options.
pub const ROOT_RUNTIME: &str = "volumes-runtime";
/// Base path for snapshot signals.
pub const ROOT_SNAPSHOTS: &str = "snapshots";
/// Key of the global configuration.
pub const ROOT_GLOBAL: &str = "global";

/// Delay between acquire retries inside the multi-lock helper.
pub const LOCK_RETRY_DELAY: Duration = Duration::from_millis(500);

/// How a record is written to the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetSemantics {
    /// Unconditional write; last writer wins.
    Overwrite,
    /// Compare-and-swap create; `Exists` when another actor won the race.
    CreateIfAbsent,
}

/// A typed record in the store.
#[async_trait]
pub trait Entity:
    Serialize + DeserializeOwned + Clone + Debug + Display + Send + Sync + 'static
{
    /// The constant base path for this kind of record.
    fn prefix(&self) -> String;

    /// The specific key for this record. Fails with `InvalidDbPath` when
    /// identifying fields are empty.
    fn path(&self) -> VolResult<String>;

    /// Populate identifying fields from a key; the inverse of
    /// [`Entity::path`]. Rejects ill-formed keys.
    fn set_key(&mut self, key: &str) -> VolResult<()>;

    /// Pure validation predicate, run before every write.
    fn validate(&self) -> VolResult<()>;

    /// Write mode for this kind.
    fn set_semantics(&self) -> SetSemantics {
        SetSemantics::Overwrite
    }

    /// Hook run before the write (after validation). May itself perform
    /// client calls; must be idempotent under retries.
    async fn pre_set(&mut self, _c: &DbClient) -> VolResult<()> {
        Ok(())
    }

    /// Hook run after a successful write.
    async fn post_set(&self, _c: &DbClient) -> VolResult<()> {
        Ok(())
    }

    /// Hook run after a successful read, including reads performed by list
    /// and watch delivery.
    async fn post_get(&mut self, _c: &DbClient) -> VolResult<()> {
        Ok(())
    }
}

/// Strip an entity's base path (and surrounding slashes) off a key.
pub(crate) fn trim_entity_key<'a>(key: &'a str, prefix: &str) -> &'a str {
    key.trim_start_matches('/')
        .strip_prefix(prefix)
        .unwrap_or(key)
        .trim_matches('/')
}

/// Decode a raw value into an entity and re-derive its identity from the
/// key.
fn decode_entity<E: Entity>(key: &str, value: &[u8]) -> VolResult<E> {
    let mut decoded: E = serde_json::from_slice(value)
        .map_err(|err| VolError::invalid_db_content(format!("failed to decode {key}: {err}")))?;
    decoded.set_key(key)?;
    Ok(decoded)
}

/// A watcher registration, reference-counted by path.
#[derive(Debug)]
struct WatcherEntry {
    /// Live watchers on this path.
    count: usize,
    /// Cancelling this token stops every watcher on the path.
    token: CancellationToken,
}

/// Handle for a TTL-refreshed lock. Dropping it (or calling
/// [`RefreshHandle::stop`]) terminates the refresher; the lease then lapses
/// on its own and the lock key disappears within one TTL.
#[derive(Debug)]
pub struct RefreshHandle {
    /// Cancels the background refresher.
    token: CancellationToken,
}

impl RefreshHandle {
    /// Stop refreshing. The lock evaporates after at most one TTL.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Typed event/error channels handed out by the watch calls. Deletions are
/// filtered out before delivery; callers observe additions and updates.
pub type EntityWatch<E> = (mpsc::Receiver<E>, mpsc::Receiver<VolError>);

/// The record-level client over a [`KvEngine`].
#[derive(Clone, Debug)]
pub struct DbClient {
    /// The store engine.
    kv: Arc<dyn KvEngine>,
    /// Reference-counted watchers by path.
    watchers: Arc<Mutex<HashMap<String, WatcherEntry>>>,
}

impl DbClient {
    /// Wrap an engine.
    #[must_use]
    pub fn new(kv: Arc<dyn KvEngine>) -> Self {
        Self {
            kv,
            watchers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Read a record by its derived path, replacing `obj` with the decoded
    /// value and firing its post-get hook.
    pub async fn get<E: Entity>(&self, obj: &mut E) -> VolResult<()> {
        let path = obj.path()?;
        let value = self.kv.get(&path).await?;
        *obj = decode_entity(&path, &value)?;
        obj.post_get(self).await
    }

    /// Validate and write a record, firing its hooks. Volume records use
    /// create-if-absent semantics and fail with `Exists` when another actor
    /// won the race.
    pub async fn set<E: Entity>(&self, obj: &mut E) -> VolResult<()> {
        obj.validate()?;
        obj.pre_set(self).await?;
        let path = obj.path()?;
        let content = serde_json::to_vec(obj)
            .with_context(|| format!("failed to encode {obj} for {path}"))?;
        match obj.set_semantics() {
            SetSemantics::Overwrite => self.kv.set(&path, &content).await?,
            SetSemantics::CreateIfAbsent => self.kv.create(&path, &content).await?,
        }
        obj.post_set(self).await
    }

    /// Delete a record. Fails with `NotExists` when absent.
    pub async fn delete<E: Entity>(&self, obj: &E) -> VolResult<()> {
        let path = obj.path()?;
        self.kv.delete(&path).await
    }

    /// Enumerate every record of a kind. `tmpl` only supplies the kind; its
    /// fields are ignored. Records that fail to decode are logged and
    /// skipped rather than aborting the listing.
    pub async fn list<E: Entity>(&self, tmpl: &E) -> VolResult<Vec<E>> {
        self.list_at(&tmpl.prefix()).await
    }

    /// Enumerate the records of a kind under one scope (for example, the
    /// volumes of a single policy).
    pub async fn list_prefix<E: Entity>(&self, scope: &str, tmpl: &E) -> VolResult<Vec<E>> {
        if scope.is_empty() {
            return Err(VolError::argument_invalid("list scope was blank"));
        }
        self.list_at(&format!("{}/{scope}", tmpl.prefix())).await
    }

    async fn list_at<E: Entity>(&self, prefix: &str) -> VolResult<Vec<E>> {
        let pairs: Vec<KvPair> = self.kv.list(prefix).await?;
        let mut result = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let mut decoded: E = match decode_entity(&key, &value) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!("skipping {key} during list: {err}");
                    continue;
                }
            };
            if let Err(err) = decoded.post_get(self).await {
                warn!("skipping {key} during list, fetch hook failed: {err}");
                continue;
            }
            result.push(decoded);
        }
        Ok(result)
    }

    /// Acquire a lock: compare-and-swap write of the lock key, no TTL.
    /// Fails with `Exists` on contention.
    pub async fn acquire(&self, lock: &Use) -> VolResult<()> {
        let path = lock.path()?;
        let payload = serde_json::to_vec(lock)
            .with_context(|| format!("failed to encode lock {lock}"))?;
        self.kv.create(&path, &payload).await
    }

    /// Release a lock. With `force` the key is deleted unconditionally;
    /// otherwise the stored payload must match this holder.
    pub async fn free(&self, lock: &Use, force: bool) -> VolResult<()> {
        let path = lock.path()?;
        if force {
            return self.kv.delete(&path).await;
        }
        let payload = serde_json::to_vec(lock)
            .with_context(|| format!("failed to encode lock {lock}"))?;
        self.kv.compare_delete(&path, &payload).await
    }

    /// Acquire a lock with a TTL lease and keep it alive from a background
    /// refresher ticking at a third of the TTL. Fails with `Exists` when
    /// the lock is already held.
    pub async fn acquire_and_refresh(&self, lock: &Use, ttl: Duration) -> VolResult<RefreshHandle> {
        let path = lock.path()?;
        let payload = serde_json::to_vec(lock)
            .with_context(|| format!("failed to encode lock {lock}"))?;
        let lease = self.kv.acquire_ttl(&path, &payload, ttl).await?;

        let token = CancellationToken::new();
        let child = token.clone();
        let kv = Arc::clone(&self.kv);
        let interval = std::cmp::max(ttl / 3, Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = child.cancelled() => {
                        debug!("stopping ttl refresh for {path}");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = kv.refresh_lease(&lease, ttl).await {
                            warn!("failed to refresh lease for {path}: {err}");
                            if err.is_not_exists() {
                                // The lease already lapsed under load;
                                // a recovering actor may re-acquire.
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(RefreshHandle { token })
    }

    /// Watch one record. Returns decoded events and stream errors;
    /// deletions are filtered before delivery.
    pub async fn watch<E: Entity>(&self, tmpl: &E) -> VolResult<EntityWatch<E>> {
        let path = tmpl.path()?;
        self.watch_at(&path, false).await
    }

    /// Watch every record of a kind.
    pub async fn watch_prefix<E: Entity>(&self, tmpl: &E) -> VolResult<EntityWatch<E>> {
        let prefix = tmpl.prefix();
        self.watch_at(&prefix, true).await
    }

    /// Stop the watchers registered on one record's path.
    pub fn watch_stop<E: Entity>(&self, tmpl: &E) -> VolResult<()> {
        let path = tmpl.path()?;
        self.watch_stop_at(&path);
        Ok(())
    }

    /// Stop the watchers registered on a kind's prefix.
    pub fn watch_prefix_stop<E: Entity>(&self, tmpl: &E) {
        self.watch_stop_at(&tmpl.prefix());
    }

    fn watch_stop_at(&self, path: &str) {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = watchers.get_mut(path) {
            entry.count = entry.count.saturating_sub(1);
            if entry.count == 0 {
                entry.token.cancel();
                watchers.remove(path);
            }
        }
    }

    async fn watch_at<E: Entity>(&self, path: &str, recursive: bool) -> VolResult<EntityWatch<E>> {
        let token = {
            let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
            let entry = watchers
                .entry(path.to_owned())
                .or_insert_with(|| WatcherEntry {
                    count: 0,
                    token: CancellationToken::new(),
                });
            entry.count += 1;
            entry.token.child_token()
        };

        let (mut raw_events, mut raw_errs) = match self.kv.watch(path, recursive, token).await {
            Ok(channels) => channels,
            Err(err) => {
                self.watch_stop_at(path);
                return Err(err);
            }
        };
        let (event_tx, event_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);

        let forward_errs = err_tx.clone();
        tokio::spawn(async move {
            while let Some(err) = raw_errs.recv().await {
                if forward_errs.send(err).await.is_err() {
                    break;
                }
            }
        });

        let client = self.clone();
        tokio::spawn(async move {
            while let Some(event) = raw_events.recv().await {
                // Tombstones are filtered; callers observe additions and
                // updates only.
                let Some(value) = event.value else { continue };
                let mut decoded: E = match decode_entity(&event.key, &value) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        if err_tx.send(err).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };
                if let Err(err) = decoded.post_get(&client).await {
                    if err_tx.send(err).await.is_err() {
                        break;
                    }
                    continue;
                }
                if event_tx.send(decoded).await.is_err() {
                    break;
                }
            }
        });

        Ok((event_rx, err_rx))
    }

    /// Snapshot the entire keyspace; used by the operator dump signal.
    pub async fn dump(&self) -> VolResult<Vec<KvPair>> {
        self.kv.dump().await
    }
}

/// Acquire several locks in the given order and run `body`, then free the
/// locks. Each acquisition retries on `Exists` every 500 ms until `timeout`
/// of wall time has passed; a final failure frees whatever was already
/// acquired. The body runs at most once; lock frees are best-effort and
/// only logged.
///
/// Callers must pass locks in canonical order (volume lock first, snapshot
/// lock second); the protocol itself does not detect cycles.
pub async fn execute_with_multi_lock<T, F, Fut>(
    client: &DbClient,
    locks: &[Use],
    timeout: Duration,
    body: F,
) -> VolResult<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = VolResult<T>>,
{
    let mut acquired: Vec<&Use> = Vec::new();

    for lock in locks {
        let before = Instant::now();
        loop {
            match client.acquire(lock).await {
                Ok(()) => {
                    acquired.push(lock);
                    break;
                }
                Err(err) if err.is_exists() && before.elapsed() < timeout => {
                    // This will happen a lot under contention.
                    debug!("could not acquire {lock}, retrying: {err}");
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(err) => {
                    debug!("could not acquire {lock}: {err}");
                    for held in &acquired {
                        if let Err(free_err) = client.free(held, false).await {
                            error!("could not free lock {held}: {free_err}");
                        }
                    }
                    return Err(err);
                }
            }
        }
    }

    let result = body().await;

    for held in &acquired {
        if let Err(err) = client.free(held, false).await {
            error!("could not free lock {held}: {err}");
        }
    }

    result
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kv::mem_impl::MemEngine;

    fn client() -> DbClient {
        DbClient::new(Arc::new(MemEngine::new()))
    }

    fn test_policy(name: &str) -> Policy {
        let mut policy = Policy::new(name);
        policy.backend = "mock".to_owned();
        policy.create_options.size = "10MB".to_owned();
        policy.driver_options.insert("pool".to_owned(), "rbd".to_owned());
        policy
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let c = client();
        let mut policy = test_policy("basic");
        c.set(&mut policy).await.unwrap();

        let mut fetched = Policy::new("basic");
        c.get(&mut fetched).await.unwrap();
        assert_eq!(fetched, policy);
    }

    #[tokio::test]
    async fn test_policy_revisions_strictly_increase() {
        let c = client();
        let mut policy = test_policy("basic");
        for _ in 0..3 {
            c.set(&mut policy).await.unwrap();
        }

        let revisions = c
            .list_prefix("basic", &PolicyRevision::default())
            .await
            .unwrap();
        assert_eq!(revisions.len(), 3);
        let mut stamps: Vec<u64> = revisions
            .iter()
            .map(|r| r.revision().parse().unwrap())
            .collect();
        stamps.sort_unstable();
        for window in stamps.windows(2) {
            assert!(window[0] < window[1], "revisions must strictly increase");
        }
    }

    #[tokio::test]
    async fn test_volume_create_if_absent() {
        let c = client();
        let mut policy = test_policy("basic");
        c.set(&mut policy).await.unwrap();

        let mut vol = volume::create(&policy, "test", &HashMap::new()).unwrap();
        c.set(&mut vol).await.unwrap();

        let mut dup = volume::create(&policy, "test", &HashMap::new()).unwrap();
        assert!(c.set(&mut dup).await.unwrap_err().is_exists());

        // the volume's runtime options were published alongside it
        let mut runtime = RuntimeOptions::new("basic", "test");
        c.get(&mut runtime).await.unwrap();
        assert_eq!(&runtime, vol.runtime_options());
    }

    #[tokio::test]
    async fn test_parallel_create_single_winner() {
        let c = client();
        let mut policy = test_policy("basic");
        c.set(&mut policy).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..15 {
            let c = c.clone();
            let policy = policy.clone();
            handles.push(tokio::spawn(async move {
                let mut vol = volume::create(&policy, "contended", &HashMap::new()).unwrap();
                c.set(&mut vol).await
            }));
        }

        let mut wins = 0;
        let mut losses = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => wins += 1,
                Err(err) => {
                    assert!(err.is_exists());
                    losses += 1;
                }
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(losses, 14);
    }

    #[tokio::test]
    async fn test_list_skips_undecodable_records() {
        let c = client();
        let mut policy = test_policy("good");
        c.set(&mut policy).await.unwrap();
        c.kv.set("policies/broken", b"{ not json").await.unwrap();

        let listed = c.list(&Policy::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name(), "good");
    }

    #[tokio::test]
    async fn test_watch_prefix_filters_deletes() {
        let c = client();
        let mut policy = test_policy("basic");
        c.set(&mut policy).await.unwrap();

        let (mut events, _errs) = c.watch_prefix(&Volume::default()).await.unwrap();

        let mut vol = volume::create(&policy, "watched", &HashMap::new()).unwrap();
        c.set(&mut vol).await.unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.name(), "basic/watched");

        c.delete(&vol).await.unwrap();
        // the delete is a tombstone and never reaches the caller
        let nothing = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
        assert!(nothing.is_err(), "received an event for a deletion");
    }

    #[tokio::test]
    async fn test_multi_lock_single_winner_and_release() {
        let c = client();
        let vol = Volume::new("basic", "locked");
        let locks = vec![
            Use::create_owner("host1", &vol),
            Use::snapshot_create(&vol),
        ];

        let mut handles = Vec::new();
        for _ in 0..15 {
            let c = c.clone();
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                execute_with_multi_lock(&c, &locks, Duration::ZERO, || async { Ok(()) }).await
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        // timeout zero means losers surface immediately; winners free their
        // locks afterwards, so several non-overlapping attempts may win.
        assert!(wins >= 1);

        // all locks were released
        c.acquire(&locks[0]).await.unwrap();
        c.acquire(&locks[1]).await.unwrap();
    }

    #[tokio::test]
    async fn test_multi_lock_rolls_back_on_partial_failure() {
        let c = client();
        let vol = Volume::new("basic", "partial");
        let blocker = Use::snapshot_create(&vol);
        c.acquire(&blocker).await.unwrap();

        let locks = vec![
            Use::create_owner("host1", &vol),
            Use::snapshot_create(&vol),
        ];
        let err = execute_with_multi_lock(&c, &locks, Duration::ZERO, || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.is_exists());

        // the first lock was rolled back when the second failed
        c.acquire(&locks[0]).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_and_refresh_expires_after_stop() {
        let c = client();
        let vol = Volume::new("basic", "leased");
        let lock = Use::mount_owner("host1", &vol);

        let handle = c
            .acquire_and_refresh(&lock, Duration::from_millis(80))
            .await
            .unwrap();
        assert!(c
            .acquire_and_refresh(&lock, Duration::from_millis(80))
            .await
            .unwrap_err()
            .is_exists());

        // the refresher holds the lock across several TTLs
        tokio::time::sleep(Duration::from_millis(240)).await;
        assert!(c.acquire(&lock).await.unwrap_err().is_exists());

        handle.stop();
        tokio::time::sleep(Duration::from_millis(240)).await;
        c.acquire(&lock).await.unwrap();
    }
}
