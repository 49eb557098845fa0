//! The in-memory engine.
//!
//! Single-process stand-in for a real store, with the same create/lease/
//! watch semantics. The whole test suite runs against this engine, the way
//! the mock storage backend stands in for real drivers.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{KvEngine, KvPair, WatchChannels, WatchEvent, WATCH_CHANNEL_CAPACITY};
use crate::common::error::{VolError, VolResult};

/// How often the sweeper retires expired leases.
const SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// One granted lease.
#[derive(Debug)]
struct Lease {
    /// Keys bound to this lease.
    keys: Vec<String>,
    /// Expiry deadline; pushed forward by refresh.
    deadline: Instant,
}

/// Store state behind the mutex.
#[derive(Debug, Default)]
struct Inner {
    /// The keyspace.
    data: BTreeMap<String, Vec<u8>>,
    /// key -> lease id for leased keys.
    key_leases: HashMap<String, u64>,
    /// Granted leases by id.
    leases: HashMap<u64, Lease>,
    /// Next lease id.
    next_lease: u64,
}

impl Inner {
    /// Drop every key owned by an expired lease, returning the deletion
    /// events to publish.
    fn purge(&mut self, now: Instant) -> Vec<WatchEvent> {
        let expired: Vec<u64> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut events = Vec::new();
        for id in expired {
            if let Some(lease) = self.leases.remove(&id) {
                for key in lease.keys {
                    self.key_leases.remove(&key);
                    if self.data.remove(&key).is_some() {
                        events.push(WatchEvent {
                            key,
                            value: None,
                        });
                    }
                }
            }
        }
        events
    }

    /// Remove one key and any lease binding it carries.
    fn remove_key(&mut self, key: &str) -> Option<Vec<u8>> {
        if let Some(lease_id) = self.key_leases.remove(key) {
            if let Some(lease) = self.leases.get_mut(&lease_id) {
                lease.keys.retain(|k| k != key);
                if lease.keys.is_empty() {
                    self.leases.remove(&lease_id);
                }
            }
        }
        self.data.remove(key)
    }
}

/// An in-memory `KvEngine`.
#[derive(Debug, Clone)]
pub struct MemEngine {
    /// Shared state.
    inner: Arc<Mutex<Inner>>,
    /// Change feed for watches.
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemEngine {
    /// Create an empty engine and start its lease sweeper. Must be called
    /// inside a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        let engine = Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        };

        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&engine.inner);
        let events = engine.events.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let Some(inner) = weak.upgrade() else { break };
                let expired = {
                    let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
                    guard.purge(Instant::now())
                };
                for event in expired {
                    let _ = events.send(event);
                }
            }
        });

        engine
    }

    /// Run `f` under the lock after purging expired leases, then publish
    /// any resulting events.
    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> (T, Vec<WatchEvent>)) -> T {
        let (result, events) = {
            let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let mut events = guard.purge(Instant::now());
            let (result, mut more) = f(&mut guard);
            events.append(&mut more);
            (result, events)
        };
        for event in events {
            let _ = self.events.send(event);
        }
        result
    }
}

#[async_trait]
impl KvEngine for MemEngine {
    async fn get(&self, key: &str) -> VolResult<Vec<u8>> {
        self.with_inner(|inner| {
            let result = inner
                .data
                .get(key)
                .cloned()
                .ok_or_else(|| VolError::not_exists(key));
            (result, Vec::new())
        })
    }

    async fn set(&self, key: &str, value: &[u8]) -> VolResult<()> {
        self.with_inner(|inner| {
            inner.data.insert(key.to_owned(), value.to_vec());
            let event = WatchEvent {
                key: key.to_owned(),
                value: Some(value.to_vec()),
            };
            (Ok(()), vec![event])
        })
    }

    async fn create(&self, key: &str, value: &[u8]) -> VolResult<()> {
        self.with_inner(|inner| {
            if inner.data.contains_key(key) {
                return (Err(VolError::exists(key)), Vec::new());
            }
            inner.data.insert(key.to_owned(), value.to_vec());
            let event = WatchEvent {
                key: key.to_owned(),
                value: Some(value.to_vec()),
            };
            (Ok(()), vec![event])
        })
    }

    async fn delete(&self, key: &str) -> VolResult<()> {
        self.with_inner(|inner| {
            if inner.remove_key(key).is_none() {
                return (Err(VolError::not_exists(key)), Vec::new());
            }
            let event = WatchEvent {
                key: key.to_owned(),
                value: None,
            };
            (Ok(()), vec![event])
        })
    }

    async fn list(&self, prefix: &str) -> VolResult<Vec<KvPair>> {
        let scoped = if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}/")
        };
        self.with_inner(|inner| {
            let result = inner
                .data
                .iter()
                .filter(|(k, _)| k.starts_with(&scoped))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            (Ok(result), Vec::new())
        })
    }

    async fn acquire_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> VolResult<String> {
        self.with_inner(|inner| {
            if inner.data.contains_key(key) {
                return (Err(VolError::exists(key)), Vec::new());
            }
            inner.next_lease += 1;
            let lease_id = inner.next_lease;
            inner.data.insert(key.to_owned(), value.to_vec());
            inner.key_leases.insert(key.to_owned(), lease_id);
            inner.leases.insert(
                lease_id,
                Lease {
                    keys: vec![key.to_owned()],
                    deadline: Instant::now() + ttl,
                },
            );
            let event = WatchEvent {
                key: key.to_owned(),
                value: Some(value.to_vec()),
            };
            (Ok(lease_id.to_string()), vec![event])
        })
    }

    async fn refresh_lease(&self, lease: &str, ttl: Duration) -> VolResult<()> {
        let lease_id: u64 = lease
            .parse()
            .map_err(|_ignore| VolError::argument_invalid(format!("bad lease id {lease:?}")))?;
        self.with_inner(|inner| {
            let result = match inner.leases.get_mut(&lease_id) {
                Some(lease) => {
                    lease.deadline = Instant::now() + ttl;
                    Ok(())
                }
                None => Err(VolError::not_exists(format!("lease {lease_id} expired"))),
            };
            (result, Vec::new())
        })
    }

    async fn compare_delete(&self, key: &str, expected: &[u8]) -> VolResult<()> {
        self.with_inner(|inner| {
            match inner.data.get(key) {
                None => return (Err(VolError::not_exists(key)), Vec::new()),
                Some(current) if current != expected => {
                    let err = VolError::lock_failed(format!(
                        "stored value for {key} does not match the expected holder"
                    ));
                    return (Err(err), Vec::new());
                }
                Some(_) => {}
            }
            inner.remove_key(key);
            let event = WatchEvent {
                key: key.to_owned(),
                value: None,
            };
            (Ok(()), vec![event])
        })
    }

    async fn watch(
        &self,
        key: &str,
        recursive: bool,
        token: CancellationToken,
    ) -> VolResult<WatchChannels> {
        let mut feed = self.events.subscribe();
        let (event_tx, event_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);

        let exact = key.to_owned();
        let scoped = format!("{key}/");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    received = feed.recv() => match received {
                        Ok(event) => {
                            let matches = if recursive {
                                event.key.starts_with(&scoped)
                            } else {
                                event.key == exact
                            };
                            if matches && event_tx.send(event).await.is_err() {
                                debug!("mem watch receiver dropped");
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            let err = VolError::invalid_db_content(format!(
                                "watch lagged behind by {skipped} events"
                            ));
                            if err_tx.send(err).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok((event_rx, err_rx))
    }

    async fn dump(&self) -> VolResult<Vec<KvPair>> {
        self.list("").await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_crud() {
        let engine = MemEngine::new();
        assert!(engine.get("a/b").await.unwrap_err().is_not_exists());

        engine.set("a/b", b"one").await.unwrap();
        assert_eq!(engine.get("a/b").await.unwrap(), b"one");

        engine.delete("a/b").await.unwrap();
        assert!(engine.delete("a/b").await.unwrap_err().is_not_exists());
    }

    #[tokio::test]
    async fn test_create_contention() {
        let engine = MemEngine::new();
        engine.create("locks/x", b"me").await.unwrap();
        assert!(engine
            .create("locks/x", b"you")
            .await
            .unwrap_err()
            .is_exists());
        // the loser did not clobber the winner
        assert_eq!(engine.get("locks/x").await.unwrap(), b"me");
    }

    #[tokio::test]
    async fn test_list_does_not_cross_sibling_prefixes() {
        let engine = MemEngine::new();
        engine.set("volumes/a/b", b"1").await.unwrap();
        engine.set("volumes-runtime/a/b", b"2").await.unwrap();

        let listed = engine.list("volumes").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "volumes/a/b");
    }

    #[tokio::test]
    async fn test_lease_expiry() {
        let engine = MemEngine::new();
        let lease = engine
            .acquire_ttl("locks/ttl", b"v", Duration::from_millis(40))
            .await
            .unwrap();
        assert!(engine
            .acquire_ttl("locks/ttl", b"v", Duration::from_millis(40))
            .await
            .unwrap_err()
            .is_exists());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(engine.get("locks/ttl").await.unwrap_err().is_not_exists());
        assert!(engine
            .refresh_lease(&lease, Duration::from_millis(40))
            .await
            .unwrap_err()
            .is_not_exists());
    }

    #[tokio::test]
    async fn test_refresh_extends_lease() {
        let engine = MemEngine::new();
        let lease = engine
            .acquire_ttl("locks/refresh", b"v", Duration::from_millis(80))
            .await
            .unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            engine
                .refresh_lease(&lease, Duration::from_millis(80))
                .await
                .unwrap();
        }
        assert_eq!(engine.get("locks/refresh").await.unwrap(), b"v");
    }

    #[tokio::test]
    async fn test_compare_delete() {
        let engine = MemEngine::new();
        engine.set("locks/cmp", b"holder").await.unwrap();

        let err = engine.compare_delete("locks/cmp", b"other").await;
        assert!(matches!(err, Err(VolError::LockFailed { .. })));

        engine.compare_delete("locks/cmp", b"holder").await.unwrap();
        assert!(engine
            .compare_delete("locks/cmp", b"holder")
            .await
            .unwrap_err()
            .is_not_exists());
    }

    #[tokio::test]
    async fn test_watch_prefix() {
        let engine = MemEngine::new();
        let token = CancellationToken::new();
        let (mut events, _errs) = engine
            .watch("volumes", true, token.clone())
            .await
            .unwrap();

        engine.set("volumes/p/v", b"1").await.unwrap();
        engine.set("volumes-runtime/p/v", b"2").await.unwrap();
        engine.delete("volumes/p/v").await.unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.key, "volumes/p/v");
        assert_eq!(first.value.as_deref(), Some(b"1".as_slice()));

        // the sibling prefix write was filtered; next event is the delete
        let second = events.recv().await.unwrap();
        assert_eq!(second.key, "volumes/p/v");
        assert!(second.value.is_none());

        token.cancel();
    }
}
