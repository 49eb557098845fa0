//! The snapshot scheduler.
//!
//! A cluster singleton guarded by the supervisor lock: tracks volumes in
//! memory, takes snapshots on each volume's cadence, prunes old ones, and
//! answers ad-hoc snapshot signals written by the apiserver.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::api::{self, current_global, shared_global, SharedGlobal};
use crate::common::error::{VolError, VolResult};
use crate::common::{logger, signals};
use crate::config::SupervisorConfig;
use crate::db::{DbClient, Global, RefreshHandle, SnapshotSignal, Use, Volume};
use crate::storage::{self, backend};

/// The scheduler daemon.
#[derive(Debug)]
pub struct Daemon {
    /// The record client.
    pub client: DbClient,
    /// The shared global configuration.
    pub global: SharedGlobal,
    /// This host's label; the owner of the singleton lock.
    pub hostname: String,
    /// The in-memory volume map, refreshed with jitter.
    volumes: Mutex<HashMap<String, Volume>>,
    /// Volumes with a snapshot action currently in flight.
    inflight: Mutex<HashSet<String>>,
}

impl Daemon {
    /// Assemble the daemon.
    #[must_use]
    pub fn new(client: DbClient, hostname: &str, global: Global) -> Arc<Self> {
        Arc::new(Self {
            client,
            global: shared_global(global),
            hostname: hostname.to_owned(),
            volumes: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashSet::new()),
        })
    }

    /// Build the daemon from its configuration. The global configuration
    /// must exist before the supervisor starts; retry until it does.
    pub async fn from_config(config: &SupervisorConfig) -> VolResult<Arc<Self>> {
        let client = crate::apiserver::connect_with_retry(&config.store).await;
        let global = loop {
            let mut global = Global::new();
            match client.get(&mut global).await {
                Ok(()) => break global,
                Err(err) => {
                    error!("could not retrieve global configuration: {err}. Retrying in 1 second");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };
        Ok(Self::new(client, &config.store.hostname(), global))
    }

    /// The current global configuration.
    #[must_use]
    pub fn global(&self) -> Arc<Global> {
        current_global(&self.global)
    }

    /// Take the cluster-singleton lock. Failing this means another
    /// supervisor is alive and this process must abort.
    pub async fn acquire_singleton(&self) -> VolResult<RefreshHandle> {
        let lock = Use::volsupervisor(&self.hostname);
        self.client
            .acquire_and_refresh(&lock, self.global().ttl_duration())
            .await
    }

    /// Run the scheduler until SIGTERM/SIGINT.
    pub async fn run(self: Arc<Self>) -> VolResult<()> {
        logger::set_debug(self.global().debug);
        api::spawn_global_watch(self.client.clone(), Arc::clone(&self.global)).await;
        signals::spawn_debug_signal();
        signals::spawn_dump_signal(self.client.clone());

        let handle = self.acquire_singleton().await.map_err(|err| {
            err.add_context("could not start the supervisor: failed to acquire lock")
        })?;

        Arc::clone(&self).spawn_signal_watch();
        self.update_volumes().await;

        let refresher = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                let jitter = rand::thread_rng().gen_range(0..250);
                tokio::time::sleep(Duration::from_millis(1000 + jitter)).await;
                refresher.update_volumes().await;
            }
        });

        let looper = Arc::clone(&self);
        tokio::select! {
            () = signals::wait_for_term() => {
                info!(
                    "removing supervisor lock; waiting {:?} for the lease to clear",
                    self.global().ttl_duration()
                );
                handle.stop();
            }
            () = looper.schedule_loop() => {}
        }
        Ok(())
    }

    /// Replace the in-memory volume map with a fresh listing.
    pub async fn update_volumes(&self) {
        let listed = match self.client.list(&Volume::default()).await {
            Ok(listed) => listed,
            Err(err) => {
                error!("could not list volumes: {err}");
                return;
            }
        };
        let mut volumes = self.volumes.lock().unwrap_or_else(|e| e.into_inner());
        volumes.clear();
        for vol in listed {
            volumes.insert(vol.name(), vol);
        }
    }

    /// Watch the snapshot-signal prefix: each signal dispatches an
    /// immediate snapshot, then the signal record is consumed.
    fn spawn_signal_watch(self: Arc<Self>) {
        let daemon = self;
        tokio::spawn(async move {
            let (mut events, mut errors) = match daemon
                .client
                .watch_prefix(&SnapshotSignal::default())
                .await
            {
                Ok(channels) => channels,
                Err(err) => {
                    error!("could not watch snapshot signals: {err}");
                    return;
                }
            };
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(signal) => Arc::clone(&daemon).consume_signal(&signal).await,
                        None => break,
                    },
                    err = errors.recv() => match err {
                        Some(err) => error!("error received reading snapshot signal: {err}"),
                        None => break,
                    },
                }
            }
        });
    }

    /// Handle one snapshot signal: snapshot the volume asynchronously and
    /// delete the signal record. Consumption is idempotent; a missing
    /// record means another pass already took it.
    pub async fn consume_signal(self: Arc<Self>, signal: &SnapshotSignal) {
        let Ok((policy, volume)) = storage::split_name(signal.volume()) else {
            error!("invalid volume name {:?} during snapshot signal", signal.volume());
            return;
        };

        let mut vol = Volume::new(&policy, &volume);
        if let Err(err) = self.client.get(&mut vol).await {
            error!("volume {policy}/{volume} missing during snapshot signal: {err}");
            return;
        }

        let daemon = Arc::clone(&self);
        tokio::spawn(async move {
            daemon.create_snapshot(&vol).await;
        });

        if let Err(err) = self.client.delete(signal).await {
            if !err.is_not_exists() {
                error!("error removing snapshot reference: {err}");
            }
        }
    }

    /// Whether any host holds the mount lock for a locked volume, probed
    /// by a throwaway acquire.
    pub async fn is_volume_in_use(&self, vol: &Volume) -> bool {
        if vol.unlocked {
            return false;
        }
        let probe = Use::mount_owner(&self.hostname, vol);
        match self.client.acquire(&probe).await {
            Ok(()) => {
                if let Err(err) = self.client.free(&probe, false).await {
                    warn!("could not free probe lock for {}: {err}", vol.name());
                }
                false
            }
            Err(err) if err.is_exists() => true,
            Err(err) => {
                error!("store error while probing mount lock for {}: {err}", vol.name());
                false
            }
        }
    }

    /// The cadence loop: every second, snapshot-and-prune any volume whose
    /// frequency gate matches the current time.
    async fn schedule_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;

            // copy under the mutex so re-listing is never blocked
            let volumes: Vec<Volume> = {
                let map = self.volumes.lock().unwrap_or_else(|e| e.into_inner());
                map.values().cloned().collect()
            };

            for vol in volumes {
                if !vol.runtime_options().use_snapshots {
                    continue;
                }
                let freq = match vol.runtime_options().frequency() {
                    Ok(freq) => freq.as_secs(),
                    Err(err) => {
                        warn!("volume {} has an invalid frequency, skipping snapshot: {err}", vol.name());
                        continue;
                    }
                };
                if freq == 0 {
                    continue;
                }

                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                if now % freq != 0 {
                    continue;
                }

                // the loop can revisit a volume within the same second;
                // skip anything already dispatched
                if !self.mark_inflight(&vol.name()) {
                    continue;
                }

                let in_use = self.is_volume_in_use(&vol).await;
                let daemon = Arc::clone(&self);
                tokio::spawn(async move {
                    if in_use {
                        daemon.create_snapshot(&vol).await;
                    }
                    // prune even when the volume is idle
                    daemon.prune_snapshots(&vol).await;
                    daemon.clear_inflight(&vol.name());
                });
            }
        }
    }

    fn mark_inflight(&self, name: &str) -> bool {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_owned())
    }

    fn clear_inflight(&self, name: &str) {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    /// Take one snapshot of a volume under the snapshot-create lock.
    pub async fn create_snapshot(&self, vol: &Volume) {
        info!("snapshotting {}", vol.name());

        let snapshot_backend = vol
            .backends
            .as_ref()
            .map(|b| b.snapshot.clone())
            .unwrap_or_default();
        if snapshot_backend.is_empty() {
            debug!("snapshot driver for volume {} was empty, not snapshotting", vol.name());
            return;
        }

        let lock = Use::snapshot_create(vol);
        let handle = match self
            .client
            .acquire_and_refresh(&lock, self.global().ttl_duration())
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                error!("{}", VolError::lock_failed(err.to_string()));
                return;
            }
        };

        let result = async {
            let driver = backend::snapshot_driver(&snapshot_backend)?;
            let opts = vol.to_driver_options(self.global().timeout_duration())?;
            let stamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
                .to_string();
            driver.create_snapshot(&stamp, &opts).await
        }
        .await;

        if let Err(err) = result {
            error!("error creating snapshot for volume {}: {err}", vol.name());
        }
        handle.stop();
    }

    /// Prune a volume's snapshots down to its keep count, oldest first,
    /// under the snapshot-remove lock.
    pub async fn prune_snapshots(&self, vol: &Volume) {
        info!("starting snapshot prune for {}", vol.name());

        let snapshot_backend = vol
            .backends
            .as_ref()
            .map(|b| b.snapshot.clone())
            .unwrap_or_default();
        if snapshot_backend.is_empty() {
            debug!("snapshot driver for volume {} was empty, not pruning", vol.name());
            return;
        }

        let lock = Use::snapshot_remove(vol);
        let handle = match self
            .client
            .acquire_and_refresh(&lock, self.global().ttl_duration())
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                error!("{}", VolError::lock_failed(err.to_string()));
                return;
            }
        };

        let result = async {
            let driver = backend::snapshot_driver(&snapshot_backend)?;
            let opts = vol.to_driver_options(self.global().timeout_duration())?;
            let list = driver.list_snapshots(&opts).await?;

            let keep = vol.runtime_options().snapshot.keep;
            debug!("volume {}: keeping {keep} snapshots", vol.name());

            let excess = list.len().saturating_sub(usize::try_from(keep).unwrap_or(usize::MAX));
            for snapshot in list.iter().take(excess) {
                info!("removing snapshot {snapshot:?} for volume {}", vol.name());
                if let Err(err) = driver.remove_snapshot(snapshot, &opts).await {
                    error!(
                        "removing snapshot {snapshot:?} for volume {} failed: {err}",
                        vol.name()
                    );
                }
            }
            Ok::<(), VolError>(())
        }
        .await;

        if let Err(err) = result {
            error!("could not prune snapshots for volume {}: {err}", vol.name());
        }
        handle.stop();
    }
}
