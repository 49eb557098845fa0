//! State and operations shared by the daemon surfaces.
//!
//! [`Api`] carries the per-host mount state machine used by the plugin:
//! the mount collection, the idempotent mount counter, and the table of
//! TTL-refresh handles for held mount locks. The volume create flow lives
//! here too since both the apiserver and the plugin drive it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::db::Entity;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::common::error::{VolError, VolResult};
use crate::common::logger;
use crate::db::{
    execute_with_multi_lock, volume, DbClient, Global, Policy, RefreshHandle, Use, Volume,
    VolumeRequest,
};
use crate::storage::{self, backend, cgroup, control, DriverOptions, Mount, MountDriver};

/// The shared, atomically swapped global configuration pointer. Replaced
/// wholesale on each watch event; never mutated in place.
pub type SharedGlobal = Arc<RwLock<Arc<Global>>>;

/// Wrap a global into the shared pointer form.
#[must_use]
pub fn shared_global(global: Global) -> SharedGlobal {
    Arc::new(RwLock::new(Arc::new(global)))
}

/// Read the current global configuration.
#[must_use]
pub fn current_global(global: &SharedGlobal) -> Arc<Global> {
    Arc::clone(&global.read().unwrap_or_else(|e| e.into_inner()))
}

/// Fetch the global configuration, falling back to defaults when the store
/// has none yet.
pub async fn fetch_global(client: &DbClient) -> Global {
    let mut global = Global::new();
    if let Err(err) = client.get(&mut global).await {
        error!("error fetching global configuration: {err}");
        info!("no global configuration. Proceeding with defaults...");
        global = Global::new();
    }
    global
}

/// Watch the global configuration and swap the shared pointer (and the log
/// level) on every change. Watch errors are logged and never end the loop.
pub async fn spawn_global_watch(client: DbClient, global: SharedGlobal) {
    let (mut events, mut errors) = match client.watch(&Global::new()).await {
        Ok(channels) => channels,
        Err(err) => {
            error!("could not watch global configuration: {err}");
            return;
        }
    };
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(updated) => {
                        debug!("received global {updated:?}");
                        logger::set_debug(updated.debug);
                        *global.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(updated);
                    }
                    None => break,
                },
                err = errors.recv() => match err {
                    Some(err) => error!("error during global watch: {err}"),
                    None => break,
                },
            }
        }
    });
}

/// Map an error to the HTTP response contract: 404 for `NotExists`,
/// 500 with the chained message otherwise.
#[must_use]
pub fn rest_error(err: &VolError) -> Response {
    let status = if err.is_not_exists() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

/// The per-host mount collection: qualified name to live mount.
#[derive(Debug, Default)]
pub struct MountCollection {
    inner: Mutex<HashMap<String, Mount>>,
}

impl MountCollection {
    /// Record a mount.
    pub fn add(&self, name: &str, mount: Mount) {
        self.lock().insert(name.to_owned(), mount);
    }

    /// Drop a mount record.
    pub fn remove(&self, name: &str) {
        self.lock().remove(name);
    }

    /// Look a mount up.
    pub fn get(&self, name: &str) -> Option<Mount> {
        self.lock().get(name).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Mount>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The idempotent mount counter reconciling docker's duplicate requests.
/// Never goes below zero.
#[derive(Debug, Default)]
pub struct MountCounter {
    inner: Mutex<HashMap<String, i32>>,
}

impl MountCounter {
    /// Increment and return the new count.
    pub fn add(&self, name: &str) -> i32 {
        let mut counts = self.lock();
        let count = counts.entry(name.to_owned()).or_insert(0);
        *count += 1;
        *count
    }

    /// Decrement (flooring at zero) and return the new count.
    pub fn sub(&self, name: &str) -> i32 {
        let mut counts = self.lock();
        let count = counts.entry(name.to_owned()).or_insert(0);
        *count = (*count - 1).max(0);
        *count
    }

    /// The current count.
    pub fn get(&self, name: &str) -> i32 {
        *self.lock().get(name).unwrap_or(&0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, i32>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared state behind the plugin surface.
#[derive(Debug)]
pub struct Api {
    /// The record client.
    pub client: DbClient,
    /// This host's label; the owner written into volume locks.
    pub hostname: String,
    /// The shared global configuration.
    pub global: SharedGlobal,
    /// Live mounts on this host.
    pub mounts: MountCollection,
    /// The mount counter.
    pub counter: MountCounter,
    /// TTL-refresh handles for held mount locks, by qualified name.
    stops: Mutex<HashMap<String, RefreshHandle>>,
}

impl Api {
    /// Assemble the plugin state.
    #[must_use]
    pub fn new(client: DbClient, hostname: &str, global: SharedGlobal) -> Self {
        Self {
            client,
            hostname: hostname.to_owned(),
            global,
            mounts: MountCollection::default(),
            counter: MountCounter::default(),
            stops: Mutex::new(HashMap::new()),
        }
    }

    /// The current global configuration.
    #[must_use]
    pub fn global(&self) -> Arc<Global> {
        current_global(&self.global)
    }

    /// Register the refresh handle for a held mount lock.
    fn add_stop(&self, name: &str, handle: RefreshHandle) {
        let mut stops = self.stops.lock().unwrap_or_else(|e| e.into_inner());
        stops.insert(name.to_owned(), handle);
    }

    /// Drop the refresh handle for a volume; its lease then lapses on its
    /// own and the lock disappears within one TTL.
    fn remove_stop(&self, name: &str) {
        let mut stops = self.stops.lock().unwrap_or_else(|e| e.into_inner());
        stops.remove(name);
    }

    /// Whether a refresh handle is registered; used by tests to check for
    /// residue.
    #[must_use]
    pub fn has_stop(&self, name: &str) -> bool {
        self.stops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Resolve the mount driver, volume record, and driver options for a
    /// qualified name.
    pub async fn storage_params(
        &self,
        name: &str,
    ) -> VolResult<(Arc<dyn MountDriver>, Volume, DriverOptions)> {
        let (policy, volume) = storage::split_name(name)?;
        let mut vol = Volume::new(&policy, &volume);
        self.client.get(&mut vol).await?;
        vol.validate()?;

        let backends = vol
            .backends
            .clone()
            .ok_or_else(|| VolError::invalid_volume(vol.name()))?;
        let global = self.global();
        let driver = backend::mount_driver(&backends.mount, &global.mount_path)?;
        let opts = vol.to_driver_options(global.timeout_duration())?;
        Ok((driver, vol, opts))
    }

    /// The mount path for a volume, without mounting anything.
    pub async fn path(&self, name: &str) -> VolResult<String> {
        let (driver, _vol, opts) = self.storage_params(name).await?;
        driver.mount_path(&opts)
    }

    /// Acquire the mount lock with the global TTL and start its refresher.
    async fn start_ttl_refresh(&self, vol: &Volume) -> VolResult<()> {
        let lock = Use::mount_owner(&self.hostname, vol);
        let handle = self
            .client
            .acquire_and_refresh(&lock, self.global().ttl_duration())
            .await?;
        self.add_stop(&vol.name(), handle);
        Ok(())
    }

    /// Roll a failed mount back: best-effort backend unmount, drop the
    /// refresh handle, free the lock. Rollback failures are folded into
    /// the returned error without masking the root cause.
    async fn clear_mount(
        &self,
        cause: VolError,
        lock: &Use,
        driver: &dyn MountDriver,
        opts: &DriverOptions,
    ) -> VolError {
        error!("MOUNT FAILURE: {cause}");
        let name = opts.volume.name.clone();
        let mut result = VolError::mount_failed(cause);

        if let Err(err) = driver.unmount(opts).await {
            // nothing can be done about this; log and continue the rollback
            error!("failure during unmount after failed mount: {err}");
        }
        self.remove_stop(&name);
        if let Err(err) = self.client.free(lock, false).await {
            result = result.add_context(format!("could not free mount lock during rollback: {err}"));
        }
        result
    }

    /// Mount a volume, returning the mount path.
    pub async fn mount(&self, name: &str) -> VolResult<String> {
        let (driver, vol, opts) = self.storage_params(name).await?;
        let vol_name = vol.name();
        let lock = Use::mount_owner(&self.hostname, &vol);

        if !vol.unlocked {
            if let Err(err) = self.start_ttl_refresh(&vol).await {
                return Err(self.clear_mount(err, &lock, driver.as_ref(), &opts).await);
            }
        }

        // Docker issues an unmount request after every mount failure, so
        // the decrement in unmount evens this out.
        if self.counter.add(&vol_name) > 1 {
            if vol.unlocked {
                warn!("duplicate mount of {vol_name:?} detected: returning existing mount path");
                return driver.mount_path(&opts);
            }
            self.counter.sub(&vol_name);
            warn!("duplicate mount of {vol_name:?} detected: lock failed");
            return Err(VolError::lock_failed(format!(
                "duplicate mount of {vol_name:?}"
            )));
        }

        let mount = match driver.mount(&opts).await {
            Ok(mount) => mount,
            Err(err) => return Err(self.clear_mount(err, &lock, driver.as_ref(), &opts).await),
        };
        self.mounts.add(&vol_name, mount.clone());

        if let Err(err) = cgroup::apply_rate_limit(vol.runtime_options(), &mount) {
            error!("could not apply cgroups to volume {vol_name:?}: {err}");
        }

        match driver.mount_path(&opts) {
            Ok(path) => Ok(path),
            Err(err) => {
                self.remove_stop(&vol_name);
                Err(self.clear_mount(err, &lock, driver.as_ref(), &opts).await)
            }
        }
    }

    /// Unmount a volume, returning the mount path.
    pub async fn unmount(&self, name: &str) -> VolResult<String> {
        let (driver, vol, opts) = self.storage_params(name).await?;
        let vol_name = vol.name();

        if self.counter.sub(&vol_name) > 0 {
            warn!("duplicate unmount of {vol_name:?} detected: ignoring and returning success");
            return driver.mount_path(&opts);
        }

        driver
            .unmount(&opts)
            .await
            .map_err(VolError::unmount_failed)?;
        self.mounts.remove(&vol_name);

        if !vol.unlocked {
            self.remove_stop(&vol_name);
        }

        driver.mount_path(&opts)
    }

    /// Warm the counter and mount collection from the drivers' view of
    /// this host, after a restart.
    pub async fn update_mounts(&self) -> VolResult<()> {
        let vols = self.client.list(&Volume::default()).await?;
        for vol in vols {
            let Some(backends) = vol.backends.clone() else {
                continue;
            };
            let global = self.global();
            let Ok(driver) = backend::mount_driver(&backends.mount, &global.mount_path) else {
                continue;
            };
            let Ok(mounts) = driver.mounts().await else {
                continue;
            };
            let name = vol.name();
            if let Some(mount) = mounts.into_iter().find(|m| m.volume.name == name) {
                debug!("recovering mount state for {name}");
                self.counter.add(&name);
                self.mounts.add(&name, mount);
            }
        }
        Ok(())
    }
}

/// The volume create flow, shared by the apiserver and the plugin: fetch
/// the policy, take the create and snapshot locks, provision and format
/// through the backend, then publish the record. Losing the final publish
/// race to an identical creator is success.
pub async fn create_volume(
    client: &DbClient,
    global: &Global,
    hostname: &str,
    request: &VolumeRequest,
) -> VolResult<Volume> {
    if request.policy.is_empty() {
        return Err(VolError::argument_invalid("policy was blank"));
    }
    if request.name.is_empty() {
        return Err(VolError::argument_invalid("volume was blank"));
    }

    let mut policy = Policy::new(&request.policy);
    client
        .get(&mut policy)
        .await
        .map_err(|err| err.add_context(format!("policy {:?} not found", request.policy)))?;

    let shell = Volume::new(&request.policy, &request.name);
    let locks = [
        Use::create_owner(hostname, &shell),
        Use::snapshot_create(&shell),
    ];
    let timeout = global.timeout_duration();

    execute_with_multi_lock(client, &locks, timeout, || async {
        let mut vol = volume::create(&policy, &request.name, &request.options)?;
        debug!("volume create: {vol:?}");

        match control::create_volume(&vol, timeout).await {
            // backend says the artifact is already provisioned (or there
            // is nothing to provision); skip formatting
            Err(err) if err.is_no_action_taken() => {}
            Err(err) => return Err(VolError::create_volume(err)),
            Ok(opts) => {
                if let Err(format_err) = control::format_volume(&vol, &opts).await {
                    if let Err(remove_err) = control::remove_volume(&vol, timeout).await {
                        error!("error during cleanup of failed format: {remove_err}");
                    }
                    return Err(VolError::format_volume(format_err));
                }
            }
        }

        match client.set(&mut vol).await {
            Ok(()) => {}
            Err(err) if err.is_exists() => {
                debug!("volume {vol} was published by a concurrent creator");
            }
            Err(err) => return Err(VolError::publish_volume(err)),
        }

        Ok(vol)
    })
    .await
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;
    use crate::kv::mem_impl::MemEngine;

    fn test_client() -> DbClient {
        DbClient::new(Arc::new(MemEngine::new()))
    }

    async fn seed_policy(client: &DbClient, name: &str, unlocked: bool) -> Policy {
        let mut policy = Policy::new(name);
        policy.backend = "mock".to_owned();
        policy.create_options.size = "10MB".to_owned();
        policy.unlocked = unlocked;
        client.set(&mut policy).await.unwrap();
        policy
    }

    async fn seed_volume(client: &DbClient, global: &Global, name: &str, policy: &str) -> Volume {
        let request = VolumeRequest {
            name: name.to_owned(),
            policy: policy.to_owned(),
            options: HashMap::new(),
        };
        create_volume(client, global, "testhost", &request)
            .await
            .unwrap()
    }

    fn api_for(client: &DbClient, host: &str) -> Api {
        Api::new(client.clone(), host, shared_global(Global::new()))
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let client = test_client();
        let global = Global::new();
        seed_policy(&client, "basic", false).await;

        let first = seed_volume(&client, &global, "idem", "basic").await;
        let second = seed_volume(&client, &global, "idem", "basic").await;
        assert_eq!(first.name(), second.name());
    }

    #[tokio::test]
    async fn test_create_missing_policy_propagates_not_exists() {
        let client = test_client();
        let request = VolumeRequest {
            name: "v".to_owned(),
            policy: "nope".to_owned(),
            options: HashMap::new(),
        };
        let err = create_volume(&client, &Global::new(), "h", &request)
            .await
            .unwrap_err();
        assert!(err.is_not_exists());
    }

    #[tokio::test]
    async fn test_format_failure_rolls_back_backend() {
        let client = test_client();
        let global = Global::new();
        seed_policy(&client, "basic", false).await;

        backend::mock_state().fail_next_format("basic/fmtfail");
        let request = VolumeRequest {
            name: "fmtfail".to_owned(),
            policy: "basic".to_owned(),
            options: HashMap::new(),
        };
        let err = create_volume(&client, &global, "h", &request)
            .await
            .unwrap_err();
        assert!(matches!(err, VolError::FormatVolume { .. }));

        // the record never published and the locks were released
        let mut vol = Volume::new("basic", "fmtfail");
        assert!(client.get(&mut vol).await.unwrap_err().is_not_exists());
        let shell = Volume::new("basic", "fmtfail");
        client
            .acquire(&Use::create_owner("h", &shell))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mount_unmount_cycle_locked() {
        let client = test_client();
        let global = Global::new();
        seed_policy(&client, "basic", false).await;
        seed_volume(&client, &global, "cycle", "basic").await;

        let api = api_for(&client, "host1");
        let path = api.mount("basic/cycle").await.unwrap();
        assert_eq!(path, "/mnt/volstack/basic/cycle");
        assert_eq!(api.counter.get("basic/cycle"), 1);
        assert!(api.mounts.get("basic/cycle").is_some());
        assert!(api.has_stop("basic/cycle"));

        // the mount lock is held
        let shell = Volume::new("basic", "cycle");
        assert!(client
            .acquire(&Use::mount_owner("elsewhere", &shell))
            .await
            .unwrap_err()
            .is_exists());

        let path = api.unmount("basic/cycle").await.unwrap();
        assert_eq!(path, "/mnt/volstack/basic/cycle");
        assert_eq!(api.counter.get("basic/cycle"), 0);
        assert!(api.mounts.get("basic/cycle").is_none());
        assert!(!api.has_stop("basic/cycle"));
    }

    #[tokio::test]
    async fn test_locked_mount_is_exclusive_across_hosts() {
        let client = test_client();
        let global = Global::new();
        seed_policy(&client, "basic", false).await;
        seed_volume(&client, &global, "excl", "basic").await;

        let host1 = api_for(&client, "host1");
        let host2 = api_for(&client, "host2");

        host1.mount("basic/excl").await.unwrap();
        let err = host2.mount("basic/excl").await.unwrap_err();
        assert!(err.is_exists(), "loser must surface the lock contention");
        assert!(!host2.has_stop("basic/excl"));
        assert!(host2.mounts.get("basic/excl").is_none());
    }

    #[tokio::test]
    async fn test_unlocked_duplicate_mounts_share_a_path() {
        let client = test_client();
        let global = Global::new();
        seed_policy(&client, "open", true).await;
        seed_volume(&client, &global, "shared", "open").await;

        let api = api_for(&client, "host1");
        let first = api.mount("open/shared").await.unwrap();
        let second = api.mount("open/shared").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(api.counter.get("open/shared"), 2);

        // the first unmount is suppressed, the second tears down
        api.unmount("open/shared").await.unwrap();
        assert!(api.mounts.get("open/shared").is_some());
        api.unmount("open/shared").await.unwrap();
        assert!(api.mounts.get("open/shared").is_none());
    }

    #[tokio::test]
    async fn test_failed_mount_leaves_no_residue() {
        let client = test_client();
        let global = Global::new();
        seed_policy(&client, "basic", false).await;
        seed_volume(&client, &global, "boom", "basic").await;

        let api = api_for(&client, "host1");
        backend::mock_state().fail_next_mount("basic/boom");
        let err = api.mount("basic/boom").await.unwrap_err();
        assert!(matches!(err, VolError::MountFailed { .. }));

        assert!(api.mounts.get("basic/boom").is_none());
        assert!(!api.has_stop("basic/boom"));
        // the lock was freed during rollback
        let shell = Volume::new("basic", "boom");
        client
            .acquire(&Use::mount_owner("host1", &shell))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unmount_never_drives_counter_negative() {
        let client = test_client();
        let global = Global::new();
        seed_policy(&client, "basic", false).await;
        seed_volume(&client, &global, "floor", "basic").await;

        let api = api_for(&client, "host1");
        let err = api.unmount("basic/floor").await.unwrap_err();
        assert!(matches!(err, VolError::UnmountFailed { .. }));
        assert_eq!(api.counter.get("basic/floor"), 0);
    }

    #[tokio::test]
    async fn test_parallel_locked_mounts_single_winner() {
        let client = test_client();
        let global = Global::new();
        seed_policy(&client, "basic", false).await;
        seed_volume(&client, &global, "race", "basic").await;

        let apis: Vec<Arc<Api>> = (0..3)
            .map(|i| Arc::new(api_for(&client, &format!("host{i}"))))
            .collect();

        let mut handles = Vec::new();
        for api in &apis {
            let api = Arc::clone(api);
            handles.push(tokio::spawn(async move { api.mount("basic/race").await }));
        }

        let mut wins = 0;
        let mut losses = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(_) => losses += 1,
            }
        }
        assert_eq!(wins, 1, "exactly one locked mount may win");
        assert_eq!(losses, 2);
    }
}
