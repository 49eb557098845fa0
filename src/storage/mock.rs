//! The in-memory mock driver.
//!
//! Implements all three driver traits against process memory. The test
//! suite runs the full coordination machinery over it, and the failure
//! knobs let tests force mid-operation errors.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{CrudDriver, DriverOptions, Mount, MountDriver, SnapshotDriver};
use crate::common::error::{VolError, VolResult};

/// Shared backend state; one per process in production, one per test when
/// isolation matters.
#[derive(Debug, Default)]
pub struct MockState {
    /// Provisioned volumes.
    volumes: Mutex<HashSet<String>>,
    /// Formatted volumes.
    formatted: Mutex<HashSet<String>>,
    /// Active mounts by qualified name.
    mounted: Mutex<HashMap<String, Mount>>,
    /// Snapshots by qualified name, oldest first.
    snapshots: Mutex<HashMap<String, Vec<String>>>,
    /// Volumes whose next mount fails.
    fail_mounts: Mutex<HashSet<String>>,
    /// Volumes whose next format fails.
    fail_formats: Mutex<HashSet<String>>,
}

impl MockState {
    /// Make the next mount of `name` fail.
    pub fn fail_next_mount(&self, name: &str) {
        self.fail_mounts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_owned());
    }

    /// Make the next format of `name` fail.
    pub fn fail_next_format(&self, name: &str) {
        self.fail_formats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_owned());
    }
}

/// The mock driver.
#[derive(Clone, Debug)]
pub struct MockDriver {
    /// Shared state.
    state: Arc<MockState>,
    /// Base directory mount paths are computed under.
    base: String,
}

impl MockDriver {
    /// A driver over the given state, computing mount paths under `base`.
    #[must_use]
    pub fn new(state: Arc<MockState>, base: &str) -> Self {
        Self {
            state,
            base: base.to_owned(),
        }
    }

    /// The shared state, for test assertions.
    #[must_use]
    pub fn state(&self) -> &Arc<MockState> {
        &self.state
    }

    fn lock<'a, T>(m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        m.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CrudDriver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create(&self, opts: &DriverOptions) -> VolResult<()> {
        let mut volumes = Self::lock(&self.state.volumes);
        if !volumes.insert(opts.volume.name.clone()) {
            return Err(VolError::NoActionTaken);
        }
        Ok(())
    }

    async fn format(&self, opts: &DriverOptions) -> VolResult<()> {
        if Self::lock(&self.state.fail_formats).remove(&opts.volume.name) {
            return Err(VolError::argument_invalid(format!(
                "forced format failure for {}",
                opts.volume.name
            )));
        }
        Self::lock(&self.state.formatted).insert(opts.volume.name.clone());
        Ok(())
    }

    async fn exists(&self, opts: &DriverOptions) -> VolResult<bool> {
        Ok(Self::lock(&self.state.volumes).contains(&opts.volume.name))
    }

    async fn remove(&self, opts: &DriverOptions) -> VolResult<()> {
        let mut volumes = Self::lock(&self.state.volumes);
        if !volumes.remove(&opts.volume.name) {
            return Err(VolError::not_exists(opts.volume.name.clone()));
        }
        Self::lock(&self.state.formatted).remove(&opts.volume.name);
        Self::lock(&self.state.snapshots).remove(&opts.volume.name);
        Ok(())
    }
}

#[async_trait]
impl MountDriver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn mount(&self, opts: &DriverOptions) -> VolResult<Mount> {
        if Self::lock(&self.state.fail_mounts).remove(&opts.volume.name) {
            return Err(VolError::argument_invalid(format!(
                "forced mount failure for {}",
                opts.volume.name
            )));
        }
        let mut mounted = Self::lock(&self.state.mounted);
        if mounted.contains_key(&opts.volume.name) {
            return Err(VolError::argument_invalid(format!(
                "{} is already mounted",
                opts.volume.name
            )));
        }
        let mount = Mount {
            device_major: 252,
            device_minor: mounted.len() as u32,
            path: self.mount_path(opts)?,
            volume: opts.volume.clone(),
        };
        mounted.insert(opts.volume.name.clone(), mount.clone());
        Ok(mount)
    }

    async fn unmount(&self, opts: &DriverOptions) -> VolResult<()> {
        let mut mounted = Self::lock(&self.state.mounted);
        if mounted.remove(&opts.volume.name).is_none() {
            return Err(VolError::not_exists(format!(
                "{} is not mounted",
                opts.volume.name
            )));
        }
        Ok(())
    }

    fn mount_path(&self, opts: &DriverOptions) -> VolResult<String> {
        Ok(Path::new(&self.base)
            .join(&opts.volume.name)
            .to_string_lossy()
            .into_owned())
    }

    async fn mounts(&self) -> VolResult<Vec<Mount>> {
        Ok(Self::lock(&self.state.mounted).values().cloned().collect())
    }
}

#[async_trait]
impl SnapshotDriver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_snapshot(&self, snapshot: &str, opts: &DriverOptions) -> VolResult<()> {
        Self::lock(&self.state.snapshots)
            .entry(opts.volume.name.clone())
            .or_default()
            .push(snapshot.to_owned());
        Ok(())
    }

    async fn list_snapshots(&self, opts: &DriverOptions) -> VolResult<Vec<String>> {
        Ok(Self::lock(&self.state.snapshots)
            .get(&opts.volume.name)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_snapshot(&self, snapshot: &str, opts: &DriverOptions) -> VolResult<()> {
        let mut snapshots = Self::lock(&self.state.snapshots);
        let list = snapshots
            .get_mut(&opts.volume.name)
            .ok_or_else(|| VolError::not_exists(opts.volume.name.clone()))?;
        let before = list.len();
        list.retain(|s| s != snapshot);
        if list.len() == before {
            return Err(VolError::not_exists(format!(
                "snapshot {snapshot} of {}",
                opts.volume.name
            )));
        }
        Ok(())
    }

    async fn copy_snapshot(
        &self,
        opts: &DriverOptions,
        snapshot: &str,
        target: &str,
    ) -> VolResult<()> {
        let snapshots = Self::lock(&self.state.snapshots);
        let known = snapshots
            .get(&opts.volume.name)
            .is_some_and(|list| list.iter().any(|s| s == snapshot));
        if !known {
            return Err(VolError::not_exists(format!(
                "snapshot {snapshot} of {}",
                opts.volume.name
            )));
        }
        drop(snapshots);
        Self::lock(&self.state.volumes).insert(target.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn opts(name: &str) -> DriverOptions {
        DriverOptions {
            volume: super::super::Volume {
                name: name.to_owned(),
                size: 10,
                params: HashMap::new(),
            },
            ..DriverOptions::default()
        }
    }

    #[tokio::test]
    async fn test_create_reports_already_provisioned() {
        let driver = MockDriver::new(Arc::new(MockState::default()), "/mnt/test");
        driver.create(&opts("p/v")).await.unwrap();
        assert!(driver
            .create(&opts("p/v"))
            .await
            .unwrap_err()
            .is_no_action_taken());
        assert!(driver.exists(&opts("p/v")).await.unwrap());
    }

    #[tokio::test]
    async fn test_mount_cycle() {
        let driver = MockDriver::new(Arc::new(MockState::default()), "/mnt/test");
        let mount = driver.mount(&opts("p/v")).await.unwrap();
        assert_eq!(mount.path, "/mnt/test/p/v");
        assert!(driver.mount(&opts("p/v")).await.is_err());

        assert_eq!(driver.mounts().await.unwrap().len(), 1);
        driver.unmount(&opts("p/v")).await.unwrap();
        assert!(driver.unmount(&opts("p/v")).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshots_oldest_first() {
        let driver = MockDriver::new(Arc::new(MockState::default()), "/mnt/test");
        for name in ["one", "two", "three"] {
            driver.create_snapshot(name, &opts("p/v")).await.unwrap();
        }
        assert_eq!(
            driver.list_snapshots(&opts("p/v")).await.unwrap(),
            vec!["one", "two", "three"]
        );
        driver.remove_snapshot("one", &opts("p/v")).await.unwrap();
        assert_eq!(
            driver.list_snapshots(&opts("p/v")).await.unwrap(),
            vec!["two", "three"]
        );
    }
}
