//! The storage backend seam.
//!
//! Physical I/O is delegated to pluggable drivers behind three traits:
//! CRUD (provisioning), mount, and snapshot. The coordination core only
//! ever sees [`DriverOptions`] going in and [`Mount`] records coming out.

use core::fmt::Debug;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::error::{VolError, VolResult};

pub mod backend;
pub mod cgroup;
pub mod control;
pub mod mock;

/// Opaque driver parameters (e.g. the ceph pool).
pub type Params = HashMap<String, String>;

/// The volume as drivers see it.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Volume {
    /// Qualified name, `<policy>/<volume>`.
    pub name: String,
    /// Size in megabytes.
    pub size: u64,
    /// Driver parameters.
    pub params: Params,
}

/// Filesystem parameters for formatting.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FsOptions {
    /// Filesystem type, e.g. `ext4`.
    #[serde(rename = "type")]
    pub fs_type: String,
    /// mkfs command template; `%` is replaced with the device.
    pub create_command: String,
}

/// Everything a driver needs to perform one operation.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DriverOptions {
    /// The target volume.
    pub volume: Volume,
    /// Filesystem parameters.
    pub fs_options: FsOptions,
    /// Remote source for network filesystems.
    pub source: String,
    /// How long the driver may take.
    #[serde(skip)]
    pub timeout: Duration,
}

/// One live mount on a host.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Mount {
    /// Device major number.
    pub device_major: u32,
    /// Device minor number.
    pub device_minor: u32,
    /// Where the volume is mounted.
    pub path: String,
    /// The mounted volume.
    pub volume: Volume,
}

/// Split a qualified `<policy>/<volume>` name.
pub fn split_name(name: &str) -> VolResult<(String, String)> {
    let parts: Vec<&str> = name.split('/').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(VolError::invalid_volume(name));
    }
    Ok((parts[0].to_owned(), parts[1].to_owned()))
}

/// Provisioning operations.
#[async_trait]
pub trait CrudDriver: Send + Sync + Debug {
    /// The registered driver name.
    fn name(&self) -> &'static str;

    /// Provision the volume. Returns the `NoActionTaken` sentinel when the
    /// backend reports it is already provisioned.
    async fn create(&self, opts: &DriverOptions) -> VolResult<()>;

    /// Format a freshly provisioned volume.
    async fn format(&self, opts: &DriverOptions) -> VolResult<()>;

    /// Whether the backend artifact exists.
    async fn exists(&self, opts: &DriverOptions) -> VolResult<bool>;

    /// Tear the backend artifact down.
    async fn remove(&self, opts: &DriverOptions) -> VolResult<()>;
}

/// Mount operations.
#[async_trait]
pub trait MountDriver: Send + Sync + Debug {
    /// The registered driver name.
    fn name(&self) -> &'static str;

    /// Mount the volume, returning the mount record. Backends must be
    /// idempotent or detect double-mounting themselves; a lapsed lock
    /// lease means a recovering actor may retry a mount that already
    /// happened.
    async fn mount(&self, opts: &DriverOptions) -> VolResult<Mount>;

    /// Unmount the volume.
    async fn unmount(&self, opts: &DriverOptions) -> VolResult<()>;

    /// The path this volume mounts at.
    fn mount_path(&self, opts: &DriverOptions) -> VolResult<String>;

    /// The mounts this driver currently holds on this host; used to warm
    /// the agent's caches after a restart.
    async fn mounts(&self) -> VolResult<Vec<Mount>>;
}

/// Snapshot operations.
#[async_trait]
pub trait SnapshotDriver: Send + Sync + Debug {
    /// The registered driver name.
    fn name(&self) -> &'static str;

    /// Take a snapshot under the given name.
    async fn create_snapshot(&self, snapshot: &str, opts: &DriverOptions) -> VolResult<()>;

    /// List snapshots, oldest first.
    async fn list_snapshots(&self, opts: &DriverOptions) -> VolResult<Vec<String>>;

    /// Remove one snapshot.
    async fn remove_snapshot(&self, snapshot: &str, opts: &DriverOptions) -> VolResult<()>;

    /// Copy a snapshot into a new volume.
    async fn copy_snapshot(
        &self,
        opts: &DriverOptions,
        snapshot: &str,
        target: &str,
    ) -> VolResult<()>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_split_name() {
        assert_eq!(
            split_name("policy/volume").unwrap(),
            ("policy".to_owned(), "volume".to_owned())
        );
        assert!(split_name("noslash").is_err());
        assert!(split_name("a/b/c").is_err());
        assert!(split_name("/b").is_err());
        assert!(split_name("a/").is_err());
    }
}
