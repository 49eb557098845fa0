//! Volumes: materialized storage resources.
//!
//! A volume is produced from a policy at create time by deep-copying the
//! policy and merging the flat request options over it. Volume writes use
//! create-if-absent semantics; the key is the authority on who won a
//! concurrent create.

use core::fmt;
use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::policy::{BackendDrivers, CreateOptions, Policy, DEFAULT_FILESYSTEM};
use super::runtime::RuntimeOptions;
use super::{trim_entity_key, DbClient, Entity, SetSemantics, ROOT_VOLUME};
use crate::common::error::{Context, VolError, VolResult};
use crate::storage;

/// A materialized volume.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Volume {
    /// Owning policy, derived from the key.
    #[serde(skip)]
    policy_name: String,
    /// Volume name, derived from the key.
    #[serde(skip)]
    volume_name: String,

    /// Mounts of this volume skip locking.
    #[serde(default)]
    pub unlocked: bool,
    /// Opaque options handed to the storage drivers.
    #[serde(rename = "driver", default)]
    pub driver_options: HashMap<String, String>,
    /// Remote source for network filesystems.
    #[serde(rename = "mount", default)]
    pub mount_source: String,
    /// Creation options.
    #[serde(rename = "create", default)]
    pub create_options: CreateOptions,
    /// Runtime knobs; the authoritative copy lives at its own key and is
    /// folded back in on read.
    #[serde(rename = "runtime", default)]
    runtime_options: RuntimeOptions,
    /// The driver triple, always explicit on volumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backends: Option<BackendDrivers>,
}

impl Volume {
    /// A volume shell addressed to `policy`/`volume`; used as a fetch or
    /// lock target.
    #[must_use]
    pub fn new(policy: &str, volume: &str) -> Self {
        Self {
            policy_name: policy.to_owned(),
            volume_name: volume.to_owned(),
            ..Self::default()
        }
    }

    /// The owning policy name.
    #[must_use]
    pub fn policy(&self) -> &str {
        &self.policy_name
    }

    /// The volume name within its policy.
    #[must_use]
    pub fn volume(&self) -> &str {
        &self.volume_name
    }

    /// The qualified name, `<policy>/<volume>`.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}/{}", self.policy_name, self.volume_name)
    }

    /// Rename the volume within its policy (used by snapshot copy).
    pub fn set_name(&mut self, volume: &str) {
        self.volume_name = volume.to_owned();
        self.runtime_options
            .set_names(&self.policy_name, volume);
    }

    /// The runtime options.
    #[must_use]
    pub fn runtime_options(&self) -> &RuntimeOptions {
        &self.runtime_options
    }

    /// Replace the runtime options, keeping them addressed to this volume.
    pub fn set_runtime_options(&mut self, mut options: RuntimeOptions) {
        options.set_names(&self.policy_name, &self.volume_name);
        self.runtime_options = options;
    }

    /// The named representation, for API responses.
    #[must_use]
    pub fn named(&self) -> NamedVolume {
        NamedVolume {
            policy: self.policy_name.clone(),
            volume: self.volume_name.clone(),
            config: self.clone(),
        }
    }

    /// Convert to the options handed to storage drivers.
    pub fn to_driver_options(&self, timeout: std::time::Duration) -> VolResult<storage::DriverOptions> {
        Ok(storage::DriverOptions {
            volume: storage::Volume {
                name: self.name(),
                size: self.create_options.actual_size()?,
                params: self.driver_options.clone(),
            },
            fs_options: storage::FsOptions {
                fs_type: self.create_options.filesystem.clone(),
                create_command: String::new(),
            },
            source: self.mount_source.clone(),
            timeout,
        })
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.policy_name, self.volume_name)
    }
}

#[async_trait]
impl Entity for Volume {
    fn prefix(&self) -> String {
        ROOT_VOLUME.to_owned()
    }

    fn path(&self) -> VolResult<String> {
        if self.policy_name.is_empty() || self.volume_name.is_empty() {
            return Err(VolError::invalid_db_path(format!(
                "volume is missing a policy or volume name: {self:?}"
            )));
        }
        if self.policy_name.contains('/') || self.volume_name.contains('/') {
            return Err(VolError::invalid_db_path(format!(
                "volume name {self} contains invalid characters"
            )));
        }
        Ok(format!("{ROOT_VOLUME}/{self}"))
    }

    fn set_key(&mut self, key: &str) -> VolResult<()> {
        let suffix = trim_entity_key(key, ROOT_VOLUME);
        let parts: Vec<&str> = suffix.split('/').collect();
        if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(VolError::invalid_db_path(format!(
                "could not parse volume name from key {key:?}"
            )));
        }
        self.policy_name = parts[0].to_owned();
        self.volume_name = parts[1].to_owned();
        self.runtime_options.set_names(parts[0], parts[1]);
        Ok(())
    }

    fn validate(&self) -> VolResult<()> {
        self.path()?;

        let Some(ref backends) = self.backends else {
            return Err(VolError::invalid_volume(self.name())
                .add_context("no backends are configured"));
        };
        if backends.mount.is_empty() {
            return Err(VolError::invalid_volume(self.name())
                .add_context("mount backend was empty"));
        }

        if backends.crud.is_empty() {
            if self.mount_source.is_empty() {
                return Err(VolError::invalid_volume(self.name())
                    .add_context("mount source is required without a CRUD backend"));
            }
        } else {
            let size = self
                .create_options
                .actual_size()
                .with_context(|| format!("checking size of {self}"))?;
            if size == 0 {
                return Err(VolError::invalid_volume(self.name())
                    .add_context("size set to zero for non-empty CRUD backend"));
            }
        }

        self.runtime_options.validate_options()
    }

    fn set_semantics(&self) -> SetSemantics {
        SetSemantics::CreateIfAbsent
    }

    async fn pre_set(&mut self, c: &DbClient) -> VolResult<()> {
        // The runtime knobs are independently writable; publish them at
        // their own key alongside the volume. Safe to repeat if the final
        // create loses its race.
        let mut runtime = self.runtime_options.clone();
        runtime.set_names(&self.policy_name, &self.volume_name);
        c.set(&mut runtime).await
    }

    async fn post_get(&mut self, c: &DbClient) -> VolResult<()> {
        let mut runtime = RuntimeOptions::new(&self.policy_name, &self.volume_name);
        match c.get(&mut runtime).await {
            Ok(()) => {
                self.runtime_options = runtime;
                Ok(())
            }
            // No independent record yet; keep the embedded copy.
            Err(err) if err.is_not_exists() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// A named volume; used for API responses.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NamedVolume {
    /// Owning policy name.
    pub policy: String,
    /// Volume name.
    pub volume: String,
    /// The volume body.
    #[serde(flatten)]
    pub config: Volume,
}

/// A volume create/remove/copy request.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct VolumeRequest {
    /// Volume name within the policy.
    #[serde(default)]
    pub name: String,
    /// Policy to create from.
    #[serde(default)]
    pub policy: String,
    /// Flat request options, merged over the policy.
    #[serde(default)]
    pub options: HashMap<String, String>,
}

/// Materialize a volume from a policy, merging the flat request options
/// over a copy of the policy.
pub fn create(
    policy: &Policy,
    name: &str,
    opts: &HashMap<String, String>,
) -> VolResult<Volume> {
    if policy.name().is_empty() {
        return Err(VolError::invalid_db_path("policy name was blank"));
    }
    if name.is_empty() || name.contains('/') {
        return Err(VolError::invalid_volume(name));
    }

    let backends = policy.resolved_backends()?;
    let mut runtime = policy.runtime_options.clone();
    runtime.set_names(policy.name(), name);

    let mut vol = Volume {
        policy_name: policy.name().to_owned(),
        volume_name: name.to_owned(),
        unlocked: policy.unlocked,
        driver_options: policy.driver_options.clone(),
        mount_source: String::new(),
        create_options: policy.create_options.clone(),
        runtime_options: runtime,
        backends: Some(backends),
    };

    merge_opts(&mut vol, opts)?;

    if vol.create_options.filesystem.is_empty() {
        vol.create_options.filesystem = DEFAULT_FILESYSTEM.to_owned();
    }

    vol.validate()?;
    Ok(vol)
}

/// Merge docker's flat driver options into the volume's nested structures.
/// Unknown keys are errors.
fn merge_opts(vol: &mut Volume, opts: &HashMap<String, String>) -> VolResult<()> {
    for (key, value) in opts {
        match key.as_str() {
            "unlocked" => {
                vol.unlocked = parse_bool(key, value)?;
            }
            "mount" => {
                vol.mount_source = value.clone();
            }
            "size" => {
                vol.create_options.size = value.clone();
            }
            "filesystem" => {
                vol.create_options.filesystem = value.clone();
            }
            "snapshots" => {
                vol.runtime_options.use_snapshots = parse_bool(key, value)?;
            }
            "snapshots.frequency" => {
                vol.runtime_options.snapshot.frequency = value.clone();
            }
            "snapshots.keep" => {
                vol.runtime_options.snapshot.keep = parse_u64(key, value)?;
            }
            "rate-limit.read.bps" => {
                vol.runtime_options.rate_limit.read_bps = parse_u64(key, value)?;
            }
            "rate-limit.write.bps" => {
                vol.runtime_options.rate_limit.write_bps = parse_u64(key, value)?;
            }
            unknown => {
                return Err(VolError::argument_invalid(format!(
                    "key not found: {unknown:?}"
                )));
            }
        }
    }
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> VolResult<bool> {
    value.parse().map_err(|_ignore| {
        VolError::argument_invalid(format!("could not parse {key}={value:?} as a boolean"))
    })
}

fn parse_u64(key: &str, value: &str) -> VolResult<u64> {
    value.parse().map_err(|_ignore| {
        VolError::argument_invalid(format!("could not parse {key}={value:?} as an integer"))
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn mock_policy(name: &str) -> Policy {
        let mut policy = Policy::new(name);
        policy.backend = "mock".to_owned();
        policy.create_options.size = "10MB".to_owned();
        policy
            .driver_options
            .insert("pool".to_owned(), "rbd".to_owned());
        policy
    }

    fn nfs_policy(name: &str) -> Policy {
        let mut policy = Policy::new(name);
        policy.backends = Some(BackendDrivers {
            crud: String::new(),
            mount: "nfs".to_owned(),
            snapshot: String::new(),
        });
        policy
    }

    #[test]
    fn test_create_applies_defaults() {
        let policy = mock_policy("basic");
        let mut opts = HashMap::new();
        opts.insert("filesystem".to_owned(), String::new());

        let vol = create(&policy, "test", &opts).unwrap();
        assert_eq!(vol.name(), "basic/test");
        assert_eq!(vol.create_options.filesystem, "ext4");
        assert_eq!(vol.create_options.size, "10MB");
        assert_eq!(vol.runtime_options().policy(), "basic");
        assert_eq!(vol.runtime_options().volume(), "test");
    }

    #[test]
    fn test_create_rejects_bad_input() {
        let policy = mock_policy("basic");
        assert!(create(&Policy::default(), "x", &HashMap::new()).is_err());
        assert!(create(&policy, "", &HashMap::new()).is_err());
        assert!(create(&policy, "a/b", &HashMap::new()).is_err());

        let mut opts = HashMap::new();
        opts.insert("quux".to_owned(), "derp".to_owned());
        assert!(create(&policy, "x", &opts).is_err());
    }

    #[test]
    fn test_mount_source_required_without_crud() {
        let policy = nfs_policy("nfs");
        assert!(create(&policy, "test", &HashMap::new()).is_err());

        let mut opts = HashMap::new();
        opts.insert("mount".to_owned(), "localhost:/mnt".to_owned());
        let vol = create(&policy, "test", &opts).unwrap();
        assert_eq!(vol.mount_source, "localhost:/mnt");
    }

    #[test]
    fn test_merge_overrides() {
        let policy = mock_policy("basic");
        let mut opts = HashMap::new();
        opts.insert("unlocked".to_owned(), "true".to_owned());
        opts.insert("size".to_owned(), "1GB".to_owned());
        opts.insert("snapshots".to_owned(), "true".to_owned());
        opts.insert("snapshots.frequency".to_owned(), "10m".to_owned());
        opts.insert("snapshots.keep".to_owned(), "3".to_owned());
        opts.insert("rate-limit.read.bps".to_owned(), "1000".to_owned());

        let vol = create(&policy, "test", &opts).unwrap();
        assert!(vol.unlocked);
        assert_eq!(vol.create_options.actual_size().unwrap(), 1000);
        assert!(vol.runtime_options().use_snapshots);
        assert_eq!(vol.runtime_options().snapshot.keep, 3);
        assert_eq!(vol.runtime_options().rate_limit.read_bps, 1000);
    }

    #[test]
    fn test_validate_matrix() {
        let mut vol = Volume::new("policy1", "foo");
        assert!(vol.validate().is_err(), "no backends must fail");

        vol.backends = Some(BackendDrivers {
            crud: "mock".to_owned(),
            mount: "mock".to_owned(),
            snapshot: "mock".to_owned(),
        });
        vol.create_options.size = "10MB".to_owned();
        vol.validate().unwrap();

        let mut bad = vol.clone();
        bad.set_key("volumes/policy1/").unwrap_err();
        bad.set_key("volumes//foo").unwrap_err();

        vol.create_options.size = "0".to_owned();
        assert!(vol.validate().is_err(), "zero size with CRUD must fail");
    }

    #[test]
    fn test_to_driver_options() {
        let policy = mock_policy("basic");
        let vol = create(&policy, "test", &HashMap::new()).unwrap();
        let opts = vol
            .to_driver_options(std::time::Duration::from_secs(1))
            .unwrap();
        assert_eq!(opts.volume.name, "basic/test");
        assert_eq!(opts.volume.size, 10);
        assert_eq!(opts.volume.params.get("pool").unwrap(), "rbd");
        assert_eq!(opts.fs_options.fs_type, "ext4");
    }
}
