//! Runtime options: the knobs that may change while a volume is mounted.
//!
//! Stored independently of the volume record so operators can adjust
//! snapshot cadence and rate limits without disturbing volume identity;
//! mount agents watch this prefix to reconfigure live mounts.

use core::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{trim_entity_key, Entity, ROOT_RUNTIME};
use crate::common::error::{VolError, VolResult};

/// Snapshot cadence configuration.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SnapshotConfig {
    /// How often to snapshot, e.g. `10m` or `1s`.
    #[serde(default)]
    pub frequency: String,
    /// How many snapshots to keep when pruning.
    #[serde(default)]
    pub keep: u64,
}

/// Disk rate limiting configuration, applied through cgroups at mount time.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RateLimitConfig {
    /// Write ceiling in bytes per second; zero disables.
    #[serde(rename = "write-bps", default)]
    pub write_bps: u64,
    /// Read ceiling in bytes per second; zero disables.
    #[serde(rename = "read-bps", default)]
    pub read_bps: u64,
}

/// The runtime options of one volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RuntimeOptions {
    /// Whether the supervisor snapshots this volume.
    #[serde(rename = "snapshots", default)]
    pub use_snapshots: bool,
    /// Snapshot cadence.
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    /// Rate limits.
    #[serde(rename = "rate-limit", default)]
    pub rate_limit: RateLimitConfig,

    /// Owning policy, derived from the key.
    #[serde(skip)]
    policy_name: String,
    /// Owning volume, derived from the key.
    #[serde(skip)]
    volume_name: String,
}

impl RuntimeOptions {
    /// Runtime options addressed to one volume.
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

    /// The owning volume name.
    #[must_use]
    pub fn volume(&self) -> &str {
        &self.volume_name
    }

    /// Re-address these options to another volume.
    pub fn set_names(&mut self, policy: &str, volume: &str) {
        self.policy_name = policy.to_owned();
        self.volume_name = volume.to_owned();
    }

    /// The snapshot frequency as a duration.
    pub fn frequency(&self) -> VolResult<std::time::Duration> {
        humantime::parse_duration(&self.snapshot.frequency).map_err(|err| {
            VolError::argument_invalid(format!(
                "could not parse snapshot frequency {:?}: {err}",
                self.snapshot.frequency
            ))
        })
    }

    /// Validate the option values themselves, independent of addressing.
    pub fn validate_options(&self) -> VolResult<()> {
        if self.use_snapshots {
            self.frequency()?;
            if self.snapshot.keep == 0 {
                return Err(VolError::argument_invalid(
                    "snapshots are enabled but keep is zero",
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for RuntimeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.policy_name, self.volume_name)
    }
}

#[async_trait]
impl Entity for RuntimeOptions {
    fn prefix(&self) -> String {
        ROOT_RUNTIME.to_owned()
    }

    fn path(&self) -> VolResult<String> {
        if self.policy_name.is_empty() || self.volume_name.is_empty() {
            return Err(VolError::invalid_db_path(format!(
                "runtime options are missing a policy or volume name: {self:?}"
            )));
        }
        Ok(format!("{ROOT_RUNTIME}/{self}"))
    }

    fn set_key(&mut self, key: &str) -> VolResult<()> {
        let suffix = trim_entity_key(key, ROOT_RUNTIME);
        let parts: Vec<&str> = suffix.split('/').collect();
        if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(VolError::invalid_db_path(format!(
                "could not parse volume name from runtime key {key:?}"
            )));
        }
        self.policy_name = parts[0].to_owned();
        self.volume_name = parts[1].to_owned();
        Ok(())
    }

    fn validate(&self) -> VolResult<()> {
        self.validate_options()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_validate_options() {
        let mut opts = RuntimeOptions {
            use_snapshots: true,
            ..RuntimeOptions::default()
        };
        assert!(opts.validate_options().is_err());

        opts.snapshot = SnapshotConfig {
            frequency: "10m".to_owned(),
            keep: 0,
        };
        assert!(opts.validate_options().is_err());

        opts.snapshot = SnapshotConfig {
            frequency: String::new(),
            keep: 10,
        };
        assert!(opts.validate_options().is_err());

        opts.snapshot = SnapshotConfig {
            frequency: "10m".to_owned(),
            keep: 10,
        };
        opts.validate_options().unwrap();
    }

    #[test]
    fn test_set_key() {
        let mut opts = RuntimeOptions::default();
        opts.set_key("volumes-runtime/basic/test").unwrap();
        assert_eq!(opts.policy(), "basic");
        assert_eq!(opts.volume(), "test");

        assert!(opts.set_key("volumes-runtime/basic").is_err());
        assert!(opts.set_key("volumes-runtime//test").is_err());
    }
}
