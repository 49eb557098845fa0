//! Policies: templates for volumes.
//!
//! Every successful policy write also records a timestamped
//! [`PolicyRevision`], preserving history under `policyrevisions/`.

use core::fmt;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    trim_entity_key, DbClient, Entity, RuntimeOptions, ROOT_POLICY, ROOT_POLICY_REVISION,
};
use crate::common::error::{VolError, VolResult};
use crate::storage::backend;

/// The filesystems offered when a policy does not name its own, mapping
/// filesystem name to the mkfs command template (`%` is the device).
#[must_use]
pub fn default_filesystems() -> HashMap<String, String> {
    let mut filesystems = HashMap::new();
    filesystems.insert("ext4".to_owned(), "mkfs.ext4 -m0 %".to_owned());
    filesystems
}

/// The filesystem used when a create request names none.
pub const DEFAULT_FILESYSTEM: &str = "ext4";

/// The storage drivers a policy delegates to.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct BackendDrivers {
    /// Driver for create/format/remove. Empty for backends without block
    /// provisioning (network filesystems).
    pub crud: String,
    /// Driver for mount/unmount. Never empty.
    pub mount: String,
    /// Driver for snapshot operations. Empty disables snapshots.
    pub snapshot: String,
}

/// The options used while creating a volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CreateOptions {
    /// Human-readable size, e.g. `10MB` or `1GB`.
    #[serde(default)]
    pub size: String,
    /// Filesystem to format with.
    #[serde(default)]
    pub filesystem: String,
}

impl CreateOptions {
    /// The size in megabytes. `10MB` is 10, `1GB` is 1000, `0` is 0.
    pub fn actual_size(&self) -> VolResult<u64> {
        let trimmed = self.size.trim();
        if trimmed.is_empty() {
            return Ok(0);
        }
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, suffix) = trimmed.split_at(split);
        let value: u64 = digits.parse().map_err(|_ignore| {
            VolError::argument_invalid(format!("could not parse size {:?}", self.size))
        })?;
        let bytes = match suffix.trim().to_ascii_uppercase().as_str() {
            "" | "B" => value,
            "K" | "KB" => value * 1_000,
            "M" | "MB" => value * 1_000_000,
            "G" | "GB" => value * 1_000_000_000,
            "T" | "TB" => value * 1_000_000_000_000,
            "KIB" => value * 1_024,
            "MIB" => value * 1_048_576,
            "GIB" => value * 1_073_741_824,
            other => {
                return Err(VolError::argument_invalid(format!(
                    "unknown size suffix {other:?} in {:?}",
                    self.size
                )))
            }
        };
        Ok(bytes / 1_000_000)
    }
}

/// A policy: the template a family of volumes is created from.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Policy {
    /// Policy name, derived from the key.
    #[serde(skip)]
    name: String,

    /// Volumes under this policy skip mount locking.
    #[serde(default)]
    pub unlocked: bool,
    /// Creation options.
    #[serde(rename = "create", default)]
    pub create_options: CreateOptions,
    /// Runtime knobs copied into each volume.
    #[serde(rename = "runtime", default)]
    pub runtime_options: RuntimeOptions,
    /// Opaque options handed to the storage drivers.
    #[serde(rename = "driver", default)]
    pub driver_options: HashMap<String, String>,
    /// Available filesystems, name to mkfs command template.
    #[serde(default)]
    pub filesystems: HashMap<String, String>,
    /// Explicit driver triple. Resolved from `backend` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backends: Option<BackendDrivers>,
    /// Shorthand naming a default driver triple.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backend: String,
}

impl Policy {
    /// Create a policy shell. It will not pass validation until a backend
    /// and sizes are filled in.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            filesystems: default_filesystems(),
            ..Self::default()
        }
    }

    /// The policy name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The named representation, for API responses.
    #[must_use]
    pub fn named(&self) -> NamedPolicy {
        NamedPolicy {
            name: self.name.clone(),
            policy: self.clone(),
        }
    }

    /// The explicit driver triple, resolving the `backend` shorthand when
    /// necessary.
    pub fn resolved_backends(&self) -> VolResult<BackendDrivers> {
        match self.backends {
            Some(ref backends) => Ok(backends.clone()),
            None => backend::default_drivers(&self.backend).ok_or_else(|| {
                VolError::argument_invalid(format!("invalid backend {:?}", self.backend))
            }),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[async_trait]
impl Entity for Policy {
    fn prefix(&self) -> String {
        ROOT_POLICY.to_owned()
    }

    fn path(&self) -> VolResult<String> {
        if self.name.is_empty() {
            return Err(VolError::invalid_db_path("name is blank for this policy"));
        }
        Ok(format!("{ROOT_POLICY}/{}", self.name))
    }

    fn set_key(&mut self, key: &str) -> VolResult<()> {
        let suffix = trim_entity_key(key, ROOT_POLICY);
        if suffix.contains('/') {
            return Err(VolError::invalid_db_path(format!(
                "policy name {suffix:?} contains invalid characters"
            )));
        }
        if suffix.is_empty() {
            return Err(VolError::invalid_db_path("policy name is empty"));
        }
        self.name = suffix.to_owned();
        Ok(())
    }

    fn validate(&self) -> VolResult<()> {
        self.runtime_options.validate_options()?;

        let backends = self.resolved_backends()?;
        if backends.mount.is_empty() {
            return Err(VolError::argument_invalid(format!(
                "mount backend was empty for policy {:?}",
                self.name
            )));
        }

        if !backends.crud.is_empty() {
            let size = self.create_options.actual_size()?;
            if size == 0 {
                return Err(VolError::argument_invalid(format!(
                    "size set to zero for non-empty CRUD backend {:?}",
                    backends.crud
                )));
            }
        }

        Ok(())
    }

    async fn pre_set(&mut self, c: &DbClient) -> VolResult<()> {
        // Persist the resolved triple so stored policies are explicit.
        self.backends = Some(self.resolved_backends()?);

        let mut revision = PolicyRevision {
            policy: self.clone(),
            revision: String::new(),
        };
        c.set(&mut revision).await
    }
}

/// A named policy; used for API responses.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NamedPolicy {
    /// Policy name.
    pub name: String,
    /// The policy body.
    #[serde(flatten)]
    pub policy: Policy,
}

/// One archived revision of a policy, keyed by a nanosecond timestamp.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PolicyRevision {
    /// The archived policy body.
    #[serde(flatten)]
    policy: Policy,
    /// Nanosecond timestamp, derived from the key.
    #[serde(skip)]
    revision: String,
}

impl PolicyRevision {
    /// The archived policy.
    #[must_use]
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// The revision timestamp.
    #[must_use]
    pub fn revision(&self) -> &str {
        &self.revision
    }
}

impl fmt::Display for PolicyRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.policy.name(), self.revision)
    }
}

#[async_trait]
impl Entity for PolicyRevision {
    fn prefix(&self) -> String {
        ROOT_POLICY_REVISION.to_owned()
    }

    fn path(&self) -> VolResult<String> {
        if self.policy.name().is_empty() || self.revision.is_empty() {
            return Err(VolError::invalid_db_path(format!(
                "invalid revision: name or revision was empty: {self}"
            )));
        }
        Ok(format!("{ROOT_POLICY_REVISION}/{self}"))
    }

    /// The single normalization point for revision keys: exactly
    /// `<policy>/<timestamp>` after the prefix.
    fn set_key(&mut self, key: &str) -> VolResult<()> {
        let suffix = trim_entity_key(key, ROOT_POLICY_REVISION);
        let parts: Vec<&str> = suffix.split('/').collect();
        if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(VolError::invalid_db_path(format!(
                "could not validate path {key:?} during policy revision key parse"
            )));
        }
        self.policy.set_key(&format!("{ROOT_POLICY}/{}", parts[0]))?;
        self.revision = parts[1].to_owned();
        Ok(())
    }

    fn validate(&self) -> VolResult<()> {
        Ok(())
    }

    async fn pre_set(&mut self, _c: &DbClient) -> VolResult<()> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        self.revision = stamp.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_actual_size() {
        let parse = |size: &str| CreateOptions {
            size: size.to_owned(),
            filesystem: String::new(),
        };
        assert_eq!(parse("10MB").actual_size().unwrap(), 10);
        assert_eq!(parse("1GB").actual_size().unwrap(), 1000);
        assert_eq!(parse("0").actual_size().unwrap(), 0);
        assert_eq!(parse("10M").actual_size().unwrap(), 10);
        assert!(parse("garbage").actual_size().is_err());
    }

    #[test]
    fn test_set_key_rejections() {
        let mut policy = Policy::default();
        assert!(policy.set_key("policies/a/b").is_err());
        assert!(policy.set_key("policies/").is_err());
        assert!(policy.set_key("policies/fine").is_ok());
        assert_eq!(policy.name(), "fine");
    }

    #[test]
    fn test_validate_crud_needs_size() {
        let mut policy = Policy::new("p");
        policy.backends = Some(BackendDrivers {
            crud: "mock".to_owned(),
            mount: "mock".to_owned(),
            snapshot: "mock".to_owned(),
        });
        policy.create_options.size = "0".to_owned();
        assert!(policy.validate().is_err());

        policy.create_options.size = "10MB".to_owned();
        policy.validate().unwrap();
    }

    #[test]
    fn test_validate_requires_mount_backend() {
        let mut policy = Policy::new("p");
        policy.backends = Some(BackendDrivers::default());
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_shorthand_resolution() {
        let mut policy = Policy::new("p");
        policy.backend = "mock".to_owned();
        let resolved = policy.resolved_backends().unwrap();
        assert_eq!(resolved.mount, "mock");

        policy.backend = "bogus".to_owned();
        assert!(policy.resolved_backends().is_err());
    }

    #[test]
    fn test_revision_set_key_two_components_only() {
        let mut revision = PolicyRevision::default();
        assert!(revision.set_key("policyrevisions/p").is_err());
        assert!(revision.set_key("policyrevisions/p/1/2").is_err());
        revision.set_key("policyrevisions/p/12345").unwrap();
        assert_eq!(revision.policy().name(), "p");
        assert_eq!(revision.revision(), "12345");
    }
}
