//! Use records: the lock keys of the coordination protocol.
//!
//! Presence of the key is the mutual-exclusion token; the owner and reason
//! stored in the payload are informational. Three prefixes partition the
//! namespace: volume lifecycle locks, snapshot operation locks, and the
//! supervisor singleton.

use core::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{trim_entity_key, Entity, Volume};
use crate::common::error::{VolError, VolResult};

/// Base path for volume lifecycle locks.
pub const ROOT_USE_VOLUME: &str = "users/volume";
/// Base path for snapshot operation locks.
pub const ROOT_USE_SNAPSHOT: &str = "users/snapshots";
/// Key of the supervisor singleton lock.
pub const ROOT_USE_VOLSUPERVISOR: &str = "users/volsupervisor";

/// Which lock namespace a use record lives in. Serialized as the integer
/// tags the wire format has always carried.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum UseKind {
    /// Volume lifecycle lock.
    #[default]
    Volume,
    /// Snapshot operation lock.
    Snapshot,
    /// Supervisor singleton lock.
    Volsupervisor,
}

impl From<UseKind> for u8 {
    fn from(kind: UseKind) -> Self {
        match kind {
            UseKind::Volume => 0,
            UseKind::Snapshot => 1,
            UseKind::Volsupervisor => 2,
        }
    }
}

impl TryFrom<u8> for UseKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Volume),
            1 => Ok(Self::Snapshot),
            2 => Ok(Self::Volsupervisor),
            other => Err(format!("unknown use type {other}")),
        }
    }
}

/// A lock record.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Use {
    /// Qualified volume name; empty for the supervisor lock.
    #[serde(default)]
    volume: String,
    /// Hostname of the holder; empty for snapshot-scoped locks.
    #[serde(rename = "owner", default)]
    owner: String,
    /// Why the lock is held: Create, Remove, Maintenance, Use, or Copy.
    #[serde(rename = "reason", default)]
    reason: String,
    /// Lock namespace.
    #[serde(rename = "type", default)]
    kind: UseKind,
}

impl Use {
    fn build(kind: UseKind, reason: &str, owner: &str, volume: Option<&Volume>) -> Self {
        Self {
            volume: volume.map(Volume::name).unwrap_or_default(),
            owner: owner.to_owned(),
            reason: reason.to_owned(),
            kind,
        }
    }

    /// Lock held while creating a volume.
    #[must_use]
    pub fn create_owner(owner: &str, vol: &Volume) -> Self {
        Self::build(UseKind::Volume, "Create", owner, Some(vol))
    }

    /// Lock held while removing a volume.
    #[must_use]
    pub fn remove_owner(owner: &str, vol: &Volume) -> Self {
        Self::build(UseKind::Volume, "Remove", owner, Some(vol))
    }

    /// Lock held while performing maintenance on a volume.
    #[must_use]
    pub fn maintenance_owner(owner: &str, vol: &Volume) -> Self {
        Self::build(UseKind::Volume, "Maintenance", owner, Some(vol))
    }

    /// Lock held while a volume is mounted. The owner is the hostname.
    #[must_use]
    pub fn mount_owner(owner: &str, vol: &Volume) -> Self {
        Self::build(UseKind::Volume, "Use", owner, Some(vol))
    }

    /// Empty-reason volume lock, for unmarshalling and fine tuning.
    #[must_use]
    pub fn empty_owner(owner: &str, vol: &Volume) -> Self {
        Self::build(UseKind::Volume, "", owner, Some(vol))
    }

    /// Lock held while taking a snapshot.
    #[must_use]
    pub fn snapshot_create(vol: &Volume) -> Self {
        Self::build(UseKind::Snapshot, "Create", "", Some(vol))
    }

    /// Lock held while removing snapshots.
    #[must_use]
    pub fn snapshot_remove(vol: &Volume) -> Self {
        Self::build(UseKind::Snapshot, "Remove", "", Some(vol))
    }

    /// Lock held while copying a snapshot into a new volume.
    #[must_use]
    pub fn snapshot_copy(vol: &Volume) -> Self {
        Self::build(UseKind::Snapshot, "Copy", "", Some(vol))
    }

    /// Lock held during snapshot maintenance.
    #[must_use]
    pub fn snapshot_maintenance(vol: &Volume) -> Self {
        Self::build(UseKind::Snapshot, "Maintenance", "", Some(vol))
    }

    /// Empty snapshot lock, for unmarshalling and fine tuning.
    #[must_use]
    pub fn empty_snapshot(vol: &Volume) -> Self {
        Self::build(UseKind::Snapshot, "", "", Some(vol))
    }

    /// The supervisor singleton lock.
    #[must_use]
    pub fn volsupervisor(owner: &str) -> Self {
        Self::build(UseKind::Volsupervisor, "", owner, None)
    }

    /// The qualified volume name this lock covers.
    #[must_use]
    pub fn volume(&self) -> &str {
        &self.volume
    }

    /// The holder of this lock.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The reason this lock is held.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// The lock namespace.
    #[must_use]
    pub fn kind(&self) -> UseKind {
        self.kind
    }
}

impl fmt::Display for Use {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}: owner: {:?}; reason {:?}",
            self.volume, self.owner, self.reason
        )
    }
}

#[async_trait]
impl Entity for Use {
    fn prefix(&self) -> String {
        match self.kind {
            UseKind::Snapshot => ROOT_USE_SNAPSHOT.to_owned(),
            UseKind::Volsupervisor => ROOT_USE_VOLSUPERVISOR.to_owned(),
            UseKind::Volume => ROOT_USE_VOLUME.to_owned(),
        }
    }

    fn path(&self) -> VolResult<String> {
        self.validate()?;
        if self.kind == UseKind::Volsupervisor {
            return Ok(self.prefix());
        }
        Ok(format!("{}/{}", self.prefix(), self.volume))
    }

    fn set_key(&mut self, key: &str) -> VolResult<()> {
        self.volume = trim_entity_key(key, &self.prefix()).to_owned();
        self.validate()
    }

    fn validate(&self) -> VolResult<()> {
        if self.kind != UseKind::Volsupervisor {
            let parts: Vec<&str> = self.volume.split('/').collect();
            if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
                return Err(VolError::invalid_volume(self.volume.clone()));
            }
        }

        if self.owner.is_empty() && self.kind == UseKind::Volume {
            return Err(VolError::argument_invalid(format!(
                "host label empty during lock acquire of {:?}",
                self.volume
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_prefix_partitioning() {
        let vol = Volume::new("p", "v");
        assert_eq!(
            Use::mount_owner("host", &vol).path().unwrap(),
            "users/volume/p/v"
        );
        assert_eq!(
            Use::snapshot_create(&vol).path().unwrap(),
            "users/snapshots/p/v"
        );
        assert_eq!(
            Use::volsupervisor("host").path().unwrap(),
            "users/volsupervisor"
        );
    }

    #[test]
    fn test_volume_locks_require_owner() {
        let vol = Volume::new("p", "v");
        assert!(Use::empty_owner("", &vol).validate().is_err());
        assert!(Use::mount_owner("host", &vol).validate().is_ok());
        // snapshot locks carry no owner
        assert!(Use::snapshot_create(&vol).validate().is_ok());
    }

    #[test]
    fn test_same_key_collides_regardless_of_reason() {
        let vol = Volume::new("p", "v");
        let create = Use::create_owner("host", &vol);
        let remove = Use::remove_owner("host", &vol);
        // two reasons, one key: the key is the exclusion token
        assert_eq!(create.path().unwrap(), remove.path().unwrap());
        assert_ne!(create, remove);
    }

    #[test]
    fn test_serde_wire_format() {
        let vol = Volume::new("p", "v");
        let lock = Use::snapshot_create(&vol);
        let encoded = serde_json::to_value(&lock).unwrap();
        assert_eq!(encoded["type"], 1);
        assert_eq!(encoded["reason"], "Create");
        assert_eq!(encoded["owner"], "");

        let decoded: Use = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, lock);
    }

    #[test]
    fn test_set_key() {
        let mut lock = Use {
            kind: UseKind::Snapshot,
            ..Use::default()
        };
        lock.set_key("users/snapshots/p/v").unwrap();
        assert_eq!(lock.volume(), "p/v");
        assert!(lock.set_key("users/snapshots/p").is_err());
    }
}
