//! Snapshot signals.
//!
//! Writing one of these tells the supervisor to snapshot the named volume
//! immediately; the supervisor deletes the record after dispatch.

use core::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{trim_entity_key, Entity, Volume, ROOT_SNAPSHOTS};
use crate::common::error::{VolError, VolResult};

/// An ephemeral snapshot request marker.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SnapshotSignal {
    /// Qualified volume name; lives in the key, not the payload.
    #[serde(skip)]
    volume: String,
}

impl SnapshotSignal {
    /// A signal for one volume.
    #[must_use]
    pub fn new(vol: &Volume) -> Self {
        Self { volume: vol.name() }
    }

    /// The qualified volume name to snapshot.
    #[must_use]
    pub fn volume(&self) -> &str {
        &self.volume
    }
}

impl fmt::Display for SnapshotSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.volume)
    }
}

#[async_trait]
impl Entity for SnapshotSignal {
    fn prefix(&self) -> String {
        ROOT_SNAPSHOTS.to_owned()
    }

    fn path(&self) -> VolResult<String> {
        self.validate()?;
        Ok(format!("{ROOT_SNAPSHOTS}/{}", self.volume))
    }

    fn set_key(&mut self, key: &str) -> VolResult<()> {
        self.volume = trim_entity_key(key, ROOT_SNAPSHOTS).to_owned();
        self.validate()
    }

    fn validate(&self) -> VolResult<()> {
        let parts: Vec<&str> = self.volume.split('/').collect();
        if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(VolError::invalid_volume(self.volume.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_path_and_set_key() {
        let vol = Volume::new("basic", "test");
        let signal = SnapshotSignal::new(&vol);
        assert_eq!(signal.path().unwrap(), "snapshots/basic/test");

        let mut parsed = SnapshotSignal::default();
        parsed.set_key("snapshots/basic/test").unwrap();
        assert_eq!(parsed, signal);
        assert!(parsed.set_key("snapshots/basic").is_err());
    }
}
