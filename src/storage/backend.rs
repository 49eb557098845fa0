//! The driver registry.
//!
//! Drivers are resolved by the name stored in a policy's backend triple.
//! The `mock` driver is the only one that lives in this tree; block and
//! network filesystem drivers (`ceph`, `nfs`) ship separately, so their
//! names resolve in the shorthand table but fail driver lookup here.

use std::sync::Arc;

use once_cell::sync::Lazy;

use super::mock::{MockDriver, MockState};
use super::{CrudDriver, MountDriver, SnapshotDriver};
use crate::common::error::{VolError, VolResult};
use crate::db::BackendDrivers;

/// Process-wide mock backend state.
static MOCK_STATE: Lazy<Arc<MockState>> = Lazy::new(|| Arc::new(MockState::default()));

/// The process-wide mock state, for tests that assert on backend effects.
#[must_use]
pub fn mock_state() -> Arc<MockState> {
    Arc::clone(&MOCK_STATE)
}

/// Resolve a backend shorthand to its driver triple.
#[must_use]
pub fn default_drivers(name: &str) -> Option<BackendDrivers> {
    match name {
        "mock" => Some(BackendDrivers {
            crud: "mock".to_owned(),
            mount: "mock".to_owned(),
            snapshot: "mock".to_owned(),
        }),
        "ceph" => Some(BackendDrivers {
            crud: "ceph".to_owned(),
            mount: "ceph".to_owned(),
            snapshot: "ceph".to_owned(),
        }),
        "nfs" => Some(BackendDrivers {
            crud: String::new(),
            mount: "nfs".to_owned(),
            snapshot: String::new(),
        }),
        _ => None,
    }
}

/// Resolve a CRUD driver by name.
pub fn crud_driver(name: &str) -> VolResult<Arc<dyn CrudDriver>> {
    match name {
        "mock" => Ok(Arc::new(MockDriver::new(mock_state(), ""))),
        _ => Err(VolError::get_driver(name)),
    }
}

/// Resolve a mount driver by name. Mount paths are computed under
/// `mount_path`, the base directory from the global configuration.
pub fn mount_driver(name: &str, mount_path: &str) -> VolResult<Arc<dyn MountDriver>> {
    match name {
        "mock" => Ok(Arc::new(MockDriver::new(mock_state(), mount_path))),
        _ => Err(VolError::get_driver(name)),
    }
}

/// Resolve a snapshot driver by name.
pub fn snapshot_driver(name: &str) -> VolResult<Arc<dyn SnapshotDriver>> {
    match name {
        "mock" => Ok(Arc::new(MockDriver::new(mock_state(), ""))),
        _ => Err(VolError::get_driver(name)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_shorthand_table() {
        assert!(default_drivers("mock").is_some());
        let nfs = default_drivers("nfs").unwrap();
        assert!(nfs.crud.is_empty());
        assert_eq!(nfs.mount, "nfs");
        assert!(default_drivers("bogus").is_none());
    }

    #[test]
    fn test_unknown_driver_lookup() {
        assert!(matches!(
            crud_driver("ceph"),
            Err(VolError::GetDriver { .. })
        ));
        assert!(crud_driver("mock").is_ok());
    }
}
