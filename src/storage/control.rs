//! Policy-aware wrappers over the CRUD drivers.
//!
//! Volumes whose policy carries no CRUD backend (network filesystems) have
//! nothing to provision; every entry point here reports that with the
//! `NoActionTaken` sentinel so callers can skip the step in-band.

use std::time::Duration;

use super::{backend, DriverOptions};
use crate::common::error::{VolError, VolResult};
use crate::db::Volume;

/// The CRUD backend name of a volume, or `NoActionTaken` when it has none.
fn crud_backend(vol: &Volume) -> VolResult<String> {
    let backends = vol
        .backends
        .as_ref()
        .ok_or_else(|| VolError::invalid_volume(vol.name()))?;
    if backends.crud.is_empty() {
        return Err(VolError::NoActionTaken);
    }
    Ok(backends.crud.clone())
}

/// Provision the backend artifact for a volume. Returns the driver options
/// used, for the follow-up format call.
pub async fn create_volume(vol: &Volume, timeout: Duration) -> VolResult<DriverOptions> {
    let driver = backend::crud_driver(&crud_backend(vol)?)?;
    let opts = vol.to_driver_options(timeout)?;
    driver.create(&opts).await?;
    Ok(opts)
}

/// Format a freshly provisioned volume.
pub async fn format_volume(vol: &Volume, opts: &DriverOptions) -> VolResult<()> {
    let driver = backend::crud_driver(&crud_backend(vol)?)?;
    driver.format(opts).await
}

/// Whether the backend artifact for a volume exists.
pub async fn exists_volume(vol: &Volume, timeout: Duration) -> VolResult<bool> {
    let driver = backend::crud_driver(&crud_backend(vol)?)?;
    let opts = vol.to_driver_options(timeout)?;
    driver.exists(&opts).await
}

/// Tear down the backend artifact for a volume.
pub async fn remove_volume(vol: &Volume, timeout: Duration) -> VolResult<()> {
    let driver = backend::crud_driver(&crud_backend(vol)?)?;
    let opts = vol.to_driver_options(timeout)?;
    driver.remove(&opts).await
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;
    use crate::db::{policy::BackendDrivers, volume};
    use crate::db::Policy;

    #[tokio::test]
    async fn test_crudless_volume_is_no_action() {
        let mut policy = Policy::new("nfs");
        policy.backends = Some(BackendDrivers {
            crud: String::new(),
            mount: "nfs".to_owned(),
            snapshot: String::new(),
        });
        let mut opts = HashMap::new();
        opts.insert("mount".to_owned(), "localhost:/mnt".to_owned());
        let vol = volume::create(&policy, "test", &opts).unwrap();

        let err = create_volume(&vol, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_no_action_taken());
        let err = exists_volume(&vol, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_no_action_taken());
    }

    #[tokio::test]
    async fn test_create_then_recreate_reports_no_action() {
        let mut policy = Policy::new("basic");
        policy.backend = "mock".to_owned();
        policy.create_options.size = "10MB".to_owned();
        let vol = volume::create(&policy, "ctl-test", &HashMap::new()).unwrap();

        create_volume(&vol, Duration::from_secs(1)).await.unwrap();
        let err = create_volume(&vol, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_no_action_taken());
        assert!(exists_volume(&vol, Duration::from_secs(1)).await.unwrap());

        remove_volume(&vol, Duration::from_secs(1)).await.unwrap();
        assert!(!exists_volume(&vol, Duration::from_secs(1)).await.unwrap());
    }
}
