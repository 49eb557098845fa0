//! Byte-rate enforcement through the blkio cgroup.
//!
//! Writes `major:minor bps` lines into the throttle files. Failures are the
//! caller's to log; rate limiting never rolls a mount back.

use std::io::Write;
use std::path::Path;

use tracing::debug;

use super::Mount;
use crate::common::error::{Context, VolResult};
use crate::db::RuntimeOptions;

/// Root of the blkio controller.
const BLKIO_ROOT: &str = "/sys/fs/cgroup/blkio";

/// Throttle file for reads.
const READ_BPS_FILE: &str = "blkio.throttle.read_bps_device";

/// Throttle file for writes.
const WRITE_BPS_FILE: &str = "blkio.throttle.write_bps_device";

fn write_limit(root: &Path, file: &str, mount: &Mount, bps: u64) -> VolResult<()> {
    let path = root.join(file);
    let mut handle = std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .with_context(|| format!("could not open {}", path.display()))?;
    let line = format!("{}:{} {bps}", mount.device_major, mount.device_minor);
    handle
        .write_all(line.as_bytes())
        .with_context(|| format!("could not write {line:?} to {}", path.display()))?;
    Ok(())
}

/// Apply the runtime rate limits to a mounted device. A zero rate clears
/// the corresponding limit.
pub fn apply_rate_limit(runtime: &RuntimeOptions, mount: &Mount) -> VolResult<()> {
    apply_rate_limit_at(Path::new(BLKIO_ROOT), runtime, mount)
}

fn apply_rate_limit_at(root: &Path, runtime: &RuntimeOptions, mount: &Mount) -> VolResult<()> {
    debug!(
        "applying rate limits read={} write={} to {}",
        runtime.rate_limit.read_bps, runtime.rate_limit.write_bps, mount.path
    );
    write_limit(root, READ_BPS_FILE, mount, runtime.rate_limit.read_bps)?;
    write_limit(root, WRITE_BPS_FILE, mount, runtime.rate_limit.write_bps)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_writes_throttle_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(READ_BPS_FILE), b"").unwrap();
        std::fs::write(dir.path().join(WRITE_BPS_FILE), b"").unwrap();

        let mount = Mount {
            device_major: 252,
            device_minor: 3,
            path: "/mnt/test/p/v".to_owned(),
            volume: super::super::Volume::default(),
        };
        let mut runtime = RuntimeOptions::default();
        runtime.rate_limit.read_bps = 1000;
        runtime.rate_limit.write_bps = 2000;

        apply_rate_limit_at(dir.path(), &runtime, &mount).unwrap();

        let read = std::fs::read_to_string(dir.path().join(READ_BPS_FILE)).unwrap();
        assert_eq!(read, "252:3 1000");
        let write = std::fs::read_to_string(dir.path().join(WRITE_BPS_FILE)).unwrap();
        assert_eq!(write, "252:3 2000");
    }

    #[test]
    fn test_missing_controller_is_an_error() {
        let mount = Mount::default();
        let runtime = RuntimeOptions::default();
        let missing = Path::new("/nonexistent/blkio");
        assert!(apply_rate_limit_at(missing, &runtime, &mount).is_err());
    }
}
