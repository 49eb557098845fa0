//! The global configuration singleton.
//!
//! Two representations exist: *published* (what operators upload and read
//! back, in seconds and minutes) and *canonical* (what the store holds, in
//! nanoseconds). A single conversion in each direction is applied at the
//! API boundary; the conversion helpers guard against being applied twice.

use core::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{DbClient, Entity, ROOT_GLOBAL};
use crate::common::error::VolResult;

/// Multiplier between published and canonical TTL (published TTLs are in
/// seconds).
pub const TTL_FIX_BASE: u64 = 1_000_000_000;

/// Multiplier between published and canonical timeout (published timeouts
/// are in minutes).
pub const TIMEOUT_FIX_BASE: u64 = 60 * 1_000_000_000;

/// Default lock TTL: 30 seconds, canonical.
pub const DEFAULT_GLOBAL_TTL: u64 = 30 * TTL_FIX_BASE;

/// Default backend operation timeout: 10 minutes, canonical.
pub const DEFAULT_TIMEOUT: u64 = 10 * TIMEOUT_FIX_BASE;

/// Default base directory for mount points.
pub const DEFAULT_MOUNT_PATH: &str = "/mnt/volstack";

/// The global configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Global {
    /// Debug logging switch, applied live through the global watch.
    pub debug: bool,
    /// Backend operation timeout, canonical nanoseconds.
    pub timeout: u64,
    /// Lock lease TTL, canonical nanoseconds.
    pub ttl: u64,
    /// Base directory for mount points.
    pub mount_path: String,
}

impl Default for Global {
    fn default() -> Self {
        Self::new()
    }
}

impl Global {
    /// Construct a global with defaults applied.
    #[must_use]
    pub fn new() -> Self {
        let mut global = Self {
            debug: false,
            timeout: 0,
            ttl: 0,
            mount_path: String::new(),
        };
        global.prep();
        global
    }

    /// Apply defaults: any value below its fix base is replaced.
    fn prep(&mut self) {
        if self.mount_path.is_empty() {
            self.mount_path = DEFAULT_MOUNT_PATH.to_owned();
        }
        if self.ttl < TTL_FIX_BASE {
            self.ttl = DEFAULT_GLOBAL_TTL;
        }
        if self.timeout < TIMEOUT_FIX_BASE {
            self.timeout = DEFAULT_TIMEOUT;
        }
    }

    /// The published representation: divided back down for operators. Do
    /// not run this twice against the same data.
    #[must_use]
    pub fn published(&self) -> Self {
        let mut published = self.clone();
        published.ttl /= TTL_FIX_BASE;
        published.timeout /= TIMEOUT_FIX_BASE;
        published
    }

    /// The canonical (internal) representation: multiplied up from the
    /// published form. Values already at or above their base are left
    /// alone, so a canonical global passes through unchanged.
    #[must_use]
    pub fn canonical(&self) -> Self {
        let mut canonical = self.clone();
        if canonical.ttl < TTL_FIX_BASE {
            canonical.ttl *= TTL_FIX_BASE;
        }
        if canonical.timeout < TIMEOUT_FIX_BASE {
            canonical.timeout *= TIMEOUT_FIX_BASE;
        }
        canonical
    }

    /// The lock TTL as a duration.
    #[must_use]
    pub fn ttl_duration(&self) -> Duration {
        Duration::from_nanos(self.ttl)
    }

    /// The operation timeout as a duration.
    #[must_use]
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_nanos(self.timeout)
    }
}

impl fmt::Display for Global {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ROOT_GLOBAL}")
    }
}

#[async_trait]
impl Entity for Global {
    fn prefix(&self) -> String {
        String::new()
    }

    fn path(&self) -> VolResult<String> {
        Ok(ROOT_GLOBAL.to_owned())
    }

    fn set_key(&mut self, _key: &str) -> VolResult<()> {
        Ok(())
    }

    fn validate(&self) -> VolResult<()> {
        Ok(())
    }

    async fn pre_set(&mut self, _c: &DbClient) -> VolResult<()> {
        self.prep();
        Ok(())
    }

    async fn post_get(&mut self, _c: &DbClient) -> VolResult<()> {
        self.prep();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_published_inverts_canonical() {
        let operator = Global {
            debug: true,
            ttl: 60,
            timeout: 30,
            mount_path: "/mnt/test".to_owned(),
        };
        let round_tripped = operator.canonical().published();
        assert_eq!(round_tripped, operator);
    }

    #[test]
    fn test_canonical_is_idempotent_on_canonical_input() {
        let canonical = Global {
            debug: false,
            ttl: 60 * TTL_FIX_BASE,
            timeout: 30 * TIMEOUT_FIX_BASE,
            mount_path: "/mnt/test".to_owned(),
        };
        assert_eq!(canonical.canonical(), canonical);
    }

    #[test]
    fn test_defaults_replace_sub_threshold_values() {
        let mut global = Global {
            debug: false,
            ttl: 3,
            timeout: 2,
            mount_path: String::new(),
        };
        global.prep();
        assert_eq!(global.ttl, DEFAULT_GLOBAL_TTL);
        assert_eq!(global.timeout, DEFAULT_TIMEOUT);
        assert_eq!(global.mount_path, DEFAULT_MOUNT_PATH);
    }

    #[test]
    fn test_durations() {
        let global = Global::new();
        assert_eq!(global.ttl_duration(), Duration::from_secs(30));
        assert_eq!(global.timeout_duration(), Duration::from_secs(600));
    }
}
