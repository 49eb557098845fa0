//! `volstack`: cluster-wide volume management for containerized workloads.
//!
//! Three daemon roles share this crate: the apiserver (cluster control
//! plane), the per-host mount plugin, and the snapshot supervisor. They
//! coordinate exclusively through a consistent KV store — locks are
//! create-if-absent keys, long-held locks carry TTL leases with background
//! refresh, and configuration changes fan out over watches.

#![deny(
    anonymous_parameters,
    bare_trait_objects,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

pub mod api;
pub mod apiserver;
pub mod common;
pub mod config;
pub mod db;
pub mod kv;
pub mod plugin;
pub mod storage;
pub mod supervisor;

pub use common::error::{VolError, VolResult};
