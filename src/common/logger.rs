//! Logger setup.
//!
//! The level filter is kept behind a reload handle so the global
//! configuration watch can flip debug logging on a live daemon.

use once_cell::sync::OnceCell;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Registry;

/// The reload handle for the active level filter.
static RELOAD_HANDLE: OnceCell<reload::Handle<LevelFilter, Registry>> = OnceCell::new();

/// Initialize the logger. Safe to call more than once; only the first call
/// installs the subscriber.
pub fn init_logger(debug: bool) {
    let level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let (filter, handle) = reload::Layer::new(level);

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    if subscriber.try_init().is_ok() {
        let _ = RELOAD_HANDLE.set(handle);
    }
}

/// Switch the log level; invoked whenever the global configuration changes.
pub fn set_debug(debug: bool) {
    let level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    if let Some(handle) = RELOAD_HANDLE.get() {
        if let Err(err) = handle.modify(|filter| *filter = level) {
            tracing::error!("failed to reload log level: {err}");
        } else if debug {
            tracing::debug!("debug logging enabled");
        }
    }
}
