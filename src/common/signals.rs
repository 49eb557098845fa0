//! Operator signal handling.
//!
//! SIGUSR1 logs runtime diagnostics, SIGUSR2 dumps the configured keyspace
//! to a tarball under `$TMPDIR`, and SIGTERM/SIGINT resolve the shutdown
//! future each daemon waits on.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use crate::common::error::{Context, VolResult};
use crate::db::DbClient;

/// Spawn the SIGUSR1 handler: log runtime diagnostics on demand.
pub fn spawn_debug_signal() {
    tokio::spawn(async move {
        let mut stream = match signal(SignalKind::user_defined1()) {
            Ok(stream) => stream,
            Err(err) => {
                error!("could not install SIGUSR1 handler: {err}");
                return;
            }
        };
        let started = SystemTime::now();
        while stream.recv().await.is_some() {
            let uptime = started.elapsed().unwrap_or_default();
            info!(
                pid = std::process::id(),
                uptime_secs = uptime.as_secs(),
                "received SIGUSR1; daemon is alive"
            );
        }
    });
}

/// Spawn the SIGUSR2 handler: dump the keyspace to a tarball.
pub fn spawn_dump_signal(client: DbClient) {
    tokio::spawn(async move {
        let mut stream = match signal(SignalKind::user_defined2()) {
            Ok(stream) => stream,
            Err(err) => {
                error!("could not install SIGUSR2 handler: {err}");
                return;
            }
        };
        while stream.recv().await.is_some() {
            match dump_tarball(&client).await {
                Ok(path) => info!("dumped keyspace to {}", path.display()),
                Err(err) => error!("failed to dump keyspace: {err}"),
            }
        }
    });
}

/// Write every key under the configured prefix into a gzipped tarball in
/// `$TMPDIR`. Returns the path to the archive.
pub async fn dump_tarball(client: &DbClient) -> VolResult<PathBuf> {
    let entries = client.dump().await?;

    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let path = std::env::temp_dir().join(format!("volstack-debug-{stamp}.tar.gz"));

    let file = std::fs::File::create(&path)
        .with_context(|| format!("could not create dump file {}", path.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut archive = tar::Builder::new(encoder);

    for (key, value) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(value.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        archive
            .append_data(&mut header, &key, value.as_slice())
            .with_context(|| format!("could not append {key} to dump"))?;
    }

    let encoder = archive
        .into_inner()
        .add_context("could not finish dump archive")?;
    encoder.finish().add_context("could not flush dump archive")?;
    Ok(path)
}

/// Resolve when SIGTERM or SIGINT arrives.
pub async fn wait_for_term() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            error!("could not install SIGTERM handler: {err}");
            std::future::pending::<()>().await;
            return;
        }
    };
    let mut int = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(err) => {
            error!("could not install SIGINT handler: {err}");
            std::future::pending::<()>().await;
            return;
        }
    };
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}
