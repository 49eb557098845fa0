//! The runtime-options watch.
//!
//! Rate-limit and snapshot knobs can change while a volume is mounted;
//! this loop applies rate-limit changes to the mounts this host holds.
//! Volumes mounted elsewhere produce events too and are skipped.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::api::Api;
use crate::db::RuntimeOptions;
use crate::storage::cgroup;

/// Watch the runtime-options prefix forever, reapplying cgroup limits to
/// live mounts. Watch errors are logged and never end the loop.
pub async fn poll_runtime(api: Arc<Api>) {
    let (mut events, mut errors) = match api.client.watch_prefix(&RuntimeOptions::default()).await {
        Ok(channels) => channels,
        Err(err) => {
            error!("failed to establish watch for runtime options: {err}");
            return;
        }
    };

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(runtime) => {
                    let name = format!("{}/{}", runtime.policy(), runtime.volume());
                    let Some(mount) = api.mounts.get(&name) else {
                        // mounted on a different host, or not at all
                        debug!("volume {name:?} has no mount here; skipping runtime update");
                        continue;
                    };
                    info!("adjusting runtime parameters for volume {name:?}");
                    if let Err(err) = cgroup::apply_rate_limit(&runtime, &mount) {
                        error!("error processing runtime update for volume {name:?}: {err}");
                    }
                }
                None => break,
            },
            err = errors.recv() => match err {
                Some(err) => error!("failed watch for runtime options: {err}"),
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::api::shared_global;
    use crate::db::{DbClient, Global};
    use crate::kv::mem_impl::MemEngine;

    #[tokio::test]
    async fn test_skips_volumes_not_mounted_here() {
        let client = DbClient::new(Arc::new(MemEngine::new()));
        let api = Arc::new(Api::new(
            client.clone(),
            "host1",
            shared_global(Global::new()),
        ));

        tokio::spawn(poll_runtime(Arc::clone(&api)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // an update for a volume with no local mount must be ignored
        let mut runtime = RuntimeOptions::new("basic", "remote");
        runtime.rate_limit.read_bps = 1000;
        client.set(&mut runtime).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(api.mounts.get("basic/remote").is_none());
    }
}
