//! The cluster control plane.
//!
//! HTTP JSON surface over the coordination core: policies, volumes,
//! runtime options, snapshots, and the global configuration. Every
//! mutating operation runs under the lock protocol.

use std::sync::Arc;
use std::time::Duration;

use crate::db::Entity;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tracing::{error, info, warn};

use crate::api::{
    self, create_volume, current_global, fetch_global, rest_error, shared_global, SharedGlobal,
};
use crate::common::error::{VolError, VolResult};
use crate::common::{logger, signals};
use crate::config::ApiserverConfig;
use crate::db::{
    execute_with_multi_lock, DbClient, Global, NamedPolicy, NamedVolume, Policy, RuntimeOptions,
    SnapshotSignal, Use, Volume, VolumeRequest,
};
use crate::storage::{backend, control};

/// The apiserver daemon state.
#[derive(Debug)]
pub struct Daemon {
    /// The record client.
    pub client: DbClient,
    /// The shared global configuration.
    pub global: SharedGlobal,
    /// This host's label; written into lock owners.
    pub hostname: String,
}

/// Handler state alias.
type AppState = State<Arc<Daemon>>;

impl Daemon {
    /// Assemble the daemon.
    #[must_use]
    pub fn new(client: DbClient, hostname: &str, global: Global) -> Arc<Self> {
        Arc::new(Self {
            client,
            global: shared_global(global),
            hostname: hostname.to_owned(),
        })
    }

    /// The current global configuration.
    #[must_use]
    pub fn global(&self) -> Arc<Global> {
        current_global(&self.global)
    }

    /// The apiserver route table.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/global", post(handle_global_upload).get(handle_global))
            .route(
                "/policies/{policy}",
                post(handle_policy_upload)
                    .get(handle_policy)
                    .delete(handle_policy_delete),
            )
            .route("/policies", get(handle_policy_list))
            .route("/volumes/create", post(handle_create))
            .route("/volumes/copy", post(handle_copy))
            .route("/volumes/request", post(handle_request))
            .route("/volumes/remove", delete(handle_remove))
            .route("/volumes/removeforce", delete(handle_remove_force))
            .route("/volumes", get(handle_list_all))
            .route("/volumes/{policy}", get(handle_list))
            .route("/volumes/{policy}/{volume}", get(handle_get))
            .route(
                "/runtime/{policy}/{volume}",
                post(handle_runtime_upload).get(handle_runtime),
            )
            .route(
                "/snapshots/take/{policy}/{volume}",
                post(handle_snapshot_take),
            )
            .route("/snapshots/{policy}/{volume}", get(handle_snapshot_list))
            .route("/uses/mounts/{policy}/{volume}", get(handle_uses_mounts))
            .route(
                "/uses/snapshots/{policy}/{volume}",
                get(handle_uses_snapshots),
            )
            .with_state(self)
    }

    /// Serve the control plane until SIGTERM/SIGINT.
    pub async fn run(self: Arc<Self>, config: &ApiserverConfig) -> VolResult<()> {
        logger::set_debug(self.global().debug);
        api::spawn_global_watch(self.client.clone(), Arc::clone(&self.global)).await;
        signals::spawn_debug_signal();
        signals::spawn_dump_signal(self.client.clone());

        let listener = tokio::net::TcpListener::bind(&config.listen).await?;
        info!("apiserver listening on {}", config.listen);
        axum::serve(listener, Arc::clone(&self).router())
            .with_graceful_shutdown(signals::wait_for_term())
            .await?;
        Ok(())
    }

    /// Build the daemon from its configuration, fetching the global.
    pub async fn from_config(config: &ApiserverConfig) -> VolResult<Arc<Self>> {
        let client = connect_with_retry(&config.store).await;
        let global = fetch_global(&client).await;
        Ok(Self::new(client, &config.store.hostname(), global))
    }
}

fn json_response<T: serde::Serialize>(value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(body) => Json(body).into_response(),
        Err(err) => rest_error(&VolError::marshal_response(err.into())),
    }
}

async fn handle_global_upload(State(daemon): AppState, body: Bytes) -> Response {
    let global: Global = match serde_json::from_slice(&body) {
        Ok(global) => global,
        Err(err) => return rest_error(&VolError::unmarshal_request(err.into())),
    };
    let mut canonical = global.canonical();
    if let Err(err) = daemon.client.set(&mut canonical).await {
        return rest_error(&VolError::publish_global(err));
    }
    Json(serde_json::json!({})).into_response()
}

async fn handle_global(State(daemon): AppState) -> Response {
    json_response(&daemon.global().published())
}

async fn handle_policy_upload(
    State(daemon): AppState,
    Path(policy_name): Path<String>,
    body: Bytes,
) -> Response {
    let mut policy: Policy = match serde_json::from_slice(&body) {
        Ok(policy) => policy,
        Err(err) => return rest_error(&VolError::unmarshal_request(err.into())),
    };
    if let Err(err) = policy.set_key(&format!("policies/{policy_name}")) {
        return rest_error(&err);
    }
    if policy.filesystems.is_empty() {
        policy.filesystems = crate::db::policy::default_filesystems();
    }
    if let Err(err) = daemon.client.set(&mut policy).await {
        return rest_error(&VolError::publish_policy(err));
    }
    Json(serde_json::json!({})).into_response()
}

async fn handle_policy(State(daemon): AppState, Path(policy_name): Path<String>) -> Response {
    let mut policy = Policy::new(&policy_name);
    if let Err(err) = daemon.client.get(&mut policy).await {
        return rest_error(&err);
    }
    json_response(&policy)
}

async fn handle_policy_delete(
    State(daemon): AppState,
    Path(policy_name): Path<String>,
) -> Response {
    let policy = Policy::new(&policy_name);
    if let Err(err) = daemon.client.delete(&policy).await {
        return rest_error(&err);
    }
    Json(serde_json::json!({})).into_response()
}

async fn handle_policy_list(State(daemon): AppState) -> Response {
    let policies = match daemon.client.list(&Policy::default()).await {
        Ok(policies) => policies,
        Err(err) => return rest_error(&err),
    };
    let named: Vec<NamedPolicy> = policies.iter().map(Policy::named).collect();
    json_response(&named)
}

async fn handle_create(State(daemon): AppState, body: Bytes) -> Response {
    let request: VolumeRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return rest_error(&VolError::unmarshal_request(err.into())),
    };

    info!("creating volume {}/{}", request.policy, request.name);
    let global = daemon.global();
    match create_volume(&daemon.client, &global, &daemon.hostname, &request).await {
        Ok(vol) => json_response(&vol),
        Err(err) if err.is_exists() => json_response(&Volume::new(&request.policy, &request.name)),
        Err(err) => rest_error(&VolError::create_volume(err)),
    }
}

async fn handle_request(State(daemon): AppState, body: Bytes) -> Response {
    let request: VolumeRequest = match unmarshal_volume_request(&body) {
        Ok(request) => request,
        Err(err) => return rest_error(&err),
    };
    let mut vol = Volume::new(&request.policy, &request.name);
    if let Err(err) = daemon.client.get(&mut vol).await {
        return rest_error(&err);
    }
    json_response(&vol)
}

async fn handle_list_all(State(daemon): AppState) -> Response {
    match daemon.client.list(&Volume::default()).await {
        Ok(vols) => {
            let named: Vec<NamedVolume> = vols.iter().map(Volume::named).collect();
            json_response(&named)
        }
        Err(err) => rest_error(&err),
    }
}

async fn handle_list(State(daemon): AppState, Path(policy_name): Path<String>) -> Response {
    match daemon
        .client
        .list_prefix(&policy_name, &Volume::default())
        .await
    {
        Ok(vols) => {
            let named: Vec<NamedVolume> = vols.iter().map(Volume::named).collect();
            json_response(&named)
        }
        Err(err) => rest_error(&err),
    }
}

async fn handle_get(
    State(daemon): AppState,
    Path((policy_name, volume_name)): Path<(String, String)>,
) -> Response {
    let mut vol = Volume::new(&policy_name, &volume_name);
    if let Err(err) = daemon.client.get(&mut vol).await {
        return rest_error(&err);
    }
    json_response(&vol)
}

async fn handle_runtime(
    State(daemon): AppState,
    Path((policy_name, volume_name)): Path<(String, String)>,
) -> Response {
    let mut runtime = RuntimeOptions::new(&policy_name, &volume_name);
    if let Err(err) = daemon.client.get(&mut runtime).await {
        return rest_error(&err);
    }
    json_response(&runtime)
}

async fn handle_runtime_upload(
    State(daemon): AppState,
    Path((policy_name, volume_name)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let mut vol = Volume::new(&policy_name, &volume_name);
    if let Err(err) = daemon.client.get(&mut vol).await {
        return rest_error(&err);
    }

    let mut runtime: RuntimeOptions = match serde_json::from_slice(&body) {
        Ok(runtime) => runtime,
        Err(err) => return rest_error(&VolError::unmarshal_request(err.into())),
    };
    runtime.set_names(&policy_name, &volume_name);
    if let Err(err) = daemon.client.set(&mut runtime).await {
        return rest_error(&VolError::publish_runtime(err));
    }
    Json(serde_json::json!({})).into_response()
}

async fn handle_snapshot_take(
    State(daemon): AppState,
    Path((policy_name, volume_name)): Path<(String, String)>,
) -> Response {
    let mut vol = Volume::new(&policy_name, &volume_name);
    if let Err(err) = daemon.client.get(&mut vol).await {
        return rest_error(&err);
    }

    let mut signal = SnapshotSignal::new(&vol);
    if let Err(err) = daemon.client.set(&mut signal).await {
        return rest_error(&VolError::snapshot_failed(err));
    }
    json_response(&signal)
}

async fn handle_snapshot_list(
    State(daemon): AppState,
    Path((policy_name, volume_name)): Path<(String, String)>,
) -> Response {
    let mut vol = Volume::new(&policy_name, &volume_name);
    if let Err(err) = daemon.client.get(&mut vol).await {
        return rest_error(&err);
    }

    let snapshot_backend = vol
        .backends
        .as_ref()
        .map(|b| b.snapshot.clone())
        .unwrap_or_default();
    if snapshot_backend.is_empty() {
        return rest_error(&VolError::SnapshotsUnsupported {
            volume: vol.name(),
            context: vec![],
        });
    }

    let driver = match backend::snapshot_driver(&snapshot_backend) {
        Ok(driver) => driver,
        Err(err) => return rest_error(&err),
    };
    let opts = match vol.to_driver_options(daemon.global().timeout_duration()) {
        Ok(opts) => opts,
        Err(err) => return rest_error(&err),
    };
    match driver.list_snapshots(&opts).await {
        Ok(results) => json_response(&results),
        Err(err) => rest_error(&VolError::list_snapshots(err)),
    }
}

async fn handle_uses_mounts(
    State(daemon): AppState,
    Path((policy_name, volume_name)): Path<(String, String)>,
) -> Response {
    let mut vol = Volume::new(&policy_name, &volume_name);
    if let Err(err) = daemon.client.get(&mut vol).await {
        return rest_error(&err);
    }
    handle_use_endpoint(&daemon, Use::mount_owner(&daemon.hostname, &vol)).await
}

async fn handle_uses_snapshots(
    State(daemon): AppState,
    Path((policy_name, volume_name)): Path<(String, String)>,
) -> Response {
    let mut vol = Volume::new(&policy_name, &volume_name);
    if let Err(err) = daemon.client.get(&mut vol).await {
        return rest_error(&err);
    }
    handle_use_endpoint(&daemon, Use::snapshot_create(&vol)).await
}

/// Report a lock record: the stored holder when the key is present, the
/// constructed record otherwise.
async fn handle_use_endpoint(daemon: &Daemon, lock: Use) -> Response {
    let mut stored = lock.clone();
    match daemon.client.get(&mut stored).await {
        Ok(()) => json_response(&stored),
        Err(err) if err.is_not_exists() => json_response(&lock),
        Err(err) => rest_error(&err),
    }
}

async fn handle_copy(State(daemon): AppState, body: Bytes) -> Response {
    let request: VolumeRequest = match unmarshal_volume_request(&body) {
        Ok(request) => request,
        Err(err) => return rest_error(&err),
    };

    let Some(snapshot) = request.options.get("snapshot").cloned() else {
        return rest_error(&VolError::MissingSnapshotOption { context: vec![] });
    };
    let Some(target) = request.options.get("target").cloned() else {
        return rest_error(&VolError::MissingTargetOption { context: vec![] });
    };
    if target.contains('/') {
        return rest_error(&VolError::invalid_volume(target));
    }

    let mut vol = Volume::new(&request.policy, &request.name);
    if let Err(err) = daemon.client.get(&mut vol).await {
        return rest_error(&err);
    }

    let snapshot_backend = vol
        .backends
        .as_ref()
        .map(|b| b.snapshot.clone())
        .unwrap_or_default();
    if snapshot_backend.is_empty() {
        return rest_error(&VolError::SnapshotsUnsupported {
            volume: vol.name(),
            context: vec![],
        });
    }
    let driver = match backend::snapshot_driver(&snapshot_backend) {
        Ok(driver) => driver,
        Err(err) => return rest_error(&err),
    };

    let mut target_vol = vol.clone();
    target_vol.set_name(&target);

    if vol.name() == target_vol.name() {
        return rest_error(
            &VolError::CannotCopyVolume {
                volume: vol.name(),
                context: vec!["a volume cannot be copied onto itself".to_owned()],
            },
        );
    }

    let global = daemon.global();
    let opts = match vol.to_driver_options(global.timeout_duration()) {
        Ok(opts) => opts,
        Err(err) => return rest_error(&err),
    };

    let locks = [
        Use::snapshot_copy(&vol),
        Use::create_owner(&daemon.hostname, &target_vol),
        Use::snapshot_copy(&target_vol),
    ];

    let client = daemon.client.clone();
    let target_name = target_vol.name();
    let mut published = target_vol.clone();
    let result = execute_with_multi_lock(&client, &locks, global.timeout_duration(), || async {
        client.set(&mut published).await?;
        driver.copy_snapshot(&opts, &snapshot, &target_name).await
    })
    .await;

    match result {
        Ok(()) => json_response(&target_vol),
        Err(err) => rest_error(&VolError::publish_volume(err).add_context(format!(
            "creating new volume {target:?} from volume {:?}, snapshot {snapshot:?}",
            vol.name()
        ))),
    }
}

async fn handle_remove(State(daemon): AppState, body: Bytes) -> Response {
    let request: VolumeRequest = match unmarshal_volume_request(&body) {
        Ok(request) => request,
        Err(err) => return rest_error(&err),
    };

    let mut timeout = daemon.global().timeout_duration();
    if let Some(t) = request.options.get("timeout") {
        match humantime::parse_duration(t) {
            Ok(parsed) => timeout = parsed,
            Err(err) => {
                return rest_error(&VolError::argument_invalid(format!(
                    "could not parse removal timeout {t:?}: {err}"
                )))
            }
        }
    }

    let mut vol = Volume::new(&request.policy, &request.name);
    if let Err(err) = daemon.client.get(&mut vol).await {
        return rest_error(&err);
    }

    let locks = [
        Use::remove_owner(&daemon.hostname, &vol),
        Use::snapshot_remove(&vol),
    ];

    if request.options.get("force").map(String::as_str) == Some("true") {
        if let Err(err) = handle_force_remove(&daemon, &vol, &locks, timeout).await {
            return rest_error(&err);
        }
        return Json(serde_json::json!({})).into_response();
    }

    let client = daemon.client.clone();
    let result = execute_with_multi_lock(&client, &locks, timeout, || async {
        match control::exists_volume(&vol, timeout).await {
            Err(err) if err.is_no_action_taken() => complete_remove(&client, &vol, timeout).await,
            Err(err) => Err(err),
            Ok(false) => {
                remove_record(&client, &vol).await;
                Err(VolError::not_exists(format!(
                    "volume {} no longer exists",
                    vol.name()
                )))
            }
            Ok(true) => complete_remove(&client, &vol, timeout).await,
        }
    })
    .await;

    match result {
        Ok(()) => Json(serde_json::json!({})).into_response(),
        Err(err) if err.is_not_exists() => rest_error(&err),
        Err(err) => rest_error(
            &VolError::remove_volume(err).add_context(vol.name()),
        ),
    }
}

/// Force removal: complete the teardown even when other owners hold the
/// locks, force-freeing each lock after the backend existence check. Lock
/// free failures are logged, never fatal.
async fn handle_force_remove(
    daemon: &Daemon,
    vol: &Volume,
    locks: &[Use],
    timeout: Duration,
) -> VolResult<()> {
    let client = &daemon.client;
    match control::exists_volume(vol, timeout).await {
        Err(err) if err.is_no_action_taken() => {
            complete_remove(client, vol, timeout).await?;
            force_free_locks(client, locks, vol).await;
            Ok(())
        }
        Err(err) => Err(VolError::remove_volume(err).add_context(vol.name())),
        Ok(false) => {
            remove_record(client, vol).await;
            force_free_locks(client, locks, vol).await;
            Err(VolError::not_exists(format!(
                "volume {} no longer exists",
                vol.name()
            )))
        }
        Ok(true) => {
            complete_remove(client, vol, timeout).await?;
            force_free_locks(client, locks, vol).await;
            Ok(())
        }
    }
}

/// Remove the backend artifact (tolerating volumes with nothing to remove)
/// and delete the records.
async fn complete_remove(client: &DbClient, vol: &Volume, timeout: Duration) -> VolResult<()> {
    match control::remove_volume(vol, timeout).await {
        Ok(()) => {}
        Err(err) if err.is_no_action_taken() => {}
        Err(err) => warn!("could not remove backend artifact for {}: {err}", vol.name()),
    }
    client
        .delete(vol)
        .await
        .map_err(|err| VolError::remove_volume(err).add_context(vol.name()))?;
    remove_runtime_record(client, vol).await;
    Ok(())
}

/// Best-effort deletion of the volume record, used on the path where the
/// backend artifact is already gone.
async fn remove_record(client: &DbClient, vol: &Volume) {
    if let Err(err) = client.delete(vol).await {
        warn!("could not delete record for {}: {err}", vol.name());
    }
    remove_runtime_record(client, vol).await;
}

/// The runtime options record rides along with the volume record.
async fn remove_runtime_record(client: &DbClient, vol: &Volume) {
    let runtime = RuntimeOptions::new(vol.policy(), vol.volume());
    if let Err(err) = client.delete(&runtime).await {
        if !err.is_not_exists() {
            warn!("could not delete runtime record for {}: {err}", vol.name());
        }
    }
}

/// Force-free every lock in the set; errors are logged and ignored.
async fn force_free_locks(client: &DbClient, locks: &[Use], vol: &Volume) {
    for lock in locks {
        if let Err(err) = client.free(lock, true).await {
            if !err.is_not_exists() {
                warn!("could not force-free lock for {}: {err}", vol.name());
            }
        }
    }
}

async fn handle_remove_force(State(daemon): AppState, body: Bytes) -> Response {
    let request: VolumeRequest = match unmarshal_volume_request(&body) {
        Ok(request) => request,
        Err(err) => return rest_error(&err),
    };
    let vol = Volume::new(&request.policy, &request.name);
    if let Err(err) = daemon.client.delete(&vol).await {
        if err.is_not_exists() {
            return rest_error(&err);
        }
        return rest_error(
            &VolError::remove_volume(err)
                .add_context(format!("{}/{}", request.policy, request.name)),
        );
    }
    remove_runtime_record(&daemon.client, &vol).await;
    Json(serde_json::json!({})).into_response()
}

/// Decode a volume request body, rejecting blank identifiers.
fn unmarshal_volume_request(body: &[u8]) -> VolResult<VolumeRequest> {
    let request: VolumeRequest =
        serde_json::from_slice(body).map_err(|err| VolError::unmarshal_request(err.into()))?;
    if request.policy.is_empty() {
        return Err(VolError::argument_invalid("policy was blank"));
    }
    if request.name.is_empty() {
        return Err(VolError::argument_invalid("volume was blank"));
    }
    Ok(request)
}

/// Retry store connection until it comes up, the way daemons boot in
/// cluster bring-up order.
pub async fn connect_with_retry(config: &crate::config::StoreConfig) -> DbClient {
    loop {
        match config.new_client().await {
            Ok(client) => return client,
            Err(err) => {
                error!("could not establish client to {:?}: {err}. Retrying.", config.store);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::kv::mem_impl::MemEngine;

    async fn daemon() -> Arc<Daemon> {
        let client = DbClient::new(Arc::new(MemEngine::new()));
        Daemon::new(client, "testhost", Global::new())
    }

    async fn call(
        daemon: &Arc<Daemon>,
        method: &str,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = Arc::clone(daemon).router().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            serde_json::json!(null)
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::json!(null))
        };
        (status, value)
    }

    async fn seed_policy(daemon: &Arc<Daemon>, name: &str) {
        let (status, _) = call(
            daemon,
            "POST",
            &format!("/policies/{name}"),
            serde_json::json!({
                "backend": "mock",
                "create": { "size": "10MB", "filesystem": "ext4" },
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_global_round_trip() {
        let d = daemon().await;
        let (status, _) = call(
            &d,
            "POST",
            "/global",
            serde_json::json!({ "ttl": 60, "timeout": 30, "debug": true }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // the watch may not have fired inside the test router; read the
        // stored record directly
        let mut stored = Global::new();
        d.client.get(&mut stored).await.unwrap();
        assert_eq!(stored.ttl, 60 * crate::db::global::TTL_FIX_BASE);
        assert_eq!(stored.timeout, 30 * crate::db::global::TIMEOUT_FIX_BASE);
        assert!(stored.debug);

        let published = stored.published();
        assert_eq!(published.ttl, 60);
        assert_eq!(published.timeout, 30);
    }

    #[tokio::test]
    async fn test_policy_upload_records_revisions() {
        let d = daemon().await;
        seed_policy(&d, "basic").await;
        seed_policy(&d, "basic").await;

        let revisions = d
            .client
            .list_prefix("basic", &crate::db::PolicyRevision::default())
            .await
            .unwrap();
        assert_eq!(revisions.len(), 2);
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let d = daemon().await;
        seed_policy(&d, "basic").await;

        let (status, _) = call(
            &d,
            "POST",
            "/volumes/create",
            serde_json::json!({ "policy": "basic", "name": "test" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&d, "GET", "/volumes/basic/test", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["create"]["size"], "10MB");

        let (status, _) = call(&d, "GET", "/volumes/basic/missing", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_remove_idempotence() {
        let d = daemon().await;
        seed_policy(&d, "basic").await;
        let (status, _) = call(
            &d,
            "POST",
            "/volumes/create",
            serde_json::json!({ "policy": "basic", "name": "gone" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let request = serde_json::json!({ "policy": "basic", "name": "gone" });
        let (status, _) = call(&d, "DELETE", "/volumes/remove", request.clone()).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&d, "DELETE", "/volumes/remove", request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_remove_of_absent_backend_artifact_deletes_record() {
        let d = daemon().await;
        seed_policy(&d, "basic").await;
        let (status, _) = call(
            &d,
            "POST",
            "/volumes/create",
            serde_json::json!({ "policy": "basic", "name": "halfgone" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // the backend artifact disappears out of band
        let mut vol = Volume::new("basic", "halfgone");
        d.client.get(&mut vol).await.unwrap();
        control::remove_volume(&vol, Duration::from_secs(1))
            .await
            .unwrap();

        let request = serde_json::json!({ "policy": "basic", "name": "halfgone" });
        let (status, _) = call(&d, "DELETE", "/volumes/remove", request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // the record is gone all the same
        let mut check = Volume::new("basic", "halfgone");
        assert!(d.client.get(&mut check).await.unwrap_err().is_not_exists());
    }

    #[tokio::test]
    async fn test_copy_validation() {
        let d = daemon().await;
        seed_policy(&d, "basic").await;
        let (status, _) = call(
            &d,
            "POST",
            "/volumes/create",
            serde_json::json!({ "policy": "basic", "name": "src" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // missing options
        let (status, body) = call(
            &d,
            "POST",
            "/volumes/copy",
            serde_json::json!({ "policy": "basic", "name": "src", "options": {} }),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("snapshot"));

        // source == target
        let (status, body) = call(
            &d,
            "POST",
            "/volumes/copy",
            serde_json::json!({
                "policy": "basic", "name": "src",
                "options": { "snapshot": "snap1", "target": "src" },
            }),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("Cannot copy"));
    }

    #[tokio::test]
    async fn test_runtime_upload_requires_volume() {
        let d = daemon().await;
        let (status, _) = call(
            &d,
            "POST",
            "/runtime/basic/none",
            serde_json::json!({ "snapshots": false }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_snapshot_take_writes_signal() {
        let d = daemon().await;
        seed_policy(&d, "basic").await;
        let (status, _) = call(
            &d,
            "POST",
            "/volumes/create",
            serde_json::json!({ "policy": "basic", "name": "snappy" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            &d,
            "POST",
            "/snapshots/take/basic/snappy",
            serde_json::json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let mut signal = SnapshotSignal::new(&Volume::new("basic", "snappy"));
        d.client.get(&mut signal).await.unwrap();
    }
}
