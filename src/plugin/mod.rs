//! The per-host mount agent.
//!
//! Speaks the docker volume-driver convention over a unix socket under
//! `/run/docker/plugins` and runs the host-side mount state machine in
//! [`crate::api::Api`]. A process-wide watch on the runtime-options prefix
//! applies rate-limit changes to live mounts.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::api::{self, fetch_global, rest_error, shared_global, Api};
use crate::common::error::{VolError, VolResult};
use crate::common::{logger, signals};
use crate::config::PluginConfig;
use crate::db::{Volume, VolumeRequest};
use crate::storage;

mod runtime;

/// Where docker looks for plugin sockets.
pub const BASE_PATH: &str = "/run/docker/plugins";

/// A docker volume-driver request body.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PluginRequest {
    /// Qualified volume name, `<policy>/<volume>`.
    #[serde(rename = "Name", default)]
    pub name: String,
    /// Flat creation options.
    #[serde(rename = "Opts", default)]
    pub opts: Option<HashMap<String, String>>,
}

/// The mountpoint-bearing response shared by mount, unmount, and path.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VolumeResponse {
    /// Where the volume is (or would be) mounted.
    #[serde(rename = "Mountpoint")]
    pub mountpoint: String,
    /// Error string, empty on success.
    #[serde(rename = "Err")]
    pub err: String,
}

/// One entry of a list or get response.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PluginVolume {
    /// Qualified volume name.
    #[serde(rename = "Name")]
    pub name: String,
    /// Where the volume is mounted.
    #[serde(rename = "Mountpoint")]
    pub mountpoint: String,
}

/// The mount agent daemon.
#[derive(Debug)]
pub struct Daemon {
    /// Shared plugin state.
    pub api: Arc<Api>,
    /// Socket name under [`BASE_PATH`].
    pub plugin_name: String,
}

impl Daemon {
    /// Build the daemon from its configuration.
    pub async fn from_config(config: &PluginConfig) -> VolResult<Self> {
        if config.plugin_name.is_empty()
            || config.plugin_name.contains('/')
            || config.plugin_name.contains('.')
        {
            return Err(VolError::argument_invalid(
                "socket name contains empty value or invalid characters",
            ));
        }

        let client = crate::apiserver::connect_with_retry(&config.store).await;
        let global = fetch_global(&client).await;
        let api = Arc::new(Api::new(
            client,
            &config.store.hostname(),
            shared_global(global),
        ));
        Ok(Self {
            api,
            plugin_name: config.plugin_name.clone(),
        })
    }

    /// The docker volume-driver route table. `/remove` is aliased to the
    /// path handler; removal happens through the cluster API.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/Plugin.Activate", post(handle_activate))
            .route("/create", post(handle_create))
            .route("/remove", post(handle_path))
            .route("/path", post(handle_path))
            .route("/get", post(handle_get))
            .route("/list", post(handle_list))
            .route("/mount", post(handle_mount))
            .route("/unmount", post(handle_unmount))
            .fallback(handle_action)
            .with_state(Arc::clone(&self.api))
    }

    /// The socket path for this plugin.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(BASE_PATH).join(format!("{}.sock", self.plugin_name))
    }

    /// Serve the plugin until SIGTERM/SIGINT.
    pub async fn run(self) -> VolResult<()> {
        logger::set_debug(self.api.global().debug);
        api::spawn_global_watch(self.api.client.clone(), Arc::clone(&self.api.global)).await;
        signals::spawn_debug_signal();
        signals::spawn_dump_signal(self.api.client.clone());

        self.api.update_mounts().await?;
        tokio::spawn(runtime::poll_runtime(Arc::clone(&self.api)));

        let socket = self.socket_path();
        if let Err(err) = std::fs::remove_file(&socket) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(err.into());
            }
        }
        std::fs::create_dir_all(BASE_PATH)?;

        let listener = tokio::net::UnixListener::bind(&socket)?;
        info!("plugin listening on {}", socket.display());
        axum::serve(listener, self.router())
            .with_graceful_shutdown(signals::wait_for_term())
            .await?;

        std::fs::remove_file(&socket)?;
        Ok(())
    }
}

fn decode_request(body: &Bytes) -> VolResult<PluginRequest> {
    let request: PluginRequest =
        serde_json::from_slice(body).map_err(|err| VolError::unmarshal_request(err.into()))?;
    if request.name.is_empty() {
        return Err(VolError::argument_invalid("volume name was empty"));
    }
    Ok(request)
}

/// On `NotExists`, docker expects an empty JSON object rather than an
/// error from the path and get endpoints.
fn path_error(err: &VolError) -> Response {
    if err.is_not_exists() {
        return Json(serde_json::json!({})).into_response();
    }
    rest_error(err)
}

async fn handle_activate() -> Response {
    Json(serde_json::json!({ "Implements": ["VolumeDriver"] })).into_response()
}

async fn handle_create(State(api): State<Arc<Api>>, body: Bytes) -> Response {
    let request = match decode_request(&body) {
        Ok(request) => request,
        Err(err) => return rest_error(&err),
    };
    let (policy, name) = match storage::split_name(&request.name) {
        Ok(split) => split,
        Err(err) => return rest_error(&err),
    };

    let volume_request = VolumeRequest {
        policy,
        name,
        options: request.opts.unwrap_or_default(),
    };

    info!("creating volume {}", request.name);
    let global = api.global();
    match api::create_volume(&api.client, &global, &api.hostname, &volume_request).await {
        Ok(_) => Json(serde_json::json!({ "Err": "" })).into_response(),
        // docker retries create liberally; an existing volume is success
        Err(err) if err.is_exists() => Json(serde_json::json!({ "Err": "" })).into_response(),
        Err(err) => rest_error(&VolError::create_volume(err)),
    }
}

async fn handle_path(State(api): State<Arc<Api>>, body: Bytes) -> Response {
    let request = match decode_request(&body) {
        Ok(request) => request,
        Err(err) => return rest_error(&err),
    };
    debug!("returning mount path to docker for volume {:?}", request.name);
    match api.path(&request.name).await {
        Ok(path) => Json(VolumeResponse {
            mountpoint: path,
            err: String::new(),
        })
        .into_response(),
        Err(err) => path_error(&err),
    }
}

async fn handle_get(State(api): State<Arc<Api>>, body: Bytes) -> Response {
    let request = match decode_request(&body) {
        Ok(request) => request,
        Err(err) => return rest_error(&err),
    };
    match api.path(&request.name).await {
        Ok(path) => Json(serde_json::json!({
            "Volume": PluginVolume { name: request.name, mountpoint: path },
            "Err": "",
        }))
        .into_response(),
        Err(err) => path_error(&err),
    }
}

async fn handle_list(State(api): State<Arc<Api>>) -> Response {
    match api.client.list(&Volume::default()).await {
        Ok(vols) => {
            let volumes: Vec<PluginVolume> = vols
                .iter()
                .map(|vol| PluginVolume {
                    name: vol.name(),
                    mountpoint: api
                        .mounts
                        .get(&vol.name())
                        .map(|m| m.path)
                        .unwrap_or_default(),
                })
                .collect();
            Json(serde_json::json!({ "Volumes": volumes, "Err": "" })).into_response()
        }
        Err(err) => rest_error(&err),
    }
}

async fn handle_mount(State(api): State<Arc<Api>>, body: Bytes) -> Response {
    let request = match decode_request(&body) {
        Ok(request) => request,
        Err(err) => return rest_error(&err),
    };
    info!("mounting volume {:?}", request.name);
    match api.mount(&request.name).await {
        Ok(path) => Json(VolumeResponse {
            mountpoint: path,
            err: String::new(),
        })
        .into_response(),
        Err(err) => rest_error(&err),
    }
}

async fn handle_unmount(State(api): State<Arc<Api>>, body: Bytes) -> Response {
    let request = match decode_request(&body) {
        Ok(request) => request,
        Err(err) => return rest_error(&err),
    };
    info!("unmounting volume {:?}", request.name);
    match api.unmount(&request.name).await {
        Ok(path) => Json(VolumeResponse {
            mountpoint: path,
            err: String::new(),
        })
        .into_response(),
        Err(err) => rest_error(&err),
    }
}

/// Catchall for additional driver functions.
async fn handle_action(body: Bytes) -> Response {
    warn!("unknown driver action; body: {:?}", String::from_utf8_lossy(&body));
    StatusCode::SERVICE_UNAVAILABLE.into_response()
}

#[cfg(test)]
mod test {
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::db::{DbClient, Global, Policy};
    use crate::kv::mem_impl::MemEngine;

    async fn plugin() -> Daemon {
        let client = DbClient::new(Arc::new(MemEngine::new()));
        let mut policy = Policy::new("basic");
        policy.backend = "mock".to_owned();
        policy.create_options.size = "10MB".to_owned();
        client.set(&mut policy).await.unwrap();

        let api = Arc::new(Api::new(
            client,
            "pluginhost",
            shared_global(Global::new()),
        ));
        Daemon {
            api,
            plugin_name: "volstack".to_owned(),
        }
    }

    async fn call(
        daemon: &Daemon,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = daemon.router().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::json!(null));
        (status, value)
    }

    #[tokio::test]
    async fn test_activate() {
        let daemon = plugin().await;
        let (status, body) = call(&daemon, "/Plugin.Activate", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["Implements"][0], "VolumeDriver");
    }

    #[tokio::test]
    async fn test_create_mount_unmount_flow() {
        let daemon = plugin().await;

        let (status, _) = call(
            &daemon,
            "/create",
            serde_json::json!({ "Name": "basic/plugvol" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // duplicate create is success
        let (status, _) = call(
            &daemon,
            "/create",
            serde_json::json!({ "Name": "basic/plugvol" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &daemon,
            "/mount",
            serde_json::json!({ "Name": "basic/plugvol" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["Mountpoint"], "/mnt/volstack/basic/plugvol");

        let (status, body) = call(
            &daemon,
            "/unmount",
            serde_json::json!({ "Name": "basic/plugvol" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["Mountpoint"], "/mnt/volstack/basic/plugvol");
    }

    #[tokio::test]
    async fn test_path_of_missing_volume_is_empty_object() {
        let daemon = plugin().await;
        let (status, body) = call(
            &daemon,
            "/path",
            serde_json::json!({ "Name": "basic/absent" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_malformed_name_is_an_error() {
        let daemon = plugin().await;
        let (status, _) = call(&daemon, "/mount", serde_json::json!({ "Name": "nopolicy" })).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_unknown_action_is_unavailable() {
        let daemon = plugin().await;
        let (status, _) = call(&daemon, "/bogus", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
