//! The consul engine.
//!
//! Consul has no streaming watch; reads block on `X-Consul-Index` and the
//! pump diffs each response against the last seen state to synthesize the
//! same event stream the etcd engine produces. TTL leases map onto consul
//! sessions with `Behavior: delete`.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    KvEngine, KvPair, WatchChannels, WatchEvent, WATCH_CHANNEL_CAPACITY, WATCH_ERROR_THROTTLE,
};
use crate::common::error::{Context, VolError, VolResult};

/// How long one blocking read is allowed to sit idle on the server.
const BLOCK_WAIT: &str = "10s";

/// Consul rejects session TTLs below ten seconds.
const MIN_SESSION_TTL_SECS: u64 = 10;

/// One entry of a consul KV read.
#[derive(Debug, Clone, Deserialize)]
struct ConsulKv {
    /// Full key, no leading slash.
    #[serde(rename = "Key")]
    key: String,
    /// Base64 value; null for an empty value.
    #[serde(rename = "Value")]
    value: Option<String>,
    /// Raft index of the last modification.
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
}

impl ConsulKv {
    fn decode_value(&self) -> VolResult<Vec<u8>> {
        match self.value {
            Some(ref encoded) => BASE64.decode(encoded).map_err(|err| {
                VolError::invalid_db_content(format!(
                    "consul returned undecodable value for {}: {err}",
                    self.key
                ))
            }),
            None => Ok(Vec::new()),
        }
    }
}

/// Body of a session create response.
#[derive(Debug, Deserialize)]
struct SessionCreated {
    /// Session UUID.
    #[serde(rename = "ID")]
    id: String,
}

/// Wrap the consul HTTP API to support the `KvEngine` trait.
#[derive(Clone)]
pub struct ConsulEngine {
    /// Shared HTTP client.
    http: reqwest::Client,
    /// Base address, e.g. `http://localhost:8500`.
    address: String,
    /// Keyspace prefix.
    prefix: String,
}

impl Debug for ConsulEngine {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsulEngine")
            .field("address", &self.address)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ConsulEngine {
    /// Create an engine against one consul agent address.
    pub fn new(address: &str, prefix: &str) -> VolResult<Self> {
        let address = if address.starts_with("http") {
            address.trim_end_matches('/').to_owned()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        Ok(Self {
            http: reqwest::Client::new(),
            address,
            prefix: prefix.trim_matches('/').to_owned(),
        })
    }

    /// The consul key for a relative key (consul keys carry no leading
    /// slash).
    fn consul_key(&self, key: &str) -> String {
        if key.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    /// KV endpoint URL for a relative key.
    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.address, self.consul_key(key))
    }

    /// Strip the keyspace prefix off a consul key.
    fn rel_key(prefix: &str, key: &str) -> String {
        key.strip_prefix(prefix)
            .unwrap_or(key)
            .trim_start_matches('/')
            .to_owned()
    }

    /// Read the entries at `key`, or `None` on a 404. Recursive reads scope
    /// with a trailing slash so `volumes` cannot match `volumes-runtime`.
    async fn read(&self, key: &str, recurse: bool) -> VolResult<Option<Vec<ConsulKv>>> {
        let mut url = self.kv_url(key);
        if recurse {
            url.push_str("/?recurse");
        }
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed consul read of {url}"))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let entries: Vec<ConsulKv> = resp
            .error_for_status()
            .with_context(|| format!("consul read of {url} failed"))?
            .json()
            .await
            .with_context(|| format!("failed to decode consul read of {url}"))?;
        Ok(Some(entries))
    }

    /// PUT a key, returning consul's boolean response body.
    async fn put_bool(&self, url: &str, value: &[u8]) -> VolResult<bool> {
        let body = self
            .http
            .put(url)
            .body(value.to_vec())
            .send()
            .await
            .with_context(|| format!("failed consul write of {url}"))?
            .error_for_status()
            .with_context(|| format!("consul write of {url} failed"))?
            .text()
            .await
            .with_context(|| format!("failed to read consul write response for {url}"))?;
        Ok(body.trim() == "true")
    }

    /// Create a session whose deletion tears down every key it holds.
    async fn create_session(&self, ttl: Duration) -> VolResult<String> {
        let ttl_secs = ttl.as_secs().max(MIN_SESSION_TTL_SECS);
        let url = format!("{}/v1/session/create", self.address);
        let created: SessionCreated = self
            .http
            .put(&url)
            .json(&serde_json::json!({
                "TTL": format!("{ttl_secs}s"),
                "Behavior": "delete",
                "LockDelay": "1ms",
            }))
            .send()
            .await
            .with_context(|| "failed to create consul session".to_owned())?
            .error_for_status()
            .with_context(|| "consul session create failed".to_owned())?
            .json()
            .await
            .with_context(|| "failed to decode consul session create".to_owned())?;
        Ok(created.id)
    }

    /// Destroy a session, best-effort.
    async fn destroy_session(&self, session: &str) {
        let url = format!("{}/v1/session/destroy/{session}", self.address);
        if let Err(err) = self.http.put(&url).send().await {
            warn!("failed to destroy consul session {session}: {err}");
        }
    }
}

#[async_trait]
impl KvEngine for ConsulEngine {
    async fn get(&self, key: &str) -> VolResult<Vec<u8>> {
        match self.read(key, false).await? {
            Some(entries) => match entries.first() {
                Some(entry) => entry.decode_value(),
                None => Err(VolError::not_exists(self.consul_key(key))),
            },
            None => Err(VolError::not_exists(self.consul_key(key))),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> VolResult<()> {
        self.put_bool(&self.kv_url(key), value).await.map(|_ok| ())
    }

    async fn create(&self, key: &str, value: &[u8]) -> VolResult<()> {
        let url = format!("{}?cas=0", self.kv_url(key));
        if self.put_bool(&url, value).await? {
            Ok(())
        } else {
            Err(VolError::exists(self.consul_key(key)))
        }
    }

    async fn delete(&self, key: &str) -> VolResult<()> {
        if self.read(key, false).await?.is_none() {
            return Err(VolError::not_exists(self.consul_key(key)));
        }
        let url = self.kv_url(key);
        self.http
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("failed consul delete of {url}"))?
            .error_for_status()
            .with_context(|| format!("consul delete of {url} failed"))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> VolResult<Vec<KvPair>> {
        let entries = self.read(prefix, true).await?.unwrap_or_default();
        let mut result = Vec::with_capacity(entries.len());
        for entry in entries {
            let value = entry.decode_value()?;
            result.push((Self::rel_key(&self.prefix, &entry.key), value));
        }
        Ok(result)
    }

    async fn acquire_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> VolResult<String> {
        let session = self.create_session(ttl).await?;
        let url = format!("{}?acquire={session}", self.kv_url(key));
        if self.put_bool(&url, value).await? {
            Ok(session)
        } else {
            self.destroy_session(&session).await;
            Err(VolError::exists(self.consul_key(key)))
        }
    }

    async fn refresh_lease(&self, lease: &str, _ttl: Duration) -> VolResult<()> {
        let url = format!("{}/v1/session/renew/{lease}", self.address);
        let resp = self
            .http
            .put(&url)
            .send()
            .await
            .with_context(|| format!("failed consul session renew for {lease}"))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(VolError::not_exists(format!("session {lease} expired")));
        }
        resp.error_for_status()
            .with_context(|| format!("consul session renew for {lease} failed"))?;
        Ok(())
    }

    async fn compare_delete(&self, key: &str, expected: &[u8]) -> VolResult<()> {
        let entries = self
            .read(key, false)
            .await?
            .ok_or_else(|| VolError::not_exists(self.consul_key(key)))?;
        let entry = entries
            .first()
            .ok_or_else(|| VolError::not_exists(self.consul_key(key)))?;
        if entry.decode_value()? != expected {
            return Err(VolError::lock_failed(format!(
                "stored value for {} does not match the expected holder",
                self.consul_key(key)
            )));
        }
        let url = format!("{}?cas={}", self.kv_url(key), entry.modify_index);
        let resp = self
            .http
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("failed consul delete of {url}"))?
            .error_for_status()
            .with_context(|| format!("consul delete of {url} failed"))?
            .text()
            .await
            .with_context(|| format!("failed to read consul delete response for {url}"))?;
        if resp.trim() == "true" {
            Ok(())
        } else {
            Err(VolError::lock_failed(format!(
                "lost the compare-delete race for {}",
                self.consul_key(key)
            )))
        }
    }

    async fn watch(
        &self,
        key: &str,
        recursive: bool,
        token: CancellationToken,
    ) -> VolResult<WatchChannels> {
        let (event_tx, event_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);

        let engine = self.clone();
        let key = key.to_owned();

        tokio::spawn(async move {
            let mut index: u64 = 0;
            let mut seen: HashMap<String, u64> = HashMap::new();
            let mut bootstrapped = false;

            loop {
                let mut url = engine.kv_url(&key);
                url.push_str(if recursive { "/?recurse&" } else { "?" });
                url.push_str(&format!("index={index}&wait={BLOCK_WAIT}"));

                let resp = tokio::select! {
                    () = token.cancelled() => break,
                    resp = engine.http.get(&url).send() => resp,
                };

                let resp = match resp {
                    Ok(resp) => resp,
                    Err(err) => {
                        if err_tx.send(VolError::from(err)).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(WATCH_ERROR_THROTTLE).await;
                        continue;
                    }
                };

                let new_index = resp
                    .headers()
                    .get("X-Consul-Index")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);

                // Per the consul contract, an index moving backwards means
                // the view must be rebuilt from scratch.
                if new_index < index {
                    index = 0;
                    continue;
                }

                let entries: Vec<ConsulKv> = if resp.status() == reqwest::StatusCode::NOT_FOUND {
                    Vec::new()
                } else {
                    match resp.json().await {
                        Ok(entries) => entries,
                        Err(err) => {
                            if err_tx.send(VolError::from(err)).await.is_err() {
                                return;
                            }
                            tokio::time::sleep(WATCH_ERROR_THROTTLE).await;
                            continue;
                        }
                    }
                };

                let mut next = HashMap::with_capacity(entries.len());
                for entry in &entries {
                    next.insert(
                        Self::rel_key(&engine.prefix, &entry.key),
                        entry.modify_index,
                    );
                }

                if bootstrapped {
                    for entry in &entries {
                        let rel = Self::rel_key(&engine.prefix, &entry.key);
                        let changed = seen.get(&rel).map_or(true, |old| *old < entry.modify_index);
                        if !changed {
                            continue;
                        }
                        let value = match entry.decode_value() {
                            Ok(value) => value,
                            Err(err) => {
                                if err_tx.send(err).await.is_err() {
                                    return;
                                }
                                continue;
                            }
                        };
                        if event_tx
                            .send(WatchEvent {
                                key: rel,
                                value: Some(value),
                            })
                            .await
                            .is_err()
                        {
                            debug!("consul watch receiver dropped");
                            return;
                        }
                    }
                    for gone in seen.keys().filter(|k| !next.contains_key(*k)) {
                        if event_tx
                            .send(WatchEvent {
                                key: gone.clone(),
                                value: None,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }

                seen = next;
                bootstrapped = true;
                index = new_index;
            }
        });

        Ok((event_rx, err_rx))
    }

    async fn dump(&self) -> VolResult<Vec<KvPair>> {
        self.list("").await
    }
}
