//! The etcd v3 engine.
//!
//! Create-if-absent is a transaction on `create_revision == 0`; TTL leases
//! map onto etcd leases with explicit keep-alive rounds.

use std::fmt;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp, WatchOptions,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{
    join_prefix, strip_prefix, KvEngine, KvPair, WatchChannels, WatchEvent,
    WATCH_CHANNEL_CAPACITY, WATCH_ERROR_THROTTLE,
};
use crate::common::error::{Context, VolError, VolResult};

/// Wrap the etcd client to support the `KvEngine` trait.
#[derive(Clone)]
pub struct EtcdEngine {
    /// The etcd client.
    client: etcd_client::Client,
    /// Keyspace prefix.
    prefix: String,
}

impl Debug for EtcdEngine {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdEngine")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl EtcdEngine {
    /// Connect to an etcd cluster.
    pub async fn new(endpoints: Vec<String>, prefix: &str) -> VolResult<Self> {
        let client = etcd_client::Client::connect(endpoints.clone(), None)
            .await
            .with_context(|| format!("failed to connect to etcd at {endpoints:?}"))?;
        Ok(Self {
            client,
            prefix: prefix.trim_matches('/').to_owned(),
        })
    }

    /// Convert a TTL to whole seconds, flooring at one second (etcd rejects
    /// zero-second leases).
    fn ttl_secs(ttl: Duration) -> i64 {
        i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX)
    }
}

#[async_trait]
impl KvEngine for EtcdEngine {
    async fn get(&self, key: &str) -> VolResult<Vec<u8>> {
        let abs = join_prefix(&self.prefix, key);
        let mut client = self.client.clone();
        let resp = client
            .get(abs.as_str(), None)
            .await
            .with_context(|| format!("failed to get {abs} from etcd"))?;
        match resp.kvs().first() {
            Some(kv) => Ok(kv.value().to_vec()),
            None => Err(VolError::not_exists(abs)),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> VolResult<()> {
        let abs = join_prefix(&self.prefix, key);
        let mut client = self.client.clone();
        client
            .put(abs.as_str(), value, None)
            .await
            .with_context(|| format!("failed to put {abs} to etcd"))?;
        Ok(())
    }

    async fn create(&self, key: &str, value: &[u8]) -> VolResult<()> {
        let abs = join_prefix(&self.prefix, key);
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                abs.as_str(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(abs.as_str(), value, None)]);
        let resp = client
            .txn(txn)
            .await
            .with_context(|| format!("failed create txn for {abs}"))?;
        if resp.succeeded() {
            Ok(())
        } else {
            Err(VolError::exists(abs))
        }
    }

    async fn delete(&self, key: &str) -> VolResult<()> {
        let abs = join_prefix(&self.prefix, key);
        let mut client = self.client.clone();
        let resp = client
            .delete(abs.as_str(), None)
            .await
            .with_context(|| format!("failed to delete {abs} from etcd"))?;
        if resp.deleted() == 0 {
            Err(VolError::not_exists(abs))
        } else {
            Ok(())
        }
    }

    async fn list(&self, prefix: &str) -> VolResult<Vec<KvPair>> {
        // Scope with a trailing slash so `volumes` cannot match its sibling
        // `volumes-runtime`.
        let abs = format!("{}/", join_prefix(&self.prefix, prefix));
        let mut client = self.client.clone();
        let resp = client
            .get(abs.as_str(), Some(GetOptions::new().with_prefix()))
            .await
            .with_context(|| format!("failed to list {abs} from etcd"))?;
        let mut result = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv
                .key_str()
                .with_context(|| "etcd returned a non-utf8 key".to_owned())?;
            result.push((strip_prefix(&self.prefix, key), kv.value().to_vec()));
        }
        Ok(result)
    }

    async fn acquire_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> VolResult<String> {
        let abs = join_prefix(&self.prefix, key);
        let mut client = self.client.clone();
        let lease_id = client
            .lease_grant(Self::ttl_secs(ttl), None)
            .await
            .with_context(|| format!("failed to grant lease for {abs}"))?
            .id();
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                abs.as_str(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(
                abs.as_str(),
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )]);
        let resp = client
            .txn(txn)
            .await
            .with_context(|| format!("failed acquire txn for {abs}"))?;
        if resp.succeeded() {
            Ok(lease_id.to_string())
        } else {
            if let Err(err) = client.lease_revoke(lease_id).await {
                warn!("failed to revoke unused lease {lease_id}: {err}");
            }
            Err(VolError::exists(abs))
        }
    }

    async fn refresh_lease(&self, lease: &str, _ttl: Duration) -> VolResult<()> {
        let lease_id: i64 = lease
            .parse()
            .map_err(|_ignore| VolError::argument_invalid(format!("bad lease id {lease:?}")))?;
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease_id)
            .await
            .with_context(|| format!("failed to open keep alive for lease {lease_id}"))?;
        keeper
            .keep_alive()
            .await
            .with_context(|| format!("failed to keep alive lease {lease_id}"))?;
        match stream.message().await {
            Ok(Some(resp)) if resp.ttl() > 0 => Ok(()),
            Ok(_) => Err(VolError::not_exists(format!("lease {lease_id} expired"))),
            Err(err) => {
                Err(VolError::from(err)
                    .add_context(format!("failed keep alive round for lease {lease_id}")))
            }
        }
    }

    async fn compare_delete(&self, key: &str, expected: &[u8]) -> VolResult<()> {
        let abs = join_prefix(&self.prefix, key);
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::value(
                abs.as_str(),
                CompareOp::Equal,
                expected,
            )])
            .and_then(vec![TxnOp::delete(abs.as_str(), None)])
            .or_else(vec![TxnOp::get(abs.as_str(), None)]);
        let resp = client
            .txn(txn)
            .await
            .with_context(|| format!("failed compare-delete txn for {abs}"))?;
        if resp.succeeded() {
            return Ok(());
        }
        // Distinguish a missing key from a value mismatch.
        let check = client
            .get(abs.as_str(), Some(GetOptions::new().with_count_only()))
            .await
            .with_context(|| format!("failed to check {abs} after compare-delete"))?;
        if check.count() == 0 {
            Err(VolError::not_exists(abs))
        } else {
            Err(VolError::lock_failed(format!(
                "stored value for {abs} does not match the expected holder"
            )))
        }
    }

    async fn watch(
        &self,
        key: &str,
        recursive: bool,
        token: CancellationToken,
    ) -> VolResult<WatchChannels> {
        let abs = if recursive {
            format!("{}/", join_prefix(&self.prefix, key))
        } else {
            join_prefix(&self.prefix, key)
        };
        let mut client = self.client.clone();
        let options = recursive.then(|| WatchOptions::new().with_prefix());
        let (mut watcher, mut stream) = client
            .watch(abs.as_str(), options)
            .await
            .with_context(|| format!("failed to create watcher for {abs}"))?;

        let (event_tx, event_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let prefix = self.prefix.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        if let Err(err) = watcher.cancel().await {
                            warn!("failed to cancel etcd watcher: {err}");
                        }
                        break;
                    }
                    msg = stream.message() => match msg {
                        Ok(Some(resp)) => {
                            for event in resp.events() {
                                let Some(kv) = event.kv() else { continue };
                                let item_key = match kv.key_str() {
                                    Ok(k) => strip_prefix(&prefix, k),
                                    Err(err) => {
                                        error!("non-utf8 key in etcd watch event: {err}");
                                        continue;
                                    }
                                };
                                let value = match event.event_type() {
                                    etcd_client::EventType::Put => Some(kv.value().to_vec()),
                                    etcd_client::EventType::Delete => None,
                                };
                                if event_tx.send(WatchEvent { key: item_key, value }).await.is_err() {
                                    debug!("etcd watch receiver dropped");
                                    return;
                                }
                            }
                        }
                        Ok(None) => {
                            debug!("etcd watch stream closed");
                            break;
                        }
                        Err(err) => {
                            if err_tx.send(VolError::from(err)).await.is_err() {
                                return;
                            }
                            tokio::time::sleep(WATCH_ERROR_THROTTLE).await;
                        }
                    }
                }
            }
        });

        Ok((event_rx, err_rx))
    }

    async fn dump(&self) -> VolResult<Vec<KvPair>> {
        self.list("").await
    }
}
