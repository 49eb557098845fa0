//! Daemon configuration from the command line.

use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::common::error::{VolError, VolResult};
use crate::db::DbClient;
use crate::kv::consul_impl::ConsulEngine;
use crate::kv::etcd_impl::EtcdEngine;
use crate::kv::KvEngine;

/// Top-level command line.
#[derive(Debug, Parser)]
#[command(
    name = "volstack",
    version,
    about = "Cluster-wide volume management for containerized workloads"
)]
pub struct Cli {
    /// Which daemon role to run.
    #[command(subcommand)]
    pub role: Role,
}

/// The daemon roles sharing this binary.
#[derive(Debug, Subcommand)]
pub enum Role {
    /// Run the cluster control plane.
    Apiserver(ApiserverConfig),
    /// Run the per-host docker volume plugin.
    Plugin(PluginConfig),
    /// Run the snapshot supervisor.
    Supervisor(SupervisorConfig),
}

/// Options shared by every role: how to reach the store.
#[derive(Clone, Debug, Parser)]
pub struct StoreConfig {
    /// Which store to use: `etcd` or `consul`.
    #[arg(long = "store", value_name = "VALUE", default_value = "etcd")]
    pub store: String,

    /// Store endpoints, comma separated.
    #[arg(
        long = "store-url",
        value_name = "VALUE",
        value_delimiter = ',',
        default_value = "http://localhost:2379"
    )]
    pub store_url: Vec<String>,

    /// Keyspace prefix all records live under.
    #[arg(long = "prefix", value_name = "VALUE", default_value = "volplugin")]
    pub prefix: String,

    /// Label identifying this host in lock owners; defaults to the
    /// hostname.
    #[arg(long = "host-label", value_name = "VALUE")]
    pub host_label: Option<String>,
}

impl StoreConfig {
    /// The host label, falling back to the system hostname.
    #[must_use]
    pub fn hostname(&self) -> String {
        match self.host_label {
            Some(ref label) => label.clone(),
            None => hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_owned()),
        }
    }

    /// Connect a record client to the configured store.
    pub async fn new_client(&self) -> VolResult<DbClient> {
        let engine: Arc<dyn KvEngine> = match self.store.as_str() {
            "etcd" => Arc::new(EtcdEngine::new(self.store_url.clone(), &self.prefix).await?),
            "consul" => {
                let address = self.store_url.first().ok_or_else(|| {
                    VolError::argument_invalid("no store url given for consul")
                })?;
                Arc::new(ConsulEngine::new(address, &self.prefix)?)
            }
            other => {
                return Err(VolError::argument_invalid(format!(
                    "we do not support data store {other:?}"
                )))
            }
        };
        Ok(DbClient::new(engine))
    }
}

/// Apiserver options.
#[derive(Debug, Parser)]
pub struct ApiserverConfig {
    /// Store connection.
    #[command(flatten)]
    pub store: StoreConfig,

    /// Address the control plane listens on.
    #[arg(long = "listen", value_name = "VALUE", default_value = "0.0.0.0:9005")]
    pub listen: String,
}

/// Plugin options.
#[derive(Debug, Parser)]
pub struct PluginConfig {
    /// Store connection.
    #[command(flatten)]
    pub store: StoreConfig,

    /// Socket name under the docker plugin directory.
    #[arg(long = "plugin-name", value_name = "VALUE", default_value = "volstack")]
    pub plugin_name: String,
}

/// Supervisor options.
#[derive(Debug, Parser)]
pub struct SupervisorConfig {
    /// Store connection.
    #[command(flatten)]
    pub store: StoreConfig,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["volstack", "apiserver"]);
        let Role::Apiserver(config) = cli.role else {
            panic!("expected the apiserver role");
        };
        assert_eq!(config.store.store, "etcd");
        assert_eq!(config.store.prefix, "volplugin");
        assert_eq!(config.listen, "0.0.0.0:9005");
    }

    #[test]
    fn test_store_url_list() {
        let cli = Cli::parse_from([
            "volstack",
            "supervisor",
            "--store-url",
            "http://a:2379,http://b:2379",
        ]);
        let Role::Supervisor(config) = cli.role else {
            panic!("expected the supervisor role");
        };
        assert_eq!(config.store.store_url.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_store_rejected() {
        let config = StoreConfig {
            store: "zookeeper".to_owned(),
            store_url: vec!["http://localhost:2181".to_owned()],
            prefix: "volplugin".to_owned(),
            host_label: None,
        };
        assert!(config.new_client().await.is_err());
    }
}
