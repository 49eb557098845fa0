//! The `volstack` binary: one executable, three daemon roles.

use clap::Parser;

use volstack::common::logger;
use volstack::config::{Cli, Role};
use volstack::{apiserver, plugin, supervisor, VolResult};

#[tokio::main]
async fn main() -> VolResult<()> {
    logger::init_logger(false);

    let cli = Cli::parse();
    match cli.role {
        Role::Apiserver(config) => {
            let daemon = apiserver::Daemon::from_config(&config).await?;
            daemon.run(&config).await
        }
        Role::Plugin(config) => {
            let daemon = plugin::Daemon::from_config(&config).await?;
            daemon.run().await
        }
        Role::Supervisor(config) => {
            let daemon = supervisor::Daemon::from_config(&config).await?;
            daemon.run().await
        }
    }
}
