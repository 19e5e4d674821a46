use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use rtc_signal::config::{Cli, Command};
use rtc_signal::{client, server, util};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    util::init_log();

    match cli.command {
        Command::Server(config) => {
            info!("Starting signaling server on {}", config.bind);
            server::run(config).await
        }
        Command::Client(config) => {
            info!("Starting signaling client for {}", config.url);
            let cancel = CancellationToken::new();
            util::shutdown_signal(cancel.clone());
            client::run(config, cancel).await
        }
    }
}
