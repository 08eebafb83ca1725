use anyhow::Context;

use pubsched_infra::AppConfig;
use pubsched_worker::Mode;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pubsched_observability::init();

    let mode = Mode::from_args(std::env::args().skip(1))?;
    let config = AppConfig::from_env().context("loading configuration")?;
    tracing::info!(?mode, worker_id = %config.poller.worker_id, "starting pubsched worker");

    pubsched_worker::run(mode, config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c; shutting down");
        }
    })
    .await
}
