use crate::configs::{Opts, Parser};

mod configs;
mod master;
mod metrics;
mod workers;

#[macro_use]
extern crate lazy_static;

pub(crate) const INDEXER: &str = "ship_indexer";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    configuration::init_tracing(INDEXER).await?;

    let opts: Opts = Opts::parse();
    let mut config = opts.read_configuration().await?;

    let last_block_file = configs::last_block_file(&config.general.data_dir, &config.general.chain);
    configs::apply_start_options(
        &mut config.indexer,
        opts.start_options.as_ref(),
        configs::read_last_block(&last_block_file),
    );
    // fail fast on inconsistent queue thresholds
    config.scaling.queue_limits()?;

    tracing::info!(target: INDEXER, "Connecting to the queue fabric...");
    let (fabric, management) = queue_fabric::prepare_queue_fabric(&config.broker).await?;

    tracing::info!(target: INDEXER, "Connecting to storage...");
    let storage = database::prepare_storage(&config.storage).await?;

    let (control, control_requests) = master::ControlHandle::new(master::CONTROL_TIMEOUT);

    // Initiate metrics http server
    tokio::spawn(
        metrics::init_server(config.general.server_port, control)
            .expect("Failed to start metrics server"),
    );

    tracing::info!(target: INDEXER, "Starting ship indexer for {}...", config.general.chain);
    master::Master::new(config, fabric, management, storage, control_requests)?
        .run()
        .await
}
