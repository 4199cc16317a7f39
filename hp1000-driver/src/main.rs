use clap::Parser;
use miette::IntoDiagnostic;
use std::time::Duration;
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

use hp1000_driver::config::StationConfig;
use hp1000_driver::{run_station, Cli};

#[tokio::main]
async fn main() -> miette::Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .parse_default_env()
        .init();

    let config = StationConfig::from_cli(&args).into_diagnostic()?;
    let emulate = args.emulate();
    log::debug!("Configuration: {:?}", config);

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("station", move |s| {
            run_station(s, config, emulate)
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await
    .into_diagnostic()
}
