use std::process::ExitCode;
use clap::Parser;
use log::{error, info};
use hm10_drive::cli::Args;
use hm10_drive::error::{AppRunError, ConfigError};
use hm10_drive::{init_logging, run};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);
    info!(concat!("HM-10 Drive ", env!("CARGO_PKG_VERSION")));

    match run(args).await {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            eprintln!("Another controller is already running with this config file");
            ExitCode::FAILURE
        },
        Err(err) => {
            error!("Unexpected error: {}", err);
            ExitCode::FAILURE
        },
        Ok(_) => ExitCode::SUCCESS,
    }
}
