//! gwprobe
//!
//! Consumes thickness readings over Modbus TCP, OPC UA or S7, or serves a
//! mock endpoint for any of the byte-level protocols.

use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, error};

use gwprobe::bootstrap::{self, Args};
use gwprobe::commands;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging is not up yet, so configuration errors go to stderr
    let config = match bootstrap::load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("gwprobe: {}", e);
            return ExitCode::from(e.exit_code());
        },
    };
    if let Err(e) = bootstrap::initialize_logging(&args, &config) {
        eprintln!("gwprobe: {}", e);
        return ExitCode::from(e.exit_code());
    }
    debug!("Effective configuration: {:?}", config);

    match commands::run(args, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        },
    }
}
