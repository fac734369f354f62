//! Command line and service bootstrap
//!
//! Parses arguments, loads the layered configuration and installs logging.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use common::config_loader::get_config_value;
use common::logging::LogConfig;
use errors::{GatewayError, GatewayResult};

use crate::config::AppConfig;

/// Environment variable overriding the configured log level
pub const LOG_LEVEL_ENV: &str = "GWPROBE_LOG_LEVEL";

/// Command-line arguments for gwprobe
#[derive(Parser, Debug, Clone)]
#[command(
    name = "gwprobe",
    version = env!("CARGO_PKG_VERSION"),
    about = "Thickness gateway probe",
    long_about = None
)]
pub struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short = 'c', long, env = "GWPROBE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// JSON log output
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Consume readings from one protocol endpoint
    Watch(WatchArgs),
    /// Run a mock endpoint
    Serve(ServeArgs),
    /// Validate and print the effective configuration
    CheckConfig,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Modbus,
    Opcua,
    S7,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeProtocol {
    Modbus,
    S7,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct WatchArgs {
    pub protocol: Protocol,

    /// Endpoint host (OPC UA: replaces the host in the endpoint URL)
    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Stop after this many readings
    #[arg(short = 'n', long)]
    pub count: Option<u64>,

    /// Consume from an in-process mock fed by the synthetic producer
    #[arg(long)]
    pub simulate: bool,

    /// Producer interval when simulating
    #[arg(long, default_value_t = 250)]
    pub interval_ms: u64,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ServeArgs {
    pub protocol: ServeProtocol,

    /// Listen address, overrides the configured bind address
    #[arg(short = 'b', long)]
    pub bind: Option<String>,

    /// Feed the endpoint from the synthetic producer
    #[arg(long)]
    pub simulate: bool,

    /// Producer interval
    #[arg(long, default_value_t = 500)]
    pub interval_ms: u64,
}

/// Load configuration named by the arguments
pub fn load_config(args: &Args) -> GatewayResult<AppConfig> {
    AppConfig::load(args.config.as_deref())
}

/// Install logging
///
/// Log level priority: command line > `GWPROBE_LOG_LEVEL` > configuration.
pub fn initialize_logging(args: &Args, config: &AppConfig) -> GatewayResult<()> {
    let level = get_config_value(
        args.log_level.clone(),
        LOG_LEVEL_ENV,
        config.service.log_level.clone(),
    );

    common::logging::init_with_config(LogConfig {
        service_name: config.service.name.clone(),
        level,
        log_dir: config.service.log_dir.clone(),
        enable_json: args.json_logs || config.service.json_logs,
    })
    .map_err(|e| GatewayError::config(format!("Failed to init logging: {}", e)))
}
