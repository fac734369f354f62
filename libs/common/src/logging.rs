//! Unified logging module for gateway probe binaries
//!
//! Console output always; a daily rolling file when a log directory is known.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use anyhow::{anyhow, Context};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config_loader::env_first;

/// Environment variable overriding the configured log directory
pub const LOG_DIR_ENV: &str = "GWPROBE_LOG_DIR";

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Custom event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2026-03-02T00:50:44.809211Z [INFO] consumer connected`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Worker guards flush the non-blocking file writer; they live for the whole process
static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Binary name, used as the filter target and the log file prefix
    pub service_name: String,
    /// Level for the service's own targets (e.g. "info", "debug")
    pub level: String,
    /// Directory for the rolling log file; console only when `None`
    pub log_dir: Option<PathBuf>,
    /// Emit JSON lines instead of the bracketed text format
    pub enable_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "gwprobe".to_string(),
            level: "info".to_string(),
            log_dir: None,
            enable_json: false,
        }
    }
}

/// Log directory priority: `GWPROBE_LOG_DIR` env > config > none
pub fn resolve_log_dir(configured: Option<&Path>) -> Option<PathBuf> {
    env_first(LOG_DIR_ENV, configured.map(Path::to_path_buf))
}

/// Filter directive used when `RUST_LOG` is not set
///
/// Validates `level` so a typo in the config fails loudly instead of
/// silently logging nothing.
pub fn default_directive(service_name: &str, level: &str) -> anyhow::Result<String> {
    let level: Level = level
        .parse()
        .map_err(|_| anyhow!("invalid log level '{}'", level))?;
    // Crate targets use underscores
    let target = service_name.replace('-', "_");
    Ok(format!(
        "info,{}={}",
        target,
        level.as_str().to_ascii_lowercase()
    ))
}

fn build_env_filter(config: &LogConfig) -> anyhow::Result<EnvFilter> {
    if let Ok(env_str) = std::env::var("RUST_LOG") {
        if !env_str.is_empty() {
            return EnvFilter::try_new(&env_str)
                .with_context(|| format!("invalid RUST_LOG '{}'", env_str));
        }
    }
    let directive = default_directive(&config.service_name, &config.level)?;
    EnvFilter::try_new(&directive).with_context(|| format!("invalid filter '{}'", directive))
}

fn keep_guard(guard: WorkerGuard) {
    let guards = GUARDS.get_or_init(|| Mutex::new(Vec::new()));
    match guards.lock() {
        Ok(mut guards) => guards.push(guard),
        Err(poisoned) => poisoned.into_inner().push(guard),
    }
}

/// Initialize the global subscriber
///
/// Fails if the level is invalid, the log directory cannot be created, or a
/// global subscriber is already installed.
pub fn init_with_config(config: LogConfig) -> anyhow::Result<()> {
    let env_filter = build_env_filter(&config)?;
    let log_dir = resolve_log_dir(config.log_dir.as_deref());

    let console_layer = if config.enable_json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer()
            .with_ansi(true)
            .event_format(BracketedLevelFormat)
            .boxed()
    };

    let file_layer = match &log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log directory {}", dir.display()))?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            keep_guard(guard);

            let layer = if config.enable_json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed()
            };
            Some(layer)
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("logging already initialized: {}", e))?;

    match &log_dir {
        Some(dir) => tracing::info!("Logging: {} @ {}", config.service_name, dir.display()),
        None => tracing::debug!("Logging: {} (console only)", config.service_name),
    }

    Ok(())
}

/// Console-only init at the given level
pub fn init(level: &str) -> anyhow::Result<()> {
    init_with_config(LogConfig {
        level: level.to_string(),
        ..Default::default()
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_uses_crate_target() {
        let directive = default_directive("gw-probe", "debug").unwrap();
        assert_eq!(directive, "info,gw_probe=debug");
    }

    #[test]
    fn test_default_directive_rejects_unknown_level() {
        assert!(default_directive("gwprobe", "loud").is_err());
    }

    #[test]
    fn test_format_level_brackets() {
        assert_eq!(format_level(&Level::WARN), "[WARN]");
        assert_eq!(format_level(&Level::ERROR), "[ERROR]");
    }

    #[test]
    fn test_resolve_log_dir_uses_configured_value() {
        // Only meaningful while the override is absent
        if std::env::var(LOG_DIR_ENV).is_err() {
            let dir = resolve_log_dir(Some(Path::new("/var/log/gwprobe")));
            assert_eq!(dir, Some(PathBuf::from("/var/log/gwprobe")));
            assert_eq!(resolve_log_dir(None), None);
        }
    }
}
