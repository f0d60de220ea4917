//! Logging setup for the command line tool.
//!
//! Logs go to stderr so that measurement JSON on stdout stays parseable.
//! `RUST_LOG` overrides the configured level.

use anyhow::Result;
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// How to log.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    /// Emit JSON lines instead of the compact human format.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json: false,
        }
    }
}

impl LogConfig {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("probe_engine={}", self.level)))
    }
}

/// Install the global subscriber.
pub fn init(config: &LogConfig) -> Result<()> {
    let console_layer = (!config.json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_level(true)
            .compact()
            .with_filter(config.filter())
    });

    let json_layer = config.json.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .json()
            .with_filter(config.filter())
    });

    tracing_subscriber::registry()
        .with(console_layer)
        .with(json_layer)
        .try_init()?;

    info!(level = %config.level, json = config.json, "logging initialized");
    Ok(())
}
