//! Global tracing subscriber for processes hosting a registry.
use std::{env, fmt, str::FromStr};

use anyhow::{Result, bail};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt as tfmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// env var selecting the log format
pub const LOG_FORMAT_VAR: &str = "LOG_FORMAT";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// single-line, human readable
    #[default]
    Standard,
    Json,
    /// multi-line, human readable
    Pretty,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "" | "standard" => LogFormat::Standard,
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            other => bail!("unknown log format {other:?}, expected standard, json or pretty"),
        })
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Standard => write!(f, "standard"),
            LogFormat::Json => write!(f, "json"),
            LogFormat::Pretty => write!(f, "pretty"),
        }
    }
}

impl LogFormat {
    /// Read [`LOG_FORMAT_VAR`], defaulting to `standard` when unset.
    pub fn from_env() -> Result<Self> {
        env::var(LOG_FORMAT_VAR).map_or(Ok(LogFormat::Standard), |v| v.parse())
    }

    fn layer(self) -> Box<dyn Layer<Registry> + Send + Sync> {
        match self {
            LogFormat::Standard => tfmt::layer().boxed(),
            LogFormat::Json => tfmt::layer().json().boxed(),
            LogFormat::Pretty => tfmt::layer().pretty().boxed(),
        }
    }
}

/// Install the global subscriber with `directives` (`RUST_LOG` syntax) and
/// the format named by [`LOG_FORMAT_VAR`].
///
/// Returns `false` if another global subscriber was already installed, in
/// which case that one stays in place.
pub fn init(directives: &str) -> Result<bool> {
    init_with(directives, LogFormat::from_env()?)
}

/// Like [`init`] with an explicit format.
pub fn init_with(directives: &str, format: LogFormat) -> Result<bool> {
    let filter = EnvFilter::try_new(directives)?;
    let installed = tracing_subscriber::registry()
        .with(format.layer().with_filter(filter))
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(%format, directives, "tracing initialized");
    }
    Ok(installed)
}
