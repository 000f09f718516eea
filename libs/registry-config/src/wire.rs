//! Serialized form of the registry configuration.
//!
//! Durations accept either a bare integer (seconds) or a string with a unit
//! suffix: `"250ms"`, `"30s"`, `"5m"`, `"1h"`.

use std::{num::NonZeroU32, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

/// default registration root
pub const DEFAULT_BASE_PATH: &str = "/services";

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// ensemble members as `host:port`
    pub servers: Vec<String>,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default = "default_session_timeout", with = "duration")]
    pub session_timeout: Duration,
    #[serde(default = "default_connect_timeout", with = "duration")]
    pub connect_timeout: Duration,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// bounds for retrying a single remote operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: NonZeroU32,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default = "default_retry_base_delay", with = "duration")]
    pub base_delay: Duration,
    #[serde(default = "default_retry_max_delay", with = "duration")]
    pub max_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    #[default]
    Exponential,
}

/// backoff between attempts to establish a new session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_base_delay", with = "duration")]
    pub base_delay: Duration,
    #[serde(default = "default_reconnect_max_delay", with = "duration")]
    pub max_delay: Duration,
}

pub fn default_base_path() -> String {
    DEFAULT_BASE_PATH.to_owned()
}

pub const fn default_session_timeout() -> Duration {
    Duration::from_secs(30)
}

pub const fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

pub const fn default_max_attempts() -> NonZeroU32 {
    match NonZeroU32::new(3) {
        Some(n) => n,
        None => unreachable!(),
    }
}

pub const fn default_retry_base_delay() -> Duration {
    Duration::from_millis(100)
}

pub const fn default_retry_max_delay() -> Duration {
    Duration::from_secs(5)
}

pub const fn default_reconnect_base_delay() -> Duration {
    Duration::from_secs(1)
}

pub const fn default_reconnect_max_delay() -> Duration {
    Duration::from_secs(30)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffKind::default(),
            base_delay: default_retry_base_delay(),
            max_delay: default_retry_max_delay(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: default_reconnect_base_delay(),
            max_delay: default_reconnect_max_delay(),
        }
    }
}

/// Parse a duration string with optional time units
/// Accepts: "30", "30s", "250ms", "5m", "1h"
/// If no unit is specified, assumes seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration string");
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u64>().context("invalid number")?;

    let millis = match unit.trim() {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => anyhow::bail!(
            "unknown time unit '{}', only 'h', 'm', 's' or 'ms' are supported",
            other
        ),
    };

    num.checked_mul(millis)
        .map(Duration::from_millis)
        .context("duration value overflow")
}

/// format a duration the way [`parse_duration`] reads it back
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1_000 == 0 {
        format!("{}s", millis / 1_000)
    } else {
        format!("{millis}ms")
    }
}

pub(crate) mod duration {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum WireDuration {
        Seconds(u64),
        String(String),
    }

    pub(crate) fn serialize<S>(d: &Duration, ser: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        ser.serialize_str(&format_duration(*d))
    }

    pub(crate) fn deserialize<'de, D>(de: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match WireDuration::deserialize(de)? {
            WireDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            WireDuration::String(s) => parse_duration(&s).map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub static EXAMPLE: &str = include_str!("../sample/config.yaml");

    // test we can encode/decode example file
    #[test]
    fn test_example() {
        let cfg: Config = serde_yaml::from_str(EXAMPLE).unwrap();
        assert_eq!(cfg.servers.len(), 3);
        assert_eq!(cfg.base_path, "/services");
        assert_eq!(cfg.session_timeout, Duration::from_secs(30));
        assert_eq!(cfg.retry.base_delay, Duration::from_millis(200));
        // back to the yaml
        let s = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&s).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"servers": ["127.0.0.1:2181"]}"#).unwrap();
        assert_eq!(cfg.base_path, DEFAULT_BASE_PATH);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(5));
        assert_eq!(cfg.retry.max_attempts.get(), 3);
        assert_eq!(cfg.retry.backoff, BackoffKind::Exponential);
        assert_eq!(cfg.reconnect.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("60d").is_err());
        assert!(parse_duration("60mins").is_err());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let json = r#"{"servers": ["a:2181"], "retry": {"max_attempts": 0}}"#;
        assert!(serde_json::from_str::<Config>(json).is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
    }
}
