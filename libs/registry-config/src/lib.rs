use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::debug;

pub mod trace;
pub mod wire;

pub use wire::{BackoffKind, ReconnectConfig, RetryConfig};

/// env var holding a comma-separated server list
pub const SERVERS_VAR: &str = "REGISTRY_SERVERS";
/// env var overriding the registration root
pub const BASE_PATH_VAR: &str = "REGISTRY_BASE_PATH";
/// env var overriding the session timeout
pub const SESSION_TIMEOUT_VAR: &str = "REGISTRY_SESSION_TIMEOUT";

/// upper bound for every configured delay and timeout
pub const MAX_DURATION: Duration = Duration::from_secs(60 * 60);

/// validated registry config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    cfg: wire::Config,
    path: Option<PathBuf>,
}

impl RegistryConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to find config at {}", &path.display()))?;
        let mut cfg = Self::parse_str(s)?;
        cfg.path = Some(path.to_path_buf());
        Ok(cfg)
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let s = s.as_ref();
        let mut cfg: wire::Config = match serde_json::from_str(s) {
            Ok(cfg) => cfg,
            Err(_) => serde_yaml::from_str(s).context("failed to parse registry config")?,
        };
        apply_overrides(&mut cfg, |name| env::var(name).ok())?;
        debug!(?cfg);
        Self::from_wire(cfg)
    }

    /// validate an already decoded config
    pub fn from_wire(cfg: wire::Config) -> Result<Self> {
        validate(&cfg)?;
        Ok(Self { cfg, path: None })
    }

    pub fn servers(&self) -> &[String] {
        &self.cfg.servers
    }
    /// `host:port` list joined the way ensemble clients take a connect string
    pub fn connect_string(&self) -> String {
        self.cfg.servers.join(",")
    }
    pub fn base_path(&self) -> &str {
        &self.cfg.base_path
    }
    pub fn session_timeout(&self) -> Duration {
        self.cfg.session_timeout
    }
    pub fn connect_timeout(&self) -> Duration {
        self.cfg.connect_timeout
    }
    pub fn retry(&self) -> &RetryConfig {
        &self.cfg.retry
    }
    pub fn reconnect(&self) -> &ReconnectConfig {
        &self.cfg.reconnect
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// apply environment overrides, `lookup` returns the value of a variable if set
pub fn apply_overrides<F>(cfg: &mut wire::Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(servers) = lookup(SERVERS_VAR) {
        cfg.servers = servers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
    }
    if let Some(base_path) = lookup(BASE_PATH_VAR) {
        cfg.base_path = base_path.trim().to_owned();
    }
    if let Some(timeout) = lookup(SESSION_TIMEOUT_VAR) {
        cfg.session_timeout = wire::parse_duration(&timeout)
            .with_context(|| format!("error parsing env var {SESSION_TIMEOUT_VAR}"))?;
    }
    Ok(())
}

fn validate(cfg: &wire::Config) -> Result<()> {
    if cfg.servers.is_empty() {
        bail!("at least one server must be configured");
    }
    if let Some(bad) = cfg.servers.iter().find(|s| s.trim().is_empty()) {
        bail!("server entry is empty: {bad:?}");
    }
    validate_base_path(&cfg.base_path)?;
    for (name, value) in [
        ("session_timeout", cfg.session_timeout),
        ("connect_timeout", cfg.connect_timeout),
    ] {
        if value.is_zero() {
            bail!("{name} must be greater than zero");
        }
    }
    for (name, value) in [
        ("session_timeout", cfg.session_timeout),
        ("connect_timeout", cfg.connect_timeout),
        ("retry max_delay", cfg.retry.max_delay),
        ("reconnect max_delay", cfg.reconnect.max_delay),
    ] {
        if value > MAX_DURATION {
            bail!("{name} {value:?} exceeds the limit of {MAX_DURATION:?}");
        }
    }
    if cfg.retry.base_delay > cfg.retry.max_delay {
        bail!(
            "retry base_delay {:?} exceeds max_delay {:?}",
            cfg.retry.base_delay,
            cfg.retry.max_delay
        );
    }
    if cfg.reconnect.base_delay > cfg.reconnect.max_delay {
        bail!(
            "reconnect base_delay {:?} exceeds max_delay {:?}",
            cfg.reconnect.base_delay,
            cfg.reconnect.max_delay
        );
    }
    Ok(())
}

/// base path must be absolute, without a trailing `/` (unless it is the root)
/// and without empty segments
pub fn validate_base_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        bail!("base_path must be absolute: {path:?}");
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        bail!("base_path must not end with '/': {path:?}");
    }
    if path[1..].split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        bail!("base_path contains an empty or relative segment: {path:?}");
    }
    Ok(())
}
