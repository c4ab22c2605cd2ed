//! Layered server configuration.
//!
//! Sources, lowest priority first: built-in defaults, the YAML file given on
//! the command line, the flat legacy environment variables, nested
//! `REGISTRY__*` variables, then CLI flags.

use std::path::Path;

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use service_registry::config::{CoordinationConfig, RegistryConfig};

/// Prefix of the nested environment overrides, e.g. `REGISTRY__SERVER__PORT`.
pub const ENV_PREFIX: &str = "REGISTRY__";

/// Flat variables accepted for compatibility with existing deployments.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("SERVICE_REGISTRY_HOST", "server.host"),
    ("SERVICE_REGISTRY_PORT", "server.port"),
    ("ZOOKEEPER_TIMEOUT", "coordination.timeout_secs"),
    ("COORDINATION_TIMEOUT", "coordination.timeout_secs"),
    ("SERVICES_ROOT_PATH", "registry.services_root_path"),
    ("HEALTH_CHECK_INTERVAL", "registry.health_check_interval_secs"),
    ("SERVICE_TTL", "registry.service_ttl_secs"),
    ("LOG_LEVEL", "logging.level"),
];

/// Comma separated host lists; the later entry wins when both are set.
const LEGACY_HOSTS_ENV: &[&str] = &["ZOOKEEPER_HOSTS", "COORDINATION_HOSTS"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 3003,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub coordination: CoordinationConfig,
    pub registry: RegistryConfig,
}

impl AppConfig {
    /// Load the layered configuration.
    ///
    /// # Errors
    /// Returns an error when a source cannot be parsed or a value has the
    /// wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::raw().filter_map(|key| {
            LEGACY_ENV
                .iter()
                .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
                .map(|(_, target)| (*target).into())
        }));
        if let Some(hosts) = legacy_hosts() {
            figment = figment.merge(Serialized::defaults(serde_json::json!({
                "coordination": { "endpoints": hosts }
            })));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment.extract().context("failed to load configuration")
    }

    /// Apply command line flags on top of the loaded sources.
    pub fn apply_cli_overrides(&mut self, port: Option<u16>, verbose: u8) {
        if let Some(port) = port {
            self.server.port = port;
        }
        if let Some(level) = verbosity_level(verbose)
            && is_more_verbose(level, &self.logging.level)
        {
            level.clone_into(&mut self.logging.level);
        }
    }

    /// # Errors
    /// Returns the first invalid section.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            anyhow::bail!("server.host must not be empty");
        }
        self.coordination
            .validate()
            .context("invalid coordination config")?;
        self.registry.validate().context("invalid registry config")?;
        crate::logging::parse_filter(&self.logging.level).context("invalid logging.level")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the config cannot be rendered as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_saphyr::to_string(self).context("failed to render configuration")
    }
}

fn legacy_hosts() -> Option<Vec<String>> {
    LEGACY_HOSTS_ENV
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .next_back()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|host| !host.is_empty())
                .map(ToOwned::to_owned)
                .collect()
        })
}

/// `-v` info, `-vv` debug, `-vvv` trace.
fn verbosity_level(verbose: u8) -> Option<&'static str> {
    match verbose {
        0 => None,
        1 => Some("info"),
        2 => Some("debug"),
        _ => Some("trace"),
    }
}

const LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

fn level_rank(level: &str) -> Option<usize> {
    LEVELS
        .iter()
        .position(|l| l.eq_ignore_ascii_case(level.trim()))
}

/// Directive strings that are not a bare level are always replaced.
fn is_more_verbose(candidate: &str, current: &str) -> bool {
    match (level_rank(candidate), level_rank(current)) {
        (Some(candidate), Some(current)) => candidate > current,
        _ => true,
    }
}
