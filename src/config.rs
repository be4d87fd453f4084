//! Configuration loading and validation
//!
//! Settings come from an optional `devroute.toml`; every field has a default
//! so the file can be omitted entirely. Command-line flags override it.

use crate::admin::DEFAULT_ADMIN_URL;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Configuration file looked up in the working directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "devroute.toml";

/// Settings shared by the startup wiring flow and the teardown CLI
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Base URL of the proxy's admin API
    #[serde(default = "default_admin_url")]
    pub admin_url: String,

    /// Id of the HTTP server entry whose routes we manage
    #[serde(default = "default_server_id")]
    pub server_id: String,

    /// Listen addresses the managed server must have (merged, never removed)
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,

    /// Host written into new upstream dial strings
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,

    /// Where a newly created route goes in the route list
    #[serde(default)]
    pub route_position: RoutePosition,

    /// What to do when a domain is held by another live process
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Liveness probe timeout in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

/// Insertion point for new routes
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoutePosition {
    /// End of the list (lowest priority)
    #[default]
    Append,
    /// Position 0 (highest priority)
    Prepend,
}

/// Handling of a domain already served by a different live port
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Abort wiring for the domain and report it as an error
    #[default]
    Strict,
    /// Warn and carry on without a route
    Lenient,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admin_url: default_admin_url(),
            server_id: default_server_id(),
            listen: default_listen(),
            upstream_host: default_upstream_host(),
            route_position: RoutePosition::default(),
            conflict_policy: ConflictPolicy::default(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

fn default_admin_url() -> String {
    DEFAULT_ADMIN_URL.to_string()
}

fn default_server_id() -> String {
    "devroute".to_string()
}

fn default_listen() -> Vec<String> {
    vec![":443".to_string(), ":80".to_string()]
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_probe_timeout() -> u64 {
    300
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else `devroute.toml` if present, else defaults
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::load(DEFAULT_CONFIG_FILE),
            None => Ok(Self::default()),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if !(self.admin_url.starts_with("http://") || self.admin_url.starts_with("https://")) {
            errors.push(format!(
                "admin_url must be an http(s) URL, got '{}'",
                self.admin_url
            ));
        }
        if self.server_id.is_empty() || self.server_id.contains('/') {
            errors.push(format!(
                "server_id must be non-empty and contain no '/', got '{}'",
                self.server_id
            ));
        }
        if self.listen.is_empty() {
            errors.push("listen must name at least one address".to_string());
        }
        if self.upstream_host.is_empty() {
            errors.push("upstream_host must not be empty".to_string());
        }
        if self.probe_timeout_ms == 0 {
            errors.push("probe_timeout_ms must be greater than zero".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
