//! Process configuration.
//!
//! Two sources, both required at startup and fatal when invalid:
//!
//! - Environment variables: `POSTGRES_URL`, `API_KEY`, `ADMIN_API_KEY`
//!   and `BALANCER_TYPE` (`proxy` or `redirect`).
//! - `config.json`: the health-probe schedule and probe request shape.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// TCP port the balancer listens on.
pub const LISTEN_PORT: u16 = 8000;

/// How often the reconciler pulls the active set from the catalog.
pub const CACHE_REFRESH_PERIOD: Duration = Duration::from_secs(15 * 60);

/// How the balancer answers a dispatchable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancerMode {
    /// Forward the request upstream and relay the response.
    Proxy,
    /// Send the client to the backend with a 301.
    Redirect,
}

impl FromStr for BalancerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "proxy" => Ok(Self::Proxy),
            "redirect" => Ok(Self::Redirect),
            other => bail!("invalid BALANCER_TYPE: {other:?}, must be 'proxy' or 'redirect'"),
        }
    }
}

/// Settings read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub postgres_url: String,
    pub api_key: String,
    pub admin_api_key: String,
    pub mode: BalancerMode,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            postgres_url: require_env("POSTGRES_URL")?,
            api_key: require_env("API_KEY")?,
            admin_api_key: require_env("ADMIN_API_KEY")?,
            mode: require_env("BALANCER_TYPE")?.parse()?,
        })
    }
}

fn require_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => bail!("{name} environment variable is required"),
    }
}

/// Root of `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(rename = "healthCheck")]
    pub health_check: HealthCheck,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheck {
    pub interval: ProbeInterval,
    pub request: ProbeRequest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeInterval {
    pub unit: IntervalUnit,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Second,
    Minute,
    Hour,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeRequest {
    pub method: ProbeMethod,
    /// Probe body; the fleet speaks JSON-RPC so the default is an empty
    /// JSON object.
    #[serde(default = "empty_object")]
    pub body: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeMethod {
    Get,
    Post,
}

impl HealthConfig {
    /// Load and validate the health-probe configuration.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let interval = &self.health_check.interval;
        if interval.value < 1 {
            bail!(
                "health check interval value must be positive, got {}",
                interval.value
            );
        }
        if interval.unit == IntervalUnit::Hour && interval.value > 24 {
            bail!("health check interval cannot exceed 24 hours");
        }
        Ok(())
    }
}

impl ProbeInterval {
    pub fn period(&self) -> Duration {
        let unit = match self.unit {
            IntervalUnit::Second => Duration::from_secs(1),
            IntervalUnit::Minute => Duration::from_secs(60),
            IntervalUnit::Hour => Duration::from_secs(3600),
        };
        unit * self.value as u32
    }
}
