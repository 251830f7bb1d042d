/// Service configuration.
///
/// Tunables come from a TOML file (every key optional); secrets and
/// deployment paths come from the environment, which `main` seeds from
/// `.env` via dotenv. Environment values win over the file.

use crate::balance::BalancePolicy;
use crate::ignition;
use crate::ingest::llm;
use crate::logging::LogLevel;
use crate::maps;
use crate::monitor;
use crate::notify::push;
use crate::summary;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "trafmon.toml";

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Cannot read config: {}", e),
            ConfigError::Parse(e) => write!(f, "Cannot parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            timestamps: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IgnitionConfig {
    pub timeout_secs: i64,
}

impl Default for IgnitionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: ignition::DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub workers: usize,
    pub http_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            workers: monitor::DEFAULT_WORKERS,
            http_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub timeout_secs: u64,
    pub style: String,
    pub model: String,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: summary::DEFAULT_TIMEOUT_SECS,
            style: summary::DEFAULT_STYLE.to_string(),
            model: llm::DEFAULT_MODEL.to_string(),
        }
    }
}

/// Amounts are decimal strings (`"5.00"`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    pub starting_balance: Decimal,
    pub buffer_percent: u32,
    pub alert_threshold: Decimal,
    pub disable_threshold: Decimal,
    pub input_cost_per_1k: Decimal,
    pub output_cost_per_1k: Decimal,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        let policy = BalancePolicy::default();
        Self {
            starting_balance: policy.starting_balance,
            buffer_percent: policy.buffer_percent,
            alert_threshold: policy.alert_threshold,
            disable_threshold: policy.disable_threshold,
            input_cost_per_1k: policy.input_cost_per_1k,
            output_cost_per_1k: policy.output_cost_per_1k,
        }
    }
}

impl BalanceConfig {
    pub fn policy(&self) -> BalancePolicy {
        BalancePolicy {
            starting_balance: self.starting_balance,
            buffer_percent: self.buffer_percent,
            alert_threshold: self.alert_threshold,
            disable_threshold: self.disable_threshold,
            input_cost_per_1k: self.input_cost_per_1k,
            output_cost_per_1k: self.output_cost_per_1k,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub title: String,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            title: push::DEFAULT_TITLE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MapsConfig {
    pub dir: String,
}

impl Default for MapsConfig {
    fn default() -> Self {
        Self {
            dir: maps::DEFAULT_MAPS_DIR.to_string(),
        }
    }
}

/// Values only ever read from the environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Secrets {
    pub google_maps_api_key: Option<String>,
    pub database_url: Option<String>,
    pub discord_webhook_url: Option<String>,
    pub pushover_token: Option<String>,
    pub pushover_user: Option<String>,
    pub anthropic_api_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub ignition: IgnitionConfig,
    pub monitor: MonitorConfig,
    pub summary: SummaryConfig,
    pub balance: BalanceConfig,
    pub push: PushConfig,
    pub maps: MapsConfig,
    #[serde(skip)]
    pub secrets: Secrets,
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(ConfigError::Parse)
    }

    /// Reads `path` (a missing file means all defaults), applies the process
    /// environment, and validates.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overlays environment values. `lookup` returns `None` for unset keys;
    /// blank values count as unset.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        self.secrets = Secrets {
            google_maps_api_key: get("GOOGLE_MAPS_API_KEY"),
            database_url: get("DATABASE_URL"),
            discord_webhook_url: get("DISCORD_WEBHOOK_URL"),
            pushover_token: get("PUSHOVER_TOKEN"),
            pushover_user: get("PUSHOVER_USER"),
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
        };
        if let Some(dir) = get("MAPS_DIR") {
            self.maps.dir = dir;
        }
        if let Some(timeout) = get("IGNITION_TIMEOUT").and_then(|v| v.trim().parse().ok()) {
            self.ignition.timeout_secs = timeout;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if LogLevel::parse(&self.logging.level).is_none() {
            return invalid(format!("logging.level '{}' is not one of debug, info, warn, error", self.logging.level));
        }
        if self.ignition.timeout_secs <= 0 {
            return invalid("ignition.timeout_secs must be positive".into());
        }
        if self.ignition.timeout_secs > ignition::MAX_TIMEOUT_SECS {
            return invalid(format!(
                "ignition.timeout_secs must be at most {}",
                ignition::MAX_TIMEOUT_SECS
            ));
        }
        if self.monitor.workers == 0 {
            return invalid("monitor.workers must be at least 1".into());
        }
        if self.monitor.http_timeout_secs == 0 || self.summary.timeout_secs == 0 {
            return invalid("timeouts must be positive".into());
        }
        if self.balance.buffer_percent > 100 {
            return invalid("balance.buffer_percent must be at most 100".into());
        }
        Ok(())
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::parse(&self.logging.level).unwrap_or(LogLevel::Info)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.http_timeout_secs)
    }

    pub fn summary_timeout(&self) -> Duration {
        Duration::from_secs(self.summary.timeout_secs)
    }
}
