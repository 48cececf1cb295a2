//! Configuration for tradewarden.
//!
//! Settings come from a TOML file (path in `TRADEWARDEN_CONFIG`) overridden
//! by environment variables, organized by domain: exchange, ai, risk,
//! storage, gateway, notification, network.

mod network_config;
mod risk_config;

pub use network_config::NetworkConfig;
pub use risk_config::{RiskConfig, RiskMode, floors};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;

/// Execution backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Deterministic simulator fed by a candle source.
    Simulated,
    /// Live exchange adapter.
    Exchange,
}

impl FromStr for ExecutionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simulated" | "sim" | "paper" => Ok(ExecutionMode::Simulated),
            "exchange" | "live" => Ok(ExecutionMode::Exchange),
            _ => anyhow::bail!("Invalid MODE: {}. Must be 'simulated' or 'exchange'", s),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
    pub testnet: bool,
    pub base_url: String,
    pub ws_url: String,
}

/// LLM settings for AI-backed agents. When absent, the rule-based agents run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiConfig {
    pub model: String,
    pub base_url: String,
    pub api_key: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub data_dir: String,
    pub log_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/tradewarden.db".to_string(),
            redis_url: None,
            data_dir: "data".to_string(),
            log_dir: "logs".to_string(),
        }
    }
}

/// Administrative HTTP/WS surface binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8720,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Telegram,
    Email,
    Log,
    Push,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSink {
    pub kind: NotificationKind,
    pub target: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: ExecutionMode,
    pub symbols: Vec<String>,
    /// Seconds between trading ticks per symbol.
    pub tick_interval_secs: u64,
    /// Enables the debate refinement stage of the coordinator.
    pub debate_enabled: bool,

    pub exchange: ExchangeConfig,
    pub ai: Option<AiConfig>,
    pub risk: RiskConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub gateway: GatewayConfig,
    pub notification: Vec<NotificationSink>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Simulated,
            symbols: vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()],
            tick_interval_secs: 60,
            debate_enabled: false,
            exchange: ExchangeConfig::default(),
            ai: None,
            risk: RiskConfig::default(),
            network: NetworkConfig::default(),
            storage: StorageConfig::default(),
            gateway: GatewayConfig::default(),
            notification: vec![NotificationSink {
                kind: NotificationKind::Log,
                target: None,
            }],
        }
    }
}

impl Config {
    /// Load configuration: TOML file (if `TRADEWARDEN_CONFIG` points at one)
    /// first, then environment variable overrides, then validation.
    pub fn load() -> Result<Self> {
        let mut config = match env::var("TRADEWARDEN_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides()?;
        config.risk.validate().context("risk configuration invalid")?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {:?}", path.as_ref()))?;
        toml::from_str(&raw).context("failed to parse config file")
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(mode) = env::var("MODE") {
            self.mode = mode.parse()?;
        }
        if let Ok(symbols) = env::var("SYMBOLS") {
            self.symbols = symbols
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = env::var("TICK_INTERVAL_SECS") {
            self.tick_interval_secs = v.parse().context("Failed to parse TICK_INTERVAL_SECS")?;
        }
        if let Ok(v) = env::var("DEBATE_ENABLED") {
            self.debate_enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }

        if let Ok(v) = env::var("EXCHANGE_NAME") {
            self.exchange.name = v;
        }
        if let Ok(v) = env::var("EXCHANGE_API_KEY") {
            self.exchange.api_key = v;
        }
        if let Ok(v) = env::var("EXCHANGE_API_SECRET") {
            self.exchange.api_secret = v;
        }
        if let Ok(v) = env::var("EXCHANGE_TESTNET") {
            self.exchange.testnet = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = env::var("EXCHANGE_BASE_URL") {
            self.exchange.base_url = v;
        }
        if let Ok(v) = env::var("EXCHANGE_WS_URL") {
            self.exchange.ws_url = v;
        }

        if let Ok(v) = env::var("DATABASE_URL") {
            self.storage.database_url = v;
        }
        if let Ok(v) = env::var("DATA_DIR") {
            self.storage.data_dir = v;
        }
        if let Ok(v) = env::var("GATEWAY_HOST") {
            self.gateway.host = v;
        }
        if let Ok(v) = env::var("GATEWAY_PORT") {
            self.gateway.port = v.parse().context("Failed to parse GATEWAY_PORT")?;
        }

        self.risk.apply_env_overrides()?;
        self.network.apply_env_overrides()?;
        Ok(())
    }

    /// True when AI-backed agents should be constructed instead of the
    /// rule-based set.
    pub fn ai_enabled(&self) -> bool {
        self.ai
            .as_ref()
            .map(|ai| !ai.api_key.is_empty())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("paper".parse::<ExecutionMode>().unwrap(), ExecutionMode::Simulated);
        assert_eq!("live".parse::<ExecutionMode>().unwrap(), ExecutionMode::Exchange);
        assert!("hybrid".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.risk.validate().is_ok());
        assert!(!config.ai_enabled());
        assert_eq!(config.mode, ExecutionMode::Simulated);
    }

    #[test]
    fn test_toml_round_trip() {
        let raw = r#"
            mode = "simulated"
            symbols = ["BTC/USDT"]

            [risk]
            max_position_pct = 0.10
            max_leverage = 3.0

            [gateway]
            host = "0.0.0.0"
            port = 9000
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.symbols, vec!["BTC/USDT"]);
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.risk.max_position_pct, 0.10);
    }
}
