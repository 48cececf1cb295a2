//! Risk limit configuration.
//!
//! Limits are runtime-mutable through the admin surface, but each one is
//! floored by a compiled constant: operators can tighten limits freely and
//! can never loosen them past the binary's floor.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Compiled lower/upper bounds that user configuration cannot cross.
pub mod floors {
    pub const MAX_POSITION_PCT_CEIL: f64 = 0.25;
    pub const MAX_LEVERAGE_CEIL: f64 = 10.0;
    pub const MAX_DAILY_LOSS_PCT_CEIL: f64 = 0.15;
    pub const MAX_TOTAL_EXPOSURE_CEIL: f64 = 1.0;
    pub const STOP_LOSS_PCT_MIN: f64 = 0.005;
    pub const MAX_OPEN_POSITIONS_CEIL: usize = 20;
    pub const MAX_DAILY_TRADES_CEIL: u32 = 200;
}

/// How the gateway treats limit breaches on clampable rules (4-10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskMode {
    /// Breaches reject.
    Strict,
    /// Breaches reduce size/leverage to the limit where possible.
    Clamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub mode: RiskMode,
    pub risk_level: String,

    /// Max order notional as a fraction of equity.
    pub max_position_pct: f64,
    pub max_leverage: f64,
    pub max_daily_loss_pct: f64,
    /// Per-symbol exposure cap, fraction of equity.
    pub max_single_symbol_exposure: f64,
    /// Total open notional cap, fraction of equity.
    pub max_total_exposure: f64,
    pub max_open_positions: usize,
    pub max_daily_trades: u32,

    pub stop_loss_pct: f64,
    pub stop_loss_min_pct: f64,
    pub stop_loss_max_pct: f64,
    pub take_profit_max_pct: f64,
    pub trailing_stop_pct: Option<f64>,

    /// Drawdown fraction that trips the account breaker from the gateway.
    pub breaker_drawdown_trigger: f64,
    /// Minimum order notional; reductions below this reject instead.
    pub dust_notional: f64,

    pub symbol_deny_list: Vec<String>,

    // Circuit breaker thresholds
    pub strategy_max_daily_loss: f64,
    pub strategy_max_consecutive_losses: u32,
    pub account_max_daily_loss: f64,
    pub account_max_drawdown: f64,
    pub system_volatility_threshold: f64,
    pub system_api_failure_threshold: u32,
    pub system_panic_sell_threshold: f64,
    pub auto_recover_minutes: u64,
    pub manual_recover: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            mode: RiskMode::Clamp,
            risk_level: "medium".to_string(),
            max_position_pct: 0.10,
            max_leverage: 3.0,
            max_daily_loss_pct: 0.10,
            max_single_symbol_exposure: 0.15,
            max_total_exposure: 0.50,
            max_open_positions: 5,
            max_daily_trades: 40,
            stop_loss_pct: 0.05,
            stop_loss_min_pct: 0.02,
            stop_loss_max_pct: 0.15,
            take_profit_max_pct: 0.30,
            trailing_stop_pct: None,
            breaker_drawdown_trigger: 0.20,
            dust_notional: 10.0,
            // Stablecoins are never tradeable with leverage.
            symbol_deny_list: vec!["USDT".to_string(), "DAI".to_string(), "TUSD".to_string()],
            strategy_max_daily_loss: 0.05,
            strategy_max_consecutive_losses: 5,
            account_max_daily_loss: 0.10,
            account_max_drawdown: 0.20,
            system_volatility_threshold: 0.20,
            system_api_failure_threshold: 5,
            system_panic_sell_threshold: 0.15,
            auto_recover_minutes: 60,
            manual_recover: false,
        }
    }
}

impl RiskConfig {
    /// Validate ranges and enforce the compiled floors.
    pub fn validate(&self) -> Result<()> {
        if self.max_position_pct <= 0.0 || self.max_position_pct > floors::MAX_POSITION_PCT_CEIL {
            bail!(
                "max_position_pct must be in (0, {}], got {}",
                floors::MAX_POSITION_PCT_CEIL,
                self.max_position_pct
            );
        }
        if self.max_leverage < 1.0 || self.max_leverage > floors::MAX_LEVERAGE_CEIL {
            bail!(
                "max_leverage must be in [1, {}], got {}",
                floors::MAX_LEVERAGE_CEIL,
                self.max_leverage
            );
        }
        if self.max_daily_loss_pct <= 0.0 || self.max_daily_loss_pct > floors::MAX_DAILY_LOSS_PCT_CEIL {
            bail!(
                "max_daily_loss_pct must be in (0, {}], got {}",
                floors::MAX_DAILY_LOSS_PCT_CEIL,
                self.max_daily_loss_pct
            );
        }
        if self.max_total_exposure <= 0.0 || self.max_total_exposure > floors::MAX_TOTAL_EXPOSURE_CEIL {
            bail!("max_total_exposure must be in (0, 1], got {}", self.max_total_exposure);
        }
        if self.max_single_symbol_exposure > self.max_total_exposure {
            bail!("max_single_symbol_exposure cannot exceed max_total_exposure");
        }
        if self.stop_loss_min_pct < floors::STOP_LOSS_PCT_MIN {
            bail!(
                "stop_loss_min_pct must be >= {}, got {}",
                floors::STOP_LOSS_PCT_MIN,
                self.stop_loss_min_pct
            );
        }
        if self.stop_loss_min_pct > self.stop_loss_max_pct {
            bail!("stop_loss_min_pct cannot exceed stop_loss_max_pct");
        }
        if self.max_open_positions == 0 || self.max_open_positions > floors::MAX_OPEN_POSITIONS_CEIL {
            bail!(
                "max_open_positions must be in [1, {}], got {}",
                floors::MAX_OPEN_POSITIONS_CEIL,
                self.max_open_positions
            );
        }
        if self.max_daily_trades == 0 || self.max_daily_trades > floors::MAX_DAILY_TRADES_CEIL {
            bail!(
                "max_daily_trades must be in [1, {}], got {}",
                floors::MAX_DAILY_TRADES_CEIL,
                self.max_daily_trades
            );
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = env::var("RISK_MODE") {
            self.mode = match v.to_lowercase().as_str() {
                "strict" => RiskMode::Strict,
                "clamp" | "soft" => RiskMode::Clamp,
                other => bail!("Invalid RISK_MODE: {}", other),
            };
        }
        if let Ok(v) = env::var("MAX_POSITION_PCT") {
            self.max_position_pct = v.parse()?;
        }
        if let Ok(v) = env::var("MAX_LEVERAGE") {
            self.max_leverage = v.parse()?;
        }
        if let Ok(v) = env::var("MAX_DAILY_LOSS_PCT") {
            self.max_daily_loss_pct = v.parse()?;
        }
        if let Ok(v) = env::var("MAX_OPEN_POSITIONS") {
            self.max_open_positions = v.parse()?;
        }
        if let Ok(v) = env::var("STOP_LOSS_PCT") {
            self.stop_loss_pct = v.parse()?;
        }
        if let Ok(v) = env::var("SYMBOL_DENY_LIST") {
            self.symbol_deny_list = v.split(',').map(|s| s.trim().to_uppercase()).collect();
        }
        Ok(())
    }

    /// True when the symbol (or its base currency) is on the deny list.
    pub fn is_denied(&self, symbol: &str) -> bool {
        let base = symbol.split('/').next().unwrap_or(symbol);
        self.symbol_deny_list
            .iter()
            .any(|d| d.eq_ignore_ascii_case(symbol) || d.eq_ignore_ascii_case(base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(RiskConfig::default().validate().is_ok());
    }

    #[test]
    fn test_floors_cannot_be_loosened() {
        let mut config = RiskConfig::default();
        config.max_position_pct = 0.50; // past the 0.25 ceiling
        assert!(config.validate().is_err());

        let mut config = RiskConfig::default();
        config.max_leverage = 50.0;
        assert!(config.validate().is_err());

        let mut config = RiskConfig::default();
        config.stop_loss_min_pct = 0.0001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deny_list_matches_base_currency() {
        let config = RiskConfig::default();
        assert!(config.is_denied("USDT/USD"));
        assert!(config.is_denied("DAI"));
        assert!(!config.is_denied("BTC/USDT"));
    }
}
