//! Daily workflow artefact.
//!
//! Once per trading day a `daily_state_YYYY-MM-DD.yaml` file is written to
//! the data directory with a market snapshot and the effective risk
//! parameters, so operators can diff what the system believed day to day.

use crate::config::RiskConfig;
use crate::domain::market::MarketState;
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
pub struct DailySymbolSnapshot {
    pub symbol: String,
    pub price: Decimal,
    pub rsi: f64,
    pub macd: f64,
    pub atr: f64,
    pub fear_greed: u8,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DailyState {
    pub date: NaiveDate,
    pub generated_at: String,
    pub markets: Vec<DailySymbolSnapshot>,
    pub risk_parameters: RiskConfig,
}

pub struct DailyStateWriter {
    data_dir: PathBuf,
}

impl DailyStateWriter {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.data_dir
            .join(format!("daily_state_{}.yaml", date.format("%Y-%m-%d")))
    }

    pub fn write(&self, states: &[MarketState], risk: &RiskConfig) -> Result<PathBuf> {
        let date = Utc::now().date_naive();
        let state = DailyState {
            date,
            generated_at: Utc::now().to_rfc3339(),
            markets: states
                .iter()
                .map(|s| DailySymbolSnapshot {
                    symbol: s.symbol.clone(),
                    price: s.price,
                    rsi: s.indicators.rsi,
                    macd: s.indicators.macd,
                    atr: s.indicators.atr,
                    fear_greed: s.fear_greed(),
                })
                .collect(),
            risk_parameters: risk.clone(),
        };

        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir).context("failed to create data dir")?;
        }
        let path = self.path_for(date);
        let yaml = serde_yaml::to_string(&state).context("failed to serialize daily state")?;
        std::fs::write(&path, yaml).context("failed to write daily state")?;
        info!("DailyStateWriter: wrote {:?}", path);
        Ok(path)
    }

    pub fn read(path: &Path) -> Result<DailyState> {
        let raw = std::fs::read_to_string(path).context("failed to read daily state")?;
        serde_yaml::from_str(&raw).context("failed to parse daily state")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::IndicatorSet;
    use rust_decimal_macros::dec;

    fn state() -> MarketState {
        MarketState {
            symbol: "BTC/USDT".to_string(),
            price: dec!(50000),
            timestamp: Utc::now(),
            ohlcv_5m: vec![],
            ohlcv_15m: vec![],
            ohlcv_1h: vec![],
            ohlcv_4h: vec![],
            orderbook_bids: vec![],
            orderbook_asks: vec![],
            funding_rate: 0.0,
            open_interest: 0.0,
            open_interest_change: 0.0,
            indicators: IndicatorSet {
                rsi: 55.0,
                macd: 12.0,
                atr: 800.0,
                ..Default::default()
            },
            onchain: None,
            sentiment: None,
            macro_data: None,
            bar_index: None,
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DailyStateWriter::new(dir.path());

        let path = writer.write(&[state()], &RiskConfig::default()).unwrap();
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("daily_state_"));

        let restored = DailyStateWriter::read(&path).unwrap();
        assert_eq!(restored.markets.len(), 1);
        assert_eq!(restored.markets[0].symbol, "BTC/USDT");
        assert_eq!(restored.markets[0].fear_greed, 50);
        assert_eq!(restored.risk_parameters.max_position_pct, 0.10);
    }
}
