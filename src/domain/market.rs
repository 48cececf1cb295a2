use crate::domain::types::{BookLevel, Candle};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Technical indicators computed over the primary (1h) window.
///
/// The formulae behind these values are normative: backtest and live must
/// produce bit-identical numbers from identical inputs, so the math lives in
/// `application::market_data::indicators` with a fixed accumulation order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub rsi: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub bollinger_upper: f64,
    pub bollinger_middle: f64,
    pub bollinger_lower: f64,
    pub atr: f64,
    pub volume_ratio: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OnChainSnapshot {
    /// Net flow into exchanges; positive = inflow (sell pressure).
    pub exchange_net_flow: f64,
    pub whale_transactions: u32,
    pub stablecoin_mint: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentSnapshot {
    /// Fear & Greed index, 0 (extreme fear) to 100 (extreme greed).
    pub fear_greed_index: u8,
    pub social_sentiment: f64,
    pub twitter_volume: u32,
}

impl Default for SentimentSnapshot {
    fn default() -> Self {
        Self {
            fear_greed_index: 50,
            social_sentiment: 0.0,
            twitter_volume: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MacroSnapshot {
    pub dxy_index: f64,
    pub sp500_change: f64,
    pub gold_price: f64,
    pub bond_yield_10y: f64,
    pub vix_index: f64,
}

/// Immutable market snapshot for one tick of one symbol.
///
/// Built once by the market-data service, passed by value to every agent,
/// and dropped when the tick completes. Agents never fetch data themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketState {
    pub symbol: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,

    pub ohlcv_5m: Vec<Candle>,
    pub ohlcv_15m: Vec<Candle>,
    pub ohlcv_1h: Vec<Candle>,
    pub ohlcv_4h: Vec<Candle>,

    pub orderbook_bids: Vec<BookLevel>,
    pub orderbook_asks: Vec<BookLevel>,

    pub funding_rate: f64,
    pub open_interest: f64,
    pub open_interest_change: f64,

    pub indicators: IndicatorSet,

    pub onchain: Option<OnChainSnapshot>,
    pub sentiment: Option<SentimentSnapshot>,
    pub macro_data: Option<MacroSnapshot>,

    /// In simulation, the bar index this snapshot was sampled at. The
    /// simulated adapter uses it to reject look-ahead signals.
    pub bar_index: Option<usize>,
}

impl MarketState {
    /// ATR as a fraction of price; the coordinator's volatility input.
    pub fn atr_pct(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        let price = self.price.to_f64().unwrap_or(0.0);
        if price > 0.0 {
            self.indicators.atr / price
        } else {
            0.0
        }
    }

    pub fn fear_greed(&self) -> u8 {
        self.sentiment.as_ref().map(|s| s.fear_greed_index).unwrap_or(50)
    }
}
