//! Market-data service: assembles the immutable [`MarketState`] snapshot a
//! trading tick runs on. Raw OHLCV is cached per (symbol, timeframe) with a
//! TTL no longer than one bar period so all agents in a tick see the same
//! data without refetching.

pub mod indicators;

use crate::domain::errors::{MarketDataError, NetworkError};
use crate::domain::market::{MacroSnapshot, MarketState, OnChainSnapshot, SentimentSnapshot};
use crate::domain::types::Candle;
use crate::infrastructure::network::{CallClass, NetworkHandler};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeframe {
    M5,
    M15,
    H1,
    H4,
}

impl Timeframe {
    pub fn label(&self) -> &'static str {
        match self {
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
        }
    }

    pub fn bar_duration(&self) -> Duration {
        match self {
            Timeframe::M5 => Duration::from_secs(300),
            Timeframe::M15 => Duration::from_secs(900),
            Timeframe::H1 => Duration::from_secs(3_600),
            Timeframe::H4 => Duration::from_secs(14_400),
        }
    }

    /// Cache TTL: at most one bar period, capped so intraday re-use within a
    /// tick never serves stale hourly data.
    fn cache_ttl(&self) -> Duration {
        self.bar_duration().min(Duration::from_secs(60))
    }
}

/// Source of raw OHLCV windows.
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, MarketDataError>;
}

/// Auxiliary (on-chain / sentiment / macro) providers. All optional; the
/// pipeline degrades to neutral values when a provider is unavailable.
#[async_trait]
pub trait AuxDataProvider: Send + Sync {
    async fn onchain(&self, _symbol: &str) -> Option<OnChainSnapshot> {
        None
    }
    async fn sentiment(&self) -> Option<SentimentSnapshot> {
        None
    }
    async fn macro_data(&self) -> Option<MacroSnapshot> {
        None
    }
}

/// Provider used when nothing is configured: neutral across the board.
pub struct NeutralAuxProvider;

#[async_trait]
impl AuxDataProvider for NeutralAuxProvider {
    async fn sentiment(&self) -> Option<SentimentSnapshot> {
        Some(SentimentSnapshot::default())
    }
}

/// Pre-loaded candle source for the simulator and tests. `set_index` moves
/// the visible window forward so a backtest only ever sees history.
pub struct StaticCandleSource {
    bars: RwLock<HashMap<(String, Timeframe), Vec<Candle>>>,
    visible: RwLock<HashMap<String, usize>>,
}

impl Default for StaticCandleSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticCandleSource {
    pub fn new() -> Self {
        Self {
            bars: RwLock::new(HashMap::new()),
            visible: RwLock::new(HashMap::new()),
        }
    }

    pub async fn load(&self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        self.bars
            .write()
            .await
            .insert((symbol.to_string(), timeframe), candles);
    }

    /// Limit the visible history for `symbol` to bars `0..=index`.
    pub async fn set_index(&self, symbol: &str, index: usize) {
        self.visible.write().await.insert(symbol.to_string(), index);
    }
}

#[async_trait]
impl CandleSource for StaticCandleSource {
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, MarketDataError> {
        let bars = self.bars.read().await;
        let all = bars
            .get(&(symbol.to_string(), timeframe))
            .ok_or_else(|| MarketDataError::InvalidData {
                symbol: symbol.to_string(),
                reason: format!("no {} candles loaded", timeframe.label()),
            })?;

        let end = match self.visible.read().await.get(symbol) {
            Some(idx) => (idx + 1).min(all.len()),
            None => all.len(),
        };
        let start = end.saturating_sub(limit);
        Ok(all[start..end].to_vec())
    }
}

/// Exchange kline source (Binance wire format), routed through the
/// resilience layer.
pub struct BinanceCandleSource {
    client: reqwest::Client,
    base_url: String,
    network: Arc<NetworkHandler>,
}

impl BinanceCandleSource {
    pub fn new(base_url: String, network: Arc<NetworkHandler>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            network,
        }
    }
}

#[async_trait]
impl CandleSource for BinanceCandleSource {
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, MarketDataError> {
        let api_symbol = crate::domain::types::denormalize_symbol(symbol);
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            api_symbol,
            timeframe.label(),
            limit
        );

        let rows = self
            .network
            .execute("klines", CallClass::Query, || async {
                let response = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| NetworkError::Connection(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(NetworkError::Server {
                        status: response.status().as_u16(),
                        message: response.text().await.unwrap_or_default(),
                    });
                }
                response
                    .json::<Vec<Vec<serde_json::Value>>>()
                    .await
                    .map_err(|e| NetworkError::Connection(e.to_string()))
            })
            .await?;

        let parse = |v: &serde_json::Value| -> Decimal {
            v.as_str()
                .and_then(|s| Decimal::from_str(s).ok())
                .unwrap_or_default()
        };

        let candles = rows
            .iter()
            .filter(|row| row.len() >= 6)
            .map(|row| Candle {
                symbol: symbol.to_string(),
                open: parse(&row[1]),
                high: parse(&row[2]),
                low: parse(&row[3]),
                close: parse(&row[4]),
                volume: parse(&row[5]),
                timestamp: row[0].as_i64().unwrap_or(0) / 1000,
            })
            .collect();
        Ok(candles)
    }
}

struct CachedWindow {
    fetched_at: Instant,
    candles: Vec<Candle>,
}

/// Minimum 1h history for a meaningful indicator set (MACD slow + signal).
const MIN_HISTORY: usize = 35;
const FETCH_LIMIT: usize = 120;

pub struct MarketDataService {
    source: Arc<dyn CandleSource>,
    aux: Arc<dyn AuxDataProvider>,
    cache: RwLock<HashMap<(String, Timeframe), CachedWindow>>,
}

impl MarketDataService {
    pub fn new(source: Arc<dyn CandleSource>, aux: Arc<dyn AuxDataProvider>) -> Self {
        Self {
            source,
            aux,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn window(&self, symbol: &str, timeframe: Timeframe) -> Result<Vec<Candle>, MarketDataError> {
        let key = (symbol.to_string(), timeframe);
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&key) {
                if entry.fetched_at.elapsed() < timeframe.cache_ttl() {
                    debug!("MarketDataService: cache hit for {} {}", symbol, timeframe.label());
                    return Ok(entry.candles.clone());
                }
            }
        }

        let candles = self.source.fetch_ohlcv(symbol, timeframe, FETCH_LIMIT).await?;
        self.cache.write().await.insert(
            key,
            CachedWindow {
                fetched_at: Instant::now(),
                candles: candles.clone(),
            },
        );
        Ok(candles)
    }

    /// Invalidate cached windows (used by backtests when the clock jumps).
    pub async fn invalidate(&self, symbol: &str) {
        self.cache
            .write()
            .await
            .retain(|(cached_symbol, _), _| cached_symbol != symbol);
    }

    /// Assemble the snapshot for one tick. `bar_index` is simulation
    /// provenance and is carried through to look-ahead checks.
    pub async fn market_state(
        &self,
        symbol: &str,
        bar_index: Option<usize>,
    ) -> Result<MarketState, MarketDataError> {
        let ohlcv_1h = self.window(symbol, Timeframe::H1).await?;
        if ohlcv_1h.len() < MIN_HISTORY {
            return Err(MarketDataError::InsufficientHistory {
                symbol: symbol.to_string(),
                have: ohlcv_1h.len(),
                need: MIN_HISTORY,
            });
        }

        let ohlcv_5m = self.window(symbol, Timeframe::M5).await.unwrap_or_default();
        let ohlcv_15m = self.window(symbol, Timeframe::M15).await.unwrap_or_default();
        let ohlcv_4h = self.window(symbol, Timeframe::H4).await.unwrap_or_default();

        let price = ohlcv_5m
            .last()
            .or_else(|| ohlcv_1h.last())
            .map(|c| c.close)
            .unwrap_or_default();

        let indicators = indicators::compute(&ohlcv_1h);

        // Auxiliary data degrades to neutral defaults when unavailable.
        let onchain = self.aux.onchain(symbol).await;
        let sentiment = match self.aux.sentiment().await {
            Some(s) => Some(s),
            None => {
                warn!("MarketDataService: sentiment provider unavailable, using neutral");
                Some(SentimentSnapshot::default())
            }
        };
        let macro_data = self.aux.macro_data().await;

        Ok(MarketState {
            symbol: symbol.to_string(),
            price,
            timestamp: Utc::now(),
            ohlcv_5m,
            ohlcv_15m,
            ohlcv_1h,
            ohlcv_4h,
            orderbook_bids: Vec::new(),
            orderbook_asks: Vec::new(),
            funding_rate: 0.0,
            open_interest: 0.0,
            open_interest_change: 0.0,
            indicators,
            onchain,
            sentiment,
            macro_data,
            bar_index,
        })
    }
}
