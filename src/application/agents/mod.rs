//! Analyst agents.
//!
//! Each agent transforms one market snapshot into an [`AgentOutput`]. Agents
//! are stateless per tick and do no I/O: everything they need is pre-fetched
//! into the [`AgentContext`] before fan-out.

pub mod macro_econ;
pub mod market;
pub mod onchain;
pub mod risk;
pub mod sentiment;
pub mod strategy;

pub use macro_econ::MacroAgent;
pub use market::MarketAgent;
pub use onchain::OnChainAgent;
pub use risk::RiskAgent;
pub use sentiment::SentimentAgent;
pub use strategy::StrategyAgent;

use crate::domain::decision::AgentOutput;
use crate::domain::market::MarketState;
use crate::domain::types::{AccountState, Position};
use async_trait::async_trait;

/// Everything an agent may look at during one tick, passed by value so the
/// fan-out tasks own their inputs.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub market: MarketState,
    pub positions: Vec<Position>,
    pub account: AccountState,
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;

    async fn analyse(&self, ctx: AgentContext) -> AgentOutput;

    /// Debate hook: a dissenting agent sees a digest of the majority's
    /// reasons and may revise its vote. `None` keeps the original output;
    /// the rule-based agents are deterministic and do not revise.
    async fn revise(
        &self,
        _ctx: AgentContext,
        _own: &AgentOutput,
        _majority_reasons: &[String],
    ) -> Option<AgentOutput> {
        None
    }
}

/// The built-in rule-based analyst set with the default weight layout.
pub fn default_agents(risk_config: crate::config::RiskConfig) -> Vec<std::sync::Arc<dyn Agent>> {
    vec![
        std::sync::Arc::new(MarketAgent),
        std::sync::Arc::new(StrategyAgent),
        std::sync::Arc::new(RiskAgent::new(risk_config)),
        std::sync::Arc::new(OnChainAgent),
        std::sync::Arc::new(SentimentAgent),
        std::sync::Arc::new(MacroAgent),
    ]
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::domain::market::{IndicatorSet, SentimentSnapshot};
    use chrono::Utc;
    use rust_decimal::Decimal;

    pub fn market_state(price: f64, indicators: IndicatorSet) -> MarketState {
        use rust_decimal::prelude::FromPrimitive;
        MarketState {
            symbol: "BTC/USDT".to_string(),
            price: Decimal::from_f64(price).unwrap(),
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
            indicators,
            onchain: None,
            sentiment: Some(SentimentSnapshot::default()),
            macro_data: None,
            bar_index: None,
        }
    }

    pub fn context(state: MarketState) -> AgentContext {
        AgentContext {
            market: state,
            positions: vec![],
            account: AccountState {
                total_equity: Decimal::from(10_000),
                available_balance: Decimal::from(10_000),
                ..Default::default()
            },
        }
    }
}
