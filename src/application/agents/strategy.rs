//! Strategy-rule agent: trend-following, moving-average and breakout rules
//! condensed into one directional signal.

use crate::application::agents::{Agent, AgentContext};
use crate::domain::decision::AgentOutput;
use crate::domain::market::MarketState;
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;

pub struct StrategyAgent;

impl StrategyAgent {
    fn trend_rule(state: &MarketState) -> f64 {
        let ind = &state.indicators;
        let price = state.price.to_f64().unwrap_or(0.0);
        let mut score = 0.0;

        if price > ind.ema_slow && price > ind.ema_fast {
            score += 0.2;
        } else if price < ind.ema_slow && price < ind.ema_fast {
            score -= 0.2;
        }

        if ind.ema_slow > 0.0 {
            let slope = (ind.ema_fast - ind.ema_slow) / ind.ema_slow;
            if slope > 0.01 {
                score += 0.1;
            } else if slope < -0.01 {
                score -= 0.1;
            }
        }
        score
    }

    fn ma_rule(state: &MarketState, reasons: &mut Vec<String>) -> f64 {
        let price = state.price.to_f64().unwrap_or(0.0);
        let sma_20 = state.indicators.bollinger_middle;
        if sma_20 <= 0.0 {
            return 0.0;
        }
        if price > sma_20 {
            reasons.push("price holding above SMA20".to_string());
            0.15
        } else {
            reasons.push("price lost SMA20".to_string());
            -0.15
        }
    }

    fn breakout_rule(state: &MarketState, reasons: &mut Vec<String>) -> f64 {
        let ind = &state.indicators;
        let price = state.price.to_f64().unwrap_or(0.0);

        if price > ind.bollinger_upper {
            reasons.push("breakout above upper band".to_string());
            0.2
        } else if price > ind.bollinger_middle {
            0.1
        } else if price < ind.bollinger_lower {
            reasons.push("breakdown below lower band".to_string());
            -0.2
        } else if price < ind.bollinger_middle {
            -0.1
        } else {
            0.0
        }
    }
}

#[async_trait]
impl Agent for StrategyAgent {
    fn name(&self) -> &'static str {
        "strategy"
    }

    async fn analyse(&self, ctx: AgentContext) -> AgentOutput {
        let state = &ctx.market;
        let mut reasons = Vec::new();

        let mut score = Self::trend_rule(state);
        score += Self::ma_rule(state, &mut reasons);
        score += Self::breakout_rule(state, &mut reasons);
        score = (score / 3.0).clamp(-1.0, 1.0);

        AgentOutput::new(self.name(), score, 0.6, reasons)
    }
}
