//! Technical analysis agent: trend, momentum and volume read from the
//! indicator set.

use crate::application::agents::{Agent, AgentContext};
use crate::domain::decision::AgentOutput;
use crate::domain::market::MarketState;
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;

pub struct MarketAgent;

impl MarketAgent {
    fn analyse_trend(state: &MarketState, reasons: &mut Vec<String>) -> f64 {
        let mut score = 0.0;
        let ind = &state.indicators;
        let price = state.price.to_f64().unwrap_or(0.0);

        if ind.ema_fast > ind.ema_slow {
            score += 0.2;
            reasons.push(format!(
                "EMA golden cross: fast {:.2} > slow {:.2}",
                ind.ema_fast, ind.ema_slow
            ));
        } else if ind.ema_fast < ind.ema_slow {
            score -= 0.2;
            reasons.push(format!(
                "EMA death cross: fast {:.2} < slow {:.2}",
                ind.ema_fast, ind.ema_slow
            ));
        }

        if price > ind.bollinger_middle {
            score += 0.1;
        } else {
            score -= 0.1;
        }

        if price > ind.ema_slow {
            score += 0.1;
            reasons.push("price above slow EMA".to_string());
        } else {
            score -= 0.1;
            reasons.push("price below slow EMA".to_string());
        }

        score
    }

    fn analyse_momentum(state: &MarketState, reasons: &mut Vec<String>) -> f64 {
        let mut score = 0.0;
        let ind = &state.indicators;
        let price = state.price.to_f64().unwrap_or(0.0);

        if ind.rsi > 70.0 {
            score -= 0.15;
            reasons.push(format!("RSI overbought: {:.1}", ind.rsi));
        } else if ind.rsi < 30.0 {
            score += 0.15;
            reasons.push(format!("RSI oversold: {:.1}", ind.rsi));
        } else if ind.rsi > 55.0 {
            score += 0.1;
        } else if ind.rsi < 45.0 {
            score -= 0.1;
        }

        // Histogram beyond 0.1% of price counts as accelerating.
        let strong = price > 0.0 && ind.macd_histogram.abs() > price * 0.001;
        if ind.macd_histogram > 0.0 {
            score += if strong { 0.15 } else { 0.1 };
            if strong {
                reasons.push("MACD histogram accelerating up".to_string());
            }
        } else if ind.macd_histogram < 0.0 {
            score -= if strong { 0.15 } else { 0.1 };
            if strong {
                reasons.push("MACD histogram accelerating down".to_string());
            }
        }

        score
    }

    fn analyse_volume(state: &MarketState, reasons: &mut Vec<String>) -> f64 {
        let ratio = state.indicators.volume_ratio;
        if ratio > 1.5 {
            reasons.push(format!("volume surge: ratio {:.2}", ratio));
            0.2
        } else if ratio > 1.2 {
            0.1
        } else if ratio < 0.7 {
            reasons.push(format!("volume drying up: ratio {:.2}", ratio));
            -0.1
        } else {
            0.0
        }
    }

    fn confidence(state: &MarketState) -> f64 {
        let ind = &state.indicators;
        let price = state.price.to_f64().unwrap_or(0.0);
        let mut factors: f64 = 0.0;

        if (ind.rsi - 50.0).abs() > 20.0 {
            factors += 0.1;
        }
        if price > 0.0 && ind.macd_histogram.abs() > price * 0.001 {
            factors += 0.1;
        }
        if ind.ema_slow > 0.0 && ((ind.ema_fast - ind.ema_slow) / ind.ema_slow).abs() > 0.02 {
            factors += 0.1;
        }

        (factors * 0.5 + 0.5).min(0.95)
    }
}

#[async_trait]
impl Agent for MarketAgent {
    fn name(&self) -> &'static str {
        "market"
    }

    async fn analyse(&self, ctx: AgentContext) -> AgentOutput {
        let state = &ctx.market;
        let mut reasons = Vec::new();

        let mut score = 0.0;
        score += Self::analyse_trend(state, &mut reasons);
        score += Self::analyse_momentum(state, &mut reasons);
        score += Self::analyse_volume(state, &mut reasons);
        score = (score / 4.0).clamp(-1.0, 1.0);

        AgentOutput::new(self.name(), score, Self::confidence(state), reasons)
            .with_indicator("rsi", state.indicators.rsi)
            .with_indicator("macd_histogram", state.indicators.macd_histogram)
            .with_indicator("volume_ratio", state.indicators.volume_ratio)
    }
}
