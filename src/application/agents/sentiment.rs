//! Sentiment agent. Contrarian on the fear-and-greed index: extreme fear is
//! a buy signal, extreme greed a sell signal.

use crate::application::agents::{Agent, AgentContext};
use crate::domain::decision::AgentOutput;
use async_trait::async_trait;

pub struct SentimentAgent;

#[async_trait]
impl Agent for SentimentAgent {
    fn name(&self) -> &'static str {
        "sentiment"
    }

    async fn analyse(&self, ctx: AgentContext) -> AgentOutput {
        let mut score: f64 = 0.0;
        let mut reasons = Vec::new();

        let sentiment = ctx.market.sentiment.clone().unwrap_or_default();
        let fg = sentiment.fear_greed_index;
        match fg {
            0..=25 => {
                score += 0.3;
                reasons.push(format!("extreme fear: {}/100", fg));
            }
            26..=40 => {
                score += 0.15;
                reasons.push(format!("fear: {}/100", fg));
            }
            75..=100 => {
                score -= 0.3;
                reasons.push(format!("extreme greed: {}/100", fg));
            }
            60..=74 => {
                score -= 0.15;
                reasons.push(format!("greed: {}/100", fg));
            }
            _ => {
                score += 0.05;
            }
        }

        if sentiment.social_sentiment > 0.3 {
            score -= 0.1;
            reasons.push("social sentiment euphoric".to_string());
        } else if sentiment.social_sentiment < -0.3 {
            score += 0.1;
            reasons.push("social sentiment capitulating".to_string());
        }

        if sentiment.twitter_volume > 50_000 {
            if sentiment.social_sentiment > 0.2 {
                score -= 0.1;
                reasons.push("high chatter with optimism".to_string());
            } else {
                score += 0.05;
            }
        }

        if let Some(macro_data) = &ctx.market.macro_data {
            let vix = macro_data.vix_index;
            if vix > 30.0 {
                score += 0.1;
                reasons.push(format!("VIX elevated: {:.1}", vix));
            } else if vix > 0.0 && vix < 15.0 {
                score -= 0.1;
                reasons.push(format!("VIX complacent: {:.1}", vix));
            }
        }

        AgentOutput::new(self.name(), (score / 4.0).clamp(-1.0, 1.0), 0.55, reasons)
            .with_indicator("fear_greed", fg as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::agents::test_support::{context, market_state};
    use crate::domain::market::{IndicatorSet, SentimentSnapshot};

    fn ctx_with_fg(fg: u8) -> crate::application::agents::AgentContext {
        let mut ctx = context(market_state(50_000.0, IndicatorSet::default()));
        ctx.market.sentiment = Some(SentimentSnapshot {
            fear_greed_index: fg,
            ..Default::default()
        });
        ctx
    }

    #[tokio::test]
    async fn test_extreme_fear_is_contrarian_bullish() {
        let out = SentimentAgent.analyse(ctx_with_fg(10)).await;
        assert!(out.score > 0.0);
        assert!(out.reasons.iter().any(|r| r.contains("extreme fear")));
    }

    #[tokio::test]
    async fn test_extreme_greed_is_contrarian_bearish() {
        let out = SentimentAgent.analyse(ctx_with_fg(90)).await;
        assert!(out.score < 0.0);
    }

    #[tokio::test]
    async fn test_neutral_index_is_mildly_positive() {
        let out = SentimentAgent.analyse(ctx_with_fg(50)).await;
        assert!(out.score > 0.0 && out.score < 0.05);
    }
}
