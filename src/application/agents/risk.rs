//! Risk agent: scores how hostile current conditions are to taking on a new
//! position. Its score is the negative of the accumulated risk, so the
//! coordinator's one-vote veto fires when risk runs high.

use crate::application::agents::{Agent, AgentContext};
use crate::config::RiskConfig;
use crate::domain::decision::AgentOutput;
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

const BASE_RISK: f64 = 0.3;

pub struct RiskAgent {
    config: RiskConfig,
}

impl RiskAgent {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    fn market_risk(ctx: &AgentContext, reasons: &mut Vec<String>) -> f64 {
        let mut score = 0.0;
        let volatility = ctx.market.atr_pct();
        if volatility > 0.05 {
            score += 0.2;
            reasons.push(format!("high volatility: {:.2}%", volatility * 100.0));
        } else if volatility > 0.03 {
            score += 0.1;
            reasons.push(format!("elevated volatility: {:.2}%", volatility * 100.0));
        }

        if ctx.market.funding_rate.abs() > 0.1 {
            score += 0.1;
            reasons.push(format!("extreme funding rate: {:.4}", ctx.market.funding_rate));
        }

        let fg = ctx.market.fear_greed();
        if fg < 20 || fg > 80 {
            score += 0.1;
            reasons.push(format!("extreme sentiment: {}/100", fg));
        }
        score
    }

    fn position_risk(&self, ctx: &AgentContext, reasons: &mut Vec<String>) -> f64 {
        if ctx.positions.is_empty() {
            return 0.0;
        }
        let mut score = 0.0;

        if ctx.positions.len() >= self.config.max_open_positions {
            score += 0.3;
            reasons.push(format!("position count at limit: {}", ctx.positions.len()));
        }

        let equity = ctx.account.total_equity;
        if equity > Decimal::ZERO {
            let exposure: Decimal = ctx.positions.iter().map(|p| p.notional()).sum();
            let exposure_frac = (exposure / equity).to_f64().unwrap_or(0.0);
            if exposure_frac > 0.5 {
                score += 0.2;
                reasons.push(format!("total exposure high: {:.1}%", exposure_frac * 100.0));
            }

            let unrealized: Decimal = ctx.positions.iter().map(|p| p.unrealized_pnl).sum();
            if unrealized < Decimal::ZERO {
                let loss_frac = (-unrealized / equity).to_f64().unwrap_or(0.0);
                if loss_frac > 0.03 {
                    score += 0.2;
                    reasons.push(format!("unrealized loss: {:.2}%", loss_frac * 100.0));
                }
            }
        }
        score
    }

    fn loss_risk(&self, ctx: &AgentContext, reasons: &mut Vec<String>) -> f64 {
        let daily_loss = ctx.account.daily_loss_pct;
        let mut score = 0.0;
        if daily_loss > 0.02 {
            score += 0.1;
            reasons.push(format!("intraday loss: {:.2}%", daily_loss * 100.0));
        }
        if daily_loss > 0.05 {
            score += 0.3;
            reasons.push("approaching daily stop".to_string());
        }
        if daily_loss >= self.config.max_daily_loss_pct {
            reasons.push("daily loss limit reached, trading paused".to_string());
        }
        score
    }
}

#[async_trait]
impl Agent for RiskAgent {
    fn name(&self) -> &'static str {
        "risk"
    }

    async fn analyse(&self, ctx: AgentContext) -> AgentOutput {
        let mut reasons = Vec::new();

        let mut risk = BASE_RISK;
        risk += Self::market_risk(&ctx, &mut reasons);
        risk += self.position_risk(&ctx, &mut reasons);
        risk += self.loss_risk(&ctx, &mut reasons);
        let risk = risk.clamp(0.0, 1.0);

        // Higher risk reads as a more bearish vote.
        AgentOutput::new(self.name(), -risk, 0.8, reasons).with_indicator("risk_level", risk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::agents::test_support::{context, market_state};
    use crate::domain::market::IndicatorSet;
    use crate::domain::types::{Position, PositionSide};
    use rust_decimal_macros::dec;

    fn calm_market() -> crate::domain::market::MarketState {
        market_state(
            50_000.0,
            IndicatorSet {
                atr: 500.0, // 1% of price
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_calm_conditions_give_base_risk() {
        let out = RiskAgent::new(RiskConfig::default()).analyse(context(calm_market())).await;
        assert!((out.score + BASE_RISK).abs() < 1e-9);
        assert_eq!(out.sub_indicators.get("risk_level"), Some(&BASE_RISK));
    }

    #[tokio::test]
    async fn test_high_volatility_raises_risk() {
        let state = market_state(
            50_000.0,
            IndicatorSet {
                atr: 3_000.0, // 6% of price
                ..Default::default()
            },
        );
        let out = RiskAgent::new(RiskConfig::default()).analyse(context(state)).await;
        assert!(out.score <= -(BASE_RISK + 0.2) + 1e-9);
        assert!(out.reasons.iter().any(|r| r.contains("volatility")));
    }

    #[tokio::test]
    async fn test_heavy_losses_push_risk_past_veto_threshold() {
        let mut ctx = context(calm_market());
        ctx.account.daily_loss_pct = 0.06;
        ctx.positions = vec![Position {
            symbol: "BTC/USDT".to_string(),
            side: PositionSide::Long,
            size: dec!(0.2),
            entry_price: dec!(52000),
            mark_price: dec!(50000),
            unrealized_pnl: dec!(-400),
            unrealized_pnl_pct: -0.038,
            leverage: 2.0,
            liquidation_price: None,
            margin: dec!(5200),
            stop_loss_pct: None,
            take_profit_pct: None,
        }];

        let out = RiskAgent::new(RiskConfig::default()).analyse(ctx).await;
        // base 0.3 + daily loss 0.4 + unrealized 0.2 -> veto territory
        assert!(out.score <= -0.5, "score was {}", out.score);
    }

    #[tokio::test]
    async fn test_risk_never_exceeds_one() {
        let mut ctx = context(market_state(
            50_000.0,
            IndicatorSet {
                atr: 5_000.0,
                ..Default::default()
            },
        ));
        ctx.account.daily_loss_pct = 0.2;
        ctx.market.funding_rate = 0.2;
        let out = RiskAgent::new(RiskConfig::default()).analyse(ctx).await;
        assert!(out.score >= -1.0);
    }
}
