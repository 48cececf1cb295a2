//! Macro agent: dollar strength, equity risk appetite, yields and the VIX,
//! read as tailwinds or headwinds for crypto risk assets.

use crate::application::agents::{Agent, AgentContext};
use crate::domain::decision::AgentOutput;
use async_trait::async_trait;

pub struct MacroAgent;

#[async_trait]
impl Agent for MacroAgent {
    fn name(&self) -> &'static str {
        "macro"
    }

    async fn analyse(&self, ctx: AgentContext) -> AgentOutput {
        let Some(macro_data) = &ctx.market.macro_data else {
            return AgentOutput::new(self.name(), 0.0, 0.3, vec!["no macro data".to_string()]);
        };

        let mut score: f64 = 0.0;
        let mut reasons = Vec::new();
        let mut risk_events = 0u32;

        let dxy = macro_data.dxy_index;
        if dxy > 107.0 {
            score -= 0.2;
            reasons.push(format!("dollar strength, DXY {:.1}", dxy));
            risk_events += 1;
        } else if dxy > 105.0 {
            score -= 0.1;
            reasons.push(format!("dollar firm, DXY {:.1}", dxy));
        } else if dxy > 0.0 && dxy < 100.0 {
            score += 0.15;
            reasons.push(format!("dollar weak, DXY {:.1}", dxy));
        }

        let sp500 = macro_data.sp500_change;
        if sp500 > 0.02 {
            score += 0.1;
            reasons.push(format!("risk appetite improving, S&P {:+.2}%", sp500 * 100.0));
        } else if sp500 < -0.02 {
            score -= 0.15;
            reasons.push(format!("risk appetite souring, S&P {:+.2}%", sp500 * 100.0));
            risk_events += 1;
        }

        if macro_data.gold_price > 2_200.0 {
            score += 0.1;
            reasons.push("gold bid, safe-haven demand".to_string());
        }

        let yield_10y = macro_data.bond_yield_10y;
        if yield_10y > 4.5 {
            score -= 0.15;
            reasons.push(format!("10y yield pressure: {:.2}%", yield_10y));
            risk_events += 1;
        } else if yield_10y > 0.0 && yield_10y < 3.5 {
            score += 0.05;
        }

        let vix = macro_data.vix_index;
        if vix > 25.0 {
            score -= 0.15;
            reasons.push(format!("market fear, VIX {:.1}", vix));
            risk_events += 1;
        } else if vix > 0.0 && vix < 15.0 {
            score += 0.05;
        }

        if risk_events >= 3 {
            score -= 0.2;
            reasons.push(format!("macro risk accumulating: {} events", risk_events));
        }

        AgentOutput::new(self.name(), (score / 4.0).clamp(-1.0, 1.0), 0.5, reasons)
            .with_indicator("dxy", dxy)
            .with_indicator("vix", vix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::agents::test_support::{context, market_state};
    use crate::domain::market::{IndicatorSet, MacroSnapshot};

    fn ctx_with_macro(data: MacroSnapshot) -> crate::application::agents::AgentContext {
        let mut ctx = context(market_state(50_000.0, IndicatorSet::default()));
        ctx.market.macro_data = Some(data);
        ctx
    }

    #[tokio::test]
    async fn test_no_data_is_neutral() {
        let out = MacroAgent
            .analyse(context(market_state(50_000.0, IndicatorSet::default())))
            .await;
        assert_eq!(out.score, 0.0);
    }

    #[tokio::test]
    async fn test_risk_off_stack_is_bearish() {
        let out = MacroAgent
            .analyse(ctx_with_macro(MacroSnapshot {
                dxy_index: 108.0,
                sp500_change: -0.03,
                gold_price: 2_000.0,
                bond_yield_10y: 4.8,
                vix_index: 32.0,
            }))
            .await;
        assert!(out.score < -0.15);
        assert!(out.reasons.iter().any(|r| r.contains("macro risk accumulating")));
    }

    #[tokio::test]
    async fn test_risk_on_backdrop_is_bullish() {
        let out = MacroAgent
            .analyse(ctx_with_macro(MacroSnapshot {
                dxy_index: 98.0,
                sp500_change: 0.025,
                gold_price: 2_000.0,
                bond_yield_10y: 3.2,
                vix_index: 14.0,
            }))
            .await;
        assert!(out.score > 0.0);
    }
}
