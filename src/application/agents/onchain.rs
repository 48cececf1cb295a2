//! On-chain agent: exchange flows, whale activity and stablecoin supply.
//! Degrades to a low-confidence neutral vote when no provider is configured.

use crate::application::agents::{Agent, AgentContext};
use crate::domain::decision::AgentOutput;
use async_trait::async_trait;

pub struct OnChainAgent;

#[async_trait]
impl Agent for OnChainAgent {
    fn name(&self) -> &'static str {
        "onchain"
    }

    async fn analyse(&self, ctx: AgentContext) -> AgentOutput {
        let Some(onchain) = &ctx.market.onchain else {
            return AgentOutput::new(self.name(), 0.0, 0.3, vec!["no on-chain data".to_string()]);
        };

        let mut score: f64 = 0.0;
        let mut reasons = Vec::new();

        if onchain.exchange_net_flow > 0.0 {
            score += 0.2;
            reasons.push(format!("exchange net inflow: {:+.0}", onchain.exchange_net_flow));
        } else if onchain.exchange_net_flow < 0.0 {
            score -= 0.2;
            reasons.push(format!("exchange net outflow: {:+.0}", onchain.exchange_net_flow));
        }

        if onchain.whale_transactions > 10 {
            score += 0.15;
            reasons.push(format!("whales active: {} transfers", onchain.whale_transactions));
        } else if onchain.whale_transactions > 5 {
            score += 0.05;
        }

        if onchain.stablecoin_mint > 1e8 {
            score += 0.1;
            reasons.push(format!("stablecoin mint: ${:.0}M", onchain.stablecoin_mint / 1e6));
        } else if onchain.stablecoin_mint < -1e8 {
            score -= 0.1;
            reasons.push(format!(
                "stablecoin redemption: ${:.0}M",
                onchain.stablecoin_mint.abs() / 1e6
            ));
        }

        let oi_change = ctx.market.open_interest_change;
        if oi_change > 0.05 {
            score += 0.1;
            reasons.push(format!("open interest rising: {:.1}%", oi_change * 100.0));
        } else if oi_change > 0.02 {
            score += 0.05;
        } else if oi_change < -0.05 {
            score -= 0.1;
            reasons.push(format!("open interest falling: {:.1}%", oi_change * 100.0));
        }

        // Crowded funding reads contrarian.
        let funding = ctx.market.funding_rate;
        if funding > 0.05 {
            score -= 0.1;
            reasons.push("high funding: longs crowded".to_string());
        } else if funding < -0.05 {
            score += 0.1;
            reasons.push("negative funding: shorts crowded".to_string());
        }

        AgentOutput::new(self.name(), (score / 4.0).clamp(-1.0, 1.0), 0.6, reasons)
            .with_indicator("net_flow", onchain.exchange_net_flow)
            .with_indicator("whale_tx", onchain.whale_transactions as f64)
    }
}
