//! Decision coordinator: fans a market snapshot out to every analyst agent,
//! aggregates their votes, and produces one [`TradeDecision`] per tick.
//!
//! Aggregation is a pure function of the agent outputs and the position
//! snapshot; identical inputs always produce identical decisions.

pub mod debate;

use crate::application::agents::{Agent, AgentContext};
use crate::config::RiskConfig;
use crate::domain::decision::{AgentOutput, ConfidenceBreakdown, TradeDecision};
use crate::domain::types::{PositionSide, TradeAction};
use debate::DebateEngine;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Default per-agent analysis deadline.
pub const AGENT_DEADLINE: Duration = Duration::from_secs(2);

/// Risk agent votes at or below this force the decision to HOLD.
const RISK_VETO_THRESHOLD: f64 = -0.5;

/// Weighted-vote thresholds for entering a position.
const ACTION_THRESHOLD: f64 = 0.1;

fn default_weights() -> HashMap<String, f64> {
    HashMap::from([
        ("market".to_string(), 0.25),
        ("strategy".to_string(), 0.20),
        ("risk".to_string(), 0.25),
        ("onchain".to_string(), 0.10),
        ("sentiment".to_string(), 0.10),
        ("macro".to_string(), 0.10),
    ])
}

pub struct DecisionCoordinator {
    agents: Vec<Arc<dyn Agent>>,
    weights: HashMap<String, f64>,
    risk_config: RiskConfig,
    deadline: Duration,
    debate: Option<DebateEngine>,
    strategy_id: String,
}

impl DecisionCoordinator {
    pub fn new(agents: Vec<Arc<dyn Agent>>, risk_config: RiskConfig, debate_enabled: bool) -> Self {
        Self {
            agents,
            weights: default_weights(),
            risk_config,
            deadline: AGENT_DEADLINE,
            debate: debate_enabled.then(DebateEngine::new),
            strategy_id: "multi_agent".to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// One full decision pass: fan out, optionally debate, aggregate.
    pub async fn decide(&self, ctx: AgentContext) -> TradeDecision {
        let mut outputs = self.fan_out(&ctx).await;

        if let Some(debate) = &self.debate {
            outputs = debate
                .refine(&self.agents, &ctx, outputs, &self.weights, self.deadline)
                .await;
        }

        self.aggregate(&ctx, &outputs)
    }

    /// Run all agents concurrently under individual deadlines. A timeout or
    /// panic becomes a neutral vote; it never fails the tick.
    pub async fn fan_out(&self, ctx: &AgentContext) -> Vec<AgentOutput> {
        let mut join_set = JoinSet::new();
        for (idx, agent) in self.agents.iter().enumerate() {
            let agent = Arc::clone(agent);
            let ctx = ctx.clone();
            let deadline = self.deadline;
            join_set.spawn(async move {
                let name = agent.name();
                let output = match tokio::time::timeout(deadline, agent.analyse(ctx)).await {
                    Ok(output) => output,
                    Err(_) => {
                        warn!("Coordinator: agent '{}' missed its deadline", name);
                        AgentOutput::neutral(name, "timeout")
                    }
                };
                (idx, output)
            });
        }

        let mut outputs: Vec<Option<AgentOutput>> = vec![None; self.agents.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, output)) => outputs[idx] = Some(output),
                Err(e) => warn!("Coordinator: agent task failed: {}", e),
            }
        }

        outputs
            .into_iter()
            .enumerate()
            .map(|(idx, output)| {
                output.unwrap_or_else(|| AgentOutput::neutral(self.agents[idx].name(), "error"))
            })
            .collect()
    }

    fn weight(&self, agent: &str) -> f64 {
        self.weights.get(agent).copied().unwrap_or(0.0)
    }

    /// Pure aggregation: weighted vote, risk veto, action table, sizing.
    pub fn aggregate(&self, ctx: &AgentContext, outputs: &[AgentOutput]) -> TradeDecision {
        let symbol = ctx.market.symbol.clone();
        let trace_id = uuid::Uuid::new_v4().to_string();

        let total: f64 = outputs.iter().map(|o| self.weight(&o.agent) * o.score).sum();

        let by_name: HashMap<&str, &AgentOutput> =
            outputs.iter().map(|o| (o.agent.as_str(), o)).collect();
        let conf = |name: &str| by_name.get(name).map(|o| o.confidence).unwrap_or(0.5);

        let technical = conf("market");
        let fundamental = (conf("strategy") + conf("macro")) / 2.0;
        let sentiment = (conf("sentiment") + conf("onchain")) / 2.0;
        let overall = technical * 0.4 + fundamental * 0.35 + sentiment * 0.25;
        let confidence = ConfidenceBreakdown {
            overall,
            technical,
            fundamental,
            sentiment,
        };

        let risk_output = by_name.get("risk");
        let risk_score = risk_output
            .and_then(|o| o.sub_indicators.get("risk_level").copied())
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);

        let mut reasons: Vec<String> = outputs.iter().flat_map(|o| o.reasons.iter().cloned()).collect();

        // One-vote veto: a sufficiently alarmed risk agent overrides the vote.
        let vetoed = risk_output.map(|o| o.score <= RISK_VETO_THRESHOLD).unwrap_or(false);
        if vetoed {
            reasons.push("risk agent veto: forced HOLD".to_string());
        }

        let has_long = ctx
            .positions
            .iter()
            .any(|p| p.symbol == symbol && p.side == PositionSide::Long);
        let has_short = ctx
            .positions
            .iter()
            .any(|p| p.symbol == symbol && p.side == PositionSide::Short);

        let action = if vetoed || total.abs() < ACTION_THRESHOLD {
            TradeAction::Hold
        } else if total >= ACTION_THRESHOLD {
            if has_short {
                TradeAction::Cover
            } else if !has_long {
                TradeAction::Buy
            } else {
                TradeAction::Hold
            }
        } else if has_long {
            TradeAction::Sell
        } else if !has_short {
            TradeAction::Short
        } else {
            TradeAction::Hold
        };

        debug!(
            "Coordinator: {} total={:.3} action={:?} risk={:.2} conf={:.2}",
            symbol, total, action, risk_score, overall
        );

        let mut decision = TradeDecision {
            action,
            symbol,
            size: 0.0,
            leverage: 1.0,
            stop_loss_pct: None,
            take_profit_pct: None,
            confidence,
            reasons,
            strategy_id: self.strategy_id.clone(),
            risk_score,
            risk_check_passed: false,
            trace_id,
        };

        if action.is_opening() {
            decision.size = self.position_size(overall, risk_score, ctx);
            decision.leverage = self.leverage(overall, risk_score, ctx.market.atr_pct());
            let (sl, tp) = self.stops(risk_score);
            decision.stop_loss_pct = Some(sl);
            decision.take_profit_pct = Some(tp);
        }

        decision
    }

    /// `clamp(confidence * (1 - risk/2) * (1 - exposure), 0.01, max_position_pct)`
    fn position_size(&self, confidence: f64, risk_score: f64, ctx: &AgentContext) -> f64 {
        let equity = ctx.account.total_equity;
        let current_exposure = if equity > Decimal::ZERO {
            (ctx.account.total_exposure() / equity)
                .to_f64()
                .unwrap_or(0.0)
                .min(1.0)
        } else {
            0.0
        };
        let raw = confidence * (1.0 - risk_score * 0.5) * (1.0 - current_exposure);
        raw.clamp(0.01, self.risk_config.max_position_pct)
    }

    /// Discrete confidence/risk ladder, volatility-adjusted, config-capped.
    fn leverage(&self, confidence: f64, risk_score: f64, atr_pct: f64) -> f64 {
        let mut leverage: f64 = if confidence > 0.7 && risk_score < 0.3 {
            3.0
        } else if confidence > 0.6 && risk_score < 0.4 {
            2.0
        } else if confidence > 0.5 && risk_score < 0.5 {
            1.5
        } else {
            1.0
        };

        if atr_pct > 0.05 {
            leverage *= 0.5;
        } else if atr_pct < 0.02 {
            leverage *= 1.2;
        }

        leverage.min(self.risk_config.max_leverage).max(1.0)
    }

    fn stops(&self, risk_score: f64) -> (f64, f64) {
        let base_stop = self.risk_config.stop_loss_pct;
        let sl = if risk_score > 0.5 { base_stop * 0.8 } else { base_stop };
        let tp = sl * if risk_score > 0.5 { 1.5 } else { 2.0 };
        (sl, tp)
    }
}
