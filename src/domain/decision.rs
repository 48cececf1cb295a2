use crate::domain::types::TradeAction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One analyst's view of a market snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub agent: String,
    /// Directional score in [-1, 1]; positive is bullish.
    pub score: f64,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub sub_indicators: HashMap<String, f64>,
}

impl AgentOutput {
    /// Clamps score/confidence into range and replaces non-finite values with
    /// neutral ones. A meaningful score (|score| >= 0.1) must carry at least
    /// one reason.
    pub fn new(agent: impl Into<String>, score: f64, confidence: f64, reasons: Vec<String>) -> Self {
        let score = if score.is_finite() { score.clamp(-1.0, 1.0) } else { 0.0 };
        let confidence = if confidence.is_finite() { confidence.clamp(0.0, 1.0) } else { 0.0 };
        let mut reasons = reasons;
        if score.abs() >= 0.1 && reasons.is_empty() {
            reasons.push("unspecified signal".to_string());
        }
        Self {
            agent: agent.into(),
            score,
            confidence,
            reasons,
            sub_indicators: HashMap::new(),
        }
    }

    /// Neutral output used when an agent times out or fails.
    pub fn neutral(agent: impl Into<String>, reason: &str) -> Self {
        Self {
            agent: agent.into(),
            score: 0.0,
            confidence: 0.0,
            reasons: vec![reason.to_string()],
            sub_indicators: HashMap::new(),
        }
    }

    pub fn with_indicator(mut self, key: &str, value: f64) -> Self {
        self.sub_indicators.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub overall: f64,
    pub technical: f64,
    pub fundamental: f64,
    pub sentiment: f64,
}

impl Default for ConfidenceBreakdown {
    fn default() -> Self {
        Self {
            overall: 0.5,
            technical: 0.5,
            fundamental: 0.5,
            sentiment: 0.5,
        }
    }
}

/// The coordinator's output for one tick: what to do and how big.
///
/// Created by the coordinator, possibly size-reduced by the risk gateway,
/// then immutable once the resulting order is dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDecision {
    pub action: TradeAction,
    pub symbol: String,
    /// Position size as a fraction of account equity.
    pub size: f64,
    pub leverage: f64,
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
    pub confidence: ConfidenceBreakdown,
    pub reasons: Vec<String>,
    pub strategy_id: String,
    /// 0 = no risk, 1 = maximum risk.
    pub risk_score: f64,
    pub risk_check_passed: bool,
    pub trace_id: String,
}

impl TradeDecision {
    pub fn hold(symbol: impl Into<String>, strategy_id: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            action: TradeAction::Hold,
            symbol: symbol.into(),
            size: 0.0,
            leverage: 1.0,
            stop_loss_pct: None,
            take_profit_pct: None,
            confidence: ConfidenceBreakdown::default(),
            reasons: Vec::new(),
            strategy_id: strategy_id.into(),
            risk_score: 0.5,
            risk_check_passed: false,
            trace_id: trace_id.into(),
        }
    }
}
