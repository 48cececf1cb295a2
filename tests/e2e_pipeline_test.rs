//! End-to-end pipeline: static candles -> market state -> agent fan-out ->
//! coordinator -> risk gateway -> simulated adapter, plus the simulator's
//! look-ahead invariant through the full submit path.
//!
//! The decisive runs use scripted agents so the vote is strong enough to
//! open; the rule-based set is conservative by construction and is covered
//! separately for determinism and sanity.

use async_trait::async_trait;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tradewarden::application::agents::{default_agents, Agent, AgentContext};
use tradewarden::application::coordinator::DecisionCoordinator;
use tradewarden::application::market_data::{
    MarketDataService, NeutralAuxProvider, StaticCandleSource, Timeframe,
};
use tradewarden::application::risk::breaker::CircuitBreaker;
use tradewarden::application::risk::gateway::RiskGateway;
use tradewarden::application::scheduler::build_requests;
use tradewarden::config::RiskConfig;
use tradewarden::domain::decision::AgentOutput;
use tradewarden::domain::errors::RejectReason;
use tradewarden::domain::types::{Candle, OrderStatus, TradeAction};
use tradewarden::infrastructure::event_bus::EventBus;
use tradewarden::infrastructure::execution::simulated::{SimConfig, SimulatedAdapter};
use tradewarden::infrastructure::execution::ExecutionAdapter;
use tradewarden::infrastructure::idempotency::IdempotencyStore;
use tradewarden::infrastructure::persistence::audit_store::{AuditSink, MemoryAuditStore};

/// A steady uptrend with a volume surge at the end.
fn bullish_candles(symbol: &str, n: usize) -> Vec<Candle> {
    (0..n)
        .map(|i| {
            let close = 40_000.0 + i as f64 * 120.0;
            Candle {
                symbol: symbol.to_string(),
                open: Decimal::from_f64(close - 60.0).unwrap(),
                high: Decimal::from_f64(close + 150.0).unwrap(),
                low: Decimal::from_f64(close - 150.0).unwrap(),
                close: Decimal::from_f64(close).unwrap(),
                volume: if i >= n - 3 { dec!(5000000) } else { dec!(1000000) },
                timestamp: i as i64 * 3600,
            }
        })
        .collect()
}

struct ScriptedAgent {
    name: &'static str,
    score: f64,
    risk_level: Option<f64>,
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn analyse(&self, _ctx: AgentContext) -> AgentOutput {
        let mut out = AgentOutput::new(self.name, self.score, 0.69, vec!["scripted".into()]);
        if let Some(level) = self.risk_level {
            out = out.with_indicator("risk_level", level);
        }
        out
    }
}

/// Analyst panel voting strongly bullish with a calm risk read.
fn bullish_panel() -> Vec<Arc<dyn Agent>> {
    vec![
        Arc::new(ScriptedAgent { name: "market", score: 0.8, risk_level: None }),
        Arc::new(ScriptedAgent { name: "strategy", score: 0.6, risk_level: None }),
        Arc::new(ScriptedAgent { name: "risk", score: -0.2, risk_level: Some(0.2) }),
        Arc::new(ScriptedAgent { name: "onchain", score: 0.1, risk_level: None }),
        Arc::new(ScriptedAgent { name: "sentiment", score: 0.0, risk_level: None }),
        Arc::new(ScriptedAgent { name: "macro", score: 0.2, risk_level: None }),
    ]
}

struct Pipeline {
    market_data: MarketDataService,
    coordinator: DecisionCoordinator,
    gateway: RiskGateway,
    adapter: Arc<SimulatedAdapter>,
    audit: Arc<MemoryAuditStore>,
}

async fn pipeline(agents: Vec<Arc<dyn Agent>>) -> Pipeline {
    let symbol = "BTC/USDT";
    let candles = bullish_candles(symbol, 100);

    let source = Arc::new(StaticCandleSource::new());
    source.load(symbol, Timeframe::H1, candles.clone()).await;
    source.load(symbol, Timeframe::M5, candles.clone()).await;
    let market_data = MarketDataService::new(source, Arc::new(NeutralAuxProvider));

    let adapter = Arc::new(SimulatedAdapter::new(SimConfig {
        base_slip: 0.0005,
        impact_coef: 0.1,
        fee_rate: 0.0004,
        latency_ms: (0, 0),
        initial_cash: dec!(10000),
    }));
    adapter.load_bars(symbol, candles).await;
    // Trade against the latest bar.
    for _ in 0..99 {
        adapter.advance_bar(symbol).await.unwrap();
    }

    let bus = EventBus::new();
    let breaker = Arc::new(CircuitBreaker::new(RiskConfig::default(), None, bus.clone()).unwrap());
    let audit = Arc::new(MemoryAuditStore::new());
    let gateway = RiskGateway::new(
        RiskConfig::default(),
        breaker,
        Arc::new(IdempotencyStore::new(None)),
        audit.clone() as Arc<dyn AuditSink>,
        adapter.clone(),
        bus,
    );

    let coordinator = DecisionCoordinator::new(agents, RiskConfig::default(), false);

    Pipeline {
        market_data,
        coordinator,
        gateway,
        adapter,
        audit,
    }
}

#[tokio::test]
async fn test_full_tick_opens_a_position() {
    let p = pipeline(bullish_panel()).await;

    let state = p.market_data.market_state("BTC/USDT", Some(99)).await.unwrap();
    let positions = p.adapter.list_positions().await.unwrap();
    let account = p.adapter.get_balance().await.unwrap();
    let mark_price = state.price;
    let bar_index = state.bar_index;

    let decision = p
        .coordinator
        .decide(AgentContext {
            market: state,
            positions: positions.clone(),
            account: account.clone(),
        })
        .await;

    // Weighted total 0.25 with a calm risk agent: open long. The ladder
    // gives 2x and the quiet uptrend (ATR under 2% of price) scales it 1.2x.
    assert_eq!(decision.action, TradeAction::Buy);
    assert!(decision.size >= 0.01 && decision.size <= 0.10);
    assert_eq!(decision.leverage, 2.4);

    let requests = build_requests(&decision, &account, &positions, mark_price, bar_index);
    assert_eq!(requests.len(), 1);

    let order = p.gateway.submit(requests[0].clone()).await;
    assert_eq!(order.status, OrderStatus::Filled, "{:?}", order.status_message);

    let positions = p.adapter.list_positions().await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].symbol, "BTC/USDT");

    // One audit record, tied to the decision's trace id.
    let records = p.audit.find_by_trace(&decision.trace_id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].passed);
}

#[tokio::test]
async fn test_look_ahead_signal_is_rejected_end_to_end() {
    let p = pipeline(bullish_panel()).await;

    let state = p.market_data.market_state("BTC/USDT", Some(99)).await.unwrap();
    let account = p.adapter.get_balance().await.unwrap();
    let decision = p
        .coordinator
        .decide(AgentContext {
            market: state.clone(),
            positions: vec![],
            account: account.clone(),
        })
        .await;
    assert_eq!(decision.action, TradeAction::Buy);

    // Claim the signal came from a bar the simulator has not reached.
    let mut requests = build_requests(&decision, &account, &[], state.price, Some(101));
    let order = p.gateway.submit(requests.remove(0)).await;

    assert_eq!(order.status, OrderStatus::Rejected);
    assert_eq!(order.reject_reason, Some(RejectReason::RiskCheckFailed));
    assert_eq!(order.status_message.as_deref(), Some("look-ahead"));
    assert!(p.adapter.list_positions().await.unwrap().is_empty());

    // The gateway audited the submission before the simulator refused it.
    let records = p.audit.find_by_trace(&decision.trace_id).await.unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_rule_based_agents_are_deterministic_and_bounded() {
    let p = pipeline(default_agents(RiskConfig::default())).await;
    let state = p.market_data.market_state("BTC/USDT", Some(99)).await.unwrap();
    let account = p.adapter.get_balance().await.unwrap();

    let ctx = AgentContext {
        market: state,
        positions: vec![],
        account,
    };
    let first = p.coordinator.decide(ctx.clone()).await;
    let second = p.coordinator.decide(ctx).await;

    assert_eq!(first.action, second.action);
    assert_eq!(first.size.to_bits(), second.size.to_bits());
    assert_eq!(first.leverage.to_bits(), second.leverage.to_bits());
    assert_eq!(first.stop_loss_pct, second.stop_loss_pct);

    assert!(first.risk_score >= 0.0 && first.risk_score <= 1.0);
    if first.action.is_opening() {
        assert!(first.size >= 0.01 && first.size <= 0.10);
    } else {
        assert_eq!(first.size, 0.0);
    }
}
