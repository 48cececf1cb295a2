//! Idempotent-resubmit behaviour through the full gateway path: of any
//! sequence of identical requests inside the TTL, exactly one reaches the
//! adapter and all callers see the same order.

use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tradewarden::application::risk::breaker::CircuitBreaker;
use tradewarden::application::risk::gateway::RiskGateway;
use tradewarden::config::RiskConfig;
use tradewarden::domain::errors::RejectReason;
use tradewarden::domain::types::{Candle, OrderRequest, OrderSide, OrderStatus, OrderType};
use tradewarden::infrastructure::event_bus::EventBus;
use tradewarden::infrastructure::execution::simulated::{SimConfig, SimulatedAdapter};
use tradewarden::infrastructure::execution::ExecutionAdapter;
use tradewarden::infrastructure::idempotency::IdempotencyStore;
use tradewarden::infrastructure::persistence::audit_store::MemoryAuditStore;

fn bars(symbol: &str) -> Vec<Candle> {
    vec![Candle {
        symbol: symbol.to_string(),
        open: dec!(2000),
        high: dec!(2010),
        low: dec!(1990),
        close: dec!(2000),
        volume: dec!(1000000),
        timestamp: 1,
    }]
}

fn eth_request(trace_id: &str) -> OrderRequest {
    OrderRequest {
        symbol: "ETH/USDT".to_string(),
        side: OrderSide::Buy,
        order_type: OrderType::Market,
        quantity: dec!(0.4),
        price: Some(dec!(2000)),
        stop_price: None,
        leverage: 1.0,
        stop_loss_pct: Some(0.05),
        take_profit_pct: Some(0.10),
        reduce_only: false,
        post_only: false,
        source: "test".to_string(),
        strategy_id: "s1".to_string(),
        trace_id: trace_id.to_string(),
        bar_index: Some(0),
    }
}

/// Both submissions of a pair must land in the same minute bucket; if the
/// boundary is close, wait for it to pass first.
async fn align_minute_bucket() {
    let into_minute = chrono::Utc::now().timestamp_millis() % 60_000;
    if into_minute > 45_000 {
        tokio::time::sleep(Duration::from_millis((60_000 - into_minute + 100) as u64)).await;
    }
}

async fn gateway_with_sim() -> (RiskGateway, Arc<SimulatedAdapter>) {
    let adapter = Arc::new(SimulatedAdapter::new(SimConfig {
        base_slip: 0.0,
        impact_coef: 0.0,
        fee_rate: 0.0,
        latency_ms: (0, 0),
        initial_cash: dec!(10000),
    }));
    adapter.load_bars("ETH/USDT", bars("ETH/USDT")).await;

    let bus = EventBus::new();
    let breaker = Arc::new(CircuitBreaker::new(RiskConfig::default(), None, bus.clone()).unwrap());
    let gateway = RiskGateway::new(
        RiskConfig::default(),
        breaker,
        Arc::new(IdempotencyStore::new(None)),
        Arc::new(MemoryAuditStore::new()),
        adapter.clone(),
        bus,
    );
    (gateway, adapter)
}

#[tokio::test]
async fn test_identical_resubmit_returns_prior_order() {
    let (gateway, adapter) = gateway_with_sim().await;
    align_minute_bucket().await;

    let first = gateway.submit(eth_request("t1")).await;
    assert_eq!(first.status, OrderStatus::Filled);

    // Outside the 5 s accidental-resubmit window but inside the same minute
    // bucket: the idempotency key matches and the prior order comes back.
    tokio::time::sleep(Duration::from_millis(5_100)).await;

    let second = gateway.submit(eth_request("t2")).await;
    assert_eq!(second.id, first.id);
    assert_eq!(second.client_order_id, first.client_order_id);

    // Exactly one order reached the adapter.
    let orders = adapter.list_orders(Some("ETH/USDT")).await.unwrap();
    assert_eq!(orders.len(), 1);
}

#[tokio::test]
async fn test_rapid_resubmit_hits_dedup_window() {
    let (gateway, adapter) = gateway_with_sim().await;

    let first = gateway.submit(eth_request("t1")).await;
    assert_eq!(first.status, OrderStatus::Filled);

    // One second later: the short-window dedup fires first.
    let second = gateway.submit(eth_request("t2")).await;
    assert_eq!(second.status, OrderStatus::Rejected);
    assert_eq!(second.reject_reason, Some(RejectReason::DuplicateOrder));

    let orders = adapter.list_orders(Some("ETH/USDT")).await.unwrap();
    assert_eq!(orders.len(), 1);
}

#[tokio::test]
async fn test_different_parameters_are_not_duplicates() {
    let (gateway, adapter) = gateway_with_sim().await;

    gateway.submit(eth_request("t1")).await;

    let mut other = eth_request("t2");
    other.quantity = dec!(0.2);
    let second = gateway.submit(other).await;
    assert_eq!(second.status, OrderStatus::Filled);

    let orders = adapter.list_orders(Some("ETH/USDT")).await.unwrap();
    assert_eq!(orders.len(), 2);
}

#[tokio::test]
async fn test_cancel_does_not_free_the_key() {
    let (gateway, adapter) = gateway_with_sim().await;
    align_minute_bucket().await;

    // A resting limit order we can cancel.
    let mut resting = eth_request("t1");
    resting.order_type = OrderType::Limit;
    resting.price = Some(dec!(1900));
    let first = gateway.submit(resting.clone()).await;
    assert_eq!(first.status, OrderStatus::Open);

    adapter
        .cancel_order(&first.client_order_id, "operator")
        .await
        .unwrap();

    // Same parameters after the dedup window: still the same (now cancelled)
    // order, not a fresh submission.
    tokio::time::sleep(Duration::from_millis(5_100)).await;
    resting.trace_id = "t2".to_string();
    let second = gateway.submit(resting).await;
    assert_eq!(second.id, first.id);
    assert_eq!(second.status, OrderStatus::Cancelled);
}
