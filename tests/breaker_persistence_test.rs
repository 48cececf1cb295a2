//! Circuit-breaker persistence: a TRIGGERED state written at transition
//! time must be visible to a freshly started process before its gateway
//! accepts anything.

use rust_decimal_macros::dec;
use std::sync::Arc;
use tradewarden::application::risk::breaker::{BreakerStatus, CircuitBreaker};
use tradewarden::application::risk::gateway::RiskGateway;
use tradewarden::config::RiskConfig;
use tradewarden::domain::errors::RejectReason;
use tradewarden::domain::types::{Candle, OrderRequest, OrderSide, OrderStatus, OrderType};
use tradewarden::infrastructure::event_bus::EventBus;
use tradewarden::infrastructure::execution::simulated::{SimConfig, SimulatedAdapter};
use tradewarden::infrastructure::execution::ExecutionAdapter;
use tradewarden::infrastructure::idempotency::IdempotencyStore;
use tradewarden::infrastructure::persistence::audit_store::MemoryAuditStore;
use tradewarden::infrastructure::persistence::breaker_store::BreakerStore;

#[tokio::test]
async fn test_triggered_state_survives_restart_and_blocks_orders() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("circuit_breaker_state.json");

    // Process one: account tier trips and persists.
    {
        let breaker = CircuitBreaker::new(
            RiskConfig::default(),
            Some(BreakerStore::new(&path)),
            EventBus::new(),
        )
        .unwrap();
        breaker.observe_account(0.12, 0.0).await.unwrap();
        assert_eq!(breaker.snapshot().await.account.status, BreakerStatus::Triggered);
    }

    // Process two: restore happens inside the constructor, before any
    // gateway exists, so the very first submission is already blocked.
    let bus = EventBus::new();
    let breaker = Arc::new(
        CircuitBreaker::new(
            RiskConfig::default(),
            Some(BreakerStore::new(&path)),
            bus.clone(),
        )
        .unwrap(),
    );
    assert_eq!(breaker.snapshot().await.account.status, BreakerStatus::Triggered);

    let adapter = Arc::new(SimulatedAdapter::new(SimConfig::default()));
    adapter
        .load_bars(
            "BTC/USDT",
            vec![Candle {
                symbol: "BTC/USDT".to_string(),
                open: dec!(50000),
                high: dec!(50100),
                low: dec!(49900),
                close: dec!(50000),
                volume: dec!(1000000),
                timestamp: 1,
            }],
        )
        .await;

    let gateway = RiskGateway::new(
        RiskConfig::default(),
        Arc::clone(&breaker),
        Arc::new(IdempotencyStore::new(None)),
        Arc::new(MemoryAuditStore::new()),
        adapter.clone(),
        bus,
    );

    let order = gateway
        .submit(OrderRequest {
            symbol: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: dec!(0.01),
            price: Some(dec!(50000)),
            stop_price: None,
            leverage: 1.0,
            stop_loss_pct: Some(0.05),
            take_profit_pct: None,
            reduce_only: false,
            post_only: false,
            source: "test".to_string(),
            strategy_id: "s1".to_string(),
            trace_id: "t1".to_string(),
            bar_index: Some(0),
        })
        .await;

    assert_eq!(order.status, OrderStatus::Rejected);
    assert_eq!(order.reject_reason, Some(RejectReason::RiskCheckFailed));
    assert!(adapter.list_orders(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_strategy_breaker_fires_on_fifth_loss_exactly() {
    let breaker = CircuitBreaker::new(RiskConfig::default(), None, EventBus::new()).unwrap();

    for losses in 1..=4u32 {
        breaker.observe_strategy("momentum", 0.0, losses).await.unwrap();
        assert_ne!(
            breaker.view("momentum").await.strategy,
            BreakerStatus::Triggered,
            "{} losses must not trigger",
            losses
        );
    }

    breaker.observe_strategy("momentum", 0.0, 5).await.unwrap();
    assert_eq!(breaker.view("momentum").await.strategy, BreakerStatus::Triggered);
}

#[tokio::test]
async fn test_emergency_shutdown_persists_both_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("circuit_breaker_state.json");

    {
        let breaker = CircuitBreaker::new(
            RiskConfig::default(),
            Some(BreakerStore::new(&path)),
            EventBus::new(),
        )
        .unwrap();
        breaker.emergency_shutdown("kill switch", &[]).await.unwrap();
    }

    let restored = CircuitBreaker::new(
        RiskConfig::default(),
        Some(BreakerStore::new(&path)),
        EventBus::new(),
    )
    .unwrap();
    let snapshot = restored.snapshot().await;
    assert_eq!(snapshot.account.status, BreakerStatus::Triggered);
    assert_eq!(snapshot.system.status, BreakerStatus::Triggered);
    assert_eq!(snapshot.account.reason, "kill switch");
}
