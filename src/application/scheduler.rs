//! Trading-tick scheduler.
//!
//! One worker per symbol runs the pipeline sequentially: market state ->
//! agent fan-out -> aggregate -> risk gateway -> execution adapter. Orders
//! for one (symbol, strategy) pair are strictly sequential because the next
//! tick's submit cannot start before the previous one returned; across
//! symbols the workers run concurrently.

use crate::application::agents::AgentContext;
use crate::application::coordinator::DecisionCoordinator;
use crate::application::market_data::{indicators, MarketDataService};
use crate::application::risk::breaker::CircuitBreaker;
use crate::application::risk::gateway::RiskGateway;
use crate::application::workflow::DailyStateWriter;
use crate::domain::decision::TradeDecision;
use crate::domain::types::{
    AccountState, OrderRequest, OrderSide, OrderType, Position, PositionSide, TradeAction,
};
use crate::infrastructure::execution::ExecutionAdapter;
use crate::infrastructure::idempotency::IdempotencyStore;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Volatility window (1h bars) feeding the system breaker.
const VOLATILITY_BARS: usize = 20;
/// Cadence of the account/breaker monitor loop.
const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

pub struct Scheduler {
    symbols: Vec<String>,
    tick_interval: Duration,
    market_data: Arc<MarketDataService>,
    coordinator: Arc<DecisionCoordinator>,
    gateway: Arc<RiskGateway>,
    adapter: Arc<dyn ExecutionAdapter>,
    breaker: Arc<CircuitBreaker>,
    trading_enabled: Arc<AtomicBool>,
    daily_writer: Option<DailyStateWriter>,
    last_day: std::sync::Mutex<Option<chrono::NaiveDate>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbols: Vec<String>,
        tick_interval: Duration,
        market_data: Arc<MarketDataService>,
        coordinator: Arc<DecisionCoordinator>,
        gateway: Arc<RiskGateway>,
        adapter: Arc<dyn ExecutionAdapter>,
        breaker: Arc<CircuitBreaker>,
        trading_enabled: Arc<AtomicBool>,
        daily_writer: Option<DailyStateWriter>,
    ) -> Self {
        Self {
            symbols,
            tick_interval,
            market_data,
            coordinator,
            gateway,
            adapter,
            breaker,
            trading_enabled,
            daily_writer,
            last_day: std::sync::Mutex::new(None),
        }
    }

    /// Spawn the per-symbol workers and the monitor loop; returns once all
    /// workers have observed the shutdown signal and drained.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut workers = JoinSet::new();

        for symbol in self.symbols.clone() {
            let scheduler = Arc::clone(&self);
            let mut shutdown = shutdown.clone();
            workers.spawn(async move {
                let mut interval = tokio::time::interval(scheduler.tick_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if scheduler.trading_enabled.load(Ordering::SeqCst) {
                                scheduler.run_tick(&symbol).await;
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                info!("Scheduler: worker for {} stopping", symbol);
                                return;
                            }
                        }
                    }
                }
            });
        }

        {
            let scheduler = Arc::clone(&self);
            let mut shutdown = shutdown.clone();
            workers.spawn(async move {
                let mut interval = tokio::time::interval(MONITOR_INTERVAL);
                loop {
                    tokio::select! {
                        _ = interval.tick() => scheduler.monitor_pass().await,
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            });
        }

        while workers.join_next().await.is_some() {}
        info!("Scheduler: all workers stopped");
    }

    /// One full decision pipeline pass for one symbol.
    pub async fn run_tick(&self, symbol: &str) {
        let state = match self.market_data.market_state(symbol, None).await {
            Ok(state) => state,
            Err(e) => {
                warn!("Scheduler: no market state for {}: {}", symbol, e);
                return;
            }
        };

        let positions = match self.adapter.list_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                warn!("Scheduler: position snapshot failed: {}", e);
                return;
            }
        };
        let account = match self.adapter.get_balance().await {
            Ok(account) => account,
            Err(e) => {
                warn!("Scheduler: balance fetch failed: {}", e);
                if let Err(be) = self.breaker.record_api_failure().await {
                    error!("Scheduler: breaker persistence failed: {}", be);
                }
                return;
            }
        };

        // System breaker sees fresh market conditions before any decision.
        let volatility = indicators::returns_volatility(&state.ohlcv_1h, VOLATILITY_BARS);
        match self.breaker.observe_system(volatility, 0.0, &positions).await {
            Ok(to_close) if !to_close.is_empty() => {
                warn!(
                    "Scheduler: system breaker demands closing {} position(s)",
                    to_close.len()
                );
                self.flatten(&to_close).await;
                return;
            }
            Err(e) => {
                error!("Scheduler: system breaker observation failed: {}", e);
                return;
            }
            _ => {}
        }
        if let Err(e) = self
            .breaker
            .observe_account(account.daily_loss_pct, account.drawdown)
            .await
        {
            error!("Scheduler: account breaker observation failed: {}", e);
            return;
        }

        let bar_index = state.bar_index;
        let mark_price = state.price;
        let decision = self
            .coordinator
            .decide(AgentContext {
                market: state,
                positions: positions.clone(),
                account: account.clone(),
            })
            .await;

        if decision.action == TradeAction::Hold {
            debug!("Scheduler: {} holds", symbol);
            return;
        }

        for request in build_requests(&decision, &account, &positions, mark_price, bar_index) {
            let order = self.gateway.submit(request).await;
            debug!(
                "Scheduler: {} order {} -> {:?}",
                symbol, order.client_order_id, order.status
            );
        }
    }

    /// Close out a breaker close list with reduce-only market orders.
    ///
    /// These go straight to the adapter: the triggering breaker already
    /// blocks everything at the gateway, and a safety flatten must not be
    /// stopped by the very switch that demanded it.
    async fn flatten(&self, positions: &[Position]) {
        for position in positions {
            let side = match position.side {
                PositionSide::Long => OrderSide::Sell,
                PositionSide::Short => OrderSide::Buy,
            };
            let request = OrderRequest {
                symbol: position.symbol.clone(),
                side,
                order_type: OrderType::Market,
                quantity: position.size,
                price: None,
                stop_price: None,
                leverage: position.leverage,
                stop_loss_pct: None,
                take_profit_pct: None,
                reduce_only: true,
                post_only: false,
                source: "breaker_flatten".to_string(),
                strategy_id: String::new(),
                trace_id: uuid::Uuid::new_v4().to_string(),
                bar_index: None,
            };
            let coid = IdempotencyStore::generate_client_order_id("FLAT", &position.symbol);
            match self.adapter.create_order(request, coid).await {
                Ok(order) => info!(
                    "Scheduler: flatten {} {} -> {:?}",
                    position.symbol, position.side, order.status
                ),
                Err(e) => error!(
                    "Scheduler: flatten failed for {} {}: {}",
                    position.symbol, position.side, e
                ),
            }
        }
    }

    async fn monitor_pass(&self) {
        if let Ok(account) = self.adapter.get_balance().await {
            if let Err(e) = self
                .breaker
                .observe_account(account.daily_loss_pct, account.drawdown)
                .await
            {
                error!("Scheduler: account breaker observation failed: {}", e);
            }
        }
        if let Err(e) = self.breaker.check_recovery(MONITOR_INTERVAL).await {
            error!("Scheduler: breaker recovery check failed: {}", e);
        }
        self.daily_rollover().await;
    }

    /// UTC date change: reset per-day counters and write the daily state
    /// artefact.
    async fn daily_rollover(&self) {
        let today = chrono::Utc::now().date_naive();
        let rolled = {
            let mut last = self.last_day.lock().expect("daily rollover lock poisoned");
            if *last == Some(today) {
                false
            } else {
                let first_run = last.is_none();
                *last = Some(today);
                !first_run
            }
        };
        if !rolled {
            return;
        }

        info!("Scheduler: daily rollover to {}", today);
        self.gateway.reset_daily();

        if let Some(writer) = &self.daily_writer {
            let mut states = Vec::new();
            for symbol in &self.symbols {
                if let Ok(state) = self.market_data.market_state(symbol, None).await {
                    states.push(state);
                }
            }
            let risk = self.gateway.status().await.risk_config;
            if let Err(e) = writer.write(&states, &risk) {
                warn!("Scheduler: daily state write failed: {}", e);
            }
        }
    }
}

/// Translate a decision into the orders it implies.
///
/// `Close` flattens both sides; opposite-side opens rely on the coordinator
/// emitting Cover/Sell first (close-then-open across ticks).
pub fn build_requests(
    decision: &TradeDecision,
    account: &AccountState,
    positions: &[Position],
    mark_price: Decimal,
    bar_index: Option<usize>,
) -> Vec<OrderRequest> {
    let base = |side: OrderSide, quantity: Decimal, reduce_only: bool| OrderRequest {
        symbol: decision.symbol.clone(),
        side,
        order_type: OrderType::Market,
        quantity,
        price: None,
        stop_price: None,
        leverage: decision.leverage,
        stop_loss_pct: decision.stop_loss_pct,
        take_profit_pct: decision.take_profit_pct,
        reduce_only,
        post_only: false,
        source: "coordinator".to_string(),
        strategy_id: decision.strategy_id.clone(),
        trace_id: decision.trace_id.clone(),
        bar_index,
    };

    let position_on = |side: PositionSide| {
        positions
            .iter()
            .find(|p| p.symbol == decision.symbol && p.side == side)
    };

    match decision.action {
        TradeAction::Hold => Vec::new(),
        TradeAction::Buy | TradeAction::Short => {
            if mark_price <= Decimal::ZERO {
                return Vec::new();
            }
            let notional = account.total_equity * Decimal::from_f64(decision.size).unwrap_or_default();
            let quantity = notional / mark_price;
            if quantity <= Decimal::ZERO {
                return Vec::new();
            }
            let side = if decision.action == TradeAction::Buy {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            };
            vec![base(side, quantity, false)]
        }
        TradeAction::Sell => position_on(PositionSide::Long)
            .map(|p| vec![base(OrderSide::Sell, p.size, true)])
            .unwrap_or_default(),
        TradeAction::Cover => position_on(PositionSide::Short)
            .map(|p| vec![base(OrderSide::Buy, p.size, true)])
            .unwrap_or_default(),
        TradeAction::Close => {
            let mut orders = Vec::new();
            if let Some(p) = position_on(PositionSide::Long) {
                orders.push(base(OrderSide::Sell, p.size, true));
            }
            if let Some(p) = position_on(PositionSide::Short) {
                orders.push(base(OrderSide::Buy, p.size, true));
            }
            orders
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::decision::ConfidenceBreakdown;
    use rust_decimal_macros::dec;

    fn decision(action: TradeAction) -> TradeDecision {
        TradeDecision {
            action,
            symbol: "BTC/USDT".to_string(),
            size: 0.1,
            leverage: 2.0,
            stop_loss_pct: Some(0.05),
            take_profit_pct: Some(0.10),
            confidence: ConfidenceBreakdown::default(),
            reasons: vec![],
            strategy_id: "multi_agent".to_string(),
            risk_score: 0.3,
            risk_check_passed: false,
            trace_id: "t1".to_string(),
        }
    }

    fn long_position() -> Position {
        Position {
            symbol: "BTC/USDT".to_string(),
            side: PositionSide::Long,
            size: dec!(0.5),
            entry_price: dec!(48000),
            mark_price: dec!(50000),
            unrealized_pnl: dec!(1000),
            unrealized_pnl_pct: 0.04,
            leverage: 2.0,
            liquidation_price: None,
            margin: dec!(12000),
            stop_loss_pct: None,
            take_profit_pct: None,
        }
    }

    fn account() -> AccountState {
        AccountState {
            total_equity: dec!(10000),
            available_balance: dec!(10000),
            ..Default::default()
        }
    }

    #[test]
    fn test_hold_produces_no_orders() {
        let requests = build_requests(&decision(TradeAction::Hold), &account(), &[], dec!(50000), None);
        assert!(requests.is_empty());
    }

    #[test]
    fn test_sell_reduces_existing_long() {
        let positions = vec![long_position()];
        let requests = build_requests(&decision(TradeAction::Sell), &account(), &positions, dec!(50000), None);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].side, OrderSide::Sell);
        assert!(requests[0].reduce_only);
        assert_eq!(requests[0].quantity, dec!(0.5));
    }

    #[test]
    fn test_sell_without_position_is_noop() {
        let requests = build_requests(&decision(TradeAction::Sell), &account(), &[], dec!(50000), None);
        assert!(requests.is_empty());
    }

    #[test]
    fn test_buy_sizes_from_equity_and_mark() {
        let requests = build_requests(&decision(TradeAction::Buy), &account(), &[], dec!(50000), Some(42));
        assert_eq!(requests.len(), 1);
        // notional 1000 at mark 50000 -> 0.02
        assert_eq!(requests[0].quantity, dec!(0.02));
        assert_eq!(requests[0].bar_index, Some(42));
        assert!(!requests[0].reduce_only);
    }

    #[test]
    fn test_close_flattens_both_sides() {
        let mut short = long_position();
        short.side = PositionSide::Short;
        short.size = dec!(0.2);
        let positions = vec![long_position(), short];

        let requests = build_requests(&decision(TradeAction::Close), &account(), &positions, dec!(50000), None);
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.reduce_only));
    }
}
