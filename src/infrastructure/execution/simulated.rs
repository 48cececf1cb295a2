//! Deterministic execution simulator.
//!
//! Fills land at the close of the current bar plus a volume-impact slippage
//! model; stop and take-profit exits are walked bar by bar. Fill *state* is
//! applied synchronously so a backtest is reproducible; only the emission of
//! fill events is delayed by the configured latency distribution.

use crate::domain::errors::RejectReason;
use crate::domain::types::{
    AccountState, Candle, Fill, Order, OrderRequest, OrderSide, OrderStatus, OrderType, Position,
    PositionSide, Ticker,
};
use crate::infrastructure::execution::{ExecutionAdapter, OrderUpdate};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Baseline slippage fraction applied to every fill.
    pub base_slip: f64,
    /// Market-impact coefficient scaled by order notional / bar volume.
    pub impact_coef: f64,
    /// Taker fee fraction of fill notional.
    pub fee_rate: f64,
    /// Uniform delay range for fill-event emission, milliseconds.
    pub latency_ms: (u64, u64),
    pub initial_cash: Decimal,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            base_slip: 0.0005,
            impact_coef: 0.1,
            fee_rate: 0.0004,
            latency_ms: (0, 0),
            initial_cash: Decimal::from(10_000),
        }
    }
}

#[derive(Debug, Clone)]
struct SimPosition {
    side: PositionSide,
    size: Decimal,
    entry_price: Decimal,
    mark_price: Decimal,
    leverage: f64,
    margin: Decimal,
    stop_loss_pct: Option<f64>,
    take_profit_pct: Option<f64>,
}

impl SimPosition {
    fn unrealized(&self) -> Decimal {
        match self.side {
            PositionSide::Long => (self.mark_price - self.entry_price) * self.size,
            PositionSide::Short => (self.entry_price - self.mark_price) * self.size,
        }
    }

    fn to_domain(&self, symbol: &str) -> Position {
        let entry_notional = self.entry_price * self.size;
        let pnl = self.unrealized();
        Position {
            symbol: symbol.to_string(),
            side: self.side,
            size: self.size,
            entry_price: self.entry_price,
            mark_price: self.mark_price,
            unrealized_pnl: pnl,
            unrealized_pnl_pct: if entry_notional > Decimal::ZERO {
                (pnl / entry_notional).to_f64().unwrap_or(0.0)
            } else {
                0.0
            },
            leverage: self.leverage,
            liquidation_price: None,
            margin: self.margin,
            stop_loss_pct: self.stop_loss_pct,
            take_profit_pct: self.take_profit_pct,
        }
    }
}

struct SimState {
    cash: Decimal,
    positions: HashMap<(String, PositionSide), SimPosition>,
    orders: HashMap<String, Order>,
    bars: HashMap<String, Vec<Candle>>,
    index: HashMap<String, usize>,
    day_start_equity: Decimal,
    high_water_mark: Decimal,
}

impl SimState {
    fn current_bar(&self, symbol: &str) -> Option<&Candle> {
        let idx = *self.index.get(symbol)?;
        self.bars.get(symbol)?.get(idx)
    }

    fn equity(&self) -> Decimal {
        let position_value: Decimal = self
            .positions
            .values()
            .map(|p| p.margin + p.unrealized())
            .sum();
        self.cash + position_value
    }
}

pub struct SimulatedAdapter {
    config: SimConfig,
    state: Arc<RwLock<SimState>>,
    order_update_tx: broadcast::Sender<OrderUpdate>,
    ticker_subscribers: Arc<RwLock<Vec<mpsc::Sender<Ticker>>>>,
}

impl SimulatedAdapter {
    pub fn new(config: SimConfig) -> Self {
        let initial = config.initial_cash;
        let (order_update_tx, _) = broadcast::channel(256);
        Self {
            config,
            state: Arc::new(RwLock::new(SimState {
                cash: initial,
                positions: HashMap::new(),
                orders: HashMap::new(),
                bars: HashMap::new(),
                index: HashMap::new(),
                day_start_equity: initial,
                high_water_mark: initial,
            })),
            order_update_tx,
            ticker_subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Install the candle feed for a symbol; simulation starts at bar 0.
    pub async fn load_bars(&self, symbol: &str, bars: Vec<Candle>) {
        let mut state = self.state.write().await;
        state.index.insert(symbol.to_string(), 0);
        state.bars.insert(symbol.to_string(), bars);
    }

    pub async fn current_index(&self, symbol: &str) -> Option<usize> {
        self.state.read().await.index.get(symbol).copied()
    }

    /// Mark the start of a trading day for daily-pnl accounting.
    pub async fn reset_daily(&self) {
        let mut state = self.state.write().await;
        state.day_start_equity = state.equity();
    }

    fn fill_event_delay(&self) -> Duration {
        let (lo, hi) = self.config.latency_ms;
        if hi == 0 {
            return Duration::ZERO;
        }
        use rand::Rng;
        let ms = rand::rng().random_range(lo..=hi);
        Duration::from_millis(ms)
    }

    fn emit_update(&self, order: Order) {
        let delay = self.fill_event_delay();
        let tx = self.order_update_tx.clone();
        if delay.is_zero() {
            let _ = tx.send(OrderUpdate { order });
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(OrderUpdate { order });
            });
        }
    }

    /// `price * (1 + base_slip + (notional / bar_volume) * impact_coef)`,
    /// signed against the trader.
    fn execution_price(&self, bar_close: Decimal, bar_volume: Decimal, quantity: Decimal, side: OrderSide) -> Decimal {
        let notional = (bar_close * quantity).to_f64().unwrap_or(0.0);
        let volume_notional = (bar_close * bar_volume).to_f64().unwrap_or(0.0);
        let participation = if volume_notional > 0.0 {
            notional / volume_notional
        } else {
            0.0
        };
        let slip = self.config.base_slip + participation * self.config.impact_coef;
        let factor = match side {
            OrderSide::Buy => 1.0 + slip,
            OrderSide::Sell => 1.0 - slip,
        };
        bar_close * Decimal::from_f64(factor).unwrap_or(Decimal::ONE)
    }

    fn fee_for(&self, price: Decimal, quantity: Decimal) -> Decimal {
        price * quantity * Decimal::from_f64(self.config.fee_rate).unwrap_or_default()
    }

    /// Apply a fill to cash and positions under one-way-mode rules: a buy
    /// first reduces any short, the remainder adds to the long side (and
    /// symmetrically for sells).
    fn settle(state: &mut SimState, request: &OrderRequest, price: Decimal, quantity: Decimal, fee: Decimal) {
        let symbol = request.symbol.clone();
        let (reduce_side, open_side) = match request.side {
            OrderSide::Buy => (PositionSide::Short, PositionSide::Long),
            OrderSide::Sell => (PositionSide::Long, PositionSide::Short),
        };

        let mut remaining = quantity;
        state.cash -= fee;

        let reduce_key = (symbol.clone(), reduce_side);
        if let Some(mut pos) = state.positions.remove(&reduce_key) {
            let closed = remaining.min(pos.size);
            let realized = match pos.side {
                PositionSide::Long => (price - pos.entry_price) * closed,
                PositionSide::Short => (pos.entry_price - price) * closed,
            };
            let released_margin = if pos.size > Decimal::ZERO {
                pos.margin * closed / pos.size
            } else {
                Decimal::ZERO
            };
            state.cash += released_margin + realized;
            pos.size -= closed;
            pos.margin -= released_margin;
            remaining -= closed;
            if pos.size > Decimal::ZERO {
                state.positions.insert(reduce_key, pos);
            }
        }

        if remaining > Decimal::ZERO && !request.reduce_only {
            let leverage = request.leverage.max(1.0);
            let notional = price * remaining;
            let margin = notional / Decimal::from_f64(leverage).unwrap_or(Decimal::ONE);
            state.cash -= margin;

            let open_key = (symbol, open_side);
            match state.positions.get_mut(&open_key) {
                Some(pos) => {
                    let total = pos.size + remaining;
                    pos.entry_price = (pos.entry_price * pos.size + price * remaining) / total;
                    pos.size = total;
                    pos.margin += margin;
                    pos.mark_price = price;
                    if request.stop_loss_pct.is_some() {
                        pos.stop_loss_pct = request.stop_loss_pct;
                    }
                    if request.take_profit_pct.is_some() {
                        pos.take_profit_pct = request.take_profit_pct;
                    }
                }
                None => {
                    state.positions.insert(
                        open_key,
                        SimPosition {
                            side: open_side,
                            size: remaining,
                            entry_price: price,
                            mark_price: price,
                            leverage,
                            margin,
                            stop_loss_pct: request.stop_loss_pct,
                            take_profit_pct: request.take_profit_pct,
                        },
                    );
                }
            }
        }
    }

    /// Advance one bar: refresh marks, trigger resting orders and position
    /// exits, emit a ticker. Returns the new current bar.
    pub async fn advance_bar(&self, symbol: &str) -> Result<Option<Candle>> {
        let (bar, updates) = {
            let mut state = self.state.write().await;
            let idx = state
                .index
                .get_mut(symbol)
                .ok_or_else(|| anyhow!("no candle feed loaded for {}", symbol))?;
            *idx += 1;
            let idx = *idx;

            let Some(bar) = state.bars.get(symbol).and_then(|b| b.get(idx)).cloned() else {
                return Ok(None);
            };

            for ((sym, _), pos) in state.positions.iter_mut() {
                if sym == symbol {
                    pos.mark_price = bar.close;
                }
            }

            let mut updates = Vec::new();
            updates.extend(Self::trigger_resting_orders(&mut state, symbol, &bar, &self.config));
            updates.extend(self.trigger_position_exits(&mut state, symbol, &bar));

            let equity = state.equity();
            if equity > state.high_water_mark {
                state.high_water_mark = equity;
            }

            (bar, updates)
        };

        for order in updates {
            self.emit_update(order);
        }

        let ticker = Ticker {
            symbol: symbol.to_string(),
            price: bar.close,
            timestamp: bar.timestamp,
        };
        let subscribers = self.ticker_subscribers.read().await;
        for tx in subscribers.iter() {
            let _ = tx.try_send(ticker.clone());
        }

        Ok(Some(bar))
    }

    /// Stop orders fill at stop price when the bar range touches it; limit
    /// orders fill at the limit price.
    fn trigger_resting_orders(
        state: &mut SimState,
        symbol: &str,
        bar: &Candle,
        config: &SimConfig,
    ) -> Vec<Order> {
        let fee_rate = Decimal::from_f64(config.fee_rate).unwrap_or_default();
        let mut filled = Vec::new();

        let resting: Vec<String> = state
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Open && o.request.symbol == symbol)
            .map(|o| o.client_order_id.clone())
            .collect();

        for coid in resting {
            let Some(order) = state.orders.get(&coid) else { continue };
            let request = order.request.clone();

            let trigger_price = match request.order_type {
                OrderType::Stop | OrderType::StopLimit => {
                    let Some(stop) = request.stop_price else { continue };
                    let touched = match request.side {
                        // Buy stop arms above the market: fills once bar high reaches it.
                        OrderSide::Buy => bar.high >= stop,
                        // Sell stop (long protective SL): fills once bar low reaches it.
                        OrderSide::Sell => bar.low <= stop,
                    };
                    if touched { Some(stop) } else { None }
                }
                OrderType::Limit => {
                    let Some(limit) = request.price else { continue };
                    let touched = match request.side {
                        OrderSide::Buy => bar.low <= limit,
                        OrderSide::Sell => bar.high >= limit,
                    };
                    if touched { Some(limit) } else { None }
                }
                OrderType::Market => None,
            };

            if let Some(px) = trigger_price {
                let qty = request.quantity;
                let fee = px * qty * fee_rate;
                Self::settle(state, &request, px, qty, fee);

                if let Some(order) = state.orders.get_mut(&coid) {
                    order.apply_fill(Fill {
                        price: px,
                        quantity: qty,
                        fee,
                        timestamp: Utc::now(),
                    });
                    debug!("SimulatedAdapter: resting order {} filled at {}", coid, px);
                    filled.push(order.clone());
                }
            }
        }
        filled
    }

    /// Position-level SL/TP exits, evaluated against the bar range.
    fn trigger_position_exits(&self, state: &mut SimState, symbol: &str, bar: &Candle) -> Vec<Order> {
        let mut exits: Vec<(PositionSide, Decimal, &'static str)> = Vec::new();

        for ((sym, side), pos) in state.positions.iter() {
            if sym != symbol {
                continue;
            }
            let entry = pos.entry_price;
            match side {
                PositionSide::Long => {
                    if let Some(sl) = pos.stop_loss_pct {
                        let sl_price = entry * Decimal::from_f64(1.0 - sl).unwrap_or(Decimal::ONE);
                        if bar.low <= sl_price {
                            exits.push((*side, sl_price, "stop_loss"));
                            continue;
                        }
                    }
                    if let Some(tp) = pos.take_profit_pct {
                        let tp_price = entry * Decimal::from_f64(1.0 + tp).unwrap_or(Decimal::ONE);
                        if bar.high >= tp_price {
                            exits.push((*side, tp_price, "take_profit"));
                        }
                    }
                }
                PositionSide::Short => {
                    if let Some(sl) = pos.stop_loss_pct {
                        let sl_price = entry * Decimal::from_f64(1.0 + sl).unwrap_or(Decimal::ONE);
                        if bar.high >= sl_price {
                            exits.push((*side, sl_price, "stop_loss"));
                            continue;
                        }
                    }
                    if let Some(tp) = pos.take_profit_pct {
                        let tp_price = entry * Decimal::from_f64(1.0 - tp).unwrap_or(Decimal::ONE);
                        if bar.low <= tp_price {
                            exits.push((*side, tp_price, "take_profit"));
                        }
                    }
                }
            }
        }

        let mut orders = Vec::new();
        for (side, exit_price, trigger) in exits {
            let key = (symbol.to_string(), side);
            let Some(pos) = state.positions.get(&key) else { continue };
            let qty = pos.size;

            let close_side = match side {
                PositionSide::Long => OrderSide::Sell,
                PositionSide::Short => OrderSide::Buy,
            };
            let request = OrderRequest {
                symbol: symbol.to_string(),
                side: close_side,
                order_type: OrderType::Market,
                quantity: qty,
                price: Some(exit_price),
                stop_price: None,
                leverage: pos.leverage,
                stop_loss_pct: None,
                take_profit_pct: None,
                reduce_only: true,
                post_only: false,
                source: format!("sim_{}", trigger),
                strategy_id: String::new(),
                trace_id: uuid::Uuid::new_v4().to_string(),
                bar_index: None,
            };

            let fee = self.fee_for(exit_price, qty);
            Self::settle(state, &request, exit_price, qty, fee);

            let coid = format!("CLOSE_{}_{}_{:08x}", symbol.replace('/', ""), bar.timestamp, state.orders.len());
            let mut order = Order::new(request, coid.clone());
            order.transition(OrderStatus::Submitted);
            order.apply_fill(Fill {
                price: exit_price,
                quantity: qty,
                fee,
                timestamp: Utc::now(),
            });
            order.status_message = Some(trigger.to_string());
            info!(
                "SimulatedAdapter: {} exit for {} {} at {}",
                trigger, symbol, side, exit_price
            );
            state.orders.insert(coid, order.clone());
            orders.push(order);
        }
        orders
    }

    fn account_state(state: &SimState) -> AccountState {
        let equity = state.equity();
        let mut exposure: HashMap<String, Decimal> = HashMap::new();
        let mut unrealized = Decimal::ZERO;
        let mut margin_total = Decimal::ZERO;
        for ((symbol, _), pos) in state.positions.iter() {
            *exposure.entry(symbol.clone()).or_default() += pos.size * pos.mark_price;
            unrealized += pos.unrealized();
            margin_total += pos.margin;
        }

        let daily_pnl = equity - state.day_start_equity;
        let daily_loss_pct = if state.day_start_equity > Decimal::ZERO && daily_pnl < Decimal::ZERO {
            (-daily_pnl / state.day_start_equity).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };
        let drawdown = if state.high_water_mark > Decimal::ZERO && equity < state.high_water_mark {
            ((state.high_water_mark - equity) / state.high_water_mark)
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };

        AccountState {
            total_equity: equity,
            available_balance: state.cash,
            margin_balance: margin_total,
            unrealized_pnl: unrealized,
            exposure,
            open_order_count: state.orders.values().filter(|o| !o.is_terminal()).count(),
            daily_pnl,
            daily_loss_pct,
            drawdown,
        }
    }
}

#[async_trait]
impl ExecutionAdapter for SimulatedAdapter {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn create_order(&self, request: OrderRequest, client_order_id: String) -> Result<Order> {
        let (order, update) = {
            let mut state = self.state.write().await;

            // Idempotent replay: same client-order-id returns the first order.
            if let Some(existing) = state.orders.get(&client_order_id) {
                debug!("SimulatedAdapter: replayed client-order-id {}", client_order_id);
                return Ok(existing.clone());
            }

            // Look-ahead detection: the driving snapshot must not postdate
            // the current simulation bar.
            let current_idx = state.index.get(&request.symbol).copied().unwrap_or(0);
            if let Some(bar_index) = request.bar_index {
                if bar_index > current_idx {
                    warn!(
                        "SimulatedAdapter: look-ahead rejected for {} (signal bar {}, sim bar {})",
                        request.symbol, bar_index, current_idx
                    );
                    let mut order = Order::rejected(request, RejectReason::RiskCheckFailed, "look-ahead");
                    order.client_order_id = client_order_id.clone();
                    state.orders.insert(client_order_id, order.clone());
                    return Ok(order);
                }
            }

            let bar = state
                .current_bar(&request.symbol)
                .cloned()
                .ok_or_else(|| anyhow!("no candle feed loaded for {}", request.symbol))?;

            let mut order = Order::new(request.clone(), client_order_id.clone());
            order.transition(OrderStatus::Submitted);

            match request.order_type {
                OrderType::Market => {
                    let px = self.execution_price(bar.close, bar.volume, request.quantity, request.side);
                    let fee = self.fee_for(px, request.quantity);
                    Self::settle(&mut state, &request, px, request.quantity, fee);
                    order.apply_fill(Fill {
                        price: px,
                        quantity: request.quantity,
                        fee,
                        timestamp: Utc::now(),
                    });
                }
                OrderType::Limit => {
                    let limit = request.price.ok_or_else(|| anyhow!("limit order without price"))?;
                    let marketable = match request.side {
                        OrderSide::Buy => limit >= bar.close,
                        OrderSide::Sell => limit <= bar.close,
                    };
                    if marketable {
                        let fee = self.fee_for(limit, request.quantity);
                        Self::settle(&mut state, &request, limit, request.quantity, fee);
                        order.apply_fill(Fill {
                            price: limit,
                            quantity: request.quantity,
                            fee,
                            timestamp: Utc::now(),
                        });
                    } else {
                        order.transition(OrderStatus::Open);
                    }
                }
                OrderType::Stop | OrderType::StopLimit => {
                    if request.stop_price.is_none() {
                        bail!("stop order without stop price");
                    }
                    order.transition(OrderStatus::Open);
                }
            }

            state.orders.insert(client_order_id, order.clone());
            (order.clone(), order)
        };

        self.emit_update(update);
        Ok(order)
    }

    async fn cancel_order(&self, client_order_id: &str, reason: &str) -> Result<Order> {
        let order = {
            let mut state = self.state.write().await;
            let order = state
                .orders
                .get_mut(client_order_id)
                .ok_or_else(|| anyhow!("unknown client-order-id {}", client_order_id))?;
            if !order.is_terminal() {
                order.transition(OrderStatus::Cancelled);
                order.status_message = Some(reason.to_string());
            }
            order.clone()
        };
        self.emit_update(order.clone());
        Ok(order)
    }

    async fn get_order(&self, client_order_id: &str) -> Result<Option<Order>> {
        Ok(self.state.read().await.orders.get(client_order_id).cloned())
    }

    async fn list_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>> {
        let state = self.state.read().await;
        Ok(state
            .orders
            .values()
            .filter(|o| symbol.map(|s| o.request.symbol == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn list_positions(&self) -> Result<Vec<Position>> {
        let state = self.state.read().await;
        Ok(state
            .positions
            .iter()
            .filter(|(_, p)| p.size > Decimal::ZERO)
            .map(|((symbol, _), p)| p.to_domain(symbol))
            .collect())
    }

    async fn get_balance(&self) -> Result<AccountState> {
        let state = self.state.read().await;
        Ok(Self::account_state(&state))
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        let state = self.state.read().await;
        let bar = state
            .current_bar(symbol)
            .ok_or_else(|| anyhow!("no candle feed loaded for {}", symbol))?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            price: bar.close,
            timestamp: bar.timestamp,
        })
    }

    async fn subscribe_ticker(&self, _symbols: &[String]) -> Result<mpsc::Receiver<Ticker>> {
        let (tx, rx) = mpsc::channel(256);
        self.ticker_subscribers.write().await.push(tx);
        Ok(rx)
    }

    fn subscribe_order_updates(&self) -> broadcast::Receiver<OrderUpdate> {
        self.order_update_tx.subscribe()
    }
}
