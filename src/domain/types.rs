use crate::domain::errors::RejectReason;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Decision-level action. `Buy`/`Short` open, `Sell`/`Cover` close the
/// matching side, `Close` flattens, `Hold` does nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeAction {
    Buy,
    Sell,
    Short,
    Cover,
    Hold,
    Close,
}

impl TradeAction {
    pub fn is_opening(&self) -> bool {
        matches!(self, TradeAction::Buy | TradeAction::Short)
    }

    pub fn is_reducing(&self) -> bool {
        matches!(self, TradeAction::Sell | TradeAction::Cover | TradeAction::Close)
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
            TradeAction::Short => "SHORT",
            TradeAction::Cover => "COVER",
            TradeAction::Hold => "HOLD",
            TradeAction::Close => "CLOSE",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::Stop => write!(f, "STOP"),
            OrderType::StopLimit => write!(f, "STOP_LIMIT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Acknowledged locally but unconfirmed by the exchange (sweeper territory).
    Pending,
    Submitted,
    Open,
    Partial,
    Filled,
    Cancelled,
    Rejected,
    Failed,
}

impl OrderStatus {
    /// Terminal orders are frozen; no further transitions are applied.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Failed
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: Decimal,
    pub timestamp: i64,
}

fn default_leverage() -> f64 {
    1.0
}

fn default_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A request as it enters the risk gateway. Becomes the immutable core of an
/// [`Order`] once admitted. Optional fields default so API callers only need
/// the core parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    #[serde(default = "default_leverage")]
    pub leverage: f64,
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,
    #[serde(default)]
    pub take_profit_pct: Option<f64>,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub post_only: bool,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub strategy_id: String,
    #[serde(default = "default_trace_id")]
    pub trace_id: String,
    /// Simulation provenance: the bar index the driving MarketState was
    /// sampled at. The simulated adapter rejects requests whose index lies
    /// beyond the current simulation bar.
    #[serde(default)]
    pub bar_index: Option<usize>,
}

impl OrderRequest {
    /// Wire action used in the client-order-id, one of BUY/SELL/CLOSE/FLAT.
    pub fn wire_action(&self) -> &'static str {
        if self.reduce_only {
            "CLOSE"
        } else {
            match self.side {
                OrderSide::Buy => "BUY",
                OrderSide::Sell => "SELL",
            }
        }
    }

    /// Notional value at the given reference price.
    pub fn notional(&self, reference_price: Decimal) -> Decimal {
        let px = self.price.unwrap_or(reference_price);
        self.quantity * px
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// An order as tracked by the execution adapter. Owns its full lifecycle;
/// other components only ever see copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_order_id: String,
    pub request: OrderRequest,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub fee: Decimal,
    pub reject_reason: Option<RejectReason>,
    pub status_message: Option<String>,
    pub fills: Vec<Fill>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn new(request: OrderRequest, client_order_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            client_order_id,
            request,
            status: OrderStatus::Pending,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            fee: Decimal::ZERO,
            reject_reason: None,
            status_message: None,
            fills: Vec::new(),
            created_at: now,
            updated_at: now,
            filled_at: None,
        }
    }

    /// Build an already-rejected order without touching any adapter.
    pub fn rejected(request: OrderRequest, reason: RejectReason, message: impl Into<String>) -> Self {
        let mut order = Self::new(request, String::new());
        order.status = OrderStatus::Rejected;
        order.reject_reason = Some(reason);
        order.status_message = Some(message.into());
        order
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Record a fill and update status. Terminal orders are frozen, and the
    /// fill invariant `filled_quantity <= quantity` always holds.
    pub fn apply_fill(&mut self, fill: Fill) {
        if self.is_terminal() {
            return;
        }
        let remaining = self.request.quantity - self.filled_quantity;
        let qty = fill.quantity.min(remaining);
        if qty <= Decimal::ZERO {
            return;
        }

        let prev_value = self.avg_fill_price.unwrap_or(Decimal::ZERO) * self.filled_quantity;
        self.filled_quantity += qty;
        self.avg_fill_price = Some((prev_value + fill.price * qty) / self.filled_quantity);
        self.fee += fill.fee;
        self.updated_at = fill.timestamp;
        self.fills.push(Fill { quantity: qty, ..fill });

        if self.filled_quantity >= self.request.quantity {
            self.status = OrderStatus::Filled;
            self.filled_at = Some(self.updated_at);
        } else {
            self.status = OrderStatus::Partial;
        }
    }

    pub fn transition(&mut self, status: OrderStatus) {
        if self.is_terminal() {
            return;
        }
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub size: Decimal,
    /// Size-weighted average entry price.
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_pct: f64,
    pub leverage: f64,
    pub liquidation_price: Option<Decimal>,
    pub margin: Decimal,
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
}

impl Position {
    pub fn notional(&self) -> Decimal {
        self.size * self.mark_price
    }
}

/// Account snapshot, rebuilt on demand from the execution adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountState {
    pub total_equity: Decimal,
    pub available_balance: Decimal,
    pub margin_balance: Decimal,
    pub unrealized_pnl: Decimal,
    /// Per-symbol open notional.
    pub exposure: HashMap<String, Decimal>,
    pub open_order_count: usize,
    pub daily_pnl: Decimal,
    pub daily_loss_pct: f64,
    pub drawdown: f64,
}

impl AccountState {
    pub fn total_exposure(&self) -> Decimal {
        self.exposure.values().copied().sum()
    }

    pub fn symbol_exposure(&self, symbol: &str) -> Decimal {
        self.exposure.get(symbol).copied().unwrap_or(Decimal::ZERO)
    }
}

// ===== Symbol Normalization =====

/// Supported quote currencies, longest first so USDT wins over USD.
const QUOTE_CURRENCIES: &[&str] = &["USDT", "USDC", "BUSD", "TUSD", "USD", "EUR", "BTC", "ETH"];

/// Normalizes an exchange-format symbol ("BTCUSDT") into the application's
/// slash-separated form ("BTC/USDT"). Already-normalized input passes through.
pub fn normalize_symbol(symbol: &str) -> Result<String, String> {
    if symbol.contains('/') {
        return Ok(symbol.to_string());
    }
    if symbol.is_empty() {
        return Err("cannot normalize empty symbol".to_string());
    }

    for quote in QUOTE_CURRENCIES {
        if symbol.ends_with(quote) && symbol.len() > quote.len() {
            let base = &symbol[..symbol.len() - quote.len()];
            if !base.is_empty() && base.chars().all(|c| c.is_ascii_uppercase()) {
                return Ok(format!("{}/{}", base, quote));
            }
        }
    }

    Err(format!("cannot normalize symbol '{}': no recognized quote currency", symbol))
}

/// Reverse of [`normalize_symbol`], used on the exchange wire.
pub fn denormalize_symbol(symbol: &str) -> String {
    symbol.replace('/', "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(qty: Decimal) -> OrderRequest {
        OrderRequest {
            symbol: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: qty,
            price: Some(dec!(50000)),
            stop_price: None,
            leverage: 1.0,
            stop_loss_pct: Some(0.05),
            take_profit_pct: Some(0.10),
            reduce_only: false,
            post_only: false,
            source: "test".to_string(),
            strategy_id: "s1".to_string(),
            trace_id: "t1".to_string(),
            bar_index: None,
        }
    }

    #[test]
    fn test_fill_accumulates_weighted_average() {
        let mut order = Order::new(request(dec!(2)), "BUY_BTCUSDT_1_abcd1234".to_string());
        order.transition(OrderStatus::Submitted);

        order.apply_fill(Fill {
            price: dec!(50000),
            quantity: dec!(1),
            fee: dec!(5),
            timestamp: Utc::now(),
        });
        assert_eq!(order.status, OrderStatus::Partial);

        order.apply_fill(Fill {
            price: dec!(51000),
            quantity: dec!(1),
            fee: dec!(5),
            timestamp: Utc::now(),
        });
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, Some(dec!(50500)));
        assert_eq!(order.fee, dec!(10));
        assert_eq!(order.fills.len(), 2);
    }

    #[test]
    fn test_fill_never_exceeds_quantity() {
        let mut order = Order::new(request(dec!(1)), "BUY_BTCUSDT_1_abcd1234".to_string());
        order.apply_fill(Fill {
            price: dec!(50000),
            quantity: dec!(5),
            fee: Decimal::ZERO,
            timestamp: Utc::now(),
        });
        assert_eq!(order.filled_quantity, dec!(1));
        assert_eq!(order.status, OrderStatus::Filled);
    }

    #[test]
    fn test_terminal_orders_are_frozen() {
        let mut order = Order::rejected(request(dec!(1)), RejectReason::RiskCheckFailed, "deny list");
        order.transition(OrderStatus::Submitted);
        assert_eq!(order.status, OrderStatus::Rejected);

        order.apply_fill(Fill {
            price: dec!(50000),
            quantity: dec!(1),
            fee: Decimal::ZERO,
            timestamp: Utc::now(),
        });
        assert_eq!(order.filled_quantity, Decimal::ZERO);
    }

    #[test]
    fn test_wire_action() {
        let mut req = request(dec!(1));
        assert_eq!(req.wire_action(), "BUY");
        req.side = OrderSide::Sell;
        assert_eq!(req.wire_action(), "SELL");
        req.reduce_only = true;
        assert_eq!(req.wire_action(), "CLOSE");
    }

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize_symbol("BTCUSDT").unwrap(), "BTC/USDT");
        assert_eq!(normalize_symbol("ETHUSD").unwrap(), "ETH/USD");
        assert_eq!(normalize_symbol("BTC/USDT").unwrap(), "BTC/USDT");
        assert!(normalize_symbol("").is_err());
        assert!(normalize_symbol("USDT").is_err());
        assert!(normalize_symbol("btcusdt").is_err());
    }

    #[test]
    fn test_denormalize_roundtrip() {
        for sym in ["BTCUSDT", "ETHUSDC", "SOLUSD"] {
            let normalized = normalize_symbol(sym).unwrap();
            assert_eq!(denormalize_symbol(&normalized), sym);
        }
    }
}
