//! Execution adapters: a uniform order/position/balance interface over the
//! deterministic simulator and live exchanges. Backtest and live code paths
//! consume identical operations.

pub mod binance;
pub mod simulated;

use crate::domain::types::{AccountState, Order, OrderRequest, Position, Ticker};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

/// Order lifecycle notification fanned out by adapters.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub order: Order,
}

#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;

    /// Submit an order under the given client-order-id.
    ///
    /// Blocks until the venue acknowledges. Status moves to `Submitted` and
    /// then to a fill/reject state from the venue response; a venue call that
    /// exceeds `order_timeout` leaves the order `Pending` for the sweeper.
    /// Resubmitting an already-known client-order-id returns the original
    /// order unchanged.
    async fn create_order(&self, request: OrderRequest, client_order_id: String) -> Result<Order>;

    /// Cancel by client-order-id; `reason` lands in the order's status
    /// message. Returns the order after the venue confirms.
    async fn cancel_order(&self, client_order_id: &str, reason: &str) -> Result<Order>;

    async fn get_order(&self, client_order_id: &str) -> Result<Option<Order>>;
    async fn list_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>>;

    /// Consistent snapshot of all open positions (no torn reads).
    async fn list_positions(&self) -> Result<Vec<Position>>;

    async fn get_balance(&self) -> Result<AccountState>;
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker>;
    async fn subscribe_ticker(&self, symbols: &[String]) -> Result<mpsc::Receiver<Ticker>>;

    /// Order lifecycle stream (fills, cancels, rejects).
    fn subscribe_order_updates(&self) -> broadcast::Receiver<OrderUpdate>;
}
