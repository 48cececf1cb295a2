//! Binance execution adapter.
//!
//! Wraps the exchange REST API with HMAC-SHA256 request signing. Every call
//! crosses the network through the resilience layer; an order submission
//! that exceeds its timeout is parked as PENDING with the hanging-order
//! registry instead of being retried blindly.

use crate::domain::errors::{NetworkError, RejectReason};
use crate::domain::types::{
    denormalize_symbol, normalize_symbol, AccountState, Fill, Order, OrderRequest, OrderSide,
    OrderStatus, OrderType, Position, PositionSide, Ticker,
};
use crate::infrastructure::execution::{ExecutionAdapter, OrderUpdate};
use crate::infrastructure::network::sweeper::HangingOrderRegistry;
use crate::infrastructure::network::{CallClass, NetworkHandler};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{info, warn};

pub struct BinanceAdapter {
    client: reqwest_middleware::ClientWithMiddleware,
    api_key: String,
    api_secret: String,
    base_url: String,
    ws_url: String,
    network: Arc<NetworkHandler>,
    hanging: Arc<HangingOrderRegistry>,
    orders: RwLock<HashMap<String, Order>>,
    order_update_tx: broadcast::Sender<OrderUpdate>,
}

#[derive(Debug, Deserialize)]
struct BinanceFill {
    price: String,
    qty: String,
    commission: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceOrderResponse {
    #[serde(default)]
    order_id: i64,
    status: String,
    #[serde(default)]
    executed_qty: Option<String>,
    #[serde(default)]
    cummulative_quote_qty: Option<String>,
    #[serde(default)]
    fills: Vec<BinanceFill>,
}

fn map_status(status: &str) -> OrderStatus {
    match status {
        "NEW" | "PENDING_CANCEL" => OrderStatus::Open,
        "PARTIALLY_FILLED" => OrderStatus::Partial,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" => OrderStatus::Failed,
        _ => OrderStatus::Submitted,
    }
}

impl BinanceAdapter {
    pub fn new(
        api_key: String,
        api_secret: String,
        base_url: String,
        ws_url: String,
        network: Arc<NetworkHandler>,
        hanging: Arc<HangingOrderRegistry>,
    ) -> Self {
        let retry_policy =
            reqwest_retry::policies::ExponentialBackoff::builder().build_with_max_retries(0);
        let client = reqwest_middleware::ClientBuilder::new(reqwest::Client::new())
            .with(reqwest_retry::RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        let (order_update_tx, _) = broadcast::channel(256);
        Self {
            client,
            api_key,
            api_secret,
            base_url,
            ws_url,
            network,
            hanging,
            orders: RwLock::new(HashMap::new()),
            order_update_tx,
        }
    }

    /// HMAC-SHA256 signature over the query string.
    fn sign_request(&self, query_string: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;

        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_url(&self, path: &str, params: &[(&str, String)]) -> String {
        let query_string: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign_request(&query_string);
        format!("{}{}?{}&signature={}", self.base_url, path, query_string, signature)
    }

    async fn send_signed(
        &self,
        method: reqwest::Method,
        url: String,
    ) -> Result<serde_json::Value, NetworkError> {
        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| NetworkError::Connection(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(NetworkError::RateLimited {
                retry_after: std::time::Duration::from_secs(retry_after),
            });
        }
        let body = response
            .text()
            .await
            .map_err(|e| NetworkError::Connection(e.to_string()))?;
        if status.is_server_error() {
            return Err(NetworkError::Server {
                status: status.as_u16(),
                message: body,
            });
        }
        if !status.is_success() {
            return Err(NetworkError::Client {
                status: status.as_u16(),
                message: body,
            });
        }
        serde_json::from_str(&body).map_err(|e| NetworkError::Connection(e.to_string()))
    }

    fn apply_response(order: &mut Order, response: &BinanceOrderResponse) {
        if response.order_id != 0 {
            order.id = response.order_id.to_string();
        }

        if !response.fills.is_empty() {
            for f in &response.fills {
                let price = Decimal::from_str(&f.price).unwrap_or_default();
                let qty = Decimal::from_str(&f.qty).unwrap_or_default();
                let fee = Decimal::from_str(&f.commission).unwrap_or_default();
                order.apply_fill(Fill {
                    price,
                    quantity: qty,
                    fee,
                    timestamp: Utc::now(),
                });
            }
        } else if let (Some(executed), Some(quote)) =
            (&response.executed_qty, &response.cummulative_quote_qty)
        {
            let executed = Decimal::from_str(executed).unwrap_or_default();
            let quote = Decimal::from_str(quote).unwrap_or_default();
            if executed > order.filled_quantity && executed > Decimal::ZERO {
                let price = quote / executed;
                order.apply_fill(Fill {
                    price,
                    quantity: executed - order.filled_quantity,
                    fee: Decimal::ZERO,
                    timestamp: Utc::now(),
                });
            }
        }

        let mapped = map_status(&response.status);
        if !order.is_terminal() && order.status != mapped {
            if mapped == OrderStatus::Rejected {
                order.reject_reason = Some(RejectReason::ApiError);
            }
            order.transition(mapped);
        }
    }
}

#[async_trait]
impl ExecutionAdapter for BinanceAdapter {
    async fn connect(&self) -> Result<()> {
        // Ping is unauthenticated; proves reachability before trading starts.
        let url = format!("{}/api/v3/ping", self.base_url);
        self.network
            .execute("ping", CallClass::Query, || async {
                self.client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| NetworkError::Connection(e.to_string()))?;
                Ok(())
            })
            .await
            .context("Binance ping failed")?;
        info!("BinanceAdapter: connected to {}", self.base_url);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn create_order(&self, request: OrderRequest, client_order_id: String) -> Result<Order> {
        // The id is part of the exchange wire contract; never send a
        // malformed one.
        if !crate::infrastructure::idempotency::IdempotencyStore::validate_client_order_id(
            &client_order_id,
        ) {
            anyhow::bail!("malformed client-order-id: {}", client_order_id);
        }

        // Idempotent replay check against the local mirror.
        if let Some(existing) = self.orders.read().await.get(&client_order_id) {
            info!("BinanceAdapter: replayed client-order-id {}", client_order_id);
            return Ok(existing.clone());
        }

        let api_symbol = denormalize_symbol(&request.symbol);
        let side = match request.side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let order_type = match request.order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::Stop => "STOP_LOSS",
            OrderType::StopLimit => "STOP_LOSS_LIMIT",
        };

        let timestamp = Utc::now().timestamp_millis();
        let mut params = vec![
            ("symbol", api_symbol.clone()),
            ("side", side.to_string()),
            ("type", order_type.to_string()),
            ("quantity", request.quantity.to_string()),
            ("newClientOrderId", client_order_id.clone()),
            ("timestamp", timestamp.to_string()),
        ];
        if let (OrderType::Limit, Some(price)) = (request.order_type, request.price) {
            params.push(("price", price.to_string()));
            params.push(("timeInForce", "GTC".to_string()));
        }
        if let Some(stop) = request.stop_price {
            params.push(("stopPrice", stop.to_string()));
        }

        let url = self.signed_url("/api/v3/order", &params);
        let mut order = Order::new(request.clone(), client_order_id.clone());
        order.transition(OrderStatus::Submitted);

        let result = self
            .network
            .execute("order", CallClass::OrderSubmission, || {
                self.send_signed(reqwest::Method::POST, url.clone())
            })
            .await;

        match result {
            Ok(value) => {
                let response: BinanceOrderResponse =
                    serde_json::from_value(value).context("unexpected order response shape")?;
                Self::apply_response(&mut order, &response);
            }
            Err(NetworkError::Timeout(_)) => {
                // Acknowledgement unknown: park it for the sweeper.
                warn!(
                    "BinanceAdapter: order {} timed out, parking as PENDING",
                    client_order_id
                );
                order.status = OrderStatus::Pending;
                self.hanging.register(&client_order_id, &request.symbol);
            }
            Err(NetworkError::Client { message, .. })
                if message.contains("Duplicate") || message.contains("-2026") =>
            {
                // The exchange already knows this client-order-id; adopt its
                // view instead of failing.
                if let Some(known) = self.get_order(&client_order_id).await? {
                    return Ok(known);
                }
                order.status = OrderStatus::Pending;
                self.hanging.register(&client_order_id, &request.symbol);
            }
            Err(e) => {
                order.status = OrderStatus::Failed;
                order.reject_reason = Some(e.reject_reason());
                order.status_message = Some(e.to_string());
            }
        }

        self.orders.write().await.insert(client_order_id, order.clone());
        let _ = self.order_update_tx.send(OrderUpdate { order: order.clone() });
        Ok(order)
    }

    async fn cancel_order(&self, client_order_id: &str, reason: &str) -> Result<Order> {
        let symbol = {
            let orders = self.orders.read().await;
            orders
                .get(client_order_id)
                .map(|o| o.request.symbol.clone())
                .ok_or_else(|| anyhow!("unknown client-order-id {}", client_order_id))?
        };

        let timestamp = Utc::now().timestamp_millis();
        let params = vec![
            ("symbol", denormalize_symbol(&symbol)),
            ("origClientOrderId", client_order_id.to_string()),
            ("timestamp", timestamp.to_string()),
        ];
        let url = self.signed_url("/api/v3/order", &params);

        self.network
            .execute("cancel", CallClass::Query, || {
                self.send_signed(reqwest::Method::DELETE, url.clone())
            })
            .await
            .with_context(|| format!("failed to cancel {}", client_order_id))?;

        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(client_order_id)
            .ok_or_else(|| anyhow!("unknown client-order-id {}", client_order_id))?;
        if !order.is_terminal() {
            order.transition(OrderStatus::Cancelled);
            order.status_message = Some(reason.to_string());
        }
        let order = order.clone();
        drop(orders);

        let _ = self.order_update_tx.send(OrderUpdate { order: order.clone() });
        Ok(order)
    }

    async fn get_order(&self, client_order_id: &str) -> Result<Option<Order>> {
        let Some(mut local) = self.orders.read().await.get(client_order_id).cloned() else {
            return Ok(None);
        };

        let timestamp = Utc::now().timestamp_millis();
        let params = vec![
            ("symbol", denormalize_symbol(&local.request.symbol)),
            ("origClientOrderId", client_order_id.to_string()),
            ("timestamp", timestamp.to_string()),
        ];
        let url = self.signed_url("/api/v3/order", &params);

        match self
            .network
            .execute("get_order", CallClass::Query, || {
                self.send_signed(reqwest::Method::GET, url.clone())
            })
            .await
        {
            Ok(value) => {
                let response: BinanceOrderResponse =
                    serde_json::from_value(value).context("unexpected order response shape")?;
                Self::apply_response(&mut local, &response);
                self.orders
                    .write()
                    .await
                    .insert(client_order_id.to_string(), local.clone());
                Ok(Some(local))
            }
            Err(NetworkError::Client { status: 404, .. }) => Ok(Some(local)),
            Err(e) => Err(e).context("order lookup failed"),
        }
    }

    async fn list_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>> {
        let orders = self.orders.read().await;
        Ok(orders
            .values()
            .filter(|o| symbol.map(|s| o.request.symbol == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn list_positions(&self) -> Result<Vec<Position>> {
        let account = self.fetch_account().await?;
        let mut positions = Vec::new();
        for (asset, qty) in account.holdings {
            let symbol = match normalize_symbol(&format!("{}USDT", asset)) {
                Ok(s) => s,
                Err(_) => continue,
            };
            let mark = self.get_ticker(&symbol).await.map(|t| t.price).unwrap_or_default();
            positions.push(Position {
                symbol,
                side: PositionSide::Long,
                size: qty,
                entry_price: Decimal::ZERO, // spot account does not report cost basis
                mark_price: mark,
                unrealized_pnl: Decimal::ZERO,
                unrealized_pnl_pct: 0.0,
                leverage: 1.0,
                liquidation_price: None,
                margin: qty * mark,
                stop_loss_pct: None,
                take_profit_pct: None,
            });
        }
        Ok(positions)
    }

    async fn get_balance(&self) -> Result<AccountState> {
        let account = self.fetch_account().await?;
        let positions = self.list_positions().await?;

        let mut exposure = HashMap::new();
        for p in &positions {
            *exposure.entry(p.symbol.clone()).or_default() += p.notional();
        }
        let position_value: Decimal = positions.iter().map(|p| p.notional()).sum();
        let open_order_count = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| !o.is_terminal())
            .count();

        Ok(AccountState {
            total_equity: account.cash + position_value,
            available_balance: account.cash,
            margin_balance: position_value,
            unrealized_pnl: Decimal::ZERO,
            exposure,
            open_order_count,
            daily_pnl: Decimal::ZERO,
            daily_loss_pct: 0.0,
            drawdown: 0.0,
        })
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        let url = format!(
            "{}/api/v3/ticker/price?symbol={}",
            self.base_url,
            denormalize_symbol(symbol)
        );
        let value = self
            .network
            .execute("ticker", CallClass::Query, || async {
                let response = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| NetworkError::Connection(e.to_string()))?;
                response
                    .json::<serde_json::Value>()
                    .await
                    .map_err(|e| NetworkError::Connection(e.to_string()))
            })
            .await
            .context("ticker fetch failed")?;

        let price = value
            .get("price")
            .and_then(|p| p.as_str())
            .and_then(|p| Decimal::from_str(p).ok())
            .ok_or_else(|| anyhow!("malformed ticker response"))?;

        Ok(Ticker {
            symbol: symbol.to_string(),
            price,
            timestamp: Utc::now().timestamp(),
        })
    }

    async fn subscribe_ticker(&self, symbols: &[String]) -> Result<mpsc::Receiver<Ticker>> {
        let (tx, rx) = mpsc::channel(256);

        for symbol in symbols {
            let stream_symbol = denormalize_symbol(symbol).to_lowercase();
            let url = format!("{}/ws/{}@miniTicker", self.ws_url, stream_symbol);
            let tx = tx.clone();
            let symbol = symbol.clone();

            tokio::spawn(async move {
                loop {
                    match tokio_tungstenite::connect_async(url.as_str()).await {
                        Ok((mut stream, _)) => {
                            info!("BinanceAdapter: ticker stream up for {}", symbol);
                            while let Some(message) = stream.next().await {
                                let Ok(message) = message else { break };
                                let Ok(text) = message.into_text() else { continue };
                                let Ok(value) = serde_json::from_str::<serde_json::Value>(&text)
                                else {
                                    continue;
                                };
                                let Some(price) = value
                                    .get("c")
                                    .and_then(|c| c.as_str())
                                    .and_then(|c| Decimal::from_str(c).ok())
                                else {
                                    continue;
                                };
                                let ticker = Ticker {
                                    symbol: symbol.clone(),
                                    price,
                                    timestamp: Utc::now().timestamp(),
                                };
                                if tx.send(ticker).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            warn!("BinanceAdapter: ticker stream error for {}: {}", symbol, e);
                        }
                    }
                    if tx.is_closed() {
                        return;
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            });
        }

        Ok(rx)
    }

    fn subscribe_order_updates(&self) -> broadcast::Receiver<OrderUpdate> {
        self.order_update_tx.subscribe()
    }
}

struct SpotAccount {
    cash: Decimal,
    holdings: Vec<(String, Decimal)>,
}

impl BinanceAdapter {
    async fn fetch_account(&self) -> Result<SpotAccount> {
        let timestamp = Utc::now().timestamp_millis();
        let params = vec![("timestamp", timestamp.to_string())];
        let url = self.signed_url("/api/v3/account", &params);

        let value = self
            .network
            .execute("account", CallClass::Query, || {
                self.send_signed(reqwest::Method::GET, url.clone())
            })
            .await
            .context("account fetch failed")?;

        #[derive(Debug, Deserialize)]
        struct Balance {
            asset: String,
            free: String,
            locked: String,
        }
        #[derive(Debug, Deserialize)]
        struct Account {
            balances: Vec<Balance>,
        }

        let account: Account = serde_json::from_value(value).context("unexpected account shape")?;
        let mut cash = Decimal::ZERO;
        let mut holdings = Vec::new();
        for b in account.balances {
            let free = Decimal::from_str(&b.free).unwrap_or(Decimal::ZERO);
            let locked = Decimal::from_str(&b.locked).unwrap_or(Decimal::ZERO);
            let total = free + locked;
            if total <= Decimal::ZERO {
                continue;
            }
            if b.asset == "USDT" || b.asset == "USD" {
                cash += total;
            } else {
                holdings.push((b.asset, total));
            }
        }
        Ok(SpotAccount { cash, holdings })
    }
}
