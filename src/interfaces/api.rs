//! Administrative HTTP/WS surface.
//!
//! REST endpoints for health, status, orders, positions and balance, plus
//! two WebSocket channels: `/ws` for commands and `/ws/events` for the
//! domain-event stream. Errors use one JSON envelope shape everywhere:
//! `{"error":{"code","message"}}`.

use crate::application::system::Runtime;
use crate::domain::errors::RejectReason;
use crate::domain::types::{OrderRequest, OrderStatus};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/orders", post(submit_order).get(list_orders))
        .route("/api/v1/positions", get(list_positions))
        .route("/api/v1/balance", get(balance))
        .route("/api/v1/strategies/:id/enable", post(enable_strategy))
        .route("/api/v1/strategies/:id/disable", post(disable_strategy))
        .route("/ws", get(ws_commands))
        .route("/ws/events", get(ws_events))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(runtime)
}

/// Serve until the process shuts down.
pub async fn serve(runtime: Arc<Runtime>) -> anyhow::Result<()> {
    let addr = format!(
        "{}:{}",
        runtime.config.gateway.host, runtime.config.gateway.port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Admin API listening on {}", addr);
    axum::serve(listener, router(runtime)).await?;
    Ok(())
}

fn error_body(code: &str, message: &str) -> serde_json::Value {
    json!({ "error": { "code": code, "message": message } })
}

fn internal_error(message: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(error_body(RejectReason::ApiError.code(), &message.to_string())),
    )
        .into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "timestamp": Utc::now().to_rfc3339() }))
}

async fn status(State(runtime): State<Arc<Runtime>>) -> Json<serde_json::Value> {
    Json(status_payload(&runtime).await)
}

async fn status_payload(runtime: &Runtime) -> serde_json::Value {
    let gateway = runtime.gateway.status().await;
    let breakers = runtime.breaker.snapshot().await;
    json!({
        "running": runtime.trading_enabled.load(std::sync::atomic::Ordering::SeqCst),
        "mode": format!("{:?}", runtime.config.mode),
        "symbols": runtime.config.symbols,
        "gateway": gateway,
        "breakers": breakers,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

async fn submit_order(
    State(runtime): State<Arc<Runtime>>,
    Json(request): Json<OrderRequest>,
) -> Response {
    let order = runtime.gateway.submit(request).await;
    match order.status {
        OrderStatus::Rejected | OrderStatus::Failed => {
            let code = order
                .reject_reason
                .map(|r| r.code())
                .unwrap_or(RejectReason::RiskCheckFailed.code());
            let message = order.status_message.clone().unwrap_or_default();
            let status = match order.reject_reason {
                Some(RejectReason::RateLimit) => StatusCode::TOO_MANY_REQUESTS,
                Some(RejectReason::DuplicateOrder) => StatusCode::CONFLICT,
                _ => StatusCode::BAD_REQUEST,
            };
            let mut body = error_body(code, &message);
            body["error"]["reject_reason"] = json!(code);
            (status, Json(body)).into_response()
        }
        _ => Json(order).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct OrderQuery {
    symbol: Option<String>,
}

async fn list_orders(
    State(runtime): State<Arc<Runtime>>,
    Query(query): Query<OrderQuery>,
) -> Response {
    match runtime.adapter.list_orders(query.symbol.as_deref()).await {
        Ok(orders) => Json(orders).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn list_positions(State(runtime): State<Arc<Runtime>>) -> Response {
    match runtime.adapter.list_positions().await {
        Ok(positions) => Json(positions).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn balance(State(runtime): State<Arc<Runtime>>) -> Response {
    match runtime.adapter.get_balance().await {
        Ok(account) => Json(account).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn enable_strategy(
    State(runtime): State<Arc<Runtime>>,
    Path(id): Path<String>,
) -> Response {
    match runtime
        .breaker
        .reset(crate::application::risk::breaker::BreakerLevel::Strategy, &id)
        .await
    {
        Ok(()) => Json(json!({ "strategy": id, "enabled": true })).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn disable_strategy(
    State(runtime): State<Arc<Runtime>>,
    Path(id): Path<String>,
) -> Response {
    match runtime.breaker.trip_strategy(&id, "disabled by operator").await {
        Ok(()) => Json(json!({ "strategy": id, "enabled": false })).into_response(),
        Err(e) => internal_error(e),
    }
}

// ===== WebSocket surfaces =====

async fn ws_commands(
    State(runtime): State<Arc<Runtime>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_commands(socket, runtime))
}

#[derive(Debug, Deserialize)]
struct WsCommand {
    command: String,
    #[serde(default)]
    params: serde_json::Value,
}

async fn handle_commands(mut socket: WebSocket, runtime: Arc<Runtime>) {
    while let Some(Ok(message)) = socket.next().await {
        let Message::Text(text) = message else { continue };
        let response = match serde_json::from_str::<WsCommand>(&text) {
            Ok(command) => run_command(&runtime, command).await,
            Err(e) => error_body("VALIDATION", &format!("malformed command: {}", e)),
        };
        if socket.send(Message::Text(response.to_string())).await.is_err() {
            break;
        }
    }
}

async fn run_command(runtime: &Arc<Runtime>, command: WsCommand) -> serde_json::Value {
    match command.command.as_str() {
        "ping" => json!({ "pong": Utc::now().timestamp_millis() }),
        "status" => status_payload(runtime).await,
        "start" => {
            runtime.resume_trading();
            json!({ "running": true })
        }
        "stop" => {
            runtime.pause_trading();
            json!({ "running": false })
        }
        "positions" => match runtime.adapter.list_positions().await {
            Ok(positions) => json!({ "positions": positions }),
            Err(e) => error_body(RejectReason::ApiError.code(), &e.to_string()),
        },
        "trade" => match serde_json::from_value::<OrderRequest>(command.params) {
            Ok(request) => {
                let order = runtime.gateway.submit(request).await;
                serde_json::to_value(&order).unwrap_or_else(|e| {
                    error_body(RejectReason::ApiError.code(), &e.to_string())
                })
            }
            Err(e) => error_body("VALIDATION", &format!("invalid order request: {}", e)),
        },
        other => error_body("VALIDATION", &format!("unknown command '{}'", other)),
    }
}

async fn ws_events(
    State(runtime): State<Arc<Runtime>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_events(socket, runtime))
}

async fn handle_events(socket: WebSocket, runtime: Arc<Runtime>) {
    let (mut sink, mut stream) = socket.split();
    let (mut events, _) = runtime.bus.subscribe("ws_events").await;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let frame = match serde_json::to_string(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("ws_events: serialization failed: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}
