//! Risk gateway: the single mandatory ingress between any decision source
//! and any exchange call.
//!
//! Every submission produces exactly one audit record, written before the
//! adapter is touched. If the audit store is down the request fails closed:
//! better a missed trade than an unaudited one.

use crate::application::risk::breaker::CircuitBreaker;
use crate::application::risk::rules::{self, RuleContext, ValidationReport};
use crate::config::RiskConfig;
use crate::domain::audit::AuditRecord;
use crate::domain::errors::RejectReason;
use crate::domain::events::DomainEvent;
use crate::domain::types::{AccountState, Order, OrderRequest, OrderStatus};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::execution::ExecutionAdapter;
use crate::infrastructure::idempotency::{IdempotencyCheck, IdempotencyStore};
use crate::infrastructure::persistence::audit_store::AuditSink;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Gateway state surfaced through the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub daily_trade_count: u32,
    pub blocked_count: u64,
    pub risk_config: RiskConfig,
}

pub struct RiskGateway {
    config: RwLock<RiskConfig>,
    breaker: Arc<CircuitBreaker>,
    idempotency: Arc<IdempotencyStore>,
    audit: Arc<dyn AuditSink>,
    adapter: Arc<dyn ExecutionAdapter>,
    bus: EventBus,
    daily_trade_count: AtomicU32,
    blocked_count: AtomicU64,
}

impl RiskGateway {
    pub fn new(
        config: RiskConfig,
        breaker: Arc<CircuitBreaker>,
        idempotency: Arc<IdempotencyStore>,
        audit: Arc<dyn AuditSink>,
        adapter: Arc<dyn ExecutionAdapter>,
        bus: EventBus,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            breaker,
            idempotency,
            audit,
            adapter,
            bus,
            daily_trade_count: AtomicU32::new(0),
            blocked_count: AtomicU64::new(0),
        }
    }

    /// Pure rule evaluation against a caller-supplied account snapshot.
    /// Used by tests, dry runs and the admin surface; touches no adapter.
    pub async fn check(&self, request: &OrderRequest, account: &AccountState) -> ValidationReport {
        let config = self.config.read().await.clone();
        let breaker = self.breaker.view(&request.strategy_id).await;
        let reference_price = request.price.unwrap_or(Decimal::ZERO);
        rules::evaluate(&RuleContext {
            request,
            account,
            config: &config,
            breaker,
            reference_price,
            daily_trade_count: self.daily_trade_count.load(Ordering::SeqCst),
        })
    }

    /// Submit one order. Always returns an `Order`; rejections come back as
    /// terminal orders carrying the typed reason, never as `Err`.
    pub async fn submit(&self, request: OrderRequest) -> Order {
        let account = match self.adapter.get_balance().await {
            Ok(account) => {
                self.breaker.record_api_success();
                account
            }
            Err(e) => {
                warn!("RiskGateway: balance fetch failed: {}", e);
                if let Err(be) = self.breaker.record_api_failure().await {
                    error!("RiskGateway: breaker persistence failed: {}", be);
                }
                return self
                    .reject(request, RejectReason::ApiError, "account state unavailable", &[])
                    .await;
            }
        };

        let reference_price = match request.price {
            Some(price) => price,
            None => match self.adapter.get_ticker(&request.symbol).await {
                Ok(ticker) => ticker.price,
                Err(e) => {
                    warn!("RiskGateway: ticker fetch failed for {}: {}", request.symbol, e);
                    return self
                        .reject(request, RejectReason::PriceDeviation, "no reference price", &[])
                        .await;
                }
            },
        };

        let config = self.config.read().await.clone();
        let breaker = self.breaker.view(&request.strategy_id).await;
        let report = rules::evaluate(&RuleContext {
            request: &request,
            account: &account,
            config: &config,
            breaker,
            reference_price,
            daily_trade_count: self.daily_trade_count.load(Ordering::SeqCst),
        });

        // Exactly one audit record per submission, before any adapter call.
        let record = Self::audit_record(&request, &report, &account);
        if let Err(e) = self.audit.append(&record).await {
            // Fail closed: no audit trail, no trade.
            error!("RiskGateway: audit append failed, rejecting request: {}", e);
            return Order::rejected(request, RejectReason::ApiError, "audit persistence failed");
        }

        if !report.passed {
            let reason = report.reject_reason.unwrap_or(RejectReason::RiskCheckFailed);
            let detail = report.detail.clone().unwrap_or_default();
            self.blocked_count.fetch_add(1, Ordering::Relaxed);

            if let Some((trip_reason, value, threshold)) = &report.breaker_trip {
                if let Err(e) = self.breaker.trigger_account(trip_reason, *value, *threshold).await {
                    error!("RiskGateway: account breaker trip failed to persist: {}", e);
                }
            }

            warn!(
                "RiskGateway: blocked {} {} - {} ({})",
                request.side, request.symbol, reason, detail
            );
            self.bus
                .publish(DomainEvent::RiskBlocked {
                    trace_id: request.trace_id.clone(),
                    symbol: request.symbol.clone(),
                    reason,
                    detail: detail.clone(),
                })
                .await;
            let order = Order::rejected(request, reason, detail);
            self.publish_rejected(&order, reason).await;
            return order;
        }

        let admitted = report.modified.clone().unwrap_or_else(|| request.clone());

        // Short-window dedup catches resubmits across minute-bucket edges.
        let action = admitted.wire_action();
        let size = admitted.quantity;
        if self
            .idempotency
            .is_duplicate_in_window(action, &admitted.symbol, reference_price, size)
        {
            return Order::rejected(
                admitted,
                RejectReason::DuplicateOrder,
                "identical order inside dedup window",
            );
        }

        // Idempotency: a duplicate key returns the prior order as success.
        let client_order_id = match self
            .idempotency
            .check_and_register(action, &admitted.symbol, reference_price, size)
            .await
        {
            Ok(IdempotencyCheck::New { client_order_id }) => client_order_id,
            Ok(IdempotencyCheck::Duplicate { client_order_id }) => {
                info!(
                    "RiskGateway: duplicate submission, returning prior order {}",
                    client_order_id
                );
                match self.adapter.get_order(&client_order_id).await {
                    Ok(Some(prior)) => return prior,
                    _ => {
                        return Order::rejected(
                            admitted,
                            RejectReason::DuplicateOrder,
                            "duplicate of an order no longer known",
                        )
                    }
                }
            }
            Err(e) => {
                error!("RiskGateway: idempotency store failed: {}", e);
                return Order::rejected(admitted, RejectReason::ApiError, "idempotency store failed");
            }
        };

        match self.adapter.create_order(admitted.clone(), client_order_id).await {
            Ok(order) => {
                self.breaker.record_api_success();
                match order.status {
                    // The venue itself refused (e.g. look-ahead in the sim).
                    OrderStatus::Rejected | OrderStatus::Failed => {
                        let reason = order.reject_reason.unwrap_or(RejectReason::ApiError);
                        self.bus
                            .publish(DomainEvent::OrderRejected {
                                order: Box::new(order.clone()),
                                reason,
                            })
                            .await;
                    }
                    _ => {
                        self.daily_trade_count.fetch_add(1, Ordering::SeqCst);
                        self.bus
                            .publish(DomainEvent::OrderSubmitted {
                                order: Box::new(order.clone()),
                            })
                            .await;
                        if order.status == OrderStatus::Filled {
                            self.bus
                                .publish(DomainEvent::OrderFilled {
                                    order: Box::new(order.clone()),
                                })
                                .await;
                        }
                    }
                }
                order
            }
            Err(e) => {
                warn!("RiskGateway: adapter rejected submission: {}", e);
                if let Err(be) = self.breaker.record_api_failure().await {
                    error!("RiskGateway: breaker persistence failed: {}", be);
                }
                let mut order = Order::rejected(admitted, RejectReason::ApiError, e.to_string());
                order.status = OrderStatus::Failed;
                self.publish_rejected(&order, RejectReason::ApiError).await;
                order
            }
        }
    }

    async fn reject(
        &self,
        request: OrderRequest,
        reason: RejectReason,
        detail: &str,
        applied_rules: &[&str],
    ) -> Order {
        self.blocked_count.fetch_add(1, Ordering::Relaxed);
        let record = AuditRecord {
            trace_id: request.trace_id.clone(),
            order_id: None,
            symbol: request.symbol.clone(),
            action: request.wire_action().to_string(),
            original: request.clone(),
            modified: None,
            passed: false,
            blocked_reason: Some(reason.code().to_string()),
            applied_rules: applied_rules.iter().map(|s| s.to_string()).collect(),
            balance: Decimal::ZERO,
            total_exposure: Decimal::ZERO,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.audit.append(&record).await {
            error!("RiskGateway: audit append failed on reject path: {}", e);
            return Order::rejected(request, RejectReason::ApiError, "audit persistence failed");
        }
        let order = Order::rejected(request, reason, detail);
        self.publish_rejected(&order, reason).await;
        order
    }

    async fn publish_rejected(&self, order: &Order, reason: RejectReason) {
        self.bus
            .publish(DomainEvent::OrderRejected {
                order: Box::new(order.clone()),
                reason,
            })
            .await;
    }

    fn audit_record(
        request: &OrderRequest,
        report: &ValidationReport,
        account: &AccountState,
    ) -> AuditRecord {
        AuditRecord {
            trace_id: request.trace_id.clone(),
            order_id: None,
            symbol: request.symbol.clone(),
            action: request.wire_action().to_string(),
            original: request.clone(),
            modified: report.modified.clone(),
            passed: report.passed,
            blocked_reason: report.reject_reason.map(|r| r.code().to_string()),
            applied_rules: report.applied_rules.clone(),
            balance: account.available_balance,
            total_exposure: account.total_exposure(),
            timestamp: Utc::now(),
        }
    }

    /// Replace the runtime-mutable limits; compiled floors still apply.
    pub async fn update_config(&self, config: RiskConfig) -> anyhow::Result<()> {
        config.validate()?;
        *self.config.write().await = config;
        info!("RiskGateway: risk configuration updated");
        Ok(())
    }

    /// Midnight rollover of the per-day counters.
    pub fn reset_daily(&self) {
        self.daily_trade_count.store(0, Ordering::SeqCst);
    }

    pub async fn status(&self) -> GatewayStatus {
        GatewayStatus {
            daily_trade_count: self.daily_trade_count.load(Ordering::SeqCst),
            blocked_count: self.blocked_count.load(Ordering::Relaxed),
            risk_config: self.config.read().await.clone(),
        }
    }
}
