//! Composition root.
//!
//! A single [`Runtime`] owns every process-lifetime service and threads them
//! through constructors; nothing in the crate reaches for a hidden global.
//! Build order matters: persisted breaker state is restored before the risk
//! gateway exists, so no order can be accepted against stale safety state.

use crate::application::agents;
use crate::application::coordinator::DecisionCoordinator;
use crate::application::market_data::{
    BinanceCandleSource, MarketDataService, NeutralAuxProvider, StaticCandleSource,
};
use crate::application::risk::breaker::CircuitBreaker;
use crate::application::risk::gateway::RiskGateway;
use crate::application::scheduler::Scheduler;
use crate::application::workflow::DailyStateWriter;
use crate::config::{Config, ExecutionMode};
use crate::domain::events::DomainEvent;
use crate::infrastructure::event_bus::{run_journal_subscriber, EventBus, SqliteEventJournal};
use crate::infrastructure::execution::binance::BinanceAdapter;
use crate::infrastructure::execution::simulated::{SimConfig, SimulatedAdapter};
use crate::infrastructure::execution::ExecutionAdapter;
use crate::infrastructure::idempotency::IdempotencyStore;
use crate::infrastructure::network::sweeper::{HangingOrderRegistry, HangingOrderSweeper};
use crate::infrastructure::network::NetworkHandler;
use crate::infrastructure::persistence::audit_store::{AuditSink, SqliteAuditStore};
use crate::infrastructure::persistence::breaker_store::BreakerStore;
use crate::infrastructure::persistence::database::Database;
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Runtime {
    pub config: Config,
    pub bus: EventBus,
    pub breaker: Arc<CircuitBreaker>,
    pub gateway: Arc<RiskGateway>,
    pub adapter: Arc<dyn ExecutionAdapter>,
    pub market_data: Arc<MarketDataService>,
    pub coordinator: Arc<DecisionCoordinator>,
    pub idempotency: Arc<IdempotencyStore>,
    pub hanging: Arc<HangingOrderRegistry>,
    pub trading_enabled: Arc<AtomicBool>,
    pub db: Option<Database>,
    shutdown_tx: watch::Sender<bool>,
}

impl Runtime {
    /// Construct all services. Returns the runtime plus the journal
    /// subscriber handle whose failure is fatal (exit code 2).
    pub async fn build(config: Config) -> Result<(Arc<Runtime>, JoinHandle<Result<()>>)> {
        let bus = EventBus::new();

        let db = Database::new(&config.storage.database_url)
            .await
            .context("database initialization failed")?;

        let idempotency = Arc::new(IdempotencyStore::new(Some(db.pool.clone())));
        idempotency.load().await?;

        let audit: Arc<dyn AuditSink> = Arc::new(SqliteAuditStore::new(db.pool.clone()));

        // Breaker state must be live before the gateway accepts anything.
        let breaker_path = PathBuf::from(&config.storage.data_dir).join("circuit_breaker_state.json");
        let breaker = Arc::new(CircuitBreaker::new(
            config.risk.clone(),
            Some(BreakerStore::new(breaker_path)),
            bus.clone(),
        )?);

        let network = Arc::new(NetworkHandler::new(config.network.clone()));
        let hanging = Arc::new(HangingOrderRegistry::new());

        let (adapter, market_data): (Arc<dyn ExecutionAdapter>, Arc<MarketDataService>) =
            match config.mode {
                ExecutionMode::Simulated => {
                    let adapter = Arc::new(SimulatedAdapter::new(SimConfig::default()));
                    let source = Arc::new(StaticCandleSource::new());
                    let market_data =
                        Arc::new(MarketDataService::new(source, Arc::new(NeutralAuxProvider)));
                    (adapter, market_data)
                }
                ExecutionMode::Exchange => {
                    let adapter = Arc::new(BinanceAdapter::new(
                        config.exchange.api_key.clone(),
                        config.exchange.api_secret.clone(),
                        config.exchange.base_url.clone(),
                        config.exchange.ws_url.clone(),
                        Arc::clone(&network),
                        Arc::clone(&hanging),
                    ));
                    let source = Arc::new(BinanceCandleSource::new(
                        config.exchange.base_url.clone(),
                        Arc::clone(&network),
                    ));
                    let market_data =
                        Arc::new(MarketDataService::new(source, Arc::new(NeutralAuxProvider)));
                    (adapter, market_data)
                }
            };

        if config.ai_enabled() {
            // The agent contract is identical either way; LLM-backed agents
            // are configured but out of scope, so log and fall back.
            warn!("Runtime: ai section configured; using rule-based agents");
        }
        let coordinator = Arc::new(DecisionCoordinator::new(
            agents::default_agents(config.risk.clone()),
            config.risk.clone(),
            config.debate_enabled,
        ));

        let gateway = Arc::new(RiskGateway::new(
            config.risk.clone(),
            Arc::clone(&breaker),
            Arc::clone(&idempotency),
            audit,
            Arc::clone(&adapter),
            bus.clone(),
        ));

        // Safety journal: losing a RISK_BLOCKED or BREAKER_TRIGGERED record
        // must kill the process, so the caller owns this handle.
        let (journal_rx, _) = bus.subscribe("audit_journal").await;
        let journal = Arc::new(SqliteEventJournal::new(db.pool.clone()));
        let journal_handle = tokio::spawn(run_journal_subscriber(journal_rx, journal));

        // Fire-and-forget notification sinks; only the log kind is built in.
        for sink in &config.notification {
            if matches!(sink.kind, crate::config::NotificationKind::Log) {
                let (mut rx, _) = bus.subscribe("notify_log").await;
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        info!(target: "notify", "{}", event.kind());
                    }
                });
            }
        }

        let (shutdown_tx, _) = watch::channel(false);

        let runtime = Arc::new(Runtime {
            config,
            bus,
            breaker,
            gateway,
            adapter,
            market_data,
            coordinator,
            idempotency,
            hanging,
            trading_enabled: Arc::new(AtomicBool::new(true)),
            db: Some(db),
            shutdown_tx,
        });

        Ok((runtime, journal_handle))
    }

    /// Connect the adapter and start the scheduler and sweeper tasks.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        self.adapter.connect().await.context("adapter connect failed")?;

        let scheduler = Arc::new(Scheduler::new(
            self.config.symbols.clone(),
            Duration::from_secs(self.config.tick_interval_secs),
            Arc::clone(&self.market_data),
            Arc::clone(&self.coordinator),
            Arc::clone(&self.gateway),
            Arc::clone(&self.adapter),
            Arc::clone(&self.breaker),
            Arc::clone(&self.trading_enabled),
            Some(DailyStateWriter::new(&self.config.storage.data_dir)),
        ));

        let mut handles = Vec::new();

        let shutdown_rx = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(scheduler.run(shutdown_rx)));

        let sweeper = HangingOrderSweeper::new(
            Arc::clone(&self.hanging),
            Arc::clone(&self.adapter),
            self.bus.clone(),
            self.config.network.clone(),
        );
        let shutdown_rx = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move { sweeper.run(shutdown_rx).await }));

        // Hourly TTL sweep over persisted idempotency keys.
        {
            let idempotency = Arc::clone(&self.idempotency);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(3_600));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = idempotency.sweep_expired().await {
                                warn!("Runtime: idempotency sweep failed: {}", e);
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                return;
                            }
                        }
                    }
                }
            }));
        }

        info!(
            "Runtime: started ({} symbols, {:?} mode)",
            self.config.symbols.len(),
            self.config.mode
        );
        Ok(handles)
    }

    pub fn pause_trading(&self) {
        self.trading_enabled.store(false, Ordering::SeqCst);
        info!("Runtime: trading paused");
    }

    pub fn resume_trading(&self) {
        self.trading_enabled.store(true, Ordering::SeqCst);
        info!("Runtime: trading resumed");
    }

    /// Graceful shutdown: stop ticks, let in-flight work drain, persist
    /// breaker state, announce, close adapters.
    pub async fn shutdown(&self, handles: Vec<JoinHandle<()>>) {
        info!("Runtime: graceful shutdown starting");
        self.trading_enabled.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(30), handle).await.is_err() {
                warn!("Runtime: worker did not stop within the shutdown deadline");
            }
        }

        self.bus.publish(DomainEvent::Shutdown { at: Utc::now() }).await;

        if let Err(e) = self.adapter.disconnect().await {
            warn!("Runtime: adapter disconnect failed: {}", e);
        }
        info!("Runtime: shutdown complete");
    }

    /// Emergency stop: trip breakers, flatten everything, halt intake.
    ///
    /// Closes bypass the gateway deliberately: both breaker tiers are now
    /// TRIGGERED and would veto their own close list.
    pub async fn emergency_shutdown(&self, reason: &str) -> Result<()> {
        self.trading_enabled.store(false, Ordering::SeqCst);
        let positions = self.adapter.list_positions().await.unwrap_or_default();
        let to_close = self.breaker.emergency_shutdown(reason, &positions).await?;
        for position in to_close {
            let side = match position.side {
                crate::domain::types::PositionSide::Long => crate::domain::types::OrderSide::Sell,
                crate::domain::types::PositionSide::Short => crate::domain::types::OrderSide::Buy,
            };
            let request = crate::domain::types::OrderRequest {
                symbol: position.symbol.clone(),
                side,
                order_type: crate::domain::types::OrderType::Market,
                quantity: position.size,
                price: None,
                stop_price: None,
                leverage: position.leverage,
                stop_loss_pct: None,
                take_profit_pct: None,
                reduce_only: true,
                post_only: false,
                source: "emergency_shutdown".to_string(),
                strategy_id: String::new(),
                trace_id: uuid::Uuid::new_v4().to_string(),
                bar_index: None,
            };
            let coid = IdempotencyStore::generate_client_order_id("FLAT", &position.symbol);
            match self.adapter.create_order(request, coid).await {
                Ok(order) => info!(
                    "Runtime: emergency close {} -> {:?}",
                    position.symbol, order.status
                ),
                Err(e) => warn!("Runtime: emergency close failed for {}: {}", position.symbol, e),
            }
        }
        Ok(())
    }
}
