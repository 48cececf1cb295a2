//! Hanging-order sweeper.
//!
//! Orders that the exchange never confirmed past PENDING are registered here
//! by the adapters. A background task periodically queries each one by
//! client-order-id, reconciles local state when the exchange knows better,
//! and otherwise cancels it with reason `hanging_sweep`.

use crate::config::NetworkConfig;
use crate::domain::events::DomainEvent;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::execution::ExecutionAdapter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub client_order_id: String,
    pub symbol: String,
    pub registered_at: Instant,
}

/// Shared registry of unconfirmed orders. Adapters insert, the sweeper drains.
#[derive(Default)]
pub struct HangingOrderRegistry {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl HangingOrderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client_order_id: &str, symbol: &str) {
        let mut entries = self.entries.lock().expect("hanging registry poisoned");
        entries.insert(
            client_order_id.to_string(),
            PendingEntry {
                client_order_id: client_order_id.to_string(),
                symbol: symbol.to_string(),
                registered_at: Instant::now(),
            },
        );
        info!("HangingOrderRegistry: registered {}", client_order_id);
    }

    pub fn remove(&self, client_order_id: &str) {
        self.entries
            .lock()
            .expect("hanging registry poisoned")
            .remove(client_order_id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("hanging registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn older_than(&self, age: Duration) -> Vec<PendingEntry> {
        let entries = self.entries.lock().expect("hanging registry poisoned");
        entries
            .values()
            .filter(|e| e.registered_at.elapsed() >= age)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reconciled: usize,
    pub cancelled: usize,
    pub failed: usize,
}

pub struct HangingOrderSweeper {
    registry: Arc<HangingOrderRegistry>,
    adapter: Arc<dyn ExecutionAdapter>,
    bus: EventBus,
    config: NetworkConfig,
}

impl HangingOrderSweeper {
    pub fn new(
        registry: Arc<HangingOrderRegistry>,
        adapter: Arc<dyn ExecutionAdapter>,
        bus: EventBus,
        config: NetworkConfig,
    ) -> Self {
        Self {
            registry,
            adapter,
            bus,
            config,
        }
    }

    /// Background loop; one sweep every `hanging_order_cleanup_interval`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.cleanup_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.sweep_once().await;
                    if report != SweepReport::default() {
                        info!(
                            "HangingOrderSweeper: reconciled {}, cancelled {}, failed {}",
                            report.reconciled, report.cancelled, report.failed
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("HangingOrderSweeper: shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One pass over every entry past the hanging threshold.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let stale = self.registry.older_than(self.config.hanging_order_threshold());

        for entry in stale {
            let coid = &entry.client_order_id;

            match self.adapter.get_order(coid).await {
                Ok(Some(order)) if order.is_terminal() => {
                    // Exchange already resolved it; adopt that state.
                    self.registry.remove(coid);
                    report.reconciled += 1;
                    info!(
                        "HangingOrderSweeper: reconciled {} to {:?}",
                        coid, order.status
                    );
                    let event = match order.reject_reason {
                        Some(reason) => DomainEvent::OrderRejected {
                            order: Box::new(order),
                            reason,
                        },
                        None => DomainEvent::OrderFilled {
                            order: Box::new(order),
                        },
                    };
                    self.bus.publish(event).await;
                }
                Ok(_) => {
                    // Unknown or still in flight: cancel by client-order-id.
                    match self.adapter.cancel_order(coid, "hanging_sweep").await {
                        Ok(_) => {
                            self.registry.remove(coid);
                            report.cancelled += 1;
                            warn!(
                                "HangingOrderSweeper: cancelled hanging order {} ({})",
                                coid, entry.symbol
                            );
                        }
                        Err(e) => {
                            report.failed += 1;
                            warn!(
                                "HangingOrderSweeper: cancel failed for {}: {} (will retry next cycle)",
                                coid, e
                            );
                        }
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        "HangingOrderSweeper: lookup failed for {}: {} (will retry next cycle)",
                        coid, e
                    );
                }
            }
        }
        report
    }
}
