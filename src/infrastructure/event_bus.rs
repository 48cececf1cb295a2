//! Event bus: append-only fan-out of domain events.
//!
//! Each subscriber owns a bounded buffer. A slow subscriber never
//! back-pressures the producer; overflowing events are dropped for that
//! subscriber alone and counted.

use crate::domain::events::DomainEvent;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::{error, warn};

const SUBSCRIBER_BUFFER: usize = 256;

struct SubscriberSlot {
    name: String,
    tx: mpsc::Sender<DomainEvent>,
    dropped: Arc<AtomicU64>,
}

/// Cloneable handle; clones share the subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    slots: Arc<RwLock<Vec<SubscriberSlot>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber and receive its event stream. The returned
    /// counter reports how many events were dropped for this subscriber.
    pub async fn subscribe(&self, name: impl Into<String>) -> (mpsc::Receiver<DomainEvent>, Arc<AtomicU64>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let dropped = Arc::new(AtomicU64::new(0));
        self.slots.write().await.push(SubscriberSlot {
            name: name.into(),
            tx,
            dropped: Arc::clone(&dropped),
        });
        (rx, dropped)
    }

    /// Publish to every live subscriber. Never blocks on a full buffer.
    pub async fn publish(&self, event: DomainEvent) {
        let mut closed = Vec::new();
        {
            let slots = self.slots.read().await;
            for (idx, slot) in slots.iter().enumerate() {
                match slot.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let total = slot.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(
                            "EventBus: subscriber '{}' buffer full, dropped event {} (total dropped: {})",
                            slot.name,
                            event.kind(),
                            total
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(idx);
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut slots = self.slots.write().await;
            // Indices shift as we remove; walk back to front.
            for idx in closed.into_iter().rev() {
                if idx < slots.len() && slots[idx].tx.is_closed() {
                    let gone = slots.remove(idx);
                    warn!("EventBus: subscriber '{}' disconnected", gone.name);
                }
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.slots.read().await.len()
    }
}

/// Durable destination for the journal subscriber.
#[async_trait]
pub trait EventJournal: Send + Sync {
    async fn record(&self, event: &DomainEvent) -> Result<()>;
}

pub struct SqliteEventJournal {
    pool: SqlitePool,
}

impl SqliteEventJournal {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventJournal for SqliteEventJournal {
    async fn record(&self, event: &DomainEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        sqlx::query("INSERT INTO events (kind, payload, timestamp) VALUES (?, ?, ?)")
            .bind(event.kind())
            .bind(payload)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await
            .context("Failed to journal event")?;
        Ok(())
    }
}

/// Drains a subscription into the journal.
///
/// Best-effort for most events; returns an error — which the caller treats as
/// fatal (exit code 2) — when a safety-critical event cannot be persisted.
pub async fn run_journal_subscriber(
    mut rx: mpsc::Receiver<DomainEvent>,
    journal: Arc<dyn EventJournal>,
) -> Result<()> {
    while let Some(event) = rx.recv().await {
        if let Err(e) = journal.record(&event).await {
            if event.is_safety_critical() {
                error!(
                    "EventBus: FATAL - failed to persist safety event {}: {}",
                    event.kind(),
                    e
                );
                return Err(e.context(format!("lost safety-relevant event {}", event.kind())));
            }
            warn!("EventBus: failed to persist event {}: {}", event.kind(), e);
        }
    }
    Ok(())
}
