use crate::domain::errors::RejectReason;
use crate::domain::types::{Order, Position};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Domain events published on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DomainEvent {
    OrderSubmitted {
        order: Box<Order>,
    },
    OrderFilled {
        order: Box<Order>,
    },
    OrderRejected {
        order: Box<Order>,
        reason: RejectReason,
    },
    PositionUpdated {
        position: Box<Position>,
    },
    RiskBlocked {
        trace_id: String,
        symbol: String,
        reason: RejectReason,
        detail: String,
    },
    BreakerTriggered {
        level: String,
        owner: String,
        reason: String,
    },
    BreakerRecovered {
        level: String,
        owner: String,
    },
    Shutdown {
        at: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::OrderSubmitted { .. } => "ORDER_SUBMITTED",
            DomainEvent::OrderFilled { .. } => "ORDER_FILLED",
            DomainEvent::OrderRejected { .. } => "ORDER_REJECTED",
            DomainEvent::PositionUpdated { .. } => "POSITION_UPDATED",
            DomainEvent::RiskBlocked { .. } => "RISK_BLOCKED",
            DomainEvent::BreakerTriggered { .. } => "BREAKER_TRIGGERED",
            DomainEvent::BreakerRecovered { .. } => "BREAKER_RECOVERED",
            DomainEvent::Shutdown { .. } => "SHUTDOWN",
        }
    }

    /// Events whose loss would blind a safety audit. Failing to persist one
    /// of these is fatal to the process.
    pub fn is_safety_critical(&self) -> bool {
        matches!(
            self,
            DomainEvent::RiskBlocked { .. } | DomainEvent::BreakerTriggered { .. }
        )
    }
}
