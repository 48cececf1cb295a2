use crate::domain::types::OrderRequest;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Append-only record of one pass through the risk gateway.
///
/// Written before any adapter call, for admitted and rejected requests alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub trace_id: String,
    pub order_id: Option<String>,
    pub symbol: String,
    pub action: String,
    /// Request as it arrived at the gateway.
    pub original: OrderRequest,
    /// Request after clamping, if any rule modified it.
    pub modified: Option<OrderRequest>,
    pub passed: bool,
    pub blocked_reason: Option<String>,
    /// Names of rules that clamped or rejected the request, in order.
    pub applied_rules: Vec<String>,
    pub balance: Decimal,
    pub total_exposure: Decimal,
    pub timestamp: DateTime<Utc>,
}
