use crate::domain::audit::AuditRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::debug;

/// Append-only sink for audit records.
///
/// Callers treat a write failure as fatal to the request being audited: the
/// gateway fails closed rather than execute without a trail.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> Result<()>;
    async fn find_by_trace(&self, trace_id: &str) -> Result<Vec<AuditRecord>>;
}

pub struct SqliteAuditStore {
    pool: SqlitePool,
}

impl SqliteAuditStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for SqliteAuditStore {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        let original = serde_json::to_string(&record.original)?;
        let modified = record
            .modified
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let applied_rules = serde_json::to_string(&record.applied_rules)?;

        sqlx::query(
            r#"
            INSERT INTO audit_log
                (order_id, trace_id, symbol, action, original, modified, passed,
                 blocked_reason, applied_rules, balance, exposure, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.order_id)
        .bind(&record.trace_id)
        .bind(&record.symbol)
        .bind(&record.action)
        .bind(original)
        .bind(modified)
        .bind(record.passed)
        .bind(&record.blocked_reason)
        .bind(applied_rules)
        .bind(record.balance.to_string())
        .bind(record.total_exposure.to_string())
        .bind(record.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to append audit record")?;

        debug!("Audit record appended for trace {}", record.trace_id);
        Ok(())
    }

    async fn find_by_trace(&self, trace_id: &str) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM audit_log WHERE trace_id = ? ORDER BY id ASC",
        )
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::new();
        for row in rows {
            use std::str::FromStr;
            let original: String = row.try_get("original")?;
            let modified: Option<String> = row.try_get("modified")?;
            let applied_rules: String = row.try_get("applied_rules")?;
            let balance: String = row.try_get("balance")?;
            let exposure: String = row.try_get("exposure")?;
            let ts_ms: i64 = row.try_get("timestamp")?;

            records.push(AuditRecord {
                trace_id: row.try_get("trace_id")?,
                order_id: row.try_get("order_id")?,
                symbol: row.try_get("symbol")?,
                action: row.try_get("action")?,
                original: serde_json::from_str(&original)?,
                modified: modified.as_deref().map(serde_json::from_str).transpose()?,
                passed: row.try_get("passed")?,
                blocked_reason: row.try_get("blocked_reason")?,
                applied_rules: serde_json::from_str(&applied_rules)?,
                balance: rust_decimal::Decimal::from_str(&balance).unwrap_or_default(),
                total_exposure: rust_decimal::Decimal::from_str(&exposure).unwrap_or_default(),
                timestamp: chrono::DateTime::from_timestamp_millis(ts_ms)
                    .unwrap_or_else(chrono::Utc::now),
            });
        }
        Ok(records)
    }
}

/// In-memory sink for tests and dry runs.
#[derive(Default)]
pub struct MemoryAuditStore {
    records: tokio::sync::RwLock<Vec<AuditRecord>>,
    /// When set, every append fails; exercises the gateway's fail-closed path.
    pub fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditStore {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("audit store unavailable");
        }
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn find_by_trace(&self, trace_id: &str) -> Result<Vec<AuditRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.trace_id == trace_id)
            .cloned()
            .collect())
    }
}
