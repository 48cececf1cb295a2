use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Process-wide database handle.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent() {
                if !parent.exists() {
                    fs::create_dir_all(parent)
                        .await
                        .context("Failed to create database directory")?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal); // Better for concurrency

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        // 1. Audit log: append-only record of every gateway pass.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT,
                trace_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                action TEXT NOT NULL,
                original TEXT NOT NULL,
                modified TEXT,
                passed BOOLEAN NOT NULL,
                blocked_reason TEXT,
                applied_rules TEXT NOT NULL,
                balance TEXT NOT NULL,
                exposure TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create audit_log table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_audit_trace
            ON audit_log (trace_id);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create audit index")?;

        // 2. Idempotency keys; the unique constraint backs the CAS insert.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS idempotency (
                key TEXT PRIMARY KEY,
                client_order_id TEXT NOT NULL,
                first_seen_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create idempotency table")?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_idempotency_coid
            ON idempotency (client_order_id);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create idempotency index")?;

        // 3. Event journal; fed by the audit subscriber of the event bus.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create events table")?;

        info!("Database schema initialized.");
        Ok(())
    }
}
