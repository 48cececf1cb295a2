//! Order idempotency and duplicate suppression.
//!
//! Two layers of protection: a 24 h idempotency key over the order's core
//! parameters bucketed to the minute, and a 5 s sliding-window hash that
//! catches accidental resubmits straddling a minute boundary.

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};

const KEY_LENGTH: usize = 32;
const VALID_ACTIONS: &[&str] = &["BUY", "SELL", "CLOSE", "FLAT"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyCheck {
    /// First sighting; a fresh client-order-id was allocated.
    New { client_order_id: String },
    /// Seen inside the TTL; carries the client-order-id of the first order.
    Duplicate { client_order_id: String },
}

/// Generates client-order-ids, detects duplicates, and persists keys across
/// restarts. Key insertion is compare-and-set: concurrent submitters of the
/// same key observe exactly one `New`.
pub struct IdempotencyStore {
    pool: Option<SqlitePool>,
    cache: Mutex<HashMap<String, (String, i64)>>,
    recent: Mutex<HashMap<String, i64>>,
    cache_ttl_hours: i64,
    dedup_window_ms: i64,
}

impl IdempotencyStore {
    pub fn new(pool: Option<SqlitePool>) -> Self {
        Self {
            pool,
            cache: Mutex::new(HashMap::new()),
            recent: Mutex::new(HashMap::new()),
            cache_ttl_hours: 24,
            dedup_window_ms: 5_000,
        }
    }

    /// Warm the in-memory cache from the persisted table.
    pub async fn load(&self) -> Result<usize> {
        let Some(pool) = &self.pool else {
            return Ok(0);
        };
        let rows: Vec<(String, String, i64)> =
            sqlx::query_as("SELECT key, client_order_id, first_seen_at FROM idempotency")
                .fetch_all(pool)
                .await
                .context("failed to load idempotency records")?;

        let mut cache = self.cache.lock().expect("idempotency cache poisoned");
        for (key, coid, seen) in rows {
            cache.insert(key, (coid, seen));
        }
        info!("IdempotencyStore: loaded {} records", cache.len());
        Ok(cache.len())
    }

    /// `{ACTION}_{SYMBOL_NODASH}_{UNIX_MS}_{RAND8}`
    pub fn generate_client_order_id(action: &str, symbol: &str) -> String {
        let ts = Utc::now().timestamp_millis();
        let suffix: String = {
            use rand::Rng;
            let mut rng = rand::rng();
            (0..8)
                .map(|_| {
                    let n: u8 = rng.random_range(0..16);
                    char::from_digit(n as u32, 16).unwrap_or('0')
                })
                .collect()
        };
        let clean_symbol: String = symbol
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_uppercase();
        format!("{}_{}_{}_{}", action, clean_symbol, ts, suffix)
    }

    /// Format check: four underscore-separated parts, known action, numeric
    /// timestamp, 8-char suffix.
    pub fn validate_client_order_id(id: &str) -> bool {
        let parts: Vec<&str> = id.split('_').collect();
        if parts.len() != 4 {
            return false;
        }
        if !VALID_ACTIONS.contains(&parts[0]) {
            return false;
        }
        if parts[1].is_empty() || !parts[1].chars().all(|c| c.is_ascii_alphanumeric()) {
            return false;
        }
        if parts[2].is_empty() || !parts[2].chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        parts[3].len() == 8 && parts[3].chars().all(|c| c.is_ascii_hexdigit())
    }

    /// SHA-256 of `action|symbol|price|size|minute_bucket`, truncated to 32
    /// hex chars.
    pub fn idempotency_key(
        action: &str,
        symbol: &str,
        price: Decimal,
        size: Decimal,
        timestamp_ms: i64,
    ) -> String {
        let minute_bucket = timestamp_ms / 60_000;
        let core = format!(
            "{}|{}|{}|{}|{}",
            action,
            symbol,
            price.normalize(),
            size.normalize(),
            minute_bucket
        );
        let digest = Sha256::digest(core.as_bytes());
        hex::encode(digest)[..KEY_LENGTH].to_string()
    }

    /// Short-window dedup over `action|symbol|price|size`, independent of
    /// the minute bucket. Returns true when an identical submission landed
    /// within the window.
    pub fn is_duplicate_in_window(
        &self,
        action: &str,
        symbol: &str,
        price: Decimal,
        size: Decimal,
    ) -> bool {
        let hash = format!("{}|{}|{}|{}", action, symbol, price.normalize(), size.normalize());
        let now_ms = Utc::now().timestamp_millis();

        let mut recent = self.recent.lock().expect("dedup window poisoned");
        recent.retain(|_, t| now_ms - *t < self.dedup_window_ms * 2);

        if let Some(last) = recent.get(&hash) {
            if now_ms - last < self.dedup_window_ms {
                warn!("IdempotencyStore: resubmit within dedup window: {}", hash);
                return true;
            }
        }
        recent.insert(hash, now_ms);
        false
    }

    /// Check the idempotency key and, if new, atomically register it with a
    /// freshly generated client-order-id.
    pub async fn check_and_register(
        &self,
        action: &str,
        symbol: &str,
        price: Decimal,
        size: Decimal,
    ) -> Result<IdempotencyCheck> {
        let now_ms = Utc::now().timestamp_millis();
        let key = Self::idempotency_key(action, symbol, price, size, now_ms);

        self.evict_expired(now_ms);

        // In-memory CAS under one lock; the entry API makes first-wins atomic.
        let client_order_id = {
            let mut cache = self.cache.lock().expect("idempotency cache poisoned");
            match cache.get(&key) {
                Some((existing, _)) => {
                    warn!("IdempotencyStore: duplicate order detected for key {}", key);
                    return Ok(IdempotencyCheck::Duplicate {
                        client_order_id: existing.clone(),
                    });
                }
                None => {
                    let coid = Self::generate_client_order_id(action, symbol);
                    cache.insert(key.clone(), (coid.clone(), now_ms));
                    coid
                }
            }
        };

        if let Some(pool) = &self.pool {
            let inserted = sqlx::query(
                "INSERT INTO idempotency (key, client_order_id, first_seen_at) VALUES (?, ?, ?) \
                 ON CONFLICT(key) DO NOTHING",
            )
            .bind(&key)
            .bind(&client_order_id)
            .bind(now_ms)
            .execute(pool)
            .await
            .context("failed to persist idempotency record")?;

            if inserted.rows_affected() == 0 {
                // Another process won the persisted CAS; honour its id.
                let existing: Option<(String,)> =
                    sqlx::query_as("SELECT client_order_id FROM idempotency WHERE key = ?")
                        .bind(&key)
                        .fetch_optional(pool)
                        .await?;
                if let Some((coid,)) = existing {
                    let mut cache = self.cache.lock().expect("idempotency cache poisoned");
                    cache.insert(key, (coid.clone(), now_ms));
                    return Ok(IdempotencyCheck::Duplicate { client_order_id: coid });
                }
            }
        }

        Ok(IdempotencyCheck::New { client_order_id })
    }

    /// Cancelling an order does NOT free its key; this privileged override is
    /// the only way to allow an identical resubmit inside the TTL.
    pub async fn release(&self, key: &str) -> Result<()> {
        self.cache.lock().expect("idempotency cache poisoned").remove(key);
        if let Some(pool) = &self.pool {
            sqlx::query("DELETE FROM idempotency WHERE key = ?")
                .bind(key)
                .execute(pool)
                .await?;
        }
        info!("IdempotencyStore: operator released key {}", key);
        Ok(())
    }

    fn evict_expired(&self, now_ms: i64) {
        let ttl_ms = self.cache_ttl_hours * 3_600_000;
        let mut cache = self.cache.lock().expect("idempotency cache poisoned");
        cache.retain(|_, (_, seen)| now_ms - *seen <= ttl_ms);
    }

    /// TTL sweep over the persisted table.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let Some(pool) = &self.pool else {
            return Ok(0);
        };
        let cutoff = Utc::now().timestamp_millis() - self.cache_ttl_hours * 3_600_000;
        let result = sqlx::query("DELETE FROM idempotency WHERE first_seen_at < ?")
            .bind(cutoff)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_client_order_id_format() {
        let id = IdempotencyStore::generate_client_order_id("BUY", "BTC/USDT");
        assert!(id.starts_with("BUY_BTCUSDT_"));
        assert!(IdempotencyStore::validate_client_order_id(&id));
    }

    #[test]
    fn test_client_order_id_validation() {
        assert!(IdempotencyStore::validate_client_order_id(
            "BUY_BTCUSDT_1708300000000_a1b2c3d4"
        ));
        assert!(IdempotencyStore::validate_client_order_id(
            "FLAT_ETHUSDT_1708300000000_00ff00ff"
        ));

        // wrong action
        assert!(!IdempotencyStore::validate_client_order_id(
            "HOLD_BTCUSDT_1708300000000_a1b2c3d4"
        ));
        // non-numeric timestamp
        assert!(!IdempotencyStore::validate_client_order_id(
            "BUY_BTCUSDT_17083x0000000_a1b2c3d4"
        ));
        // wrong part count
        assert!(!IdempotencyStore::validate_client_order_id("BUY_BTCUSDT_1708300000000"));
        // short suffix
        assert!(!IdempotencyStore::validate_client_order_id(
            "BUY_BTCUSDT_1708300000000_a1b2"
        ));
    }

    #[test]
    fn test_idempotency_key_minute_bucket() {
        let base_ms = 1_708_300_020_000;
        let k1 = IdempotencyStore::idempotency_key("BUY", "BTC/USDT", dec!(50000), dec!(0.1), base_ms);
        // Same minute bucket: identical key.
        let k2 = IdempotencyStore::idempotency_key(
            "BUY",
            "BTC/USDT",
            dec!(50000),
            dec!(0.1),
            base_ms + 30_000,
        );
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 32);

        // Next minute: different key.
        let k3 = IdempotencyStore::idempotency_key(
            "BUY",
            "BTC/USDT",
            dec!(50000),
            dec!(0.1),
            base_ms + 60_000,
        );
        assert_ne!(k1, k3);

        // Different size: different key.
        let k4 = IdempotencyStore::idempotency_key("BUY", "BTC/USDT", dec!(50000), dec!(0.2), base_ms);
        assert_ne!(k1, k4);
    }

    #[test]
    fn test_key_normalizes_decimal_representation() {
        let base_ms = 1_708_300_020_000;
        let a = IdempotencyStore::idempotency_key("BUY", "BTC/USDT", dec!(50000.0), dec!(0.10), base_ms);
        let b = IdempotencyStore::idempotency_key("BUY", "BTC/USDT", dec!(50000), dec!(0.1), base_ms);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_check_and_register_detects_duplicate() {
        let store = IdempotencyStore::new(None);

        let first = store
            .check_and_register("BUY", "ETH/USDT", dec!(2000), dec!(1))
            .await
            .unwrap();
        let IdempotencyCheck::New { client_order_id } = first else {
            panic!("first submission must be New");
        };

        let second = store
            .check_and_register("BUY", "ETH/USDT", dec!(2000), dec!(1))
            .await
            .unwrap();
        match second {
            IdempotencyCheck::Duplicate { client_order_id: existing } => {
                assert_eq!(existing, client_order_id);
            }
            _ => panic!("second submission must be Duplicate"),
        }
    }

    #[tokio::test]
    async fn test_release_frees_key() {
        let store = IdempotencyStore::new(None);
        store
            .check_and_register("BUY", "ETH/USDT", dec!(2000), dec!(1))
            .await
            .unwrap();

        let now_ms = Utc::now().timestamp_millis();
        let key = IdempotencyStore::idempotency_key("BUY", "ETH/USDT", dec!(2000), dec!(1), now_ms);
        store.release(&key).await.unwrap();

        let again = store
            .check_and_register("BUY", "ETH/USDT", dec!(2000), dec!(1))
            .await
            .unwrap();
        assert!(matches!(again, IdempotencyCheck::New { .. }));
    }

    #[test]
    fn test_dedup_window() {
        let store = IdempotencyStore::new(None);
        assert!(!store.is_duplicate_in_window("BUY", "BTC/USDT", dec!(50000), dec!(0.1)));
        assert!(store.is_duplicate_in_window("BUY", "BTC/USDT", dec!(50000), dec!(0.1)));
        // Different parameters pass.
        assert!(!store.is_duplicate_in_window("SELL", "BTC/USDT", dec!(50000), dec!(0.1)));
    }
}
