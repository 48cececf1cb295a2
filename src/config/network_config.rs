//! Network resilience settings: timeouts, retry backoff, rate limits and the
//! hanging-order sweeper cadence.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub query_timeout_secs: u64,
    pub order_timeout_secs: u64,

    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub jitter: bool,

    pub requests_per_minute: u32,
    pub burst_limit: u32,

    pub hanging_order_threshold_secs: u64,
    pub hanging_order_cleanup_interval_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            query_timeout_secs: 30,
            order_timeout_secs: 60,
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            exponential_base: 2.0,
            jitter: true,
            requests_per_minute: 60,
            burst_limit: 10,
            hanging_order_threshold_secs: 1_800,
            hanging_order_cleanup_interval_secs: 300,
        }
    }
}

impl NetworkConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_secs)
    }

    pub fn hanging_order_threshold(&self) -> Duration {
        Duration::from_secs(self.hanging_order_threshold_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.hanging_order_cleanup_interval_secs)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = env::var("QUERY_TIMEOUT_SECS") {
            self.query_timeout_secs = v.parse()?;
        }
        if let Ok(v) = env::var("ORDER_TIMEOUT_SECS") {
            self.order_timeout_secs = v.parse()?;
        }
        if let Ok(v) = env::var("MAX_RETRIES") {
            self.max_retries = v.parse()?;
        }
        if let Ok(v) = env::var("REQUESTS_PER_MINUTE") {
            self.requests_per_minute = v.parse()?;
        }
        if let Ok(v) = env::var("HANGING_ORDER_THRESHOLD_SECS") {
            self.hanging_order_threshold_secs = v.parse()?;
        }
        if let Ok(v) = env::var("HANGING_ORDER_CLEANUP_INTERVAL_SECS") {
            self.hanging_order_cleanup_interval_secs = v.parse()?;
        }
        Ok(())
    }
}
