//! Three-tier circuit breaker: strategy, account and system level, each with
//! independent persisted state.
//!
//! Transitions follow NORMAL -> WARNING (50 % of threshold) -> TRIGGERED ->
//! RECOVERING (after `auto_recover_minutes` with the metric clear) -> NORMAL
//! (one clean interval later). `manual_recover` latches TRIGGERED until an
//! explicit reset. Every transition is persisted before the triggering call
//! returns, so a TRIGGERED state is never observable in memory but absent on
//! disk.

use crate::config::RiskConfig;
use crate::domain::events::DomainEvent;
use crate::domain::types::Position;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::persistence::breaker_store::BreakerStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerLevel {
    Strategy,
    Account,
    System,
}

impl std::fmt::Display for BreakerLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerLevel::Strategy => write!(f, "STRATEGY"),
            BreakerLevel::Account => write!(f, "ACCOUNT"),
            BreakerLevel::System => write!(f, "SYSTEM"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BreakerStatus {
    #[default]
    Normal,
    Warning,
    Triggered,
    Recovering,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BreakerState {
    pub status: BreakerStatus,
    pub triggered_at: Option<DateTime<Utc>>,
    pub recovering_since: Option<DateTime<Utc>>,
    pub reason: String,
    pub trigger_value: f64,
    pub threshold: f64,
    /// Strategy id for STRATEGY level, empty otherwise.
    pub owner: String,
    /// Whether the latest observation had the metric below the warning band.
    pub metric_clear: bool,
}

/// The JSON document written to the state file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BreakerSnapshot {
    pub strategy: HashMap<String, BreakerState>,
    pub account: BreakerState,
    pub system: BreakerState,
}

/// Breaker statuses as seen by the risk gateway's pure check function.
#[derive(Debug, Clone, Copy, Default)]
pub struct BreakerView {
    pub account: BreakerStatus,
    pub system: BreakerStatus,
    pub strategy: BreakerStatus,
}

enum Observation {
    Clear,
    Warning,
    Breach,
}

fn observe_metric(value: f64, threshold: f64) -> Observation {
    if threshold <= 0.0 {
        return Observation::Clear;
    }
    if value >= threshold {
        Observation::Breach
    } else if value >= threshold * 0.5 {
        Observation::Warning
    } else {
        Observation::Clear
    }
}

pub struct CircuitBreaker {
    config: RiskConfig,
    store: Option<BreakerStore>,
    bus: EventBus,
    state: RwLock<BreakerSnapshot>,
    consecutive_api_failures: AtomicU32,
}

impl CircuitBreaker {
    /// Restores persisted state before returning; the gateway must not accept
    /// orders until this completes.
    pub fn new(config: RiskConfig, store: Option<BreakerStore>, bus: EventBus) -> Result<Self> {
        let snapshot = match &store {
            Some(s) => s.load::<BreakerSnapshot>()?.unwrap_or_default(),
            None => BreakerSnapshot::default(),
        };
        if snapshot.account.status == BreakerStatus::Triggered
            || snapshot.system.status == BreakerStatus::Triggered
        {
            warn!(
                "CircuitBreaker: restored in TRIGGERED state (account: {:?}, system: {:?})",
                snapshot.account.status, snapshot.system.status
            );
        }
        Ok(Self {
            config,
            store,
            bus,
            state: RwLock::new(snapshot),
            consecutive_api_failures: AtomicU32::new(0),
        })
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        self.state.read().await.clone()
    }

    pub async fn view(&self, strategy_id: &str) -> BreakerView {
        let state = self.state.read().await;
        BreakerView {
            account: state.account.status,
            system: state.system.status,
            strategy: state
                .strategy
                .get(strategy_id)
                .map(|s| s.status)
                .unwrap_or_default(),
        }
    }

    fn persist(&self, snapshot: &BreakerSnapshot) -> Result<()> {
        if let Some(store) = &self.store {
            store
                .save(snapshot)
                .context("circuit breaker state persistence failed")?;
        }
        Ok(())
    }

    async fn publish_triggered(&self, level: BreakerLevel, owner: &str, reason: &str) {
        self.bus
            .publish(DomainEvent::BreakerTriggered {
                level: level.to_string(),
                owner: owner.to_string(),
                reason: reason.to_string(),
            })
            .await;
    }

    async fn publish_recovered(&self, level: BreakerLevel, owner: &str) {
        self.bus
            .publish(DomainEvent::BreakerRecovered {
                level: level.to_string(),
                owner: owner.to_string(),
            })
            .await;
    }

    /// Advance one tier's state machine for an observed metric. Returns true
    /// when the state transitioned to TRIGGERED.
    fn advance(state: &mut BreakerState, observation: Observation, value: f64, threshold: f64, reason: &str) -> bool {
        state.metric_clear = matches!(observation, Observation::Clear);
        match (state.status, observation) {
            (BreakerStatus::Normal, Observation::Warning) => {
                state.status = BreakerStatus::Warning;
                warn!("CircuitBreaker: WARNING - {} at {:.4} (threshold {:.4})", reason, value, threshold);
                false
            }
            (BreakerStatus::Warning, Observation::Clear) => {
                state.status = BreakerStatus::Normal;
                false
            }
            (BreakerStatus::Normal | BreakerStatus::Warning | BreakerStatus::Recovering, Observation::Breach) => {
                state.status = BreakerStatus::Triggered;
                state.triggered_at = Some(Utc::now());
                state.recovering_since = None;
                state.reason = reason.to_string();
                state.trigger_value = value;
                state.threshold = threshold;
                error!("CircuitBreaker: TRIGGERED - {} at {:.4} (threshold {:.4})", reason, value, threshold);
                true
            }
            _ => false,
        }
    }

    /// Account tier: daily loss and drawdown from high-water-mark.
    pub async fn observe_account(&self, daily_loss_pct: f64, drawdown: f64) -> Result<()> {
        let mut state = self.state.write().await;
        let mut transitioned = false;

        let loss_obs = observe_metric(daily_loss_pct, self.config.account_max_daily_loss);
        let dd_obs = observe_metric(drawdown, self.config.account_max_drawdown);

        // The worse observation wins; drawdown reported if it is the breach.
        let (obs, value, threshold, reason) = if matches!(dd_obs, Observation::Breach)
            || (matches!(dd_obs, Observation::Warning) && matches!(loss_obs, Observation::Clear))
        {
            (dd_obs, drawdown, self.config.account_max_drawdown, "account drawdown limit")
        } else {
            (loss_obs, daily_loss_pct, self.config.account_max_daily_loss, "account daily loss limit")
        };

        if Self::advance(&mut state.account, obs, value, threshold, reason) {
            transitioned = true;
        }

        if transitioned {
            self.persist(&state)?;
            let reason = state.account.reason.clone();
            drop(state);
            self.publish_triggered(BreakerLevel::Account, "", &reason).await;
        }
        Ok(())
    }

    /// Strategy tier: daily loss as a fraction of the strategy's allocated
    /// notional, and the consecutive-loss streak. The streak trips the
    /// breaker on the 5th loss exactly (`>= limit`).
    pub async fn observe_strategy(
        &self,
        strategy_id: &str,
        daily_loss_pct: f64,
        consecutive_losses: u32,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state.strategy.entry(strategy_id.to_string()).or_insert_with(|| BreakerState {
            owner: strategy_id.to_string(),
            metric_clear: true,
            ..Default::default()
        });

        let streak_breach = consecutive_losses >= self.config.strategy_max_consecutive_losses;
        let (obs, value, threshold, reason) = if streak_breach {
            (
                Observation::Breach,
                consecutive_losses as f64,
                self.config.strategy_max_consecutive_losses as f64,
                "strategy consecutive-loss limit",
            )
        } else {
            (
                observe_metric(daily_loss_pct, self.config.strategy_max_daily_loss),
                daily_loss_pct,
                self.config.strategy_max_daily_loss,
                "strategy daily loss limit",
            )
        };

        let transitioned = Self::advance(entry, obs, value, threshold, reason);
        if transitioned {
            let reason = entry.reason.clone();
            self.persist(&state)?;
            drop(state);
            self.publish_triggered(BreakerLevel::Strategy, strategy_id, &reason).await;
        }
        Ok(())
    }

    /// System tier from market observations. Returns the positions to close:
    /// all of them for a volatility or panic-sell trigger, none otherwise.
    pub async fn observe_system(
        &self,
        market_volatility: f64,
        panic_sell_ratio: f64,
        positions: &[Position],
    ) -> Result<Vec<Position>> {
        let mut state = self.state.write().await;

        let vol_obs = observe_metric(market_volatility, self.config.system_volatility_threshold);
        let panic_obs = observe_metric(panic_sell_ratio, self.config.system_panic_sell_threshold);

        let (obs, value, threshold, reason) = if matches!(panic_obs, Observation::Breach) {
            (panic_obs, panic_sell_ratio, self.config.system_panic_sell_threshold, "panic-sell ratio limit")
        } else {
            (vol_obs, market_volatility, self.config.system_volatility_threshold, "market volatility limit")
        };

        let transitioned = Self::advance(&mut state.system, obs, value, threshold, reason);
        if transitioned {
            self.persist(&state)?;
            let reason = state.system.reason.clone();
            drop(state);
            self.publish_triggered(BreakerLevel::System, "", &reason).await;
            return Ok(positions.to_vec());
        }
        Ok(Vec::new())
    }

    /// N consecutive exchange-API failures trigger the system tier with an
    /// empty close list (positions are kept; only trading stops).
    pub async fn record_api_failure(&self) -> Result<()> {
        let failures = self.consecutive_api_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.system_api_failure_threshold {
            let mut state = self.state.write().await;
            if state.system.status != BreakerStatus::Triggered {
                let reason = format!("exchange API failed {} times consecutively", failures);
                Self::advance(
                    &mut state.system,
                    Observation::Breach,
                    failures as f64,
                    self.config.system_api_failure_threshold as f64,
                    &reason,
                );
                self.persist(&state)?;
                drop(state);
                self.publish_triggered(BreakerLevel::System, "", &reason).await;
            }
        }
        Ok(())
    }

    pub fn record_api_success(&self) {
        self.consecutive_api_failures.store(0, Ordering::SeqCst);
    }

    /// Operator-initiated strategy block (admin surface disable).
    pub async fn trip_strategy(&self, strategy_id: &str, reason: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state.strategy.entry(strategy_id.to_string()).or_insert_with(|| BreakerState {
            owner: strategy_id.to_string(),
            ..Default::default()
        });
        if entry.status == BreakerStatus::Triggered {
            return Ok(());
        }
        Self::advance(entry, Observation::Breach, 0.0, 0.0, reason);
        self.persist(&state)?;
        drop(state);
        self.publish_triggered(BreakerLevel::Strategy, strategy_id, reason).await;
        Ok(())
    }

    /// Gateway rule 13 entry point: trip the account tier directly.
    pub async fn trigger_account(&self, reason: &str, value: f64, threshold: f64) -> Result<()> {
        let mut state = self.state.write().await;
        if state.account.status == BreakerStatus::Triggered {
            return Ok(());
        }
        Self::advance(&mut state.account, Observation::Breach, value, threshold, reason);
        self.persist(&state)?;
        drop(state);
        self.publish_triggered(BreakerLevel::Account, "", reason).await;
        Ok(())
    }

    /// Time-based recovery pass, called on the monitor cadence.
    /// `clean_interval` is one monitoring interval: the dwell time in
    /// RECOVERING before the breaker re-arms.
    pub async fn check_recovery(&self, clean_interval: std::time::Duration) -> Result<()> {
        if self.config.manual_recover {
            return Ok(());
        }
        let now = Utc::now();
        let auto_recover = ChronoDuration::minutes(self.config.auto_recover_minutes as i64);
        let clean = ChronoDuration::from_std(clean_interval).unwrap_or(ChronoDuration::minutes(1));

        let mut state = self.state.write().await;
        let mut recovered: Vec<(BreakerLevel, String)> = Vec::new();
        let mut changed = false;

        {
            let snapshot = &mut *state;
            let mut tiers: Vec<(BreakerLevel, &mut BreakerState)> = vec![
                (BreakerLevel::Account, &mut snapshot.account),
                (BreakerLevel::System, &mut snapshot.system),
            ];
            for (_, entry) in snapshot.strategy.iter_mut() {
                tiers.push((BreakerLevel::Strategy, entry));
            }

            for (level, tier) in tiers {
                match tier.status {
                    BreakerStatus::Triggered => {
                        let elapsed = tier.triggered_at.map(|t| now - t >= auto_recover).unwrap_or(false);
                        if elapsed && tier.metric_clear {
                            tier.status = BreakerStatus::Recovering;
                            tier.recovering_since = Some(now);
                            changed = true;
                            info!("CircuitBreaker: {} entering RECOVERING", level);
                        }
                    }
                    BreakerStatus::Recovering => {
                        let dwelled = tier
                            .recovering_since
                            .map(|t| now - t >= clean)
                            .unwrap_or(false);
                        if dwelled && tier.metric_clear {
                            tier.status = BreakerStatus::Normal;
                            tier.triggered_at = None;
                            tier.recovering_since = None;
                            tier.reason.clear();
                            changed = true;
                            recovered.push((level, tier.owner.clone()));
                            info!("CircuitBreaker: {} recovered to NORMAL", level);
                        }
                    }
                    _ => {}
                }
            }
        }

        if changed {
            self.persist(&state)?;
        }
        drop(state);
        for (level, owner) in recovered {
            self.publish_recovered(level, &owner).await;
        }
        Ok(())
    }

    /// Manual reset of one tier (operator action).
    pub async fn reset(&self, level: BreakerLevel, owner: &str) -> Result<()> {
        let mut state = self.state.write().await;
        match level {
            BreakerLevel::Account => state.account = BreakerState::default(),
            BreakerLevel::System => state.system = BreakerState::default(),
            BreakerLevel::Strategy => {
                state.strategy.remove(owner);
            }
        }
        self.persist(&state)?;
        drop(state);
        self.publish_recovered(level, owner).await;
        Ok(())
    }

    /// Atomically trip ACCOUNT and SYSTEM, persist, and return the positions
    /// to flatten.
    pub async fn emergency_shutdown(&self, reason: &str, positions: &[Position]) -> Result<Vec<Position>> {
        error!("CircuitBreaker: EMERGENCY SHUTDOWN - {}", reason);
        let mut state = self.state.write().await;
        let now = Some(Utc::now());
        let account_tier = &mut state.account;
        account_tier.status = BreakerStatus::Triggered;
        account_tier.triggered_at = now;
        account_tier.recovering_since = None;
        account_tier.reason = reason.to_string();
        account_tier.metric_clear = false;
        let system_tier = &mut state.system;
        system_tier.status = BreakerStatus::Triggered;
        system_tier.triggered_at = now;
        system_tier.recovering_since = None;
        system_tier.reason = reason.to_string();
        system_tier.metric_clear = false;
        self.persist(&state)?;
        drop(state);
        self.publish_triggered(BreakerLevel::Account, "", reason).await;
        self.publish_triggered(BreakerLevel::System, "", reason).await;
        Ok(positions.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(RiskConfig::default(), None, EventBus::new()).unwrap()
    }

    #[tokio::test]
    async fn test_account_warning_then_trigger() {
        let cb = breaker();

        // 6% daily loss: above half of the 10% limit -> WARNING.
        cb.observe_account(0.06, 0.0).await.unwrap();
        assert_eq!(cb.snapshot().await.account.status, BreakerStatus::Warning);

        // Full crossing -> TRIGGERED.
        cb.observe_account(0.10, 0.0).await.unwrap();
        assert_eq!(cb.snapshot().await.account.status, BreakerStatus::Triggered);

        // Metric dropping does not untrigger without the recovery path.
        cb.observe_account(0.01, 0.0).await.unwrap();
        assert_eq!(cb.snapshot().await.account.status, BreakerStatus::Triggered);
    }

    #[tokio::test]
    async fn test_warning_clears_when_metric_clears() {
        let cb = breaker();
        cb.observe_account(0.06, 0.0).await.unwrap();
        assert_eq!(cb.snapshot().await.account.status, BreakerStatus::Warning);
        cb.observe_account(0.01, 0.0).await.unwrap();
        assert_eq!(cb.snapshot().await.account.status, BreakerStatus::Normal);
    }

    #[tokio::test]
    async fn test_strategy_streak_triggers_on_fifth_loss() {
        let cb = breaker();

        cb.observe_strategy("momentum", 0.0, 4).await.unwrap();
        let snap = cb.snapshot().await;
        assert_ne!(
            snap.strategy.get("momentum").unwrap().status,
            BreakerStatus::Triggered,
            "4 losses must not trigger"
        );

        cb.observe_strategy("momentum", 0.0, 5).await.unwrap();
        let snap = cb.snapshot().await;
        assert_eq!(snap.strategy.get("momentum").unwrap().status, BreakerStatus::Triggered);

        // Other strategies are unaffected.
        assert_eq!(cb.view("grid").await.strategy, BreakerStatus::Normal);
    }

    #[tokio::test]
    async fn test_system_volatility_returns_close_list() {
        let cb = breaker();
        let positions = vec![Position {
            symbol: "BTC/USDT".to_string(),
            side: crate::domain::types::PositionSide::Long,
            size: rust_decimal_macros::dec!(1),
            entry_price: rust_decimal_macros::dec!(50000),
            mark_price: rust_decimal_macros::dec!(49000),
            unrealized_pnl: rust_decimal_macros::dec!(-1000),
            unrealized_pnl_pct: -0.02,
            leverage: 1.0,
            liquidation_price: None,
            margin: rust_decimal_macros::dec!(50000),
            stop_loss_pct: None,
            take_profit_pct: None,
        }];

        let to_close = cb.observe_system(0.25, 0.0, &positions).await.unwrap();
        assert_eq!(to_close.len(), 1);
        assert_eq!(cb.snapshot().await.system.status, BreakerStatus::Triggered);
    }

    #[tokio::test]
    async fn test_api_failures_trigger_without_closing_positions() {
        let cb = breaker();
        for _ in 0..4 {
            cb.record_api_failure().await.unwrap();
        }
        assert_eq!(cb.snapshot().await.system.status, BreakerStatus::Normal);

        cb.record_api_failure().await.unwrap();
        assert_eq!(cb.snapshot().await.system.status, BreakerStatus::Triggered);
    }

    #[tokio::test]
    async fn test_api_success_resets_streak() {
        let cb = breaker();
        for _ in 0..4 {
            cb.record_api_failure().await.unwrap();
        }
        cb.record_api_success();
        for _ in 0..4 {
            cb.record_api_failure().await.unwrap();
        }
        assert_eq!(cb.snapshot().await.system.status, BreakerStatus::Normal);
    }

    #[tokio::test]
    async fn test_recovery_path() {
        let mut config = RiskConfig::default();
        config.auto_recover_minutes = 0; // immediate eligibility in tests
        let cb = CircuitBreaker::new(config, None, EventBus::new()).unwrap();

        cb.observe_account(0.10, 0.0).await.unwrap();
        assert_eq!(cb.snapshot().await.account.status, BreakerStatus::Triggered);

        // Metric still hot: no recovery.
        cb.check_recovery(Duration::ZERO).await.unwrap();
        assert_eq!(cb.snapshot().await.account.status, BreakerStatus::Triggered);

        // Metric clears; first pass -> RECOVERING, second -> NORMAL.
        cb.observe_account(0.01, 0.0).await.unwrap();
        cb.check_recovery(Duration::ZERO).await.unwrap();
        assert_eq!(cb.snapshot().await.account.status, BreakerStatus::Recovering);
        cb.check_recovery(Duration::ZERO).await.unwrap();
        assert_eq!(cb.snapshot().await.account.status, BreakerStatus::Normal);
    }

    #[tokio::test]
    async fn test_manual_recover_latches() {
        let mut config = RiskConfig::default();
        config.auto_recover_minutes = 0;
        config.manual_recover = true;
        let cb = CircuitBreaker::new(config, None, EventBus::new()).unwrap();

        cb.observe_account(0.10, 0.0).await.unwrap();
        cb.observe_account(0.0, 0.0).await.unwrap();
        cb.check_recovery(Duration::ZERO).await.unwrap();
        assert_eq!(cb.snapshot().await.account.status, BreakerStatus::Triggered);

        cb.reset(BreakerLevel::Account, "").await.unwrap();
        assert_eq!(cb.snapshot().await.account.status, BreakerStatus::Normal);
    }

    #[tokio::test]
    async fn test_emergency_shutdown_trips_both_tiers() {
        let cb = breaker();
        let closed = cb.emergency_shutdown("operator kill switch", &[]).await.unwrap();
        assert!(closed.is_empty());

        let snap = cb.snapshot().await;
        assert_eq!(snap.account.status, BreakerStatus::Triggered);
        assert_eq!(snap.system.status, BreakerStatus::Triggered);
        assert_eq!(snap.account.reason, "operator kill switch");
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("circuit_breaker_state.json");

        {
            let cb = CircuitBreaker::new(
                RiskConfig::default(),
                Some(BreakerStore::new(&path)),
                EventBus::new(),
            )
            .unwrap();
            cb.observe_account(0.12, 0.0).await.unwrap();
        }

        let cb2 = CircuitBreaker::new(
            RiskConfig::default(),
            Some(BreakerStore::new(&path)),
            EventBus::new(),
        )
        .unwrap();
        assert_eq!(cb2.snapshot().await.account.status, BreakerStatus::Triggered);
    }
}
