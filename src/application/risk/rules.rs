//! The hard-limit rule set of the risk gateway.
//!
//! Thirteen rules applied in a fixed order; the first failing rule decides.
//! Rules 1-3 and 11-13 reject unconditionally. Rules 4-10 clamp the request
//! down to the limit in `Clamp` mode and reject in `Strict` mode; every
//! clamp is recorded in `applied_rules` so the audit trail shows the
//! original next to the modified request.

use crate::application::risk::breaker::{BreakerStatus, BreakerView};
use crate::config::{RiskConfig, RiskMode};
use crate::domain::errors::RejectReason;
use crate::domain::types::{AccountState, OrderRequest};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

/// Inputs to one validation pass. Everything is borrowed; evaluation is a
/// pure function usable from tests and dry runs.
pub struct RuleContext<'a> {
    pub request: &'a OrderRequest,
    pub account: &'a AccountState,
    pub config: &'a RiskConfig,
    pub breaker: BreakerView,
    /// Mark price used when the request has no limit price.
    pub reference_price: Decimal,
    /// Orders admitted so far today.
    pub daily_trade_count: u32,
}

/// Outcome of the full rule pass.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub passed: bool,
    pub reject_reason: Option<RejectReason>,
    pub detail: Option<String>,
    /// Rules that clamped or rejected, in evaluation order.
    pub applied_rules: Vec<String>,
    /// The request after clamping; present only if something changed.
    pub modified: Option<OrderRequest>,
    /// Set by rule 13: the account breaker must be tripped with
    /// (reason, observed value, threshold).
    pub breaker_trip: Option<(String, f64, f64)>,
}

impl ValidationReport {
    fn pass(applied_rules: Vec<String>, modified: Option<OrderRequest>) -> Self {
        Self {
            passed: true,
            reject_reason: None,
            detail: None,
            applied_rules,
            modified,
            breaker_trip: None,
        }
    }

    fn reject(
        reason: RejectReason,
        detail: String,
        mut applied_rules: Vec<String>,
        rule: &str,
    ) -> Self {
        applied_rules.push(rule.to_string());
        Self {
            passed: false,
            reject_reason: Some(reason),
            detail: Some(detail),
            applied_rules,
            modified: None,
            breaker_trip: None,
        }
    }
}

fn blocked(status: BreakerStatus) -> bool {
    matches!(status, BreakerStatus::Triggered | BreakerStatus::Recovering)
}

/// Run the full rule set against one request.
pub fn evaluate(ctx: &RuleContext<'_>) -> ValidationReport {
    let config = ctx.config;
    let account = ctx.account;
    let mut applied: Vec<String> = Vec::new();
    let mut working = ctx.request.clone();
    let mut clamped = false;
    let reducing = working.reduce_only;

    // 1. Circuit breakers. System blocks everything; account and strategy
    //    tiers still allow reducing orders so positions can be unwound.
    if blocked(ctx.breaker.system) {
        return ValidationReport::reject(
            RejectReason::RiskCheckFailed,
            "system circuit breaker active".to_string(),
            applied,
            "circuit_breaker",
        );
    }
    if !reducing && blocked(ctx.breaker.account) {
        return ValidationReport::reject(
            RejectReason::RiskCheckFailed,
            "account circuit breaker active".to_string(),
            applied,
            "circuit_breaker",
        );
    }
    if !reducing && blocked(ctx.breaker.strategy) {
        return ValidationReport::reject(
            RejectReason::RiskCheckFailed,
            format!("strategy '{}' circuit breaker active", working.strategy_id),
            applied,
            "circuit_breaker",
        );
    }

    // 2. Usable balance.
    if account.available_balance <= Decimal::ZERO {
        return ValidationReport::reject(
            RejectReason::InsufficientMargin,
            format!("available balance {} is not positive", account.available_balance),
            applied,
            "balance",
        );
    }

    // 3. Symbol deny list.
    if config.is_denied(&working.symbol) {
        return ValidationReport::reject(
            RejectReason::RiskCheckFailed,
            format!("symbol {} is on the deny list", working.symbol),
            applied,
            "deny_list",
        );
    }

    // 4. Leverage ceiling: clamp or reject. Exactly at the ceiling passes.
    if working.leverage > config.max_leverage {
        match config.mode {
            RiskMode::Strict => {
                return ValidationReport::reject(
                    RejectReason::LeverageExceeded,
                    format!("leverage {}x exceeds limit {}x", working.leverage, config.max_leverage),
                    applied,
                    "leverage_limit",
                );
            }
            RiskMode::Clamp => {
                tracing::warn!(
                    "RiskGateway: clamping leverage {}x -> {}x for {}",
                    working.leverage,
                    config.max_leverage,
                    working.symbol
                );
                working.leverage = config.max_leverage;
                applied.push("leverage_limit".to_string());
                clamped = true;
            }
        }
    }

    let equity = account.total_equity;
    let price = working.price.unwrap_or(ctx.reference_price);
    let notional = working.quantity * price;
    let dust = Decimal::from_f64(config.dust_notional).unwrap_or(Decimal::TEN);

    // Exposure rules 5-8 bound new exposure; reducing orders are exempt.
    if !reducing && equity > Decimal::ZERO && price > Decimal::ZERO {
        // 5. Per-order notional cap: reduce size to the limit.
        let max_notional = equity * Decimal::from_f64(config.max_position_pct).unwrap_or_default();
        let mut effective_notional = notional;
        if notional > max_notional {
            match config.mode {
                RiskMode::Strict => {
                    return ValidationReport::reject(
                        RejectReason::PositionLimitExceeded,
                        format!("order notional {} exceeds position limit {}", notional, max_notional),
                        applied,
                        "position_limit",
                    );
                }
                RiskMode::Clamp => {
                    working.quantity = max_notional / price;
                    effective_notional = max_notional;
                    applied.push("position_limit".to_string());
                    clamped = true;
                }
            }
        }

        // 6. Per-symbol exposure cap: reduce further, reject below dust.
        let symbol_cap =
            equity * Decimal::from_f64(config.max_single_symbol_exposure).unwrap_or_default();
        let symbol_exposure = account.symbol_exposure(&working.symbol);
        if symbol_exposure + effective_notional > symbol_cap {
            let headroom = symbol_cap - symbol_exposure;
            if headroom < dust {
                return ValidationReport::reject(
                    RejectReason::PositionLimitExceeded,
                    format!(
                        "symbol exposure {} leaves no headroom under cap {}",
                        symbol_exposure, symbol_cap
                    ),
                    applied,
                    "symbol_exposure",
                );
            }
            match config.mode {
                RiskMode::Strict => {
                    return ValidationReport::reject(
                        RejectReason::PositionLimitExceeded,
                        format!(
                            "symbol exposure {} + {} exceeds cap {}",
                            symbol_exposure, effective_notional, symbol_cap
                        ),
                        applied,
                        "symbol_exposure",
                    );
                }
                RiskMode::Clamp => {
                    working.quantity = headroom / price;
                    effective_notional = headroom;
                    applied.push("symbol_exposure".to_string());
                    clamped = true;
                }
            }
        }

        // 7. Total exposure cap: hard reject.
        let total_cap = equity * Decimal::from_f64(config.max_total_exposure).unwrap_or_default();
        if account.total_exposure() + effective_notional > total_cap {
            return ValidationReport::reject(
                RejectReason::PositionLimitExceeded,
                format!(
                    "total exposure {} + {} exceeds cap {}",
                    account.total_exposure(),
                    effective_notional,
                    total_cap
                ),
                applied,
                "total_exposure",
            );
        }

        // 8. Open-position count, counted against symbols not already held.
        let already_held = account
            .exposure
            .get(&working.symbol)
            .map(|e| *e > Decimal::ZERO)
            .unwrap_or(false);
        if !already_held && account.exposure.values().filter(|e| **e > Decimal::ZERO).count()
            >= config.max_open_positions
        {
            return ValidationReport::reject(
                RejectReason::PositionLimitExceeded,
                format!("open position count at limit {}", config.max_open_positions),
                applied,
                "position_count",
            );
        }
    }

    // 9. Stop-loss bounds: below minimum rejects, above maximum clamps.
    if let Some(sl) = working.stop_loss_pct {
        if sl < config.stop_loss_min_pct {
            return ValidationReport::reject(
                RejectReason::RiskCheckFailed,
                format!(
                    "stop loss {:.2}% below minimum {:.2}%",
                    sl * 100.0,
                    config.stop_loss_min_pct * 100.0
                ),
                applied,
                "stop_loss_bounds",
            );
        }
        if sl > config.stop_loss_max_pct {
            working.stop_loss_pct = Some(config.stop_loss_max_pct);
            applied.push("stop_loss_bounds".to_string());
            clamped = true;
        }
    }

    // 10. Take-profit ceiling: clamp.
    if let Some(tp) = working.take_profit_pct {
        if tp > config.take_profit_max_pct {
            working.take_profit_pct = Some(config.take_profit_max_pct);
            applied.push("take_profit_bounds".to_string());
            clamped = true;
        }
    }

    // 11. Daily loss limit. Exactly at the limit still passes.
    if account.daily_loss_pct > config.max_daily_loss_pct {
        return ValidationReport::reject(
            RejectReason::RiskCheckFailed,
            format!(
                "daily loss {:.2}% exceeds limit {:.2}%",
                account.daily_loss_pct * 100.0,
                config.max_daily_loss_pct * 100.0
            ),
            applied,
            "daily_loss",
        );
    }

    // 12. Daily trade budget.
    if ctx.daily_trade_count >= config.max_daily_trades {
        return ValidationReport::reject(
            RejectReason::RiskCheckFailed,
            format!("daily trade count {} at limit", ctx.daily_trade_count),
            applied,
            "daily_trades",
        );
    }

    // 13. Drawdown trip-wire: reject and demand an account breaker trip.
    if account.drawdown >= config.breaker_drawdown_trigger {
        let mut report = ValidationReport::reject(
            RejectReason::RiskCheckFailed,
            format!(
                "drawdown {:.2}% breaches breaker trigger {:.2}%",
                account.drawdown * 100.0,
                config.breaker_drawdown_trigger * 100.0
            ),
            applied,
            "drawdown_breaker",
        );
        report.breaker_trip = Some((
            "drawdown breaker trigger".to_string(),
            account.drawdown,
            config.breaker_drawdown_trigger,
        ));
        return report;
    }

    ValidationReport::pass(applied, clamped.then_some(working))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{OrderSide, OrderType};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn request() -> OrderRequest {
        OrderRequest {
            symbol: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: dec!(0.01),
            price: Some(dec!(50000)),
            stop_price: None,
            leverage: 2.0,
            stop_loss_pct: Some(0.05),
            take_profit_pct: Some(0.10),
            reduce_only: false,
            post_only: false,
            source: "test".to_string(),
            strategy_id: "s1".to_string(),
            trace_id: "t1".to_string(),
            bar_index: None,
        }
    }

    fn account() -> AccountState {
        AccountState {
            total_equity: dec!(10000),
            available_balance: dec!(10000),
            margin_balance: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            exposure: HashMap::new(),
            open_order_count: 0,
            daily_pnl: Decimal::ZERO,
            daily_loss_pct: 0.0,
            drawdown: 0.0,
        }
    }

    fn evaluate_with(
        request: &OrderRequest,
        account: &AccountState,
        config: &RiskConfig,
        breaker: BreakerView,
        trades: u32,
    ) -> ValidationReport {
        evaluate(&RuleContext {
            request,
            account,
            config,
            breaker,
            reference_price: dec!(50000),
            daily_trade_count: trades,
        })
    }

    #[test]
    fn test_clean_request_passes_unmodified() {
        let report = evaluate_with(
            &request(),
            &account(),
            &RiskConfig::default(),
            BreakerView::default(),
            0,
        );
        assert!(report.passed);
        assert!(report.applied_rules.is_empty());
        assert!(report.modified.is_none());
    }

    #[test]
    fn test_rule1_system_breaker_blocks_even_reducing() {
        let mut req = request();
        req.reduce_only = true;
        let breaker = BreakerView {
            system: BreakerStatus::Triggered,
            ..Default::default()
        };
        let report = evaluate_with(&req, &account(), &RiskConfig::default(), breaker, 0);
        assert!(!report.passed);
        assert_eq!(report.reject_reason, Some(RejectReason::RiskCheckFailed));
    }

    #[test]
    fn test_rule1_account_breaker_allows_reducing_orders() {
        let breaker = BreakerView {
            account: BreakerStatus::Triggered,
            ..Default::default()
        };
        let blocked = evaluate_with(&request(), &account(), &RiskConfig::default(), breaker, 0);
        assert!(!blocked.passed);

        let mut reducing = request();
        reducing.reduce_only = true;
        let allowed = evaluate_with(&reducing, &account(), &RiskConfig::default(), breaker, 0);
        assert!(allowed.passed);
    }

    #[test]
    fn test_rule2_zero_balance_rejects() {
        let mut acct = account();
        acct.available_balance = Decimal::ZERO;
        let report = evaluate_with(&request(), &acct, &RiskConfig::default(), BreakerView::default(), 0);
        assert_eq!(report.reject_reason, Some(RejectReason::InsufficientMargin));
    }

    #[test]
    fn test_rule3_deny_list() {
        let mut req = request();
        req.symbol = "USDT/USD".to_string();
        let report = evaluate_with(&req, &account(), &RiskConfig::default(), BreakerView::default(), 0);
        assert_eq!(report.reject_reason, Some(RejectReason::RiskCheckFailed));
        assert!(report.applied_rules.contains(&"deny_list".to_string()));
    }

    #[test]
    fn test_rule4_leverage_boundary_and_clamp() {
        let config = RiskConfig::default(); // max_leverage 3, clamp mode
        let mut req = request();

        req.leverage = 3.0; // exactly the ceiling: admitted untouched
        let report = evaluate_with(&req, &account(), &config, BreakerView::default(), 0);
        assert!(report.passed);
        assert!(report.modified.is_none());

        req.leverage = 3.5;
        let report = evaluate_with(&req, &account(), &config, BreakerView::default(), 0);
        assert!(report.passed);
        let modified = report.modified.unwrap();
        assert_eq!(modified.leverage, 3.0);
        assert!(report.applied_rules.contains(&"leverage_limit".to_string()));
    }

    #[test]
    fn test_rule4_strict_mode_rejects_leverage() {
        let mut config = RiskConfig::default();
        config.mode = RiskMode::Strict;
        let mut req = request();
        req.leverage = 3.5;
        let report = evaluate_with(&req, &account(), &config, BreakerView::default(), 0);
        assert_eq!(report.reject_reason, Some(RejectReason::LeverageExceeded));
    }

    #[test]
    fn test_rule5_position_limit_reduces_size() {
        // Equity 10000, max 10% -> 1000 notional cap. 0.25 BTC @ 50000 = 12500.
        let mut req = request();
        req.quantity = dec!(0.25);
        let report = evaluate_with(&req, &account(), &RiskConfig::default(), BreakerView::default(), 0);

        assert!(report.passed);
        let modified = report.modified.unwrap();
        assert_eq!(modified.quantity, dec!(0.02)); // 1000 / 50000
        assert!(report.applied_rules.contains(&"position_limit".to_string()));
    }

    #[test]
    fn test_rule6_symbol_exposure_rejects_below_dust() {
        let mut acct = account();
        // Cap is 15% of 10000 = 1500; existing exposure already 1495.
        acct.exposure.insert("BTC/USDT".to_string(), dec!(1495));
        let report = evaluate_with(&request(), &acct, &RiskConfig::default(), BreakerView::default(), 0);
        assert_eq!(report.reject_reason, Some(RejectReason::PositionLimitExceeded));
        assert!(report.applied_rules.contains(&"symbol_exposure".to_string()));
    }

    #[test]
    fn test_rule7_total_exposure_rejects() {
        let mut acct = account();
        acct.exposure.insert("ETH/USDT".to_string(), dec!(4900));
        // total cap 50% of 10000 = 5000; request notional 500 -> 5400 exceeds
        let report = evaluate_with(&request(), &acct, &RiskConfig::default(), BreakerView::default(), 0);
        assert_eq!(report.reject_reason, Some(RejectReason::PositionLimitExceeded));
        assert!(report.applied_rules.contains(&"total_exposure".to_string()));
    }

    #[test]
    fn test_rule8_position_count_only_counts_new_symbols() {
        let mut config = RiskConfig::default();
        config.max_open_positions = 2;
        let mut acct = account();
        acct.exposure.insert("ETH/USDT".to_string(), dec!(100));
        acct.exposure.insert("SOL/USDT".to_string(), dec!(100));

        // New symbol at the cap: rejected.
        let report = evaluate_with(&request(), &acct, &config, BreakerView::default(), 0);
        assert_eq!(report.reject_reason, Some(RejectReason::PositionLimitExceeded));

        // Adding to an already-held symbol passes the count rule.
        acct.exposure.insert("BTC/USDT".to_string(), dec!(100));
        config.max_open_positions = 3;
        let report = evaluate_with(&request(), &acct, &config, BreakerView::default(), 0);
        assert!(report.passed);
    }

    #[test]
    fn test_rule9_stop_loss_bounds() {
        let mut req = request();
        req.stop_loss_pct = Some(0.01); // below 2% minimum
        let report = evaluate_with(&req, &account(), &RiskConfig::default(), BreakerView::default(), 0);
        assert_eq!(report.reject_reason, Some(RejectReason::RiskCheckFailed));

        let mut req = request();
        req.stop_loss_pct = Some(0.30); // above 15% maximum: clamped
        let report = evaluate_with(&req, &account(), &RiskConfig::default(), BreakerView::default(), 0);
        assert!(report.passed);
        assert_eq!(report.modified.unwrap().stop_loss_pct, Some(0.15));
    }

    #[test]
    fn test_rule10_take_profit_clamped() {
        let mut req = request();
        req.take_profit_pct = Some(0.50);
        let report = evaluate_with(&req, &account(), &RiskConfig::default(), BreakerView::default(), 0);
        assert!(report.passed);
        assert_eq!(report.modified.unwrap().take_profit_pct, Some(0.30));
    }

    #[test]
    fn test_rule11_daily_loss_boundary() {
        let mut acct = account();
        acct.daily_loss_pct = 0.10; // exactly at the limit: admitted
        let report = evaluate_with(&request(), &acct, &RiskConfig::default(), BreakerView::default(), 0);
        assert!(report.passed);

        acct.daily_loss_pct = 0.101;
        let report = evaluate_with(&request(), &acct, &RiskConfig::default(), BreakerView::default(), 0);
        assert_eq!(report.reject_reason, Some(RejectReason::RiskCheckFailed));
        assert!(report.applied_rules.contains(&"daily_loss".to_string()));
    }

    #[test]
    fn test_rule12_daily_trade_budget() {
        let config = RiskConfig::default();
        let report = evaluate_with(
            &request(),
            &account(),
            &config,
            BreakerView::default(),
            config.max_daily_trades,
        );
        assert_eq!(report.reject_reason, Some(RejectReason::RiskCheckFailed));
        assert!(report.applied_rules.contains(&"daily_trades".to_string()));
    }

    #[test]
    fn test_rule13_drawdown_demands_breaker_trip() {
        let mut acct = account();
        acct.drawdown = 0.25;
        let report = evaluate_with(&request(), &acct, &RiskConfig::default(), BreakerView::default(), 0);
        assert!(!report.passed);
        let (_, value, threshold) = report.breaker_trip.unwrap();
        assert_eq!(value, 0.25);
        assert_eq!(threshold, 0.20);
    }

    #[test]
    fn test_first_failing_rule_decides() {
        // Zero balance (rule 2) and denied symbol (rule 3): rule 2 wins.
        let mut req = request();
        req.symbol = "USDT/USD".to_string();
        let mut acct = account();
        acct.available_balance = Decimal::ZERO;
        let report = evaluate_with(&req, &acct, &RiskConfig::default(), BreakerView::default(), 0);
        assert_eq!(report.reject_reason, Some(RejectReason::InsufficientMargin));
    }

    #[test]
    fn test_clamps_accumulate() {
        let mut req = request();
        req.quantity = dec!(0.25); // clamps at rule 5
        req.leverage = 5.0; // clamps at rule 4
        req.take_profit_pct = Some(0.50); // clamps at rule 10
        let report = evaluate_with(&req, &account(), &RiskConfig::default(), BreakerView::default(), 0);
        assert!(report.passed);
        assert_eq!(
            report.applied_rules,
            vec!["leverage_limit", "position_limit", "take_profit_bounds"]
        );
    }
}
