//! One pure function per rule, run in a fixed order over a shared context
//! of derived metrics.
//!
//! Rules never mutate their inputs and never raise: a breached limit is
//! data, not an error. Each returns an optional outcome (the rule fired)
//! plus optional evidence (the metric was computable, fired or not).
//! Threshold comparisons are direct, no epsilon.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::decision::{Evidence, Severity, Violation};
use crate::intent::OrderIntent;
use crate::policy::EffectiveLimits;
use crate::state::ExecutionState;

/// Derived metrics for one evaluation, computed once by the evaluator.
pub struct RuleCtx<'a> {
    pub intent: &'a OrderIntent,
    pub execution: &'a ExecutionState,
    pub price: f64,
    pub equity: f64,
    pub current_qty: f64,
    pub daily_return: f64,
    pub drawdown: f64,
    pub new_position_pct: f64,
    pub gross_exposure_x: f64,
    pub net_exposure_x: f64,
}

/// What a fired rule reports; the evaluator stamps on the rule id and
/// severity from the table entry.
pub struct RuleOutcome {
    pub message: String,
    pub inputs: BTreeMap<String, Value>,
    pub computed: BTreeMap<String, Value>,
}

pub type RuleFn = fn(&RuleCtx, &EffectiveLimits) -> (Option<RuleOutcome>, Option<Evidence>);

pub struct RuleDef {
    pub id: &'static str,
    pub severity: Severity,
    pub run: RuleFn,
}

/// The fixed evaluation order. SYS-001 is not listed: it is a pre-pass in
/// the evaluator because a missing price aborts the whole pipeline.
pub const RULES: &[RuleDef] = &[
    RuleDef { id: "KILL-001", severity: Severity::Crit, run: kill_switch },
    RuleDef { id: "LOSS-001", severity: Severity::High, run: daily_loss },
    RuleDef { id: "LOSS-002", severity: Severity::Crit, run: drawdown },
    RuleDef { id: "EXEC-001", severity: Severity::High, run: global_rate },
    RuleDef { id: "EXEC-002", severity: Severity::High, run: strategy_rate },
    RuleDef { id: "EXP-001", severity: Severity::High, run: position_limit },
    RuleDef { id: "EXP-002", severity: Severity::High, run: gross_exposure },
    RuleDef { id: "EXP-003", severity: Severity::High, run: net_exposure },
];

pub fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

/// Quantity granularity: floor, so a MODIFY never exceeds the cap.
pub fn floor4(x: f64) -> f64 {
    (x * 1e4).floor() / 1e4
}

fn map(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn evidence(metric: &str, value: f64, limit: f64) -> Evidence {
    Evidence {
        metric: metric.to_string(),
        value: json!(round6(value)),
        limit: json!(round6(limit)),
    }
}

/// SYS-001: missing or non-positive price for the intent's symbol. Evaluated
/// before everything else; when it fires, the evaluator returns a lone DENY.
pub fn check_price(symbol: &str, price: Option<f64>) -> Option<Violation> {
    if price.is_some() {
        return None;
    }
    Some(missing_price_violation(symbol))
}

pub fn missing_price_violation(symbol: &str) -> Violation {
    Violation {
        rule_id: "SYS-001".to_string(),
        severity: Severity::Crit,
        message: format!("Missing or invalid price for symbol '{}'.", symbol),
        inputs: map(&[("symbol", json!(symbol))]),
        computed: BTreeMap::new(),
    }
}

fn kill_switch(ctx: &RuleCtx, _limits: &EffectiveLimits) -> (Option<RuleOutcome>, Option<Evidence>) {
    if !ctx.execution.kill_switch_active {
        return (None, None);
    }
    let outcome = RuleOutcome {
        message: "Kill switch is active; all orders denied.".to_string(),
        inputs: map(&[("kill_switch_active", json!(true))]),
        computed: BTreeMap::new(),
    };
    (Some(outcome), None)
}

fn daily_loss(ctx: &RuleCtx, limits: &EffectiveLimits) -> (Option<RuleOutcome>, Option<Evidence>) {
    let limit = limits.loss.daily_loss_limit_pct;
    let ev = evidence("daily_return", ctx.daily_return, -limit);
    if ctx.daily_return > -limit {
        return (None, Some(ev));
    }
    let outcome = RuleOutcome {
        message: format!("Daily loss {:.4} breaches limit -{:.4}.", ctx.daily_return, limit),
        inputs: map(&[("daily_loss_limit_pct", json!(limit))]),
        computed: map(&[("daily_return", json!(round6(ctx.daily_return)))]),
    };
    (Some(outcome), Some(ev))
}

fn drawdown(ctx: &RuleCtx, limits: &EffectiveLimits) -> (Option<RuleOutcome>, Option<Evidence>) {
    let limit = limits.loss.max_drawdown_pct;
    let ev = evidence("drawdown", ctx.drawdown, limit);
    if ctx.drawdown < limit {
        return (None, Some(ev));
    }
    let outcome = RuleOutcome {
        message: format!("Drawdown {:.4} breaches limit {:.4}.", ctx.drawdown, limit),
        inputs: map(&[("max_drawdown_pct", json!(limit))]),
        computed: map(&[("drawdown", json!(round6(ctx.drawdown)))]),
    };
    (Some(outcome), Some(ev))
}

fn global_rate(ctx: &RuleCtx, limits: &EffectiveLimits) -> (Option<RuleOutcome>, Option<Evidence>) {
    let limit = limits.execution.max_orders_per_minute_global;
    let n = ctx.execution.orders_last_minute_global;
    let ev = Evidence {
        metric: "orders_last_minute_global".to_string(),
        value: json!(n),
        limit: json!(limit),
    };
    if n < limit {
        return (None, Some(ev));
    }
    let outcome = RuleOutcome {
        message: format!("Global rate {} orders/min exceeds limit {}.", n, limit),
        inputs: map(&[("max_orders_per_minute_global", json!(limit))]),
        computed: map(&[("orders_last_minute_global", json!(n))]),
    };
    (Some(outcome), Some(ev))
}

fn strategy_rate(ctx: &RuleCtx, limits: &EffectiveLimits) -> (Option<RuleOutcome>, Option<Evidence>) {
    let limit = limits.execution.max_orders_per_minute_by_strategy;
    let n = ctx.execution.strategy_orders(&ctx.intent.strategy_id);
    let ev = Evidence {
        metric: "orders_last_minute_strategy".to_string(),
        value: json!(n),
        limit: json!(limit),
    };
    if n < limit {
        return (None, Some(ev));
    }
    let outcome = RuleOutcome {
        message: format!(
            "Strategy '{}' rate {} orders/min exceeds limit {}.",
            ctx.intent.strategy_id, n, limit
        ),
        inputs: map(&[
            ("strategy_id", json!(ctx.intent.strategy_id)),
            ("max_orders_per_minute_by_strategy", json!(limit)),
        ]),
        computed: map(&[("orders_last_minute_strategy", json!(n))]),
    };
    (Some(outcome), Some(ev))
}

/// EXP-001: per-symbol position cap, with a MODIFY hint when a reduced
/// quantity still fits.
fn position_limit(ctx: &RuleCtx, limits: &EffectiveLimits) -> (Option<RuleOutcome>, Option<Evidence>) {
    let limit = limits.exposure.max_position_pct;
    let ev = evidence("new_position_pct", ctx.new_position_pct, limit);
    if ctx.new_position_pct <= limit {
        return (None, Some(ev));
    }
    let headroom = limit * ctx.equity - (ctx.current_qty * ctx.price).abs();
    let allowed_qty = floor4((headroom / ctx.price).max(0.0));
    let outcome = RuleOutcome {
        message: format!("Position {:.4} breaches limit {:.4}.", ctx.new_position_pct, limit),
        inputs: map(&[("max_position_pct", json!(limit))]),
        computed: map(&[
            ("new_position_pct", json!(round6(ctx.new_position_pct))),
            ("requested_qty", json!(ctx.intent.qty)),
            ("allowed_qty", json!(allowed_qty)),
        ]),
    };
    (Some(outcome), Some(ev))
}

fn gross_exposure(ctx: &RuleCtx, limits: &EffectiveLimits) -> (Option<RuleOutcome>, Option<Evidence>) {
    let limit = limits.exposure.max_gross_exposure_x;
    let ev = evidence("gross_exposure_x", ctx.gross_exposure_x, limit);
    if ctx.gross_exposure_x <= limit {
        return (None, Some(ev));
    }
    let outcome = RuleOutcome {
        message: format!(
            "Gross exposure {:.4}x breaches limit {:.4}x.",
            ctx.gross_exposure_x, limit
        ),
        inputs: map(&[("max_gross_exposure_x", json!(limit))]),
        computed: map(&[("gross_exposure_x", json!(round6(ctx.gross_exposure_x)))]),
    };
    (Some(outcome), Some(ev))
}

/// EXP-003: skipped when no net limit is configured; evidence still carries
/// the computed metric with a zero limit so logs stay shape-stable.
fn net_exposure(ctx: &RuleCtx, limits: &EffectiveLimits) -> (Option<RuleOutcome>, Option<Evidence>) {
    let Some(limit) = limits.exposure.max_net_exposure_x else {
        return (None, Some(evidence("net_exposure_x", ctx.net_exposure_x, 0.0)));
    };
    let ev = evidence("net_exposure_x", ctx.net_exposure_x, limit);
    if ctx.net_exposure_x <= limit {
        return (None, Some(ev));
    }
    let outcome = RuleOutcome {
        message: format!(
            "Net exposure {:.4}x breaches limit {:.4}x.",
            ctx.net_exposure_x, limit
        ),
        inputs: map(&[("max_net_exposure_x", json!(limit))]),
        computed: map(&[("net_exposure_x", json!(round6(ctx.net_exposure_x)))]),
    };
    (Some(outcome), Some(ev))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::tests::intent;
    use crate::intent::Side;
    use crate::policy::{ExecutionLimits, ExposureLimits, LossLimits};

    fn limits() -> EffectiveLimits {
        EffectiveLimits {
            exposure: ExposureLimits {
                max_position_pct: 0.10,
                max_gross_exposure_x: 2.0,
                max_net_exposure_x: Some(1.0),
            },
            loss: LossLimits { daily_loss_limit_pct: 0.03, max_drawdown_pct: 0.05 },
            execution: ExecutionLimits {
                max_orders_per_minute_global: 20,
                max_orders_per_minute_by_strategy: 10,
            },
        }
    }

    fn ctx_with<'a>(
        i: &'a OrderIntent,
        e: &'a ExecutionState,
        daily_return: f64,
        drawdown: f64,
    ) -> RuleCtx<'a> {
        RuleCtx {
            intent: i,
            execution: e,
            price: 200.0,
            equity: 100_000.0,
            current_qty: 0.0,
            daily_return,
            drawdown,
            new_position_pct: 0.02,
            gross_exposure_x: 0.02,
            net_exposure_x: 0.02,
        }
    }

    #[test]
    fn daily_loss_fires_at_exact_limit() {
        let i = intent("AAPL", Side::Buy, 10.0);
        let e = ExecutionState::default();
        let ctx = ctx_with(&i, &e, -0.03, 0.0);
        let (fired, ev) = daily_loss(&ctx, &limits());
        assert!(fired.is_some());
        assert!(ev.is_some());
        // one tick inside the limit does not fire
        let ctx = ctx_with(&i, &e, -0.0299, 0.0);
        let (fired, ev) = daily_loss(&ctx, &limits());
        assert!(fired.is_none());
        assert!(ev.is_some());
    }

    #[test]
    fn drawdown_fires_at_exact_limit() {
        let i = intent("AAPL", Side::Buy, 10.0);
        let e = ExecutionState::default();
        let (fired, _) = drawdown(&ctx_with(&i, &e, 0.0, 0.05), &limits());
        assert!(fired.is_some());
        let (fired, _) = drawdown(&ctx_with(&i, &e, 0.0, 0.0499), &limits());
        assert!(fired.is_none());
    }

    #[test]
    fn rate_limits_fire_at_count_equal_to_limit() {
        let i = intent("AAPL", Side::Buy, 10.0);
        let mut e = ExecutionState::default();
        e.orders_last_minute_global = 20;
        e.orders_last_minute_by_strategy.insert("momo".to_string(), 10);
        let ctx = ctx_with(&i, &e, 0.0, 0.0);
        assert!(global_rate(&ctx, &limits()).0.is_some());
        assert!(strategy_rate(&ctx, &limits()).0.is_some());

        e.orders_last_minute_global = 19;
        e.orders_last_minute_by_strategy.insert("momo".to_string(), 9);
        let ctx = ctx_with(&i, &e, 0.0, 0.0);
        assert!(global_rate(&ctx, &limits()).0.is_none());
        assert!(strategy_rate(&ctx, &limits()).0.is_none());
    }

    #[test]
    fn position_limit_is_strictly_greater_than() {
        let i = intent("AAPL", Side::Buy, 50.0);
        let e = ExecutionState::default();
        let mut ctx = ctx_with(&i, &e, 0.0, 0.0);
        ctx.new_position_pct = 0.10;
        assert!(position_limit(&ctx, &limits()).0.is_none());
        ctx.new_position_pct = 0.1001;
        assert!(position_limit(&ctx, &limits()).0.is_some());
    }

    #[test]
    fn position_limit_computes_floored_allowed_qty() {
        let i = intent("AAPL", Side::Buy, 100.0);
        let e = ExecutionState::default();
        let mut ctx = ctx_with(&i, &e, 0.0, 0.0);
        ctx.new_position_pct = 0.20;
        let (fired, _) = position_limit(&ctx, &limits());
        let outcome = fired.unwrap();
        // 0.10 * 100000 / 200 = 50 shares of headroom
        assert_eq!(outcome.computed["allowed_qty"], json!(50.0));
    }

    #[test]
    fn allowed_qty_clamps_to_zero_when_already_over() {
        let i = intent("AAPL", Side::Buy, 10.0);
        let e = ExecutionState::default();
        let mut ctx = ctx_with(&i, &e, 0.0, 0.0);
        ctx.current_qty = 100.0; // 20000 notional, cap is 10000
        ctx.new_position_pct = 0.22;
        let (fired, _) = position_limit(&ctx, &limits());
        assert_eq!(fired.unwrap().computed["allowed_qty"], json!(0.0));
    }

    #[test]
    fn net_exposure_skips_when_unconfigured() {
        let i = intent("AAPL", Side::Buy, 10.0);
        let e = ExecutionState::default();
        let mut ctx = ctx_with(&i, &e, 0.0, 0.0);
        ctx.net_exposure_x = 5.0;
        let mut l = limits();
        l.exposure.max_net_exposure_x = None;
        let (fired, ev) = net_exposure(&ctx, &l);
        assert!(fired.is_none());
        assert_eq!(ev.unwrap().limit, json!(0.0));
    }

    #[test]
    fn sys_rule_only_fires_without_valid_price() {
        assert!(check_price("AAPL", Some(200.0)).is_none());
        let v = check_price("AAPL", None).unwrap();
        assert_eq!(v.rule_id, "SYS-001");
        assert_eq!(v.severity, Severity::Crit);
    }
}
