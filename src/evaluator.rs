//! The deterministic evaluation pipeline: derive metrics, run every rule in
//! fixed order, compose the verdict.
//!
//! Evaluation never short-circuits once a valid price exists, so the audit
//! log carries the complete violation picture. The single exception is
//! SYS-001: without a price the exposure metrics are meaningless, so the
//! pipeline stops and denies with that lone violation, in enforce and
//! monitor mode alike.

use anyhow::Result;

use crate::decision::{Decision, Verdict, Violation};
use crate::intent::OrderIntent;
use crate::policy::{CapitalPolicy, Mode};
use crate::rules::{self, RuleCtx, RULES};
use crate::state::{ExecutionState, MarketSnapshot, PortfolioState};

/// Evaluate one intent. Pure: same inputs, same `Decision`, always. Errors
/// only on malformed inputs (input validation), never on policy outcomes.
pub fn evaluate(
    intent: &OrderIntent,
    policy: &CapitalPolicy,
    portfolio: &PortfolioState,
    market: &MarketSnapshot,
    execution: &ExecutionState,
) -> Result<Decision> {
    intent.validate()?;
    portfolio.validate()?;

    let symbol = &intent.instrument.symbol;
    let trip_rules = &policy.limits.kill_switch.trip_on_rules;

    let price = match market.valid_price(symbol) {
        Some(p) => p,
        None => {
            let violation = rules::missing_price_violation(symbol);
            let kill = trips(trip_rules, std::slice::from_ref(&violation));
            return Ok(Decision {
                decision: Verdict::Deny,
                intent_id: intent.intent_id.clone(),
                modified_intent: None,
                violations: vec![violation],
                evidence: Vec::new(),
                kill_switch_triggered: kill,
                eval_ms: None,
            });
        }
    };

    let limits = policy.resolve(symbol, &intent.strategy_id);

    let equity = portfolio.equity;
    let current_qty = portfolio.position(symbol);
    let daily_return = (equity - portfolio.start_of_day_equity) / portfolio.start_of_day_equity;
    let drawdown = (portfolio.peak_equity - equity) / portfolio.peak_equity;

    let new_qty = current_qty + intent.side.sign() * intent.qty;
    let new_position_pct = (new_qty * price).abs() / equity;

    // Hypothetical book after the trade: every priced position, with the
    // intent's symbol replaced by its new quantity.
    let mut gross = 0.0;
    let mut net = 0.0;
    for (sym, qty) in &portfolio.positions {
        if sym == symbol {
            continue;
        }
        if let Some(p) = market.valid_price(sym) {
            let value = qty * p;
            gross += value.abs();
            net += value;
        }
    }
    let new_value = new_qty * price;
    gross += new_value.abs();
    net += new_value;
    let gross_exposure_x = gross / equity;
    let net_exposure_x = net.abs() / equity;

    let ctx = RuleCtx {
        intent,
        execution,
        price,
        equity,
        current_qty,
        daily_return,
        drawdown,
        new_position_pct,
        gross_exposure_x,
        net_exposure_x,
    };

    let mut violations = Vec::new();
    let mut evidence = Vec::new();
    for def in RULES {
        let (fired, ev) = (def.run)(&ctx, &limits);
        if let Some(outcome) = fired {
            violations.push(Violation {
                rule_id: def.id.to_string(),
                severity: def.severity,
                message: outcome.message,
                inputs: outcome.inputs,
                computed: outcome.computed,
            });
        }
        if let Some(ev) = ev {
            evidence.push(ev);
        }
    }

    let kill_switch_triggered = trips(trip_rules, &violations);

    let (mut decision, mut modified_intent) = compose(intent, &violations);

    // Monitor mode records everything but stands aside; SYS-001 never
    // reaches this point.
    if policy.defaults.mode == Mode::Monitor {
        decision = Verdict::Allow;
        modified_intent = None;
    }

    Ok(Decision {
        decision,
        intent_id: intent.intent_id.clone(),
        modified_intent,
        violations,
        evidence,
        kill_switch_triggered,
        eval_ms: None,
    })
}

fn trips(trip_rules: &[String], violations: &[Violation]) -> bool {
    violations.iter().any(|v| trip_rules.iter().any(|r| *r == v.rule_id))
}

/// Verdict composition: ALLOW when clean; MODIFY only when the position cap
/// is the sole breach and a reduced quantity still fits; DENY otherwise.
fn compose(intent: &OrderIntent, violations: &[Violation]) -> (Verdict, Option<OrderIntent>) {
    if violations.is_empty() {
        return (Verdict::Allow, None);
    }
    if let [only] = violations {
        if only.rule_id == "EXP-001" {
            let allowed_qty = only.computed.get("allowed_qty").and_then(|v| v.as_f64());
            if let Some(qty) = allowed_qty.filter(|q| *q > 0.0) {
                return (Verdict::Modify, Some(intent.with_qty(qty)));
            }
        }
    }
    (Verdict::Deny, None)
}
