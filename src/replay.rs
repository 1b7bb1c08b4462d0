//! Replay recorded audit events against a loaded policy.
//!
//! A mismatch means policy drift (compare the event's `policy_hash`), an
//! engine regression, or a corrupted log line.

use anyhow::{Context, Result};
use serde_json::Value;

use crate::decision::Decision;
use crate::evaluator;
use crate::intent::OrderIntent;
use crate::policy::CapitalPolicy;
use crate::state::{ExecutionState, MarketSnapshot, PortfolioState};

/// Reconstruct the inputs recorded in `event`, re-evaluate, and return
/// `(original_decision, replayed_decision)`. Inputs go through the same
/// validators as the live path.
pub fn replay_event(event: &Value, policy: &CapitalPolicy) -> Result<(Decision, Decision)> {
    let intent: OrderIntent =
        serde_json::from_value(event["intent"].clone()).context("audit event: bad intent")?;
    let portfolio: PortfolioState = serde_json::from_value(event["portfolio_state"].clone())
        .context("audit event: bad portfolio_state")?;
    let market: MarketSnapshot = serde_json::from_value(event["market_snapshot"].clone())
        .context("audit event: bad market_snapshot")?;
    let execution: ExecutionState = serde_json::from_value(event["execution_state"].clone())
        .context("audit event: bad execution_state")?;
    let original: Decision =
        serde_json::from_value(event["decision"].clone()).context("audit event: bad decision")?;

    let replayed = evaluator::evaluate(&intent, policy, &portfolio, &market, &execution)?;
    Ok((original, replayed))
}

/// Logical decision equality: verdict, intent, the full ordered violation
/// list, the kill-switch flag, and the modified intent. Evidence and
/// latency are informational and excluded.
pub fn decisions_match(a: &Decision, b: &Decision) -> bool {
    a.decision == b.decision
        && a.intent_id == b.intent_id
        && a.violations == b.violations
        && a.kill_switch_triggered == b.kill_switch_triggered
        && a.modified_intent == b.modified_intent
}
