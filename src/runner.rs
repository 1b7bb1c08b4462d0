//! Stream runner: drives a sequence of intents through the engine and a
//! broker, evolving portfolio and execution state.
//!
//! Strictly sequential: evaluate, audit write, submit, fill poll, state
//! mutation, window update, kill-switch check. The audit write always
//! precedes broker I/O so the governance record survives a broker crash.
//! A broker error halts the run (fail-loud) after an ORDER_REJECTED exec
//! event is emitted.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::audit::{build_audit_event, JsonlWriter};
use crate::broker::{Broker, OrderStatus};
use crate::decision::{Decision, Verdict};
use crate::engine::PolicyEngine;
use crate::intent::OrderIntent;
use crate::logging::{json_log, obj, v_num, v_str};
use crate::state::{
    now_rfc3339, parse_epoch_seconds, ExecutionState, MarketSnapshot, PortfolioState,
    ViolationStamp,
};

pub const ORDER_SUBMITTED: &str = "ORDER_SUBMITTED";
pub const ORDER_FILLED: &str = "ORDER_FILLED";
pub const ORDER_REJECTED: &str = "ORDER_REJECTED";

/// Aggregate statistics for one `run_stream` invocation.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub total_intents: u64,
    pub allow: u64,
    pub modify: u64,
    pub deny: u64,
    pub rule_histogram: BTreeMap<String, u64>,
    pub orders_submitted: u64,
    pub orders_filled: u64,
}

impl RunSummary {
    fn new(run_id: String) -> Self {
        Self {
            run_id,
            total_intents: 0,
            allow: 0,
            modify: 0,
            deny: 0,
            rule_histogram: BTreeMap::new(),
            orders_submitted: 0,
            orders_filled: 0,
        }
    }

    fn record(&mut self, decision: &Decision) {
        self.total_intents += 1;
        match decision.decision {
            Verdict::Allow => self.allow += 1,
            Verdict::Modify => self.modify += 1,
            Verdict::Deny => self.deny += 1,
        }
        for v in &decision.violations {
            *self.rule_histogram.entry(v.rule_id.clone()).or_insert(0) += 1;
        }
    }

    /// Final summary document, combining run counters with the end state.
    pub fn to_json(&self, portfolio: &PortfolioState, execution: &ExecutionState) -> Value {
        let mut decisions = Map::new();
        decisions.insert("ALLOW".to_string(), json!(self.allow));
        decisions.insert("MODIFY".to_string(), json!(self.modify));
        decisions.insert("DENY".to_string(), json!(self.deny));

        let mut out = Map::new();
        out.insert("total_intents".to_string(), json!(self.total_intents));
        out.insert("decisions".to_string(), Value::Object(decisions));
        out.insert("rule_histogram".to_string(), json!(self.rule_histogram));
        out.insert("orders_submitted".to_string(), json!(self.orders_submitted));
        out.insert("orders_filled".to_string(), json!(self.orders_filled));
        out.insert("final_equity".to_string(), json!(portfolio.equity));
        out.insert("final_positions".to_string(), json!(portfolio.positions));
        out.insert("kill_switch_active".to_string(), json!(execution.kill_switch_active));
        out.insert("run_id".to_string(), Value::String(self.run_id.clone()));
        Value::Object(out)
    }
}

fn exec_event(
    event: &str,
    intent_id: &str,
    order_id: &str,
    run_id: &str,
    policy_hash: &str,
    extra: &[(&str, Value)],
) -> Value {
    let mut fields = Map::new();
    fields.insert("ts".to_string(), Value::String(now_rfc3339()));
    fields.insert("event".to_string(), Value::String(event.to_string()));
    fields.insert("intent_id".to_string(), Value::String(intent_id.to_string()));
    fields.insert("order_id".to_string(), Value::String(order_id.to_string()));
    fields.insert("run_id".to_string(), Value::String(run_id.to_string()));
    fields.insert("policy_hash".to_string(), Value::String(policy_hash.to_string()));
    for (k, v) in extra {
        fields.insert((*k).to_string(), v.clone());
    }
    Value::Object(fields)
}

/// Run a stream of intents through the engine with a broker.
///
/// Per intent: evaluate, append the audit event, then (unless DENY) submit
/// the effective intent, poll fills, apply them to the portfolio, and bump
/// the order counters. Fired violations land in the rolling window and the
/// kill switch is re-checked for every intent, denied or not. Once the
/// switch is active it stays active for the rest of the run.
pub async fn run_stream(
    engine: &PolicyEngine,
    intents: &[OrderIntent],
    portfolio: &mut PortfolioState,
    market: &MarketSnapshot,
    execution: &mut ExecutionState,
    broker: &mut (dyn Broker + Send),
    mut audit_log: Option<&mut JsonlWriter>,
    mut exec_log: Option<&mut JsonlWriter>,
) -> Result<RunSummary> {
    let run_id = Uuid::new_v4().to_string();
    let kill_cfg = engine.policy().limits.kill_switch.clone();
    let mut summary = RunSummary::new(run_id.clone());
    let mut open_orders: Vec<String> = Vec::new();

    json_log(
        "runner",
        obj(&[
            ("status", v_str("run_start")),
            ("run_id", v_str(&run_id)),
            ("policy_hash", v_str(engine.policy_hash())),
            ("intents", v_num(intents.len() as f64)),
        ]),
    );

    for intent in intents {
        let decision = engine.evaluate(intent, portfolio, market, execution)?;
        summary.record(&decision);

        // Audit before any broker I/O.
        if let Some(w) = audit_log.as_deref_mut() {
            let event = build_audit_event(
                &decision,
                intent,
                portfolio,
                market,
                execution,
                engine.policy_hash(),
                Some(&run_id),
            )?;
            w.append_json(&event).context("audit write failed")?;
        }

        if decision.decision != Verdict::Deny {
            let effective = decision.modified_intent.as_ref().unwrap_or(intent);

            let ack = match broker.submit(effective, market).await {
                Ok(ack) => ack,
                Err(e) => {
                    if let Some(w) = exec_log.as_deref_mut() {
                        let event = exec_event(
                            ORDER_REJECTED,
                            &intent.intent_id,
                            "",
                            &run_id,
                            engine.policy_hash(),
                            &[("symbol", json!(effective.instrument.symbol))],
                        );
                        w.append_json(&event).context("exec log write failed")?;
                    }
                    return Err(e.context(format!("broker submit failed for {}", intent.intent_id)));
                }
            };

            summary.orders_submitted += 1;
            open_orders.push(ack.order_id.clone());

            if let Some(w) = exec_log.as_deref_mut() {
                let event = exec_event(
                    ORDER_SUBMITTED,
                    &intent.intent_id,
                    &ack.order_id,
                    &run_id,
                    engine.policy_hash(),
                    &[
                        ("symbol", json!(effective.instrument.symbol)),
                        ("side", json!(effective.side.as_str())),
                        ("qty", json!(effective.qty)),
                        ("order_type", json!(effective.order_type.as_str())),
                    ],
                );
                w.append_json(&event).context("exec log write failed")?;
            }

            let fills = broker.poll_fills(&open_orders).await?;
            let mut submitted_order_filled = false;
            for fill in &fills {
                if fill.order_id == ack.order_id {
                    submitted_order_filled = true;
                }
                if let Some(w) = exec_log.as_deref_mut() {
                    let event = exec_event(
                        ORDER_FILLED,
                        &fill.intent_id,
                        &fill.order_id,
                        &run_id,
                        engine.policy_hash(),
                        &[
                            ("symbol", json!(fill.symbol)),
                            ("side", json!(fill.side.as_str())),
                            ("qty", json!(fill.qty)),
                            ("price", json!(fill.price)),
                        ],
                    );
                    w.append_json(&event).context("exec log write failed")?;
                }

                // Signed position update plus the simple cash model: buys
                // consume equity, sells release it.
                let signed_qty = fill.side.sign() * fill.qty;
                let new_qty = portfolio.position(&fill.symbol) + signed_qty;
                if new_qty.abs() < 1e-10 {
                    portfolio.positions.remove(&fill.symbol);
                } else {
                    portfolio.positions.insert(fill.symbol.clone(), new_qty);
                }
                portfolio.equity -= signed_qty * fill.price;
                summary.orders_filled += 1;
                open_orders.retain(|id| id != &fill.order_id);
            }
            portfolio.peak_equity = portfolio.peak_equity.max(portfolio.equity);

            // No fill for the order we just placed: ask the broker whether
            // it died on arrival.
            if !submitted_order_filled {
                if let Some(order) = broker.get_order(&ack.order_id).await? {
                    if order.status == OrderStatus::Rejected {
                        if let Some(w) = exec_log.as_deref_mut() {
                            let event = exec_event(
                                ORDER_REJECTED,
                                &intent.intent_id,
                                &ack.order_id,
                                &run_id,
                                engine.policy_hash(),
                                &[],
                            );
                            w.append_json(&event).context("exec log write failed")?;
                        }
                        open_orders.retain(|id| id != &ack.order_id);
                    }
                }
            }

            // Counters track submissions, not fills.
            execution.orders_last_minute_global += 1;
            *execution
                .orders_last_minute_by_strategy
                .entry(intent.strategy_id.clone())
                .or_insert(0) += 1;
        }

        // Rolling violation window, stamped with the intent's own clock.
        let ts = parse_epoch_seconds(&intent.timestamp)?;
        for v in &decision.violations {
            execution.violations_in_window.push(ViolationStamp {
                rule_id: v.rule_id.clone(),
                timestamp_epoch_seconds: ts,
            });
        }
        let cutoff = ts - kill_cfg.violation_window_seconds as i64;
        execution.violations_in_window.retain(|e| e.timestamp_epoch_seconds >= cutoff);

        if decision.kill_switch_triggered && !execution.kill_switch_active {
            execution.kill_switch_active = true;
            json_log(
                "runner",
                obj(&[
                    ("status", v_str("kill_switch_trip")),
                    ("kind", v_str("hard")),
                    ("intent_id", v_str(&intent.intent_id)),
                ]),
            );
        }
        if !execution.kill_switch_active
            && execution.violations_in_window.len() as u32 >= kill_cfg.trip_after_n_violations
        {
            execution.kill_switch_active = true;
            json_log(
                "runner",
                obj(&[
                    ("status", v_str("kill_switch_trip")),
                    ("kind", v_str("soft")),
                    ("window_count", v_num(execution.violations_in_window.len() as f64)),
                ]),
            );
        }
    }

    json_log(
        "runner",
        obj(&[
            ("status", v_str("run_end")),
            ("run_id", v_str(&run_id)),
            ("submitted", v_num(summary.orders_submitted as f64)),
            ("filled", v_num(summary.orders_filled as f64)),
        ]),
    );

    Ok(summary)
}
