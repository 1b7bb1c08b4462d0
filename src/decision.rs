//! Decision types: the engine's verdict plus supporting violations and
//! evidence.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::intent::OrderIntent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Allow,
    Modify,
    Deny,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "ALLOW",
            Verdict::Modify => "MODIFY",
            Verdict::Deny => "DENY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    High,
    Crit,
}

/// A rule's finding that a limit was breached. `inputs` holds the limit
/// values consulted, `computed` the derived metrics that fired the rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Violation {
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub computed: BTreeMap<String, Value>,
}

/// A computed metric and its applicable limit, recorded whether or not the
/// rule fired, so consumers can see proximity to limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Evidence {
    pub metric: String,
    pub value: Value,
    pub limit: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Decision {
    pub decision: Verdict,
    pub intent_id: String,
    /// Present iff `decision == MODIFY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_intent: Option<OrderIntent>,
    #[serde(default)]
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    #[serde(default)]
    pub kill_switch_triggered: bool,
    /// Wall-clock evaluation latency, set by the engine facade only; the
    /// pure evaluator leaves it unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_ms: Option<f64>,
}

impl Decision {
    pub fn fired(&self, rule_id: &str) -> bool {
        self.violations.iter().any(|v| v.rule_id == rule_id)
    }
}
