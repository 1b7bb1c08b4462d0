//! PolicyEngine facade: owns the loaded policy and its source hash, and
//! wraps the pure evaluator with wall-clock latency measurement.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};

use crate::decision::Decision;
use crate::evaluator;
use crate::intent::OrderIntent;
use crate::policy::{load_policy_str, policy_hash, CapitalPolicy};
use crate::state::{ExecutionState, MarketSnapshot, PortfolioState};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct PolicyEngine {
    policy: CapitalPolicy,
    policy_hash: String,
}

impl PolicyEngine {
    /// Load, validate, and hash a policy file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read policy file {}", path.display()))?;
        Self::from_str(&raw)
    }

    /// Same as `from_path` for in-memory policy source. The hash covers the
    /// exact source bytes, not a re-serialization.
    pub fn from_str(raw: &str) -> Result<Self> {
        let policy = load_policy_str(raw)?;
        Ok(Self { policy, policy_hash: policy_hash(raw.as_bytes()) })
    }

    pub fn policy(&self) -> &CapitalPolicy {
        &self.policy
    }

    pub fn policy_hash(&self) -> &str {
        &self.policy_hash
    }

    /// Evaluate an intent against the loaded policy. Pure in its inputs;
    /// the only addition over `evaluator::evaluate` is the latency reading.
    pub fn evaluate(
        &self,
        intent: &OrderIntent,
        portfolio: &PortfolioState,
        market: &MarketSnapshot,
        execution: &ExecutionState,
    ) -> Result<Decision> {
        let started = Instant::now();
        let mut decision = evaluator::evaluate(intent, &self.policy, portfolio, market, execution)?;
        let eval_ms = started.elapsed().as_nanos() as f64 / 1_000_000.0;
        decision.eval_ms = Some((eval_ms * 1000.0).round() / 1000.0);
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Verdict;
    use crate::intent::tests::intent;
    use crate::intent::Side;
    use crate::policy::tests::BASE_POLICY;
    use std::collections::BTreeMap;

    fn fixtures() -> (PortfolioState, MarketSnapshot, ExecutionState) {
        let mut prices = BTreeMap::new();
        prices.insert("AAPL".to_string(), 200.0);
        (
            PortfolioState {
                equity: 100_000.0,
                start_of_day_equity: 100_000.0,
                peak_equity: 100_000.0,
                positions: BTreeMap::new(),
            },
            MarketSnapshot { timestamp: "2026-02-18T14:30:00Z".to_string(), prices },
            ExecutionState::default(),
        )
    }

    #[test]
    fn engine_hashes_and_evaluates() {
        let engine = PolicyEngine::from_str(BASE_POLICY).unwrap();
        assert_eq!(engine.policy_hash().len(), 64);
        let (portfolio, market, execution) = fixtures();
        let d = engine
            .evaluate(&intent("AAPL", Side::Buy, 10.0), &portfolio, &market, &execution)
            .unwrap();
        assert_eq!(d.decision, Verdict::Allow);
        assert!(d.eval_ms.is_some());
    }

    #[test]
    fn same_source_same_hash() {
        let a = PolicyEngine::from_str(BASE_POLICY).unwrap();
        let b = PolicyEngine::from_str(BASE_POLICY).unwrap();
        assert_eq!(a.policy_hash(), b.policy_hash());
    }
}
