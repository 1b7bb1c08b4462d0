//! Capital policy model: strict schema, bounds validation, override
//! resolution, and source hashing.
//!
//! A policy is loaded once per process and never mutated. Unknown keys
//! anywhere in the tree are a load failure, as are out-of-range numerics.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const POLICY_VERSION: &str = "0.1";

const MAX_WINDOW_SECONDS: u64 = 365 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Enforce,
    Monitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DefaultDecision {
    #[default]
    Deny,
    Allow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExposureLimits {
    pub max_position_pct: f64,
    pub max_gross_exposure_x: f64,
    #[serde(default)]
    pub max_net_exposure_x: Option<f64>,
}

impl ExposureLimits {
    fn validate(&self, at: &str) -> Result<()> {
        if !(self.max_position_pct > 0.0 && self.max_position_pct <= 1.0) {
            bail!("{}: max_position_pct must be in (0, 1]", at);
        }
        if self.max_gross_exposure_x <= 0.0 {
            bail!("{}: max_gross_exposure_x must be > 0", at);
        }
        if let Some(net) = self.max_net_exposure_x {
            if net <= 0.0 {
                bail!("{}: max_net_exposure_x must be > 0", at);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LossLimits {
    pub daily_loss_limit_pct: f64,
    pub max_drawdown_pct: f64,
}

impl LossLimits {
    fn validate(&self, at: &str) -> Result<()> {
        if !(self.daily_loss_limit_pct > 0.0 && self.daily_loss_limit_pct <= 1.0) {
            bail!("{}: daily_loss_limit_pct must be in (0, 1]", at);
        }
        if !(self.max_drawdown_pct > 0.0 && self.max_drawdown_pct <= 1.0) {
            bail!("{}: max_drawdown_pct must be in (0, 1]", at);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionLimits {
    pub max_orders_per_minute_global: u32,
    pub max_orders_per_minute_by_strategy: u32,
}

impl ExecutionLimits {
    fn validate(&self, at: &str) -> Result<()> {
        for (name, v) in [
            ("max_orders_per_minute_global", self.max_orders_per_minute_global),
            ("max_orders_per_minute_by_strategy", self.max_orders_per_minute_by_strategy),
        ] {
            if !(1..=10_000).contains(&v) {
                bail!("{}: {} must be in [1, 10000]", at, name);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KillSwitchLimits {
    #[serde(default)]
    pub trip_on_rules: Vec<String>,
    pub trip_after_n_violations: u32,
    pub violation_window_seconds: u64,
}

impl KillSwitchLimits {
    fn validate(&self) -> Result<()> {
        if !(1..=10_000).contains(&self.trip_after_n_violations) {
            bail!("limits.kill_switch: trip_after_n_violations must be in [1, 10000]");
        }
        if !(1..=MAX_WINDOW_SECONDS).contains(&self.violation_window_seconds) {
            bail!(
                "limits.kill_switch: violation_window_seconds must be in [1, {}]",
                MAX_WINDOW_SECONDS
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Defaults {
    pub mode: Mode,
    pub decision: DefaultDecision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Limits {
    pub exposure: ExposureLimits,
    pub loss: LossLimits,
    pub execution: ExecutionLimits,
    pub kill_switch: KillSwitchLimits,
}

/// Partial limits block attached to a symbol or strategy. Any omitted
/// sub-block falls back to the defaults at resolution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct OverrideBlock {
    pub exposure: Option<ExposureLimits>,
    pub loss: Option<LossLimits>,
    pub execution: Option<ExecutionLimits>,
}

impl OverrideBlock {
    fn validate(&self, at: &str) -> Result<()> {
        if let Some(exp) = &self.exposure {
            exp.validate(at)?;
        }
        if let Some(loss) = &self.loss {
            loss.validate(at)?;
        }
        if let Some(exec) = &self.execution {
            exec.validate(at)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Overrides {
    pub symbols: BTreeMap<String, OverrideBlock>,
    pub strategies: BTreeMap<String, OverrideBlock>,
}

/// Limits in force for one (symbol, strategy) pair after override
/// resolution. Owned copies so rule evaluation never reaches back into the
/// policy tree.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveLimits {
    pub exposure: ExposureLimits,
    pub loss: LossLimits,
    pub execution: ExecutionLimits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapitalPolicy {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub defaults: Defaults,
    pub limits: Limits,
    #[serde(default)]
    pub overrides: Overrides,
}

fn default_version() -> String {
    POLICY_VERSION.to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl CapitalPolicy {
    /// Bounds-check every numeric field, including override sub-blocks.
    /// Structural problems (unknown keys, wrong shapes) are already rejected
    /// at deserialization.
    pub fn validate(&self) -> Result<()> {
        if self.version != POLICY_VERSION {
            bail!("policy version must be \"{}\", got \"{}\"", POLICY_VERSION, self.version);
        }
        if !self.timezone.eq_ignore_ascii_case("UTC") {
            bail!("v0.1 requires timezone: UTC, got \"{}\"", self.timezone);
        }
        self.limits.exposure.validate("limits.exposure")?;
        self.limits.loss.validate("limits.loss")?;
        self.limits.execution.validate("limits.execution")?;
        self.limits.kill_switch.validate()?;
        for (symbol, block) in &self.overrides.symbols {
            block.validate(&format!("overrides.symbols.{}", symbol))?;
        }
        for (strategy, block) in &self.overrides.strategies {
            block.validate(&format!("overrides.strategies.{}", strategy))?;
        }
        Ok(())
    }

    /// Effective limits for one intent. Each sub-block independently picks
    /// the first of: symbol override, strategy override, defaults.
    pub fn resolve(&self, symbol: &str, strategy_id: &str) -> EffectiveLimits {
        let sym = self.overrides.symbols.get(symbol);
        let strat = self.overrides.strategies.get(strategy_id);

        let exposure = sym
            .and_then(|b| b.exposure.as_ref())
            .or_else(|| strat.and_then(|b| b.exposure.as_ref()))
            .unwrap_or(&self.limits.exposure)
            .clone();
        let loss = sym
            .and_then(|b| b.loss.as_ref())
            .or_else(|| strat.and_then(|b| b.loss.as_ref()))
            .unwrap_or(&self.limits.loss)
            .clone();
        let execution = sym
            .and_then(|b| b.execution.as_ref())
            .or_else(|| strat.and_then(|b| b.execution.as_ref()))
            .unwrap_or(&self.limits.execution)
            .clone();

        EffectiveLimits { exposure, loss, execution }
    }
}

/// Parse and validate a policy from YAML source.
pub fn load_policy_str(raw: &str) -> Result<CapitalPolicy> {
    let policy: CapitalPolicy =
        serde_yaml::from_str(raw).context("policy YAML does not match the v0.1 schema")?;
    policy.validate()?;
    Ok(policy)
}

/// SHA-256 hex digest of the raw policy source bytes. Recorded on every
/// audit event so replays can pin which policy was in force.
pub fn policy_hash(raw: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const BASE_POLICY: &str = r#"
version: "0.1"
timezone: UTC
defaults:
  mode: enforce
  decision: deny
limits:
  exposure:
    max_position_pct: 0.25
    max_gross_exposure_x: 2.0
    max_net_exposure_x: 1.5
  loss:
    daily_loss_limit_pct: 0.03
    max_drawdown_pct: 0.10
  execution:
    max_orders_per_minute_global: 60
    max_orders_per_minute_by_strategy: 20
  kill_switch:
    trip_on_rules: ["LOSS-002"]
    trip_after_n_violations: 5
    violation_window_seconds: 300
"#;

    #[test]
    fn loads_base_policy() {
        let p = load_policy_str(BASE_POLICY).unwrap();
        assert_eq!(p.version, "0.1");
        assert_eq!(p.defaults.mode, Mode::Enforce);
        assert_eq!(p.limits.exposure.max_position_pct, 0.25);
        assert_eq!(p.limits.kill_switch.trip_on_rules, vec!["LOSS-002"]);
    }

    #[test]
    fn rejects_unknown_key() {
        let raw = BASE_POLICY.replace("timezone: UTC", "timezone: UTC\nsurprise: 1");
        assert!(load_policy_str(&raw).is_err());
    }

    #[test]
    fn rejects_unknown_nested_key() {
        let raw = BASE_POLICY.replace("max_drawdown_pct: 0.10", "max_drawdown_pct: 0.10\n    extra: 2");
        assert!(load_policy_str(&raw).is_err());
    }

    #[test]
    fn rejects_wrong_version() {
        let raw = BASE_POLICY.replace("version: \"0.1\"", "version: \"0.2\"");
        assert!(load_policy_str(&raw).is_err());
    }

    #[test]
    fn timezone_is_case_insensitive_utc_only() {
        let raw = BASE_POLICY.replace("timezone: UTC", "timezone: utc");
        assert!(load_policy_str(&raw).is_ok());
        let raw = BASE_POLICY.replace("timezone: UTC", "timezone: America/New_York");
        assert!(load_policy_str(&raw).is_err());
    }

    #[test]
    fn rejects_out_of_range_numerics() {
        for (from, to) in [
            ("max_position_pct: 0.25", "max_position_pct: 0.0"),
            ("max_position_pct: 0.25", "max_position_pct: 1.5"),
            ("max_gross_exposure_x: 2.0", "max_gross_exposure_x: -1.0"),
            ("daily_loss_limit_pct: 0.03", "daily_loss_limit_pct: 1.01"),
            ("max_orders_per_minute_global: 60", "max_orders_per_minute_global: 0"),
            ("max_orders_per_minute_global: 60", "max_orders_per_minute_global: 20000"),
            ("trip_after_n_violations: 5", "trip_after_n_violations: 0"),
            ("violation_window_seconds: 300", "violation_window_seconds: 99999999"),
        ] {
            let raw = BASE_POLICY.replace(from, to);
            assert!(load_policy_str(&raw).is_err(), "accepted {}", to);
        }
    }

    #[test]
    fn defaults_block_is_optional() {
        let raw = BASE_POLICY.replace("defaults:\n  mode: enforce\n  decision: deny\n", "");
        let p = load_policy_str(&raw).unwrap();
        assert_eq!(p.defaults.mode, Mode::Enforce);
        assert_eq!(p.defaults.decision, DefaultDecision::Deny);
    }

    fn policy_with_overrides() -> CapitalPolicy {
        let raw = format!(
            "{}\noverrides:\n  symbols:\n    TSLA:\n      exposure:\n        max_position_pct: 0.05\n        max_gross_exposure_x: 1.0\n  strategies:\n    momo:\n      exposure:\n        max_position_pct: 0.10\n        max_gross_exposure_x: 1.5\n      execution:\n        max_orders_per_minute_global: 10\n        max_orders_per_minute_by_strategy: 5\n",
            BASE_POLICY.trim_end()
        );
        load_policy_str(&raw).unwrap()
    }

    #[test]
    fn symbol_override_beats_strategy_override() {
        let p = policy_with_overrides();
        let eff = p.resolve("TSLA", "momo");
        assert_eq!(eff.exposure.max_position_pct, 0.05);
        // symbol block omits execution, so the strategy override applies
        assert_eq!(eff.execution.max_orders_per_minute_global, 10);
        // nobody overrides loss
        assert_eq!(eff.loss.max_drawdown_pct, 0.10);
    }

    #[test]
    fn strategy_override_beats_defaults() {
        let p = policy_with_overrides();
        let eff = p.resolve("AAPL", "momo");
        assert_eq!(eff.exposure.max_position_pct, 0.10);
        assert_eq!(eff.execution.max_orders_per_minute_by_strategy, 5);
    }

    #[test]
    fn defaults_apply_without_overrides() {
        let p = policy_with_overrides();
        let eff = p.resolve("AAPL", "meanrev");
        assert_eq!(eff.exposure.max_position_pct, 0.25);
        assert_eq!(eff.execution.max_orders_per_minute_global, 60);
    }

    #[test]
    fn override_blocks_are_bounds_checked() {
        let raw = format!(
            "{}\noverrides:\n  symbols:\n    TSLA:\n      exposure:\n        max_position_pct: 2.0\n        max_gross_exposure_x: 1.0\n",
            BASE_POLICY.trim_end()
        );
        assert!(load_policy_str(&raw).is_err());
    }

    #[test]
    fn hash_is_stable_and_source_sensitive() {
        let a = policy_hash(BASE_POLICY.as_bytes());
        let b = policy_hash(BASE_POLICY.as_bytes());
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let c = policy_hash(BASE_POLICY.replace("0.25", "0.30").as_bytes());
        assert_ne!(a, c);
    }
}
