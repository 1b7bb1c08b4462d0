//! Portfolio, market, and execution state consumed by the evaluator and
//! evolved by the stream runner.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Current UTC time, RFC 3339 with microseconds. Audit and exec events use
/// this single formatter so the two logs line up.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 timestamp into epoch seconds.
pub fn parse_epoch_seconds(ts: &str) -> Result<i64> {
    let dt = DateTime::parse_from_rfc3339(ts)
        .with_context(|| format!("not an RFC 3339 timestamp: \"{}\"", ts))?;
    Ok(dt.timestamp())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortfolioState {
    pub equity: f64,
    pub start_of_day_equity: f64,
    pub peak_equity: f64,
    #[serde(default)]
    pub positions: BTreeMap<String, f64>,
}

impl PortfolioState {
    pub fn validate(&self) -> Result<()> {
        if !(self.equity > 0.0) {
            bail!("portfolio: equity must be > 0");
        }
        if !(self.start_of_day_equity > 0.0) {
            bail!("portfolio: start_of_day_equity must be > 0");
        }
        if !(self.peak_equity > 0.0) {
            bail!("portfolio: peak_equity must be > 0");
        }
        Ok(())
    }

    pub fn position(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarketSnapshot {
    /// RFC 3339 UTC.
    pub timestamp: String,
    #[serde(default)]
    pub prices: BTreeMap<String, f64>,
}

impl MarketSnapshot {
    /// A price entry is valid only if present and strictly positive.
    pub fn valid_price(&self, symbol: &str) -> Option<f64> {
        self.prices.get(symbol).copied().filter(|p| *p > 0.0)
    }
}

/// One fired violation stamped with its intent's epoch-second timestamp,
/// held in the rolling kill-switch window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ViolationStamp {
    pub rule_id: String,
    pub timestamp_epoch_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct ExecutionState {
    pub orders_last_minute_global: u32,
    pub orders_last_minute_by_strategy: BTreeMap<String, u32>,
    pub violations_in_window: Vec<ViolationStamp>,
    pub kill_switch_active: bool,
}

impl ExecutionState {
    pub fn strategy_orders(&self, strategy_id: &str) -> u32 {
        self.orders_last_minute_by_strategy
            .get(strategy_id)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portfolio_bounds() {
        let mut p = PortfolioState {
            equity: 100_000.0,
            start_of_day_equity: 100_000.0,
            peak_equity: 100_000.0,
            positions: BTreeMap::new(),
        };
        assert!(p.validate().is_ok());
        p.equity = 0.0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn invalid_prices_are_absent() {
        let mut prices = BTreeMap::new();
        prices.insert("AAPL".to_string(), 200.0);
        prices.insert("ZERO".to_string(), 0.0);
        prices.insert("NEG".to_string(), -3.0);
        let m = MarketSnapshot { timestamp: "2026-02-18T14:30:00Z".to_string(), prices };
        assert_eq!(m.valid_price("AAPL"), Some(200.0));
        assert_eq!(m.valid_price("ZERO"), None);
        assert_eq!(m.valid_price("NEG"), None);
        assert_eq!(m.valid_price("MISSING"), None);
    }

    #[test]
    fn empty_execution_state_deserializes() {
        let e: ExecutionState = serde_json::from_str("{}").unwrap();
        assert_eq!(e.orders_last_minute_global, 0);
        assert!(!e.kill_switch_active);
    }

    #[test]
    fn epoch_parsing() {
        assert_eq!(parse_epoch_seconds("1970-01-01T00:01:00Z").unwrap(), 60);
        assert!(parse_epoch_seconds("not-a-time").is_err());
    }
}
