//! Order intents: proposed orders awaiting governance approval.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::state::parse_epoch_seconds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// +1 for buy, -1 for sell.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Equity,
    Crypto,
    Fx,
    Futures,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Instrument {
    pub symbol: String,
    pub asset_class: AssetClass,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderIntent {
    pub intent_id: String,
    /// RFC 3339 UTC.
    pub timestamp: String,
    pub strategy_id: String,
    pub account_id: String,
    pub instrument: Instrument,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: f64,
    #[serde(default)]
    pub limit_price: Option<f64>,
}

impl OrderIntent {
    /// Bounds and invariants serde cannot express. Runs at evaluation entry
    /// and on every CLI/replay load path.
    pub fn validate(&self) -> Result<()> {
        if !(self.qty > 0.0) {
            bail!("intent {}: qty must be > 0", self.intent_id);
        }
        match (self.order_type, self.limit_price) {
            (OrderType::Limit, None) => {
                bail!("intent {}: limit order requires limit_price", self.intent_id)
            }
            (_, Some(p)) if p < 0.0 => {
                bail!("intent {}: limit_price must be >= 0", self.intent_id)
            }
            _ => {}
        }
        parse_epoch_seconds(&self.timestamp)
            .map_err(|e| anyhow::anyhow!("intent {}: {}", self.intent_id, e))?;
        Ok(())
    }

    /// Copy of this intent with a reduced quantity, for MODIFY decisions.
    pub fn with_qty(&self, qty: f64) -> OrderIntent {
        OrderIntent { qty, ..self.clone() }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn intent(symbol: &str, side: Side, qty: f64) -> OrderIntent {
        OrderIntent {
            intent_id: format!("INT-{}-{}", symbol, qty),
            timestamp: "2026-02-18T14:30:00Z".to_string(),
            strategy_id: "momo".to_string(),
            account_id: "ACC-1".to_string(),
            instrument: Instrument {
                symbol: symbol.to_string(),
                asset_class: AssetClass::Equity,
            },
            side,
            order_type: OrderType::Market,
            qty,
            limit_price: None,
        }
    }

    #[test]
    fn rejects_non_positive_qty() {
        assert!(intent("AAPL", Side::Buy, 0.0).validate().is_err());
        assert!(intent("AAPL", Side::Buy, -1.0).validate().is_err());
        assert!(intent("AAPL", Side::Buy, 1.0).validate().is_ok());
    }

    #[test]
    fn limit_order_requires_price() {
        let mut i = intent("AAPL", Side::Buy, 10.0);
        i.order_type = OrderType::Limit;
        assert!(i.validate().is_err());
        i.limit_price = Some(199.5);
        assert!(i.validate().is_ok());
        i.limit_price = Some(-1.0);
        assert!(i.validate().is_err());
    }

    #[test]
    fn rejects_unparseable_timestamp() {
        let mut i = intent("AAPL", Side::Buy, 10.0);
        i.timestamp = "yesterday".to_string();
        assert!(i.validate().is_err());
    }

    #[test]
    fn rejects_unknown_fields() {
        let raw = r#"{"intent_id":"I1","timestamp":"2026-02-18T14:30:00Z","strategy_id":"s","account_id":"a","instrument":{"symbol":"AAPL","asset_class":"equity"},"side":"buy","order_type":"market","qty":1.0,"color":"red"}"#;
        assert!(serde_json::from_str::<OrderIntent>(raw).is_err());
    }
}
