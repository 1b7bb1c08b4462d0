//! Tradier brokerage API adapter (sandbox by default).
//!
//! Credentials come from the environment: `TRADIER_TOKEN`,
//! `TRADIER_ACCOUNT_ID`, `TRADIER_ENV` ("sandbox" or "live"). Fill polling
//! prefers one account-wide orders call and falls back to per-order
//! requests when that fails. The order `tag` carries the intent id so
//! fills correlate back to the audit log.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::{Broker, BrokerOrder, Fill, OrderStatus, SubmitAck};
use crate::intent::{OrderIntent, OrderType, Side};
use crate::state::MarketSnapshot;

const SANDBOX_BASE: &str = "https://sandbox.tradier.com";
const LIVE_BASE: &str = "https://api.tradier.com";

pub struct TradierBroker {
    client: Client,
    base: String,
    token: String,
    account_id: String,
}

fn map_status(tradier: &str) -> OrderStatus {
    match tradier {
        "filled" => OrderStatus::Filled,
        "expired" | "canceled" => OrderStatus::Cancelled,
        "rejected" => OrderStatus::Rejected,
        _ => OrderStatus::Pending,
    }
}

fn str_field<'a>(raw: &'a Value, key: &str) -> &'a str {
    raw.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

fn num_field(raw: &Value, key: &str) -> f64 {
    match raw.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

impl TradierBroker {
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("TRADIER_TOKEN")
            .map_err(|_| anyhow!("Tradier credentials required: set TRADIER_TOKEN"))?;
        let account_id = std::env::var("TRADIER_ACCOUNT_ID")
            .map_err(|_| anyhow!("Tradier credentials required: set TRADIER_ACCOUNT_ID"))?;
        let env = std::env::var("TRADIER_ENV").unwrap_or_else(|_| "sandbox".to_string());
        let base = match env.as_str() {
            "sandbox" => SANDBOX_BASE,
            "live" => LIVE_BASE,
            other => bail!("TRADIER_ENV must be 'sandbox' or 'live', got '{}'", other),
        };
        Ok(Self { client: Client::new(), base: base.to_string(), token, account_id })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base, path))
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
    }

    async fn fetch_raw_order(&self, order_id: &str) -> Result<Value> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/accounts/{}/orders/{}", self.account_id, order_id),
            )
            .send()
            .await?
            .error_for_status()?;
        let body: Value = resp.json().await?;
        Ok(body.get("order").cloned().unwrap_or(Value::Null))
    }

    fn raw_to_order(raw: &Value, fallback_id: &str) -> BrokerOrder {
        let order_type =
            if str_field(raw, "type") == "limit" { OrderType::Limit } else { OrderType::Market };
        let order_id = match raw.get("id") {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) => s.clone(),
            _ => fallback_id.to_string(),
        };
        BrokerOrder {
            order_id,
            symbol: str_field(raw, "symbol").to_string(),
            side: if str_field(raw, "side") == "sell" { Side::Sell } else { Side::Buy },
            qty: num_field(raw, "quantity"),
            order_type,
            limit_price: match order_type {
                OrderType::Limit => Some(num_field(raw, "price")),
                OrderType::Market => None,
            },
            status: map_status(str_field(raw, "status")),
        }
    }

    fn raw_to_fill(raw: &Value, order_id: String) -> Fill {
        let qty = match raw.get("exec_quantity") {
            Some(_) => num_field(raw, "exec_quantity"),
            None => num_field(raw, "quantity"),
        };
        let timestamp = match str_field(raw, "last_fill_timestamp") {
            "" => str_field(raw, "create_date").to_string(),
            ts => ts.to_string(),
        };
        Fill {
            intent_id: str_field(raw, "tag").to_string(),
            order_id,
            symbol: str_field(raw, "symbol").to_string(),
            side: if str_field(raw, "side") == "sell" { Side::Sell } else { Side::Buy },
            qty,
            price: num_field(raw, "avg_fill_price"),
            timestamp,
        }
    }

    /// Account-wide polling: one GET for all orders, filtered to the
    /// caller's outstanding set.
    async fn poll_account_level(&self, open_order_ids: &[String]) -> Result<Vec<Fill>> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/v1/accounts/{}/orders", self.account_id))
            .send()
            .await?
            .error_for_status()?;
        let body: Value = resp.json().await?;

        // Tradier answers {"orders": {"order": [...]}}, a bare object for a
        // single order, or {"orders": "null"} when there are none.
        let orders = body.get("orders").cloned().unwrap_or(Value::Null);
        let raw_orders: Vec<Value> = match orders.get("order") {
            Some(Value::Array(list)) => list.clone(),
            Some(single @ Value::Object(_)) => vec![single.clone()],
            _ => Vec::new(),
        };

        let mut fills = Vec::new();
        for raw in &raw_orders {
            let order_id = match raw.get("id") {
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::String(s)) => s.clone(),
                _ => continue,
            };
            if !open_order_ids.contains(&order_id) {
                continue;
            }
            if map_status(str_field(raw, "status")) == OrderStatus::Filled {
                fills.push(Self::raw_to_fill(raw, order_id));
            }
        }
        Ok(fills)
    }

    async fn poll_per_order(&self, open_order_ids: &[String]) -> Result<Vec<Fill>> {
        let mut fills = Vec::new();
        for order_id in open_order_ids {
            let raw = self.fetch_raw_order(order_id).await?;
            if map_status(str_field(&raw, "status")) == OrderStatus::Filled {
                fills.push(Self::raw_to_fill(&raw, order_id.clone()));
            }
        }
        Ok(fills)
    }
}

#[async_trait]
impl Broker for TradierBroker {
    async fn submit(&mut self, intent: &OrderIntent, _market: &MarketSnapshot) -> Result<SubmitAck> {
        let mut form: Vec<(&str, String)> = vec![
            ("class", "equity".to_string()),
            ("symbol", intent.instrument.symbol.clone()),
            ("side", intent.side.as_str().to_string()),
            ("quantity", format!("{}", intent.qty as i64)),
            ("type", intent.order_type.as_str().to_string()),
            ("duration", "day".to_string()),
            ("tag", intent.intent_id.clone()),
        ];
        if intent.order_type == OrderType::Limit {
            let limit = intent
                .limit_price
                .ok_or_else(|| anyhow!("limit order {} requires a limit_price", intent.intent_id))?;
            form.push(("price", limit.to_string()));
        }

        let resp = self
            .request(reqwest::Method::POST, &format!("/v1/accounts/{}/orders", self.account_id))
            .form(&form)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = resp.json().await?;

        let order = body.get("order").cloned().unwrap_or(Value::Null);
        let order_id = match order.get("id") {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => bail!("Tradier did not return an order id: {}", body),
        };
        let status = match str_field(&order, "status") {
            "" => OrderStatus::Pending,
            s => map_status(s),
        };
        Ok(SubmitAck { order_id, status })
    }

    async fn cancel(&mut self, order_id: &str) -> Result<OrderStatus> {
        self.request(
            reqwest::Method::DELETE,
            &format!("/v1/accounts/{}/orders/{}", self.account_id, order_id),
        )
        .send()
        .await?
        .error_for_status()?;
        Ok(OrderStatus::Cancelled)
    }

    async fn poll_fills(&mut self, open_order_ids: &[String]) -> Result<Vec<Fill>> {
        match self.poll_account_level(open_order_ids).await {
            Ok(fills) => Ok(fills),
            Err(_) => self.poll_per_order(open_order_ids).await,
        }
    }

    async fn get_order(&mut self, order_id: &str) -> Result<Option<BrokerOrder>> {
        let raw = self.fetch_raw_order(order_id).await?;
        if raw.is_null() {
            return Ok(None);
        }
        Ok(Some(Self::raw_to_order(&raw, order_id)))
    }
}
