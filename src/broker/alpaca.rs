//! Alpaca trading API adapter (paper by default).
//!
//! Credentials come from the environment: `APCA_API_KEY_ID`,
//! `APCA_API_SECRET_KEY`, and `APCA_PAPER` ("false" targets the live API).
//! Polling is per-order: each outstanding order id is queried and turned
//! into a `Fill` once its status reaches `filled`.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{Broker, BrokerOrder, Fill, OrderStatus, SubmitAck};
use crate::intent::{OrderIntent, OrderType, Side};
use crate::state::MarketSnapshot;

const PAPER_BASE: &str = "https://paper-api.alpaca.markets";
const LIVE_BASE: &str = "https://api.alpaca.markets";

pub struct AlpacaBroker {
    client: Client,
    base: String,
    api_key: String,
    secret_key: String,
}

#[derive(Deserialize, Debug)]
struct AlpacaOrder {
    id: String,
    client_order_id: String,
    symbol: String,
    side: String,
    #[serde(default)]
    qty: Option<String>,
    #[serde(rename = "type")]
    order_type: String,
    #[serde(default)]
    limit_price: Option<String>,
    status: String,
    #[serde(default)]
    filled_qty: Option<String>,
    #[serde(default)]
    filled_avg_price: Option<String>,
    #[serde(default)]
    filled_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

fn map_status(alpaca: &str) -> OrderStatus {
    match alpaca {
        "filled" => OrderStatus::Filled,
        "canceled" | "expired" => OrderStatus::Cancelled,
        "rejected" => OrderStatus::Rejected,
        _ => OrderStatus::Pending,
    }
}

fn parse_f64(s: &Option<String>) -> f64 {
    s.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0.0)
}

impl AlpacaBroker {
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("APCA_API_KEY_ID")
            .map_err(|_| anyhow!("Alpaca credentials required: set APCA_API_KEY_ID"))?;
        let secret_key = std::env::var("APCA_API_SECRET_KEY")
            .map_err(|_| anyhow!("Alpaca credentials required: set APCA_API_SECRET_KEY"))?;
        let paper = std::env::var("APCA_PAPER")
            .map(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "no"))
            .unwrap_or(true);
        Ok(Self {
            client: Client::new(),
            base: if paper { PAPER_BASE } else { LIVE_BASE }.to_string(),
            api_key,
            secret_key,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base, path))
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
    }

    async fn fetch_order(&self, order_id: &str) -> Result<AlpacaOrder> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/v2/orders/{}", order_id))
            .send()
            .await?
            .error_for_status()?;
        resp.json().await.context("Alpaca order response did not parse")
    }

    fn to_broker_order(raw: &AlpacaOrder) -> BrokerOrder {
        BrokerOrder {
            order_id: raw.id.clone(),
            symbol: raw.symbol.clone(),
            side: if raw.side == "sell" { Side::Sell } else { Side::Buy },
            qty: parse_f64(&raw.qty),
            order_type: if raw.order_type == "limit" { OrderType::Limit } else { OrderType::Market },
            limit_price: raw.limit_price.as_deref().and_then(|p| p.parse().ok()),
            status: map_status(&raw.status),
        }
    }
}

#[async_trait]
impl Broker for AlpacaBroker {
    async fn submit(&mut self, intent: &OrderIntent, _market: &MarketSnapshot) -> Result<SubmitAck> {
        let mut body = serde_json::json!({
            "symbol": intent.instrument.symbol,
            "qty": intent.qty.to_string(),
            "side": intent.side.as_str(),
            "type": intent.order_type.as_str(),
            "time_in_force": "day",
            "client_order_id": intent.intent_id,
        });
        if intent.order_type == OrderType::Limit {
            let limit = intent
                .limit_price
                .ok_or_else(|| anyhow!("limit order {} requires a limit_price", intent.intent_id))?;
            body["limit_price"] = serde_json::json!(limit.to_string());
        }

        let resp = self
            .request(reqwest::Method::POST, "/v2/orders")
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let order: AlpacaOrder = resp.json().await.context("Alpaca submit response did not parse")?;
        Ok(SubmitAck { order_id: order.id.clone(), status: map_status(&order.status) })
    }

    async fn cancel(&mut self, order_id: &str) -> Result<OrderStatus> {
        self.request(reqwest::Method::DELETE, &format!("/v2/orders/{}", order_id))
            .send()
            .await?
            .error_for_status()?;
        Ok(OrderStatus::Cancelled)
    }

    async fn poll_fills(&mut self, open_order_ids: &[String]) -> Result<Vec<Fill>> {
        let mut fills = Vec::new();
        for order_id in open_order_ids {
            let raw = self.fetch_order(order_id).await?;
            if map_status(&raw.status) != OrderStatus::Filled {
                continue;
            }
            let timestamp = raw
                .filled_at
                .clone()
                .or_else(|| raw.updated_at.clone())
                .unwrap_or_default();
            fills.push(Fill {
                intent_id: raw.client_order_id.clone(),
                order_id: raw.id.clone(),
                symbol: raw.symbol.clone(),
                side: if raw.side == "sell" { Side::Sell } else { Side::Buy },
                qty: parse_f64(&raw.filled_qty),
                price: parse_f64(&raw.filled_avg_price),
                timestamp,
            });
        }
        Ok(fills)
    }

    async fn get_order(&mut self, order_id: &str) -> Result<Option<BrokerOrder>> {
        match self.fetch_order(order_id).await {
            Ok(raw) => Ok(Some(Self::to_broker_order(&raw))),
            Err(e) => Err(e),
        }
    }
}
