//! Broker contract consumed by the stream runner.
//!
//! The runner owns the governance loop; brokers only move orders. No
//! retries live here: a broker error propagates out of the runner
//! (fail-loud) after an ORDER_REJECTED exec event is written.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::intent::{OrderIntent, OrderType, Side};
use crate::state::MarketSnapshot;

mod alpaca;
mod sim;
mod tradier;

pub use alpaca::AlpacaBroker;
pub use sim::SimBroker;
pub use tradier::TradierBroker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmitAck {
    pub order_id: String,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub intent_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub timestamp: String,
}

#[async_trait]
pub trait Broker: Send {
    /// Submit an order. Errors are fatal to the run.
    async fn submit(&mut self, intent: &OrderIntent, market: &MarketSnapshot) -> Result<SubmitAck>;

    /// Cancel a pending order; returns the resulting status.
    async fn cancel(&mut self, order_id: &str) -> Result<OrderStatus>;

    /// Fills for the given outstanding orders. Each fill is returned once.
    /// Implementations may answer from an account-wide call or poll per
    /// order.
    async fn poll_fills(&mut self, open_order_ids: &[String]) -> Result<Vec<Fill>>;

    /// Current view of one order, or None if the broker does not know it.
    async fn get_order(&mut self, order_id: &str) -> Result<Option<BrokerOrder>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Sim,
    Alpaca,
    Tradier,
}

impl BrokerKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "sim" => Ok(BrokerKind::Sim),
            "alpaca" => Ok(BrokerKind::Alpaca),
            "tradier" => Ok(BrokerKind::Tradier),
            other => anyhow::bail!("unknown broker '{}'", other),
        }
    }

    /// Construct the adapter. Live adapters read their credentials from the
    /// environment and fail here, not mid-run, when they are missing.
    pub fn build(self) -> Result<Box<dyn Broker + Send>> {
        match self {
            BrokerKind::Sim => Ok(Box::new(SimBroker::new())),
            BrokerKind::Alpaca => Ok(Box::new(AlpacaBroker::from_env()?)),
            BrokerKind::Tradier => Ok(Box::new(TradierBroker::from_env()?)),
        }
    }
}
