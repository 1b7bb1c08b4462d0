//! Deterministic simulated broker.
//!
//! Fill rules: market orders fill immediately at the snapshot price; a
//! limit buy fills iff `limit_price >= price`, a limit sell iff
//! `limit_price <= price`; anything else is rejected on the spot. No
//! partial fills, no slippage, no fees. Behavior is a pure function of
//! (intent, market snapshot), which is what makes replayed runs line up.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

use super::{Broker, BrokerOrder, Fill, OrderStatus, SubmitAck};
use crate::intent::{OrderIntent, OrderType, Side};
use crate::state::MarketSnapshot;

#[derive(Debug)]
pub struct SimBroker {
    orders: BTreeMap<String, BrokerOrder>,
    // order_id -> undelivered fill
    pending_fills: BTreeMap<String, Fill>,
    next_id: u64,
}

impl Default for SimBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBroker {
    pub fn new() -> Self {
        Self { orders: BTreeMap::new(), pending_fills: BTreeMap::new(), next_id: 1 }
    }

    fn crosses(intent: &OrderIntent, price: f64) -> bool {
        match (intent.order_type, intent.limit_price) {
            (OrderType::Market, _) => true,
            (OrderType::Limit, Some(limit)) => match intent.side {
                Side::Buy => limit >= price,
                Side::Sell => limit <= price,
            },
            (OrderType::Limit, None) => false,
        }
    }
}

#[async_trait]
impl Broker for SimBroker {
    async fn submit(&mut self, intent: &OrderIntent, market: &MarketSnapshot) -> Result<SubmitAck> {
        let symbol = &intent.instrument.symbol;
        let order_id = format!("SIM-{:06}", self.next_id);
        self.next_id += 1;

        let mut order = BrokerOrder {
            order_id: order_id.clone(),
            symbol: symbol.clone(),
            side: intent.side,
            qty: intent.qty,
            order_type: intent.order_type,
            limit_price: intent.limit_price,
            status: OrderStatus::Rejected,
        };

        if let Some(price) = market.valid_price(symbol) {
            if Self::crosses(intent, price) {
                order.status = OrderStatus::Filled;
                self.pending_fills.insert(
                    order_id.clone(),
                    Fill {
                        intent_id: intent.intent_id.clone(),
                        order_id: order_id.clone(),
                        symbol: symbol.clone(),
                        side: intent.side,
                        qty: intent.qty,
                        price,
                        timestamp: intent.timestamp.clone(),
                    },
                );
            }
        }

        let status = order.status;
        self.orders.insert(order_id.clone(), order);
        Ok(SubmitAck { order_id, status })
    }

    async fn cancel(&mut self, order_id: &str) -> Result<OrderStatus> {
        if let Some(order) = self.orders.get_mut(order_id) {
            if order.status == OrderStatus::Pending {
                order.status = OrderStatus::Cancelled;
            }
            Ok(order.status)
        } else {
            anyhow::bail!("unknown order '{}'", order_id)
        }
    }

    async fn poll_fills(&mut self, open_order_ids: &[String]) -> Result<Vec<Fill>> {
        let mut fills = Vec::new();
        for order_id in open_order_ids {
            if let Some(fill) = self.pending_fills.remove(order_id) {
                fills.push(fill);
            }
        }
        Ok(fills)
    }

    async fn get_order(&mut self, order_id: &str) -> Result<Option<BrokerOrder>> {
        Ok(self.orders.get(order_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::tests::intent;

    fn snapshot(price: f64) -> MarketSnapshot {
        let mut prices = BTreeMap::new();
        prices.insert("AAPL".to_string(), price);
        MarketSnapshot { timestamp: "2026-02-18T14:30:00Z".to_string(), prices }
    }

    #[tokio::test]
    async fn market_order_fills_at_snapshot_price() {
        let mut broker = SimBroker::new();
        let market = snapshot(200.0);
        let ack = broker.submit(&intent("AAPL", Side::Buy, 10.0), &market).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);

        let fills = broker.poll_fills(&[ack.order_id.clone()]).await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, 200.0);
        assert_eq!(fills[0].qty, 10.0);

        // fills are delivered once
        let again = broker.poll_fills(&[ack.order_id]).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn limit_orders_fill_only_when_crossing() {
        let mut broker = SimBroker::new();
        let market = snapshot(200.0);

        let mut crossing = intent("AAPL", Side::Buy, 5.0);
        crossing.order_type = OrderType::Limit;
        crossing.limit_price = Some(201.0);
        let ack = broker.submit(&crossing, &market).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);

        let mut resting = intent("AAPL", Side::Buy, 5.0);
        resting.order_type = OrderType::Limit;
        resting.limit_price = Some(199.0);
        let ack = broker.submit(&resting, &market).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Rejected);

        let order = broker.get_order(&ack.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn unknown_symbol_is_rejected() {
        let mut broker = SimBroker::new();
        let market = snapshot(200.0);
        let ack = broker.submit(&intent("MSFT", Side::Buy, 1.0), &market).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Rejected);
        assert!(broker.poll_fills(&[ack.order_id]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn order_ids_are_sequential() {
        let mut broker = SimBroker::new();
        let market = snapshot(200.0);
        let a = broker.submit(&intent("AAPL", Side::Buy, 1.0), &market).await.unwrap();
        let b = broker.submit(&intent("AAPL", Side::Sell, 1.0), &market).await.unwrap();
        assert_eq!(a.order_id, "SIM-000001");
        assert_eq!(b.order_id, "SIM-000002");
    }
}
