//! Paper trading venue: simulated balances and resting orders, with market
//! data optionally delegated to a real (read-only) venue client.

use crate::domain::ports::VenueClient;
use crate::domain::types::{base_asset, Kline, OpenOrder, OrderSide};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct PaperVenueClient {
    next_id: AtomicU64,
    balances: Mutex<HashMap<String, Decimal>>,
    open_orders: Mutex<HashMap<String, Vec<OpenOrder>>>,
    /// Real venue used for klines only; never receives orders.
    data_source: Option<Arc<dyn VenueClient>>,
}

impl PaperVenueClient {
    pub fn new(initial_usdt: f64, data_source: Option<Arc<dyn VenueClient>>) -> Self {
        info!("PaperVenueClient: starting with ${:.2} USDT", initial_usdt);
        let mut balances = HashMap::new();
        balances.insert(
            "USDT".to_string(),
            Decimal::from_f64(initial_usdt).unwrap_or_default(),
        );
        Self {
            next_id: AtomicU64::new(1),
            balances: Mutex::new(balances),
            open_orders: Mutex::new(HashMap::new()),
            data_source,
        }
    }

    /// Simulate fills: every resting order crossed by `price` executes and
    /// the balances move accordingly.
    pub async fn mark_price(&self, symbol: &str, price: Decimal) {
        let filled: Vec<OpenOrder> = {
            let mut orders = self.open_orders.lock().await;
            let Some(list) = orders.get_mut(symbol) else {
                return;
            };
            let (filled, resting): (Vec<OpenOrder>, Vec<OpenOrder>) =
                list.drain(..).partition(|o| match o.side {
                    OrderSide::Buy => price <= o.price,
                    OrderSide::Sell => price >= o.price,
                });
            *list = resting;
            filled
        };

        if filled.is_empty() {
            return;
        }

        let base = base_asset(symbol).to_string();
        let mut balances = self.balances.lock().await;
        for order in filled {
            let notional = order.price * order.quantity;
            match order.side {
                OrderSide::Buy => {
                    *balances.entry("USDT".to_string()).or_default() -= notional;
                    *balances.entry(base.clone()).or_default() += order.quantity;
                }
                OrderSide::Sell => {
                    *balances.entry("USDT".to_string()).or_default() += notional;
                    *balances.entry(base.clone()).or_default() -= order.quantity;
                }
            }
            debug!(
                "PaperVenueClient: filled {} {} {}@{}",
                order.side, symbol, order.quantity, order.price
            );
        }
    }
}

#[async_trait]
impl VenueClient for PaperVenueClient {
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>> {
        Ok(self
            .open_orders
            .lock()
            .await
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<String> {
        let order_id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.open_orders
            .lock()
            .await
            .entry(symbol.to_string())
            .or_default()
            .push(OpenOrder {
                order_id: order_id.clone(),
                symbol: symbol.to_string(),
                side,
                price,
                quantity,
                created_at: Utc::now(),
            });
        debug!(
            "PaperVenueClient: accepted {} {} {}@{} as {}",
            side, symbol, quantity, price, order_id
        );
        Ok(order_id)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let mut orders = self.open_orders.lock().await;
        if let Some(list) = orders.get_mut(symbol) {
            let before = list.len();
            list.retain(|o| o.order_id != order_id);
            if list.len() < before {
                return Ok(());
            }
        }
        anyhow::bail!("unknown paper order {} for {}", order_id, symbol)
    }

    async fn get_account_balance(&self, asset: &str) -> Result<Decimal> {
        Ok(self
            .balances
            .lock()
            .await
            .get(asset)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        match &self.data_source {
            Some(source) => source.get_klines(symbol, interval, limit).await,
            None => Ok(Vec::new()),
        }
    }
}
