//! Per-symbol grid mechanics: level placement, fill detection and mirror
//! follow-ups.
//!
//! The engine owns one `GridState` (cohort x symbol) and talks to the venue
//! through the shared client. A fill is detected when an order tracked in
//! state is no longer resting on the venue's book; the engine then re-arms
//! the opposite side one grid step away. When that follow-up placement
//! fails, the original order stays in state annotated `failed_followup` so
//! the monitoring layer can surface it.

use crate::domain::grid::{GridBounds, GridFill, GridOrder, GridState};
use crate::domain::ports::VenueClient;
use crate::domain::regime::GridBias;
use crate::domain::types::OrderSide;
use anyhow::Result;
use chrono::Utc;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Venue floor: levels below this notional are not placed.
pub const MIN_NOTIONAL_USD: f64 = 5.0;

pub struct GridEngine {
    symbol: String,
    cohort_name: String,
    grid_range_percent: f64,
    num_grids: usize,
    state: GridState,
}

impl GridEngine {
    pub fn new(symbol: &str, cohort_name: &str, grid_range_percent: f64, num_grids: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            cohort_name: cohort_name.to_string(),
            grid_range_percent,
            num_grids,
            state: GridState::new(
                symbol,
                GridBounds {
                    lower: Decimal::ZERO,
                    upper: Decimal::ZERO,
                },
                Utc::now(),
            ),
        }
    }

    /// Rebuild an engine from a persisted state file.
    pub fn from_state(
        state: GridState,
        cohort_name: &str,
        grid_range_percent: f64,
        num_grids: usize,
    ) -> Self {
        Self {
            symbol: state.symbol.clone(),
            cohort_name: cohort_name.to_string(),
            grid_range_percent,
            num_grids,
            state,
        }
    }

    pub fn state(&self) -> &GridState {
        &self.state
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn has_open_orders(&self) -> bool {
        !self.state.active_orders.is_empty()
    }

    /// Price distance between adjacent levels, as a fraction.
    fn spacing_fraction(&self) -> f64 {
        self.grid_range_percent / 100.0 / self.num_grids.max(1) as f64
    }

    /// Level counts per side. The bias shifts one level from the light side
    /// onto the heavy side, never emptying either side.
    fn level_counts(&self, bias: GridBias) -> (usize, usize) {
        let n = self.num_grids.max(1);
        match bias {
            GridBias::Balanced => (n, n),
            GridBias::BuyHeavy => (n + 1, n.saturating_sub(1).max(1)),
            GridBias::SellHeavy => (n.saturating_sub(1).max(1), n + 1),
        }
    }

    /// Place the full ladder around `anchor_price`, splitting
    /// `allocation_usd` evenly across levels. Levels under the notional
    /// floor are skipped. Returns the number of orders placed.
    pub async fn open_grid(
        &mut self,
        venue: &dyn VenueClient,
        anchor_price: Decimal,
        allocation_usd: f64,
        bias: GridBias,
    ) -> Result<usize> {
        let (num_buys, num_sells) = self.level_counts(bias);
        let total_levels = num_buys + num_sells;
        let level_usd = allocation_usd / total_levels as f64;

        if level_usd < MIN_NOTIONAL_USD {
            warn!(
                "GridEngine[{}:{}]: ${:.2} per level is below the {}$ notional floor, grid not opened",
                self.cohort_name, self.symbol, level_usd, MIN_NOTIONAL_USD
            );
            return Ok(0);
        }

        let spacing = Decimal::from_f64(self.spacing_fraction()).unwrap_or_default();
        let mut placed = 0;

        let mut levels: Vec<(OrderSide, Decimal)> = Vec::with_capacity(total_levels);
        for i in 1..=num_buys {
            let price = anchor_price * (Decimal::ONE - spacing * Decimal::from(i as u32));
            levels.push((OrderSide::Buy, price.round_dp(2)));
        }
        for i in 1..=num_sells {
            let price = anchor_price * (Decimal::ONE + spacing * Decimal::from(i as u32));
            levels.push((OrderSide::Sell, price.round_dp(2)));
        }

        for (side, price) in levels {
            if price <= Decimal::ZERO {
                continue;
            }
            let quantity = (Decimal::from_f64(level_usd).unwrap_or_default() / price).round_dp(6);
            if quantity <= Decimal::ZERO {
                continue;
            }

            match venue.place_order(&self.symbol, side, quantity, price).await {
                Ok(order_id) => {
                    self.state.active_orders.insert(
                        order_id,
                        GridOrder {
                            side,
                            price,
                            quantity,
                            created_at: Utc::now(),
                            failed_followup: false,
                        },
                    );
                    placed += 1;
                }
                Err(e) => {
                    warn!(
                        "GridEngine[{}:{}]: failed to place {} level at {}: {}",
                        self.cohort_name, self.symbol, side, price, e
                    );
                }
            }
        }

        let lower = anchor_price
            * (Decimal::ONE - spacing * Decimal::from(num_buys as u32));
        let upper = anchor_price
            * (Decimal::ONE + spacing * Decimal::from(num_sells as u32));
        self.state.bounds = GridBounds {
            lower: lower.round_dp(2),
            upper: upper.round_dp(2),
        };
        self.state.timestamp = Utc::now();

        info!(
            "GridEngine[{}:{}]: grid opened with {} orders around {} ({:?})",
            self.cohort_name, self.symbol, placed, anchor_price, bias
        );
        Ok(placed)
    }

    /// Detect fills and place mirror follow-ups. An order tracked in state
    /// but absent from the venue's open orders is treated as filled.
    pub async fn sync_fills(&mut self, venue: &dyn VenueClient) -> Result<Vec<GridFill>> {
        if self.state.active_orders.is_empty() {
            return Ok(Vec::new());
        }

        let open_ids: HashSet<String> = venue
            .get_open_orders(&self.symbol)
            .await?
            .into_iter()
            .map(|o| o.order_id)
            .collect();

        let filled_ids: Vec<String> = self
            .state
            .active_orders
            .iter()
            .filter(|(id, order)| !open_ids.contains(*id) && !order.failed_followup)
            .map(|(id, _)| id.clone())
            .collect();

        let mut fills = Vec::new();
        let spacing = Decimal::from_f64(self.spacing_fraction()).unwrap_or_default();

        for order_id in filled_ids {
            let Some(order) = self.state.active_orders.get(&order_id).cloned() else {
                continue;
            };

            let fill = GridFill {
                order_id: order_id.clone(),
                side: order.side,
                price: order.price,
                quantity: order.quantity,
                filled_at: Utc::now(),
            };

            // Mirror one step away: a filled BUY re-arms a SELL above, a
            // filled SELL re-arms a BUY below.
            let mirror_side = order.side.mirror();
            let mirror_price = match mirror_side {
                OrderSide::Sell => order.price * (Decimal::ONE + spacing),
                OrderSide::Buy => order.price * (Decimal::ONE - spacing),
            }
            .round_dp(2);

            match venue
                .place_order(&self.symbol, mirror_side, order.quantity, mirror_price)
                .await
            {
                Ok(mirror_id) => {
                    self.state.active_orders.remove(&order_id);
                    self.state.active_orders.insert(
                        mirror_id,
                        GridOrder {
                            side: mirror_side,
                            price: mirror_price,
                            quantity: order.quantity,
                            created_at: Utc::now(),
                            failed_followup: false,
                        },
                    );
                    debug!(
                        "GridEngine[{}:{}]: {} fill at {} re-armed as {} at {}",
                        self.cohort_name, self.symbol, order.side, order.price, mirror_side,
                        mirror_price
                    );
                }
                Err(e) => {
                    warn!(
                        "GridEngine[{}:{}]: follow-up {} at {} failed: {}",
                        self.cohort_name, self.symbol, mirror_side, mirror_price, e
                    );
                    if let Some(original) = self.state.active_orders.get_mut(&order_id) {
                        original.failed_followup = true;
                    }
                }
            }

            self.state.last_fill = Some(fill.clone());
            fills.push(fill);
        }

        if !fills.is_empty() {
            self.state.timestamp = Utc::now();
        }
        Ok(fills)
    }

    /// Cancel every resting order and clear the ladder. Returns how many
    /// orders were cancelled.
    pub async fn close_grid(&mut self, venue: &dyn VenueClient) -> Result<usize> {
        let order_ids: Vec<String> = self.state.active_orders.keys().cloned().collect();
        let mut cancelled = 0;

        for order_id in order_ids {
            match venue.cancel_order(&self.symbol, &order_id).await {
                Ok(()) => {
                    self.state.active_orders.remove(&order_id);
                    cancelled += 1;
                }
                Err(e) => {
                    // Likely already filled or cancelled on the venue side;
                    // reconciliation reports the residue.
                    warn!(
                        "GridEngine[{}:{}]: cancel of {} failed: {}",
                        self.cohort_name, self.symbol, order_id, e
                    );
                    self.state.active_orders.remove(&order_id);
                }
            }
        }

        self.state.timestamp = Utc::now();
        info!(
            "GridEngine[{}:{}]: grid closed, {} orders cancelled",
            self.cohort_name, self.symbol, cancelled
        );
        Ok(cancelled)
    }
}
