use crate::domain::types::OrderSide;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One resting grid order as tracked in the state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridOrder {
    #[serde(rename = "type")]
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub created_at: DateTime<Utc>,
    /// Set when the mirror order after this order's fill could not be placed.
    /// Surfaced by the grid health task, never cleared automatically.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed_followup: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridBounds {
    pub lower: Decimal,
    pub upper: Decimal,
}

/// Record of the most recent fill observed on this grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridFill {
    pub order_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub filled_at: DateTime<Utc>,
}

/// Persisted grid state for one cohort x symbol
/// (`grid_state_<SYMBOL>_<COHORT>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridState {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub active_orders: BTreeMap<String, GridOrder>,
    pub bounds: GridBounds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fill: Option<GridFill>,
}

impl GridState {
    pub fn new(symbol: &str, bounds: GridBounds, now: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            timestamp: now,
            active_orders: BTreeMap::new(),
            bounds,
            last_fill: None,
        }
    }

    pub fn count_side(&self, side: OrderSide) -> usize {
        self.active_orders.values().filter(|o| o.side == side).count()
    }

    pub fn has_failed_followups(&self) -> bool {
        self.active_orders.values().any(|o| o.failed_followup)
    }
}
