use crate::domain::regime::MarketRegime;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed cycle length. Cycles close after seven days and a new one opens.
pub const CYCLE_DURATION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Active,
    Completed,
    Cancelled,
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleStatus::Active => write!(f, "active"),
            CycleStatus::Completed => write!(f, "completed"),
            CycleStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for CycleStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(CycleStatus::Active),
            "completed" => Ok(CycleStatus::Completed),
            "cancelled" => Ok(CycleStatus::Cancelled),
            _ => anyhow::bail!("Invalid cycle status: {}", s),
        }
    }
}

/// A fixed-duration performance container bound to one cohort.
///
/// Invariants: at most one active cycle per cohort; cycle numbers are dense
/// and monotonic starting at 1; completed rows are immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingCycle {
    pub id: String,
    pub cohort_id: String,
    pub cohort_name: String,
    pub cycle_number: i64,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub status: CycleStatus,

    pub starting_capital: Decimal,
    pub ending_capital: Option<Decimal>,
    pub trades_count: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,

    pub total_pnl: Option<Decimal>,
    pub total_pnl_pct: Option<f64>,
    pub max_drawdown: Option<f64>,

    pub sharpe_ratio: Option<f64>,
    pub sortino_ratio: Option<f64>,
    pub calmar_ratio: Option<f64>,
    pub kelly_fraction: Option<f64>,
    pub var_95: Option<f64>,
    pub cvar_95: Option<f64>,

    pub avg_fear_greed: Option<f64>,
    pub dominant_regime: Option<MarketRegime>,
    pub btc_performance_pct: Option<f64>,

    pub playbook_version_at_start: Option<i64>,
    pub playbook_version_at_end: Option<i64>,
}

impl TradingCycle {
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.start_date).num_days()
    }
}

/// End-of-cycle metric bundle written at closure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub ending_capital: Decimal,
    pub trades_count: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,
    pub total_pnl: Decimal,
    pub total_pnl_pct: f64,
    pub max_drawdown: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub sortino_ratio: Option<f64>,
    pub calmar_ratio: Option<f64>,
    pub kelly_fraction: Option<f64>,
    pub var_95: Option<f64>,
    pub cvar_95: Option<f64>,
    pub avg_fear_greed: Option<f64>,
    pub dominant_regime: Option<MarketRegime>,
    pub btc_performance_pct: Option<f64>,
    pub signal_performance: Option<serde_json::Value>,
    pub best_patterns: Option<serde_json::Value>,
    pub worst_patterns: Option<serde_json::Value>,
}
