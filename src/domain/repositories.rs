//! Repository traits separating the decision engine from storage.
//!
//! Sqlite implementations live in `infrastructure::persistence`. Tests use
//! either in-memory sqlite or hand-rolled fakes.

use crate::domain::cohort::{Cohort, CohortConfig};
use crate::domain::cycle::{CycleMetrics, TradingCycle};
use crate::domain::metrics::{PositionSizeResult, RiskMetrics};
use crate::domain::regime::{MarketRegime, RegimeFeatures, RegimeState};
use crate::domain::signals::{MarketFeatures, SignalBreakdown};
use crate::domain::weights::BayesianWeights;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One row of the cohort comparison view (`v_cohort_comparison`).
#[derive(Debug, Clone)]
pub struct CohortComparisonRow {
    pub cohort_name: String,
    pub cycle_number: i64,
    pub total_pnl_pct: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub win_rate: Option<f64>,
    pub trades_count: i64,
}

#[async_trait]
pub trait CohortRepository: Send + Sync {
    async fn load_active(&self) -> Result<Vec<Cohort>>;
    async fn insert(&self, cohort: &Cohort) -> Result<()>;
    async fn update_capital(&self, name: &str, capital: Decimal) -> Result<()>;
    async fn update_config(&self, name: &str, config: &CohortConfig) -> Result<()>;
    async fn comparison_report(&self, limit: i64) -> Result<Vec<CohortComparisonRow>>;
}

#[async_trait]
pub trait CycleRepository: Send + Sync {
    async fn active_cycles(&self) -> Result<Vec<TradingCycle>>;
    async fn next_cycle_number(&self, cohort_id: &str) -> Result<i64>;
    async fn insert(&self, cycle: &TradingCycle) -> Result<()>;
    async fn close(
        &self,
        cycle_id: &str,
        end_date: DateTime<Utc>,
        metrics: &CycleMetrics,
        playbook_version: Option<i64>,
    ) -> Result<()>;
    async fn cancel(&self, cycle_id: &str) -> Result<()>;
    async fn completed(&self, cohort_id: &str, limit: i64) -> Result<Vec<TradingCycle>>;
    async fn current_playbook_version(&self) -> Result<Option<i64>>;
}

#[async_trait]
pub trait WeightsRepository: Send + Sync {
    /// Persist a weight vector, deactivating any prior active row for the
    /// same `(cohort_id, regime)` key in the same transaction.
    async fn store(&self, weights: &BayesianWeights, cohort_id: Option<&str>) -> Result<()>;
    async fn load_active(
        &self,
        regime: Option<MarketRegime>,
        cohort_id: Option<&str>,
    ) -> Result<Option<BayesianWeights>>;
    async fn history(&self, days: i64, regime: Option<MarketRegime>)
        -> Result<Vec<BayesianWeights>>;
}

/// One closed trade with the signal vector that was recorded at decision
/// time. The learner derives per-signal accuracy and pnl correlation from
/// these rows.
#[derive(Debug, Clone)]
pub struct SignalObservation {
    pub signals: BTreeMap<String, f64>,
    pub pnl_pct: f64,
}

/// Portfolio context attached to a calculation snapshot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotContext {
    pub cycle_id: Option<String>,
    pub cohort_id: Option<String>,
    pub trade_id: Option<String>,
    pub portfolio_value: Option<f64>,
    pub cash_position: Option<f64>,
    pub btc_price: Option<f64>,
    pub fear_greed: Option<i64>,
    pub current_regime: Option<MarketRegime>,
}

#[async_trait]
pub trait SignalRepository: Send + Sync {
    async fn store_breakdown(
        &self,
        trade_id: &str,
        cycle_id: Option<&str>,
        cohort_id: Option<&str>,
        breakdown: &SignalBreakdown,
    ) -> Result<()>;

    /// Record whether the decision turned out correct, once the outcome is
    /// known. Feeds the Bayesian learner.
    async fn update_outcome(&self, trade_id: &str, was_correct: bool) -> Result<()>;

    async fn observations(
        &self,
        cohort_id: Option<&str>,
        lookback_days: i64,
        regime: Option<MarketRegime>,
    ) -> Result<Vec<SignalObservation>>;

    /// Per-signal accuracy summary for one cycle, as a JSON object.
    async fn cycle_signal_accuracy(&self, cycle_id: &str) -> Result<Option<serde_json::Value>>;

    /// Persist a full metric computation so no calculation is lost.
    async fn store_snapshot(&self, metrics: &RiskMetrics, ctx: &SnapshotContext) -> Result<()>;

    async fn store_sizing_decision(
        &self,
        symbol: &str,
        cycle_id: Option<&str>,
        result: &PositionSizeResult,
    ) -> Result<()>;
}

#[async_trait]
pub trait RegimeRepository: Send + Sync {
    async fn store(&self, state: &RegimeState) -> Result<()>;
    async fn history(&self, days: i64) -> Result<Vec<RegimeState>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Closed,
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeStatus::Open => write!(f, "open"),
            TradeStatus::Closed => write!(f, "closed"),
        }
    }
}

/// An entry/exit pair on one symbol, owned by a cohort and cycle.
#[derive(Debug, Clone)]
pub struct TradePair {
    pub id: String,
    pub cohort_id: Option<String>,
    pub cycle_id: Option<String>,
    pub symbol: String,
    pub entry_price: Decimal,
    pub exit_price: Option<Decimal>,
    pub quantity: Decimal,
    pub pnl_usd: Option<Decimal>,
    pub pnl_pct: Option<f64>,
    pub status: TradeStatus,
    pub regime: Option<MarketRegime>,
    pub fear_greed: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Aggregate trade counters for one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleTradeStats {
    pub trades_count: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,
    pub avg_fear_greed: Option<f64>,
}

#[async_trait]
pub trait TradeRepository: Send + Sync {
    async fn open_pair(&self, pair: &TradePair) -> Result<()>;

    /// Close the oldest open pair for `(cohort, symbol)` at `exit_price`.
    /// Returns the closed pair, or `None` when nothing was open.
    async fn close_pair(
        &self,
        cohort_id: &str,
        symbol: &str,
        exit_price: Decimal,
        closed_at: DateTime<Utc>,
    ) -> Result<Option<TradePair>>;

    /// Per-trade returns (decimal fractions) for a symbol over the lookback.
    async fn symbol_returns(&self, symbol: &str, lookback_days: i64) -> Result<Vec<f64>>;

    /// Daily return series for a cycle (decimal fractions, oldest first).
    async fn daily_returns(&self, cycle_id: &str) -> Result<Vec<f64>>;

    async fn cycle_stats(&self, cycle_id: &str) -> Result<CycleTradeStats>;

    /// Regime recorded on each trade of the cycle, for the dominant-regime
    /// mode computation.
    async fn cycle_regimes(&self, cycle_id: &str) -> Result<Vec<MarketRegime>>;

    /// Total pnl (pct) per symbol within a cycle, for pattern lists.
    async fn cycle_symbol_pnls(&self, cycle_id: &str) -> Result<Vec<(String, f64)>>;

    /// Net capital flow of a cycle's trades (sells minus buys).
    async fn net_flow(&self, cycle_id: &str) -> Result<Decimal>;

    async fn trades_last_hours(&self, hours: i64) -> Result<i64>;
}

#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// Freshest feature bundle recorded for a symbol.
    async fn latest_features(&self, symbol: &str) -> Result<Option<MarketFeatures>>;

    /// Regime features over the trailing 8-day snapshot window.
    async fn regime_window(&self) -> Result<Option<RegimeFeatures>>;

    /// Daily regime feature points for model training, oldest first.
    async fn feature_history(&self, days: i64) -> Result<Vec<RegimeFeatures>>;

    /// First and last BTC price inside `[start, end]`, for benchmarking.
    async fn btc_price_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<(f64, f64)>>;
}

#[derive(Debug, Clone)]
pub struct TierRow {
    pub tier_name: String,
    pub target_pct: f64,
    pub current_pct: f64,
    pub current_value_usd: f64,
}

/// Read-only queries backing the opt-in monitoring tasks.
#[async_trait]
pub trait MonitoringRepository: Send + Sync {
    async fn last_discovery(&self) -> Result<Option<DateTime<Utc>>>;

    /// `(total, approved)` discovery decisions over the window.
    async fn approval_stats(&self, days: i64) -> Result<(i64, i64)>;

    /// Symbols added by discovery before the cutoff that never traded.
    async fn idle_added_coins(&self, added_before: DateTime<Utc>) -> Result<Vec<String>>;

    async fn tier_rows(&self) -> Result<Vec<TierRow>>;
}
