use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Everything the metrics engine knows about a return series at one point in
/// time. Fields are absent when the series was too short or degenerate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub timestamp: DateTime<Utc>,

    pub sharpe_ratio: Option<f64>,
    pub sortino_ratio: Option<f64>,
    pub calmar_ratio: Option<f64>,

    pub volatility_daily: Option<f64>,
    pub volatility_weekly: Option<f64>,

    pub current_drawdown: Option<f64>,
    pub max_drawdown: Option<f64>,

    pub var_95: Option<f64>,
    pub var_99: Option<f64>,
    pub cvar_95: Option<f64>,
    pub cvar_99: Option<f64>,

    pub kelly_fraction: Option<f64>,
    pub half_kelly: Option<f64>,
    pub optimal_position_size: Option<f64>,

    pub win_rate: Option<f64>,
    pub profit_factor: Option<f64>,
    pub avg_win: Option<f64>,
    pub avg_loss: Option<f64>,
    pub consecutive_wins: usize,
    pub consecutive_losses: usize,
}

/// Tail-risk view used by the position sizer. Losses are positive numbers
/// here (a cvar_95 of 0.07 means "expect to lose 7% in the worst 5%").
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TailRiskProfile {
    pub var_95: f64,
    pub var_99: f64,
    pub cvar_95: f64,
    pub cvar_99: f64,
    pub max_loss_observed: f64,
    pub volatility: f64,
    pub downside_volatility: f64,
}

/// Outcome of one position-sizing computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSizeResult {
    /// Final recommendation in quote currency (USDT).
    pub recommended_size: f64,
    /// Absolute ceiling (max position pct of portfolio).
    pub max_position: f64,
    /// Base size after confidence scaling, before the Kelly cap.
    pub risk_adjusted_size: f64,
    /// Fractional-Kelly recommendation, 0 when unavailable.
    pub kelly_size: f64,

    pub sizing_method: String,
    pub risk_budget_used: f64,
    pub confidence_multiplier: f64,

    pub hit_max_position: bool,
    pub hit_min_position: bool,

    pub expected_max_loss: f64,
    pub cvar_used: f64,
}
