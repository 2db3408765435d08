use crate::domain::regime::MarketRegime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fixed, ordered signal universe. Persistence and weight vectors are always
/// dense over this set.
pub const SIGNAL_NAMES: [&str; 9] = [
    "fear_greed",
    "rsi",
    "macd",
    "trend",
    "volume",
    "whale",
    "sentiment",
    "macro",
    "ai",
];

/// Dirichlet prior strength. Higher means more trust in the uniform prior.
pub const PRIOR_STRENGTH: f64 = 10.0;

/// Minimum closed trades before a weight update is accepted.
pub const MIN_TRADES_FOR_UPDATE: usize = 20;

/// Weight floor, so no signal is ever fully ignored.
pub const MIN_WEIGHT: f64 = 0.02;

/// Weight ceiling, so no signal dominates.
pub const MAX_WEIGHT: f64 = 0.30;

pub type WeightMap = BTreeMap<String, f64>;

/// Uniform weights over the signal universe.
pub fn default_weights() -> WeightMap {
    SIGNAL_NAMES
        .iter()
        .map(|name| (name.to_string(), 1.0 / SIGNAL_NAMES.len() as f64))
        .collect()
}

/// Uniform Dirichlet alphas at prior strength.
pub fn prior_alphas() -> WeightMap {
    SIGNAL_NAMES
        .iter()
        .map(|name| (name.to_string(), PRIOR_STRENGTH))
        .collect()
}

/// Posterior state of the learner for one `(cohort, regime)` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BayesianWeights {
    pub weights: WeightMap,
    pub alpha_values: WeightMap,
    /// How much we trust the weights: min(1, trades / 100).
    pub confidence: f64,
    pub sample_size: usize,
    pub last_updated: DateTime<Utc>,
    pub regime: Option<MarketRegime>,
}

impl BayesianWeights {
    /// The unchanged-prior result returned when the sample gate fails.
    pub fn unchanged(weights: WeightMap, alphas: WeightMap, regime: Option<MarketRegime>) -> Self {
        Self {
            weights,
            alpha_values: alphas,
            confidence: 0.0,
            sample_size: 0,
            last_updated: Utc::now(),
            regime,
        }
    }
}

/// Rolling accuracy counters for a single signal.
#[derive(Debug, Clone, Default)]
pub struct SignalPerformance {
    pub signal_name: String,
    pub total_trades: usize,
    pub correct_predictions: usize,
    pub accuracy: f64,
    pub correlation_with_pnl: f64,
    pub regime_performance: BTreeMap<String, f64>,
}

impl SignalPerformance {
    pub fn new(signal_name: &str) -> Self {
        Self {
            signal_name: signal_name.to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_sum_to_one() {
        let weights = default_weights();
        assert_eq!(weights.len(), SIGNAL_NAMES.len());
        let total: f64 = weights.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_prior_alphas() {
        let alphas = prior_alphas();
        assert!(alphas.values().all(|&a| a == PRIOR_STRENGTH));
    }
}
