//! Bayesian signal-weight learning over a Dirichlet posterior.
//!
//! Prior: uniform weights at strength `PRIOR_STRENGTH`. Each weight update
//! folds per-signal accuracy and pnl correlation from closed trades into the
//! alpha vector:
//!
//! `alpha_i = alpha_0 + (accuracy_i + max(0, corr_i) * 0.5) * sqrt(n_i)`
//!
//! Posterior mean `alpha_i / sum(alpha)` is clamped to `[MIN_WEIGHT,
//! MAX_WEIGHT]` and renormalized. Updates are gated on at least
//! `MIN_TRADES_FOR_UPDATE` closed trades.

use crate::domain::regime::MarketRegime;
use crate::domain::repositories::{
    CohortRepository, SignalObservation, SignalRepository, WeightsRepository,
};
use crate::domain::weights::{
    default_weights, prior_alphas, BayesianWeights, SignalPerformance, WeightMap,
    MIN_TRADES_FOR_UPDATE, MIN_WEIGHT, MAX_WEIGHT, PRIOR_STRENGTH, SIGNAL_NAMES,
};
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Lookback for the global and per-cohort weekly updates.
const GLOBAL_LOOKBACK_DAYS: i64 = 30;
/// Regimes are rarer, so their updates look further back.
const REGIME_LOOKBACK_DAYS: i64 = 60;

#[derive(Debug, Clone, Serialize)]
pub struct WeightUpdateEntry {
    pub scope: String,
    pub weights: WeightMap,
    pub confidence: f64,
    pub sample_size: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WeeklyUpdateReport {
    pub updates: Vec<WeightUpdateEntry>,
    pub errors: Vec<String>,
}

pub struct BayesianWeightLearner {
    weights_repo: Arc<dyn WeightsRepository>,
    signal_repo: Arc<dyn SignalRepository>,
    cohort_repo: Arc<dyn CohortRepository>,
    current_weights: RwLock<WeightMap>,
    current_alphas: RwLock<WeightMap>,
}

impl BayesianWeightLearner {
    pub fn new(
        weights_repo: Arc<dyn WeightsRepository>,
        signal_repo: Arc<dyn SignalRepository>,
        cohort_repo: Arc<dyn CohortRepository>,
    ) -> Self {
        Self {
            weights_repo,
            signal_repo,
            cohort_repo,
            current_weights: RwLock::new(default_weights()),
            current_alphas: RwLock::new(prior_alphas()),
        }
    }

    /// Restore the last persisted global weights, keeping the uniform prior
    /// when none exist yet.
    pub async fn restore(&self) {
        match self.weights_repo.load_active(None, None).await {
            Ok(Some(stored)) => {
                *self.current_weights.write().await = stored.weights;
                *self.current_alphas.write().await = stored.alpha_values;
                info!("BayesianWeightLearner: restored persisted weights");
            }
            Ok(None) => debug!("BayesianWeightLearner: no stored weights, using prior"),
            Err(e) => warn!("BayesianWeightLearner: weight restore failed: {}", e),
        }
    }

    /// Current weights, regime-specific when an active row exists for the
    /// regime, global otherwise.
    pub async fn get_weights(&self, regime: Option<MarketRegime>) -> WeightMap {
        if let Some(regime) = regime {
            match self.weights_repo.load_active(Some(regime), None).await {
                Ok(Some(stored)) => return stored.weights,
                Ok(None) => {}
                Err(e) => debug!("BayesianWeightLearner: regime weights fetch failed: {}", e),
            }
        }
        self.current_weights.read().await.clone()
    }

    /// Recompute the posterior from closed-trade outcomes. Returns the
    /// previous weights untouched (`confidence = 0`, `sample_size = 0`) when
    /// fewer than `MIN_TRADES_FOR_UPDATE` trades are available.
    pub async fn update_weights(
        &self,
        cohort_id: Option<&str>,
        lookback_days: i64,
        regime: Option<MarketRegime>,
    ) -> Result<BayesianWeights> {
        let observations = self
            .signal_repo
            .observations(cohort_id, lookback_days, regime)
            .await?;

        if observations.len() < MIN_TRADES_FOR_UPDATE {
            info!(
                "BayesianWeightLearner: {} trades < {} required, keeping previous weights",
                observations.len(),
                MIN_TRADES_FOR_UPDATE
            );
            return Ok(BayesianWeights::unchanged(
                self.current_weights.read().await.clone(),
                self.current_alphas.read().await.clone(),
                regime,
            ));
        }

        let performance = signal_performance(&observations);
        let new_alphas = posterior_alphas(&performance);
        let new_weights = normalize_weights(&new_alphas);

        let total_trades = observations.len();
        let confidence = (total_trades as f64 / 100.0).min(1.0);

        // Only the global update moves the in-memory defaults; scoped
        // updates live in their own persisted rows.
        if cohort_id.is_none() && regime.is_none() {
            *self.current_weights.write().await = new_weights.clone();
            *self.current_alphas.write().await = new_alphas.clone();
        }

        let result = BayesianWeights {
            weights: new_weights,
            alpha_values: new_alphas,
            confidence,
            sample_size: total_trades,
            last_updated: Utc::now(),
            regime,
        };

        self.weights_repo.store(&result, cohort_id).await?;

        info!(
            "BayesianWeightLearner: updated weights from {} trades (confidence {:.2})",
            total_trades, confidence
        );
        Ok(result)
    }

    /// Weekly batch: one global update, one per regime, one per active
    /// cohort. Every update passes the sample gate independently.
    pub async fn weekly_update(&self) -> WeeklyUpdateReport {
        let mut report = WeeklyUpdateReport::default();

        match self.update_weights(None, GLOBAL_LOOKBACK_DAYS, None).await {
            Ok(weights) => report.updates.push(WeightUpdateEntry {
                scope: "global".to_string(),
                weights: weights.weights,
                confidence: weights.confidence,
                sample_size: weights.sample_size,
            }),
            Err(e) => report.errors.push(format!("global update failed: {}", e)),
        }

        for regime in [MarketRegime::Bull, MarketRegime::Bear, MarketRegime::Sideways] {
            match self
                .update_weights(None, REGIME_LOOKBACK_DAYS, Some(regime))
                .await
            {
                Ok(weights) if weights.sample_size >= MIN_TRADES_FOR_UPDATE => {
                    report.updates.push(WeightUpdateEntry {
                        scope: format!("regime_{}", regime),
                        weights: weights.weights,
                        confidence: weights.confidence,
                        sample_size: weights.sample_size,
                    })
                }
                Ok(_) => {}
                Err(e) => report
                    .errors
                    .push(format!("regime {} update failed: {}", regime, e)),
            }
        }

        let cohorts = match self.cohort_repo.load_active().await {
            Ok(cohorts) => cohorts,
            Err(e) => {
                report.errors.push(format!("cohort list failed: {}", e));
                Vec::new()
            }
        };

        for cohort in cohorts {
            match self
                .update_weights(Some(&cohort.id), GLOBAL_LOOKBACK_DAYS, None)
                .await
            {
                Ok(weights) if weights.sample_size >= MIN_TRADES_FOR_UPDATE => {
                    report.updates.push(WeightUpdateEntry {
                        scope: format!("cohort_{}", cohort.name),
                        weights: weights.weights,
                        confidence: weights.confidence,
                        sample_size: weights.sample_size,
                    })
                }
                Ok(_) => {}
                Err(e) => report
                    .errors
                    .push(format!("cohort {} update failed: {}", cohort.name, e)),
            }
        }

        info!(
            "Weekly Bayesian update: {} updates, {} errors",
            report.updates.len(),
            report.errors.len()
        );
        report
    }

    /// Weighted sum of the provided signals, clamped to [-1, +1], plus the
    /// per-signal contributions that produced it.
    pub async fn combine_signals(
        &self,
        signals: &BTreeMap<String, f64>,
        regime: Option<MarketRegime>,
    ) -> (f64, BTreeMap<String, f64>) {
        let weights = self.get_weights(regime).await;
        combine_signals(signals, &weights)
    }

    pub async fn weight_history(
        &self,
        days: i64,
        regime: Option<MarketRegime>,
    ) -> Result<Vec<BayesianWeights>> {
        self.weights_repo.history(days, regime).await
    }

    /// Evolution of a single signal's weight over time.
    pub async fn weight_evolution(
        &self,
        signal_name: &str,
        days: i64,
    ) -> Result<Vec<(chrono::DateTime<Utc>, f64)>> {
        let history = self.weight_history(days, None).await?;
        Ok(history
            .into_iter()
            .filter_map(|entry| {
                entry
                    .weights
                    .get(signal_name)
                    .map(|w| (entry.last_updated, *w))
            })
            .collect())
    }

    /// Active weight vectors per regime plus the global one.
    pub async fn compare_regimes(&self) -> BTreeMap<String, WeightMap> {
        let mut comparison = BTreeMap::new();
        for regime in [MarketRegime::Bull, MarketRegime::Bear, MarketRegime::Sideways] {
            if let Ok(Some(stored)) = self.weights_repo.load_active(Some(regime), None).await {
                comparison.insert(regime.to_string(), stored.weights);
            }
        }
        comparison.insert(
            "GLOBAL".to_string(),
            self.current_weights.read().await.clone(),
        );
        comparison
    }

    /// Signals ranked by weight, heaviest first.
    pub async fn signal_ranking(&self, regime: Option<MarketRegime>) -> Vec<(String, f64)> {
        let weights = self.get_weights(regime).await;
        let mut ranking: Vec<(String, f64)> = weights.into_iter().collect();
        ranking.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranking
    }

    /// Accuracy the current weights would imply over the last 30 days.
    pub async fn expected_accuracy(&self) -> Result<f64> {
        let observations = self
            .signal_repo
            .observations(None, GLOBAL_LOOKBACK_DAYS, None)
            .await?;
        if observations.is_empty() {
            return Ok(0.0);
        }

        let performance = signal_performance(&observations);
        let weights = self.current_weights.read().await;
        Ok(weights
            .iter()
            .filter_map(|(name, weight)| performance.get(name).map(|p| weight * p.accuracy))
            .sum())
    }
}

/// Aggregate per-signal accuracy and pnl correlation from closed trades.
pub fn signal_performance(
    observations: &[SignalObservation],
) -> BTreeMap<String, SignalPerformance> {
    let mut performance: BTreeMap<String, SignalPerformance> = SIGNAL_NAMES
        .iter()
        .map(|name| (name.to_string(), SignalPerformance::new(name)))
        .collect();
    let mut samples: BTreeMap<String, Vec<(f64, f64)>> = BTreeMap::new();

    for obs in observations {
        let profitable = obs.pnl_pct > 0.0;
        for (name, value) in &obs.signals {
            let Some(perf) = performance.get_mut(name) else {
                continue;
            };
            samples
                .entry(name.clone())
                .or_default()
                .push((*value, obs.pnl_pct));

            // A prediction is correct when its sign matched the outcome.
            let correct = (*value > 0.0 && profitable) || (*value < 0.0 && !profitable);
            perf.total_trades += 1;
            if correct {
                perf.correct_predictions += 1;
            }
        }
    }

    for (name, perf) in performance.iter_mut() {
        if perf.total_trades > 0 {
            perf.accuracy = perf.correct_predictions as f64 / perf.total_trades as f64;
            if let Some(pairs) = samples.get(name) {
                if pairs.len() >= 3 {
                    perf.correlation_with_pnl = pearson(pairs);
                }
            }
        }
    }

    performance
}

/// Posterior Dirichlet alphas. Signals without observations retain the
/// prior.
pub fn posterior_alphas(performance: &BTreeMap<String, SignalPerformance>) -> WeightMap {
    SIGNAL_NAMES
        .iter()
        .map(|name| {
            let alpha = match performance.get(*name) {
                Some(perf) if perf.total_trades > 0 => {
                    let correlation_bonus = perf.correlation_with_pnl.max(0.0) * 0.5;
                    let sample_weight = (perf.total_trades as f64).sqrt();
                    PRIOR_STRENGTH + (perf.accuracy + correlation_bonus) * sample_weight
                }
                _ => PRIOR_STRENGTH,
            };
            (name.to_string(), alpha)
        })
        .collect()
}

/// Dirichlet mean with weight floor/ceiling, renormalized to sum 1.
pub fn normalize_weights(alphas: &WeightMap) -> WeightMap {
    let total_alpha: f64 = alphas.values().sum();
    if total_alpha == 0.0 {
        return default_weights();
    }

    let constrained: WeightMap = alphas
        .iter()
        .map(|(name, alpha)| {
            let raw = alpha / total_alpha;
            (name.clone(), raw.clamp(MIN_WEIGHT, MAX_WEIGHT))
        })
        .collect();

    let total: f64 = constrained.values().sum();
    constrained
        .into_iter()
        .map(|(name, weight)| (name, weight / total))
        .collect()
}

/// Weighted signal combination, shared by the async wrapper above.
pub fn combine_signals(
    signals: &BTreeMap<String, f64>,
    weights: &WeightMap,
) -> (f64, BTreeMap<String, f64>) {
    let mut combined = 0.0;
    let mut contributions = BTreeMap::new();

    for (name, weight) in weights {
        let value = signals.get(name).copied().unwrap_or(0.0);
        let contribution = weight * value;
        combined += contribution;
        contributions.insert(name.clone(), contribution);
    }

    (combined.clamp(-1.0, 1.0), contributions)
}

fn pearson(pairs: &[(f64, f64)]) -> f64 {
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in pairs {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x).powi(2);
        var_y += (y - mean_y).powi(2);
    }

    if var_x == 0.0 || var_y == 0.0 {
        return 0.0;
    }
    cov / (var_x.sqrt() * var_y.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(signal_value: f64, pnl: f64) -> SignalObservation {
        let mut signals = BTreeMap::new();
        for name in SIGNAL_NAMES {
            signals.insert(name.to_string(), 0.0);
        }
        signals.insert("rsi".to_string(), signal_value);
        SignalObservation {
            signals,
            pnl_pct: pnl,
        }
    }

    #[test]
    fn test_performance_accuracy() {
        // rsi bullish and profitable 3 of 4 times.
        let observations = vec![
            observation(0.7, 2.0),
            observation(0.7, 1.0),
            observation(0.7, -1.5),
            observation(0.7, 0.5),
        ];
        let performance = signal_performance(&observations);
        let rsi = &performance["rsi"];
        assert_eq!(rsi.total_trades, 4);
        assert_eq!(rsi.correct_predictions, 3);
        assert!((rsi.accuracy - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_posterior_keeps_prior_without_observations() {
        let performance = signal_performance(&[]);
        let alphas = posterior_alphas(&performance);
        assert!(alphas.values().all(|a| (*a - PRIOR_STRENGTH).abs() < 1e-12));
    }

    #[test]
    fn test_posterior_rewards_accurate_signals() {
        let observations: Vec<SignalObservation> =
            (0..25).map(|_| observation(0.7, 1.0)).collect();
        let performance = signal_performance(&observations);
        let alphas = posterior_alphas(&performance);

        // Perfect accuracy and positive correlation... correlation is zero
        // here because the signal is constant, so alpha = 10 + 1.0 * 5.
        assert!((alphas["rsi"] - (PRIOR_STRENGTH + 25f64.sqrt())).abs() < 1e-9);
        assert!(alphas["rsi"] > alphas["macd"]);
    }

    #[test]
    fn test_normalized_weights_respect_bounds_and_sum() {
        let mut alphas = prior_alphas();
        alphas.insert("rsi".to_string(), 500.0); // would dominate unclamped

        let weights = normalize_weights(&alphas);
        let total: f64 = weights.values().sum();
        assert!((total - 1.0).abs() < 1e-3);
        for weight in weights.values() {
            assert!(
                *weight >= MIN_WEIGHT - 1e-9 && *weight <= MAX_WEIGHT + 1e-9,
                "weight {} out of bounds",
                weight
            );
        }
        // rsi clamps at the ceiling, before renormalization spreads it.
        assert!(weights["rsi"] >= weights["macd"]);
    }

    #[test]
    fn test_combine_signals_is_linear_modulo_clamp() {
        let weights = default_weights();
        let mut a = BTreeMap::new();
        let mut b = BTreeMap::new();
        for name in SIGNAL_NAMES {
            a.insert(name.to_string(), 0.2);
            b.insert(name.to_string(), -0.1);
        }

        let (score_a, _) = combine_signals(&a, &weights);
        let (score_b, _) = combine_signals(&b, &weights);

        let mixed: BTreeMap<String, f64> = a
            .iter()
            .map(|(k, v)| (k.clone(), 0.5 * v + 2.0 * b[k]))
            .collect();
        let (score_mixed, _) = combine_signals(&mixed, &weights);
        assert!((score_mixed - (0.5 * score_a + 2.0 * score_b)).abs() < 1e-9);
    }

    #[test]
    fn test_combine_clamps_to_unit_interval() {
        let mut weights = WeightMap::new();
        weights.insert("rsi".to_string(), 3.0); // malformed on purpose
        let mut signals = BTreeMap::new();
        signals.insert("rsi".to_string(), 1.0);

        let (combined, _) = combine_signals(&signals, &weights);
        assert_eq!(combined, 1.0);
    }

    #[test]
    fn test_pearson_simple() {
        let pairs: Vec<(f64, f64)> = (0..10).map(|i| (i as f64, 2.0 * i as f64)).collect();
        assert!((pearson(&pairs) - 1.0).abs() < 1e-9);
        let anti: Vec<(f64, f64)> = (0..10).map(|i| (i as f64, -i as f64)).collect();
        assert!((pearson(&anti) + 1.0).abs() < 1e-9);
    }
}
