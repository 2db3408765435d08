//! Market regime detection.
//!
//! Primary model: a 3-state classifier in the HMM family: Gaussian
//! emissions per state over the 4-dim feature vector, combined with a
//! persistence-biased transition prior. Training requires at least
//! `MIN_FIT_POINTS` extracted feature points; until then (or whenever the
//! model cannot produce an answer) the rule-based classifier is
//! authoritative.

use crate::domain::ports::MarketFeed;
use crate::domain::regime::{
    GridBias, MarketRegime, RegimeFeatures, RegimeState, RegimeTradingRules,
};
use crate::domain::repositories::RegimeRepository;
use crate::domain::weights::WeightMap;
use anyhow::Result;
use chrono::{DateTime, Utc};
use statrs::distribution::{Continuous, Normal};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Minimum feature points before the model is considered trained.
pub const MIN_FIT_POINTS: usize = 20;

/// New feature points required before a weekly refit.
pub const REFIT_NEW_POINTS: usize = 30;

/// Lookback used when pulling training history.
const TRAINING_LOOKBACK_DAYS: i64 = 365;

const STATES: [MarketRegime; 3] = [MarketRegime::Bull, MarketRegime::Bear, MarketRegime::Sideways];

fn state_index(regime: MarketRegime) -> usize {
    match regime {
        MarketRegime::Bull => 0,
        MarketRegime::Bear => 1,
        // TRANSITION shares the sideways row of the transition prior.
        MarketRegime::Sideways | MarketRegime::Transition => 2,
    }
}

/// Rule-based classification: `(regime, probability, transition_probability)`.
///
/// Confidence is 0.9 when the move exceeds 10% in magnitude or when both the
/// return rule and the sentiment rule agree, 0.7 otherwise. Sideways gets
/// 0.8 in genuinely quiet conditions.
pub fn rule_based_regime(features: &RegimeFeatures) -> (MarketRegime, f64, f64) {
    let ret = features.return_7d;
    let fg = features.fear_greed_avg;

    let bull_return = ret > 5.0;
    let bull_sentiment = ret > 0.0 && fg > 55.0;
    if bull_return || bull_sentiment {
        let confidence = if ret > 10.0 || (bull_return && bull_sentiment) {
            0.9
        } else {
            0.7
        };
        return (MarketRegime::Bull, confidence, 0.1);
    }

    let bear_return = ret < -5.0;
    let bear_sentiment = ret < 0.0 && fg < 30.0;
    if bear_return || bear_sentiment {
        let confidence = if ret < -10.0 || (bear_return && bear_sentiment) {
            0.9
        } else {
            0.7
        };
        return (MarketRegime::Bear, confidence, 0.1);
    }

    let confidence = if ret.abs() < 2.0 && features.volatility_7d < 2.0 {
        0.8
    } else {
        0.7
    };
    (MarketRegime::Sideways, confidence, 0.2)
}

/// Gaussian-emission regime model with a fixed persistence-biased
/// transition matrix.
#[derive(Debug, Clone)]
pub struct GaussianRegimeModel {
    transition: [[f64; 3]; 3],
    /// Per state, per feature dimension: (mean, std).
    emissions: Option<[[(f64, f64); 4]; 3]>,
    fitted_points: usize,
}

impl GaussianRegimeModel {
    pub fn new() -> Self {
        Self {
            transition: [
                [0.90, 0.05, 0.05], // BULL is sticky
                [0.05, 0.90, 0.05], // BEAR is sticky
                [0.10, 0.10, 0.80], // SIDEWAYS flips more readily
            ],
            emissions: None,
            fitted_points: 0,
        }
    }

    pub fn is_fitted(&self) -> bool {
        self.emissions.is_some()
    }

    pub fn fitted_points(&self) -> usize {
        self.fitted_points
    }

    /// Fit per-state Gaussians from labelled history. Labels come from the
    /// rule-based classifier; states without enough members inherit the
    /// global distribution.
    pub fn fit(&mut self, features: &[RegimeFeatures]) -> Result<()> {
        if features.len() < MIN_FIT_POINTS {
            anyhow::bail!(
                "not enough feature points to train: {} < {}",
                features.len(),
                MIN_FIT_POINTS
            );
        }

        let mut buckets: [Vec<[f64; 4]>; 3] = [Vec::new(), Vec::new(), Vec::new()];
        let mut all: Vec<[f64; 4]> = Vec::with_capacity(features.len());
        for f in features {
            let (regime, _, _) = rule_based_regime(f);
            buckets[state_index(regime)].push(f.as_array());
            all.push(f.as_array());
        }

        let global = Self::dim_stats(&all);
        let mut emissions = [[(0.0, 1.0); 4]; 3];
        for (state, bucket) in buckets.iter().enumerate() {
            emissions[state] = if bucket.len() >= 2 {
                Self::dim_stats(bucket)
            } else {
                global
            };
        }

        self.emissions = Some(emissions);
        self.fitted_points = features.len();
        Ok(())
    }

    fn dim_stats(points: &[[f64; 4]]) -> [(f64, f64); 4] {
        let n = points.len() as f64;
        let mut stats = [(0.0, 1.0); 4];
        for (dim, stat) in stats.iter_mut().enumerate() {
            let mean = points.iter().map(|p| p[dim]).sum::<f64>() / n;
            let var = points.iter().map(|p| (p[dim] - mean).powi(2)).sum::<f64>() / n;
            // Floor the std so a constant dimension cannot blow up the pdf.
            stat.0 = mean;
            stat.1 = var.sqrt().max(1e-3);
        }
        stats
    }

    /// `(regime, probability, transition_probability)` for one observation,
    /// or `None` when the model is untrained.
    pub fn predict(
        &self,
        features: &RegimeFeatures,
        current: MarketRegime,
    ) -> Option<(MarketRegime, f64, f64)> {
        let emissions = self.emissions.as_ref()?;
        let observation = features.as_array();
        let prior = self.transition[state_index(current)];

        // Log-space to survive small densities, normalized by max.
        let mut log_scores = [0.0_f64; 3];
        for state in 0..3 {
            let mut log_likelihood = prior[state].ln();
            for dim in 0..4 {
                let (mean, std) = emissions[state][dim];
                match Normal::new(mean, std) {
                    Ok(normal) => log_likelihood += normal.ln_pdf(observation[dim]),
                    Err(_) => return None,
                }
            }
            log_scores[state] = log_likelihood;
        }

        let max = log_scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let weights: Vec<f64> = log_scores.iter().map(|s| (s - max).exp()).collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return None;
        }

        let (best, _) = weights
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;

        let probability = weights[best] / total;
        let current_idx = state_index(current);
        let transition_probability = 1.0 - self.transition[current_idx][current_idx];
        Some((STATES[best], probability, transition_probability))
    }
}

impl Default for GaussianRegimeModel {
    fn default() -> Self {
        Self::new()
    }
}

/// Service wrapper: tracks regime duration, persists every observation and
/// handles (re)training.
pub struct RegimeDetector {
    feed: Arc<dyn MarketFeed>,
    regime_repo: Arc<dyn RegimeRepository>,
    model: RwLock<GaussianRegimeModel>,
    current: RwLock<(MarketRegime, DateTime<Utc>)>,
}

impl RegimeDetector {
    pub fn new(feed: Arc<dyn MarketFeed>, regime_repo: Arc<dyn RegimeRepository>) -> Self {
        Self {
            feed,
            regime_repo,
            model: RwLock::new(GaussianRegimeModel::new()),
            current: RwLock::new((MarketRegime::Sideways, Utc::now())),
        }
    }

    /// Train the model from historical feature points. A no-op warning when
    /// history is still too short: the rule-based fallback stays in charge.
    pub async fn fit(&self) -> Result<()> {
        let history = self.feed.regime_feature_history(TRAINING_LOOKBACK_DAYS).await?;
        let mut model = self.model.write().await;
        match model.fit(&history) {
            Ok(()) => {
                info!(
                    "RegimeDetector: model trained on {} feature points",
                    history.len()
                );
                Ok(())
            }
            Err(e) => {
                warn!("RegimeDetector: {}", e);
                Ok(())
            }
        }
    }

    /// Weekly hook: refit once enough new feature points have accrued since
    /// the last fit.
    pub async fn maybe_retrain(&self) -> Result<()> {
        let history = self.feed.regime_feature_history(TRAINING_LOOKBACK_DAYS).await?;
        let mut model = self.model.write().await;
        let enough_new = history.len() >= model.fitted_points() + REFIT_NEW_POINTS;
        if !model.is_fitted() || enough_new {
            if let Err(e) = model.fit(&history) {
                debug!("RegimeDetector: retrain skipped: {}", e);
            } else {
                info!("RegimeDetector: model refit on {} points", history.len());
            }
        }
        Ok(())
    }

    /// Detect the current regime from the freshest market-wide features.
    /// Returns `None` when no market data is available at all.
    pub async fn detect(&self) -> Result<Option<RegimeState>> {
        let Some(features) = self.feed.regime_features().await? else {
            warn!("RegimeDetector: no market data, skipping detection");
            return Ok(None);
        };

        let state = self.classify(features).await;
        if let Err(e) = self.regime_repo.store(&state).await {
            warn!("RegimeDetector: failed to persist regime: {}", e);
        }
        Ok(Some(state))
    }

    /// Classify one feature observation, maintaining the duration clock.
    pub async fn classify(&self, features: RegimeFeatures) -> RegimeState {
        let model_result = {
            let model = self.model.read().await;
            let current = self.current.read().await.0;
            model.predict(&features, current)
        };

        let (regime, probability, transition_probability) =
            model_result.unwrap_or_else(|| rule_based_regime(&features));

        let now = Utc::now();
        let mut current = self.current.write().await;
        let previous = if regime != current.0 {
            let previous = Some(current.0);
            *current = (regime, now);
            previous
        } else {
            None
        };
        let duration_days = (now - current.1).num_days();

        RegimeState {
            current_regime: regime,
            regime_probability: probability,
            transition_probability,
            regime_duration_days: duration_days,
            previous_regime: previous,
            features,
            model_confidence: probability,
        }
    }

    pub async fn history(&self, days: i64) -> Result<Vec<RegimeState>> {
        self.regime_repo.history(days).await
    }

    /// Signal-weight presets per regime: trend-following in bulls,
    /// contrarian in bears, mean reversion sideways.
    pub fn regime_adjusted_weights(regime: MarketRegime) -> WeightMap {
        let table: [(&str, f64); 9] = match regime {
            MarketRegime::Bull => [
                ("fear_greed", 0.10),
                ("rsi", 0.10),
                ("macd", 0.15),
                ("trend", 0.25),
                ("volume", 0.10),
                ("whale", 0.05),
                ("sentiment", 0.05),
                ("macro", 0.05),
                ("ai", 0.15),
            ],
            MarketRegime::Bear => [
                ("fear_greed", 0.25),
                ("rsi", 0.15),
                ("macd", 0.10),
                ("trend", 0.05),
                ("volume", 0.05),
                ("whale", 0.10),
                ("sentiment", 0.10),
                ("macro", 0.05),
                ("ai", 0.15),
            ],
            MarketRegime::Sideways | MarketRegime::Transition => [
                ("fear_greed", 0.10),
                ("rsi", 0.25),
                ("macd", 0.15),
                ("trend", 0.05),
                ("volume", 0.05),
                ("whale", 0.05),
                ("sentiment", 0.10),
                ("macro", 0.05),
                ("ai", 0.20),
            ],
        };
        table
            .iter()
            .map(|(name, weight)| (name.to_string(), *weight))
            .collect()
    }

    pub fn regime_trading_rules(regime: MarketRegime) -> RegimeTradingRules {
        match regime {
            MarketRegime::Bull => RegimeTradingRules {
                position_size_multiplier: 1.2,
                stop_loss_pct: 7.0,
                take_profit_pct: 15.0,
                grid_bias: GridBias::BuyHeavy,
                min_confidence: 0.4,
            },
            MarketRegime::Bear => RegimeTradingRules {
                position_size_multiplier: 0.7,
                stop_loss_pct: 5.0,
                take_profit_pct: 8.0,
                grid_bias: GridBias::SellHeavy,
                min_confidence: 0.6,
            },
            MarketRegime::Sideways | MarketRegime::Transition => RegimeTradingRules {
                position_size_multiplier: 1.0,
                stop_loss_pct: 5.0,
                take_profit_pct: 10.0,
                grid_bias: GridBias::Balanced,
                min_confidence: 0.5,
            },
        }
    }
}
