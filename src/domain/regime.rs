use serde::{Deserialize, Serialize};
use std::fmt;

/// Discrete market classification driving mode selection and sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketRegime {
    Bull,
    Bear,
    Sideways,
    Transition,
}

impl fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketRegime::Bull => write!(f, "BULL"),
            MarketRegime::Bear => write!(f, "BEAR"),
            MarketRegime::Sideways => write!(f, "SIDEWAYS"),
            MarketRegime::Transition => write!(f, "TRANSITION"),
        }
    }
}

impl std::str::FromStr for MarketRegime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BULL" => Ok(MarketRegime::Bull),
            "BEAR" => Ok(MarketRegime::Bear),
            "SIDEWAYS" => Ok(MarketRegime::Sideways),
            "TRANSITION" => Ok(MarketRegime::Transition),
            _ => anyhow::bail!("Invalid regime: {}", s),
        }
    }
}

/// The 4-dim feature vector the detector observes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeFeatures {
    /// 7-day return in percent.
    pub return_7d: f64,
    /// Std-dev of daily returns over 7 days, in percent.
    pub volatility_7d: f64,
    /// Current volume relative to its 7-day mean, minus one.
    pub volume_trend: f64,
    /// 7-day average of the fear & greed index (0-100).
    pub fear_greed_avg: f64,
}

impl RegimeFeatures {
    pub fn as_array(&self) -> [f64; 4] {
        [
            self.return_7d,
            self.volatility_7d,
            self.volume_trend,
            self.fear_greed_avg,
        ]
    }
}

/// Detector output for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeState {
    pub current_regime: MarketRegime,
    /// Confidence in the current classification (0-1).
    pub regime_probability: f64,
    /// Probability of leaving the current regime on the next step.
    pub transition_probability: f64,
    pub regime_duration_days: i64,
    pub previous_regime: Option<MarketRegime>,
    pub features: RegimeFeatures,
    pub model_confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridBias {
    BuyHeavy,
    SellHeavy,
    Balanced,
}

/// Closed-form per-regime trading rules (see the regime detector).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeTradingRules {
    pub position_size_multiplier: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub grid_bias: GridBias,
    pub min_confidence: f64,
}
