use crate::domain::weights::WeightMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AiDirection {
    Bullish,
    Bearish,
    Neutral,
}

impl AiDirection {
    /// Direction code used by the ai signal: BULLISH=+1, BEARISH=-1.
    pub fn code(self) -> f64 {
        match self {
            AiDirection::Bullish => 1.0,
            AiDirection::Bearish => -1.0,
            AiDirection::Neutral => 0.0,
        }
    }
}

impl std::str::FromStr for AiDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BULLISH" => Ok(AiDirection::Bullish),
            "BEARISH" => Ok(AiDirection::Bearish),
            "NEUTRAL" => Ok(AiDirection::Neutral),
            _ => anyhow::bail!("Invalid AI direction: {}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AiRiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for AiRiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AiRiskLevel::Low => write!(f, "LOW"),
            AiRiskLevel::Medium => write!(f, "MEDIUM"),
            AiRiskLevel::High => write!(f, "HIGH"),
        }
    }
}

impl std::str::FromStr for AiRiskLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LOW" => Ok(AiRiskLevel::Low),
            "MEDIUM" => Ok(AiRiskLevel::Medium),
            "HIGH" => Ok(AiRiskLevel::High),
            _ => anyhow::bail!("Invalid AI risk level: {}", s),
        }
    }
}

/// Output of the AI provider for one classification call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiAssessment {
    pub direction: AiDirection,
    pub confidence: f64,
    pub risk_level: AiRiskLevel,
    pub reasoning: Option<String>,
}

impl AiAssessment {
    /// Fallback when the provider is unavailable or over budget.
    pub fn neutral() -> Self {
        Self {
            direction: AiDirection::Neutral,
            confidence: 0.5,
            risk_level: AiRiskLevel::Medium,
            reasoning: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FedSentiment {
    Hawkish,
    Dovish,
    Neutral,
}

/// Feature bundle consumed by the signal analyzer.
///
/// Indicator values are inputs here; the collector that derives them from raw
/// ticks is outside this core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketFeatures {
    pub symbol: String,
    pub price: f64,
    pub fear_greed: i64,
    pub rsi: f64,
    pub macd_line: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub prev_macd_histogram: Option<f64>,
    pub sma_20: f64,
    pub sma_50: f64,
    pub sma_200: Option<f64>,
    pub volume: f64,
    pub avg_volume: f64,
    pub price_change_24h: f64,
    pub whale_buys_usd: f64,
    pub whale_sells_usd: f64,
    pub social_score: f64,
    pub news_sentiment: Option<f64>,
    pub etf_flow_7d: f64,
    pub fed_sentiment: Option<FedSentiment>,
    pub high_impact_events: usize,
    pub playbook_alignment: f64,
}

impl MarketFeatures {
    /// A neutral bundle. Mostly useful in tests.
    pub fn neutral(symbol: &str, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            price,
            fear_greed: 50,
            rsi: 50.0,
            macd_line: 0.0,
            macd_signal: 0.0,
            macd_histogram: 0.0,
            prev_macd_histogram: None,
            sma_20: price,
            sma_50: price,
            sma_200: None,
            volume: 1.0,
            avg_volume: 1.0,
            price_change_24h: 0.0,
            whale_buys_usd: 0.0,
            whale_sells_usd: 0.0,
            social_score: 50.0,
            news_sentiment: None,
            etf_flow_7d: 0.0,
            fed_sentiment: None,
            high_impact_events: 0,
            playbook_alignment: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DivergenceKind {
    /// Math composite and AI disagree strongly.
    MathAi,
    /// At least three math signals bullish and three bearish at once.
    Internal,
}

impl fmt::Display for DivergenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DivergenceKind::MathAi => write!(f, "math_ai_divergence"),
            DivergenceKind::Internal => write!(f, "internal_divergence"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Divergence {
    pub kind: DivergenceKind,
    pub strength: f64,
}

/// Full per-decision breakdown: every signal, the weights actually applied,
/// the composites and the divergence classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalBreakdown {
    pub fear_greed_signal: f64,
    pub rsi_signal: f64,
    pub macd_signal: f64,
    pub trend_signal: f64,
    pub volume_signal: f64,
    pub whale_signal: f64,
    pub sentiment_signal: f64,
    pub macro_signal: f64,

    pub ai_direction_signal: f64,
    pub ai_confidence: f64,
    pub ai_risk_level: AiRiskLevel,
    pub playbook_alignment: f64,

    pub weights_applied: WeightMap,

    pub math_composite: f64,
    pub ai_composite: f64,
    pub final_score: f64,

    pub divergence: Option<Divergence>,
}

impl SignalBreakdown {
    /// The eight non-AI component scores, in canonical signal order.
    pub fn math_signals(&self) -> [(&'static str, f64); 8] {
        [
            ("fear_greed", self.fear_greed_signal),
            ("rsi", self.rsi_signal),
            ("macd", self.macd_signal),
            ("trend", self.trend_signal),
            ("volume", self.volume_signal),
            ("whale", self.whale_signal),
            ("sentiment", self.sentiment_signal),
            ("macro", self.macro_signal),
        ]
    }

    /// All nine signals as a dense map, suitable for the weight learner.
    pub fn signal_map(&self) -> BTreeMap<String, f64> {
        let mut map: BTreeMap<String, f64> = self
            .math_signals()
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect();
        map.insert("ai".to_string(), self.ai_direction_signal);
        map
    }

    pub fn has_divergence(&self) -> bool {
        self.divergence.is_some()
    }
}
