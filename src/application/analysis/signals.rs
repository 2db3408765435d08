//! Signal analyzer: maps raw market features to bounded component scores,
//! applies the current weight vector and classifies divergences.
//!
//! Every component score lives in [-1, +1]; negative means bearish. The
//! analyzer itself is pure: weights come from the Bayesian learner and the
//! AI assessment from its provider, both injected per call.

use crate::domain::signals::{
    AiAssessment, Divergence, DivergenceKind, FedSentiment, MarketFeatures, SignalBreakdown,
};
use crate::domain::weights::WeightMap;

/// Bullish/bearish component threshold for internal divergence counting.
const DIVERGENCE_COMPONENT_THRESHOLD: f64 = 0.3;

pub struct SignalAnalyzer;

impl SignalAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Fear & greed, contrarian: extreme fear is a strong buy.
    pub fn fear_greed_signal(&self, fear_greed: i64) -> f64 {
        match fear_greed {
            i64::MIN..=24 => 1.0,
            25..=44 => 0.5,
            45..=55 => 0.0,
            56..=74 => -0.5,
            _ => -1.0,
        }
    }

    /// Seven-band RSI ladder from heavily oversold (+1) to heavily
    /// overbought (-1).
    pub fn rsi_signal(&self, rsi: f64) -> f64 {
        if rsi < 20.0 {
            1.0
        } else if rsi < 30.0 {
            0.7
        } else if rsi < 40.0 {
            0.3
        } else if rsi < 60.0 {
            0.0
        } else if rsi < 70.0 {
            -0.3
        } else if rsi < 80.0 {
            -0.7
        } else {
            -1.0
        }
    }

    /// MACD: crossover direction (0.3) + histogram momentum (0.4, or 0.2 on
    /// sign alone when no previous histogram is known) + zero-line side (0.3).
    pub fn macd_signal(
        &self,
        macd_line: f64,
        macd_signal: f64,
        histogram: f64,
        prev_histogram: Option<f64>,
    ) -> f64 {
        let mut signal: f64 = 0.0;

        signal += if macd_line > macd_signal { 0.3 } else { -0.3 };

        match prev_histogram {
            Some(prev) => signal += if histogram > prev { 0.4 } else { -0.4 },
            None => signal += if histogram > 0.0 { 0.2 } else { -0.2 },
        }

        signal += if macd_line > 0.0 { 0.3 } else { -0.3 };

        signal.clamp(-1.0, 1.0)
    }

    /// SMA alignment: price vs SMA20 (0.3), SMA20 vs SMA50 (0.4),
    /// SMA50 vs SMA200 (0.3, when available).
    pub fn trend_signal(&self, price: f64, sma_20: f64, sma_50: f64, sma_200: Option<f64>) -> f64 {
        let mut signal: f64 = 0.0;

        signal += if price > sma_20 { 0.3 } else { -0.3 };
        signal += if sma_20 > sma_50 { 0.4 } else { -0.4 };

        if let Some(sma_200) = sma_200 {
            signal += if sma_50 > sma_200 { 0.3 } else { -0.3 };
        }

        signal.clamp(-1.0, 1.0)
    }

    /// High volume amplifies the price direction, low volume mutes the
    /// signal entirely, in between it is weakly proportional to the move.
    pub fn volume_signal(&self, volume: f64, avg_volume: f64, price_change: f64) -> f64 {
        if avg_volume == 0.0 {
            return 0.0;
        }

        let ratio = volume / avg_volume;
        if ratio > 1.5 {
            if price_change > 0.0 {
                (ratio - 1.0).min(1.0)
            } else {
                (-(ratio - 1.0)).max(-1.0)
            }
        } else if ratio < 0.5 {
            0.0
        } else {
            price_change / 10.0
        }
    }

    /// Net whale flow normalized by total flow; zero when nothing moved.
    pub fn whale_signal(&self, buys_usd: f64, sells_usd: f64) -> f64 {
        let total = buys_usd + sells_usd;
        if total == 0.0 {
            return 0.0;
        }
        ((buys_usd - sells_usd) / total).clamp(-1.0, 1.0)
    }

    /// Social score centered at 50, blended 60/40 with news sentiment when
    /// news is available.
    pub fn sentiment_signal(&self, social_score: f64, news_sentiment: Option<f64>) -> f64 {
        let social = (social_score - 50.0) / 50.0;
        match news_sentiment {
            Some(news) => social * 0.6 + news * 0.4,
            None => social,
        }
    }

    /// ETF flow bands plus the fed stance, halved ahead of high-impact
    /// events.
    pub fn macro_signal(
        &self,
        etf_flow_7d: f64,
        fed_sentiment: Option<FedSentiment>,
        high_impact_events: usize,
    ) -> f64 {
        let mut signal: f64 = 0.0;

        if etf_flow_7d > 500_000_000.0 {
            signal += 0.5;
        } else if etf_flow_7d > 0.0 {
            signal += 0.2;
        } else if etf_flow_7d < -500_000_000.0 {
            signal -= 0.5;
        } else if etf_flow_7d < 0.0 {
            signal -= 0.2;
        }

        match fed_sentiment {
            Some(FedSentiment::Dovish) => signal += 0.3,
            Some(FedSentiment::Hawkish) => signal -= 0.3,
            _ => {}
        }

        if high_impact_events > 0 {
            signal *= 0.5;
        }

        signal.clamp(-1.0, 1.0)
    }

    /// AI signal: direction code scaled by confidence.
    pub fn ai_signal(&self, ai: &AiAssessment) -> f64 {
        ai.direction.code() * ai.confidence
    }

    /// Build the full breakdown for one decision.
    pub fn analyze(
        &self,
        features: &MarketFeatures,
        ai: &AiAssessment,
        weights: &WeightMap,
    ) -> SignalBreakdown {
        let fear_greed_signal = self.fear_greed_signal(features.fear_greed);
        let rsi_signal = self.rsi_signal(features.rsi);
        let macd_signal = self.macd_signal(
            features.macd_line,
            features.macd_signal,
            features.macd_histogram,
            features.prev_macd_histogram,
        );
        let trend_signal =
            self.trend_signal(features.price, features.sma_20, features.sma_50, features.sma_200);
        let volume_signal =
            self.volume_signal(features.volume, features.avg_volume, features.price_change_24h);
        let whale_signal = self.whale_signal(features.whale_buys_usd, features.whale_sells_usd);
        let sentiment_signal =
            self.sentiment_signal(features.social_score, features.news_sentiment);
        let macro_signal = self.macro_signal(
            features.etf_flow_7d,
            features.fed_sentiment,
            features.high_impact_events,
        );
        let ai_direction_signal = self.ai_signal(ai);

        let weight = |name: &str| weights.get(name).copied().unwrap_or(0.0);

        let math_composite = fear_greed_signal * weight("fear_greed")
            + rsi_signal * weight("rsi")
            + macd_signal * weight("macd")
            + trend_signal * weight("trend")
            + volume_signal * weight("volume")
            + whale_signal * weight("whale")
            + sentiment_signal * weight("sentiment")
            + macro_signal * weight("macro");

        let ai_composite = ai_direction_signal * weight("ai");
        let final_score = (math_composite + ai_composite).clamp(-1.0, 1.0);

        let mut breakdown = SignalBreakdown {
            fear_greed_signal,
            rsi_signal,
            macd_signal,
            trend_signal,
            volume_signal,
            whale_signal,
            sentiment_signal,
            macro_signal,
            ai_direction_signal,
            ai_confidence: ai.confidence,
            ai_risk_level: ai.risk_level,
            playbook_alignment: features.playbook_alignment,
            weights_applied: weights.clone(),
            math_composite,
            ai_composite,
            final_score,
            divergence: None,
        };

        breakdown.divergence = self.detect_divergence(&breakdown);
        breakdown
    }

    /// Exactly one divergence classification is reported; math-vs-AI takes
    /// precedence over internal contradiction when both hold.
    fn detect_divergence(&self, breakdown: &SignalBreakdown) -> Option<Divergence> {
        let math = breakdown.math_composite;
        let ai = breakdown.ai_direction_signal;

        if (math > 0.5 && ai < -0.3) || (math < -0.5 && ai > 0.3) {
            return Some(Divergence {
                kind: DivergenceKind::MathAi,
                strength: (math - ai).abs() / 2.0,
            });
        }

        let math_signals = breakdown.math_signals();
        let bullish = math_signals
            .iter()
            .filter(|(_, s)| *s > DIVERGENCE_COMPONENT_THRESHOLD)
            .count();
        let bearish = math_signals
            .iter()
            .filter(|(_, s)| *s < -DIVERGENCE_COMPONENT_THRESHOLD)
            .count();

        if bullish >= 3 && bearish >= 3 {
            return Some(Divergence {
                kind: DivergenceKind::Internal,
                strength: bullish.min(bearish) as f64 / math_signals.len() as f64,
            });
        }

        None
    }
}

impl Default for SignalAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::signals::{AiDirection, AiRiskLevel};
    use crate::domain::weights::default_weights;

    fn analyzer() -> SignalAnalyzer {
        SignalAnalyzer::new()
    }

    fn bullish_ai(confidence: f64) -> AiAssessment {
        AiAssessment {
            direction: AiDirection::Bullish,
            confidence,
            risk_level: AiRiskLevel::Medium,
            reasoning: None,
        }
    }

    #[test]
    fn test_fear_greed_bands() {
        let a = analyzer();
        assert_eq!(a.fear_greed_signal(10), 1.0);
        assert_eq!(a.fear_greed_signal(24), 1.0);
        assert_eq!(a.fear_greed_signal(25), 0.5);
        assert_eq!(a.fear_greed_signal(50), 0.0);
        assert_eq!(a.fear_greed_signal(60), -0.5);
        assert_eq!(a.fear_greed_signal(75), -1.0);
        assert_eq!(a.fear_greed_signal(100), -1.0);
    }

    #[test]
    fn test_rsi_ladder() {
        let a = analyzer();
        assert_eq!(a.rsi_signal(15.0), 1.0);
        assert_eq!(a.rsi_signal(25.0), 0.7);
        assert_eq!(a.rsi_signal(35.0), 0.3);
        assert_eq!(a.rsi_signal(50.0), 0.0);
        assert_eq!(a.rsi_signal(65.0), -0.3);
        assert_eq!(a.rsi_signal(75.0), -0.7);
        assert_eq!(a.rsi_signal(85.0), -1.0);
    }

    #[test]
    fn test_macd_fully_bullish() {
        let a = analyzer();
        // Line above signal, histogram rising, line above zero.
        let signal = a.macd_signal(1.0, 0.5, 0.3, Some(0.1));
        assert_eq!(signal, 1.0);
        // Without previous histogram, positive histogram contributes 0.2.
        let signal = a.macd_signal(1.0, 0.5, 0.3, None);
        assert!((signal - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_trend_alignment() {
        let a = analyzer();
        assert_eq!(a.trend_signal(110.0, 105.0, 100.0, Some(95.0)), 1.0);
        assert_eq!(a.trend_signal(90.0, 95.0, 100.0, Some(105.0)), -1.0);
        // Without SMA200 only +-0.7 is reachable.
        assert!((a.trend_signal(110.0, 105.0, 100.0, None) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_volume_signal_regimes() {
        let a = analyzer();
        // High volume with rising price amplifies.
        assert!(a.volume_signal(2.0, 1.0, 3.0) > 0.0);
        // High volume with falling price confirms the downside.
        assert!(a.volume_signal(2.0, 1.0, -3.0) < 0.0);
        // Thin volume mutes everything.
        assert_eq!(a.volume_signal(0.3, 1.0, 5.0), 0.0);
        assert_eq!(a.volume_signal(1.0, 0.0, 5.0), 0.0);
    }

    #[test]
    fn test_whale_signal() {
        let a = analyzer();
        assert_eq!(a.whale_signal(0.0, 0.0), 0.0);
        assert_eq!(a.whale_signal(100.0, 0.0), 1.0);
        assert_eq!(a.whale_signal(0.0, 100.0), -1.0);
        assert!((a.whale_signal(75.0, 25.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_sentiment_blend() {
        let a = analyzer();
        assert_eq!(a.sentiment_signal(75.0, None), 0.5);
        // 0.5 * 0.6 + (-0.5) * 0.4 = 0.1
        assert!((a.sentiment_signal(75.0, Some(-0.5)) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_macro_event_damping() {
        let a = analyzer();
        let open = a.macro_signal(600_000_000.0, Some(FedSentiment::Dovish), 0);
        assert!((open - 0.8).abs() < 1e-9);
        let damped = a.macro_signal(600_000_000.0, Some(FedSentiment::Dovish), 1);
        assert!((damped - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_all_components_bounded() {
        let a = analyzer();
        let mut features = MarketFeatures::neutral("BTCUSDT", 50_000.0);
        features.fear_greed = 3;
        features.rsi = 12.0;
        features.volume = 10.0;
        features.price_change_24h = 20.0;
        features.whale_buys_usd = 1e9;
        features.etf_flow_7d = 2e9;

        let breakdown = a.analyze(&features, &bullish_ai(1.0), &default_weights());
        for (_, value) in breakdown.math_signals() {
            assert!((-1.0..=1.0).contains(&value));
        }
        assert!((-1.0..=1.0).contains(&breakdown.final_score));
    }

    #[test]
    fn test_composite_uses_applied_weights() {
        let a = analyzer();
        let features = MarketFeatures::neutral("BTCUSDT", 50_000.0);
        let weights = default_weights();
        let breakdown = a.analyze(&features, &bullish_ai(0.9), &weights);

        // Neutral features leave only trend (0.7 without SMA200... here
        // price == sma20 == sma50 so trend is -0.7) and the AI leg.
        assert_eq!(breakdown.weights_applied, weights);
        let expected_ai = 0.9 * weights["ai"];
        assert!((breakdown.ai_composite - expected_ai).abs() < 1e-9);
        assert!(
            (breakdown.final_score - (breakdown.math_composite + breakdown.ai_composite)).abs()
                < 1e-9
        );
    }

    #[test]
    fn test_math_ai_divergence_takes_precedence() {
        let a = analyzer();
        let mut features = MarketFeatures::neutral("BTCUSDT", 50_000.0);
        // Strongly bullish math picture.
        features.fear_greed = 5;
        features.rsi = 15.0;
        features.macd_line = 2.0;
        features.macd_signal = 1.0;
        features.macd_histogram = 0.5;
        features.prev_macd_histogram = Some(0.1);
        features.sma_20 = 49_000.0;
        features.sma_50 = 48_000.0;
        features.sma_200 = Some(45_000.0);
        features.social_score = 95.0;
        features.etf_flow_7d = 1e9;

        let bearish_ai = AiAssessment {
            direction: AiDirection::Bearish,
            confidence: 0.9,
            risk_level: AiRiskLevel::High,
            reasoning: None,
        };

        let breakdown = a.analyze(&features, &bearish_ai, &default_weights());
        let divergence = breakdown.divergence.expect("divergence expected");
        assert_eq!(divergence.kind, DivergenceKind::MathAi);
        let expected =
            (breakdown.math_composite - breakdown.ai_direction_signal).abs() / 2.0;
        assert!((divergence.strength - expected).abs() < 1e-9);
    }

    #[test]
    fn test_internal_divergence() {
        let a = analyzer();
        let mut features = MarketFeatures::neutral("BTCUSDT", 50_000.0);
        // Three strong bulls: fear_greed, rsi, whale.
        features.fear_greed = 5;
        features.rsi = 15.0;
        features.whale_buys_usd = 100.0;
        // Three strong bears: trend, sentiment, macro.
        features.sma_20 = 55_000.0;
        features.sma_50 = 60_000.0;
        features.sma_200 = Some(65_000.0);
        features.social_score = 5.0;
        features.etf_flow_7d = -1e9;
        // MACD bearish but mild; volume muted.
        features.macd_line = -0.1;
        features.macd_signal = 0.1;
        features.volume = 0.1;

        let breakdown = a.analyze(&features, &AiAssessment::neutral(), &default_weights());
        let divergence = breakdown.divergence.expect("divergence expected");
        assert_eq!(divergence.kind, DivergenceKind::Internal);
        assert!((divergence.strength - 3.0 / 8.0).abs() < 1e-9);
    }
}
