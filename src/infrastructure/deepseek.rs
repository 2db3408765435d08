//! DeepSeek classification provider with daily-call and monthly-cost
//! budgets.
//!
//! The model is asked for a strict JSON verdict; anything unparseable or
//! over budget surfaces as an error and the caller degrades to a neutral
//! assessment.

use crate::domain::ports::AiProvider;
use crate::domain::signals::{AiAssessment, AiDirection, AiRiskLevel, MarketFeatures};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

const API_URL: &str = "https://api.deepseek.com/v1/chat/completions";
const MODEL: &str = "deepseek-chat";

pub const MAX_DAILY_CALLS: u32 = 100;
pub const MAX_MONTHLY_COST_USD: f64 = 5.0;
/// Conservative per-call estimate at current token prices.
const ESTIMATED_COST_PER_CALL_USD: f64 = 0.002;

#[derive(Debug, Clone)]
struct BudgetState {
    day: NaiveDate,
    calls_today: u32,
    month: (i32, u32),
    cost_this_month: f64,
}

impl BudgetState {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            day: now.date_naive(),
            calls_today: 0,
            month: (now.year(), now.month()),
            cost_this_month: 0.0,
        }
    }

    /// Roll counters at day/month boundaries, then check and charge one
    /// call.
    fn charge(&mut self) -> Result<()> {
        let now = Utc::now();
        if now.date_naive() != self.day {
            self.day = now.date_naive();
            self.calls_today = 0;
        }
        if (now.year(), now.month()) != self.month {
            self.month = (now.year(), now.month());
            self.cost_this_month = 0.0;
        }

        if self.calls_today >= MAX_DAILY_CALLS {
            anyhow::bail!("daily AI call budget exhausted ({} calls)", MAX_DAILY_CALLS);
        }
        if self.cost_this_month + ESTIMATED_COST_PER_CALL_USD > MAX_MONTHLY_COST_USD {
            anyhow::bail!(
                "monthly AI cost budget exhausted (${:.2})",
                MAX_MONTHLY_COST_USD
            );
        }

        self.calls_today += 1;
        self.cost_this_month += ESTIMATED_COST_PER_CALL_USD;
        Ok(())
    }
}

pub struct DeepSeekProvider {
    client: Client,
    api_key: String,
    budget: Mutex<BudgetState>,
}

impl DeepSeekProvider {
    pub fn new(api_key: String, timeout_secs: u64) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_key,
            budget: Mutex::new(BudgetState::new()),
        }
    }

    fn build_prompt(features: &MarketFeatures) -> String {
        format!(
            "You are a crypto market analyst. Given these indicators for {}, answer ONLY with \
             a JSON object {{\"direction\": \"BULLISH|BEARISH|NEUTRAL\", \"confidence\": 0.0-1.0, \
             \"risk_level\": \"LOW|MEDIUM|HIGH\", \"reasoning\": \"one sentence\"}}.\n\
             price: {:.2}\nfear_greed: {}\nrsi: {:.1}\nmacd_histogram: {:.4}\n\
             price_vs_sma20: {:.2}%\nvolume_ratio: {:.2}\nprice_change_24h: {:.2}%",
            features.symbol,
            features.price,
            features.fear_greed,
            features.rsi,
            features.macd_histogram,
            if features.sma_20 > 0.0 {
                (features.price / features.sma_20 - 1.0) * 100.0
            } else {
                0.0
            },
            if features.avg_volume > 0.0 {
                features.volume / features.avg_volume
            } else {
                0.0
            },
            features.price_change_24h,
        )
    }

    fn parse_assessment(content: &str) -> Result<AiAssessment> {
        // The model sometimes wraps JSON in code fences; cut them away.
        let trimmed = content
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();

        #[derive(Debug, Deserialize)]
        struct Verdict {
            direction: String,
            confidence: f64,
            risk_level: String,
            reasoning: Option<String>,
        }

        let verdict: Verdict =
            serde_json::from_str(trimmed).context("AI returned unparseable verdict")?;

        Ok(AiAssessment {
            direction: AiDirection::from_str(&verdict.direction)?,
            confidence: verdict.confidence.clamp(0.0, 1.0),
            risk_level: AiRiskLevel::from_str(&verdict.risk_level)?,
            reasoning: verdict.reasoning,
        })
    }
}

#[async_trait]
impl AiProvider for DeepSeekProvider {
    async fn classify(&self, features: &MarketFeatures) -> Result<AiAssessment> {
        self.budget.lock().await.charge()?;

        let body = json!({
            "model": MODEL,
            "messages": [{ "role": "user", "content": Self::build_prompt(features) }],
            "temperature": 0.2,
        });

        let response = self
            .client
            .post(API_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to reach AI provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("AI provider returned {}: {}", status, text);
        }

        #[derive(Debug, Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(Debug, Deserialize)]
        struct Message {
            content: String,
        }
        #[derive(Debug, Deserialize)]
        struct Completion {
            choices: Vec<Choice>,
        }

        let completion: Completion = response
            .json()
            .await
            .context("Failed to parse AI completion")?;
        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default();

        let assessment = Self::parse_assessment(content)?;
        debug!(
            "DeepSeekProvider: {} -> {:?} ({:.2})",
            features.symbol, assessment.direction, assessment.confidence
        );
        Ok(assessment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let assessment = DeepSeekProvider::parse_assessment(
            r#"{"direction": "BULLISH", "confidence": 0.8, "risk_level": "MEDIUM", "reasoning": "momentum"}"#,
        )
        .unwrap();
        assert_eq!(assessment.direction, AiDirection::Bullish);
        assert_eq!(assessment.confidence, 0.8);
        assert_eq!(assessment.risk_level, AiRiskLevel::Medium);
    }

    #[test]
    fn test_parse_fenced_json_and_clamping() {
        let assessment = DeepSeekProvider::parse_assessment(
            "```json\n{\"direction\": \"bearish\", \"confidence\": 1.7, \"risk_level\": \"high\"}\n```",
        )
        .unwrap();
        assert_eq!(assessment.direction, AiDirection::Bearish);
        assert_eq!(assessment.confidence, 1.0);
        assert!(assessment.reasoning.is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DeepSeekProvider::parse_assessment("I think it goes up").is_err());
    }

    #[test]
    fn test_daily_budget_trips() {
        let mut budget = BudgetState::new();
        for _ in 0..MAX_DAILY_CALLS {
            budget.charge().unwrap();
        }
        let err = budget.charge().unwrap_err();
        assert!(err.to_string().contains("daily"));
    }

    #[test]
    fn test_monthly_cost_budget_trips() {
        let mut budget = BudgetState::new();
        budget.cost_this_month = MAX_MONTHLY_COST_USD;
        let err = budget.charge().unwrap_err();
        assert!(err.to_string().contains("monthly"));
    }
}
