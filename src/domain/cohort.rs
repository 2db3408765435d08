use crate::domain::errors::ConfigError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTolerance {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskTolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTolerance::Low => write!(f, "low"),
            RiskTolerance::Medium => write!(f, "medium"),
            RiskTolerance::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for RiskTolerance {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(RiskTolerance::Low),
            "medium" => Ok(RiskTolerance::Medium),
            "high" => Ok(RiskTolerance::High),
            _ => anyhow::bail!("Invalid risk tolerance: {}", s),
        }
    }
}

/// Per-cohort strategy parameters, stored as JSON in the cohorts table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortConfig {
    pub grid_range_pct: f64,
    pub min_confidence: f64,
    #[serde(default)]
    pub min_fear_greed: i64,
    #[serde(default = "default_max_fear_greed")]
    pub max_fear_greed: i64,
    #[serde(default = "default_true")]
    pub use_playbook: bool,
    #[serde(default = "default_risk_tolerance")]
    pub risk_tolerance: RiskTolerance,
    /// Frozen cohorts reject configuration mutations (baseline control).
    #[serde(default)]
    pub frozen: bool,
}

fn default_max_fear_greed() -> i64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_risk_tolerance() -> RiskTolerance {
    RiskTolerance::Medium
}

impl Default for CohortConfig {
    fn default() -> Self {
        Self {
            grid_range_pct: 5.0,
            min_confidence: 0.5,
            min_fear_greed: 0,
            max_fear_greed: 100,
            use_playbook: true,
            risk_tolerance: RiskTolerance::Medium,
            frozen: false,
        }
    }
}

impl CohortConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if !(1.0..=30.0).contains(&self.grid_range_pct) {
            errors.push(format!(
                "grid_range_pct must be between 1 and 30, got {}",
                self.grid_range_pct
            ));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            errors.push(format!(
                "min_confidence must be between 0 and 1, got {}",
                self.min_confidence
            ));
        }
        if !(0..=100).contains(&self.min_fear_greed) || !(0..=100).contains(&self.max_fear_greed) {
            errors.push("fear & greed bounds must be within 0..100".to_string());
        }
        if self.min_fear_greed > self.max_fear_greed {
            errors.push(format!(
                "min_fear_greed ({}) exceeds max_fear_greed ({})",
                self.min_fear_greed, self.max_fear_greed
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

/// A named, capital-isolated strategy variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cohort {
    pub id: String,
    pub name: String,
    pub description: String,
    pub config: CohortConfig,
    pub starting_capital: Decimal,
    pub current_capital: Decimal,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Cohort {
    /// The single trading gate a cohort exports: active, confident enough,
    /// and fear & greed inside the configured band.
    pub fn should_trade(&self, confidence: f64, fear_greed: i64) -> bool {
        if !self.is_active {
            return false;
        }
        if confidence < self.config.min_confidence {
            return false;
        }
        fear_greed >= self.config.min_fear_greed && fear_greed <= self.config.max_fear_greed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cohort(config: CohortConfig) -> Cohort {
        Cohort {
            id: "test".to_string(),
            name: "test".to_string(),
            description: String::new(),
            config,
            starting_capital: dec!(1000),
            current_capital: dec!(1000),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_should_trade_gates() {
        let c = cohort(CohortConfig {
            min_confidence: 0.7,
            min_fear_greed: 10,
            max_fear_greed: 40,
            ..CohortConfig::default()
        });

        assert!(c.should_trade(0.8, 25));
        assert!(!c.should_trade(0.6, 25)); // confidence below gate
        assert!(!c.should_trade(0.8, 5)); // too fearful
        assert!(!c.should_trade(0.8, 60)); // too greedy

        let mut inactive = c.clone();
        inactive.is_active = false;
        assert!(!inactive.should_trade(0.9, 25));
    }

    #[test]
    fn test_config_validation() {
        assert!(CohortConfig::default().validate().is_ok());

        let bad = CohortConfig {
            grid_range_pct: 45.0,
            min_confidence: 1.3,
            ..CohortConfig::default()
        };
        let err = bad.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("grid_range_pct"));
        assert!(msg.contains("min_confidence"));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = CohortConfig {
            grid_range_pct: 2.0,
            min_confidence: 0.7,
            risk_tolerance: RiskTolerance::Low,
            frozen: true,
            ..CohortConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: CohortConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
