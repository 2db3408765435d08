use crate::domain::cohort::Cohort;
use crate::domain::errors::ConfigError;
use crate::domain::hybrid::TradingMode;
use anyhow::{Context, Result};
use rust_decimal::prelude::ToPrimitive;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintsPreset {
    Small,
    Conservative,
    Balanced,
    Aggressive,
}

impl FromStr for ConstraintsPreset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "small" => Ok(ConstraintsPreset::Small),
            "conservative" => Ok(ConstraintsPreset::Conservative),
            "balanced" => Ok(ConstraintsPreset::Balanced),
            "aggressive" => Ok(ConstraintsPreset::Aggressive),
            _ => anyhow::bail!(
                "Invalid HYBRID_CONSTRAINTS_PRESET: {}. Must be small, conservative, balanced or aggressive",
                s
            ),
        }
    }
}

/// Timeouts, retries and rate limits for all outbound calls.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub timeout_default_secs: u64,
    pub timeout_ai_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_secs: f64,
    pub retry_max_delay_secs: f64,
    /// Safety buffer under the venue's 1200/min allowance.
    pub venue_requests_per_minute: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            timeout_default_secs: 10,
            timeout_ai_secs: 30,
            max_retries: 3,
            retry_base_delay_secs: 1.0,
            retry_max_delay_secs: 30.0,
            venue_requests_per_minute: 1000,
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            timeout_default_secs: env::var("API_TIMEOUT_DEFAULT")
                .unwrap_or_else(|_| defaults.timeout_default_secs.to_string())
                .parse()
                .context("Failed to parse API_TIMEOUT_DEFAULT")?,
            timeout_ai_secs: env::var("API_TIMEOUT_AI")
                .unwrap_or_else(|_| defaults.timeout_ai_secs.to_string())
                .parse()
                .context("Failed to parse API_TIMEOUT_AI")?,
            max_retries: env::var("API_MAX_RETRIES")
                .unwrap_or_else(|_| defaults.max_retries.to_string())
                .parse()
                .context("Failed to parse API_MAX_RETRIES")?,
            retry_base_delay_secs: defaults.retry_base_delay_secs,
            retry_max_delay_secs: defaults.retry_max_delay_secs,
            venue_requests_per_minute: env::var("VENUE_REQUESTS_PER_MINUTE")
                .unwrap_or_else(|_| defaults.venue_requests_per_minute.to_string())
                .parse()
                .context("Failed to parse VENUE_REQUESTS_PER_MINUTE")?,
        })
    }
}

/// Configuration of one regime-adaptive hybrid orchestrator.
#[derive(Debug, Clone)]
pub struct HybridConfig {
    pub initial_mode: TradingMode,
    pub enable_mode_switching: bool,

    // Hysteresis: probability, regime age and mode cooldown must all agree
    // before a transition fires.
    pub min_regime_probability: f64,
    pub min_regime_duration_days: i64,
    pub mode_cooldown_hours: i64,

    pub hold_trailing_stop_pct: f64,

    pub grid_range_percent: f64,
    pub num_grids: usize,

    pub cash_exit_timeout_hours: f64,

    pub max_symbols: usize,
    pub min_position_usd: f64,
    pub total_investment: f64,

    pub min_confidence: f64,
    pub constraints_preset: ConstraintsPreset,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            initial_mode: TradingMode::Grid,
            enable_mode_switching: true,
            min_regime_probability: 0.75,
            min_regime_duration_days: 2,
            mode_cooldown_hours: 24,
            hold_trailing_stop_pct: 7.0,
            grid_range_percent: 5.0,
            num_grids: 3,
            cash_exit_timeout_hours: 2.0,
            max_symbols: 8,
            min_position_usd: 10.0,
            total_investment: 400.0,
            min_confidence: 0.3,
            constraints_preset: ConstraintsPreset::Small,
        }
    }
}

impl HybridConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if !(0.5..=1.0).contains(&self.min_regime_probability) {
            errors.push(format!(
                "min_regime_probability must be between 0.5 and 1.0, got {}",
                self.min_regime_probability
            ));
        }
        if self.min_regime_duration_days < 0 {
            errors.push("min_regime_duration_days must be non-negative".to_string());
        }
        if self.mode_cooldown_hours < 0 {
            errors.push("mode_cooldown_hours must be non-negative".to_string());
        }
        if self.hold_trailing_stop_pct <= 0.0 || self.hold_trailing_stop_pct > 50.0 {
            errors.push(format!(
                "hold_trailing_stop_pct must be between 0 and 50, got {}",
                self.hold_trailing_stop_pct
            ));
        }
        if !(1.0..=30.0).contains(&self.grid_range_percent) {
            errors.push(format!(
                "grid_range_percent must be between 1 and 30, got {}",
                self.grid_range_percent
            ));
        }
        if self.num_grids < 1 || self.num_grids > 50 {
            errors.push(format!("num_grids must be between 1 and 50, got {}", self.num_grids));
        }
        if self.total_investment < 10.0 {
            errors.push(format!(
                "total_investment must be at least 10 USD, got {}",
                self.total_investment
            ));
        }
        if self.max_symbols < 1 || self.max_symbols > 20 {
            errors.push(format!(
                "max_symbols must be between 1 and 20, got {}",
                self.max_symbols
            ));
        }
        if self.min_position_usd < 5.0 {
            errors.push(format!(
                "min_position_usd must be at least 5 (exchange minimum), got {}",
                self.min_position_usd
            ));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            errors.push(format!(
                "min_confidence must be between 0.0 and 1.0, got {}",
                self.min_confidence
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            initial_mode: TradingMode::from_str(
                &env::var("HYBRID_INITIAL_MODE").unwrap_or_else(|_| "GRID".to_string()),
            )?,
            enable_mode_switching: env::var("HYBRID_ENABLE_MODE_SWITCHING")
                .unwrap_or_else(|_| "true".to_string())
                .to_lowercase()
                == "true",
            min_regime_probability: env::var("HYBRID_MIN_REGIME_PROBABILITY")
                .unwrap_or_else(|_| "0.75".to_string())
                .parse()
                .context("Failed to parse HYBRID_MIN_REGIME_PROBABILITY")?,
            min_regime_duration_days: env::var("HYBRID_MIN_REGIME_DURATION_DAYS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("Failed to parse HYBRID_MIN_REGIME_DURATION_DAYS")?,
            mode_cooldown_hours: env::var("HYBRID_MODE_COOLDOWN_HOURS")
                .unwrap_or_else(|_| "24".to_string())
                .parse()
                .context("Failed to parse HYBRID_MODE_COOLDOWN_HOURS")?,
            hold_trailing_stop_pct: env::var("HYBRID_HOLD_TRAILING_STOP_PCT")
                .unwrap_or_else(|_| "7.0".to_string())
                .parse()
                .context("Failed to parse HYBRID_HOLD_TRAILING_STOP_PCT")?,
            grid_range_percent: env::var("GRID_RANGE_PERCENT")
                .unwrap_or_else(|_| "5.0".to_string())
                .parse()
                .context("Failed to parse GRID_RANGE_PERCENT")?,
            num_grids: env::var("NUM_GRIDS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("Failed to parse NUM_GRIDS")?,
            cash_exit_timeout_hours: env::var("HYBRID_CASH_EXIT_TIMEOUT_HOURS")
                .unwrap_or_else(|_| "2.0".to_string())
                .parse()
                .context("Failed to parse HYBRID_CASH_EXIT_TIMEOUT_HOURS")?,
            max_symbols: env::var("HYBRID_MAX_SYMBOLS")
                .unwrap_or_else(|_| "8".to_string())
                .parse()
                .context("Failed to parse HYBRID_MAX_SYMBOLS")?,
            min_position_usd: env::var("HYBRID_MIN_POSITION_USD")
                .unwrap_or_else(|_| "10.0".to_string())
                .parse()
                .context("Failed to parse HYBRID_MIN_POSITION_USD")?,
            total_investment: env::var("HYBRID_TOTAL_INVESTMENT")
                .unwrap_or_else(|_| defaults.total_investment.to_string())
                .parse()
                .context("Failed to parse HYBRID_TOTAL_INVESTMENT")?,
            min_confidence: env::var("HYBRID_MIN_CONFIDENCE")
                .unwrap_or_else(|_| "0.3".to_string())
                .parse()
                .context("Failed to parse HYBRID_MIN_CONFIDENCE")?,
            constraints_preset: ConstraintsPreset::from_str(
                &env::var("HYBRID_CONSTRAINTS_PRESET").unwrap_or_else(|_| "small".to_string()),
            )?,
        })
    }

    /// Per-cohort configuration: the cohort supplies confidence gate, grid
    /// width and capital; the environment supplies the hysteresis knobs.
    ///
    /// Small-capital cohorts run two grids on at most two coins so every
    /// grid level clears the venue's 5 USD notional floor. Risk
    /// differentiation comes from grid width and confidence, not presets.
    pub fn from_cohort(cohort: &Cohort) -> Result<Self> {
        let env_config = Self::from_env()?;
        Ok(Self {
            min_confidence: cohort.config.min_confidence,
            grid_range_percent: cohort.config.grid_range_pct,
            num_grids: 2,
            max_symbols: 2,
            total_investment: cohort.current_capital.to_f64().unwrap_or(0.0),
            constraints_preset: ConstraintsPreset::Small,
            ..env_config
        })
    }
}

/// Process-wide configuration assembled from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub binance_testnet: bool,
    pub binance_api_key: String,
    pub binance_api_secret: String,
    pub paper_trading: bool,
    pub paper_initial_usdt: f64,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub deepseek_api_key: Option<String>,
    /// Directory for grid/hybrid state files.
    pub state_dir: PathBuf,
    pub heartbeat_path: PathBuf,
    pub daily_summary_hour: u32,
    /// Opt-in: run the portfolio tier health check.
    pub portfolio_manager: bool,
    pub api: ApiConfig,
    pub hybrid: HybridConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let binance_testnet = env::var("BINANCE_TESTNET")
            .unwrap_or_else(|_| "true".to_string())
            .to_lowercase()
            == "true";

        let key_var = if binance_testnet {
            "BINANCE_TESTNET_API_KEY"
        } else {
            "BINANCE_API_KEY"
        };
        let secret_var = if binance_testnet {
            "BINANCE_TESTNET_API_SECRET"
        } else {
            "BINANCE_API_SECRET"
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/gridcohort.db".to_string()),
            binance_testnet,
            binance_api_key: env::var(key_var).unwrap_or_default(),
            binance_api_secret: env::var(secret_var).unwrap_or_default(),
            paper_trading: env::var("PAPER_TRADING")
                .unwrap_or_else(|_| "false".to_string())
                .to_lowercase()
                == "true",
            paper_initial_usdt: env::var("PAPER_INITIAL_USDT")
                .unwrap_or_else(|_| "6000".to_string())
                .parse()
                .context("Failed to parse PAPER_INITIAL_USDT")?,
            telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN").ok().filter(|s| !s.is_empty()),
            telegram_chat_id: env::var("TELEGRAM_CHAT_ID").ok().filter(|s| !s.is_empty()),
            deepseek_api_key: env::var("DEEPSEEK_API_KEY").ok().filter(|s| !s.is_empty()),
            state_dir: PathBuf::from(env::var("STATE_DIR").unwrap_or_else(|_| "config".to_string())),
            heartbeat_path: PathBuf::from(
                env::var("HEARTBEAT_PATH").unwrap_or_else(|_| "data/heartbeat".to_string()),
            ),
            daily_summary_hour: env::var("DAILY_SUMMARY_HOUR")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .context("Failed to parse DAILY_SUMMARY_HOUR")?,
            portfolio_manager: env::var("PORTFOLIO_MANAGER")
                .unwrap_or_else(|_| "false".to_string())
                .to_lowercase()
                == "true",
            api: ApiConfig::from_env()?,
            hybrid: HybridConfig::from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hybrid_defaults_validate() {
        assert!(HybridConfig::default().validate().is_ok());
    }

    #[test]
    fn test_hybrid_validation_catches_bad_values() {
        let mut config = HybridConfig::default();
        config.min_regime_probability = 0.3;
        config.hold_trailing_stop_pct = 90.0;
        config.min_position_usd = 1.0;
        config.max_symbols = 0;

        let err = config.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("min_regime_probability"));
        assert!(msg.contains("hold_trailing_stop_pct"));
        assert!(msg.contains("min_position_usd"));
        assert!(msg.contains("max_symbols"));
    }

    #[test]
    fn test_from_cohort_maps_fields() {
        use crate::domain::cohort::{Cohort, CohortConfig};
        use chrono::Utc;
        use rust_decimal::Decimal;

        let cohort = Cohort {
            id: "c1".to_string(),
            name: "aggressive".to_string(),
            description: String::new(),
            config: CohortConfig {
                grid_range_pct: 8.0,
                min_confidence: 0.3,
                ..CohortConfig::default()
            },
            starting_capital: Decimal::from(1000),
            current_capital: Decimal::from(850),
            is_active: true,
            created_at: Utc::now(),
        };

        let config = HybridConfig::from_cohort(&cohort).unwrap();
        assert_eq!(config.grid_range_percent, 8.0);
        assert_eq!(config.min_confidence, 0.3);
        assert_eq!(config.total_investment, 850.0);
        assert_eq!(config.max_symbols, 2);
        assert_eq!(config.num_grids, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_constraints_preset_parsing() {
        assert_eq!(
            ConstraintsPreset::from_str("balanced").unwrap(),
            ConstraintsPreset::Balanced
        );
        assert!(ConstraintsPreset::from_str("huge").is_err());
    }
}
