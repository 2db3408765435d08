//! Cohort catalog: the parallel strategy variants under test.
//!
//! Cohorts are loaded from the store at startup. When no store is reachable
//! the manager falls back to the four built-in variants (conservative,
//! balanced, aggressive and a frozen baseline) held purely in memory.

use crate::domain::cohort::{Cohort, CohortConfig, RiskTolerance};
use crate::domain::repositories::{CohortComparisonRow, CohortRepository};
use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const DEFAULT_CAPITAL: i64 = 1000;

pub struct CohortManager {
    repo: Option<Arc<dyn CohortRepository>>,
    cohorts: RwLock<HashMap<String, Cohort>>,
}

impl CohortManager {
    pub fn new(repo: Option<Arc<dyn CohortRepository>>) -> Self {
        Self {
            repo,
            cohorts: RwLock::new(HashMap::new()),
        }
    }

    /// Load cohorts from the store, falling back to the in-memory defaults
    /// when the store is missing, empty or erroring.
    pub async fn load(&self) -> Result<()> {
        let loaded = match &self.repo {
            Some(repo) => match repo.load_active().await {
                Ok(cohorts) if !cohorts.is_empty() => Some(cohorts),
                Ok(_) => {
                    info!("CohortManager: store has no cohorts, seeding defaults");
                    let defaults = default_cohorts();
                    for cohort in &defaults {
                        if let Err(e) = repo.insert(cohort).await {
                            warn!("CohortManager: failed to seed cohort {}: {}", cohort.name, e);
                        }
                    }
                    Some(defaults)
                }
                Err(e) => {
                    error!("CohortManager: load failed, using in-memory defaults: {}", e);
                    None
                }
            },
            None => None,
        };

        let cohorts = loaded.unwrap_or_else(default_cohorts);
        let mut map = self.cohorts.write().await;
        map.clear();
        for cohort in cohorts {
            map.insert(cohort.name.clone(), cohort);
        }
        info!("CohortManager: {} cohorts loaded", map.len());
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Cohort> {
        self.cohorts.read().await.get(name).cloned()
    }

    pub async fn active_cohorts(&self) -> Vec<Cohort> {
        self.cohorts
            .read()
            .await
            .values()
            .filter(|c| c.is_active)
            .cloned()
            .collect()
    }

    /// Cohorts that would trade at the given confidence and sentiment.
    pub async fn trading_cohorts(&self, confidence: f64, fear_greed: i64) -> Vec<Cohort> {
        self.active_cohorts()
            .await
            .into_iter()
            .filter(|c| c.should_trade(confidence, fear_greed))
            .collect()
    }

    /// Update a cohort's capital, in memory and in the store.
    pub async fn update_capital(&self, name: &str, capital: Decimal) -> Result<()> {
        {
            let mut cohorts = self.cohorts.write().await;
            match cohorts.get_mut(name) {
                Some(cohort) => cohort.current_capital = capital,
                None => {
                    warn!("CohortManager: cohort '{}' not found", name);
                    return Ok(());
                }
            }
        }

        if let Some(repo) = &self.repo {
            repo.update_capital(name, capital).await?;
        }
        Ok(())
    }

    /// Replace a cohort's configuration. Frozen cohorts reject this.
    pub async fn update_config(&self, name: &str, config: CohortConfig) -> Result<()> {
        config.validate()?;

        {
            let mut cohorts = self.cohorts.write().await;
            let Some(cohort) = cohorts.get_mut(name) else {
                anyhow::bail!("cohort '{}' not found", name);
            };
            if cohort.config.frozen {
                anyhow::bail!("cohort '{}' is frozen and rejects mutations", name);
            }
            cohort.config = config.clone();
        }

        if let Some(repo) = &self.repo {
            repo.update_config(name, &config).await?;
        }
        Ok(())
    }

    /// Cross-cohort comparison rows from the store view. Empty without a
    /// store.
    pub async fn comparison_report(&self) -> Result<Vec<CohortComparisonRow>> {
        match &self.repo {
            Some(repo) => repo.comparison_report(50).await,
            None => Ok(Vec::new()),
        }
    }
}

/// The four built-in variants used when no store is reachable.
pub fn default_cohorts() -> Vec<Cohort> {
    let capital = Decimal::from(DEFAULT_CAPITAL);
    let entries = [
        (
            "conservative",
            "Tight grids, high confidence required",
            CohortConfig {
                grid_range_pct: 2.0,
                min_confidence: 0.7,
                max_fear_greed: 40,
                risk_tolerance: RiskTolerance::Low,
                ..CohortConfig::default()
            },
        ),
        (
            "balanced",
            "Standard grids, playbook-driven",
            CohortConfig {
                grid_range_pct: 5.0,
                min_confidence: 0.5,
                use_playbook: true,
                ..CohortConfig::default()
            },
        ),
        (
            "aggressive",
            "Wide grids, higher risk",
            CohortConfig {
                grid_range_pct: 8.0,
                min_confidence: 0.3,
                risk_tolerance: RiskTolerance::High,
                ..CohortConfig::default()
            },
        ),
        (
            "baseline",
            "Unchanged control cohort",
            CohortConfig {
                grid_range_pct: 5.0,
                min_confidence: 0.5,
                frozen: true,
                ..CohortConfig::default()
            },
        ),
    ];

    entries
        .into_iter()
        .map(|(name, description, config)| Cohort {
            id: format!("default-{}", name),
            name: name.to_string(),
            description: description.to_string(),
            config,
            starting_capital: capital,
            current_capital: capital,
            is_active: true,
            created_at: Utc::now(),
        })
        .collect()
}
