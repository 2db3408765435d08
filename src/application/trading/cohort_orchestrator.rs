//! Top-level supervisor: one hybrid orchestrator per active cohort, all
//! sharing a single venue client.
//!
//! The main loop ticks every cohort sequentially every 30 seconds. Errors
//! inside one cohort are logged and isolated; only repeated supervisor-level
//! faults (five in a row) stop the process.

use crate::application::trading::hybrid_orchestrator::{HybridOrchestrator, HybridServices};
use crate::config::HybridConfig;
use anyhow::Result;
use chrono::{Timelike, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info, warn};

pub const TICK_INTERVAL_SECS: u64 = 30;
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

pub struct CohortOrchestrator {
    services: HybridServices,
    orchestrators: HashMap<String, HybridOrchestrator>,
    consecutive_errors: u32,
    daily_summary_hour: u32,
    last_summary_day: Option<chrono::NaiveDate>,
}

impl CohortOrchestrator {
    pub fn new(services: HybridServices, daily_summary_hour: u32) -> Self {
        Self {
            services,
            orchestrators: HashMap::new(),
            consecutive_errors: 0,
            daily_summary_hour,
            last_summary_day: None,
        }
    }

    pub fn cohort_count(&self) -> usize {
        self.orchestrators.len()
    }

    /// Build one hybrid orchestrator per active cohort, validating each
    /// per-cohort configuration first. Returns true when at least one cohort
    /// initialized.
    pub async fn initialize(&mut self) -> Result<bool> {
        let cohorts = self.services.cohort_manager.active_cohorts().await;
        if cohorts.is_empty() {
            error!("CohortOrchestrator: no active cohorts found");
            return Ok(false);
        }

        let total = cohorts.len();
        for cohort in cohorts {
            let config = match HybridConfig::from_cohort(&cohort) {
                Ok(config) => config,
                Err(e) => {
                    error!(
                        "CohortOrchestrator: config build failed for {}: {}",
                        cohort.name, e
                    );
                    continue;
                }
            };
            if let Err(e) = config.validate() {
                error!(
                    "CohortOrchestrator: invalid config for {}: {}",
                    cohort.name, e
                );
                continue;
            }

            info!(
                "CohortOrchestrator: initialized {} (${}, grid={}%)",
                cohort.name, cohort.current_capital, config.grid_range_percent
            );
            self.orchestrators.insert(
                cohort.name.clone(),
                HybridOrchestrator::new(cohort, config, self.services.clone()),
            );
        }

        info!(
            "CohortOrchestrator: {}/{} cohorts initialized",
            self.orchestrators.len(),
            total
        );
        Ok(!self.orchestrators.is_empty())
    }

    /// Run the initial symbol scan for every cohort. Returns how many
    /// cohorts received allocations.
    pub async fn initial_allocation(&mut self) -> usize {
        let mut allocated = 0;
        for (name, orchestrator) in self.orchestrators.iter_mut() {
            match orchestrator.scan_and_allocate().await {
                Ok(result) if !result.allocations.is_empty() => {
                    allocated += 1;
                    let symbols: Vec<&str> =
                        result.allocations.keys().map(String::as_str).collect();
                    info!(
                        "CohortOrchestrator: {} allocated ${:.2} -> [{}]",
                        name,
                        result.total_allocated,
                        symbols.join(", ")
                    );
                }
                Ok(_) => warn!("CohortOrchestrator: {} got no allocations", name),
                Err(e) => error!("CohortOrchestrator: {} allocation failed: {}", name, e),
            }
        }
        allocated
    }

    /// One tick across all cohorts. Per-cohort errors are logged and do not
    /// abort the others; the heartbeat is touched unconditionally.
    pub async fn tick(&mut self) -> Result<()> {
        for (name, orchestrator) in self.orchestrators.iter_mut() {
            if let Err(e) = orchestrator.tick().await {
                error!("CohortOrchestrator: {} tick error: {}", name, e);
            }
        }

        self.services.state_store.touch_heartbeat()?;
        self.maybe_send_daily_summary().await;
        Ok(())
    }

    /// Main loop. Terminates cleanly on ctrl-c (state saved) or with an
    /// error after `MAX_CONSECUTIVE_ERRORS` supervisor-level faults.
    pub async fn run(&mut self) -> Result<()> {
        if self.orchestrators.is_empty() {
            anyhow::bail!("no cohort orchestrators configured");
        }

        self.load_state();
        info!(
            "CohortOrchestrator: starting {} cohorts (tick every {}s)",
            self.orchestrators.len(),
            TICK_INTERVAL_SECS
        );

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("CohortOrchestrator: shutdown signal received");
                    break;
                }
                result = self.tick() => {
                    match result {
                        Ok(()) => self.consecutive_errors = 0,
                        Err(e) => {
                            self.consecutive_errors += 1;
                            error!(
                                "CohortOrchestrator: supervisor error ({}/{}): {}",
                                self.consecutive_errors, MAX_CONSECUTIVE_ERRORS, e
                            );
                            if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                                self.save_state();
                                anyhow::bail!("too many consecutive supervisor errors, stopping");
                            }
                            // Linear backoff before trying again.
                            let backoff = TICK_INTERVAL_SECS * self.consecutive_errors as u64;
                            tokio::time::sleep(Duration::from_secs(backoff)).await;
                        }
                    }
                }
            }

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("CohortOrchestrator: shutdown signal received");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_secs(TICK_INTERVAL_SECS)) => {}
            }
        }

        self.save_state();
        info!("CohortOrchestrator: stopped");
        Ok(())
    }

    pub fn load_state(&mut self) {
        for (name, orchestrator) in self.orchestrators.iter_mut() {
            if let Err(e) = orchestrator.load_state() {
                error!("CohortOrchestrator: {} load_state error: {}", name, e);
            }
        }
    }

    pub fn save_state(&self) {
        for (name, orchestrator) in self.orchestrators.iter() {
            if let Err(e) = orchestrator.save_state() {
                error!("CohortOrchestrator: {} save_state error: {}", name, e);
            }
        }
    }

    /// Status of every cohort, for the daily summary.
    pub fn all_status(&self) -> serde_json::Value {
        let statuses: serde_json::Map<String, serde_json::Value> = self
            .orchestrators
            .iter()
            .map(|(name, orchestrator)| (name.clone(), orchestrator.status()))
            .collect();
        serde_json::Value::Object(statuses)
    }

    async fn maybe_send_daily_summary(&mut self) {
        let now = Utc::now();
        if now.hour() != self.daily_summary_hour {
            return;
        }
        if self.last_summary_day == Some(now.date_naive()) {
            return;
        }
        self.last_summary_day = Some(now.date_naive());

        let status = self.all_status();
        let mut lines = vec!["Daily cohort summary".to_string()];
        if let serde_json::Value::Object(cohorts) = &status {
            for (name, cohort) in cohorts {
                let mode = cohort["mode"].as_str().unwrap_or("?");
                let symbols = cohort["symbols"].as_object().map(|s| s.len()).unwrap_or(0);
                lines.push(format!("- {}: mode {}, {} symbols", name, mode, symbols));
            }
        }
        let text = lines.join("\n");
        if let Err(e) = self.services.notifier.send(&text, false).await {
            warn!("CohortOrchestrator: daily summary failed: {}", e);
        }
    }
}
