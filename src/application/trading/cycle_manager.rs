//! Weekly trading cycles per cohort.
//!
//! Each cycle runs seven days on a fixed starting capital and is closed with
//! a full metric snapshot so cohorts can be compared week over week. Cycle
//! numbers are dense and monotonic per cohort; at most one cycle is active
//! per cohort at any time.

use crate::application::analysis::metrics;
use crate::domain::cycle::{CycleMetrics, CycleStatus, TradingCycle, CYCLE_DURATION_DAYS};
use crate::domain::regime::MarketRegime;
use crate::domain::repositories::{
    CycleRepository, SignalRepository, SnapshotRepository, TradeRepository,
};
use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CycleCloseSummary {
    pub cycle_number: i64,
    pub cohort_name: String,
    pub duration_days: i64,
    pub metrics: CycleMetrics,
}

pub struct CycleManager {
    cycle_repo: Arc<dyn CycleRepository>,
    trade_repo: Arc<dyn TradeRepository>,
    snapshot_repo: Arc<dyn SnapshotRepository>,
    signal_repo: Arc<dyn SignalRepository>,
    active: RwLock<HashMap<String, TradingCycle>>,
}

impl CycleManager {
    pub fn new(
        cycle_repo: Arc<dyn CycleRepository>,
        trade_repo: Arc<dyn TradeRepository>,
        snapshot_repo: Arc<dyn SnapshotRepository>,
        signal_repo: Arc<dyn SignalRepository>,
    ) -> Self {
        Self {
            cycle_repo,
            trade_repo,
            snapshot_repo,
            signal_repo,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Reload active cycles from the store, typically at boot.
    pub async fn restore(&self) -> Result<()> {
        let cycles = self.cycle_repo.active_cycles().await?;
        let mut active = self.active.write().await;
        active.clear();
        for cycle in cycles {
            active.insert(cycle.cohort_id.clone(), cycle);
        }
        info!("CycleManager: {} active cycles loaded", active.len());
        Ok(())
    }

    pub async fn active_cycle(&self, cohort_id: &str) -> Option<TradingCycle> {
        self.active.read().await.get(cohort_id).cloned()
    }

    /// True when the cohort has no active cycle, or its active cycle has run
    /// its full duration.
    pub async fn should_start_new_cycle(&self, cohort_id: &str) -> bool {
        match self.active.read().await.get(cohort_id) {
            Some(cycle) => cycle.age_days(Utc::now()) >= CYCLE_DURATION_DAYS,
            None => true,
        }
    }

    /// Open the next cycle for a cohort, stamping the current playbook
    /// version. Fails while another cycle is still active.
    pub async fn start_cycle(
        &self,
        cohort_id: &str,
        cohort_name: &str,
        starting_capital: Decimal,
    ) -> Result<TradingCycle> {
        if self.active.read().await.contains_key(cohort_id) {
            anyhow::bail!("cohort {} already has an active cycle", cohort_name);
        }

        let playbook_version = self.cycle_repo.current_playbook_version().await?;
        let cycle_number = self.cycle_repo.next_cycle_number(cohort_id).await?;

        let cycle = TradingCycle {
            id: Uuid::new_v4().to_string(),
            cohort_id: cohort_id.to_string(),
            cohort_name: cohort_name.to_string(),
            cycle_number,
            start_date: Utc::now(),
            end_date: None,
            status: CycleStatus::Active,
            starting_capital,
            ending_capital: None,
            trades_count: 0,
            winning_trades: 0,
            losing_trades: 0,
            total_pnl: None,
            total_pnl_pct: None,
            max_drawdown: None,
            sharpe_ratio: None,
            sortino_ratio: None,
            calmar_ratio: None,
            kelly_fraction: None,
            var_95: None,
            cvar_95: None,
            avg_fear_greed: None,
            dominant_regime: None,
            btc_performance_pct: None,
            playbook_version_at_start: playbook_version,
            playbook_version_at_end: None,
        };

        self.cycle_repo
            .insert(&cycle)
            .await
            .context("Failed to insert new trading cycle")?;
        self.active
            .write()
            .await
            .insert(cohort_id.to_string(), cycle.clone());

        info!(
            "CycleManager: cycle #{} started for {} (${})",
            cycle.cycle_number, cohort_name, starting_capital
        );
        Ok(cycle)
    }

    /// Close the active cycle of a cohort with a full metric snapshot.
    /// Precomputed metrics can be supplied; otherwise they are derived from
    /// the cycle's trades.
    pub async fn close_cycle(
        &self,
        cohort_id: &str,
        metrics: Option<CycleMetrics>,
    ) -> Result<Option<CycleCloseSummary>> {
        let cycle = match self.active.read().await.get(cohort_id) {
            Some(cycle) => cycle.clone(),
            None => {
                warn!("CycleManager: no active cycle for cohort {}", cohort_id);
                return Ok(None);
            }
        };

        let metrics = match metrics {
            Some(metrics) => metrics,
            None => self.compute_cycle_metrics(&cycle).await?,
        };
        let playbook_version = self.cycle_repo.current_playbook_version().await?;

        self.cycle_repo
            .close(&cycle.id, Utc::now(), &metrics, playbook_version)
            .await
            .context("Failed to close trading cycle")?;
        self.active.write().await.remove(cohort_id);

        info!(
            "CycleManager: cycle #{} closed for {} (pnl {:.2}%)",
            cycle.cycle_number, cycle.cohort_name, metrics.total_pnl_pct
        );

        Ok(Some(CycleCloseSummary {
            cycle_number: cycle.cycle_number,
            cohort_name: cycle.cohort_name.clone(),
            duration_days: CYCLE_DURATION_DAYS,
            metrics,
        }))
    }

    /// Abort the active cycle without metrics.
    pub async fn cancel_cycle(&self, cohort_id: &str) -> Result<()> {
        let Some(cycle) = self.active.write().await.remove(cohort_id) else {
            return Ok(());
        };
        self.cycle_repo.cancel(&cycle.id).await?;
        warn!(
            "CycleManager: cycle #{} cancelled for {}",
            cycle.cycle_number, cycle.cohort_name
        );
        Ok(())
    }

    /// Last `n` completed cycles for a cohort, newest first.
    pub async fn cycle_comparison(&self, cohort_id: &str, n: i64) -> Result<Vec<TradingCycle>> {
        self.cycle_repo.completed(cohort_id, n).await
    }

    /// Derive the end-of-cycle bundle from persisted trades.
    async fn compute_cycle_metrics(&self, cycle: &TradingCycle) -> Result<CycleMetrics> {
        let stats = self.trade_repo.cycle_stats(&cycle.id).await?;
        let daily_returns = self.trade_repo.daily_returns(&cycle.id).await?;

        let net_flow = self.trade_repo.net_flow(&cycle.id).await?;
        let ending_capital = cycle.starting_capital + net_flow;
        let total_pnl = net_flow;
        let starting = cycle.starting_capital.to_f64().unwrap_or(0.0);
        let total_pnl_pct = if starting > 0.0 {
            total_pnl.to_f64().unwrap_or(0.0) / starting * 100.0
        } else {
            0.0
        };

        let max_drawdown = metrics::max_drawdown(&daily_returns).ok();
        let win_rate = metrics::win_rate(&daily_returns).ok();
        let (avg_win, avg_loss) = metrics::avg_win_loss(&daily_returns);
        let kelly_fraction = match (win_rate, avg_win, avg_loss) {
            (Some(p), Some(w), Some(l)) => metrics::kelly_fraction(p, w, l, 1.0).ok(),
            _ => None,
        };

        let dominant_regime = {
            let regimes = self.trade_repo.cycle_regimes(&cycle.id).await?;
            dominant_regime(&regimes)
        };

        let btc_performance_pct = self
            .snapshot_repo
            .btc_price_range(cycle.start_date, Utc::now())
            .await?
            .filter(|(start, _)| *start > 0.0)
            .map(|(start, end)| (end - start) / start * 100.0);

        let signal_performance = self.signal_repo.cycle_signal_accuracy(&cycle.id).await?;
        let (best_patterns, worst_patterns) = self.pattern_lists(&cycle.id).await?;

        Ok(CycleMetrics {
            ending_capital,
            trades_count: stats.trades_count,
            winning_trades: stats.winning_trades,
            losing_trades: stats.losing_trades,
            total_pnl,
            total_pnl_pct,
            max_drawdown,
            sharpe_ratio: metrics::sharpe_ratio(&daily_returns, None, true).ok(),
            sortino_ratio: metrics::sortino_ratio(&daily_returns, None, true)
                .ok()
                .filter(|s| s.is_finite()),
            calmar_ratio: metrics::calmar_ratio(&daily_returns, max_drawdown).ok(),
            kelly_fraction,
            var_95: metrics::value_at_risk(&daily_returns, 0.95).ok(),
            cvar_95: metrics::conditional_var(&daily_returns, 0.95).ok(),
            avg_fear_greed: stats.avg_fear_greed,
            dominant_regime,
            btc_performance_pct,
            signal_performance,
            best_patterns,
            worst_patterns,
        })
    }

    /// Top and bottom symbols by realized pnl within the cycle.
    async fn pattern_lists(
        &self,
        cycle_id: &str,
    ) -> Result<(Option<serde_json::Value>, Option<serde_json::Value>)> {
        let mut pnls = self.trade_repo.cycle_symbol_pnls(cycle_id).await?;
        if pnls.is_empty() {
            return Ok((None, None));
        }
        pnls.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let to_json = |slice: &[(String, f64)]| {
            serde_json::Value::Array(
                slice
                    .iter()
                    .map(|(symbol, pnl)| {
                        serde_json::json!({ "symbol": symbol, "pnl_pct": pnl })
                    })
                    .collect(),
            )
        };

        let best: Vec<(String, f64)> = pnls.iter().take(3).cloned().collect();
        let worst: Vec<(String, f64)> = pnls.iter().rev().take(3).cloned().collect();
        Ok((Some(to_json(&best)), Some(to_json(&worst))))
    }
}

/// Mode over per-trade regimes; ties break to SIDEWAYS.
pub fn dominant_regime(regimes: &[MarketRegime]) -> Option<MarketRegime> {
    if regimes.is_empty() {
        return None;
    }

    let mut counts: HashMap<MarketRegime, usize> = HashMap::new();
    for regime in regimes {
        *counts.entry(*regime).or_default() += 1;
    }

    let max = counts.values().copied().max().unwrap_or(0);
    let leaders: Vec<MarketRegime> = counts
        .into_iter()
        .filter(|(_, count)| *count == max)
        .map(|(regime, _)| regime)
        .collect();

    if leaders.len() == 1 {
        Some(leaders[0])
    } else {
        Some(MarketRegime::Sideways)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dominant_regime_mode() {
        let regimes = [
            MarketRegime::Bull,
            MarketRegime::Bull,
            MarketRegime::Bear,
        ];
        assert_eq!(dominant_regime(&regimes), Some(MarketRegime::Bull));
    }

    #[test]
    fn test_dominant_regime_tie_breaks_sideways() {
        let regimes = [
            MarketRegime::Bull,
            MarketRegime::Bear,
            MarketRegime::Bear,
            MarketRegime::Bull,
        ];
        assert_eq!(dominant_regime(&regimes), Some(MarketRegime::Sideways));
        assert_eq!(dominant_regime(&[]), None);
    }
}
