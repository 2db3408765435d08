//! Reconciliation, plausibility and health checks.
//!
//! Every task reads persisted snapshots only (state files, store tables,
//! venue queries) and never mutates strategy state: inconsistencies are
//! reported through the notifier, not auto-healed.

use crate::domain::ports::{Notifier, VenueClient};
use crate::domain::repositories::{MonitoringRepository, TradeRepository};
use crate::domain::types::OrderSide;
use crate::infrastructure::state_files::StateFileStore;
use anyhow::Result;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Orders older than this are merely counted (grid orders far from price
/// are expected to rest a long time).
const STALE_ORDER_HOURS_SOFT: i64 = 6;
const STALE_ORDER_HOURS_HARD: i64 = 24;

/// Silence threshold for the stale-activity alert.
const STALE_ACTIVITY_MINUTES: i64 = 30;

const DISCOVERY_MAX_AGE_HOURS: i64 = 48;
const TIER_DRIFT_ALERT_PP: f64 = 5.0;
const CASH_RESERVE_MIN_PCT: f64 = 3.0;

pub struct MonitoringTasks {
    state_store: Arc<StateFileStore>,
    venue: Arc<dyn VenueClient>,
    notifier: Arc<dyn Notifier>,
    monitoring_repo: Arc<dyn MonitoringRepository>,
    trade_repo: Arc<dyn TradeRepository>,
    tier_check_enabled: bool,
}

impl MonitoringTasks {
    pub fn new(
        state_store: Arc<StateFileStore>,
        venue: Arc<dyn VenueClient>,
        notifier: Arc<dyn Notifier>,
        monitoring_repo: Arc<dyn MonitoringRepository>,
        trade_repo: Arc<dyn TradeRepository>,
        tier_check_enabled: bool,
    ) -> Self {
        Self {
            state_store,
            venue,
            notifier,
            monitoring_repo,
            trade_repo,
            tier_check_enabled,
        }
    }

    /// Compare grid state files against the venue's open orders.
    ///
    /// ORPHAN: tracked in state but not on the venue (filled or cancelled
    /// externally). UNKNOWN: resting on the venue but absent from every
    /// state file (manual or leaked order).
    pub async fn reconcile_orders(&self) -> Result<()> {
        let grid_states = self.state_store.load_all_grids();
        if grid_states.is_empty() {
            info!("Reconciliation: no grid state files, skipping");
            return Ok(());
        }

        // Order ids per symbol, merged across cohorts.
        let mut state_orders: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for state in grid_states.values() {
            let entry = state_orders.entry(state.symbol.clone()).or_default();
            for order_id in state.active_orders.keys() {
                entry.insert(order_id.clone());
            }
        }

        let mut total_orphans = 0;
        let mut total_unknown = 0;

        for (symbol, state_ids) in &state_orders {
            match self.venue.get_open_orders(symbol).await {
                Ok(open) => {
                    let venue_ids: BTreeSet<String> =
                        open.into_iter().map(|o| o.order_id).collect();

                    let orphans: Vec<&String> = state_ids.difference(&venue_ids).collect();
                    let unknown: Vec<&String> = venue_ids.difference(state_ids).collect();

                    if !orphans.is_empty() {
                        total_orphans += orphans.len();
                        warn!(
                            "Reconciliation: ORPHAN orders for {}: {:?} (in state, not on venue)",
                            symbol, orphans
                        );
                    }
                    if !unknown.is_empty() {
                        total_unknown += unknown.len();
                        warn!(
                            "Reconciliation: UNKNOWN orders for {}: {:?} (on venue, not in state)",
                            symbol, unknown
                        );
                    }
                }
                Err(e) => warn!("Reconciliation failed for {}: {}", symbol, e),
            }
        }

        if total_orphans > 0 || total_unknown > 0 {
            self.notifier
                .send(
                    &format!(
                        "Order reconciliation\n\nOrphans (state only): {}\nUnknown (venue only): {}",
                        total_orphans, total_unknown
                    ),
                    true,
                )
                .await?;
        } else {
            info!(
                "Reconciliation OK: {} orders across {} symbols",
                state_orders.values().map(BTreeSet::len).sum::<usize>(),
                state_orders.len()
            );
        }
        Ok(())
    }

    /// Count orders resting longer than the soft/hard thresholds.
    /// Informational: far-from-price grid levels are expected to be old.
    pub async fn order_timeout_check(&self) -> Result<()> {
        let grid_states = self.state_store.load_all_grids();
        if grid_states.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut total = 0;
        let mut stale_soft = 0;
        let mut stale_hard = 0;

        for state in grid_states.values() {
            for order in state.active_orders.values() {
                total += 1;
                let age = now - order.created_at;
                if age > Duration::hours(STALE_ORDER_HOURS_HARD) {
                    stale_hard += 1;
                } else if age > Duration::hours(STALE_ORDER_HOURS_SOFT) {
                    stale_soft += 1;
                }
            }
        }

        info!(
            "Order timeout: {} total, {} older than {}h, {} older than {}h",
            total, stale_soft, STALE_ORDER_HOURS_SOFT, stale_hard, STALE_ORDER_HOURS_HARD
        );
        if stale_hard > 0 {
            warn!(
                "{} orders older than {}h, grid may need recalibration",
                stale_hard, STALE_ORDER_HOURS_HARD
            );
        }
        Ok(())
    }

    /// Verify allocation math across cohorts and that the venue still holds
    /// quote currency.
    pub async fn portfolio_plausibility(&self) -> Result<()> {
        let hybrid_states = self.state_store.load_all_hybrids();
        if hybrid_states.is_empty() {
            info!("Plausibility: no hybrid state files, skipping");
            return Ok(());
        }

        let mut issues: Vec<String> = Vec::new();

        for (cohort, state) in &hybrid_states {
            let total_allocated: f64 =
                state.symbols.values().map(|s| s.allocation_usd).sum();
            if total_allocated > 0.0 {
                info!(
                    "Plausibility: cohort {} has ${:.2} across {} symbols",
                    cohort,
                    total_allocated,
                    state.symbols.len()
                );
            }

            for (symbol, symbol_state) in &state.symbols {
                if symbol_state.allocation_usd < 0.0 {
                    issues.push(format!(
                        "{}:{} has negative allocation ${:.2}",
                        cohort, symbol, symbol_state.allocation_usd
                    ));
                }
            }
        }

        match self.venue.get_account_balance("USDT").await {
            Ok(balance) => {
                info!("Plausibility: USDT balance ${}", balance);
                if balance <= Decimal::ZERO {
                    issues.push(format!("USDT balance is ${}", balance));
                }
            }
            Err(e) => warn!("Plausibility: could not check balance: {}", e),
        }

        if issues.is_empty() {
            info!("Portfolio plausibility OK");
        } else {
            let text = format!(
                "Portfolio plausibility issues:\n{}",
                issues
                    .iter()
                    .map(|i| format!("- {}", i))
                    .collect::<Vec<_>>()
                    .join("\n")
            );
            warn!("{}", text);
            self.notifier.send(&text, true).await?;
        }
        Ok(())
    }

    /// Overview of every grid: order counts per side, empty ladders and
    /// failed follow-ups. Only failed follow-ups trigger an alert.
    pub async fn grid_health_summary(&self) -> Result<()> {
        let grid_states = self.state_store.load_all_grids();
        if grid_states.is_empty() {
            info!("Grid health: no grid state files");
            return Ok(());
        }

        let mut total_buy = 0;
        let mut total_sell = 0;
        let mut empty: Vec<&String> = Vec::new();
        let mut no_sell: Vec<&String> = Vec::new();
        let mut failed: Vec<String> = Vec::new();

        for (key, state) in &grid_states {
            let buys = state.count_side(OrderSide::Buy);
            let sells = state.count_side(OrderSide::Sell);
            let failures = state
                .active_orders
                .values()
                .filter(|o| o.failed_followup)
                .count();

            total_buy += buys;
            total_sell += sells;

            if state.active_orders.is_empty() {
                empty.push(key);
            } else if sells == 0 && buys > 0 {
                no_sell.push(key);
            }
            if failures > 0 {
                failed.push(format!("{} ({} failed)", key, failures));
            }
        }

        let mut summary = vec![format!(
            "Grid health: {} grids, {}B/{}S orders",
            grid_states.len(),
            total_buy,
            total_sell
        )];
        if !empty.is_empty() {
            summary.push(format!(
                "Empty grids: {}",
                empty.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            ));
        }
        if !no_sell.is_empty() {
            summary.push(format!(
                "No sells (no fills yet): {}",
                no_sell.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            ));
        }
        if !failed.is_empty() {
            summary.push(format!("Failed follow-ups: {}", failed.join(", ")));
        }
        info!("{}", summary.join(" | "));

        if !failed.is_empty() {
            self.notifier
                .send(
                    &format!(
                        "Grid health warning\n\nFailed follow-ups:\n{}",
                        failed
                            .iter()
                            .map(|f| format!("- {}", f))
                            .collect::<Vec<_>>()
                            .join("\n")
                    ),
                    true,
                )
                .await?;
        }
        Ok(())
    }

    /// Alert when no new grid order has been created recently. In a
    /// volatile market extended silence usually means something is stuck.
    pub async fn stale_detection(&self) -> Result<()> {
        let grid_states = self.state_store.load_all_grids();
        if grid_states.is_empty() {
            info!("Stale detection: no grid state files, skipping");
            return Ok(());
        }

        let newest = grid_states
            .values()
            .flat_map(|state| state.active_orders.values())
            .map(|order| order.created_at)
            .max();

        let Some(newest) = newest else {
            warn!("Stale detection: no order timestamps found in grid states");
            return Ok(());
        };

        let age = Utc::now() - newest;
        if age > Duration::minutes(STALE_ACTIVITY_MINUTES) {
            let minutes = age.num_minutes();
            warn!("Stale detection: last order activity {}min ago", minutes);
            self.notifier
                .send(
                    &format!(
                        "Stale detection warning\n\nNo new order activity for {} min\nLast activity: {}",
                        minutes,
                        newest.format("%H:%M:%S")
                    ),
                    true,
                )
                .await?;
        } else {
            info!(
                "Stale detection OK: last activity {}min ago",
                age.num_minutes()
            );
        }
        Ok(())
    }

    /// Opt-in portfolio tier health: allocation drift, cash reserve level
    /// and trading activity.
    pub async fn tier_health_check(&self) -> Result<()> {
        if !self.tier_check_enabled {
            return Ok(());
        }

        let mut issues: Vec<String> = Vec::new();

        for tier in self.monitoring_repo.tier_rows().await? {
            let drift = (tier.current_pct - tier.target_pct).abs();
            if drift > TIER_DRIFT_ALERT_PP {
                issues.push(format!(
                    "{}: {:.1}% vs target {:.1}% (drift {:.1}pp)",
                    tier.tier_name, tier.current_pct, tier.target_pct, drift
                ));
            }
            if tier.tier_name == "cash_reserve" && tier.current_pct < CASH_RESERVE_MIN_PCT {
                issues.push(format!(
                    "Cash reserve critically low: {:.1}%",
                    tier.current_pct
                ));
            }
        }

        if self.trade_repo.trades_last_hours(24).await? == 0 {
            issues.push("No trading activity in last 24h".to_string());
        }

        if issues.is_empty() {
            info!("Tier health check OK");
        } else {
            let text = format!(
                "Tier health issues:\n{}",
                issues
                    .iter()
                    .map(|i| format!("- {}", i))
                    .collect::<Vec<_>>()
                    .join("\n")
            );
            warn!("{}", text);
            self.notifier.send(&text, true).await?;
        }
        Ok(())
    }

    /// Validate the coin-discovery pipeline: recency, approval-rate
    /// plausibility and whether added coins actually trade.
    pub async fn discovery_health_check(&self) -> Result<()> {
        let mut issues: Vec<String> = Vec::new();

        match self.monitoring_repo.last_discovery().await? {
            Some(last) => {
                let age = Utc::now() - last;
                if age > Duration::hours(DISCOVERY_MAX_AGE_HOURS) {
                    issues.push(format!(
                        "Last discovery was {}h ago (>{}h)",
                        age.num_hours(),
                        DISCOVERY_MAX_AGE_HOURS
                    ));
                }
            }
            None => {
                info!("Discovery health: no discoveries yet");
                return Ok(());
            }
        }

        let (total, approved) = self.monitoring_repo.approval_stats(30).await?;
        if total >= 10 {
            let rate = approved as f64 / total as f64 * 100.0;
            if rate == 0.0 {
                issues.push(format!(
                    "AI approval rate 0% over {} decisions, screening may be too strict",
                    total
                ));
            } else if rate == 100.0 {
                issues.push(format!(
                    "AI approval rate 100% over {} decisions, screening may be too lenient",
                    total
                ));
            }
        }

        let cutoff = Utc::now() - Duration::days(7);
        let idle = self.monitoring_repo.idle_added_coins(cutoff).await?;
        if !idle.is_empty() {
            let preview: Vec<&str> = idle.iter().take(5).map(String::as_str).collect();
            issues.push(format!("Coins with no trades after 7d: {}", preview.join(", ")));
        }

        if issues.is_empty() {
            info!("Discovery health OK");
        } else {
            let text = format!(
                "Discovery health issues:\n{}",
                issues
                    .iter()
                    .map(|i| format!("- {}", i))
                    .collect::<Vec<_>>()
                    .join("\n")
            );
            warn!("{}", text);
            self.notifier.send(&text, true).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::grid::{GridBounds, GridOrder, GridState};
    use crate::domain::hybrid::{HybridState, SymbolState, TradingMode};
    use crate::domain::repositories::TierRow;
    use crate::infrastructure::mock::{
        MockMonitoringRepository, MockNotifier, MockTradeRepository, MockVenueClient,
    };
    use rust_decimal_macros::dec;

    struct Fixture {
        tasks: MonitoringTasks,
        store: Arc<StateFileStore>,
        venue: Arc<MockVenueClient>,
        notifier: Arc<MockNotifier>,
        monitoring_repo: Arc<MockMonitoringRepository>,
    }

    fn fixture(tag: &str, tier_enabled: bool) -> Fixture {
        let dir = std::env::temp_dir().join(format!(
            "gridcohort-monitor-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        let store = Arc::new(StateFileStore::new(dir.clone(), dir.join("heartbeat")));
        let venue = Arc::new(MockVenueClient::new());
        let notifier = Arc::new(MockNotifier::new());
        let monitoring_repo = Arc::new(MockMonitoringRepository::default());
        let trade_repo = Arc::new(MockTradeRepository::default());

        Fixture {
            tasks: MonitoringTasks::new(
                store.clone(),
                venue.clone(),
                notifier.clone(),
                monitoring_repo.clone(),
                trade_repo,
                tier_enabled,
            ),
            store,
            venue,
            notifier,
            monitoring_repo,
        }
    }

    fn grid_state_with_order(symbol: &str, order_id: &str, failed: bool) -> GridState {
        let mut state = GridState::new(
            symbol,
            GridBounds {
                lower: dec!(47500),
                upper: dec!(52500),
            },
            Utc::now(),
        );
        state.active_orders.insert(
            order_id.to_string(),
            GridOrder {
                side: OrderSide::Buy,
                price: dec!(48000),
                quantity: dec!(0.001),
                created_at: Utc::now(),
                failed_followup: failed,
            },
        );
        state
    }

    #[tokio::test]
    async fn test_reconcile_flags_orphans_and_unknown() {
        let f = fixture("reconcile", false);

        // State knows order 100; the venue only knows order 200.
        f.store
            .save_grid("balanced", &grid_state_with_order("BTCUSDT", "100", false))
            .unwrap();
        let venue_id = f
            .venue
            .place_order("BTCUSDT", OrderSide::Sell, dec!(0.001), dec!(52000))
            .await
            .unwrap();
        assert_ne!(venue_id, "100");

        f.tasks.reconcile_orders().await.unwrap();

        let sent = f.notifier.sent().await;
        assert_eq!(sent.len(), 1);
        let (text, force) = &sent[0];
        assert!(*force);
        assert!(text.contains("Orphans (state only): 1"));
        assert!(text.contains("Unknown (venue only): 1"));
    }

    #[tokio::test]
    async fn test_reconcile_quiet_when_consistent() {
        let f = fixture("reconcile-ok", false);

        let venue_id = f
            .venue
            .place_order("BTCUSDT", OrderSide::Buy, dec!(0.001), dec!(48000))
            .await
            .unwrap();
        f.store
            .save_grid("balanced", &grid_state_with_order("BTCUSDT", &venue_id, false))
            .unwrap();

        f.tasks.reconcile_orders().await.unwrap();
        assert!(f.notifier.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_plausibility_flags_negative_allocation() {
        let f = fixture("plausibility", false);

        let mut state = HybridState::new(TradingMode::Grid, Utc::now());
        state.symbols.insert(
            "ETHUSDT".to_string(),
            SymbolState::new(-25.0, TradingMode::Grid),
        );
        f.store.save_hybrid("aggressive", &state).unwrap();

        f.tasks.portfolio_plausibility().await.unwrap();

        let sent = f.notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.contains("negative allocation"));
        assert!(sent[0].1);
    }

    #[tokio::test]
    async fn test_plausibility_flags_empty_balance() {
        let f = fixture("plausibility-balance", false);

        let state = HybridState::new(TradingMode::Grid, Utc::now());
        f.store.save_hybrid("balanced", &state).unwrap();
        f.venue.set_balance("USDT", Decimal::ZERO).await;

        f.tasks.portfolio_plausibility().await.unwrap();

        let sent = f.notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.contains("USDT balance"));
    }

    #[tokio::test]
    async fn test_grid_health_alerts_on_failed_followups() {
        let f = fixture("grid-health", false);

        f.store
            .save_grid("balanced", &grid_state_with_order("BTCUSDT", "1", true))
            .unwrap();
        f.store
            .save_grid("aggressive", &grid_state_with_order("ETHUSDT", "2", false))
            .unwrap();

        f.tasks.grid_health_summary().await.unwrap();

        let sent = f.notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.contains("Failed follow-ups"));
        assert!(sent[0].0.contains("balanced:BTCUSDT"));
        assert!(!sent[0].0.contains("aggressive:ETHUSDT"));
    }

    #[tokio::test]
    async fn test_stale_detection_alerts_on_silence() {
        let f = fixture("stale", false);

        let mut state = grid_state_with_order("BTCUSDT", "1", false);
        for order in state.active_orders.values_mut() {
            order.created_at = Utc::now() - Duration::hours(2);
        }
        f.store.save_grid("balanced", &state).unwrap();

        f.tasks.stale_detection().await.unwrap();

        let sent = f.notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.contains("No new order activity"));
    }

    #[tokio::test]
    async fn test_stale_detection_quiet_when_active() {
        let f = fixture("stale-ok", false);
        f.store
            .save_grid("balanced", &grid_state_with_order("BTCUSDT", "1", false))
            .unwrap();

        f.tasks.stale_detection().await.unwrap();
        assert!(f.notifier.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_tier_health_skipped_unless_enabled() {
        let f = fixture("tier-disabled", false);
        *f.monitoring_repo.tiers.lock().await = vec![TierRow {
            tier_name: "cash_reserve".to_string(),
            target_pct: 10.0,
            current_pct: 1.0,
            current_value_usd: 10.0,
        }];

        f.tasks.tier_health_check().await.unwrap();
        assert!(f.notifier.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_tier_health_flags_drift_and_reserve() {
        let f = fixture("tier-enabled", true);
        *f.monitoring_repo.tiers.lock().await = vec![TierRow {
            tier_name: "cash_reserve".to_string(),
            target_pct: 10.0,
            current_pct: 1.0,
            current_value_usd: 10.0,
        }];

        f.tasks.tier_health_check().await.unwrap();

        let sent = f.notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.contains("drift"));
        assert!(sent[0].0.contains("Cash reserve critically low"));
        // Empty trade repo also trips the activity check.
        assert!(sent[0].0.contains("No trading activity"));
    }

    #[tokio::test]
    async fn test_discovery_health_rates() {
        let f = fixture("discovery", false);
        *f.monitoring_repo.last_discovery.lock().await =
            Some(Utc::now() - Duration::hours(72));
        *f.monitoring_repo.approvals.lock().await = (20, 20);
        *f.monitoring_repo.idle_coins.lock().await = vec!["PEPEUSDT".to_string()];

        f.tasks.discovery_health_check().await.unwrap();

        let sent = f.notifier.sent().await;
        assert_eq!(sent.len(), 1);
        let text = &sent[0].0;
        assert!(text.contains("Last discovery was 72h ago"));
        assert!(text.contains("100%"));
        assert!(text.contains("PEPEUSDT"));
    }

    #[tokio::test]
    async fn test_discovery_health_quiet_without_discoveries() {
        let f = fixture("discovery-empty", false);
        f.tasks.discovery_health_check().await.unwrap();
        assert!(f.notifier.sent().await.is_empty());
    }
}
