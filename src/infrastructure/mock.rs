//! In-memory port and repository implementations for tests and dry runs.

use crate::domain::ports::{AiProvider, MarketFeed, Notifier, VenueClient};
use crate::domain::regime::{MarketRegime, RegimeFeatures, RegimeState};
use crate::domain::repositories::{
    CycleTradeStats, MonitoringRepository, RegimeRepository, SignalObservation, SignalRepository,
    SnapshotContext, SnapshotRepository, TierRow, TradePair, TradeRepository, TradeStatus,
    WeightsRepository,
};
use crate::domain::metrics::{PositionSizeResult, RiskMetrics};
use crate::domain::signals::{AiAssessment, MarketFeatures, SignalBreakdown};
use crate::domain::types::{Kline, OpenOrder, OrderSide};
use crate::domain::weights::BayesianWeights;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// A record of every order the mock venue accepted.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub order_id: String,
}

#[derive(Default)]
pub struct MockVenueClient {
    next_id: AtomicU64,
    open_orders: Mutex<HashMap<String, Vec<OpenOrder>>>,
    placed: Mutex<Vec<PlacedOrder>>,
    balances: Mutex<HashMap<String, Decimal>>,
    klines: Mutex<HashMap<String, Vec<Kline>>>,
    fail_next_place: Mutex<bool>,
}

impl MockVenueClient {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ..Self::default()
        }
    }

    pub async fn placed_orders(&self) -> Vec<PlacedOrder> {
        self.placed.lock().await.clone()
    }

    /// Simulate a fill by removing the order from the venue book.
    pub async fn remove_open_order(&self, symbol: &str, order_id: &str) {
        if let Some(orders) = self.open_orders.lock().await.get_mut(symbol) {
            orders.retain(|o| o.order_id != order_id);
        }
    }

    pub async fn fail_next_place_order(&self) {
        *self.fail_next_place.lock().await = true;
    }

    pub async fn set_balance(&self, asset: &str, balance: Decimal) {
        self.balances.lock().await.insert(asset.to_string(), balance);
    }

    pub async fn set_klines(&self, symbol: &str, klines: Vec<Kline>) {
        self.klines.lock().await.insert(symbol.to_string(), klines);
    }
}

#[async_trait]
impl VenueClient for MockVenueClient {
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>> {
        Ok(self
            .open_orders
            .lock()
            .await
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<String> {
        {
            let mut fail = self.fail_next_place.lock().await;
            if *fail {
                *fail = false;
                anyhow::bail!("venue rejected order (simulated transient failure)");
            }
        }

        let order_id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let order = OpenOrder {
            order_id: order_id.clone(),
            symbol: symbol.to_string(),
            side,
            price,
            quantity,
            created_at: Utc::now(),
        };

        self.open_orders
            .lock()
            .await
            .entry(symbol.to_string())
            .or_default()
            .push(order);
        self.placed.lock().await.push(PlacedOrder {
            symbol: symbol.to_string(),
            side,
            price,
            quantity,
            order_id: order_id.clone(),
        });
        Ok(order_id)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let mut orders = self.open_orders.lock().await;
        if let Some(list) = orders.get_mut(symbol) {
            let before = list.len();
            list.retain(|o| o.order_id != order_id);
            if list.len() < before {
                return Ok(());
            }
        }
        anyhow::bail!("unknown order {} for {}", order_id, symbol)
    }

    async fn get_account_balance(&self, asset: &str) -> Result<Decimal> {
        Ok(self
            .balances
            .lock()
            .await
            .get(asset)
            .copied()
            .unwrap_or(Decimal::from(10_000)))
    }

    async fn get_klines(&self, symbol: &str, _interval: &str, limit: u32) -> Result<Vec<Kline>> {
        let klines = self
            .klines
            .lock()
            .await
            .get(symbol)
            .cloned()
            .unwrap_or_default();
        Ok(klines.into_iter().take(limit as usize).collect())
    }
}

#[derive(Default)]
pub struct MockNotifier {
    pub messages: Mutex<Vec<(String, bool)>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<(String, bool)> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send(&self, text: &str, force: bool) -> Result<()> {
        self.messages.lock().await.push((text.to_string(), force));
        Ok(())
    }
}

pub struct MockAiProvider {
    assessment: Mutex<AiAssessment>,
    pub calls: AtomicU64,
}

impl MockAiProvider {
    pub fn new(assessment: AiAssessment) -> Self {
        Self {
            assessment: Mutex::new(assessment),
            calls: AtomicU64::new(0),
        }
    }

    pub fn neutral() -> Self {
        Self::new(AiAssessment::neutral())
    }

    pub async fn set_assessment(&self, assessment: AiAssessment) {
        *self.assessment.lock().await = assessment;
    }
}

#[async_trait]
impl AiProvider for MockAiProvider {
    async fn classify(&self, _features: &MarketFeatures) -> Result<AiAssessment> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.assessment.lock().await.clone())
    }
}

#[derive(Default)]
pub struct MockMarketFeed {
    features: Mutex<HashMap<String, MarketFeatures>>,
    regime: Mutex<Option<RegimeFeatures>>,
    history: Mutex<Vec<RegimeFeatures>>,
}

impl MockMarketFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_features(&self, features: MarketFeatures) {
        self.features
            .lock()
            .await
            .insert(features.symbol.clone(), features);
    }

    pub async fn set_regime_features(&self, features: Option<RegimeFeatures>) {
        *self.regime.lock().await = features;
    }

    pub async fn set_history(&self, history: Vec<RegimeFeatures>) {
        *self.history.lock().await = history;
    }
}

#[async_trait]
impl MarketFeed for MockMarketFeed {
    async fn features(&self, symbol: &str) -> Result<Option<MarketFeatures>> {
        Ok(self.features.lock().await.get(symbol).cloned())
    }

    async fn regime_features(&self) -> Result<Option<RegimeFeatures>> {
        Ok(*self.regime.lock().await)
    }

    async fn regime_feature_history(&self, _days: i64) -> Result<Vec<RegimeFeatures>> {
        Ok(self.history.lock().await.clone())
    }
}

#[derive(Default)]
pub struct MockTradeRepository {
    pub pairs: Mutex<Vec<TradePair>>,
    pub symbol_returns: Mutex<HashMap<String, Vec<f64>>>,
    pub daily_returns: Mutex<HashMap<String, Vec<f64>>>,
}

impl MockTradeRepository {
    pub async fn set_symbol_returns(&self, symbol: &str, returns: Vec<f64>) {
        self.symbol_returns
            .lock()
            .await
            .insert(symbol.to_string(), returns);
    }

    pub async fn set_daily_returns(&self, cycle_id: &str, returns: Vec<f64>) {
        self.daily_returns
            .lock()
            .await
            .insert(cycle_id.to_string(), returns);
    }

    pub async fn open_pairs(&self) -> Vec<TradePair> {
        self.pairs
            .lock()
            .await
            .iter()
            .filter(|p| p.status == TradeStatus::Open)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TradeRepository for MockTradeRepository {
    async fn open_pair(&self, pair: &TradePair) -> Result<()> {
        self.pairs.lock().await.push(pair.clone());
        Ok(())
    }

    async fn close_pair(
        &self,
        cohort_id: &str,
        symbol: &str,
        exit_price: Decimal,
        closed_at: DateTime<Utc>,
    ) -> Result<Option<TradePair>> {
        let mut pairs = self.pairs.lock().await;
        let candidate = pairs
            .iter_mut()
            .filter(|p| {
                p.status == TradeStatus::Open
                    && p.symbol == symbol
                    && p.cohort_id.as_deref() == Some(cohort_id)
            })
            .min_by_key(|p| p.created_at);

        let Some(pair) = candidate else {
            return Ok(None);
        };

        pair.status = TradeStatus::Closed;
        pair.exit_price = Some(exit_price);
        pair.closed_at = Some(closed_at);
        pair.pnl_usd = Some((exit_price - pair.entry_price) * pair.quantity);
        let entry = pair.entry_price.to_f64().unwrap_or(0.0);
        if entry > 0.0 {
            pair.pnl_pct =
                Some((exit_price.to_f64().unwrap_or(0.0) - entry) / entry * 100.0);
        }
        Ok(Some(pair.clone()))
    }

    async fn symbol_returns(&self, symbol: &str, _lookback_days: i64) -> Result<Vec<f64>> {
        Ok(self
            .symbol_returns
            .lock()
            .await
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }

    async fn daily_returns(&self, cycle_id: &str) -> Result<Vec<f64>> {
        Ok(self
            .daily_returns
            .lock()
            .await
            .get(cycle_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn cycle_stats(&self, cycle_id: &str) -> Result<CycleTradeStats> {
        let pairs = self.pairs.lock().await;
        let cycle_pairs: Vec<&TradePair> = pairs
            .iter()
            .filter(|p| p.cycle_id.as_deref() == Some(cycle_id))
            .collect();

        let closed: Vec<&&TradePair> = cycle_pairs
            .iter()
            .filter(|p| p.status == TradeStatus::Closed)
            .collect();
        let winning = closed
            .iter()
            .filter(|p| p.pnl_pct.unwrap_or(0.0) > 0.0)
            .count() as i64;
        let losing = closed
            .iter()
            .filter(|p| p.pnl_pct.unwrap_or(0.0) < 0.0)
            .count() as i64;

        let fear_greeds: Vec<f64> = cycle_pairs
            .iter()
            .filter_map(|p| p.fear_greed.map(|v| v as f64))
            .collect();
        let avg_fear_greed = if fear_greeds.is_empty() {
            None
        } else {
            Some(fear_greeds.iter().sum::<f64>() / fear_greeds.len() as f64)
        };

        Ok(CycleTradeStats {
            trades_count: cycle_pairs.len() as i64,
            winning_trades: winning,
            losing_trades: losing,
            avg_fear_greed,
        })
    }

    async fn cycle_regimes(&self, cycle_id: &str) -> Result<Vec<MarketRegime>> {
        Ok(self
            .pairs
            .lock()
            .await
            .iter()
            .filter(|p| p.cycle_id.as_deref() == Some(cycle_id))
            .filter_map(|p| p.regime)
            .collect())
    }

    async fn cycle_symbol_pnls(&self, cycle_id: &str) -> Result<Vec<(String, f64)>> {
        let pairs = self.pairs.lock().await;
        let mut by_symbol: BTreeMap<String, f64> = BTreeMap::new();
        for pair in pairs
            .iter()
            .filter(|p| p.cycle_id.as_deref() == Some(cycle_id))
        {
            if let Some(pnl) = pair.pnl_pct {
                *by_symbol.entry(pair.symbol.clone()).or_default() += pnl;
            }
        }
        Ok(by_symbol.into_iter().collect())
    }

    async fn net_flow(&self, cycle_id: &str) -> Result<Decimal> {
        Ok(self
            .pairs
            .lock()
            .await
            .iter()
            .filter(|p| p.cycle_id.as_deref() == Some(cycle_id))
            .filter_map(|p| p.pnl_usd)
            .sum())
    }

    async fn trades_last_hours(&self, hours: i64) -> Result<i64> {
        let cutoff = Utc::now() - Duration::hours(hours);
        Ok(self
            .pairs
            .lock()
            .await
            .iter()
            .filter(|p| p.created_at > cutoff)
            .count() as i64)
    }
}

#[derive(Default)]
pub struct MockSignalRepository {
    pub breakdowns: Mutex<Vec<(String, SignalBreakdown)>>,
    pub outcomes: Mutex<Vec<(String, bool)>>,
    pub observations: Mutex<Vec<SignalObservation>>,
    pub snapshots: Mutex<Vec<RiskMetrics>>,
    pub sizing_decisions: Mutex<Vec<(String, PositionSizeResult)>>,
}

impl MockSignalRepository {
    pub async fn set_observations(&self, observations: Vec<SignalObservation>) {
        *self.observations.lock().await = observations;
    }
}

#[async_trait]
impl SignalRepository for MockSignalRepository {
    async fn store_breakdown(
        &self,
        trade_id: &str,
        _cycle_id: Option<&str>,
        _cohort_id: Option<&str>,
        breakdown: &SignalBreakdown,
    ) -> Result<()> {
        self.breakdowns
            .lock()
            .await
            .push((trade_id.to_string(), breakdown.clone()));
        Ok(())
    }

    async fn update_outcome(&self, trade_id: &str, was_correct: bool) -> Result<()> {
        self.outcomes
            .lock()
            .await
            .push((trade_id.to_string(), was_correct));
        Ok(())
    }

    async fn observations(
        &self,
        _cohort_id: Option<&str>,
        _lookback_days: i64,
        _regime: Option<MarketRegime>,
    ) -> Result<Vec<SignalObservation>> {
        Ok(self.observations.lock().await.clone())
    }

    async fn cycle_signal_accuracy(&self, _cycle_id: &str) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }

    async fn store_snapshot(&self, metrics: &RiskMetrics, _ctx: &SnapshotContext) -> Result<()> {
        self.snapshots.lock().await.push(metrics.clone());
        Ok(())
    }

    async fn store_sizing_decision(
        &self,
        symbol: &str,
        _cycle_id: Option<&str>,
        result: &PositionSizeResult,
    ) -> Result<()> {
        self.sizing_decisions
            .lock()
            .await
            .push((symbol.to_string(), result.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockRegimeRepository {
    pub stored: Mutex<Vec<RegimeState>>,
}

#[async_trait]
impl RegimeRepository for MockRegimeRepository {
    async fn store(&self, state: &RegimeState) -> Result<()> {
        self.stored.lock().await.push(state.clone());
        Ok(())
    }

    async fn history(&self, _days: i64) -> Result<Vec<RegimeState>> {
        Ok(self.stored.lock().await.clone())
    }
}

#[derive(Default)]
pub struct MockWeightsRepository {
    pub stored: Mutex<Vec<(Option<String>, BayesianWeights)>>,
}

#[async_trait]
impl WeightsRepository for MockWeightsRepository {
    async fn store(&self, weights: &BayesianWeights, cohort_id: Option<&str>) -> Result<()> {
        self.stored
            .lock()
            .await
            .push((cohort_id.map(String::from), weights.clone()));
        Ok(())
    }

    async fn load_active(
        &self,
        regime: Option<MarketRegime>,
        cohort_id: Option<&str>,
    ) -> Result<Option<BayesianWeights>> {
        Ok(self
            .stored
            .lock()
            .await
            .iter()
            .rev()
            .find(|(stored_cohort, weights)| {
                weights.regime == regime && stored_cohort.as_deref() == cohort_id
            })
            .map(|(_, weights)| weights.clone()))
    }

    async fn history(
        &self,
        _days: i64,
        regime: Option<MarketRegime>,
    ) -> Result<Vec<BayesianWeights>> {
        Ok(self
            .stored
            .lock()
            .await
            .iter()
            .filter(|(_, w)| regime.is_none() || w.regime == regime)
            .map(|(_, w)| w.clone())
            .collect())
    }
}

#[derive(Default)]
pub struct MockSnapshotRepository {
    pub features: Mutex<HashMap<String, MarketFeatures>>,
    pub regime_window: Mutex<Option<RegimeFeatures>>,
    pub history: Mutex<Vec<RegimeFeatures>>,
    pub btc_range: Mutex<Option<(f64, f64)>>,
}

#[async_trait]
impl SnapshotRepository for MockSnapshotRepository {
    async fn latest_features(&self, symbol: &str) -> Result<Option<MarketFeatures>> {
        Ok(self.features.lock().await.get(symbol).cloned())
    }

    async fn regime_window(&self) -> Result<Option<RegimeFeatures>> {
        Ok(*self.regime_window.lock().await)
    }

    async fn feature_history(&self, _days: i64) -> Result<Vec<RegimeFeatures>> {
        Ok(self.history.lock().await.clone())
    }

    async fn btc_price_range(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Option<(f64, f64)>> {
        Ok(*self.btc_range.lock().await)
    }
}

#[derive(Default)]
pub struct MockMonitoringRepository {
    pub last_discovery: Mutex<Option<DateTime<Utc>>>,
    pub approvals: Mutex<(i64, i64)>,
    pub idle_coins: Mutex<Vec<String>>,
    pub tiers: Mutex<Vec<TierRow>>,
}

#[async_trait]
impl MonitoringRepository for MockMonitoringRepository {
    async fn last_discovery(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(*self.last_discovery.lock().await)
    }

    async fn approval_stats(&self, _days: i64) -> Result<(i64, i64)> {
        Ok(*self.approvals.lock().await)
    }

    async fn idle_added_coins(&self, _added_before: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(self.idle_coins.lock().await.clone())
    }

    async fn tier_rows(&self) -> Result<Vec<TierRow>> {
        Ok(self.tiers.lock().await.clone())
    }
}
