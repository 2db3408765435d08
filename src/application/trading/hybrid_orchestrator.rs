//! Per-cohort hybrid orchestrator: a hysteresis-protected state machine
//! over {HOLD, GRID, CASH} driven by regime probabilities.
//!
//! One instance exists per cohort. All instances share the venue client and
//! the analysis services but own their `HybridState` and grid engines
//! exclusively, so ticks across cohorts never contend on in-memory state.

use crate::application::analysis::bayesian::BayesianWeightLearner;
use crate::application::analysis::regime::RegimeDetector;
use crate::application::analysis::signals::SignalAnalyzer;
use crate::application::risk::cvar_sizing::{CVarPositionSizer, OpenPosition, DEFAULT_RISK_BUDGET};
use crate::application::trading::cohort_manager::CohortManager;
use crate::application::trading::cycle_manager::CycleManager;
use crate::application::trading::grid_engine::GridEngine;
use crate::config::HybridConfig;
use crate::domain::cohort::Cohort;
use crate::domain::grid::GridFill;
use crate::domain::hybrid::{HybridState, SymbolState, TradingMode};
use crate::domain::ports::{AiProvider, MarketFeed, Notifier, VenueClient};
use crate::domain::regime::{MarketRegime, RegimeState};
use crate::domain::repositories::{SignalRepository, TradePair, TradeRepository, TradeStatus};
use crate::domain::signals::{AiAssessment, MarketFeatures, SignalBreakdown};
use crate::domain::types::OrderSide;
use crate::infrastructure::state_files::StateFileStore;
use anyhow::Result;
use chrono::Utc;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Candidate universe scanned for allocations.
const SYMBOL_UNIVERSE: &[&str] = &[
    "BTCUSDT", "ETHUSDT", "BNBUSDT", "SOLUSDT", "ADAUSDT", "XRPUSDT", "DOTUSDT", "AVAXUSDT",
    "LINKUSDT",
];

/// Shared services injected into every per-cohort orchestrator.
#[derive(Clone)]
pub struct HybridServices {
    pub venue: Arc<dyn VenueClient>,
    pub feed: Arc<dyn MarketFeed>,
    pub ai: Arc<dyn AiProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub regime_detector: Arc<RegimeDetector>,
    pub analyzer: Arc<SignalAnalyzer>,
    pub learner: Arc<BayesianWeightLearner>,
    pub sizer: Arc<CVarPositionSizer>,
    pub cycle_manager: Arc<CycleManager>,
    pub cohort_manager: Arc<CohortManager>,
    pub trade_repo: Arc<dyn TradeRepository>,
    pub signal_repo: Arc<dyn SignalRepository>,
    pub state_store: Arc<StateFileStore>,
}

#[derive(Debug, Clone, Default)]
pub struct AllocationResult {
    pub allocations: BTreeMap<String, f64>,
    pub total_allocated: f64,
}

pub struct HybridOrchestrator {
    cohort: Cohort,
    config: HybridConfig,
    services: HybridServices,
    state: HybridState,
    grids: HashMap<String, GridEngine>,
}

impl HybridOrchestrator {
    pub fn new(cohort: Cohort, config: HybridConfig, services: HybridServices) -> Self {
        let state = HybridState::new(config.initial_mode, Utc::now());
        Self {
            cohort,
            config,
            services,
            state,
            grids: HashMap::new(),
        }
    }

    pub fn cohort_name(&self) -> &str {
        &self.cohort.name
    }

    pub fn mode(&self) -> TradingMode {
        self.state.mode
    }

    pub fn state(&self) -> &HybridState {
        &self.state
    }

    /// Restart/test hook: replace the in-memory state wholesale.
    pub fn set_state(&mut self, state: HybridState) {
        self.state = state;
    }

    // ===== Persistence =====

    /// Restore hybrid and grid state from disk. Missing files leave the
    /// initial state untouched.
    pub fn load_state(&mut self) -> Result<()> {
        if let Some(state) = self.services.state_store.load_hybrid(&self.cohort.name)? {
            info!(
                "HybridOrchestrator[{}]: restored state (mode {}, {} symbols)",
                self.cohort.name,
                state.mode,
                state.symbols.len()
            );
            self.state = state;
        }

        for symbol in self.state.symbols.keys() {
            if let Some(grid_state) = self
                .services
                .state_store
                .load_grid(symbol, &self.cohort.name)?
            {
                self.grids.insert(
                    symbol.clone(),
                    GridEngine::from_state(
                        grid_state,
                        &self.cohort.name,
                        self.config.grid_range_percent,
                        self.config.num_grids,
                    ),
                );
            }
        }
        Ok(())
    }

    /// Persist hybrid state plus every grid state. Each file is written
    /// atomically (write-and-rename).
    pub fn save_state(&self) -> Result<()> {
        self.services
            .state_store
            .save_hybrid(&self.cohort.name, &self.state)?;
        for engine in self.grids.values() {
            self.services
                .state_store
                .save_grid(&self.cohort.name, engine.state())?;
        }
        Ok(())
    }

    // ===== Allocation =====

    /// Rank the candidate universe by composite signal and greedily allocate
    /// capital to the best symbols. Runs at startup and on mode changes.
    pub async fn scan_and_allocate(&mut self) -> Result<AllocationResult> {
        let regime_state = self.services.regime_detector.detect().await?;
        let regime = regime_state.as_ref().map(|r| r.current_regime);

        let mut candidates: Vec<(String, f64)> = Vec::new();
        for symbol in SYMBOL_UNIVERSE {
            let Some(features) = self.services.feed.features(symbol).await? else {
                continue;
            };
            let weights = self.services.learner.get_weights(regime).await;
            let breakdown =
                self.services
                    .analyzer
                    .analyze(&features, &AiAssessment::neutral(), &weights);
            if breakdown.final_score > 0.0 {
                candidates.push((symbol.to_string(), breakdown.final_score));
            }
        }

        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(self.config.max_symbols);

        let mut result = AllocationResult::default();
        if candidates.is_empty() {
            warn!(
                "HybridOrchestrator[{}]: scan found no positive-signal symbols",
                self.cohort.name
            );
            return Ok(result);
        }

        let cycle_id = self.active_cycle_id().await;
        let equal_share = self.config.total_investment / candidates.len() as f64;
        let mut held: Vec<OpenPosition> = Vec::new();

        for (symbol, score) in &candidates {
            let sizing = self
                .services
                .sizer
                .calculate_position_size(
                    symbol,
                    self.config.total_investment,
                    score.abs().min(1.0),
                    DEFAULT_RISK_BUDGET,
                    regime,
                    true,
                )
                .await;
            let damped =
                self.services
                    .sizer
                    .adjust_for_correlation(sizing.recommended_size, symbol, &held);
            let allocation = equal_share.min(damped);

            if allocation < self.config.min_position_usd {
                debug!(
                    "HybridOrchestrator[{}]: {} allocation ${:.2} below floor, skipped",
                    self.cohort.name, symbol, allocation
                );
                continue;
            }

            if let Err(e) = self
                .services
                .signal_repo
                .store_sizing_decision(symbol, cycle_id.as_deref(), &sizing)
                .await
            {
                debug!("HybridOrchestrator: sizing log failed: {}", e);
            }

            held.push(OpenPosition {
                symbol: symbol.clone(),
                value: allocation,
                cvar: sizing.cvar_used,
            });
            result.total_allocated += allocation;
            result.allocations.insert(symbol.clone(), allocation);
        }

        // Replace the symbol set; per-symbol modes follow the cohort mode.
        self.state.symbols = result
            .allocations
            .iter()
            .map(|(symbol, allocation)| {
                (symbol.clone(), SymbolState::new(*allocation, self.state.mode))
            })
            .collect();

        info!(
            "HybridOrchestrator[{}]: allocated ${:.2} across {} symbols",
            self.cohort.name,
            result.total_allocated,
            result.allocations.len()
        );
        Ok(result)
    }

    // ===== Tick =====

    /// One full decision pass: regime, mode machine, per-symbol work, cycle
    /// bookkeeping and state persistence.
    pub async fn tick(&mut self) -> Result<()> {
        let regime_state = self.services.regime_detector.detect().await?;

        if let Some(rs) = &regime_state {
            self.observe_regime(rs);
            if let Some(target) = self.transition_target(rs) {
                self.enter_mode(target, rs.current_regime).await?;
            }
        }

        let regime = regime_state.as_ref().map(|r| r.current_regime);
        let symbols: Vec<String> = self.state.symbols.keys().cloned().collect();
        for symbol in symbols {
            if let Err(e) = self.process_symbol(&symbol, regime).await {
                warn!(
                    "HybridOrchestrator[{}]: {} tick error: {}",
                    self.cohort.name, symbol, e
                );
            }
        }

        self.roll_cycle_if_due().await?;
        self.save_state()?;
        Ok(())
    }

    fn observe_regime(&mut self, regime_state: &RegimeState) {
        if self.state.last_regime != Some(regime_state.current_regime) {
            self.state.last_regime = Some(regime_state.current_regime);
            self.state.regime_since = Some(Utc::now());
        }
    }

    /// The hysteresis predicate: probability, regime age and mode cooldown
    /// must all hold before any transition fires.
    pub fn transition_target(&self, regime_state: &RegimeState) -> Option<TradingMode> {
        if !self.config.enable_mode_switching {
            return None;
        }

        let now = Utc::now();
        if self.state.hours_in_mode(now) < self.config.mode_cooldown_hours as f64 {
            return None;
        }

        let confirmed = |regimes: &[MarketRegime]| {
            regimes.contains(&regime_state.current_regime)
                && regime_state.regime_probability >= self.config.min_regime_probability
                && regime_state.regime_duration_days >= self.config.min_regime_duration_days
        };

        match self.state.mode {
            TradingMode::Hold => {
                if confirmed(&[MarketRegime::Bear]) {
                    Some(TradingMode::Cash)
                } else if confirmed(&[MarketRegime::Bull, MarketRegime::Sideways]) {
                    Some(TradingMode::Grid)
                } else {
                    None
                }
            }
            TradingMode::Grid => {
                if confirmed(&[MarketRegime::Bear]) {
                    Some(TradingMode::Cash)
                } else if self.all_grids_flat()
                    && regime_state.current_regime == MarketRegime::Bull
                    && regime_state.regime_probability >= self.config.min_regime_probability
                    && regime_state.regime_duration_days
                        >= 2 * self.config.min_regime_duration_days
                {
                    // Extended uptrend with every ladder settled: ride the
                    // trend instead of fading it.
                    Some(TradingMode::Hold)
                } else {
                    None
                }
            }
            TradingMode::Cash => {
                if confirmed(&[MarketRegime::Bull, MarketRegime::Sideways]) {
                    Some(TradingMode::Grid)
                } else if regime_state.current_regime != MarketRegime::Bear
                    && self.state.hours_in_mode(now) >= self.config.cash_exit_timeout_hours
                {
                    Some(TradingMode::Hold)
                } else {
                    None
                }
            }
        }
    }

    fn all_grids_flat(&self) -> bool {
        self.grids.values().all(|g| !g.has_open_orders())
    }

    /// Execute a mode change with its side effects.
    pub async fn enter_mode(&mut self, target: TradingMode, regime: MarketRegime) -> Result<()> {
        if target == self.state.mode {
            return Ok(());
        }

        info!(
            "HybridOrchestrator[{}]: mode {} -> {} (regime {})",
            self.cohort.name, self.state.mode, target, regime
        );

        match target {
            TradingMode::Cash => self.liquidate_all().await?,
            TradingMode::Grid => {
                if self.state.symbols.is_empty() {
                    self.scan_and_allocate().await?;
                }
                self.open_all_grids(regime).await?;
            }
            TradingMode::Hold => self.arm_trailing_stops().await?,
        }

        let now = Utc::now();
        self.state.mode = target;
        self.state.mode_entered_at = now;
        self.state.cash_entered_at = (target == TradingMode::Cash).then_some(now);
        for symbol_state in self.state.symbols.values_mut() {
            symbol_state.mode = target;
        }

        let text = format!(
            "{}: mode switched to {} ({} regime)",
            self.cohort.name, target, regime
        );
        if let Err(e) = self.services.notifier.send(&text, false).await {
            debug!("HybridOrchestrator: notify failed: {}", e);
        }
        Ok(())
    }

    /// Close every grid and flatten every holding.
    async fn liquidate_all(&mut self) -> Result<()> {
        let venue = self.services.venue.clone();
        for engine in self.grids.values_mut() {
            engine.close_grid(venue.as_ref()).await?;
        }
        for engine in self.grids.values() {
            self.services
                .state_store
                .save_grid(&self.cohort.name, engine.state())?;
        }

        let symbols: Vec<String> = self.state.symbols.keys().cloned().collect();
        for symbol in symbols {
            if let Err(e) = self.exit_position(&symbol).await {
                warn!(
                    "HybridOrchestrator[{}]: failed to exit {}: {}",
                    self.cohort.name, symbol, e
                );
            }
        }
        Ok(())
    }

    async fn open_all_grids(&mut self, regime: MarketRegime) -> Result<()> {
        let rules = RegimeDetector::regime_trading_rules(regime);
        let symbols: Vec<(String, f64)> = self
            .state
            .symbols
            .iter()
            .map(|(s, st)| (s.clone(), st.allocation_usd))
            .collect();

        for (symbol, allocation) in symbols {
            if allocation < self.config.min_position_usd {
                continue;
            }
            let Some(features) = self.services.feed.features(&symbol).await? else {
                continue;
            };
            let Some(price) = Decimal::from_f64(features.price) else {
                continue;
            };

            self.ensure_grid_engine(&symbol);
            let engine = self.grids.get_mut(&symbol).expect("engine ensured above");
            if !engine.has_open_orders() {
                engine
                    .open_grid(
                        self.services.venue.as_ref(),
                        price,
                        allocation,
                        rules.grid_bias,
                    )
                    .await?;
            }
            let engine = self.grids.get(&symbol).expect("engine ensured above");
            self.services
                .state_store
                .save_grid(&self.cohort.name, engine.state())?;
        }
        Ok(())
    }

    fn ensure_grid_engine(&mut self, symbol: &str) {
        if !self.grids.contains_key(symbol) {
            self.grids.insert(
                symbol.to_string(),
                GridEngine::new(
                    symbol,
                    &self.cohort.name,
                    self.config.grid_range_percent,
                    self.config.num_grids,
                ),
            );
        }
    }

    /// Arm a high-water mark on every allocated symbol, buying back in when
    /// arriving from CASH.
    async fn arm_trailing_stops(&mut self) -> Result<()> {
        let from_cash = self.state.mode == TradingMode::Cash;
        let symbols: Vec<(String, f64)> = self
            .state
            .symbols
            .iter()
            .map(|(s, st)| (s.clone(), st.allocation_usd))
            .collect();

        for (symbol, allocation) in symbols {
            let Some(features) = self.services.feed.features(&symbol).await? else {
                continue;
            };
            let Some(price) = Decimal::from_f64(features.price) else {
                continue;
            };

            if from_cash && allocation >= self.config.min_position_usd {
                let quantity =
                    (Decimal::from_f64(allocation).unwrap_or_default() / price).round_dp(6);
                if quantity > Decimal::ZERO {
                    if let Err(e) = self
                        .services
                        .venue
                        .place_order(&symbol, OrderSide::Buy, quantity, price.round_dp(2))
                        .await
                    {
                        warn!(
                            "HybridOrchestrator[{}]: re-entry buy for {} failed: {}",
                            self.cohort.name, symbol, e
                        );
                        continue;
                    }
                }
            }

            if let Some(symbol_state) = self.state.symbols.get_mut(&symbol) {
                symbol_state.hwm = Some(price);
            }
        }
        Ok(())
    }

    /// Sell out of one symbol at the current price and close its open trade
    /// pair, feeding the outcome back to the learner.
    async fn exit_position(&mut self, symbol: &str) -> Result<()> {
        let Some(features) = self.services.feed.features(symbol).await? else {
            return Ok(());
        };
        let Some(price) = Decimal::from_f64(features.price) else {
            return Ok(());
        };

        let allocation = self
            .state
            .symbols
            .get(symbol)
            .map(|s| s.allocation_usd)
            .unwrap_or(0.0);
        if allocation >= self.config.min_position_usd {
            let quantity = (Decimal::from_f64(allocation).unwrap_or_default() / price).round_dp(6);
            if quantity > Decimal::ZERO {
                self.services
                    .venue
                    .place_order(symbol, OrderSide::Sell, quantity, price.round_dp(2))
                    .await?;
            }
        }

        if let Some(pair) = self
            .services
            .trade_repo
            .close_pair(&self.cohort.id, symbol, price, Utc::now())
            .await?
        {
            let profitable = pair.pnl_pct.unwrap_or(0.0) > 0.0;
            let _ = self
                .services
                .signal_repo
                .update_outcome(&pair.id, profitable)
                .await;
        }

        if let Some(symbol_state) = self.state.symbols.get_mut(symbol) {
            symbol_state.hwm = None;
        }
        Ok(())
    }

    // ===== Per-symbol work =====

    async fn process_symbol(&mut self, symbol: &str, regime: Option<MarketRegime>) -> Result<()> {
        let Some(features) = self.services.feed.features(symbol).await? else {
            debug!(
                "HybridOrchestrator[{}]: no features for {}, skipping",
                self.cohort.name, symbol
            );
            return Ok(());
        };

        let ai = match self.services.ai.classify(&features).await {
            Ok(ai) => ai,
            Err(e) => {
                debug!("HybridOrchestrator: AI unavailable for {}: {}", symbol, e);
                AiAssessment::neutral()
            }
        };
        let weights = self.services.learner.get_weights(regime).await;
        let breakdown = self.services.analyzer.analyze(&features, &ai, &weights);

        match self.state.mode {
            TradingMode::Grid => {
                self.maintain_grid(symbol, &features, &breakdown, regime)
                    .await?
            }
            TradingMode::Hold => self.maintain_hold(symbol, &features).await?,
            TradingMode::Cash => {}
        }
        Ok(())
    }

    async fn maintain_grid(
        &mut self,
        symbol: &str,
        features: &MarketFeatures,
        breakdown: &SignalBreakdown,
        regime: Option<MarketRegime>,
    ) -> Result<()> {
        // The cohort gate applies to opening new exposure, not to
        // maintaining fills already on the book.
        let gate_open = self
            .cohort
            .should_trade(breakdown.ai_confidence, features.fear_greed);

        let allocation = self
            .state
            .symbols
            .get(symbol)
            .map(|s| s.allocation_usd)
            .unwrap_or(0.0);

        self.ensure_grid_engine(symbol);
        let has_open = self
            .grids
            .get(symbol)
            .map(|g| g.has_open_orders())
            .unwrap_or(false);

        if !has_open && gate_open && allocation >= self.config.min_position_usd {
            let rules =
                RegimeDetector::regime_trading_rules(regime.unwrap_or(MarketRegime::Sideways));

            let sizing = self
                .services
                .sizer
                .calculate_position_size(
                    symbol,
                    self.config.total_investment,
                    breakdown.ai_confidence,
                    DEFAULT_RISK_BUDGET,
                    regime,
                    true,
                )
                .await;

            let others: Vec<OpenPosition> = self
                .state
                .symbols
                .iter()
                .filter(|(other, _)| other.as_str() != symbol)
                .map(|(other, state)| OpenPosition {
                    symbol: other.clone(),
                    value: state.allocation_usd,
                    cvar: sizing.cvar_used,
                })
                .collect();
            let damped = self
                .services
                .sizer
                .adjust_for_correlation(sizing.recommended_size, symbol, &others);

            let budget = allocation.min(damped * rules.position_size_multiplier);
            if budget >= self.config.min_position_usd {
                if let Some(price) = Decimal::from_f64(features.price) {
                    let cycle_id = self.active_cycle_id().await;
                    let engine = self.grids.get_mut(symbol).expect("engine ensured above");
                    engine
                        .open_grid(self.services.venue.as_ref(), price, budget, rules.grid_bias)
                        .await?;
                    let _ = self
                        .services
                        .signal_repo
                        .store_sizing_decision(symbol, cycle_id.as_deref(), &sizing)
                        .await;
                }
            }
        }

        let fills = {
            let engine = self.grids.get_mut(symbol).expect("engine ensured above");
            engine.sync_fills(self.services.venue.as_ref()).await?
        };
        for fill in &fills {
            self.record_fill(symbol, fill, breakdown, features, regime)
                .await?;
        }

        let engine = self.grids.get(symbol).expect("engine ensured above");
        self.services
            .state_store
            .save_grid(&self.cohort.name, engine.state())?;
        Ok(())
    }

    /// Track the high-water mark and exit when the drawdown from peak
    /// breaches the trailing stop.
    async fn maintain_hold(&mut self, symbol: &str, features: &MarketFeatures) -> Result<()> {
        let Some(price) = Decimal::from_f64(features.price) else {
            return Ok(());
        };

        let breach = {
            let Some(symbol_state) = self.state.symbols.get_mut(symbol) else {
                return Ok(());
            };
            let hwm = match symbol_state.hwm {
                Some(hwm) if hwm >= price => hwm,
                _ => {
                    symbol_state.hwm = Some(price);
                    price
                }
            };

            let drawdown_pct = ((hwm - price) / hwm * Decimal::from(100))
                .to_f64()
                .unwrap_or(0.0);
            drawdown_pct >= self.config.hold_trailing_stop_pct
        };

        if breach {
            info!(
                "HybridOrchestrator[{}]: trailing stop hit on {} at {}",
                self.cohort.name, symbol, price
            );
            self.exit_position(symbol).await?;
            if let Some(symbol_state) = self.state.symbols.get_mut(symbol) {
                symbol_state.allocation_usd = 0.0;
            }
        }
        Ok(())
    }

    /// Record a grid fill: buys open a trade pair with the full signal
    /// breakdown attached, sells close the oldest open pair and write the
    /// outcome back for the weight learner.
    async fn record_fill(
        &mut self,
        symbol: &str,
        fill: &GridFill,
        breakdown: &SignalBreakdown,
        features: &MarketFeatures,
        regime: Option<MarketRegime>,
    ) -> Result<()> {
        let cycle_id = self.active_cycle_id().await;
        match fill.side {
            OrderSide::Buy => {
                let pair = TradePair {
                    id: Uuid::new_v4().to_string(),
                    cohort_id: Some(self.cohort.id.clone()),
                    cycle_id: cycle_id.clone(),
                    symbol: symbol.to_string(),
                    entry_price: fill.price,
                    exit_price: None,
                    quantity: fill.quantity,
                    pnl_usd: None,
                    pnl_pct: None,
                    status: TradeStatus::Open,
                    regime,
                    fear_greed: Some(features.fear_greed),
                    created_at: fill.filled_at,
                    closed_at: None,
                };
                self.services.trade_repo.open_pair(&pair).await?;
                self.services
                    .signal_repo
                    .store_breakdown(
                        &pair.id,
                        cycle_id.as_deref(),
                        Some(&self.cohort.id),
                        breakdown,
                    )
                    .await?;
            }
            OrderSide::Sell => {
                if let Some(pair) = self
                    .services
                    .trade_repo
                    .close_pair(&self.cohort.id, symbol, fill.price, fill.filled_at)
                    .await?
                {
                    let profitable = pair.pnl_pct.unwrap_or(0.0) > 0.0;
                    self.services
                        .signal_repo
                        .update_outcome(&pair.id, profitable)
                        .await?;
                }
            }
        }
        Ok(())
    }

    // ===== Cycle bookkeeping =====

    async fn active_cycle_id(&self) -> Option<String> {
        self.services
            .cycle_manager
            .active_cycle(&self.cohort.id)
            .await
            .map(|c| c.id)
    }

    /// Close the finished cycle (feeding its ending capital back to the
    /// cohort) and open the next one.
    async fn roll_cycle_if_due(&mut self) -> Result<()> {
        if !self
            .services
            .cycle_manager
            .should_start_new_cycle(&self.cohort.id)
            .await
        {
            return Ok(());
        }

        if let Some(summary) = self
            .services
            .cycle_manager
            .close_cycle(&self.cohort.id, None)
            .await?
        {
            self.services
                .cohort_manager
                .update_capital(&self.cohort.name, summary.metrics.ending_capital)
                .await?;
            self.cohort.current_capital = summary.metrics.ending_capital;

            let text = format!(
                "{}: cycle #{} closed, pnl {:.2}% (capital ${})",
                self.cohort.name,
                summary.cycle_number,
                summary.metrics.total_pnl_pct,
                summary.metrics.ending_capital
            );
            if let Err(e) = self.services.notifier.send(&text, false).await {
                debug!("HybridOrchestrator: notify failed: {}", e);
            }
        }

        self.services
            .cycle_manager
            .start_cycle(&self.cohort.id, &self.cohort.name, self.cohort.current_capital)
            .await?;
        Ok(())
    }

    /// Status summary for the daily report.
    pub fn status(&self) -> serde_json::Value {
        let symbols: BTreeMap<&String, serde_json::Value> = self
            .state
            .symbols
            .iter()
            .map(|(symbol, state)| {
                (
                    symbol,
                    serde_json::json!({
                        "allocation_usd": state.allocation_usd,
                        "mode": state.mode.to_string(),
                        "open_orders": self
                            .grids
                            .get(symbol)
                            .map(|g| g.state().active_orders.len())
                            .unwrap_or(0),
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "cohort": self.cohort.name,
            "mode": self.state.mode.to_string(),
            "mode_entered_at": self.state.mode_entered_at.to_rfc3339(),
            "capital": self.cohort.current_capital.to_f64(),
            "symbols": symbols,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::trading::cohort_manager::default_cohorts;
    use crate::domain::regime::RegimeFeatures;
    use crate::infrastructure::mock::{
        MockAiProvider, MockMarketFeed, MockNotifier, MockRegimeRepository, MockSignalRepository,
        MockSnapshotRepository, MockTradeRepository, MockVenueClient, MockWeightsRepository,
    };
    use crate::application::risk::cvar_sizing::CorrelationMatrix;
    use crate::domain::repositories::{CycleRepository, CohortRepository};
    use chrono::Duration;

    fn regime_state(
        regime: MarketRegime,
        probability: f64,
        duration_days: i64,
    ) -> RegimeState {
        RegimeState {
            current_regime: regime,
            regime_probability: probability,
            transition_probability: 0.1,
            regime_duration_days: duration_days,
            previous_regime: None,
            features: RegimeFeatures {
                return_7d: 0.0,
                volatility_7d: 2.0,
                volume_trend: 0.0,
                fear_greed_avg: 50.0,
            },
            model_confidence: probability,
        }
    }

    struct Fixture {
        venue: Arc<MockVenueClient>,
        feed: Arc<MockMarketFeed>,
        notifier: Arc<MockNotifier>,
        trade_repo: Arc<MockTradeRepository>,
        signal_repo: Arc<MockSignalRepository>,
    }

    async fn build(initial_mode: TradingMode) -> (HybridOrchestrator, Fixture) {
        let venue = Arc::new(MockVenueClient::new());
        let feed = Arc::new(MockMarketFeed::new());
        let notifier = Arc::new(MockNotifier::new());
        let trade_repo = Arc::new(MockTradeRepository::default());
        let signal_repo = Arc::new(MockSignalRepository::default());
        let regime_repo = Arc::new(MockRegimeRepository::default());
        let weights_repo = Arc::new(MockWeightsRepository::default());

        struct NoCycles;
        #[async_trait::async_trait]
        impl CycleRepository for NoCycles {
            async fn active_cycles(&self) -> Result<Vec<crate::domain::cycle::TradingCycle>> {
                Ok(Vec::new())
            }
            async fn next_cycle_number(&self, _cohort_id: &str) -> Result<i64> {
                Ok(1)
            }
            async fn insert(&self, _cycle: &crate::domain::cycle::TradingCycle) -> Result<()> {
                Ok(())
            }
            async fn close(
                &self,
                _cycle_id: &str,
                _end_date: chrono::DateTime<Utc>,
                _metrics: &crate::domain::cycle::CycleMetrics,
                _playbook_version: Option<i64>,
            ) -> Result<()> {
                Ok(())
            }
            async fn cancel(&self, _cycle_id: &str) -> Result<()> {
                Ok(())
            }
            async fn completed(
                &self,
                _cohort_id: &str,
                _limit: i64,
            ) -> Result<Vec<crate::domain::cycle::TradingCycle>> {
                Ok(Vec::new())
            }
            async fn current_playbook_version(&self) -> Result<Option<i64>> {
                Ok(None)
            }
        }

        struct NoCohortStore;
        #[async_trait::async_trait]
        impl CohortRepository for NoCohortStore {
            async fn load_active(&self) -> Result<Vec<Cohort>> {
                Ok(Vec::new())
            }
            async fn insert(&self, _cohort: &Cohort) -> Result<()> {
                Ok(())
            }
            async fn update_capital(
                &self,
                _name: &str,
                _capital: rust_decimal::Decimal,
            ) -> Result<()> {
                Ok(())
            }
            async fn update_config(
                &self,
                _name: &str,
                _config: &crate::domain::cohort::CohortConfig,
            ) -> Result<()> {
                Ok(())
            }
            async fn comparison_report(
                &self,
                _limit: i64,
            ) -> Result<Vec<crate::domain::repositories::CohortComparisonRow>> {
                Ok(Vec::new())
            }
        }

        let cycle_repo: Arc<dyn CycleRepository> = Arc::new(NoCycles);
        let cohort_manager = Arc::new(CohortManager::new(None));
        cohort_manager.load().await.unwrap();

        let state_dir = std::env::temp_dir().join(format!(
            "gridcohort-hybrid-test-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        let services = HybridServices {
            venue: venue.clone(),
            feed: feed.clone(),
            ai: Arc::new(MockAiProvider::neutral()),
            notifier: notifier.clone(),
            regime_detector: Arc::new(RegimeDetector::new(feed.clone(), regime_repo)),
            analyzer: Arc::new(SignalAnalyzer::new()),
            learner: Arc::new(BayesianWeightLearner::new(
                weights_repo,
                signal_repo.clone(),
                Arc::new(NoCohortStore),
            )),
            sizer: Arc::new(CVarPositionSizer::new(
                venue.clone(),
                trade_repo.clone(),
                CorrelationMatrix::crypto_defaults(),
            )),
            cycle_manager: Arc::new(CycleManager::new(
                cycle_repo,
                trade_repo.clone(),
                Arc::new(MockSnapshotRepository::default()),
                signal_repo.clone(),
            )),
            cohort_manager,
            trade_repo: trade_repo.clone(),
            signal_repo: signal_repo.clone(),
            state_store: Arc::new(StateFileStore::new(
                state_dir.clone(),
                state_dir.join("heartbeat"),
            )),
        };

        let cohort = default_cohorts().into_iter().find(|c| c.name == "balanced").unwrap();
        let mut config = HybridConfig::default();
        config.initial_mode = initial_mode;
        config.total_investment = 1000.0;
        config.max_symbols = 2;

        let orchestrator = HybridOrchestrator::new(cohort, config, services);
        (
            orchestrator,
            Fixture {
                venue,
                feed,
                notifier,
                trade_repo,
                signal_repo,
            },
        )
    }

    fn aged_state(mode: TradingMode, hours_ago: i64) -> HybridState {
        HybridState::new(mode, Utc::now() - Duration::hours(hours_ago))
    }

    #[tokio::test]
    async fn test_no_transition_before_regime_duration() {
        let (mut orchestrator, _fixture) = build(TradingMode::Grid).await;
        orchestrator.set_state(aged_state(TradingMode::Grid, 48));

        // Bear regime at 0.8 probability but only one day old.
        let rs = regime_state(MarketRegime::Bear, 0.8, 1);
        assert_eq!(orchestrator.transition_target(&rs), None);
    }

    #[tokio::test]
    async fn test_bear_confirmation_fires_cash_transition() {
        let (mut orchestrator, fixture) = build(TradingMode::Grid).await;
        orchestrator.set_state(aged_state(TradingMode::Grid, 48));

        let rs = regime_state(MarketRegime::Bear, 0.8, 2);
        assert_eq!(orchestrator.transition_target(&rs), Some(TradingMode::Cash));

        orchestrator.enter_mode(TradingMode::Cash, MarketRegime::Bear).await.unwrap();
        assert_eq!(orchestrator.mode(), TradingMode::Cash);
        assert!(orchestrator.state().cash_entered_at.is_some());

        // Cooldown: immediately after entering CASH nothing else may fire.
        let rs = regime_state(MarketRegime::Bull, 0.9, 5);
        assert_eq!(orchestrator.transition_target(&rs), None);

        let sent = fixture.notifier.sent().await;
        assert!(sent.iter().any(|(text, _)| text.contains("CASH")));
    }

    #[tokio::test]
    async fn test_probability_gate_blocks_transition() {
        let (mut orchestrator, _fixture) = build(TradingMode::Grid).await;
        orchestrator.set_state(aged_state(TradingMode::Grid, 48));

        let rs = regime_state(MarketRegime::Bear, 0.6, 5);
        assert_eq!(orchestrator.transition_target(&rs), None);
    }

    #[tokio::test]
    async fn test_mode_switching_can_be_pinned() {
        let (mut orchestrator, _fixture) = build(TradingMode::Grid).await;
        orchestrator.set_state(aged_state(TradingMode::Grid, 480));
        orchestrator.config.enable_mode_switching = false;

        let rs = regime_state(MarketRegime::Bear, 0.99, 30);
        assert_eq!(orchestrator.transition_target(&rs), None);
    }

    #[tokio::test]
    async fn test_cash_trailing_reentry_to_hold() {
        let (mut orchestrator, _fixture) = build(TradingMode::Cash).await;
        // In CASH long past both cooldown and the cash exit timeout.
        orchestrator.set_state(aged_state(TradingMode::Cash, 48));

        // Sideways but weak probability: no grid entry, so trailing re-entry
        // into HOLD applies.
        let rs = regime_state(MarketRegime::Sideways, 0.5, 3);
        assert_eq!(orchestrator.transition_target(&rs), Some(TradingMode::Hold));

        // Still bearish: stay in cash.
        let rs = regime_state(MarketRegime::Bear, 0.5, 3);
        assert_eq!(orchestrator.transition_target(&rs), None);
    }

    #[tokio::test]
    async fn test_grid_to_hold_needs_flat_grids_and_extended_bull() {
        let (mut orchestrator, _fixture) = build(TradingMode::Grid).await;
        orchestrator.set_state(aged_state(TradingMode::Grid, 48));

        // Bull confirmed but only at the minimum duration: not "extended".
        let rs = regime_state(MarketRegime::Bull, 0.9, 2);
        assert_eq!(orchestrator.transition_target(&rs), None);

        // Twice the minimum duration with flat grids rides the trend.
        let rs = regime_state(MarketRegime::Bull, 0.9, 4);
        assert_eq!(orchestrator.transition_target(&rs), Some(TradingMode::Hold));
    }

    #[tokio::test]
    async fn test_hold_trailing_stop_exits_position() {
        let (mut orchestrator, fixture) = build(TradingMode::Hold).await;
        let mut state = aged_state(TradingMode::Hold, 1);
        state.symbols.insert(
            "BTCUSDT".to_string(),
            SymbolState {
                allocation_usd: 500.0,
                mode: TradingMode::Hold,
                hwm: Some(Decimal::from(50_000)),
            },
        );
        orchestrator.set_state(state);

        // 8% below the high-water mark breaches the 7% trailing stop.
        fixture
            .feed
            .set_features(MarketFeatures::neutral("BTCUSDT", 46_000.0))
            .await;
        orchestrator
            .maintain_hold("BTCUSDT", &MarketFeatures::neutral("BTCUSDT", 46_000.0))
            .await
            .unwrap();

        let placed = fixture.venue.placed_orders().await;
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, OrderSide::Sell);
        assert_eq!(
            orchestrator.state().symbols["BTCUSDT"].allocation_usd,
            0.0
        );
    }

    #[tokio::test]
    async fn test_hold_hwm_ratchets_up() {
        let (mut orchestrator, _fixture) = build(TradingMode::Hold).await;
        let mut state = aged_state(TradingMode::Hold, 1);
        state.symbols.insert(
            "BTCUSDT".to_string(),
            SymbolState {
                allocation_usd: 500.0,
                mode: TradingMode::Hold,
                hwm: Some(Decimal::from(50_000)),
            },
        );
        orchestrator.set_state(state);

        orchestrator
            .maintain_hold("BTCUSDT", &MarketFeatures::neutral("BTCUSDT", 52_000.0))
            .await
            .unwrap();
        assert_eq!(
            orchestrator.state().symbols["BTCUSDT"].hwm,
            Some(Decimal::from(52_000))
        );
    }

    #[tokio::test]
    async fn test_grid_fill_records_trade_pair_and_breakdown() {
        let (mut orchestrator, fixture) = build(TradingMode::Grid).await;
        let mut state = aged_state(TradingMode::Grid, 1);
        state
            .symbols
            .insert("BTCUSDT".to_string(), SymbolState::new(500.0, TradingMode::Grid));
        orchestrator.set_state(state);

        // Neutral AI confidence (0.5) meets the balanced gate exactly.
        fixture
            .feed
            .set_features(MarketFeatures::neutral("BTCUSDT", 50_000.0))
            .await;
        // A favorable return history keeps the Kelly leg from shrinking the
        // grid budget below the notional floor.
        let mut history: Vec<f64> = vec![0.02; 20];
        history.extend(vec![-0.01; 10]);
        fixture
            .trade_repo
            .set_symbol_returns("BTCUSDT", history)
            .await;
        fixture
            .feed
            .set_regime_features(Some(RegimeFeatures {
                return_7d: 0.5,
                volatility_7d: 1.0,
                volume_trend: 0.0,
                fear_greed_avg: 50.0,
            }))
            .await;

        orchestrator.tick().await.unwrap();
        assert!(fixture.venue.placed_orders().await.len() > 0);

        // Simulate a buy fill and tick again.
        let buy = fixture
            .venue
            .placed_orders()
            .await
            .into_iter()
            .find(|o| o.side == OrderSide::Buy)
            .unwrap();
        fixture
            .venue
            .remove_open_order("BTCUSDT", &buy.order_id)
            .await;
        orchestrator.tick().await.unwrap();

        let pairs = fixture.trade_repo.open_pairs().await;
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].symbol, "BTCUSDT");
        assert_eq!(pairs[0].entry_price, buy.price);

        let breakdowns = fixture.signal_repo.breakdowns.lock().await;
        assert_eq!(breakdowns.len(), 1);
        assert_eq!(breakdowns[0].0, pairs[0].id);
    }
}
