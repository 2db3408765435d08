//! End-to-end weight learning against a real (in-memory) store: the
//! 20-trade gate, posterior movement and the active-row invariants.

use chrono::Utc;
use gridcohort::application::analysis::bayesian::BayesianWeightLearner;
use gridcohort::application::analysis::signals::SignalAnalyzer;
use gridcohort::domain::regime::MarketRegime;
use gridcohort::domain::repositories::{
    CohortRepository, SignalRepository, TradePair, TradeRepository, TradeStatus, WeightsRepository,
};
use gridcohort::domain::signals::{AiAssessment, AiDirection, AiRiskLevel, MarketFeatures};
use gridcohort::domain::weights::{default_weights, MAX_WEIGHT, MIN_WEIGHT};
use gridcohort::infrastructure::persistence::database::Database;
use gridcohort::infrastructure::persistence::repositories::cohort_repository::SqliteCohortRepository;
use gridcohort::infrastructure::persistence::repositories::signal_repository::SqliteSignalRepository;
use gridcohort::infrastructure::persistence::repositories::trade_repository::SqliteTradeRepository;
use gridcohort::infrastructure::persistence::repositories::weights_repository::SqliteWeightsRepository;
use rust_decimal_macros::dec;
use std::sync::Arc;

struct Harness {
    learner: BayesianWeightLearner,
    trade_repo: Arc<SqliteTradeRepository>,
    signal_repo: Arc<SqliteSignalRepository>,
}

async fn harness() -> Harness {
    let db = Database::in_memory().await.unwrap();
    let weights_repo: Arc<dyn WeightsRepository> =
        Arc::new(SqliteWeightsRepository::new(db.pool.clone()));
    let signal_repo = Arc::new(SqliteSignalRepository::new(db.pool.clone()));
    let cohort_repo: Arc<dyn CohortRepository> =
        Arc::new(SqliteCohortRepository::new(db.pool.clone()));
    let trade_repo = Arc::new(SqliteTradeRepository::new(db.pool.clone()));

    Harness {
        learner: BayesianWeightLearner::new(
            weights_repo,
            signal_repo.clone() as Arc<dyn SignalRepository>,
            cohort_repo,
        ),
        trade_repo,
        signal_repo,
    }
}

/// A closed winning trade with a mildly bullish signal picture.
async fn seed_trade(h: &Harness, index: usize, profitable: bool) {
    let trade_id = format!("trade-{}", index);
    let pair = TradePair {
        id: trade_id.clone(),
        cohort_id: Some("c1".to_string()),
        cycle_id: Some("cycle1".to_string()),
        symbol: "BTCUSDT".to_string(),
        entry_price: dec!(100),
        exit_price: None,
        quantity: dec!(1),
        pnl_usd: None,
        pnl_pct: None,
        status: TradeStatus::Open,
        regime: Some(MarketRegime::Sideways),
        fear_greed: Some(35),
        created_at: Utc::now(),
        closed_at: None,
    };
    h.trade_repo.open_pair(&pair).await.unwrap();

    let mut features = MarketFeatures::neutral("BTCUSDT", 100.0);
    features.fear_greed = 35; // fear band: +0.5 contrarian signal
    features.rsi = 25.0; // oversold: +0.7
    let breakdown = SignalAnalyzer::new().analyze(
        &features,
        &AiAssessment {
            direction: AiDirection::Bullish,
            confidence: 0.7,
            risk_level: AiRiskLevel::Medium,
            reasoning: None,
        },
        &default_weights(),
    );
    h.signal_repo
        .store_breakdown(&trade_id, Some("cycle1"), Some("c1"), &breakdown)
        .await
        .unwrap();

    let exit = if profitable { dec!(102) } else { dec!(98) };
    h.trade_repo
        .close_pair("c1", "BTCUSDT", exit, Utc::now())
        .await
        .unwrap();
}

#[tokio::test]
async fn nineteen_trades_leave_weights_unchanged() {
    let h = harness().await;
    for i in 0..19 {
        seed_trade(&h, i, i % 3 != 0).await;
    }

    let result = h.learner.update_weights(None, 30, None).await.unwrap();
    assert_eq!(result.confidence, 0.0);
    assert_eq!(result.sample_size, 0);
    assert_eq!(result.weights, default_weights());
}

#[tokio::test]
async fn twentieth_trade_unlocks_the_update() {
    let h = harness().await;
    for i in 0..20 {
        seed_trade(&h, i, i % 3 != 0).await;
    }

    let result = h.learner.update_weights(None, 30, None).await.unwrap();
    assert_eq!(result.sample_size, 20);
    assert!((result.confidence - 0.2).abs() < 1e-9);

    // Property: weights sum to one within tolerance and respect bounds.
    let total: f64 = result.weights.values().sum();
    assert!((total - 1.0).abs() < 1e-3);
    for weight in result.weights.values() {
        assert!(*weight >= MIN_WEIGHT - 1e-9);
        assert!(*weight <= MAX_WEIGHT + 1e-9);
    }

    // The update was persisted as the single active global row.
    let restored = h.learner.get_weights(None).await;
    assert_eq!(restored, result.weights);
}

#[tokio::test]
async fn accurate_signals_gain_weight() {
    let h = harness().await;
    // 30 trades, all profitable: the bullish rsi/fear_greed signals were
    // right every time, the bearish trend signal consistently wrong.
    for i in 0..30 {
        seed_trade(&h, i, true).await;
    }

    let result = h.learner.update_weights(None, 30, None).await.unwrap();
    assert!(result.weights["rsi"] > result.weights["trend"]);
    assert!(result.weights["fear_greed"] > result.weights["trend"]);
}
