//! Full cycle lifecycle against the in-memory store: open, trade a week,
//! close with the metric bundle, and check the capital invariants.

use chrono::{Duration, Utc};
use gridcohort::application::trading::cycle_manager::CycleManager;
use gridcohort::domain::cycle::CycleStatus;
use gridcohort::domain::regime::MarketRegime;
use gridcohort::domain::repositories::{
    CycleRepository, SignalRepository, SnapshotRepository, TradePair, TradeRepository, TradeStatus,
};
use gridcohort::infrastructure::persistence::database::Database;
use gridcohort::infrastructure::persistence::repositories::cycle_repository::SqliteCycleRepository;
use gridcohort::infrastructure::persistence::repositories::signal_repository::SqliteSignalRepository;
use gridcohort::infrastructure::persistence::repositories::snapshot_repository::SqliteSnapshotRepository;
use gridcohort::infrastructure::persistence::repositories::trade_repository::SqliteTradeRepository;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::str::FromStr;
use std::sync::Arc;

struct Harness {
    manager: CycleManager,
    trade_repo: Arc<SqliteTradeRepository>,
    cycle_repo: Arc<SqliteCycleRepository>,
}

async fn harness() -> Harness {
    let db = Database::in_memory().await.unwrap();
    let cycle_repo = Arc::new(SqliteCycleRepository::new(db.pool.clone()));
    let trade_repo = Arc::new(SqliteTradeRepository::new(db.pool.clone()));
    let snapshot_repo = Arc::new(SqliteSnapshotRepository::new(db.pool.clone()));
    let signal_repo = Arc::new(SqliteSignalRepository::new(db.pool.clone()));

    Harness {
        manager: CycleManager::new(
            cycle_repo.clone() as Arc<dyn CycleRepository>,
            trade_repo.clone() as Arc<dyn TradeRepository>,
            snapshot_repo as Arc<dyn SnapshotRepository>,
            signal_repo as Arc<dyn SignalRepository>,
        ),
        trade_repo,
        cycle_repo,
    }
}

/// One closed trade per day producing the given percentage return on a
/// quantity-10 position entered at 100.
async fn seed_week(h: &Harness, cycle_id: &str, daily_pcts: &[f64]) {
    for (day, pct) in daily_pcts.iter().enumerate() {
        let id = format!("t{}", day);
        let created = Utc::now() - Duration::days((daily_pcts.len() - day) as i64);
        let pair = TradePair {
            id,
            cohort_id: Some("c1".to_string()),
            cycle_id: Some(cycle_id.to_string()),
            symbol: "BTCUSDT".to_string(),
            entry_price: dec!(100),
            exit_price: None,
            quantity: dec!(10),
            pnl_usd: None,
            pnl_pct: None,
            status: TradeStatus::Open,
            regime: Some(if *pct >= 0.0 {
                MarketRegime::Bull
            } else {
                MarketRegime::Bear
            }),
            fear_greed: Some(55),
            created_at: created,
            closed_at: None,
        };
        h.trade_repo.open_pair(&pair).await.unwrap();

        let exit = Decimal::from_str(&format!("{:.4}", 100.0 * (1.0 + pct / 100.0))).unwrap();
        h.trade_repo
            .close_pair("c1", "BTCUSDT", exit, created + Duration::hours(4))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn week_of_trades_closes_with_full_metrics() {
    let h = harness().await;

    let cycle = h
        .manager
        .start_cycle("c1", "balanced", dec!(1000))
        .await
        .unwrap();
    assert_eq!(cycle.cycle_number, 1);
    assert!(!h.manager.should_start_new_cycle("c1").await);

    // The worked example: +1, +2, -3, +1.5, -0.5, +2, +1 percent days.
    seed_week(&h, &cycle.id, &[1.0, 2.0, -3.0, 1.5, -0.5, 2.0, 1.0]).await;

    let summary = h.manager.close_cycle("c1", None).await.unwrap().unwrap();
    let metrics = &summary.metrics;

    // ~+4% on the week, exactly starting + pnl = ending.
    assert!((metrics.total_pnl_pct - 4.0).abs() < 0.01);
    assert_eq!(
        metrics.ending_capital - dec!(1000),
        metrics.total_pnl
    );

    assert!(metrics.sharpe_ratio.unwrap().is_finite());
    assert_eq!(
        metrics.sortino_ratio.unwrap().is_sign_positive(),
        metrics.sharpe_ratio.unwrap().is_sign_positive()
    );
    assert!(metrics.max_drawdown.unwrap() <= 0.0);
    assert_eq!(metrics.trades_count, 7);
    assert_eq!(metrics.winning_trades, 5);
    assert_eq!(metrics.losing_trades, 2);
    assert_eq!(metrics.dominant_regime, Some(MarketRegime::Bull));

    // The store row is completed and immutable.
    let completed = h.cycle_repo.completed("c1", 10).await.unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].status, CycleStatus::Completed);
    assert_eq!(
        completed[0].ending_capital.unwrap() - completed[0].starting_capital,
        completed[0].total_pnl.unwrap()
    );

    // A new cycle can open with a dense number.
    let next = h
        .manager
        .start_cycle("c1", "balanced", metrics.ending_capital)
        .await
        .unwrap();
    assert_eq!(next.cycle_number, 2);
}

#[tokio::test]
async fn at_most_one_active_cycle_per_cohort() {
    let h = harness().await;
    h.manager
        .start_cycle("c1", "balanced", dec!(1000))
        .await
        .unwrap();
    assert!(h
        .manager
        .start_cycle("c1", "balanced", dec!(1000))
        .await
        .is_err());

    // Another cohort is unaffected.
    h.manager
        .start_cycle("c2", "aggressive", dec!(1000))
        .await
        .unwrap();
}

#[tokio::test]
async fn empty_cycle_closes_without_metrics() {
    let h = harness().await;
    let _cycle = h
        .manager
        .start_cycle("c1", "balanced", dec!(1000))
        .await
        .unwrap();

    let summary = h.manager.close_cycle("c1", None).await.unwrap().unwrap();
    let metrics = &summary.metrics;

    // No trades: capital unchanged, risk ratios absent rather than fake.
    assert_eq!(metrics.ending_capital, dec!(1000));
    assert_eq!(metrics.total_pnl, dec!(0));
    assert!(metrics.sharpe_ratio.is_none());
    assert!(metrics.var_95.is_none());
    assert!(metrics.dominant_regime.is_none());
}
