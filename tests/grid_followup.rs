//! The failed-follow-up path end to end: a buy fills, the mirror sell is
//! rejected, the original order is annotated and persisted, and the grid
//! health task raises the alert on its next run.

use gridcohort::application::monitoring::tasks::MonitoringTasks;
use gridcohort::application::trading::grid_engine::GridEngine;
use gridcohort::domain::regime::GridBias;
use gridcohort::domain::repositories::TradeRepository;
use gridcohort::domain::types::OrderSide;
use gridcohort::infrastructure::mock::{
    MockMonitoringRepository, MockNotifier, MockTradeRepository, MockVenueClient,
};
use gridcohort::infrastructure::state_files::StateFileStore;
use rust_decimal_macros::dec;
use std::sync::Arc;

fn temp_store(tag: &str) -> Arc<StateFileStore> {
    let dir = std::env::temp_dir().join(format!(
        "gridcohort-followup-{}-{}",
        tag,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    Arc::new(StateFileStore::new(dir.clone(), dir.join("heartbeat")))
}

#[tokio::test]
async fn failed_followup_is_annotated_persisted_and_alerted() {
    let venue = Arc::new(MockVenueClient::new());
    let store = temp_store("alert");
    let notifier = Arc::new(MockNotifier::new());

    // A grid around 50k: 4% range over 2 levels per side -> 2% steps.
    let mut engine = GridEngine::new("BTCUSDT", "balanced", 4.0, 2);
    engine
        .open_grid(venue.as_ref(), dec!(50000), 400.0, GridBias::Balanced)
        .await
        .unwrap();

    // The 49000 buy fills...
    let buy_id = engine
        .state()
        .active_orders
        .iter()
        .find(|(_, o)| o.side == OrderSide::Buy && o.price == dec!(49000))
        .map(|(id, _)| id.clone())
        .expect("expected a buy level at 49000");
    venue.remove_open_order("BTCUSDT", &buy_id).await;

    // ...and the mirror sell placement dies with a transient venue error.
    venue.fail_next_place_order().await;
    let fills = engine.sync_fills(venue.as_ref()).await.unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].price, dec!(49000));

    let order = &engine.state().active_orders[&buy_id];
    assert!(order.failed_followup);

    // Persist exactly what the orchestrator would persist.
    store.save_grid("balanced", engine.state()).unwrap();
    let reloaded = store.load_grid("BTCUSDT", "balanced").unwrap().unwrap();
    assert_eq!(&reloaded, engine.state());
    assert!(reloaded.has_failed_followups());

    // The next grid health run alerts with force=true.
    let tasks = MonitoringTasks::new(
        store,
        venue.clone(),
        notifier.clone(),
        Arc::new(MockMonitoringRepository::default()),
        Arc::new(MockTradeRepository::default()) as Arc<dyn TradeRepository>,
        false,
    );
    tasks.grid_health_summary().await.unwrap();

    let sent = notifier.sent().await;
    assert_eq!(sent.len(), 1);
    let (text, force) = &sent[0];
    assert!(force);
    assert!(text.contains("Failed follow-ups"));
    assert!(text.contains("balanced:BTCUSDT"));
}

#[tokio::test]
async fn successful_followup_rearms_the_opposite_side() {
    let venue = Arc::new(MockVenueClient::new());
    let mut engine = GridEngine::new("ETHUSDT", "aggressive", 4.0, 2);
    engine
        .open_grid(venue.as_ref(), dec!(3000), 400.0, GridBias::Balanced)
        .await
        .unwrap();

    let sell_id = engine
        .state()
        .active_orders
        .iter()
        .find(|(_, o)| o.side == OrderSide::Sell && o.price == dec!(3060))
        .map(|(id, _)| id.clone())
        .expect("expected a sell level at 3060");
    venue.remove_open_order("ETHUSDT", &sell_id).await;

    let fills = engine.sync_fills(venue.as_ref()).await.unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].side, OrderSide::Sell);

    // A sell fill re-arms a buy 2% below the fill price.
    let rearm_price = (dec!(3060) * dec!(0.98)).round_dp(2);
    assert!(engine
        .state()
        .active_orders
        .values()
        .any(|o| o.side == OrderSide::Buy && o.price == rearm_price));
    assert!(!engine.state().has_failed_followups());
}
