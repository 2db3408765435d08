//! Position sizing through the full data path: recorded trade returns,
//! kline fallback and the deterministic synthetic fallback.

use gridcohort::application::risk::cvar_sizing::{
    synthetic_returns, CVarPositionSizer, CorrelationMatrix, DEFAULT_RISK_BUDGET,
};
use gridcohort::domain::regime::MarketRegime;
use gridcohort::domain::types::Kline;
use gridcohort::infrastructure::mock::{MockTradeRepository, MockVenueClient};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;

fn sizer(venue: Arc<MockVenueClient>, trades: Arc<MockTradeRepository>) -> CVarPositionSizer {
    CVarPositionSizer::new(venue, trades, CorrelationMatrix::crypto_defaults())
}

#[tokio::test]
async fn recorded_trade_returns_drive_the_size() {
    let venue = Arc::new(MockVenueClient::new());
    let trades = Arc::new(MockTradeRepository::default());

    // ~N(0.001, 0.03) over 50 observations, deterministic.
    let returns: Vec<f64> = synthetic_returns("BTCUSDT")
        .into_iter()
        .cycle()
        .take(50)
        .collect();
    trades.set_symbol_returns("BTCUSDT", returns.clone()).await;

    let s = sizer(venue, trades);
    let result = s
        .calculate_position_size(
            "BTCUSDT",
            10_000.0,
            0.7,
            DEFAULT_RISK_BUDGET,
            Some(MarketRegime::Bear),
            true,
        )
        .await;

    // Between 1% and 25% of the $10k portfolio, with the bear multiplier
    // widening the assumed tail by 1.5x.
    assert!(result.recommended_size >= 100.0);
    assert!(result.recommended_size <= 2_500.0);
    let profile = CVarPositionSizer::tail_risk_profile(&returns);
    assert!(result.cvar_used >= 1.5 * profile.cvar_95 - 1e-12);
    assert!(
        (result.expected_max_loss - result.recommended_size * result.cvar_used).abs() < 1e-9
    );
}

#[tokio::test]
async fn kline_fallback_kicks_in_without_trades() {
    let venue = Arc::new(MockVenueClient::new());
    let trades = Arc::new(MockTradeRepository::default());

    // Build 31 daily candles around 100 with visible wiggle.
    let klines: Vec<Kline> = (0..31)
        .map(|i| {
            let close = 100.0 + ((i % 5) as f64 - 2.0);
            Kline {
                open: Decimal::from_f64(close).unwrap(),
                high: Decimal::from_f64(close + 1.0).unwrap(),
                low: Decimal::from_f64(close - 1.0).unwrap(),
                close: Decimal::from_f64(close).unwrap(),
                volume: 1000.0,
                open_time: i as i64,
            }
        })
        .collect();
    venue.set_klines("ETHUSDT", klines).await;

    let s = sizer(venue, trades);
    let returns = s.historical_returns("ETHUSDT").await;
    assert_eq!(returns.len(), 30);
    assert!(returns.iter().any(|r| *r != 0.0));
}

#[tokio::test]
async fn synthetic_fallback_is_deterministic_per_symbol() {
    let venue = Arc::new(MockVenueClient::new());
    let trades = Arc::new(MockTradeRepository::default());
    let s = sizer(venue, trades);

    // Nothing recorded, no klines: deterministic synthetic series.
    let first = s.historical_returns("SOLUSDT").await;
    let second = s.historical_returns("SOLUSDT").await;
    assert_eq!(first, second);
    assert_eq!(first, synthetic_returns("SOLUSDT"));

    let result = s
        .calculate_position_size("SOLUSDT", 5_000.0, 0.5, DEFAULT_RISK_BUDGET, None, true)
        .await;
    assert!(result.recommended_size >= 50.0); // 1% floor
    assert!(result.recommended_size <= 1_250.0); // 25% ceiling
}

#[tokio::test]
async fn stop_loss_distance_tracks_the_tail() {
    let venue = Arc::new(MockVenueClient::new());
    let trades = Arc::new(MockTradeRepository::default());

    // Calm series: stop clamps to the 2% floor.
    let calm: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 0.002 } else { -0.001 }).collect();
    trades.set_symbol_returns("BTCUSDT", calm).await;
    // Violent series: stop clamps to the 15% ceiling.
    let wild: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 0.10 } else { -0.30 }).collect();
    trades.set_symbol_returns("DOGEUSDT", wild).await;

    let s = sizer(venue, trades);
    assert_eq!(s.stop_loss_distance("BTCUSDT").await, 0.02);
    assert_eq!(s.stop_loss_distance("DOGEUSDT").await, 0.15);
}
