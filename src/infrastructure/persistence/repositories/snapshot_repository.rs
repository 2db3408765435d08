use super::to_ts;
use crate::domain::regime::RegimeFeatures;
use crate::domain::repositories::SnapshotRepository;
use crate::domain::signals::{FedSentiment, MarketFeatures};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

pub struct SqliteSnapshotRepository {
    pool: SqlitePool,
}

impl SqliteSnapshotRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Daily BTC aggregates (price, volume, fear & greed), oldest first.
    async fn daily_btc_rows(&self, days: i64) -> Result<Vec<(f64, f64, f64)>> {
        let cutoff = to_ts(Utc::now() - chrono::Duration::days(days));
        let rows = sqlx::query(
            r#"
            SELECT
                DATE(timestamp, 'unixepoch') AS day,
                AVG(btc_price) AS price,
                AVG(volume_24h) AS volume,
                AVG(fear_greed) AS fear_greed
            FROM market_snapshots
            WHERE timestamp >= ? AND btc_price IS NOT NULL
            GROUP BY DATE(timestamp, 'unixepoch')
            ORDER BY day
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load daily snapshots")?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let price: Option<f64> = row.try_get("price").ok()?;
                let volume: Option<f64> = row.try_get("volume").ok()?;
                let fear_greed: Option<f64> = row.try_get("fear_greed").ok()?;
                Some((price?, volume.unwrap_or(0.0), fear_greed.unwrap_or(50.0)))
            })
            .collect())
    }
}

/// Rolling 7-day feature extraction over daily aggregates.
fn extract_features(rows: &[(f64, f64, f64)]) -> Vec<RegimeFeatures> {
    if rows.len() < 8 {
        return Vec::new();
    }

    let mut features = Vec::with_capacity(rows.len() - 7);
    for i in 7..rows.len() {
        let (price, volume, _) = rows[i];
        let (price_7d_ago, _, _) = rows[i - 7];
        if price_7d_ago <= 0.0 || price <= 0.0 {
            continue;
        }

        let return_7d = (price / price_7d_ago).ln() * 100.0;

        let daily_log_returns: Vec<f64> = rows[i - 7..=i]
            .windows(2)
            .filter(|pair| pair[0].0 > 0.0 && pair[1].0 > 0.0)
            .map(|pair| (pair[1].0 / pair[0].0).ln() * 100.0)
            .collect();
        let volatility_7d = if daily_log_returns.is_empty() {
            0.0
        } else {
            let mean = daily_log_returns.iter().sum::<f64>() / daily_log_returns.len() as f64;
            (daily_log_returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
                / daily_log_returns.len() as f64)
                .sqrt()
        };

        let mean_volume: f64 =
            rows[i - 7..i].iter().map(|r| r.1).sum::<f64>() / 7.0;
        let volume_trend = if mean_volume > 0.0 {
            volume / mean_volume - 1.0
        } else {
            0.0
        };

        let fear_greed_avg =
            rows[i - 7..=i].iter().map(|r| r.2).sum::<f64>() / 8.0;

        features.push(RegimeFeatures {
            return_7d,
            volatility_7d,
            volume_trend,
            fear_greed_avg,
        });
    }
    features
}

#[async_trait]
impl SnapshotRepository for SqliteSnapshotRepository {
    async fn latest_features(&self, symbol: &str) -> Result<Option<MarketFeatures>> {
        let row = sqlx::query(
            "SELECT * FROM market_snapshots WHERE symbol = ? ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load latest snapshot")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let fed: Option<String> = row.try_get("fed_sentiment")?;
        let fed_sentiment = match fed.as_deref() {
            Some("HAWKISH") => Some(FedSentiment::Hawkish),
            Some("DOVISH") => Some(FedSentiment::Dovish),
            Some("NEUTRAL") => Some(FedSentiment::Neutral),
            _ => None,
        };

        Ok(Some(MarketFeatures {
            symbol: row.try_get("symbol")?,
            price: row.try_get("price")?,
            fear_greed: row.try_get::<Option<i64>, _>("fear_greed")?.unwrap_or(50),
            rsi: row.try_get::<Option<f64>, _>("rsi")?.unwrap_or(50.0),
            macd_line: row.try_get::<Option<f64>, _>("macd_line")?.unwrap_or(0.0),
            macd_signal: row.try_get::<Option<f64>, _>("macd_signal")?.unwrap_or(0.0),
            macd_histogram: row
                .try_get::<Option<f64>, _>("macd_histogram")?
                .unwrap_or(0.0),
            prev_macd_histogram: row.try_get("prev_macd_histogram")?,
            sma_20: row.try_get::<Option<f64>, _>("sma_20")?.unwrap_or(0.0),
            sma_50: row.try_get::<Option<f64>, _>("sma_50")?.unwrap_or(0.0),
            sma_200: row.try_get("sma_200")?,
            volume: row.try_get::<Option<f64>, _>("volume")?.unwrap_or(0.0),
            avg_volume: row.try_get::<Option<f64>, _>("avg_volume")?.unwrap_or(1.0),
            price_change_24h: row
                .try_get::<Option<f64>, _>("price_change_24h")?
                .unwrap_or(0.0),
            whale_buys_usd: row
                .try_get::<Option<f64>, _>("whale_buys_usd")?
                .unwrap_or(0.0),
            whale_sells_usd: row
                .try_get::<Option<f64>, _>("whale_sells_usd")?
                .unwrap_or(0.0),
            social_score: row
                .try_get::<Option<f64>, _>("social_score")?
                .unwrap_or(50.0),
            news_sentiment: row.try_get("news_sentiment")?,
            etf_flow_7d: row.try_get::<Option<f64>, _>("etf_flow_7d")?.unwrap_or(0.0),
            fed_sentiment,
            high_impact_events: row
                .try_get::<Option<i64>, _>("high_impact_events")?
                .unwrap_or(0) as usize,
            playbook_alignment: 0.5,
        }))
    }

    async fn regime_window(&self) -> Result<Option<RegimeFeatures>> {
        let rows = self.daily_btc_rows(8).await?;
        if rows.len() < 2 {
            return Ok(None);
        }

        let first_price = rows.first().map(|r| r.0).unwrap_or(0.0);
        let last_price = rows.last().map(|r| r.0).unwrap_or(0.0);
        if first_price <= 0.0 {
            return Ok(None);
        }

        let return_7d = (last_price - first_price) / first_price * 100.0;
        let mean_price = rows.iter().map(|r| r.0).sum::<f64>() / rows.len() as f64;
        let volatility_7d = if mean_price > 0.0 {
            (rows.iter().map(|r| (r.0 - mean_price).powi(2)).sum::<f64>()
                / rows.len() as f64)
                .sqrt()
                / mean_price
                * 100.0
        } else {
            0.0
        };
        let fear_greed_avg = rows.iter().map(|r| r.2).sum::<f64>() / rows.len() as f64;

        Ok(Some(RegimeFeatures {
            return_7d,
            volatility_7d,
            volume_trend: 0.0,
            fear_greed_avg,
        }))
    }

    async fn feature_history(&self, days: i64) -> Result<Vec<RegimeFeatures>> {
        let rows = self.daily_btc_rows(days).await?;
        Ok(extract_features(&rows))
    }

    async fn btc_price_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<(f64, f64)>> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT btc_price FROM market_snapshots
                 WHERE timestamp >= ? AND btc_price IS NOT NULL
                 ORDER BY timestamp ASC LIMIT 1) AS start_price,
                (SELECT btc_price FROM market_snapshots
                 WHERE timestamp <= ? AND btc_price IS NOT NULL
                 ORDER BY timestamp DESC LIMIT 1) AS end_price
            "#,
        )
        .bind(to_ts(start))
        .bind(to_ts(end))
        .fetch_one(&self.pool)
        .await
        .context("Failed to load benchmark prices")?;

        let start_price: Option<f64> = row.try_get("start_price")?;
        let end_price: Option<f64> = row.try_get("end_price")?;
        Ok(start_price.zip(end_price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::database::Database;

    async fn seed_snapshot(
        pool: &SqlitePool,
        symbol: &str,
        price: f64,
        btc_price: f64,
        days_ago: i64,
    ) {
        let ts = to_ts(Utc::now() - chrono::Duration::days(days_ago));
        sqlx::query(
            r#"
            INSERT INTO market_snapshots (symbol, price, btc_price, volume_24h, fear_greed,
                                          rsi, sma_20, sma_50, volume, avg_volume, timestamp)
            VALUES (?, ?, ?, 1000, 55, 45.0, ?, ?, 10.0, 8.0, ?)
            "#,
        )
        .bind(symbol)
        .bind(price)
        .bind(btc_price)
        .bind(price * 0.99)
        .bind(price * 0.98)
        .bind(ts)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_latest_features() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteSnapshotRepository::new(db.pool.clone());

        seed_snapshot(&db.pool, "BTCUSDT", 49_000.0, 49_000.0, 1).await;
        seed_snapshot(&db.pool, "BTCUSDT", 50_000.0, 50_000.0, 0).await;

        let features = repo.latest_features("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(features.price, 50_000.0);
        assert_eq!(features.fear_greed, 55);
        assert!(features.sma_20 < features.price);

        assert!(repo.latest_features("DOGEUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_regime_window_and_benchmark() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteSnapshotRepository::new(db.pool.clone());

        for day in 0..8 {
            // Rising market: older snapshots are cheaper.
            let price = 50_000.0 - day as f64 * 500.0;
            seed_snapshot(&db.pool, "BTCUSDT", price, price, day).await;
        }

        let window = repo.regime_window().await.unwrap().unwrap();
        assert!(window.return_7d > 0.0);
        assert!((window.fear_greed_avg - 55.0).abs() < 1e-9);

        let range = repo
            .btc_price_range(Utc::now() - chrono::Duration::days(10), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert!(range.1 > range.0);
    }

    #[tokio::test]
    async fn test_feature_history_needs_eight_days() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteSnapshotRepository::new(db.pool.clone());

        for day in 0..5 {
            seed_snapshot(&db.pool, "BTCUSDT", 50_000.0, 50_000.0, day).await;
        }
        assert!(repo.feature_history(30).await.unwrap().is_empty());

        for day in 5..12 {
            seed_snapshot(&db.pool, "BTCUSDT", 48_000.0, 48_000.0, day).await;
        }
        let history = repo.feature_history(30).await.unwrap();
        assert!(!history.is_empty());
    }

    #[test]
    fn test_extract_features_shapes() {
        let rows: Vec<(f64, f64, f64)> = (0..15)
            .map(|i| (100.0 + i as f64, 10.0, 50.0))
            .collect();
        let features = extract_features(&rows);
        assert_eq!(features.len(), 15 - 7);
        for f in &features {
            assert!(f.return_7d > 0.0); // strictly rising series
            assert!((f.fear_greed_avg - 50.0).abs() < 1e-9);
        }
    }
}
