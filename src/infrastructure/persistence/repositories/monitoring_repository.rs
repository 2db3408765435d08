use super::{from_ts, to_ts};
use crate::domain::repositories::{MonitoringRepository, TierRow};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

pub struct SqliteMonitoringRepository {
    pool: SqlitePool,
}

impl SqliteMonitoringRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MonitoringRepository for SqliteMonitoringRepository {
    async fn last_discovery(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MAX(discovered_at) AS last_run FROM coin_discoveries")
            .fetch_one(&self.pool)
            .await
            .context("Failed to read last discovery")?;
        Ok(row.try_get::<Option<i64>, _>("last_run")?.map(from_ts))
    }

    async fn approval_stats(&self, days: i64) -> Result<(i64, i64)> {
        let cutoff = to_ts(Utc::now() - chrono::Duration::days(days));
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   SUM(CASE WHEN ai_approved THEN 1 ELSE 0 END) AS approved
            FROM coin_discoveries
            WHERE discovered_at >= ?
            "#,
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .context("Failed to read approval stats")?;

        Ok((
            row.try_get("total")?,
            row.try_get::<Option<i64>, _>("approved")?.unwrap_or(0),
        ))
    }

    async fn idle_added_coins(&self, added_before: DateTime<Utc>) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT d.symbol FROM coin_discoveries d
            JOIN watchlist w ON d.symbol = w.symbol
            WHERE d.was_added = 1
              AND d.was_deactivated = 0
              AND d.discovered_at < ?
              AND w.total_trades = 0
            "#,
        )
        .bind(to_ts(added_before))
        .fetch_all(&self.pool)
        .await
        .context("Failed to find idle coins")?;

        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>("symbol").ok())
            .collect())
    }

    async fn tier_rows(&self) -> Result<Vec<TierRow>> {
        let rows = sqlx::query(
            "SELECT tier_name, target_pct, current_pct, current_value_usd FROM portfolio_tiers WHERE is_active = 1",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load portfolio tiers")?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(TierRow {
                    tier_name: row.try_get("tier_name").ok()?,
                    target_pct: row.try_get("target_pct").ok()?,
                    current_pct: row
                        .try_get::<Option<f64>, _>("current_pct")
                        .ok()?
                        .unwrap_or(0.0),
                    current_value_usd: row
                        .try_get::<Option<f64>, _>("current_value_usd")
                        .ok()?
                        .unwrap_or(0.0),
                })
            })
            .collect())
    }
}
