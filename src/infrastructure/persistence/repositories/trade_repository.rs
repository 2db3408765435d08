use super::{from_ts, to_ts};
use crate::domain::regime::MarketRegime;
use crate::domain::repositories::{CycleTradeStats, TradePair, TradeRepository, TradeStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

pub struct SqliteTradeRepository {
    pool: SqlitePool,
}

impl SqliteTradeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_pair(row: &sqlx::sqlite::SqliteRow) -> Result<TradePair> {
        let entry: String = row.try_get("entry_price")?;
        let exit: Option<String> = row.try_get("exit_price")?;
        let quantity: String = row.try_get("quantity")?;
        let pnl_usd: Option<String> = row.try_get("pnl_usd")?;
        let status: String = row.try_get("status")?;
        let regime: Option<String> = row.try_get("regime")?;

        Ok(TradePair {
            id: row.try_get("id")?,
            cohort_id: row.try_get("cohort_id")?,
            cycle_id: row.try_get("cycle_id")?,
            symbol: row.try_get("symbol")?,
            entry_price: Decimal::from_str(&entry)?,
            exit_price: exit.as_deref().map(Decimal::from_str).transpose()?,
            quantity: Decimal::from_str(&quantity)?,
            pnl_usd: pnl_usd.as_deref().map(Decimal::from_str).transpose()?,
            pnl_pct: row.try_get("pnl_pct")?,
            status: match status.as_str() {
                "closed" => TradeStatus::Closed,
                _ => TradeStatus::Open,
            },
            regime: regime.as_deref().map(MarketRegime::from_str).transpose()?,
            fear_greed: row.try_get("fear_greed")?,
            created_at: from_ts(row.try_get("created_at")?),
            closed_at: row.try_get::<Option<i64>, _>("closed_at")?.map(from_ts),
        })
    }
}

#[async_trait]
impl TradeRepository for SqliteTradeRepository {
    async fn open_pair(&self, pair: &TradePair) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_pairs (
                id, cohort_id, cycle_id, symbol, entry_price, quantity,
                status, regime, fear_greed, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&pair.id)
        .bind(&pair.cohort_id)
        .bind(&pair.cycle_id)
        .bind(&pair.symbol)
        .bind(pair.entry_price.to_string())
        .bind(pair.quantity.to_string())
        .bind(pair.status.to_string())
        .bind(pair.regime.map(|r| r.to_string()))
        .bind(pair.fear_greed)
        .bind(to_ts(pair.created_at))
        .execute(&self.pool)
        .await
        .context("Failed to open trade pair")?;
        Ok(())
    }

    async fn close_pair(
        &self,
        cohort_id: &str,
        symbol: &str,
        exit_price: Decimal,
        closed_at: DateTime<Utc>,
    ) -> Result<Option<TradePair>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT * FROM trade_pairs
            WHERE cohort_id = ? AND symbol = ? AND status = 'open'
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(cohort_id)
        .bind(symbol)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to find open trade pair")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut pair = Self::row_to_pair(&row)?;

        let pnl_usd = (exit_price - pair.entry_price) * pair.quantity;
        let entry = pair.entry_price.to_f64().unwrap_or(0.0);
        let pnl_pct = if entry > 0.0 {
            (exit_price.to_f64().unwrap_or(0.0) - entry) / entry * 100.0
        } else {
            0.0
        };

        sqlx::query(
            r#"
            UPDATE trade_pairs SET
                status = 'closed', exit_price = ?, pnl_usd = ?, pnl_pct = ?, closed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(exit_price.to_string())
        .bind(pnl_usd.to_string())
        .bind(pnl_pct)
        .bind(to_ts(closed_at))
        .bind(&pair.id)
        .execute(&mut *tx)
        .await
        .context("Failed to close trade pair")?;

        tx.commit().await?;

        pair.status = TradeStatus::Closed;
        pair.exit_price = Some(exit_price);
        pair.pnl_usd = Some(pnl_usd);
        pair.pnl_pct = Some(pnl_pct);
        pair.closed_at = Some(closed_at);
        Ok(Some(pair))
    }

    async fn symbol_returns(&self, symbol: &str, lookback_days: i64) -> Result<Vec<f64>> {
        let cutoff = to_ts(Utc::now() - chrono::Duration::days(lookback_days));
        let rows = sqlx::query(
            r#"
            SELECT pnl_pct FROM trade_pairs
            WHERE symbol = ? AND status = 'closed' AND created_at >= ?
            ORDER BY created_at
            "#,
        )
        .bind(symbol)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load symbol returns")?;

        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<Option<f64>, _>("pnl_pct").ok().flatten())
            .map(|pct| pct / 100.0)
            .collect())
    }

    async fn daily_returns(&self, cycle_id: &str) -> Result<Vec<f64>> {
        let rows = sqlx::query(
            r#"
            SELECT DATE(closed_at, 'unixepoch') AS day, SUM(pnl_pct) AS daily_pct
            FROM trade_pairs
            WHERE cycle_id = ? AND status = 'closed' AND pnl_pct IS NOT NULL
            GROUP BY DATE(closed_at, 'unixepoch')
            ORDER BY day
            "#,
        )
        .bind(cycle_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load daily returns")?;

        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<Option<f64>, _>("daily_pct").ok().flatten())
            .map(|pct| pct / 100.0)
            .collect())
    }

    async fn cycle_stats(&self, cycle_id: &str) -> Result<CycleTradeStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS trades_count,
                SUM(CASE WHEN status = 'closed' AND pnl_pct > 0 THEN 1 ELSE 0 END) AS winning,
                SUM(CASE WHEN status = 'closed' AND pnl_pct < 0 THEN 1 ELSE 0 END) AS losing,
                AVG(fear_greed) AS avg_fear_greed
            FROM trade_pairs
            WHERE cycle_id = ?
            "#,
        )
        .bind(cycle_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to load cycle trade stats")?;

        Ok(CycleTradeStats {
            trades_count: row.try_get("trades_count")?,
            winning_trades: row.try_get::<Option<i64>, _>("winning")?.unwrap_or(0),
            losing_trades: row.try_get::<Option<i64>, _>("losing")?.unwrap_or(0),
            avg_fear_greed: row.try_get("avg_fear_greed")?,
        })
    }

    async fn cycle_regimes(&self, cycle_id: &str) -> Result<Vec<MarketRegime>> {
        let rows = sqlx::query(
            "SELECT regime FROM trade_pairs WHERE cycle_id = ? AND regime IS NOT NULL",
        )
        .bind(cycle_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load cycle regimes")?;

        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>("regime").ok())
            .filter_map(|s| MarketRegime::from_str(&s).ok())
            .collect())
    }

    async fn cycle_symbol_pnls(&self, cycle_id: &str) -> Result<Vec<(String, f64)>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, SUM(pnl_pct) AS total_pnl
            FROM trade_pairs
            WHERE cycle_id = ? AND status = 'closed' AND pnl_pct IS NOT NULL
            GROUP BY symbol
            "#,
        )
        .bind(cycle_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load per-symbol pnl")?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let symbol: String = row.try_get("symbol").ok()?;
                let pnl: Option<f64> = row.try_get("total_pnl").ok()?;
                Some((symbol, pnl?))
            })
            .collect())
    }

    async fn net_flow(&self, cycle_id: &str) -> Result<Decimal> {
        let rows = sqlx::query(
            "SELECT pnl_usd FROM trade_pairs WHERE cycle_id = ? AND pnl_usd IS NOT NULL",
        )
        .bind(cycle_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to compute net flow")?;

        let mut total = Decimal::ZERO;
        for row in rows {
            let value: String = row.try_get("pnl_usd")?;
            total += Decimal::from_str(&value)?;
        }
        Ok(total)
    }

    async fn trades_last_hours(&self, hours: i64) -> Result<i64> {
        let cutoff = to_ts(Utc::now() - chrono::Duration::hours(hours));
        let row = sqlx::query("SELECT COUNT(*) AS n FROM trade_pairs WHERE created_at >= ?")
            .bind(cutoff)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count recent trades")?;
        Ok(row.try_get("n")?)
    }
}
