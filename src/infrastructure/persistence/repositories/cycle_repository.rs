use super::{from_ts, to_ts};
use crate::domain::cycle::{CycleMetrics, CycleStatus, TradingCycle};
use crate::domain::regime::MarketRegime;
use crate::domain::repositories::CycleRepository;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

pub struct SqliteCycleRepository {
    pool: SqlitePool,
}

impl SqliteCycleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_cycle(row: &sqlx::sqlite::SqliteRow) -> Result<TradingCycle> {
        let status: String = row.try_get("status")?;
        let starting: String = row.try_get("starting_capital")?;
        let ending: Option<String> = row.try_get("ending_capital")?;
        let total_pnl: Option<String> = row.try_get("total_pnl")?;
        let dominant: Option<String> = row.try_get("dominant_regime")?;

        Ok(TradingCycle {
            id: row.try_get("id")?,
            cohort_id: row.try_get("cohort_id")?,
            cohort_name: row
                .try_get::<Option<String>, _>("cohort_name")
                .unwrap_or(None)
                .unwrap_or_default(),
            cycle_number: row.try_get("cycle_number")?,
            start_date: from_ts(row.try_get("start_date")?),
            end_date: row.try_get::<Option<i64>, _>("end_date")?.map(from_ts),
            status: CycleStatus::from_str(&status)?,
            starting_capital: Decimal::from_str(&starting)?,
            ending_capital: ending.as_deref().map(Decimal::from_str).transpose()?,
            trades_count: row.try_get("trades_count")?,
            winning_trades: row.try_get("winning_trades")?,
            losing_trades: row.try_get("losing_trades")?,
            total_pnl: total_pnl.as_deref().map(Decimal::from_str).transpose()?,
            total_pnl_pct: row.try_get("total_pnl_pct")?,
            max_drawdown: row.try_get("max_drawdown")?,
            sharpe_ratio: row.try_get("sharpe_ratio")?,
            sortino_ratio: row.try_get("sortino_ratio")?,
            calmar_ratio: row.try_get("calmar_ratio")?,
            kelly_fraction: row.try_get("kelly_fraction")?,
            var_95: row.try_get("var_95")?,
            cvar_95: row.try_get("cvar_95")?,
            avg_fear_greed: row.try_get("avg_fear_greed")?,
            dominant_regime: dominant.as_deref().map(MarketRegime::from_str).transpose()?,
            btc_performance_pct: row.try_get("btc_performance_pct")?,
            playbook_version_at_start: row.try_get("playbook_version_at_start")?,
            playbook_version_at_end: row.try_get("playbook_version_at_end")?,
        })
    }
}

#[async_trait]
impl CycleRepository for SqliteCycleRepository {
    async fn active_cycles(&self) -> Result<Vec<TradingCycle>> {
        let rows = sqlx::query(
            r#"
            SELECT tc.*, c.name AS cohort_name
            FROM trading_cycles tc
            LEFT JOIN cohorts c ON tc.cohort_id = c.id
            WHERE tc.status = 'active'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load active cycles")?;

        rows.iter().map(Self::row_to_cycle).collect()
    }

    async fn next_cycle_number(&self, cohort_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(cycle_number), 0) + 1 AS next FROM trading_cycles WHERE cohort_id = ?",
        )
        .bind(cohort_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to determine next cycle number")?;
        Ok(row.try_get("next")?)
    }

    async fn insert(&self, cycle: &TradingCycle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trading_cycles (
                id, cohort_id, cycle_number, start_date, status,
                starting_capital, playbook_version_at_start
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&cycle.id)
        .bind(&cycle.cohort_id)
        .bind(cycle.cycle_number)
        .bind(to_ts(cycle.start_date))
        .bind(cycle.status.to_string())
        .bind(cycle.starting_capital.to_string())
        .bind(cycle.playbook_version_at_start)
        .execute(&self.pool)
        .await
        .context("Failed to insert trading cycle")?;
        Ok(())
    }

    async fn close(
        &self,
        cycle_id: &str,
        end_date: DateTime<Utc>,
        metrics: &CycleMetrics,
        playbook_version: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trading_cycles SET
                end_date = ?,
                closed_at = ?,
                status = 'completed',
                ending_capital = ?,
                trades_count = ?,
                winning_trades = ?,
                losing_trades = ?,
                total_pnl = ?,
                total_pnl_pct = ?,
                max_drawdown = ?,
                sharpe_ratio = ?,
                sortino_ratio = ?,
                calmar_ratio = ?,
                kelly_fraction = ?,
                var_95 = ?,
                cvar_95 = ?,
                avg_fear_greed = ?,
                dominant_regime = ?,
                btc_performance_pct = ?,
                signal_performance = ?,
                best_patterns = ?,
                worst_patterns = ?,
                playbook_version_at_end = ?
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(to_ts(end_date))
        .bind(to_ts(end_date))
        .bind(metrics.ending_capital.to_string())
        .bind(metrics.trades_count)
        .bind(metrics.winning_trades)
        .bind(metrics.losing_trades)
        .bind(metrics.total_pnl.to_string())
        .bind(metrics.total_pnl_pct)
        .bind(metrics.max_drawdown)
        .bind(metrics.sharpe_ratio)
        .bind(metrics.sortino_ratio)
        .bind(metrics.calmar_ratio)
        .bind(metrics.kelly_fraction)
        .bind(metrics.var_95)
        .bind(metrics.cvar_95)
        .bind(metrics.avg_fear_greed)
        .bind(metrics.dominant_regime.map(|r| r.to_string()))
        .bind(metrics.btc_performance_pct)
        .bind(
            metrics
                .signal_performance
                .as_ref()
                .map(|v| v.to_string()),
        )
        .bind(metrics.best_patterns.as_ref().map(|v| v.to_string()))
        .bind(metrics.worst_patterns.as_ref().map(|v| v.to_string()))
        .bind(playbook_version)
        .bind(cycle_id)
        .execute(&self.pool)
        .await
        .context("Failed to close trading cycle")?;
        Ok(())
    }

    async fn cancel(&self, cycle_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE trading_cycles SET status = 'cancelled', end_date = ? WHERE id = ? AND status = 'active'",
        )
        .bind(to_ts(Utc::now()))
        .bind(cycle_id)
        .execute(&self.pool)
        .await
        .context("Failed to cancel trading cycle")?;
        Ok(())
    }

    async fn completed(&self, cohort_id: &str, limit: i64) -> Result<Vec<TradingCycle>> {
        let rows = sqlx::query(
            r#"
            SELECT tc.*, c.name AS cohort_name
            FROM trading_cycles tc
            LEFT JOIN cohorts c ON tc.cohort_id = c.id
            WHERE tc.cohort_id = ? AND tc.status = 'completed'
            ORDER BY tc.cycle_number DESC
            LIMIT ?
            "#,
        )
        .bind(cohort_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load completed cycles")?;

        rows.iter().map(Self::row_to_cycle).collect()
    }

    async fn current_playbook_version(&self) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT MAX(version) AS version FROM playbook_versions")
            .fetch_one(&self.pool)
            .await
            .context("Failed to read playbook version")?;
        Ok(row.try_get("version")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::database::Database;
    use rust_decimal_macros::dec;

    fn fresh_cycle(cohort_id: &str, number: i64) -> TradingCycle {
        TradingCycle {
            id: uuid::Uuid::new_v4().to_string(),
            cohort_id: cohort_id.to_string(),
            cohort_name: String::new(),
            cycle_number: number,
            start_date: Utc::now(),
            end_date: None,
            status: CycleStatus::Active,
            starting_capital: dec!(1000),
            ending_capital: None,
            trades_count: 0,
            winning_trades: 0,
            losing_trades: 0,
            total_pnl: None,
            total_pnl_pct: None,
            max_drawdown: None,
            sharpe_ratio: None,
            sortino_ratio: None,
            calmar_ratio: None,
            kelly_fraction: None,
            var_95: None,
            cvar_95: None,
            avg_fear_greed: None,
            dominant_regime: None,
            btc_performance_pct: None,
            playbook_version_at_start: None,
            playbook_version_at_end: None,
        }
    }

    #[tokio::test]
    async fn test_cycle_numbers_are_dense() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteCycleRepository::new(db.pool.clone());

        assert_eq!(repo.next_cycle_number("c1").await.unwrap(), 1);
        repo.insert(&fresh_cycle("c1", 1)).await.unwrap();
        assert_eq!(repo.next_cycle_number("c1").await.unwrap(), 2);
        // Other cohorts number independently.
        assert_eq!(repo.next_cycle_number("c2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_close_writes_metrics_and_completes() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteCycleRepository::new(db.pool.clone());

        let cycle = fresh_cycle("c1", 1);
        repo.insert(&cycle).await.unwrap();
        assert_eq!(repo.active_cycles().await.unwrap().len(), 1);

        let metrics = CycleMetrics {
            ending_capital: dec!(1040),
            trades_count: 7,
            winning_trades: 5,
            losing_trades: 2,
            total_pnl: dec!(40),
            total_pnl_pct: 4.0,
            max_drawdown: Some(-0.03),
            sharpe_ratio: Some(1.8),
            dominant_regime: Some(MarketRegime::Bull),
            ..CycleMetrics::default()
        };
        repo.close(&cycle.id, Utc::now(), &metrics, Some(3))
            .await
            .unwrap();

        assert!(repo.active_cycles().await.unwrap().is_empty());
        let completed = repo.completed("c1", 10).await.unwrap();
        assert_eq!(completed.len(), 1);
        let closed = &completed[0];
        assert_eq!(closed.status, CycleStatus::Completed);
        assert_eq!(closed.ending_capital, Some(dec!(1040)));
        assert_eq!(closed.total_pnl, Some(dec!(40)));
        // Invariant: ending - starting = total pnl.
        assert_eq!(
            closed.ending_capital.unwrap() - closed.starting_capital,
            closed.total_pnl.unwrap()
        );
        assert_eq!(closed.dominant_regime, Some(MarketRegime::Bull));
        assert_eq!(closed.playbook_version_at_end, Some(3));
    }

    #[tokio::test]
    async fn test_completed_rows_are_immutable_via_close() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteCycleRepository::new(db.pool.clone());

        let cycle = fresh_cycle("c1", 1);
        repo.insert(&cycle).await.unwrap();
        repo.close(&cycle.id, Utc::now(), &CycleMetrics::default(), None)
            .await
            .unwrap();

        // A second close targets status='active' and changes nothing.
        let metrics = CycleMetrics {
            ending_capital: dec!(9999),
            ..CycleMetrics::default()
        };
        repo.close(&cycle.id, Utc::now(), &metrics, None).await.unwrap();

        let completed = repo.completed("c1", 10).await.unwrap();
        assert_eq!(completed[0].ending_capital, Some(dec!(0)));
    }
}
