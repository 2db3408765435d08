use super::{from_ts, to_ts};
use crate::domain::cohort::{Cohort, CohortConfig};
use crate::domain::repositories::{CohortComparisonRow, CohortRepository};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

pub struct SqliteCohortRepository {
    pool: SqlitePool,
}

impl SqliteCohortRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_cohort(row: &sqlx::sqlite::SqliteRow) -> Result<Cohort> {
        let config_json: String = row.try_get("config")?;
        let starting: String = row.try_get("starting_capital")?;
        let current: String = row.try_get("current_capital")?;

        Ok(Cohort {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get::<Option<String>, _>("description")?.unwrap_or_default(),
            config: serde_json::from_str(&config_json).context("Malformed cohort config")?,
            starting_capital: Decimal::from_str(&starting)?,
            current_capital: Decimal::from_str(&current)?,
            is_active: row.try_get::<i64, _>("is_active")? != 0,
            created_at: from_ts(row.try_get("created_at")?),
        })
    }
}

#[async_trait]
impl CohortRepository for SqliteCohortRepository {
    async fn load_active(&self) -> Result<Vec<Cohort>> {
        let rows = sqlx::query("SELECT * FROM cohorts WHERE is_active = 1")
            .fetch_all(&self.pool)
            .await
            .context("Failed to load cohorts")?;

        rows.iter().map(Self::row_to_cohort).collect()
    }

    async fn insert(&self, cohort: &Cohort) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cohorts (id, name, description, config, starting_capital,
                                 current_capital, is_active, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&cohort.id)
        .bind(&cohort.name)
        .bind(&cohort.description)
        .bind(serde_json::to_string(&cohort.config)?)
        .bind(cohort.starting_capital.to_string())
        .bind(cohort.current_capital.to_string())
        .bind(cohort.is_active as i64)
        .bind(to_ts(cohort.created_at))
        .execute(&self.pool)
        .await
        .context("Failed to insert cohort")?;
        Ok(())
    }

    async fn update_capital(&self, name: &str, capital: Decimal) -> Result<()> {
        sqlx::query("UPDATE cohorts SET current_capital = ?, updated_at = ? WHERE name = ?")
            .bind(capital.to_string())
            .bind(to_ts(Utc::now()))
            .bind(name)
            .execute(&self.pool)
            .await
            .context("Failed to update cohort capital")?;
        Ok(())
    }

    async fn update_config(&self, name: &str, config: &CohortConfig) -> Result<()> {
        sqlx::query("UPDATE cohorts SET config = ?, updated_at = ? WHERE name = ?")
            .bind(serde_json::to_string(config)?)
            .bind(to_ts(Utc::now()))
            .bind(name)
            .execute(&self.pool)
            .await
            .context("Failed to update cohort config")?;
        Ok(())
    }

    async fn comparison_report(&self, limit: i64) -> Result<Vec<CohortComparisonRow>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM v_cohort_comparison
            ORDER BY cycle_number DESC, total_pnl_pct DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load cohort comparison")?;

        rows.iter()
            .map(|row| {
                Ok(CohortComparisonRow {
                    cohort_name: row.try_get("cohort_name")?,
                    cycle_number: row.try_get("cycle_number")?,
                    total_pnl_pct: row.try_get("total_pnl_pct")?,
                    sharpe_ratio: row.try_get("sharpe_ratio")?,
                    win_rate: row.try_get("win_rate")?,
                    trades_count: row.try_get("trades_count")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::trading::cohort_manager::default_cohorts;
    use crate::infrastructure::persistence::database::Database;

    #[tokio::test]
    async fn test_insert_and_load_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteCohortRepository::new(db.pool.clone());

        for cohort in default_cohorts() {
            repo.insert(&cohort).await.unwrap();
        }

        let loaded = repo.load_active().await.unwrap();
        assert_eq!(loaded.len(), 4);
        let baseline = loaded.iter().find(|c| c.name == "baseline").unwrap();
        assert!(baseline.config.frozen);
        assert_eq!(baseline.current_capital, Decimal::from(1000));
    }

    #[tokio::test]
    async fn test_update_capital_persists() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteCohortRepository::new(db.pool.clone());
        for cohort in default_cohorts() {
            repo.insert(&cohort).await.unwrap();
        }

        repo.update_capital("balanced", Decimal::from_str("1042.50").unwrap())
            .await
            .unwrap();

        let loaded = repo.load_active().await.unwrap();
        let balanced = loaded.iter().find(|c| c.name == "balanced").unwrap();
        assert_eq!(balanced.current_capital, Decimal::from_str("1042.50").unwrap());
    }
}
