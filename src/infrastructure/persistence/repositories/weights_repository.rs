use super::{from_ts, to_ts};
use crate::domain::regime::MarketRegime;
use crate::domain::repositories::WeightsRepository;
use crate::domain::weights::BayesianWeights;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

pub struct SqliteWeightsRepository {
    pool: SqlitePool,
}

impl SqliteWeightsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_weights(row: &sqlx::sqlite::SqliteRow) -> Result<BayesianWeights> {
        let weights_json: String = row.try_get("weights")?;
        let alphas_json: String = row.try_get("alpha_values")?;
        let regime: Option<String> = row.try_get("regime")?;

        Ok(BayesianWeights {
            weights: serde_json::from_str(&weights_json).context("Malformed weights payload")?,
            alpha_values: serde_json::from_str(&alphas_json).context("Malformed alpha payload")?,
            confidence: row.try_get("confidence")?,
            sample_size: row.try_get::<i64, _>("sample_size")? as usize,
            last_updated: from_ts(row.try_get("created_at")?),
            regime: regime.as_deref().map(MarketRegime::from_str).transpose()?,
        })
    }
}

#[async_trait]
impl WeightsRepository for SqliteWeightsRepository {
    /// Deactivate-then-insert inside one transaction, so exactly one row is
    /// active per `(cohort_id, regime)` key at any time.
    async fn store(&self, weights: &BayesianWeights, cohort_id: Option<&str>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let regime = weights.regime.map(|r| r.to_string());

        sqlx::query(
            "UPDATE signal_weights SET is_active = 0 WHERE cohort_id IS ? AND regime IS ?",
        )
        .bind(cohort_id)
        .bind(&regime)
        .execute(&mut *tx)
        .await
        .context("Failed to deactivate previous weights")?;

        sqlx::query(
            r#"
            INSERT INTO signal_weights (
                cohort_id, regime, weights, alpha_values,
                confidence, sample_size, is_active, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(cohort_id)
        .bind(&regime)
        .bind(serde_json::to_string(&weights.weights)?)
        .bind(serde_json::to_string(&weights.alpha_values)?)
        .bind(weights.confidence)
        .bind(weights.sample_size as i64)
        .bind(to_ts(weights.last_updated))
        .execute(&mut *tx)
        .await
        .context("Failed to insert weights")?;

        tx.commit().await.context("Failed to commit weight update")?;
        Ok(())
    }

    async fn load_active(
        &self,
        regime: Option<MarketRegime>,
        cohort_id: Option<&str>,
    ) -> Result<Option<BayesianWeights>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM signal_weights
            WHERE cohort_id IS ? AND regime IS ? AND is_active = 1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(cohort_id)
        .bind(regime.map(|r| r.to_string()))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load active weights")?;

        row.as_ref().map(Self::row_to_weights).transpose()
    }

    async fn history(
        &self,
        days: i64,
        regime: Option<MarketRegime>,
    ) -> Result<Vec<BayesianWeights>> {
        let cutoff = to_ts(Utc::now() - chrono::Duration::days(days));
        let rows = match regime {
            Some(regime) => {
                sqlx::query(
                    "SELECT * FROM signal_weights WHERE created_at >= ? AND regime = ? ORDER BY created_at",
                )
                .bind(cutoff)
                .bind(regime.to_string())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM signal_weights WHERE created_at >= ? ORDER BY created_at")
                    .bind(cutoff)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("Failed to load weight history")?;

        rows.iter().map(Self::row_to_weights).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::weights::{default_weights, prior_alphas};
    use crate::infrastructure::persistence::database::Database;

    fn sample(regime: Option<MarketRegime>, confidence: f64) -> BayesianWeights {
        BayesianWeights {
            weights: default_weights(),
            alpha_values: prior_alphas(),
            confidence,
            sample_size: 42,
            last_updated: Utc::now(),
            regime,
        }
    }

    #[tokio::test]
    async fn test_store_and_load_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteWeightsRepository::new(db.pool.clone());

        repo.store(&sample(None, 0.4), None).await.unwrap();
        let loaded = repo.load_active(None, None).await.unwrap().unwrap();
        assert_eq!(loaded.weights, default_weights());
        assert_eq!(loaded.sample_size, 42);
        assert_eq!(loaded.regime, None);
    }

    #[tokio::test]
    async fn test_store_deactivates_previous_row_per_key() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteWeightsRepository::new(db.pool.clone());

        repo.store(&sample(Some(MarketRegime::Bull), 0.3), None)
            .await
            .unwrap();
        repo.store(&sample(Some(MarketRegime::Bull), 0.9), None)
            .await
            .unwrap();
        // A different key stays active independently.
        repo.store(&sample(Some(MarketRegime::Bear), 0.5), None)
            .await
            .unwrap();

        let bull = repo
            .load_active(Some(MarketRegime::Bull), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bull.confidence, 0.9);

        let bear = repo
            .load_active(Some(MarketRegime::Bear), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bear.confidence, 0.5);

        // Only one active row per key.
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM signal_weights WHERE regime = 'BULL' AND is_active = 1",
        )
        .fetch_one(&db.pool)
        .await
        .unwrap();
        let n: i64 = row.try_get("n").unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn test_cohort_scoped_weights_are_separate() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteWeightsRepository::new(db.pool.clone());

        repo.store(&sample(None, 0.2), Some("cohort-a")).await.unwrap();
        repo.store(&sample(None, 0.8), None).await.unwrap();

        let global = repo.load_active(None, None).await.unwrap().unwrap();
        assert_eq!(global.confidence, 0.8);
        let scoped = repo.load_active(None, Some("cohort-a")).await.unwrap().unwrap();
        assert_eq!(scoped.confidence, 0.2);
    }
}
