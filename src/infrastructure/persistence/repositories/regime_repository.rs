use super::to_ts;
use crate::domain::regime::{MarketRegime, RegimeFeatures, RegimeState};
use crate::domain::repositories::RegimeRepository;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

pub struct SqliteRegimeRepository {
    pool: SqlitePool,
}

impl SqliteRegimeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RegimeRepository for SqliteRegimeRepository {
    async fn store(&self, state: &RegimeState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO regime_history (
                regime, regime_probability, transition_probability,
                return_7d, volatility_7d, volume_trend, fear_greed_avg,
                model_confidence, previous_regime, regime_duration_hours, timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(state.current_regime.to_string())
        .bind(state.regime_probability)
        .bind(state.transition_probability)
        .bind(state.features.return_7d)
        .bind(state.features.volatility_7d)
        .bind(state.features.volume_trend)
        .bind(state.features.fear_greed_avg)
        .bind(state.model_confidence)
        .bind(state.previous_regime.map(|r| r.to_string()))
        .bind(state.regime_duration_days * 24)
        .bind(to_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .context("Failed to store regime state")?;
        Ok(())
    }

    async fn history(&self, days: i64) -> Result<Vec<RegimeState>> {
        let cutoff = to_ts(Utc::now() - chrono::Duration::days(days));
        let rows = sqlx::query(
            "SELECT * FROM regime_history WHERE timestamp >= ? ORDER BY timestamp DESC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load regime history")?;

        rows.iter()
            .map(|row| {
                let regime: String = row.try_get("regime")?;
                let previous: Option<String> = row.try_get("previous_regime")?;
                let duration_hours: i64 = row.try_get("regime_duration_hours")?;

                Ok(RegimeState {
                    current_regime: MarketRegime::from_str(&regime)?,
                    regime_probability: row.try_get("regime_probability")?,
                    transition_probability: row.try_get("transition_probability")?,
                    regime_duration_days: duration_hours / 24,
                    previous_regime: previous.as_deref().map(MarketRegime::from_str).transpose()?,
                    features: RegimeFeatures {
                        return_7d: row.try_get("return_7d")?,
                        volatility_7d: row.try_get("volatility_7d")?,
                        volume_trend: row.try_get("volume_trend")?,
                        fear_greed_avg: row.try_get("fear_greed_avg")?,
                    },
                    model_confidence: row.try_get("model_confidence")?,
                })
            })
            .collect()
    }
}
