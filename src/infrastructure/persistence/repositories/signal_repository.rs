use super::to_ts;
use crate::domain::metrics::{PositionSizeResult, RiskMetrics};
use crate::domain::regime::MarketRegime;
use crate::domain::repositories::{SignalObservation, SignalRepository, SnapshotContext};
use crate::domain::signals::SignalBreakdown;
use crate::domain::weights::SIGNAL_NAMES;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

pub struct SqliteSignalRepository {
    pool: SqlitePool,
}

impl SqliteSignalRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SignalRepository for SqliteSignalRepository {
    async fn store_breakdown(
        &self,
        trade_id: &str,
        cycle_id: Option<&str>,
        cohort_id: Option<&str>,
        breakdown: &SignalBreakdown,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO signal_components (
                trade_id, cycle_id, cohort_id,
                fear_greed_signal, rsi_signal, macd_signal, trend_signal,
                volume_signal, whale_signal, sentiment_signal, macro_signal,
                ai_direction_signal, ai_confidence, ai_risk_level,
                playbook_alignment_score, weights_applied,
                math_composite_score, ai_composite_score, final_score,
                has_divergence, divergence_type, divergence_strength,
                created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(trade_id)
        .bind(cycle_id)
        .bind(cohort_id)
        .bind(breakdown.fear_greed_signal)
        .bind(breakdown.rsi_signal)
        .bind(breakdown.macd_signal)
        .bind(breakdown.trend_signal)
        .bind(breakdown.volume_signal)
        .bind(breakdown.whale_signal)
        .bind(breakdown.sentiment_signal)
        .bind(breakdown.macro_signal)
        .bind(breakdown.ai_direction_signal)
        .bind(breakdown.ai_confidence)
        .bind(breakdown.ai_risk_level.to_string())
        .bind(breakdown.playbook_alignment)
        .bind(serde_json::to_string(&breakdown.weights_applied)?)
        .bind(breakdown.math_composite)
        .bind(breakdown.ai_composite)
        .bind(breakdown.final_score)
        .bind(breakdown.divergence.is_some() as i64)
        .bind(breakdown.divergence.map(|d| d.kind.to_string()))
        .bind(breakdown.divergence.map(|d| d.strength))
        .bind(to_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .context("Failed to store signal breakdown")?;
        Ok(())
    }

    async fn update_outcome(&self, trade_id: &str, was_correct: bool) -> Result<()> {
        sqlx::query("UPDATE signal_components SET was_correct = ? WHERE trade_id = ?")
            .bind(was_correct as i64)
            .bind(trade_id)
            .execute(&self.pool)
            .await
            .context("Failed to update signal outcome")?;
        Ok(())
    }

    async fn observations(
        &self,
        cohort_id: Option<&str>,
        lookback_days: i64,
        regime: Option<MarketRegime>,
    ) -> Result<Vec<SignalObservation>> {
        let cutoff = to_ts(Utc::now() - chrono::Duration::days(lookback_days));

        let mut sql = String::from(
            r#"
            SELECT sc.*, tp.pnl_pct AS trade_pnl_pct
            FROM signal_components sc
            JOIN trade_pairs tp ON sc.trade_id = tp.id
            WHERE sc.created_at >= ? AND tp.status = 'closed'
            "#,
        );
        if cohort_id.is_some() {
            sql.push_str(" AND sc.cohort_id = ?");
        }
        if regime.is_some() {
            sql.push_str(" AND tp.regime = ?");
        }

        let mut query = sqlx::query(&sql).bind(cutoff);
        if let Some(cohort_id) = cohort_id {
            query = query.bind(cohort_id);
        }
        if let Some(regime) = regime {
            query = query.bind(regime.to_string());
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("Failed to load signal observations")?;

        rows.iter()
            .map(|row| {
                let mut signals = BTreeMap::new();
                for name in SIGNAL_NAMES {
                    let column = if name == "ai" {
                        "ai_direction_signal".to_string()
                    } else {
                        format!("{}_signal", name)
                    };
                    if let Ok(Some(value)) = row.try_get::<Option<f64>, _>(column.as_str()) {
                        signals.insert(name.to_string(), value);
                    }
                }
                Ok(SignalObservation {
                    signals,
                    pnl_pct: row
                        .try_get::<Option<f64>, _>("trade_pnl_pct")?
                        .unwrap_or(0.0),
                })
            })
            .collect()
    }

    async fn cycle_signal_accuracy(&self, cycle_id: &str) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query(
            r#"
            SELECT
                AVG(CASE WHEN fear_greed_signal > 0.3 AND was_correct THEN 1.0
                         WHEN fear_greed_signal > 0.3 THEN 0.0 END) AS fear_greed_accuracy,
                AVG(CASE WHEN rsi_signal > 0.3 AND was_correct THEN 1.0
                         WHEN rsi_signal > 0.3 THEN 0.0 END) AS rsi_accuracy,
                AVG(CASE WHEN macd_signal > 0.3 AND was_correct THEN 1.0
                         WHEN macd_signal > 0.3 THEN 0.0 END) AS macd_accuracy,
                AVG(CASE WHEN trend_signal > 0.3 AND was_correct THEN 1.0
                         WHEN trend_signal > 0.3 THEN 0.0 END) AS trend_accuracy,
                AVG(CASE WHEN ai_direction_signal > 0.3 AND was_correct THEN 1.0
                         WHEN ai_direction_signal > 0.3 THEN 0.0 END) AS ai_accuracy,
                COUNT(*) AS total_signals,
                SUM(CASE WHEN was_correct THEN 1 ELSE 0 END) AS correct_signals
            FROM signal_components
            WHERE cycle_id = ? AND was_correct IS NOT NULL
            "#,
        )
        .bind(cycle_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute cycle signal accuracy")?;

        let total: i64 = row.try_get("total_signals")?;
        if total == 0 {
            return Ok(None);
        }

        Ok(Some(serde_json::json!({
            "fear_greed_accuracy": row.try_get::<Option<f64>, _>("fear_greed_accuracy")?,
            "rsi_accuracy": row.try_get::<Option<f64>, _>("rsi_accuracy")?,
            "macd_accuracy": row.try_get::<Option<f64>, _>("macd_accuracy")?,
            "trend_accuracy": row.try_get::<Option<f64>, _>("trend_accuracy")?,
            "ai_accuracy": row.try_get::<Option<f64>, _>("ai_accuracy")?,
            "total_signals": total,
            "correct_signals": row.try_get::<Option<i64>, _>("correct_signals")?,
        })))
    }

    async fn store_snapshot(&self, metrics: &RiskMetrics, ctx: &SnapshotContext) -> Result<()> {
        let exposure_pct = match (ctx.portfolio_value, ctx.cash_position) {
            (Some(portfolio), Some(cash)) if portfolio > 0.0 => {
                Some((portfolio - cash) / portfolio * 100.0)
            }
            _ => None,
        };

        sqlx::query(
            r#"
            INSERT INTO calculation_snapshots (
                cycle_id, cohort_id, trade_id,
                kelly_fraction, half_kelly, optimal_position_size,
                current_sharpe, current_sortino, current_calmar,
                volatility_daily, volatility_weekly,
                current_drawdown, max_drawdown,
                var_95, var_99, cvar_95, cvar_99,
                portfolio_value, cash_position, exposure_pct,
                btc_price, fear_greed, current_regime,
                win_rate, profit_factor, avg_win, avg_loss,
                consecutive_wins, consecutive_losses,
                timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&ctx.cycle_id)
        .bind(&ctx.cohort_id)
        .bind(&ctx.trade_id)
        .bind(metrics.kelly_fraction)
        .bind(metrics.half_kelly)
        .bind(metrics.optimal_position_size)
        .bind(metrics.sharpe_ratio)
        .bind(metrics.sortino_ratio)
        .bind(metrics.calmar_ratio)
        .bind(metrics.volatility_daily)
        .bind(metrics.volatility_weekly)
        .bind(metrics.current_drawdown)
        .bind(metrics.max_drawdown)
        .bind(metrics.var_95)
        .bind(metrics.var_99)
        .bind(metrics.cvar_95)
        .bind(metrics.cvar_99)
        .bind(ctx.portfolio_value)
        .bind(ctx.cash_position)
        .bind(exposure_pct)
        .bind(ctx.btc_price)
        .bind(ctx.fear_greed)
        .bind(ctx.current_regime.map(|r| r.to_string()))
        .bind(metrics.win_rate)
        .bind(metrics.profit_factor.filter(|p| p.is_finite()))
        .bind(metrics.avg_win)
        .bind(metrics.avg_loss)
        .bind(metrics.consecutive_wins as i64)
        .bind(metrics.consecutive_losses as i64)
        .bind(to_ts(metrics.timestamp))
        .execute(&self.pool)
        .await
        .context("Failed to store calculation snapshot")?;
        Ok(())
    }

    async fn store_sizing_decision(
        &self,
        symbol: &str,
        cycle_id: Option<&str>,
        result: &PositionSizeResult,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO position_sizing_log (
                symbol, cycle_id, recommended_size, max_position,
                risk_adjusted_size, kelly_size, sizing_method,
                risk_budget_used, confidence_multiplier,
                expected_max_loss, cvar_used, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(symbol)
        .bind(cycle_id)
        .bind(result.recommended_size)
        .bind(result.max_position)
        .bind(result.risk_adjusted_size)
        .bind(result.kelly_size)
        .bind(&result.sizing_method)
        .bind(result.risk_budget_used)
        .bind(result.confidence_multiplier)
        .bind(result.expected_max_loss)
        .bind(result.cvar_used)
        .bind(to_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .context("Failed to store sizing decision")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::analysis::signals::SignalAnalyzer;
    use crate::domain::repositories::{TradePair, TradeRepository, TradeStatus};
    use crate::domain::signals::{AiAssessment, MarketFeatures};
    use crate::domain::weights::default_weights;
    use crate::infrastructure::persistence::database::Database;
    use crate::infrastructure::persistence::repositories::trade_repository::SqliteTradeRepository;
    use rust_decimal_macros::dec;

    fn breakdown() -> SignalBreakdown {
        SignalAnalyzer::new().analyze(
            &MarketFeatures::neutral("BTCUSDT", 50_000.0),
            &AiAssessment::neutral(),
            &default_weights(),
        )
    }

    async fn seed_closed_trade(
        trade_repo: &SqliteTradeRepository,
        id: &str,
        pnl_positive: bool,
    ) {
        let pair = TradePair {
            id: id.to_string(),
            cohort_id: Some("c1".to_string()),
            cycle_id: Some("cycle1".to_string()),
            symbol: "BTCUSDT".to_string(),
            entry_price: dec!(100),
            exit_price: None,
            quantity: dec!(1),
            pnl_usd: None,
            pnl_pct: None,
            status: TradeStatus::Open,
            regime: Some(MarketRegime::Bull),
            fear_greed: Some(50),
            created_at: Utc::now(),
            closed_at: None,
        };
        trade_repo.open_pair(&pair).await.unwrap();
        let exit = if pnl_positive { dec!(110) } else { dec!(90) };
        trade_repo
            .close_pair("c1", "BTCUSDT", exit, Utc::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_breakdown_store_and_observations_join() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteSignalRepository::new(db.pool.clone());
        let trade_repo = SqliteTradeRepository::new(db.pool.clone());

        seed_closed_trade(&trade_repo, "t1", true).await;
        repo.store_breakdown("t1", Some("cycle1"), Some("c1"), &breakdown())
            .await
            .unwrap();

        let observations = repo.observations(None, 30, None).await.unwrap();
        assert_eq!(observations.len(), 1);
        assert!(observations[0].pnl_pct > 0.0);
        assert_eq!(observations[0].signals.len(), SIGNAL_NAMES.len());

        // Scoped queries filter correctly.
        assert_eq!(repo.observations(Some("c1"), 30, None).await.unwrap().len(), 1);
        assert_eq!(repo.observations(Some("cX"), 30, None).await.unwrap().len(), 0);
        assert_eq!(
            repo.observations(None, 30, Some(MarketRegime::Bull))
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            repo.observations(None, 30, Some(MarketRegime::Bear))
                .await
                .unwrap()
                .len(),
            0
        );
    }

    #[tokio::test]
    async fn test_outcome_feeds_cycle_accuracy() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteSignalRepository::new(db.pool.clone());
        let trade_repo = SqliteTradeRepository::new(db.pool.clone());

        for (id, good) in [("t1", true), ("t2", false)] {
            seed_closed_trade(&trade_repo, id, good).await;
            repo.store_breakdown(id, Some("cycle1"), Some("c1"), &breakdown())
                .await
                .unwrap();
            repo.update_outcome(id, good).await.unwrap();
        }

        let accuracy = repo.cycle_signal_accuracy("cycle1").await.unwrap().unwrap();
        assert_eq!(accuracy["total_signals"], 2);
        assert_eq!(accuracy["correct_signals"], 1);

        assert!(repo
            .cycle_signal_accuracy("does-not-exist")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_snapshot_persists_without_loss() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteSignalRepository::new(db.pool.clone());

        let metrics = crate::application::analysis::metrics::calculate_all_metrics(&[
            0.01, 0.02, -0.03, 0.015, -0.005, 0.02, 0.01,
        ]);
        let ctx = SnapshotContext {
            cohort_id: Some("c1".to_string()),
            portfolio_value: Some(10_000.0),
            cash_position: Some(4_000.0),
            current_regime: Some(MarketRegime::Sideways),
            ..SnapshotContext::default()
        };
        repo.store_snapshot(&metrics, &ctx).await.unwrap();

        let row = sqlx::query("SELECT COUNT(*) AS n, MAX(exposure_pct) AS exposure FROM calculation_snapshots")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        let n: i64 = row.try_get("n").unwrap();
        let exposure: Option<f64> = row.try_get("exposure").unwrap();
        assert_eq!(n, 1);
        assert!((exposure.unwrap() - 60.0).abs() < 1e-9);
    }
}
