use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Connection pool plus schema bootstrap.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the parent directory exists for file-backed databases.
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent() {
                if !parent.exists() && !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)
                        .await
                        .context("Failed to create database directory")?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cohorts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                config TEXT NOT NULL,
                starting_capital TEXT NOT NULL,
                current_capital TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create cohorts table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trading_cycles (
                id TEXT PRIMARY KEY,
                cohort_id TEXT NOT NULL,
                cycle_number INTEGER NOT NULL,
                start_date INTEGER NOT NULL,
                end_date INTEGER,
                status TEXT NOT NULL,
                starting_capital TEXT NOT NULL,
                ending_capital TEXT,
                trades_count INTEGER NOT NULL DEFAULT 0,
                winning_trades INTEGER NOT NULL DEFAULT 0,
                losing_trades INTEGER NOT NULL DEFAULT 0,
                total_pnl TEXT,
                total_pnl_pct REAL,
                max_drawdown REAL,
                sharpe_ratio REAL,
                sortino_ratio REAL,
                calmar_ratio REAL,
                kelly_fraction REAL,
                var_95 REAL,
                cvar_95 REAL,
                avg_fear_greed REAL,
                dominant_regime TEXT,
                btc_performance_pct REAL,
                signal_performance TEXT,
                best_patterns TEXT,
                worst_patterns TEXT,
                playbook_version_at_start INTEGER,
                playbook_version_at_end INTEGER,
                closed_at INTEGER,
                UNIQUE (cohort_id, cycle_number)
            );
            CREATE INDEX IF NOT EXISTS idx_cycles_cohort_status
            ON trading_cycles (cohort_id, status);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create trading_cycles table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_pairs (
                id TEXT PRIMARY KEY,
                cohort_id TEXT,
                cycle_id TEXT,
                symbol TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT,
                quantity TEXT NOT NULL,
                pnl_usd TEXT,
                pnl_pct REAL,
                status TEXT NOT NULL,
                regime TEXT,
                fear_greed INTEGER,
                created_at INTEGER NOT NULL,
                closed_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_trade_pairs_symbol_status
            ON trade_pairs (symbol, status, created_at);
            CREATE INDEX IF NOT EXISTS idx_trade_pairs_cycle
            ON trade_pairs (cycle_id);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create trade_pairs table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signal_components (
                trade_id TEXT PRIMARY KEY,
                cycle_id TEXT,
                cohort_id TEXT,
                fear_greed_signal REAL,
                rsi_signal REAL,
                macd_signal REAL,
                trend_signal REAL,
                volume_signal REAL,
                whale_signal REAL,
                sentiment_signal REAL,
                macro_signal REAL,
                ai_direction_signal REAL,
                ai_confidence REAL,
                ai_risk_level TEXT,
                playbook_alignment_score REAL,
                weights_applied TEXT,
                math_composite_score REAL,
                ai_composite_score REAL,
                final_score REAL,
                has_divergence INTEGER NOT NULL DEFAULT 0,
                divergence_type TEXT,
                divergence_strength REAL,
                was_correct INTEGER,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_signal_components_cohort
            ON signal_components (cohort_id, created_at);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create signal_components table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signal_weights (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cohort_id TEXT,
                regime TEXT,
                weights TEXT NOT NULL,
                alpha_values TEXT NOT NULL,
                confidence REAL NOT NULL,
                sample_size INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_signal_weights_key
            ON signal_weights (cohort_id, regime, is_active);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create signal_weights table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS calculation_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id TEXT,
                cohort_id TEXT,
                trade_id TEXT,
                kelly_fraction REAL,
                half_kelly REAL,
                optimal_position_size REAL,
                current_sharpe REAL,
                current_sortino REAL,
                current_calmar REAL,
                volatility_daily REAL,
                volatility_weekly REAL,
                current_drawdown REAL,
                max_drawdown REAL,
                var_95 REAL,
                var_99 REAL,
                cvar_95 REAL,
                cvar_99 REAL,
                portfolio_value REAL,
                cash_position REAL,
                exposure_pct REAL,
                btc_price REAL,
                fear_greed INTEGER,
                current_regime TEXT,
                win_rate REAL,
                profit_factor REAL,
                avg_win REAL,
                avg_loss REAL,
                consecutive_wins INTEGER,
                consecutive_losses INTEGER,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_calc_snapshots_cohort
            ON calculation_snapshots (cohort_id, timestamp);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create calculation_snapshots table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS position_sizing_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                cycle_id TEXT,
                recommended_size REAL NOT NULL,
                max_position REAL NOT NULL,
                risk_adjusted_size REAL NOT NULL,
                kelly_size REAL NOT NULL,
                sizing_method TEXT NOT NULL,
                risk_budget_used REAL NOT NULL,
                confidence_multiplier REAL NOT NULL,
                expected_max_loss REAL NOT NULL,
                cvar_used REAL NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create position_sizing_log table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS regime_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                regime TEXT NOT NULL,
                regime_probability REAL NOT NULL,
                transition_probability REAL NOT NULL,
                return_7d REAL NOT NULL,
                volatility_7d REAL NOT NULL,
                volume_trend REAL NOT NULL,
                fear_greed_avg REAL NOT NULL,
                model_confidence REAL NOT NULL,
                previous_regime TEXT,
                regime_duration_hours INTEGER NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_regime_history_time
            ON regime_history (timestamp);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create regime_history table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS market_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                price REAL NOT NULL,
                btc_price REAL,
                volume_24h REAL,
                fear_greed INTEGER,
                rsi REAL,
                macd_line REAL,
                macd_signal REAL,
                macd_histogram REAL,
                prev_macd_histogram REAL,
                sma_20 REAL,
                sma_50 REAL,
                sma_200 REAL,
                volume REAL,
                avg_volume REAL,
                price_change_24h REAL,
                whale_buys_usd REAL,
                whale_sells_usd REAL,
                social_score REAL,
                news_sentiment REAL,
                etf_flow_7d REAL,
                fed_sentiment TEXT,
                high_impact_events INTEGER,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_market_snapshots_symbol_time
            ON market_snapshots (symbol, timestamp);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create market_snapshots table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS coin_discoveries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                ai_approved INTEGER NOT NULL DEFAULT 0,
                was_added INTEGER NOT NULL DEFAULT 0,
                was_deactivated INTEGER NOT NULL DEFAULT 0,
                discovered_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create coin_discoveries table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watchlist (
                symbol TEXT PRIMARY KEY,
                total_trades INTEGER NOT NULL DEFAULT 0,
                added_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create watchlist table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS portfolio_tiers (
                tier_name TEXT PRIMARY KEY,
                target_pct REAL NOT NULL,
                current_pct REAL,
                current_value_usd REAL,
                is_active INTEGER NOT NULL DEFAULT 1
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create portfolio_tiers table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS playbook_versions (
                version INTEGER PRIMARY KEY,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create playbook_versions table")?;

        sqlx::query(
            r#"
            CREATE VIEW IF NOT EXISTS v_cohort_comparison AS
            SELECT
                c.name AS cohort_name,
                tc.cycle_number,
                tc.total_pnl_pct,
                tc.sharpe_ratio,
                tc.trades_count,
                CASE WHEN tc.trades_count > 0
                     THEN CAST(tc.winning_trades AS REAL) / tc.trades_count
                END AS win_rate
            FROM trading_cycles tc
            JOIN cohorts c ON tc.cohort_id = c.id
            WHERE tc.status = 'completed';
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create cohort comparison view")?;

        info!("Database schema initialized.");
        Ok(())
    }
}
