//! Headless supervisor entry point.
//!
//! Wires the shared venue client, the analysis services and the persistence
//! layer into one cohort orchestrator plus the monitoring scheduler, then
//! runs until a shutdown signal or an unrecoverable supervisor fault.
//!
//! Exit codes: 0 clean shutdown, 1 configuration validation failure,
//! 2 unrecoverable supervisor error.

use anyhow::Result;
use gridcohort::application::analysis::bayesian::BayesianWeightLearner;
use gridcohort::application::analysis::regime::RegimeDetector;
use gridcohort::application::analysis::signals::SignalAnalyzer;
use gridcohort::application::monitoring::scheduler::MonitoringScheduler;
use gridcohort::application::monitoring::tasks::MonitoringTasks;
use gridcohort::application::risk::cvar_sizing::{CVarPositionSizer, CorrelationMatrix};
use gridcohort::application::trading::cohort_manager::CohortManager;
use gridcohort::application::trading::cohort_orchestrator::CohortOrchestrator;
use gridcohort::application::trading::cycle_manager::CycleManager;
use gridcohort::application::trading::hybrid_orchestrator::HybridServices;
use gridcohort::config::Config;
use gridcohort::domain::ports::{AiProvider, MarketFeed, Notifier, VenueClient};
use gridcohort::domain::repositories::{
    CohortRepository, CycleRepository, MonitoringRepository, RegimeRepository, SignalRepository,
    SnapshotRepository, TradeRepository, WeightsRepository,
};
use gridcohort::infrastructure::binance::BinanceVenueClient;
use gridcohort::infrastructure::deepseek::DeepSeekProvider;
use gridcohort::infrastructure::mock::MockAiProvider;
use gridcohort::infrastructure::paper::PaperVenueClient;
use gridcohort::infrastructure::persistence::database::Database;
use gridcohort::infrastructure::persistence::repositories::{
    cohort_repository::SqliteCohortRepository, cycle_repository::SqliteCycleRepository,
    monitoring_repository::SqliteMonitoringRepository, regime_repository::SqliteRegimeRepository,
    signal_repository::SqliteSignalRepository, snapshot_repository::SqliteSnapshotRepository,
    trade_repository::SqliteTradeRepository, weights_repository::SqliteWeightsRepository,
};
use gridcohort::infrastructure::snapshot_feed::SnapshotFeed;
use gridcohort::infrastructure::state_files::StateFileStore;
use gridcohort::infrastructure::telegram::TelegramNotifier;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::prelude::*;

const EXIT_CONFIG: i32 = 1;
const EXIT_SUPERVISOR: i32 = 2;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("gridcohort {} starting...", env!("CARGO_PKG_VERSION"));

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };
    if let Err(e) = config.hybrid.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(EXIT_CONFIG);
    }

    match run(config).await {
        Ok(()) => {
            info!("Clean shutdown.");
        }
        Err(e) => {
            error!("Unrecoverable supervisor error: {}", e);
            std::process::exit(EXIT_SUPERVISOR);
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let db = Database::new(&config.database_url).await?;

    // Repositories.
    let cohort_repo: Arc<dyn CohortRepository> =
        Arc::new(SqliteCohortRepository::new(db.pool.clone()));
    let cycle_repo: Arc<dyn CycleRepository> =
        Arc::new(SqliteCycleRepository::new(db.pool.clone()));
    let weights_repo: Arc<dyn WeightsRepository> =
        Arc::new(SqliteWeightsRepository::new(db.pool.clone()));
    let signal_repo: Arc<dyn SignalRepository> =
        Arc::new(SqliteSignalRepository::new(db.pool.clone()));
    let trade_repo: Arc<dyn TradeRepository> =
        Arc::new(SqliteTradeRepository::new(db.pool.clone()));
    let regime_repo: Arc<dyn RegimeRepository> =
        Arc::new(SqliteRegimeRepository::new(db.pool.clone()));
    let snapshot_repo: Arc<dyn SnapshotRepository> =
        Arc::new(SqliteSnapshotRepository::new(db.pool.clone()));
    let monitoring_repo: Arc<dyn MonitoringRepository> =
        Arc::new(SqliteMonitoringRepository::new(db.pool.clone()));

    // Venue: live/testnet client, wrapped by the paper simulator when
    // PAPER_TRADING is on (market data still flows from the real venue).
    let binance: Arc<dyn VenueClient> = Arc::new(BinanceVenueClient::new(
        config.binance_api_key.clone(),
        config.binance_api_secret.clone(),
        config.binance_testnet,
        &config.api,
    ));
    let venue: Arc<dyn VenueClient> = if config.paper_trading {
        info!("PAPER_TRADING enabled, orders are simulated");
        Arc::new(PaperVenueClient::new(
            config.paper_initial_usdt,
            Some(binance.clone()),
        ))
    } else {
        binance
    };

    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(
        config.telegram_bot_token.clone(),
        config.telegram_chat_id.clone(),
        config.api.timeout_default_secs,
    ));

    let ai: Arc<dyn AiProvider> = match &config.deepseek_api_key {
        Some(key) => Arc::new(DeepSeekProvider::new(key.clone(), config.api.timeout_ai_secs)),
        None => {
            info!("DEEPSEEK_API_KEY not set, AI assessments default to neutral");
            Arc::new(MockAiProvider::neutral())
        }
    };

    let feed: Arc<dyn MarketFeed> = Arc::new(SnapshotFeed::new(snapshot_repo.clone()));
    let state_store = Arc::new(StateFileStore::new(
        config.state_dir.clone(),
        config.heartbeat_path.clone(),
    ));

    // Analysis services, instantiated once and injected everywhere.
    let analyzer = Arc::new(SignalAnalyzer::new());
    let learner = Arc::new(BayesianWeightLearner::new(
        weights_repo.clone(),
        signal_repo.clone(),
        cohort_repo.clone(),
    ));
    learner.restore().await;

    let regime_detector = Arc::new(RegimeDetector::new(feed.clone(), regime_repo.clone()));
    regime_detector.fit().await?;

    let sizer = Arc::new(CVarPositionSizer::new(
        venue.clone(),
        trade_repo.clone(),
        CorrelationMatrix::crypto_defaults(),
    ));

    let cohort_manager = Arc::new(CohortManager::new(Some(cohort_repo.clone())));
    cohort_manager.load().await?;

    let cycle_manager = Arc::new(CycleManager::new(
        cycle_repo.clone(),
        trade_repo.clone(),
        snapshot_repo.clone(),
        signal_repo.clone(),
    ));
    cycle_manager.restore().await?;

    let services = HybridServices {
        venue: venue.clone(),
        feed,
        ai,
        notifier: notifier.clone(),
        regime_detector: regime_detector.clone(),
        analyzer,
        learner: learner.clone(),
        sizer,
        cycle_manager,
        cohort_manager,
        trade_repo: trade_repo.clone(),
        signal_repo,
        state_store: state_store.clone(),
    };

    let mut orchestrator = CohortOrchestrator::new(services, config.daily_summary_hour);
    if !orchestrator.initialize().await? {
        anyhow::bail!("no cohort could be initialized");
    }
    orchestrator.initial_allocation().await;

    // Monitoring runs orthogonally on its own timers.
    let monitoring = MonitoringScheduler::new(
        Arc::new(MonitoringTasks::new(
            state_store,
            venue,
            notifier,
            monitoring_repo,
            trade_repo,
            config.portfolio_manager,
        )),
        learner,
        regime_detector,
    );
    let monitor_handles = monitoring.spawn();

    let result = orchestrator.run().await;

    for handle in monitor_handles {
        handle.abort();
    }

    result
}
