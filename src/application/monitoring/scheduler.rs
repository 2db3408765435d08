//! Periodic scheduler for the monitoring tasks and the weekly learning
//! batch.
//!
//! Each task runs on its own tokio interval behind a per-task lock, so a
//! slow run can never stack a second copy of itself. Task failures are
//! logged and the schedule keeps going.

use crate::application::analysis::bayesian::BayesianWeightLearner;
use crate::application::analysis::regime::RegimeDetector;
use crate::application::monitoring::tasks::MonitoringTasks;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

pub struct MonitoringScheduler {
    tasks: Arc<MonitoringTasks>,
    learner: Arc<BayesianWeightLearner>,
    regime_detector: Arc<RegimeDetector>,
}

impl MonitoringScheduler {
    pub fn new(
        tasks: Arc<MonitoringTasks>,
        learner: Arc<BayesianWeightLearner>,
        regime_detector: Arc<RegimeDetector>,
    ) -> Self {
        Self {
            tasks,
            learner,
            regime_detector,
        }
    }

    /// Spawn every periodic task. Handles are returned so the caller can
    /// abort them at shutdown.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let t = self.tasks.clone();
        handles.push(spawn_periodic("reconcile_orders", 30 * MINUTE, move || {
            let t = t.clone();
            async move { t.reconcile_orders().await }
        }));

        let t = self.tasks.clone();
        handles.push(spawn_periodic("order_timeout_check", HOUR, move || {
            let t = t.clone();
            async move { t.order_timeout_check().await }
        }));

        let t = self.tasks.clone();
        handles.push(spawn_periodic(
            "portfolio_plausibility",
            2 * HOUR,
            move || {
                let t = t.clone();
                async move { t.portfolio_plausibility().await }
            },
        ));

        let t = self.tasks.clone();
        handles.push(spawn_periodic("grid_health_summary", 4 * HOUR, move || {
            let t = t.clone();
            async move { t.grid_health_summary().await }
        }));

        let t = self.tasks.clone();
        handles.push(spawn_periodic("stale_detection", 30 * MINUTE, move || {
            let t = t.clone();
            async move { t.stale_detection().await }
        }));

        let t = self.tasks.clone();
        handles.push(spawn_periodic("tier_health_check", 2 * HOUR, move || {
            let t = t.clone();
            async move { t.tier_health_check().await }
        }));

        let t = self.tasks.clone();
        handles.push(spawn_periodic(
            "discovery_health_check",
            12 * HOUR,
            move || {
                let t = t.clone();
                async move { t.discovery_health_check().await }
            },
        ));

        let learner = self.learner.clone();
        let detector = self.regime_detector.clone();
        handles.push(spawn_periodic("weekly_learning", 7 * 24 * HOUR, move || {
            let learner = learner.clone();
            let detector = detector.clone();
            async move {
                let report = learner.weekly_update().await;
                info!(
                    "Weekly learning: {} weight updates, {} errors",
                    report.updates.len(),
                    report.errors.len()
                );
                detector.maybe_retrain().await
            }
        }));

        info!("MonitoringScheduler: {} periodic tasks running", handles.len());
        handles
    }
}

/// Run `task` every `period_secs`, skipping a firing when the previous run
/// still holds the task lock.
fn spawn_periodic<F, Fut>(name: &'static str, period_secs: u64, task: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let lock = Arc::new(Mutex::new(()));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(period_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so tasks start one full
        // period after boot.
        interval.tick().await;

        loop {
            interval.tick().await;
            match lock.try_lock() {
                Ok(_guard) => {
                    if let Err(e) = task().await {
                        error!("MonitoringScheduler: task {} failed: {}", name, e);
                    }
                }
                Err(_) => {
                    debug!("MonitoringScheduler: task {} still running, skipped", name);
                }
            }
        }
    })
}
