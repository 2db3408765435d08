//! Market feed backed by the `market_snapshots` table.
//!
//! Indicators are computed by an external collector and written as
//! snapshots; this feed only serves the freshest bundle to the decision
//! loop.

use crate::domain::ports::MarketFeed;
use crate::domain::regime::RegimeFeatures;
use crate::domain::repositories::SnapshotRepository;
use crate::domain::signals::MarketFeatures;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub struct SnapshotFeed {
    repo: Arc<dyn SnapshotRepository>,
}

impl SnapshotFeed {
    pub fn new(repo: Arc<dyn SnapshotRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl MarketFeed for SnapshotFeed {
    async fn features(&self, symbol: &str) -> Result<Option<MarketFeatures>> {
        self.repo.latest_features(symbol).await
    }

    async fn regime_features(&self) -> Result<Option<RegimeFeatures>> {
        self.repo.regime_window().await
    }

    async fn regime_feature_history(&self, days: i64) -> Result<Vec<RegimeFeatures>> {
        self.repo.feature_history(days).await
    }
}
