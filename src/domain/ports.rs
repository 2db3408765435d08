use crate::domain::regime::RegimeFeatures;
use crate::domain::signals::{AiAssessment, MarketFeatures};
use crate::domain::types::{Kline, OpenOrder, OrderSide};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Execution venue shared by all cohorts. Implementations must be safe for
/// concurrent fan-in from many orchestrators and enforce their own rate
/// limits.
#[async_trait]
pub trait VenueClient: Send + Sync {
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>>;

    /// Place a limit order. Returns the venue-assigned order id.
    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<String>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()>;

    async fn get_account_balance(&self, asset: &str) -> Result<Decimal>;

    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>>;
}

/// Outbound alert channel. Implementations suppress duplicate text within a
/// minute; `force` bypasses any quiet-hours filtering, not the dedup.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str, force: bool) -> Result<()>;
}

/// External AI classification provider (direction / confidence / risk).
/// Implementations enforce their own call and cost budgets.
#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn classify(&self, features: &MarketFeatures) -> Result<AiAssessment>;
}

/// Source of pre-computed market features. Indicator computation from raw
/// ticks happens outside this core; this port only hands the freshest bundle
/// to the decision loop.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Freshest feature bundle for one symbol.
    async fn features(&self, symbol: &str) -> Result<Option<MarketFeatures>>;

    /// Market-wide regime features (BTC-anchored).
    async fn regime_features(&self) -> Result<Option<RegimeFeatures>>;

    /// Historical regime feature points for model training, oldest first.
    async fn regime_feature_history(&self, days: i64) -> Result<Vec<RegimeFeatures>>;
}
